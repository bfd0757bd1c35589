//! Protocol module - wire format, framing, and frame types.
//!
//! Implements the length-prefixed tagged framing protocol shared by server
//! and client:
//! - frame header encoding and size bounds
//! - incremental frame extraction with partial-read reassembly
//! - the owned [`Frame`] type handed to handlers

mod frame;
mod wire;

pub use frame::{try_parse, Frame, Parse};
pub use wire::{header_len, package_message, LEN_FIELD_SIZE, MAX_FRAME_SIZE, MAX_TAG_LEN};

/// Well-known tags observed in this system.
pub mod tags {
    /// Handshake; payload is an opaque UTF-8 string, the server echoes a
    /// greeting under the same tag.
    pub const HELLO: &str = "Hello";

    /// Compile-and-run request. Payload layout: `<filename>\0<file bytes>`.
    /// The success response reuses this tag with payload
    /// `<filename>\0<combined output>`.
    pub const COMPILE_EXECUTE: &str = "compile-execute";

    /// Server-to-client error report; payload is a UTF-8 description.
    pub const ERROR_INFORMATION: &str = "error-information";
}
