//! Wire format encoding and bounds.
//!
//! One frame on the wire:
//!
//! ```text
//! ┌─────────┬──────────────┬─────────────┬───────────────┐
//! │ tag_len │     tag      │ payload_len │    payload    │
//! │ 1 byte  │ tag_len bytes│ 4 bytes     │ payload_len B │
//! │ u8      │ UTF-8        │ u32 BE      │ opaque        │
//! └─────────┴──────────────┴─────────────┴───────────────┘
//! ```
//!
//! A frame is completely defined by its header; the reader never needs to
//! look past the advertised length. `payload_len` is Big Endian on every
//! platform, and the format is byte-exact and version-less.

use crate::error::{ForgewireError, Result};

/// Maximum tag length in bytes (the length field is one byte).
pub const MAX_TAG_LEN: usize = 255;

/// Size of the payload length field.
pub const LEN_FIELD_SIZE: usize = 4;

/// Maximum advertised payload size (64 MiB). Anything larger is a protocol
/// violation that terminates the connection.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Header length for a tag of `tag_len` bytes.
#[inline]
pub fn header_len(tag_len: usize) -> usize {
    1 + tag_len + LEN_FIELD_SIZE
}

/// Frame a `(tag, payload)` pair into an owned byte sequence ready to send.
///
/// Enforces the tag and payload bounds; both sides of the protocol build
/// their outbound frames through this helper.
///
/// # Example
///
/// ```
/// use forgewire::protocol::package_message;
///
/// let framed = package_message("Hello", b"hi").unwrap();
/// assert_eq!(framed[0], 5); // tag_len
/// assert_eq!(&framed[1..6], b"Hello");
/// assert_eq!(&framed[6..10], &[0, 0, 0, 2]); // payload_len, big endian
/// assert_eq!(&framed[10..], b"hi");
/// ```
pub fn package_message(tag: &str, payload: &[u8]) -> Result<Vec<u8>> {
    if tag.is_empty() {
        return Err(ForgewireError::Protocol("empty frame tag".to_string()));
    }
    if tag.len() > MAX_TAG_LEN {
        return Err(ForgewireError::Protocol(format!(
            "tag length {} exceeds maximum {}",
            tag.len(),
            MAX_TAG_LEN
        )));
    }
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ForgewireError::Protocol(format!(
            "payload size {} exceeds maximum {}",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut out = Vec::with_capacity(header_len(tag.len()) + payload.len());
    out.push(tag.len() as u8);
    out.extend_from_slice(tag.as_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{try_parse, Parse};
    use crate::Buffer;

    #[test]
    fn test_package_parse_roundtrip() {
        let framed = package_message("compile-execute", b"hi.cpp\0int main(){}").unwrap();

        let mut buf = Buffer::new();
        buf.append(&framed);
        match try_parse(&mut buf) {
            Parse::Frame(frame) => {
                assert_eq!(frame.tag(), "compile-execute");
                assert_eq!(frame.payload(), b"hi.cpp\0int main(){}");
            }
            other => panic!("expected frame, got {other:?}"),
        }
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_payload_len_is_big_endian() {
        let payload = vec![0u8; 0x0102_0304];
        let framed = package_message("BIG", &payload).unwrap();
        let tag_len = framed[0] as usize;
        assert_eq!(tag_len, 3);
        let off = 1 + tag_len;
        assert_eq!(&framed[off..off + 4], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_empty_tag_rejected() {
        let err = package_message("", b"x").unwrap_err();
        assert!(err.to_string().contains("empty frame tag"));
    }

    #[test]
    fn test_tag_too_long_rejected() {
        let tag = "t".repeat(MAX_TAG_LEN + 1);
        let err = package_message(&tag, b"").unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_tag_at_limit_accepted() {
        let tag = "t".repeat(MAX_TAG_LEN);
        let framed = package_message(&tag, b"").unwrap();
        assert_eq!(framed[0] as usize, MAX_TAG_LEN);
        assert_eq!(framed.len(), header_len(MAX_TAG_LEN));
    }

    #[test]
    fn test_oversize_payload_rejected() {
        // A zeroed 64 MiB + 1 allocation is cheap (lazily mapped pages).
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        let err = package_message("x", &payload).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_empty_payload_frames() {
        let framed = package_message("ping", b"").unwrap();
        assert_eq!(framed.len(), header_len(4));
        assert_eq!(&framed[6..10], &[0, 0, 0, 0]);
    }
}
