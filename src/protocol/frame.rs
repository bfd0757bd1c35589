//! Frame type and incremental extraction from a read buffer.
//!
//! [`try_parse`] is the framing state machine shared by the server's
//! connection read path and the client's receiver thread. It is fed the
//! connection's input [`Buffer`] and extracts at most one complete frame per
//! call; callers loop until [`Parse::NeedMore`]. Partial headers and partial
//! payloads stay in the buffer untouched, so arbitrarily fragmented TCP
//! delivery reassembles into exactly the frames that were sent.

use bytes::Bytes;

use super::wire::{header_len, MAX_FRAME_SIZE};
use crate::buffer::Buffer;

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    tag: String,
    payload: Bytes,
}

impl Frame {
    pub fn new(tag: impl Into<String>, payload: Bytes) -> Self {
        Self {
            tag: tag.into(),
            payload,
        }
    }

    #[inline]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Payload view.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Cheap zero-copy clone of the payload.
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn into_parts(self) -> (String, Bytes) {
        (self.tag, self.payload)
    }
}

/// Outcome of one extraction attempt.
#[derive(Debug)]
pub enum Parse {
    /// The buffer does not yet hold a complete frame.
    NeedMore,
    /// One frame was extracted and consumed from the buffer.
    Frame(Frame),
    /// The byte stream is not a valid frame sequence. The connection must
    /// be terminated; the buffer contents are unusable.
    Violation(String),
}

/// Try to extract a single frame from the front of `buf`.
///
/// On success the frame's bytes (header and payload) are consumed. On
/// [`Parse::NeedMore`] nothing is consumed. On [`Parse::Violation`] the
/// caller is expected to drop the buffer and force-close the connection;
/// no handler must run for the offending frame.
pub fn try_parse(buf: &mut Buffer) -> Parse {
    if buf.readable_bytes() < 1 {
        return Parse::NeedMore;
    }

    let tag_len = buf.peek()[0] as usize;
    if tag_len == 0 {
        return Parse::Violation("zero-length tag".to_string());
    }

    let header = header_len(tag_len);
    if buf.readable_bytes() < header {
        return Parse::NeedMore;
    }

    let head = buf.peek();
    let len_off = 1 + tag_len;
    let payload_len = u32::from_be_bytes([
        head[len_off],
        head[len_off + 1],
        head[len_off + 2],
        head[len_off + 3],
    ]) as usize;
    if payload_len > MAX_FRAME_SIZE {
        return Parse::Violation(format!(
            "advertised payload length {payload_len} exceeds maximum {MAX_FRAME_SIZE}"
        ));
    }

    if buf.readable_bytes() < header + payload_len {
        return Parse::NeedMore;
    }

    let tag = match std::str::from_utf8(&head[1..1 + tag_len]) {
        Ok(tag) => tag.to_owned(),
        Err(_) => return Parse::Violation("tag is not valid UTF-8".to_string()),
    };
    let payload = Bytes::copy_from_slice(&buf.peek()[header..header + payload_len]);
    buf.retrieve(header + payload_len);

    Parse::Frame(Frame::new(tag, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::package_message;

    fn parse_all(buf: &mut Buffer) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            match try_parse(buf) {
                Parse::Frame(f) => frames.push(f),
                Parse::NeedMore => return frames,
                Parse::Violation(reason) => panic!("unexpected violation: {reason}"),
            }
        }
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buf = Buffer::new();
        buf.append(&package_message("Hello", b"Hello from client!").unwrap());

        let frames = parse_all(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].tag(), "Hello");
        assert_eq!(frames[0].payload(), b"Hello from client!");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut buf = Buffer::new();
        buf.append(&package_message("first", b"1").unwrap());
        buf.append(&package_message("second", b"22").unwrap());
        buf.append(&package_message("third", b"").unwrap());

        let frames = parse_all(&mut buf);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].tag(), "first");
        assert_eq!(frames[1].tag(), "second");
        assert_eq!(frames[2].tag(), "third");
        assert!(frames[2].payload().is_empty());
    }

    #[test]
    fn test_partial_header_waits() {
        let framed = package_message("Hello", b"payload").unwrap();
        let mut buf = Buffer::new();

        buf.append(&framed[..3]); // tag_len plus a slice of the tag
        assert!(matches!(try_parse(&mut buf), Parse::NeedMore));
        assert_eq!(buf.readable_bytes(), 3);

        buf.append(&framed[3..]);
        let frames = parse_all(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"payload");
    }

    #[test]
    fn test_partial_payload_waits() {
        let framed = package_message("tag", b"0123456789").unwrap();
        let mut buf = Buffer::new();

        let header = 1 + 3 + 4;
        buf.append(&framed[..header + 4]);
        assert!(matches!(try_parse(&mut buf), Parse::NeedMore));

        buf.append(&framed[header + 4..]);
        let frames = parse_all(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"0123456789");
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        // Any partition of a frame yields exactly one dispatch consuming
        // exactly the frame's length; one byte at a time is the worst case.
        let framed = package_message("split", b"reassembled").unwrap();
        let mut buf = Buffer::new();
        let mut frames = Vec::new();

        for byte in &framed {
            buf.append(std::slice::from_ref(byte));
            frames.extend(parse_all(&mut buf));
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].tag(), "split");
        assert_eq!(frames[0].payload(), b"reassembled");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_oversize_payload_is_violation() {
        // \x03BIG\xFF\xFF\xFF\xFF — claims a 4 GiB payload.
        let mut buf = Buffer::new();
        buf.append(&[0x03]);
        buf.append(b"BIG");
        buf.append(&[0xFF, 0xFF, 0xFF, 0xFF]);
        buf.append(&[0u8; 10]);

        match try_parse(&mut buf) {
            Parse::Violation(reason) => assert!(reason.contains("exceeds maximum")),
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn test_payload_just_over_limit_is_violation() {
        let mut buf = Buffer::new();
        buf.append(&[0x01, b'x']);
        buf.append(&((MAX_FRAME_SIZE as u32 + 1).to_be_bytes()));

        assert!(matches!(try_parse(&mut buf), Parse::Violation(_)));
    }

    #[test]
    fn test_zero_tag_len_is_violation() {
        let mut buf = Buffer::new();
        buf.append(&[0x00, 0xAA, 0xBB]);
        assert!(matches!(try_parse(&mut buf), Parse::Violation(_)));
    }

    #[test]
    fn test_non_utf8_tag_is_violation() {
        let mut buf = Buffer::new();
        buf.append(&[0x02, 0xC3, 0x28]); // invalid UTF-8 sequence
        buf.append(&[0, 0, 0, 0]);
        assert!(matches!(try_parse(&mut buf), Parse::Violation(_)));
    }

    #[test]
    fn test_empty_buffer_needs_more() {
        let mut buf = Buffer::new();
        assert!(matches!(try_parse(&mut buf), Parse::NeedMore));
    }
}
