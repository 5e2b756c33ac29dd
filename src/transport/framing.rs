//! Application messages inside a packet are framed as
//!
//! ```ascii
//! 0: payload length (u16)
//! 2: message type (i16)
//! 4: payload
//! ```
//!
//! repeated until the packet is exhausted. All numbers are in network byte order (BE).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::SessionError;

pub const FRAME_HEADER_LEN: usize = 4;
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

pub fn frame_len(payload_len: usize) -> usize {
    FRAME_HEADER_LEN + payload_len
}

pub fn write_frame(buf: &mut BytesMut, msg_type: i16, payload: &[u8]) -> Result<(), SessionError> {
    let len: u16 = payload.len().try_into()
        .map_err(|_| SessionError::MessageTooLarge(payload.len()))?;

    buf.reserve(frame_len(payload.len()));
    buf.put_u16(len);
    buf.put_i16(msg_type);
    buf.put_slice(payload);
    Ok(())
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Frame<'a> {
    pub msg_type: i16,
    pub payload: &'a [u8],
}

/// Iterates over the frames in a packet. Every step binds a fresh sub-slice of the remaining
///  bytes, so a consumer cannot affect the reader's position.
///
/// A frame that would run past the end of the buffer is a framing violation: it is returned as an
///  error, and iteration ends there. The rest of the buffer is never interpreted.
pub struct FrameReader<'a> {
    remaining: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> FrameReader<'a> {
        FrameReader {
            remaining: buf,
            offset: 0,
            failed: false,
        }
    }

    fn violation(&mut self, reason: &'static str) -> SessionError {
        self.failed = true;
        self.remaining = &[];
        SessionError::FramingViolation {
            offset: self.offset,
            reason,
        }
    }
}

impl<'a> Iterator for FrameReader<'a> {
    type Item = Result<Frame<'a>, SessionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining.is_empty() {
            return None;
        }

        if self.remaining.len() < FRAME_HEADER_LEN {
            return Some(Err(self.violation("truncated frame header")));
        }

        let mut header = &self.remaining[..FRAME_HEADER_LEN];
        let len = header.get_u16() as usize;
        let msg_type = header.get_i16();

        let body = &self.remaining[FRAME_HEADER_LEN..];
        if body.len() < len {
            return Some(Err(self.violation("frame payload runs past the end of the packet")));
        }

        let payload = &body[..len];
        self.remaining = &body[len..];
        self.offset += frame_len(len);

        Some(Ok(Frame {
            msg_type,
            payload,
        }))
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    fn frames(buf: &[u8]) -> (Vec<(i16, Vec<u8>)>, Option<SessionError>) {
        let mut result = Vec::new();
        for frame in FrameReader::new(buf) {
            match frame {
                Ok(f) => result.push((f.msg_type, f.payload.to_vec())),
                Err(e) => return (result, Some(e)),
            }
        }
        (result, None)
    }

    #[rstest]
    #[case::empty(1, b"")]
    #[case::simple(1002, b"76561197960287930")]
    #[case::negative_type(-5, b"x")]
    fn test_write_frame(#[case] msg_type: i16, #[case] payload: &[u8]) {
        let mut buf = BytesMut::new();
        write_frame(&mut buf, msg_type, payload).unwrap();

        assert_eq!(buf.len(), frame_len(payload.len()));
        assert_eq!(&buf[..2], &(payload.len() as u16).to_be_bytes());
        assert_eq!(&buf[2..4], &msg_type.to_be_bytes());
        assert_eq!(&buf[4..], payload);
    }

    #[test]
    fn test_write_frame_too_large() {
        let mut buf = BytesMut::new();
        assert!(write_frame(&mut buf, 1, &[0u8; MAX_FRAME_PAYLOAD]).is_ok());
        assert_eq!(write_frame(&mut buf, 1, &[0u8; MAX_FRAME_PAYLOAD + 1]), Err(SessionError::MessageTooLarge(MAX_FRAME_PAYLOAD + 1)));
    }

    #[test]
    fn test_several_messages_in_send_order() {
        let messages: Vec<(i16, Vec<u8>)> = vec![
            (100, b"first".to_vec()),
            (200, vec![]),
            (-3, vec![7u8; 1000]),
            (100, b"last".to_vec()),
        ];

        let mut buf = BytesMut::new();
        for (msg_type, payload) in &messages {
            write_frame(&mut buf, *msg_type, payload).unwrap();
        }

        let (decoded, error) = frames(&buf);
        assert_eq!(decoded, messages);
        assert!(error.is_none());
    }

    #[rstest]
    #[case::truncated_header(b"\0\x03\0\x01abc\0\x01", 1, 7)]
    #[case::truncated_payload(b"\0\x03\0\x01abc\0\x05\0\x01ab", 1, 7)]
    #[case::single_byte(b"\x01", 0, 0)]
    #[case::length_past_end(b"\xff\xff\0\x01abc", 0, 0)]
    fn test_framing_violation(#[case] buf: &[u8], #[case] num_valid: usize, #[case] offset: usize) {
        let (decoded, error) = frames(buf);
        assert_eq!(decoded.len(), num_valid);
        match error {
            Some(SessionError::FramingViolation { offset: actual, .. }) => assert_eq!(actual, offset),
            other => panic!("expected framing violation, was {:?}", other),
        }
    }

    #[test]
    fn test_truncation_yields_fewer_frames() {
        let mut buf = BytesMut::new();
        for i in 0..5 {
            write_frame(&mut buf, i, b"payload").unwrap();
        }
        let (all, _) = frames(&buf);

        for cut in 1..buf.len() {
            let (decoded, error) = frames(&buf[..cut]);
            assert!(decoded.len() < all.len());
            assert_eq!(decoded, all[..decoded.len()]);
            // a cut exactly at a frame boundary is a well-formed, shorter packet
            assert_eq!(error.is_none(), cut % frame_len(7) == 0);
        }
    }

    #[test]
    fn test_reader_stops_after_violation() {
        let mut reader = FrameReader::new(b"\0\x01\0\x01");
        assert!(matches!(reader.next(), Some(Err(SessionError::FramingViolation { .. }))));
        assert!(reader.next().is_none());
        assert!(reader.next().is_none());
    }
}
