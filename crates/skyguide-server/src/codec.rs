//! Line framing for the client socket.
//!
//! Inbound frames end at `\n`; a trailing `\r` is stripped so both CRLF and
//! bare LF clients work. Outbound frames always end in CRLF.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

/// Default longest accepted inbound line, excluding the terminator.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One complete line, terminator removed. Never blank.
    Line(Bytes),
    /// A line exceeded the limit and was thrown away.
    Oversized,
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_len: usize,
    /// Bytes already scanned for a newline.
    next_index: usize,
    /// Dropping the tail of an oversized line.
    discarding: bool,
}

impl FrameCodec {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            if self.discarding {
                match buf.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        buf.advance(pos + 1);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        buf.clear();
                        return Ok(None);
                    }
                }
            }

            let newline = buf[self.next_index..].iter().position(|b| *b == b'\n');
            match newline {
                Some(offset) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let mut line = buf.split_to(end + 1);
                    line.truncate(end);
                    if line.last() == Some(&b'\r') {
                        line.truncate(line.len() - 1);
                    }
                    if line.len() > self.max_len {
                        return Ok(Some(Frame::Oversized));
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Ok(Some(Frame::Line(line.freeze())));
                }
                // +1 leaves room for a '\r' that may still be followed by '\n'
                None if buf.len() > self.max_len + 1 => {
                    buf.clear();
                    self.next_index = 0;
                    self.discarding = true;
                    return Ok(Some(Frame::Oversized));
                }
                None => {
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        // An unterminated trailing line is never processed.
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                buf.clear();
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(item.len() + 2);
        dst.put(item);
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Serialize a message body for the writer. The codec adds the terminator.
pub fn encode_json<T: Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(value).map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut FrameCodec, input: &[u8]) -> Vec<Frame> {
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    fn line(s: &str) -> Frame {
        Frame::Line(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn splits_on_lf_and_crlf() {
        let mut codec = FrameCodec::default();
        let frames = decode_all(&mut codec, b"{\"a\":1}\r\n{\"b\":2}\n");
        assert_eq!(frames, vec![line("{\"a\":1}"), line("{\"b\":2}")]);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut codec = FrameCodec::default();
        let frames = decode_all(&mut codec, b"\r\n\n  \nx\n");
        assert_eq!(frames, vec![line("x")]);
    }

    #[test]
    fn partial_line_waits_for_more() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"{\"method\":"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"\"x\"}\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(line("{\"method\":\"x\"}"))
        );
    }

    #[test]
    fn oversized_complete_line_is_reported_once() {
        let mut codec = FrameCodec::new(8);
        let frames = decode_all(&mut codec, b"0123456789\nok\n");
        assert_eq!(frames, vec![Frame::Oversized, line("ok")]);
    }

    #[test]
    fn line_at_limit_is_accepted_with_crlf() {
        let mut codec = FrameCodec::new(4);
        let frames = decode_all(&mut codec, b"abcd\r\n");
        assert_eq!(frames, vec![line("abcd")]);
    }

    #[test]
    fn oversized_streaming_line_discards_until_newline() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::from(&b"abcdefgh"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Oversized));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"more junk");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"tail\nnext\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(line("next")));
    }

    #[test]
    fn eof_drops_unterminated_tail() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"done\npartial"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(line("done")));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn encoder_appends_crlf() {
        let mut codec = FrameCodec::default();
        let mut dst = BytesMut::new();
        codec.encode(Bytes::from_static(b"{}"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"{}\r\n");
    }
}
