//! Newline-delimited record codec for the host protocol streams.
//!
//! Inbound bytes are split on `\n` into raw records (a trailing `\r` is
//! dropped, blank lines are skipped). Records longer than the configured
//! ceiling are discarded up to their terminating newline and surfaced as a
//! single [`Frame::Oversized`] so the host can answer with one protocol error
//! and keep reading.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::PluginError;
use crate::protocol::Outbound;

/// One decoded unit of the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Record(Bytes),
    Oversized,
}

#[derive(Debug, Clone)]
pub struct RecordCodec {
    max_length: usize,
    /// Offset already scanned for a newline in the pending fragment.
    next_index: usize,
    discarding: bool,
}

impl RecordCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            next_index: 0,
            discarding: false,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

/// Length of `line` without its optional trailing `\r`.
fn content_len(line: &[u8]) -> usize {
    line.len() - usize::from(line.last() == Some(&b'\r'))
}

fn finish_record(mut line: BytesMut) -> Option<Frame> {
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(Frame::Record(line.freeze()))
}

impl Decoder for RecordCodec {
    type Item = Frame;
    type Error = PluginError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, PluginError> {
        loop {
            // Room for `max_length` content bytes plus `\r\n`.
            let window = self.max_length.saturating_add(2);
            let read_to = window.min(buf.len());
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                    return Ok(Some(Frame::Oversized));
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let mut line = buf.split_to(end + 1);
                    line.truncate(end);
                    if content_len(&line) > self.max_length {
                        return Ok(Some(Frame::Oversized));
                    }
                    if let Some(frame) = finish_record(line) {
                        return Ok(Some(frame));
                    }
                }
                (false, None) if buf.len() >= window => {
                    self.discarding = true;
                    self.next_index = 0;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, PluginError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            buf.clear();
            return Ok(Some(Frame::Oversized));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        // An unterminated trailing fragment is still treated as a record.
        let line = buf.split_to(buf.len());
        if content_len(&line) > self.max_length {
            return Ok(Some(Frame::Oversized));
        }
        Ok(finish_record(line))
    }
}

impl Encoder<Outbound> for RecordCodec {
    type Error = PluginError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), PluginError> {
        serde_json::to_writer(dst.writer(), &item)?;
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Response;
    use serde_json::json;

    fn record(s: &str) -> Frame {
        Frame::Record(Bytes::copy_from_slice(s.as_bytes()))
    }

    fn decode_all(codec: &mut RecordCodec, buf: &mut BytesMut) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_multiple_records_in_one_read() {
        let mut codec = RecordCodec::new(1024);
        let mut buf = BytesMut::from("{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec![record("{\"a\":1}"), record("{\"b\":2}")]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_record_buffered_across_reads() {
        let mut codec = RecordCodec::new(1024);
        let mut buf = BytesMut::from("{\"id\":");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"1}\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(record("{\"id\":1}")));
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let mut codec = RecordCodec::new(1024);
        let mut buf = BytesMut::from("\n  \r\n{}\n");
        assert_eq!(decode_all(&mut codec, &mut buf), vec![record("{}")]);
    }

    #[test]
    fn test_record_at_limit_is_accepted() {
        let mut codec = RecordCodec::new(4);
        let mut buf = BytesMut::from("abcd\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(record("abcd")));
    }

    #[test]
    fn test_line_ending_does_not_change_limit() {
        let mut codec = RecordCodec::new(4);
        let mut buf = BytesMut::from("abcd\r\nabcd\nabcde\nabcde\r\nok\n");
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec![
                record("abcd"),
                record("abcd"),
                Frame::Oversized,
                Frame::Oversized,
                record("ok"),
            ]
        );
    }

    #[test]
    fn test_crlf_record_at_limit_split_across_reads() {
        let mut codec = RecordCodec::new(4);
        let mut buf = BytesMut::from("abcd\r");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(record("abcd")));
    }

    #[test]
    fn test_eof_fragment_over_limit_is_oversized() {
        let mut codec = RecordCodec::new(4);
        let mut buf = BytesMut::from("abcde");
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(Frame::Oversized));
        let mut buf = BytesMut::from("abcd\r");
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(record("abcd")));
    }

    #[test]
    fn test_oversized_record_discarded_once() {
        let mut codec = RecordCodec::new(4);
        let mut buf = BytesMut::from("abcdefgh\nok\n");
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec![Frame::Oversized, record("ok")]
        );
    }

    #[test]
    fn test_oversized_record_split_across_reads() {
        let mut codec = RecordCodec::new(4);
        let mut buf = BytesMut::from("abcdefg");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"hijk");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"lm\nnext\n");
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec![Frame::Oversized, record("next")]
        );
    }

    #[test]
    fn test_eof_flushes_trailing_fragment() {
        let mut codec = RecordCodec::new(1024);
        let mut buf = BytesMut::from("{\"id\":\"x\"}");
        assert_eq!(
            codec.decode_eof(&mut buf).unwrap(),
            Some(record("{\"id\":\"x\"}"))
        );
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_eof_while_discarding_reports_oversized() {
        let mut codec = RecordCodec::new(2);
        let mut buf = BytesMut::from("toolong");
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(Frame::Oversized));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = RecordCodec::new(1024);
        let mut dst = BytesMut::new();
        codec
            .encode(Outbound::Response(Response::success(json!(7), json!(null))), &mut dst)
            .unwrap();
        assert_eq!(dst.last(), Some(&b'\n'));
        let value: serde_json::Value = serde_json::from_slice(&dst[..dst.len() - 1]).unwrap();
        assert_eq!(value, json!({"id": 7, "success": true, "result": null}));
    }
}
