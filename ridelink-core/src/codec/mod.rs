//! Line framing for the ridelink wire format.
//!
//! A frame is one UTF-8 text line terminated by `\n`. A trailing `\r` is
//! stripped on decode. Payloads are opaque to the codec apart from the
//! delimiter and the length limit.

use std::borrow::Cow;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::error::LinkError;

/// Upper bound for a single frame in bytes, delimiter excluded.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Characters shown by [`preview`] before a frame is elided.
const PREVIEW_CHARS: usize = 120;

/// Newline-delimited UTF-8 frame codec.
#[derive(Debug, Clone)]
pub struct LineCodec {
    inner: LinesCodec,
    max_len: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_LEN)
    }

    pub fn with_max_length(max_len: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_len),
            max_len,
        }
    }

    fn map_err(&self, e: LinesCodecError) -> LinkError {
        match e {
            LinesCodecError::MaxLineLengthExceeded => LinkError::FrameTooLong { max: self.max_len },
            LinesCodecError::Io(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                LinkError::InvalidUtf8
            }
            LinesCodecError::Io(e) => LinkError::Read(e),
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Check that `payload` can travel as exactly one frame.
pub fn validate_payload(payload: &str, max_len: usize) -> Result<(), LinkError> {
    if payload.contains(['\n', '\r']) {
        return Err(LinkError::EmbeddedDelimiter);
    }
    if payload.len() > max_len {
        return Err(LinkError::FrameTooLong { max: max_len });
    }
    Ok(())
}

/// Shorten a frame for log output.
pub fn preview(line: &str) -> Cow<'_, str> {
    match line.char_indices().nth(PREVIEW_CHARS) {
        None => Cow::Borrowed(line),
        Some((cut, _)) => Cow::Owned(format!("{}… ({} bytes)", &line[..cut], line.len())),
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.inner.decode(src).map_err(|e| self.map_err(e))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.inner.decode_eof(src).map_err(|e| self.map_err(e))
    }
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = LinkError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = item.as_ref();
        validate_payload(line, self.max_len)?;
        self.inner.encode(line, dst).map_err(|e| self.map_err(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    #[test]
    fn decodes_several_frames_from_one_buffer() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"ping\"}\nPLAY\r\npart"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{\"type\":\"ping\"}"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PLAY"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("part"));
    }

    #[test]
    fn encode_appends_delimiter() {
        let mut codec = LineCodec::new();
        let mut dst = BytesMut::new();
        codec.encode("NEXT", &mut dst).unwrap();
        assert_eq!(&dst[..], b"NEXT\n");
    }

    #[test]
    fn encode_rejects_embedded_delimiter() {
        let mut codec = LineCodec::new();
        let mut dst = BytesMut::new();
        assert!(matches!(
            codec.encode("a\nb", &mut dst),
            Err(LinkError::EmbeddedDelimiter)
        ));
        assert!(matches!(
            codec.encode("a\rb", &mut dst),
            Err(LinkError::EmbeddedDelimiter)
        ));
        assert!(dst.is_empty());
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let mut codec = LineCodec::with_max_length(8);
        let mut dst = BytesMut::new();
        assert!(matches!(
            codec.encode("0123456789", &mut dst),
            Err(LinkError::FrameTooLong { max: 8 })
        ));

        let mut src = BytesMut::from(&b"0123456789\n"[..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(LinkError::FrameTooLong { max: 8 })
        ));
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let mut codec = LineCodec::new();
        let mut src = BytesMut::from(&[0xff, 0xfe, b'\n'][..]);
        assert!(matches!(codec.decode(&mut src), Err(LinkError::InvalidUtf8)));
    }

    #[test]
    fn preview_elides_long_frames() {
        assert_eq!(preview("short"), "short");
        let long = "x".repeat(500);
        let p = preview(&long);
        assert!(p.len() < long.len());
        assert!(p.ends_with("(500 bytes)"));
    }

    #[tokio::test]
    async fn frames_split_across_reads_are_reassembled() {
        let io = tokio_test::io::Builder::new()
            .read(b"{\"type\":")
            .read(b"\"ping\"}\nPA")
            .read(b"USE\n")
            .build();
        let mut frames = FramedRead::new(io, LineCodec::new());

        assert_eq!(frames.next().await.unwrap().unwrap(), "{\"type\":\"ping\"}");
        assert_eq!(frames.next().await.unwrap().unwrap(), "PAUSE");
        assert!(frames.next().await.is_none());
    }
}
