//! `Content-Length` framing for LSP messages
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <payload>
//! ```

use crate::types::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Upper bound on the header section; anything longer is not an LSP peer.
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Largest body accepted from a peer
const MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

/// Most buffer space reserved per decode call while a body is incomplete
const RESERVE_CHUNK: usize = 64 * 1024;

/// Frames JSON-RPC payloads with LSP base-protocol headers.
#[derive(Debug, Default)]
pub struct LspCodec {
    /// Body length of the frame whose header has already been consumed
    content_length: Option<usize>,
}

impl LspCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

fn parse_content_length(header: &[u8]) -> Result<usize, TransportError> {
    let header = std::str::from_utf8(header)
        .map_err(|_| TransportError::InvalidHeader("header is not valid UTF-8".to_string()))?;

    let mut content_length = None;
    for line in header.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            return Err(TransportError::InvalidHeader(line.to_string()));
        };

        // Content-Type and friends are accepted and ignored
        if key.trim().eq_ignore_ascii_case("Content-Length") {
            let length = value
                .trim()
                .parse()
                .map_err(|_| TransportError::InvalidHeader(line.to_string()))?;
            content_length = Some(length);
        }
    }

    content_length.ok_or(TransportError::MissingContentLength)
}

impl Decoder for LspCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let length = match self.content_length {
            Some(length) => length,
            None => {
                let Some(end) = find_header_end(src) else {
                    if src.len() > MAX_HEADER_BYTES {
                        return Err(TransportError::InvalidHeader(
                            "header section exceeds 8 KiB".to_string(),
                        ));
                    }
                    return Ok(None);
                };

                let length = parse_content_length(&src[..end])?;
                if length > MAX_CONTENT_LENGTH {
                    return Err(TransportError::InvalidHeader(format!(
                        "Content-Length {} exceeds {} bytes",
                        length, MAX_CONTENT_LENGTH
                    )));
                }
                src.advance(end + HEADER_TERMINATOR.len());
                self.content_length = Some(length);
                length
            }
        };

        if src.len() < length {
            src.reserve((length - src.len()).min(RESERVE_CHUNK));
            return Ok(None);
        }

        self.content_length = None;
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<String> for LspCodec {
    type Error = TransportError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = format!("Content-Length: {}\r\n\r\n", item.len());
        dst.reserve(header.len() + item.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Result<Vec<Bytes>, TransportError> {
        let mut codec = LspCodec::new();
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    #[test]
    fn test_encode_prefixes_content_length() {
        let mut codec = LspCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("test payload".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"Content-Length: 12\r\n\r\ntest payload");
    }

    #[test]
    fn test_decode_single_frame() {
        let frames = decode_all(b"Content-Length: 5\r\n\r\nhello").unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"hello")]);
    }

    #[test]
    fn test_decode_ignores_other_headers() {
        let frames = decode_all(
            b"Content-Length: 4\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\ntest",
        )
        .unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"test")]);
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let frames = decode_all(b"Content-Length: 2\r\n\r\n{}Content-Length: 4\r\n\r\nnull").unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[1][..], b"null");
    }

    #[test]
    fn test_decode_waits_for_partial_body() {
        let mut codec = LspCodec::new();
        let mut buf = BytesMut::from(&b"Content-Length: 10\r\n\r\nhello"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"world");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"helloworld");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_waits_for_partial_header() {
        let mut codec = LspCodec::new();
        let mut buf = BytesMut::from(&b"Content-Len"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_missing_content_length() {
        let result = decode_all(b"Content-Type: application/json\r\n\r\ntest");
        assert!(matches!(result, Err(TransportError::MissingContentLength)));
    }

    #[test]
    fn test_decode_invalid_content_length() {
        let result = decode_all(b"Content-Length: invalid\r\n\r\ntest");
        assert!(matches!(result, Err(TransportError::InvalidHeader(_))));
    }

    #[test]
    fn test_decode_rejects_oversized_header() {
        let junk = vec![b'x'; MAX_HEADER_BYTES + 1];
        let result = decode_all(&junk);
        assert!(matches!(result, Err(TransportError::InvalidHeader(_))));
    }

    #[test]
    fn test_decode_rejects_huge_content_length() {
        let result = decode_all(b"Content-Length: 1000000000000000000\r\n\r\n{}");
        assert!(matches!(result, Err(TransportError::InvalidHeader(_))));

        let just_over = format!("Content-Length: {}\r\n\r\n{{}}", MAX_CONTENT_LENGTH + 1);
        let result = decode_all(just_over.as_bytes());
        assert!(matches!(result, Err(TransportError::InvalidHeader(_))));
    }

    #[test]
    fn test_partial_body_reserves_bounded_space() {
        let mut codec = LspCodec::new();
        let header = format!("Content-Length: {}\r\n\r\n", MAX_CONTENT_LENGTH);
        let mut buf = BytesMut::from(header.as_bytes());

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.capacity() < 4 * RESERVE_CHUNK);
    }
}
