//! Response encoding and fragmentation.
//!
//! ```text
//! response:  [commandSize:10] [dataSize:10] [token] [data]
//! fragment:  response with token FRAGMENT and data
//!            [messageId:20] [totalFragments:10] [fragmentNo:10] [chunk]
//! ```

use super::header::{
    parse_decimal, parse_length, put_decimal, put_length, LENGTH_HEADER_LEN,
    MESSAGE_ID_HEADER_LEN,
};
use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Status tokens.
pub mod token {
    pub const STORED: &str = "STORED";
    pub const NOT_STORED: &str = "NOT_STORED";
    pub const VALUE: &str = "VALUE";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const DELETED: &str = "DELETED";
    pub const OK: &str = "OK";
    pub const STATUS: &str = "STATUS";
    pub const PONG: &str = "PONG";
    pub const ERROR: &str = "ERROR";
    pub const BUSY: &str = "BUSY";
    pub const EVENTS: &str = "EVENTS";
    pub const FRAGMENT: &str = "FRAGMENT";
}

/// Fragment header: message id, total fragments, fragment number.
const FRAGMENT_HEADER_LEN: usize = MESSAGE_ID_HEADER_LEN + 2 * LENGTH_HEADER_LEN;

/// A response before serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub token: &'static str,
    pub data: Bytes,
}

impl Response {
    pub fn new(token: &'static str, data: impl Into<Bytes>) -> Self {
        Self {
            token,
            data: data.into(),
        }
    }

    /// Response carrying only a status token.
    pub fn status(token: &'static str) -> Self {
        Self::new(token, Bytes::new())
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        Self::new(token::ERROR, message.to_string())
    }

    /// Serialized size in bytes.
    pub fn encoded_len(&self) -> usize {
        2 * LENGTH_HEADER_LEN + self.token.len() + self.data.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        put_length(buf, self.token.len());
        put_length(buf, self.data.len());
        buf.put_slice(self.token.as_bytes());
        buf.put_slice(&self.data);
    }
}

/// Split a serialized response into `FRAGMENT` frames of at most
/// `fragment_size` chunk bytes each.
pub fn fragment(encoded: &Bytes, fragment_size: usize, message_id: i64) -> Vec<Bytes> {
    let fragment_size = fragment_size.max(1);
    let total = encoded.len().div_ceil(fragment_size);

    (0..total)
        .map(|no| {
            let start = no * fragment_size;
            let end = (start + fragment_size).min(encoded.len());

            let mut data = BytesMut::with_capacity(FRAGMENT_HEADER_LEN + end - start);
            put_decimal(&mut data, message_id, MESSAGE_ID_HEADER_LEN);
            put_length(&mut data, total);
            put_length(&mut data, no);
            data.put_slice(&encoded[start..end]);

            Response::new(token::FRAGMENT, data.freeze()).encode()
        })
        .collect()
}

/// A response frame read back off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedResponse {
    pub token: String,
    pub data: Bytes,
}

/// Decode one response frame from the front of `buf`, returning it with the
/// number of bytes consumed. `Ok(None)` when `buf` holds an incomplete frame.
pub fn decode_response(buf: &[u8]) -> Result<Option<(DecodedResponse, usize)>, ProtocolError> {
    if buf.len() < 2 * LENGTH_HEADER_LEN {
        return Ok(None);
    }
    let token_len = parse_length("command size", &buf[..LENGTH_HEADER_LEN], usize::MAX)?;
    let data_len = parse_length(
        "data size",
        &buf[LENGTH_HEADER_LEN..2 * LENGTH_HEADER_LEN],
        usize::MAX,
    )?;
    let total = 2 * LENGTH_HEADER_LEN + token_len + data_len;
    if buf.len() < total {
        return Ok(None);
    }

    let token_start = 2 * LENGTH_HEADER_LEN;
    let token = String::from_utf8_lossy(&buf[token_start..token_start + token_len]).into_owned();
    let data = Bytes::copy_from_slice(&buf[token_start + token_len..total]);
    Ok(Some((DecodedResponse { token, data }, total)))
}

/// Reassembles `FRAGMENT` responses into the original serialized response.
#[derive(Debug, Default)]
pub struct Reassembler {
    message_id: Option<i64>,
    chunks: Vec<Option<Bytes>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment's data. Returns the full response once every
    /// fragment of the message has arrived.
    pub fn push(&mut self, fragment_data: &[u8]) -> Result<Option<Bytes>, ProtocolError> {
        if fragment_data.len() < FRAGMENT_HEADER_LEN {
            return Err(ProtocolError::FrameOverrun {
                declared: FRAGMENT_HEADER_LEN,
                remaining: fragment_data.len(),
            });
        }
        let message_id = parse_decimal("message id", &fragment_data[..MESSAGE_ID_HEADER_LEN])?;
        let mut at = MESSAGE_ID_HEADER_LEN;
        let total = parse_length(
            "total fragments",
            &fragment_data[at..at + LENGTH_HEADER_LEN],
            usize::MAX,
        )?;
        at += LENGTH_HEADER_LEN;
        if total == 0 {
            return Err(ProtocolError::MalformedHeader {
                field: "total fragments",
                value: "0".into(),
            });
        }
        let no = parse_length(
            "fragment number",
            &fragment_data[at..at + LENGTH_HEADER_LEN],
            total.saturating_sub(1),
        )?;
        at += LENGTH_HEADER_LEN;

        if self.message_id != Some(message_id) {
            self.message_id = Some(message_id);
            self.chunks = vec![None; total];
        }
        self.chunks[no] = Some(Bytes::copy_from_slice(&fragment_data[at..]));

        if self.chunks.iter().any(Option::is_none) {
            return Ok(None);
        }
        let mut out = BytesMut::new();
        for chunk in self.chunks.drain(..).flatten() {
            out.put_slice(&chunk);
        }
        self.message_id = None;
        Ok(Some(out.freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_stored() {
        let bytes = Response::status(token::STORED).encode();
        assert_eq!(&bytes[..], b"6         0         STORED");

        let (decoded, used) = decode_response(&bytes).unwrap().unwrap();
        assert_eq!(decoded.token, "STORED");
        assert!(decoded.data.is_empty());
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn test_encode_with_data() {
        let resp = Response::new(token::VALUE, &b"hello"[..]);
        assert_eq!(resp.encoded_len(), 30);
        assert_eq!(&resp.encode()[..], b"5         5         VALUEhello");
    }

    #[test]
    fn test_decode_incomplete() {
        let bytes = Response::new(token::VALUE, &b"hello"[..]).encode();
        assert_eq!(decode_response(&bytes[..15]).unwrap(), None);
        assert_eq!(decode_response(&bytes[..bytes.len() - 1]).unwrap(), None);
    }

    #[test]
    fn test_fragment_reassembly() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let encoded = Response::new(token::VALUE, payload).encode();

        for fragment_size in [1000, 1024, 4096, encoded.len() - 1] {
            let frames = fragment(&encoded, fragment_size, 99);
            assert_eq!(frames.len(), encoded.len().div_ceil(fragment_size));

            let mut reassembler = Reassembler::new();
            let mut result = None;
            for frame in &frames {
                let (decoded, used) = decode_response(frame).unwrap().unwrap();
                assert_eq!(used, frame.len());
                assert_eq!(decoded.token, token::FRAGMENT);
                assert!(result.is_none());
                result = reassembler.push(&decoded.data).unwrap();
            }
            assert_eq!(result.as_ref(), Some(&encoded), "size {fragment_size}");
        }
    }

    #[test]
    fn test_fragment_header_layout() {
        let encoded = Bytes::from_static(b"abcdefghij");
        let frames = fragment(&encoded, 4, 5);
        assert_eq!(frames.len(), 3);

        let (last, _) = decode_response(&frames[2]).unwrap().unwrap();
        assert_eq!(&last.data[..20], b"5                   ");
        assert_eq!(&last.data[20..30], b"3         ");
        assert_eq!(&last.data[30..40], b"2         ");
        assert_eq!(&last.data[40..], b"ij");
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let encoded = Bytes::from_static(b"0123456789abcdef");
        let frames = fragment(&encoded, 5, 1);

        let mut reassembler = Reassembler::new();
        let mut result = None;
        for frame in frames.iter().rev() {
            let (decoded, _) = decode_response(frame).unwrap().unwrap();
            result = reassembler.push(&decoded.data).unwrap();
        }
        assert_eq!(result, Some(encoded));
    }
}
