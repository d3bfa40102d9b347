//! Fixed-width ASCII decimal headers.
//!
//! Every numeric header on the wire is a decimal number written left-aligned
//! into a fixed-width field. Unused bytes are padding: spaces when we write,
//! spaces or NUL bytes accepted when we read.

use crate::error::ProtocolError;
use bytes::BufMut;

/// Width of request length, command size and data size headers.
pub const LENGTH_HEADER_LEN: usize = 10;

/// Width of the acknowledgment id header.
pub const ACK_ID_HEADER_LEN: usize = 20;

/// Width of the legacy discard buffer between non-pipelined requests.
pub const DISCARD_LEN: usize = 20;

/// Width of the fragment message id header.
pub const MESSAGE_ID_HEADER_LEN: usize = 20;

/// Largest request a client may declare.
pub const MAX_REQUEST_LEN: usize = 256 * 1024 * 1024;

/// Acknowledgment id meaning "nothing acknowledged".
pub const NO_ACK: i64 = -1;

fn is_padding(b: u8) -> bool {
    b == b' ' || b == 0
}

/// Parse a padded decimal field into a signed integer.
pub fn parse_decimal(field: &'static str, raw: &[u8]) -> Result<i64, ProtocolError> {
    let malformed = || ProtocolError::MalformedHeader {
        field,
        value: String::from_utf8_lossy(raw).into_owned(),
    };

    let start = raw.iter().position(|&b| !is_padding(b)).ok_or_else(malformed)?;
    let end = raw.iter().rposition(|&b| !is_padding(b)).map_or(start, |i| i + 1);
    let digits = std::str::from_utf8(&raw[start..end]).map_err(|_| malformed())?;

    let unsigned = digits.strip_prefix('-').unwrap_or(digits);
    if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    digits.parse::<i64>().map_err(|_| malformed())
}

/// Parse a byte-count header, rejecting negative and oversized values.
pub fn parse_length(field: &'static str, raw: &[u8], max: usize) -> Result<usize, ProtocolError> {
    let value = parse_decimal(field, raw)?;
    if value < 0 {
        return Err(ProtocolError::NegativeLength { field, value });
    }
    let declared = usize::try_from(value).map_err(|_| ProtocolError::LengthTooLarge {
        declared: usize::MAX,
        max,
    })?;
    if declared > max {
        return Err(ProtocolError::LengthTooLarge { declared, max });
    }
    Ok(declared)
}

/// Parse an acknowledgment id header. `-1` is the "none" marker.
pub fn parse_ack_id(raw: &[u8]) -> Result<i64, ProtocolError> {
    let value = parse_decimal("acknowledgment id", raw)?;
    if value < NO_ACK {
        return Err(ProtocolError::NegativeLength {
            field: "acknowledgment id",
            value,
        });
    }
    Ok(value)
}

/// Append `value` as a left-aligned, space-padded field of `width` bytes.
pub fn put_decimal(buf: &mut impl BufMut, value: i64, width: usize) {
    let digits = value.to_string();
    debug_assert!(digits.len() <= width, "{value} does not fit in {width} bytes");
    buf.put_slice(digits.as_bytes());
    buf.put_bytes(b' ', width.saturating_sub(digits.len()));
}

/// Append a 10-byte length header.
pub fn put_length(buf: &mut impl BufMut, len: usize) {
    put_decimal(buf, len as i64, LENGTH_HEADER_LEN);
}

/// Append a 20-byte acknowledgment id header.
pub fn put_ack_id(buf: &mut impl BufMut, ack_id: i64) {
    put_decimal(buf, ack_id, ACK_ID_HEADER_LEN);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_parse_padded_values() {
        assert_eq!(parse_decimal("length", b"42        "), Ok(42));
        assert_eq!(parse_decimal("length", b"42\0\0\0\0\0\0\0\0"), Ok(42));
        assert_eq!(parse_decimal("length", b"0000000007"), Ok(7));
        assert_eq!(parse_decimal("length", b"   12     "), Ok(12));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_decimal("length", b"          "),
            Err(ProtocolError::MalformedHeader { .. })
        ));
        assert!(matches!(
            parse_decimal("length", b"12ab      "),
            Err(ProtocolError::MalformedHeader { .. })
        ));
        assert!(matches!(
            parse_decimal("length", b"1 2       "),
            Err(ProtocolError::MalformedHeader { .. })
        ));
        assert!(matches!(
            parse_decimal("length", b"-         "),
            Err(ProtocolError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn test_parse_length_bounds() {
        assert_eq!(parse_length("length", b"100       ", 1000), Ok(100));
        assert_eq!(
            parse_length("length", b"-5        ", 1000),
            Err(ProtocolError::NegativeLength {
                field: "length",
                value: -5
            })
        );
        assert_eq!(
            parse_length("length", b"1001      ", 1000),
            Err(ProtocolError::LengthTooLarge {
                declared: 1001,
                max: 1000
            })
        );
    }

    #[test]
    fn test_parse_ack_id() {
        assert_eq!(parse_ack_id(b"-1                  "), Ok(NO_ACK));
        assert_eq!(parse_ack_id(b"9223372036854775807 "), Ok(i64::MAX));
        assert!(parse_ack_id(b"-2                  ").is_err());
        assert!(parse_ack_id(b"99999999999999999999").is_err());
    }

    #[test]
    fn test_put_decimal_width() {
        let mut buf = BytesMut::new();
        put_length(&mut buf, 30);
        put_ack_id(&mut buf, -1);
        assert_eq!(&buf[..LENGTH_HEADER_LEN], b"30        ");
        assert_eq!(&buf[LENGTH_HEADER_LEN..], b"-1                  ");
        assert_eq!(
            parse_length("length", &buf[..LENGTH_HEADER_LEN], MAX_REQUEST_LEN),
            Ok(30)
        );
    }
}
