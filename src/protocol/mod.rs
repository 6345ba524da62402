//! RESP2/RESP3 wire protocol: command encoding and incremental reply
//! decoding.
//!
//! The decoder works on a cursor over the connection's read buffer and
//! returns `Ok(None)` when the buffer does not yet hold a complete reply,
//! so the caller can keep accumulating bytes. Both RESP2 and RESP3 type
//! bytes are understood; no protocol negotiation happens here (a `HELLO`
//! exchange, if any, is the caller's business).

use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::error::{RedisError, RedisResult};
use crate::core::value::Reply;

const CRLF: &[u8] = b"\r\n";

/// First elements that mark a frame as subscription traffic.
const SUBSCRIPTION_KINDS: &[&[u8]] = &[
    b"subscribe",
    b"psubscribe",
    b"ssubscribe",
    b"unsubscribe",
    b"punsubscribe",
    b"sunsubscribe",
    b"message",
    b"pmessage",
    b"smessage",
];

/// First elements that mark a frame as an unsubscribe confirmation.
const UNSUBSCRIBE_KINDS: &[&[u8]] = &[b"unsubscribe", b"punsubscribe", b"sunsubscribe"];

/// A parsed reply tree, one variant per RESP type byte.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    /// Simple string: `+OK\r\n`
    Status(Bytes),
    /// Error: `-ERR message\r\n`
    Error(Bytes),
    /// Integer: `:1000\r\n`
    Integer(i64),
    /// Bulk string: `$6\r\nfoobar\r\n`
    Bulk(Bytes),
    /// Null: `$-1\r\n`, `*-1\r\n` or RESP3 `_\r\n`
    Null,
    /// RESP3 boolean: `#t\r\n` / `#f\r\n`
    Boolean(bool),
    /// RESP3 double: `,1.23\r\n`
    Double(f64),
    /// RESP3 big number: `(3492890328409238509324850943850943825\r\n`
    BigNumber(Bytes),
    /// RESP3 bulk error: `!21\r\nSYNTAX invalid syntax\r\n`
    BulkError(Bytes),
    /// RESP3 verbatim string, with the `txt:`/`mkd:` prefix stripped
    Verbatim(Bytes),
    /// Array: `*2\r\n...`
    Array(Vec<RespFrame>),
    /// RESP3 map, flattened to `2n` elements in wire order
    Map(Vec<RespFrame>),
    /// RESP3 set, in wire order
    Set(Vec<RespFrame>),
    /// RESP3 attribute, flattened to `2n` elements in wire order
    Attribute(Vec<RespFrame>),
    /// RESP3 out-of-band push frame
    Push(Vec<RespFrame>),
}

impl From<RespFrame> for Reply {
    fn from(frame: RespFrame) -> Self {
        match frame {
            RespFrame::Status(b)
            | RespFrame::Error(b)
            | RespFrame::Bulk(b)
            | RespFrame::BigNumber(b)
            | RespFrame::BulkError(b)
            | RespFrame::Verbatim(b) => Self::Bytes(b),
            RespFrame::Integer(i) => Self::Int(i),
            RespFrame::Double(d) => Self::Double(d),
            RespFrame::Boolean(v) => Self::Int(i64::from(v)),
            RespFrame::Null => Self::Nil,
            RespFrame::Array(items)
            | RespFrame::Map(items)
            | RespFrame::Set(items)
            | RespFrame::Attribute(items)
            | RespFrame::Push(items) => Self::Array(items.into_iter().map(Into::into).collect()),
        }
    }
}

/// First element of an array or push frame, if it is string-like.
fn first_element(frame: &RespFrame) -> Option<&Bytes> {
    let items = match frame {
        RespFrame::Array(items) | RespFrame::Push(items) => items,
        _ => return None,
    };
    match items.first() {
        Some(RespFrame::Bulk(b) | RespFrame::Status(b)) => Some(b),
        _ => None,
    }
}

/// Whether a frame carries subscription traffic (confirmations, messages,
/// unsubscribe markers). Matching is case-insensitive on the first element.
pub(crate) fn is_subscription_frame(frame: &RespFrame) -> bool {
    first_element(frame).is_some_and(|kind| {
        SUBSCRIPTION_KINDS.iter().any(|k| kind.eq_ignore_ascii_case(k))
    })
}

/// Whether a frame is an unsubscribe marker: a 3-element array or push
/// whose first element is `unsubscribe`, `punsubscribe` or `sunsubscribe`.
pub(crate) fn is_unsubscribe_marker(frame: &RespFrame) -> bool {
    let len = match frame {
        RespFrame::Array(items) | RespFrame::Push(items) => items.len(),
        _ => return false,
    };
    len == 3
        && first_element(frame).is_some_and(|kind| {
            UNSUBSCRIBE_KINDS.iter().any(|k| kind.eq_ignore_ascii_case(k))
        })
}

/// Encode a command as a RESP multi-bulk into `buf`. `args[0]` is the
/// command name; every element is written as a bulk string.
pub fn encode_command(args: &[Bytes], buf: &mut BytesMut) {
    buf.put_u8(b'*');
    buf.put_slice(args.len().to_string().as_bytes());
    buf.put_slice(CRLF);
    for arg in args {
        buf.put_u8(b'$');
        buf.put_slice(arg.len().to_string().as_bytes());
        buf.put_slice(CRLF);
        buf.put_slice(arg);
        buf.put_slice(CRLF);
    }
}

/// Decodes RESP frames from a byte cursor
pub struct RespDecoder;

impl RespDecoder {
    /// Decode one complete frame, or return `Ok(None)` if the buffer is
    /// short. The cursor position is only meaningful on `Ok(Some(_))`.
    pub fn decode(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespFrame>> {
        if !buf.has_remaining() {
            return Ok(None);
        }

        let type_byte = buf.chunk()[0];
        buf.advance(1);

        match type_byte {
            b'+' => Self::decode_line(buf, RespFrame::Status),
            b'-' => Self::decode_line(buf, RespFrame::Error),
            b'(' => Self::decode_line(buf, RespFrame::BigNumber),
            b':' => Self::decode_integer(buf),
            b',' => Self::decode_double(buf),
            b'#' => Self::decode_boolean(buf),
            b'_' => Self::decode_null(buf),
            b'$' => Self::decode_blob(buf, false),
            b'!' => Self::decode_blob(buf, true),
            b'=' => Self::decode_verbatim(buf),
            b'*' => Self::decode_aggregate(buf, 1, true, RespFrame::Array),
            b'%' => Self::decode_aggregate(buf, 2, false, RespFrame::Map),
            b'~' => Self::decode_aggregate(buf, 1, false, RespFrame::Set),
            b'|' => Self::decode_aggregate(buf, 2, false, RespFrame::Attribute),
            b'>' => Self::decode_aggregate(buf, 1, false, RespFrame::Push),
            other => Err(RedisError::Protocol(format!(
                "invalid RESP type byte: {:?}",
                other as char
            ))),
        }
    }

    fn decode_line(
        buf: &mut Cursor<&[u8]>,
        wrap: fn(Bytes) -> RespFrame,
    ) -> RedisResult<Option<RespFrame>> {
        Ok(Self::read_line(buf)?.map(wrap))
    }

    fn decode_integer(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespFrame>> {
        let Some(line) = Self::read_line(buf)? else {
            return Ok(None);
        };
        let num = Self::parse_i64(&line)?;
        Ok(Some(RespFrame::Integer(num)))
    }

    fn decode_double(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespFrame>> {
        let Some(line) = Self::read_line(buf)? else {
            return Ok(None);
        };
        let text = std::str::from_utf8(&line)
            .map_err(|e| RedisError::Protocol(format!("invalid double: {e}")))?;
        let num = text
            .parse::<f64>()
            .map_err(|e| RedisError::Protocol(format!("invalid double: {e}")))?;
        Ok(Some(RespFrame::Double(num)))
    }

    fn decode_boolean(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespFrame>> {
        let Some(line) = Self::read_line(buf)? else {
            return Ok(None);
        };
        match line.as_ref() {
            b"t" => Ok(Some(RespFrame::Boolean(true))),
            b"f" => Ok(Some(RespFrame::Boolean(false))),
            other => Err(RedisError::Protocol(format!(
                "invalid boolean payload: {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    fn decode_null(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespFrame>> {
        let Some(line) = Self::read_line(buf)? else {
            return Ok(None);
        };
        if line.is_empty() {
            Ok(Some(RespFrame::Null))
        } else {
            Err(RedisError::Protocol("invalid null frame".to_string()))
        }
    }

    fn decode_blob(buf: &mut Cursor<&[u8]>, is_error: bool) -> RedisResult<Option<RespFrame>> {
        let Some(payload) = Self::read_blob(buf)? else {
            return Ok(None);
        };
        match payload {
            Some(data) if is_error => Ok(Some(RespFrame::BulkError(data))),
            Some(data) => Ok(Some(RespFrame::Bulk(data))),
            None => Ok(Some(RespFrame::Null)),
        }
    }

    fn decode_verbatim(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespFrame>> {
        let Some(payload) = Self::read_blob(buf)? else {
            return Ok(None);
        };
        let Some(data) = payload else {
            return Ok(Some(RespFrame::Null));
        };
        // Strip the "txt:"/"mkd:" format prefix when present.
        if data.len() >= 4 && data[3] == b':' {
            Ok(Some(RespFrame::Verbatim(data.slice(4..))))
        } else {
            Ok(Some(RespFrame::Verbatim(data)))
        }
    }

    fn decode_aggregate(
        buf: &mut Cursor<&[u8]>,
        multiplier: usize,
        nullable: bool,
        wrap: fn(Vec<RespFrame>) -> RespFrame,
    ) -> RedisResult<Option<RespFrame>> {
        let Some(line) = Self::read_line(buf)? else {
            return Ok(None);
        };
        let len = Self::parse_i64(&line)?;
        if len == -1 && nullable {
            return Ok(Some(RespFrame::Null));
        }
        if len < 0 {
            return Err(RedisError::Protocol(format!(
                "invalid aggregate length: {len}"
            )));
        }

        let count = len as usize * multiplier;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            match Self::decode(buf)? {
                Some(frame) => items.push(frame),
                None => return Ok(None),
            }
        }
        Ok(Some(wrap(items)))
    }

    /// Read a length-prefixed blob body: `Ok(None)` on short input,
    /// `Ok(Some(None))` for the RESP2 null (`-1`) length.
    fn read_blob(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Option<Bytes>>> {
        let Some(line) = Self::read_line(buf)? else {
            return Ok(None);
        };
        let len = Self::parse_i64(&line)?;
        if len == -1 {
            return Ok(Some(None));
        }
        if len < 0 {
            return Err(RedisError::Protocol(format!("invalid blob length: {len}")));
        }

        let len = len as usize;
        if buf.remaining() < len + 2 {
            return Ok(None);
        }
        let data = Bytes::copy_from_slice(&buf.chunk()[..len]);
        buf.advance(len + 2);
        Ok(Some(Some(data)))
    }

    fn read_line(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Bytes>> {
        let start = buf.position() as usize;
        let slice = buf.get_ref();

        for i in start..slice.len().saturating_sub(1) {
            if slice[i] == b'\r' && slice[i + 1] == b'\n' {
                let line = Bytes::copy_from_slice(&slice[start..i]);
                buf.set_position((i + 2) as u64);
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    fn parse_i64(line: &Bytes) -> RedisResult<i64> {
        std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| {
                RedisError::Protocol(format!(
                    "invalid integer: {:?}",
                    String::from_utf8_lossy(line)
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(data: &[u8]) -> RespFrame {
        let mut cursor = Cursor::new(data);
        RespDecoder::decode(&mut cursor).unwrap().unwrap()
    }

    #[test]
    fn encode_command_layout() {
        let mut buf = BytesMut::new();
        encode_command(
            &[Bytes::from_static(b"GET"), Bytes::from_static(b"mykey")],
            &mut buf,
        );
        assert_eq!(&buf[..], b"*2\r\n$3\r\nGET\r\n$5\r\nmykey\r\n");
    }

    #[test]
    fn decode_resp2_basics() {
        assert_eq!(
            decode_one(b"+OK\r\n"),
            RespFrame::Status(Bytes::from_static(b"OK"))
        );
        assert_eq!(
            decode_one(b"-ERR boom\r\n"),
            RespFrame::Error(Bytes::from_static(b"ERR boom"))
        );
        assert_eq!(decode_one(b":1000\r\n"), RespFrame::Integer(1000));
        assert_eq!(
            decode_one(b"$6\r\nfoobar\r\n"),
            RespFrame::Bulk(Bytes::from_static(b"foobar"))
        );
        assert_eq!(decode_one(b"$-1\r\n"), RespFrame::Null);
        assert_eq!(decode_one(b"*-1\r\n"), RespFrame::Null);
    }

    #[test]
    fn decode_nested_array() {
        let frame = decode_one(b"*2\r\n$3\r\nfoo\r\n*1\r\n:7\r\n");
        assert_eq!(
            frame,
            RespFrame::Array(vec![
                RespFrame::Bulk(Bytes::from_static(b"foo")),
                RespFrame::Array(vec![RespFrame::Integer(7)]),
            ])
        );
    }

    #[test]
    fn decode_resp3_scalars() {
        assert_eq!(decode_one(b"_\r\n"), RespFrame::Null);
        assert_eq!(decode_one(b"#t\r\n"), RespFrame::Boolean(true));
        assert_eq!(decode_one(b"#f\r\n"), RespFrame::Boolean(false));
        assert_eq!(decode_one(b",3.5\r\n"), RespFrame::Double(3.5));
        assert_eq!(
            decode_one(b"(3492890328409238509\r\n"),
            RespFrame::BigNumber(Bytes::from_static(b"3492890328409238509"))
        );
        assert_eq!(
            decode_one(b"!9\r\nERR boom!\r\n"),
            RespFrame::BulkError(Bytes::from_static(b"ERR boom!"))
        );
    }

    #[test]
    fn decode_verbatim_strips_format() {
        assert_eq!(
            decode_one(b"=15\r\ntxt:Some string\r\n"),
            RespFrame::Verbatim(Bytes::from_static(b"Some string"))
        );
    }

    #[test]
    fn decode_resp3_aggregates_keep_wire_order() {
        let map = decode_one(b"%2\r\n+first\r\n:1\r\n+second\r\n:2\r\n");
        assert_eq!(
            map,
            RespFrame::Map(vec![
                RespFrame::Status(Bytes::from_static(b"first")),
                RespFrame::Integer(1),
                RespFrame::Status(Bytes::from_static(b"second")),
                RespFrame::Integer(2),
            ])
        );

        let set = decode_one(b"~2\r\n+a\r\n+b\r\n");
        assert_eq!(
            set,
            RespFrame::Set(vec![
                RespFrame::Status(Bytes::from_static(b"a")),
                RespFrame::Status(Bytes::from_static(b"b")),
            ])
        );

        let push = decode_one(b">2\r\n+pubsub\r\n+hi\r\n");
        assert!(matches!(push, RespFrame::Push(ref items) if items.len() == 2));
    }

    #[test]
    fn incomplete_input_yields_none() {
        for partial in [
            &b"+OK\r"[..],
            &b"$6\r\nfoo"[..],
            &b"*2\r\n$3\r\nfoo\r\n"[..],
            &b"%1\r\n+k\r\n"[..],
        ] {
            let mut cursor = Cursor::new(partial);
            assert!(RespDecoder::decode(&mut cursor).unwrap().is_none());
        }
    }

    #[test]
    fn unknown_type_byte_is_a_protocol_error() {
        let mut cursor = Cursor::new(&b"@oops\r\n"[..]);
        assert!(RespDecoder::decode(&mut cursor).is_err());
    }

    #[test]
    fn frames_convert_to_replies() {
        let frame = decode_one(b"*3\r\n+subscribe\r\n$2\r\nc1\r\n:1\r\n");
        let reply = Reply::from(frame);
        let items = reply.as_array().unwrap();
        assert_eq!(items[0].as_bytes().unwrap().as_ref(), b"subscribe");
        assert_eq!(items[2].as_int(), Some(1));

        assert_eq!(Reply::from(RespFrame::Boolean(true)), Reply::Int(1));
        assert_eq!(Reply::from(RespFrame::Boolean(false)), Reply::Int(0));
    }

    #[test]
    fn subscription_frames_are_classified() {
        let confirm = decode_one(b"*3\r\n$9\r\nSUBSCRIBE\r\n$2\r\nc1\r\n:1\r\n");
        assert!(is_subscription_frame(&confirm));
        assert!(!is_unsubscribe_marker(&confirm));

        let marker = decode_one(b"*3\r\n$11\r\nunsubscribe\r\n$2\r\nc1\r\n:0\r\n");
        assert!(is_subscription_frame(&marker));
        assert!(is_unsubscribe_marker(&marker));

        let message = decode_one(b">3\r\n$7\r\nmessage\r\n$2\r\nc1\r\n$2\r\nhi\r\n");
        assert!(is_subscription_frame(&message));
        assert!(!is_unsubscribe_marker(&message));

        let plain = decode_one(b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
        assert!(!is_subscription_frame(&plain));
    }
}
