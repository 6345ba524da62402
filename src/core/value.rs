//! Decoded reply values surfaced to command continuations

use bytes::Bytes;

/// A decoded server reply.
///
/// Payloads are opaque byte sequences; the client imposes no string
/// encoding. RESP3 booleans decode to `Int(0)` / `Int(1)`, and maps, sets,
/// attributes and push frames flatten into `Array` in wire order —
/// consumers pair elements as needed.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Status, bulk, big-number and verbatim payloads
    Bytes(Bytes),
    /// Signed integer (RESP3 booleans map to 0/1)
    Int(i64),
    /// Double-precision float
    Double(f64),
    /// Null reply or missing key
    Nil,
    /// Ordered sequence of nested replies
    Array(Vec<Reply>),
}

impl Reply {
    /// Byte payload of a string-like reply, if this is one.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Integer value; byte payloads that parse as decimal integers are
    /// accepted too.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bytes(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }

    /// Nested elements of an aggregate reply.
    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Whether this is the null reply.
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }
}

impl From<&'static str> for Reply {
    fn from(s: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<i64> for Reply {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}
