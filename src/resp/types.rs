use bytes::Bytes;

/// A RESP protocol value.
///
/// `Null` is the explicit nil sentinel (`$-1\r\n` / `*-1\r\n`), distinct
/// from an empty bulk string or empty array.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// +OK\r\n
    SimpleString(String),
    /// -ERR message\r\n
    Error(String),
    /// :1000\r\n
    Integer(i64),
    /// $6\r\nfoobar\r\n
    BulkString(Bytes),
    /// *2\r\n…
    Array(Vec<RespValue>),
    /// $-1\r\n or *-1\r\n
    Null,
}

impl RespValue {
    /// Interpret this value as a UTF-8 string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::SimpleString(s) => Some(s),
            Self::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Interpret this value as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::BulkString(b) => Some(b),
            Self::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Interpret this value as i64.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Interpret this value as an array (consumes self).
    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// The error message, if this is an error reply.
    pub fn as_error_msg(&self) -> Option<&str> {
        match self {
            Self::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Short type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SimpleString(_) => "simple_string",
            Self::Error(_) => "error",
            Self::Integer(_) => "integer",
            Self::BulkString(_) => "bulk_string",
            Self::Array(_) => "array",
            Self::Null => "null",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_accessors() {
        assert_eq!(RespValue::SimpleString("OK".into()).as_str(), Some("OK"));
        assert_eq!(
            RespValue::BulkString(Bytes::from_static(b"hello")).as_str(),
            Some("hello")
        );
        assert_eq!(
            RespValue::BulkString(Bytes::from_static(&[0xff, 0xfe])).as_str(),
            None
        );
        assert_eq!(RespValue::Integer(42).as_str(), None);
        assert_eq!(RespValue::Null.as_str(), None);
    }

    #[test]
    fn byte_accessors() {
        assert_eq!(
            RespValue::BulkString(Bytes::from_static(&[1, 2, 3])).as_bytes(),
            Some(&[1u8, 2, 3][..])
        );
        assert_eq!(
            RespValue::SimpleString("OK".into()).as_bytes(),
            Some(b"OK".as_ref())
        );
        assert_eq!(RespValue::Null.as_bytes(), None);
    }

    #[test]
    fn int_accessor() {
        assert_eq!(RespValue::Integer(-7).as_int(), Some(-7));
        assert_eq!(RespValue::SimpleString("7".into()).as_int(), None);
    }

    #[test]
    fn array_accessor() {
        let v = RespValue::Array(vec![RespValue::Integer(1)]);
        assert_eq!(v.into_array().unwrap().len(), 1);
        assert!(RespValue::Null.into_array().is_none());
    }

    #[test]
    fn null_and_error_predicates() {
        assert!(RespValue::Null.is_null());
        assert!(!RespValue::BulkString(Bytes::new()).is_null());
        assert!(RespValue::Error("ERR x".into()).is_error());
        assert_eq!(RespValue::Error("ERR x".into()).as_error_msg(), Some("ERR x"));
        assert!(!RespValue::SimpleString("ERR".into()).is_error());
        assert_eq!(RespValue::Integer(0).as_error_msg(), None);
    }

    #[test]
    fn type_names() {
        assert_eq!(RespValue::SimpleString("".into()).type_name(), "simple_string");
        assert_eq!(RespValue::Error("".into()).type_name(), "error");
        assert_eq!(RespValue::Integer(0).type_name(), "integer");
        assert_eq!(RespValue::BulkString(Bytes::new()).type_name(), "bulk_string");
        assert_eq!(RespValue::Array(vec![]).type_name(), "array");
        assert_eq!(RespValue::Null.type_name(), "null");
    }
}
