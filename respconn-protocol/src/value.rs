//! Reply values and outgoing commands.

use bytes::Bytes;
use serde_json::Value;

/// A decoded RESP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK` style status replies.
    SimpleString(Bytes),
    /// `-ERR ...` replies.
    Error(Bytes),
    /// `:42` replies.
    Integer(i64),
    /// `$n` bulk strings.
    BulkString(Bytes),
    /// `*n` arrays.
    Array(Vec<RespValue>),
    /// `$-1` and `*-1`.
    Null,
}

impl RespValue {
    /// Creates a simple string value.
    pub fn simple(s: &str) -> Self {
        RespValue::SimpleString(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Creates a bulk string value.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    /// Returns the payload of a simple or bulk string.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            RespValue::SimpleString(b) | RespValue::BulkString(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the payload of a simple or bulk string as UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Converts the reply into JSON for display. Binary payloads are rendered lossily.
    pub fn to_json(&self) -> Value {
        match self {
            RespValue::SimpleString(b) | RespValue::BulkString(b) => {
                Value::String(String::from_utf8_lossy(b).into_owned())
            }
            RespValue::Error(b) => {
                serde_json::json!({ "error": String::from_utf8_lossy(b) })
            }
            RespValue::Integer(n) => Value::from(*n),
            RespValue::Array(items) => Value::Array(items.iter().map(|v| v.to_json()).collect()),
            RespValue::Null => Value::Null,
        }
    }
}

/// A command to send, as a list of binary-safe arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Starts a command with the given name.
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Self {
            args: vec![Bytes::copy_from_slice(name.as_ref())],
        }
    }

    /// Builds a command from whitespace-free arguments, name first.
    pub fn from_args<I, A>(args: I) -> Option<Self>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        let args: Vec<Bytes> = args
            .into_iter()
            .map(|a| Bytes::copy_from_slice(a.as_ref()))
            .collect();
        if args.is_empty() {
            None
        } else {
            Some(Self { args })
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Returns the upper-cased command name.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_ascii_uppercase()
    }

    /// Returns the exact number of bytes this command occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        crate::codec::encoded_len(&self.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let cmd = Command::new("set").arg("key").arg(b"value");
        assert_eq!(cmd.args().len(), 3);
        assert_eq!(cmd.name(), "SET");
        assert_eq!(cmd.args()[2].as_ref(), b"value");
    }

    #[test]
    fn test_command_from_args() {
        assert!(Command::from_args(Vec::<&str>::new()).is_none());
        let cmd = Command::from_args(["GET", "k"]).unwrap();
        assert_eq!(cmd.name(), "GET");
        assert_eq!(cmd.args().len(), 2);
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(RespValue::simple("OK").as_str(), Some("OK"));
        assert_eq!(RespValue::bulk("x").as_str(), Some("x"));
        assert_eq!(RespValue::Integer(7).as_integer(), Some(7));
        assert!(RespValue::Error(Bytes::from_static(b"ERR")).is_error());
        assert!(RespValue::Null.is_null());
        assert!(RespValue::Integer(1).as_bytes().is_none());
    }

    #[test]
    fn test_value_to_json() {
        let value = RespValue::Array(vec![
            RespValue::bulk("a"),
            RespValue::Integer(2),
            RespValue::Null,
        ]);
        assert_eq!(value.to_json(), serde_json::json!(["a", 2, null]));

        let err = RespValue::Error(Bytes::from_static(b"ERR nope"));
        assert_eq!(err.to_json()["error"], "ERR nope");
    }
}
