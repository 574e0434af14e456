//! Command encoder and buffered reply decoder.

use crate::error::ProtocolError;
use crate::frame::{decode_one, scan_frames};
use crate::value::{Command, RespValue};
use bytes::{BufMut, Bytes, BytesMut};

/// Returns the exact encoded size of a command made of `args`.
pub fn encoded_len(args: &[Bytes]) -> usize {
    let header = 1 + digits(args.len()) + 2;
    args.iter()
        .map(|a| 1 + digits(a.len()) + 2 + a.len() + 2)
        .sum::<usize>()
        + header
}

/// Encodes `args` as a RESP array of bulk strings, appending to `out`.
pub fn encode_command(args: &[Bytes], out: &mut BytesMut) {
    out.reserve(encoded_len(args));
    out.put_u8(b'*');
    put_usize(out, args.len());
    out.put_slice(b"\r\n");
    for arg in args {
        out.put_u8(b'$');
        put_usize(out, arg.len());
        out.put_slice(b"\r\n");
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
}

/// Encodes commands into wire bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes a single command.
    pub fn encode_command(command: &Command) -> BytesMut {
        let mut buf = BytesMut::with_capacity(command.encoded_len());
        encode_command(command.args(), &mut buf);
        buf
    }

    /// Encodes several commands back to back, as a pipeline.
    pub fn encode_pipeline<'a>(commands: impl IntoIterator<Item = &'a Command>) -> BytesMut {
        let mut buf = BytesMut::new();
        for command in commands {
            encode_command(command.args(), &mut buf);
        }
        buf
    }
}

/// Incremental reply decoder over a growing buffer.
///
/// Used by tools and tests that read replies one at a time; the pipelined
/// connection path scans and slices frames itself.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next complete reply.
    pub fn decode_value(&mut self) -> Result<Option<RespValue>, ProtocolError> {
        let scan = scan_frames(&self.buffer, 1)?;
        if scan.count == 0 {
            return Ok(None);
        }
        let frame = self.buffer.split_to(scan.end).freeze();
        let (value, _) = decode_one(&frame, 0)?;
        Ok(Some(value))
    }

    /// Attempts to decode the next complete command (an array of bulk strings).
    pub fn decode_command(&mut self) -> Result<Option<Command>, ProtocolError> {
        let Some(value) = self.decode_value()? else {
            return Ok(None);
        };
        let items = value
            .into_array()
            .ok_or(ProtocolError::InvalidType(b'?'))?;
        let mut args = Vec::with_capacity(items.len());
        for item in items {
            match item {
                RespValue::BulkString(b) => args.push(b),
                _ => return Err(ProtocolError::InvalidType(b'?')),
            }
        }
        Command::from_args(args).map(Some).ok_or(ProtocolError::InvalidType(b'*'))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes a reply value, for servers and test fixtures.
pub fn encode_value(value: &RespValue, out: &mut BytesMut) {
    match value {
        RespValue::SimpleString(s) => {
            out.put_u8(b'+');
            out.put_slice(s);
            out.put_slice(b"\r\n");
        }
        RespValue::Error(s) => {
            out.put_u8(b'-');
            out.put_slice(s);
            out.put_slice(b"\r\n");
        }
        RespValue::Integer(n) => {
            out.put_u8(b':');
            out.put_slice(n.to_string().as_bytes());
            out.put_slice(b"\r\n");
        }
        RespValue::BulkString(b) => {
            out.put_u8(b'$');
            put_usize(out, b.len());
            out.put_slice(b"\r\n");
            out.put_slice(b);
            out.put_slice(b"\r\n");
        }
        RespValue::Array(items) => {
            out.put_u8(b'*');
            put_usize(out, items.len());
            out.put_slice(b"\r\n");
            for item in items {
                encode_value(item, out);
            }
        }
        RespValue::Null => out.put_slice(b"$-1\r\n"),
    }
}

fn digits(mut value: usize) -> usize {
    let mut n = 1;
    while value >= 10 {
        value /= 10;
        n += 1;
    }
    n
}

fn put_usize(out: &mut BytesMut, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    loop {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
        if value == 0 {
            break;
        }
    }
    buf[..len].reverse();
    out.put_slice(&buf[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        let cmd = Command::new("GET").arg("key");
        let encoded = Encoder::encode_command(&cmd);
        assert_eq!(&encoded[..], b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
        assert_eq!(encoded.len(), cmd.encoded_len());
    }

    #[test]
    fn test_encoded_len_matches_for_large_args() {
        let cmd = Command::new("SET").arg("k").arg(vec![b'x'; 12_345]);
        let encoded = Encoder::encode_command(&cmd);
        assert_eq!(encoded.len(), cmd.encoded_len());
    }

    #[test]
    fn test_encode_pipeline() {
        let cmds = [Command::new("PING"), Command::new("PING")];
        let encoded = Encoder::encode_pipeline(cmds.iter());
        assert_eq!(&encoded[..], b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn test_decoder_partial_value() {
        let mut decoder = Decoder::new();
        decoder.extend(b"$5\r\nhel");
        assert!(decoder.decode_value().unwrap().is_none());
        assert_eq!(decoder.buffered(), 7);

        decoder.extend(b"lo\r\n+OK\r\n");
        assert_eq!(decoder.decode_value().unwrap(), Some(RespValue::bulk("hello")));
        assert_eq!(decoder.decode_value().unwrap(), Some(RespValue::simple("OK")));
        assert!(decoder.decode_value().unwrap().is_none());
    }

    #[test]
    fn test_decoder_reads_commands() {
        let cmd = Command::new("SET").arg("a").arg("1");
        let mut decoder = Decoder::default();
        decoder.extend(&Encoder::encode_command(&cmd));
        assert_eq!(decoder.decode_command().unwrap(), Some(cmd));
    }

    #[test]
    fn test_decoder_rejects_non_array_command() {
        let mut decoder = Decoder::new();
        decoder.extend(b"+PING\r\n");
        assert!(decoder.decode_command().is_err());
    }

    #[test]
    fn test_encode_value_roundtrip() {
        let value = RespValue::Array(vec![
            RespValue::simple("OK"),
            RespValue::Integer(-3),
            RespValue::bulk("x"),
            RespValue::Null,
        ]);
        let mut buf = BytesMut::new();
        encode_value(&value, &mut buf);
        let mut decoder = Decoder::new();
        decoder.extend(&buf);
        assert_eq!(decoder.decode_value().unwrap(), Some(value));
    }

    #[test]
    fn test_decoder_clear() {
        let mut decoder = Decoder::new();
        decoder.extend(b"some data");
        assert_eq!(decoder.buffered(), 9);
        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_digits() {
        assert_eq!(digits(0), 1);
        assert_eq!(digits(9), 1);
        assert_eq!(digits(10), 2);
        assert_eq!(digits(50_000), 5);
    }
}
