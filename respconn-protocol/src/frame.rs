//! RESP frame scanning and single-frame decoding.
//!
//! Reply layout (RESP2):
//!
//! ```text
//! +<line>\r\n              simple string
//! -<line>\r\n              error
//! :<int>\r\n               integer
//! $<len>\r\n<data>\r\n     bulk string ($-1\r\n is null)
//! *<n>\r\n<n elements>     array (*-1\r\n is null)
//! ```
//!
//! Scanning only finds frame boundaries and never allocates. Decoding slices
//! bulk payloads out of the shared buffer without copying.

use crate::error::ProtocolError;
use crate::value::RespValue;
use crate::{MAX_ARRAY_LEN, MAX_BULK_LEN, MAX_NESTING};
use bytes::Bytes;
use std::collections::VecDeque;

/// Result of scanning a buffer for complete frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameScan {
    /// Number of complete frames found.
    pub count: usize,
    /// Offset just past the last complete frame.
    pub end: usize,
}

/// Counts up to `max` complete frames at the start of `buf`.
///
/// A trailing partial frame is not an error; it is simply not counted.
pub fn scan_frames(buf: &[u8], max: usize) -> Result<FrameScan, ProtocolError> {
    let mut scan = FrameScan::default();
    while scan.count < max && scan.end < buf.len() {
        match frame_end(buf, scan.end)? {
            Some(end) => {
                scan.count += 1;
                scan.end = end;
            }
            None => break,
        }
    }
    Ok(scan)
}

/// Counts every complete frame in `buf`.
pub fn count_complete_frames(buf: &[u8]) -> Result<FrameScan, ProtocolError> {
    scan_frames(buf, usize::MAX)
}

/// Returns the end offset of the frame starting at `start`, or `None` if it is incomplete.
fn frame_end(buf: &[u8], start: usize) -> Result<Option<usize>, ProtocolError> {
    let mut pos = start;
    // Elements still to be walked, including nested array members.
    let mut pending: usize = 1;

    while pending > 0 {
        match element_end(buf, pos)? {
            Some((next, children)) => {
                pos = next;
                pending = pending - 1 + children;
            }
            None => return Ok(None),
        }
    }

    Ok(Some(pos))
}

/// Walks one element header (and bulk payload) at `pos`.
///
/// Returns the offset past it and how many array members follow it, or
/// `None` if the element is not fully buffered yet.
fn element_end(buf: &[u8], pos: usize) -> Result<Option<(usize, usize)>, ProtocolError> {
    if pos >= buf.len() {
        return Ok(None);
    }
    let Some(line_end) = find_crlf(buf, pos + 1) else {
        return Ok(None);
    };
    let next = line_end + 2;

    match buf[pos] {
        b'+' | b'-' => Ok(Some((next, 0))),
        b':' => {
            parse_int(&buf[pos + 1..line_end])?;
            Ok(Some((next, 0)))
        }
        b'$' => {
            let len = parse_int(&buf[pos + 1..line_end])?;
            if len < 0 {
                return Ok(Some((next, 0)));
            }
            check_bulk_len(len)?;
            let data_end = next + len as usize;
            if buf.len() < data_end + 2 {
                return Ok(None);
            }
            if &buf[data_end..data_end + 2] != b"\r\n" {
                return Err(ProtocolError::MissingTerminator(data_end));
            }
            Ok(Some((data_end + 2, 0)))
        }
        b'*' => {
            let len = parse_int(&buf[pos + 1..line_end])?;
            if len <= 0 {
                return Ok(Some((next, 0)));
            }
            check_array_len(len)?;
            Ok(Some((next, len as usize)))
        }
        other => Err(ProtocolError::InvalidType(other)),
    }
}

/// Incremental frame counter for a buffer that grows at the tail and is
/// consumed from the head.
///
/// Progress inside a partial frame is kept between calls, so each byte is
/// walked once no matter how many reads a large reply spans.
#[derive(Debug, Clone, Default)]
pub struct FrameScanner {
    /// End offsets of complete frames not yet consumed.
    ends: VecDeque<usize>,
    /// Next element to walk.
    pos: usize,
    /// Elements left in the frame being walked; zero at a frame boundary.
    pending: usize,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts up to `max` complete frames at the start of `buf`, resuming
    /// where the previous call stopped.
    ///
    /// `buf` must be the previous buffer with bytes appended, minus whatever
    /// was handed to [`FrameScanner::consume`].
    pub fn scan(&mut self, buf: &[u8], max: usize) -> Result<FrameScan, ProtocolError> {
        while self.ends.len() < max {
            if self.pending == 0 {
                if self.pos >= buf.len() {
                    break;
                }
                self.pending = 1;
            }
            match element_end(buf, self.pos)? {
                Some((next, children)) => {
                    self.pos = next;
                    self.pending = self.pending - 1 + children;
                    if self.pending == 0 {
                        self.ends.push_back(self.pos);
                    }
                }
                None => break,
            }
        }

        let count = self.ends.len().min(max);
        let end = match count {
            0 => 0,
            n => self.ends[n - 1],
        };
        Ok(FrameScan { count, end })
    }

    /// Forgets the first `frames` complete frames after their bytes were
    /// split off the front of the buffer.
    pub fn consume(&mut self, frames: usize) {
        let frames = frames.min(self.ends.len());
        if frames == 0 {
            return;
        }
        let cut = self.ends[frames - 1];
        self.ends.drain(..frames);
        for end in self.ends.iter_mut() {
            *end -= cut;
        }
        self.pos -= cut;
    }

    /// Drops all progress, for a buffer that was cleared.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Decodes exactly one frame starting at `cursor`.
///
/// Returns the value and the cursor just past the frame. An incomplete frame
/// yields [`ProtocolError::Incomplete`].
pub fn decode_one(bytes: &Bytes, cursor: usize) -> Result<(RespValue, usize), ProtocolError> {
    decode_at(bytes, cursor, 0)
}

fn decode_at(bytes: &Bytes, pos: usize, depth: usize) -> Result<(RespValue, usize), ProtocolError> {
    if depth > MAX_NESTING {
        return Err(ProtocolError::NestingTooDeep(MAX_NESTING));
    }
    if pos >= bytes.len() {
        return Err(ProtocolError::Incomplete(pos));
    }
    let line_end = find_crlf(bytes, pos + 1).ok_or(ProtocolError::Incomplete(pos))?;
    let next = line_end + 2;

    match bytes[pos] {
        b'+' => Ok((RespValue::SimpleString(bytes.slice(pos + 1..line_end)), next)),
        b'-' => Ok((RespValue::Error(bytes.slice(pos + 1..line_end)), next)),
        b':' => Ok((RespValue::Integer(parse_int(&bytes[pos + 1..line_end])?), next)),
        b'$' => {
            let len = parse_int(&bytes[pos + 1..line_end])?;
            if len < 0 {
                return Ok((RespValue::Null, next));
            }
            check_bulk_len(len)?;
            let data_end = next + len as usize;
            if bytes.len() < data_end + 2 {
                return Err(ProtocolError::Incomplete(pos));
            }
            if &bytes[data_end..data_end + 2] != b"\r\n" {
                return Err(ProtocolError::MissingTerminator(data_end));
            }
            Ok((RespValue::BulkString(bytes.slice(next..data_end)), data_end + 2))
        }
        b'*' => {
            let len = parse_int(&bytes[pos + 1..line_end])?;
            if len < 0 {
                return Ok((RespValue::Null, next));
            }
            check_array_len(len)?;
            let mut items = Vec::with_capacity((len as usize).min(1024));
            let mut cursor = next;
            for _ in 0..len {
                let (item, after) = decode_at(bytes, cursor, depth + 1)?;
                items.push(item);
                cursor = after;
            }
            Ok((RespValue::Array(items), cursor))
        }
        other => Err(ProtocolError::InvalidType(other)),
    }
}

/// Finds the index of the next `\r\n` at or after `from`.
fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn parse_int(data: &[u8]) -> Result<i64, ProtocolError> {
    let invalid = || ProtocolError::InvalidInteger(String::from_utf8_lossy(data).into_owned());
    let (negative, digits) = match data.first() {
        Some(b'-') => (true, &data[1..]),
        Some(_) => (false, data),
        None => return Err(invalid()),
    };
    if digits.is_empty() {
        return Err(invalid());
    }

    // Accumulate with the final sign so i64::MIN parses.
    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(invalid());
        }
        let digit = (b - b'0') as i64;
        value = value
            .checked_mul(10)
            .and_then(|v| {
                if negative {
                    v.checked_sub(digit)
                } else {
                    v.checked_add(digit)
                }
            })
            .ok_or_else(invalid)?;
    }

    Ok(value)
}

fn check_bulk_len(len: i64) -> Result<(), ProtocolError> {
    if len > MAX_BULK_LEN {
        return Err(ProtocolError::BulkTooLarge {
            size: len,
            max: MAX_BULK_LEN,
        });
    }
    Ok(())
}

fn check_array_len(len: i64) -> Result<(), ProtocolError> {
    if len > MAX_ARRAY_LEN {
        return Err(ProtocolError::ArrayTooLarge {
            size: len,
            max: MAX_ARRAY_LEN,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_scan_simple_frames() {
        let buf = b"+OK\r\n:42\r\n$5\r\nhello\r\n";
        let scan = count_complete_frames(buf).unwrap();
        assert_eq!(scan.count, 3);
        assert_eq!(scan.end, buf.len());
    }

    #[test]
    fn test_scan_stops_at_partial_frame() {
        // Two complete frames followed by 10 bytes of a third.
        let mut buf = b"+OK\r\n:1\r\n".to_vec();
        let complete = buf.len();
        buf.extend_from_slice(b"$20\r\nabcde");
        assert_eq!(buf.len() - complete, 10);

        let scan = count_complete_frames(&buf).unwrap();
        assert_eq!(scan.count, 2);
        assert_eq!(scan.end, complete);
    }

    #[test]
    fn test_scan_respects_max() {
        let buf = b"+A\r\n+B\r\n+C\r\n";
        let scan = scan_frames(buf, 2).unwrap();
        assert_eq!(scan.count, 2);
        assert_eq!(scan.end, 8);
    }

    #[test]
    fn test_scan_nested_arrays() {
        let buf = b"*2\r\n*2\r\n:1\r\n:2\r\n$-1\r\n*0\r\n*-1\r\n";
        let scan = count_complete_frames(buf).unwrap();
        assert_eq!(scan.count, 3);
        assert_eq!(scan.end, buf.len());

        // Array missing its last member is incomplete.
        let scan = count_complete_frames(b"*3\r\n:1\r\n:2\r\n").unwrap();
        assert_eq!(scan.count, 0);
    }

    #[test]
    fn test_scan_bulk_with_embedded_crlf() {
        let buf = b"$4\r\n\r\n\r\n\r\n";
        let scan = count_complete_frames(buf).unwrap();
        assert_eq!(scan.count, 1);
        assert_eq!(scan.end, buf.len());
    }

    #[test]
    fn test_scan_invalid_type() {
        let result = count_complete_frames(b"?what\r\n");
        assert_eq!(result, Err(ProtocolError::InvalidType(b'?')));
    }

    #[test]
    fn test_scan_bad_bulk_terminator() {
        let result = count_complete_frames(b"$2\r\nabXY");
        assert!(matches!(result, Err(ProtocolError::MissingTerminator(6))));
    }

    #[test]
    fn test_scan_bulk_too_large() {
        let result = count_complete_frames(b"$999999999999\r\n");
        assert!(matches!(result, Err(ProtocolError::BulkTooLarge { .. })));
    }

    #[test]
    fn test_decode_each_type() {
        let bytes = Bytes::from_static(b"+OK\r\n-ERR bad\r\n:-7\r\n$3\r\nfoo\r\n$-1\r\n");
        let (v, c) = decode_one(&bytes, 0).unwrap();
        assert_eq!(v, RespValue::simple("OK"));
        let (v, c) = decode_one(&bytes, c).unwrap();
        assert_eq!(v, RespValue::Error(Bytes::from_static(b"ERR bad")));
        let (v, c) = decode_one(&bytes, c).unwrap();
        assert_eq!(v, RespValue::Integer(-7));
        let (v, c) = decode_one(&bytes, c).unwrap();
        assert_eq!(v, RespValue::bulk("foo"));
        let (v, c) = decode_one(&bytes, c).unwrap();
        assert_eq!(v, RespValue::Null);
        assert_eq!(c, bytes.len());
    }

    #[test]
    fn test_decode_array() {
        let bytes = Bytes::from_static(b"*3\r\n$1\r\na\r\n*1\r\n:1\r\n*-1\r\n");
        let (v, c) = decode_one(&bytes, 0).unwrap();
        assert_eq!(
            v,
            RespValue::Array(vec![
                RespValue::bulk("a"),
                RespValue::Array(vec![RespValue::Integer(1)]),
                RespValue::Null,
            ])
        );
        assert_eq!(c, bytes.len());
    }

    #[test]
    fn test_decode_incomplete() {
        let bytes = Bytes::from_static(b"$5\r\nhel");
        assert!(decode_one(&bytes, 0).unwrap_err().is_incomplete());
    }

    #[test]
    fn test_decode_bad_integer() {
        let bytes = Bytes::from_static(b":12x\r\n");
        assert!(matches!(
            decode_one(&bytes, 0),
            Err(ProtocolError::InvalidInteger(_))
        ));
    }

    #[test]
    fn test_parse_int_overflow() {
        assert!(parse_int(b"99999999999999999999").is_err());
        assert!(parse_int(b"-").is_err());
        assert_eq!(parse_int(b"-12").unwrap(), -12);
    }

    #[test]
    fn test_scanner_resumes_inside_partial_array() {
        let mut scanner = FrameScanner::new();
        let mut buf = b"*3\r\n:1\r\n:2\r\n".to_vec();
        assert_eq!(scanner.scan(&buf, usize::MAX).unwrap().count, 0);
        // Two members already walked, one to go.
        assert_eq!(scanner.pos, buf.len());
        assert_eq!(scanner.pending, 1);

        buf.extend_from_slice(b":3\r\n+OK");
        let scan = scanner.scan(&buf, usize::MAX).unwrap();
        assert_eq!(scan, FrameScan { count: 1, end: 16 });

        buf.drain(..scan.end);
        scanner.consume(scan.count);
        assert_eq!(scanner.pos, 0);

        buf.extend_from_slice(b"\r\n");
        assert_eq!(
            scanner.scan(&buf, usize::MAX).unwrap(),
            FrameScan { count: 1, end: 5 }
        );
    }

    #[test]
    fn test_scanner_respects_max_and_keeps_the_rest() {
        let mut scanner = FrameScanner::new();
        let mut buf = b"+A\r\n+B\r\n+C\r\n".to_vec();
        let scan = scanner.scan(&buf, 1).unwrap();
        assert_eq!(scan, FrameScan { count: 1, end: 4 });

        buf.drain(..scan.end);
        scanner.consume(scan.count);
        assert_eq!(
            scanner.scan(&buf, usize::MAX).unwrap(),
            FrameScan { count: 2, end: 8 }
        );
    }

    #[test]
    fn test_scanner_reports_malformed_member() {
        let mut scanner = FrameScanner::new();
        let mut buf = b"*2\r\n:1\r\n".to_vec();
        assert_eq!(scanner.scan(&buf, usize::MAX).unwrap().count, 0);
        buf.extend_from_slice(b"?x\r\n");
        assert_eq!(
            scanner.scan(&buf, usize::MAX),
            Err(ProtocolError::InvalidType(b'?'))
        );
    }

    fn arb_value() -> impl Strategy<Value = RespValue> {
        let leaf = prop_oneof![
            "[a-zA-Z0-9 ]{0,16}".prop_map(|s| RespValue::simple(&s)),
            any::<i64>().prop_map(RespValue::Integer),
            proptest::collection::vec(any::<u8>(), 0..64)
                .prop_map(|b| RespValue::BulkString(Bytes::from(b))),
            Just(RespValue::Null),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            proptest::collection::vec(inner, 0..6).prop_map(RespValue::Array)
        })
    }

    fn write_value(value: &RespValue, out: &mut Vec<u8>) {
        match value {
            RespValue::SimpleString(s) => {
                out.push(b'+');
                out.extend_from_slice(s);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                out.push(b'-');
                out.extend_from_slice(s);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(n) => out.extend_from_slice(format!(":{}\r\n", n).as_bytes()),
            RespValue::BulkString(b) => {
                out.extend_from_slice(format!("${}\r\n", b.len()).as_bytes());
                out.extend_from_slice(b);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Array(items) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    write_value(item, out);
                }
            }
            RespValue::Null => out.extend_from_slice(b"$-1\r\n"),
        }
    }

    proptest! {
        // Any split point of a valid stream counts exactly the frames wholly before it.
        #[test]
        fn prop_split_counts_whole_frames(values in proptest::collection::vec(arb_value(), 1..8), cut in any::<prop::sample::Index>()) {
            let mut wire = Vec::new();
            let mut ends = Vec::new();
            for v in &values {
                write_value(v, &mut wire);
                ends.push(wire.len());
            }
            let cut = cut.index(wire.len() + 1);
            let scan = count_complete_frames(&wire[..cut]).unwrap();
            let expected = ends.iter().filter(|&&e| e <= cut).count();
            prop_assert_eq!(scan.count, expected);
            prop_assert_eq!(scan.end, if expected == 0 { 0 } else { ends[expected - 1] });
        }

        // Feeding a stream in arbitrary chunks finds the same boundaries as one scan.
        #[test]
        fn prop_chunked_scanner_matches_whole_scan(
            values in proptest::collection::vec(arb_value(), 1..8),
            chunk in 1usize..17,
            max in 1usize..4,
        ) {
            let mut wire = Vec::new();
            let mut ends = Vec::new();
            for v in &values {
                write_value(v, &mut wire);
                ends.push(wire.len());
            }

            let mut scanner = FrameScanner::new();
            let mut buf = Vec::new();
            let mut consumed = 0;
            let mut seen = Vec::new();
            for piece in wire.chunks(chunk) {
                buf.extend_from_slice(piece);
                loop {
                    let scan = scanner.scan(&buf, max).unwrap();
                    if scan.count == 0 {
                        break;
                    }
                    let whole = count_complete_frames(&buf).unwrap();
                    prop_assert_eq!(scan.count, whole.count.min(max));
                    let mut offset = 0;
                    for _ in 0..scan.count {
                        offset = frame_end(&buf, offset).unwrap().unwrap();
                        seen.push(consumed + offset);
                    }
                    prop_assert_eq!(offset, scan.end);
                    buf.drain(..scan.end);
                    consumed += scan.end;
                    scanner.consume(scan.count);
                }
            }
            prop_assert!(buf.is_empty());
            prop_assert_eq!(seen, ends);
        }

        #[test]
        fn prop_decode_matches_written(values in proptest::collection::vec(arb_value(), 1..8)) {
            let mut wire = Vec::new();
            for v in &values {
                write_value(v, &mut wire);
            }
            let bytes = Bytes::from(wire);
            let mut cursor = 0;
            for v in &values {
                let (decoded, next) = decode_one(&bytes, cursor).unwrap();
                prop_assert_eq!(&decoded, v);
                cursor = next;
            }
            prop_assert_eq!(cursor, bytes.len());
        }
    }
}
