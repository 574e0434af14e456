//! # respconn-protocol
//!
//! RESP wire codec for respconn.
//!
//! This crate provides:
//! - Command encoding with exact length precomputation
//! - Complete-frame scanning over partial byte streams, resumable across reads
//! - Zero-copy single-frame reply decoding
//! - Reply value and command types

pub mod codec;
pub mod error;
pub mod frame;
pub mod value;

pub use codec::{encode_command, encode_value, encoded_len, Decoder, Encoder};
pub use error::ProtocolError;
pub use frame::{count_complete_frames, decode_one, scan_frames, FrameScan, FrameScanner};
pub use value::{Command, RespValue};

/// Default Redis port.
pub const DEFAULT_PORT: u16 = 6379;

/// Maximum bulk string length accepted from the wire (512 MiB).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Maximum array length accepted from the wire.
pub const MAX_ARRAY_LEN: i64 = 64 * 1024 * 1024;

/// Maximum array nesting depth when decoding.
pub const MAX_NESTING: usize = 128;
