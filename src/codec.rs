//! Payload and log-entry decoding.
//!
//! The board sends raw little-endian register bytes.  Turning them into a
//! [`Value`] depends only on the register's [`DataKind`]:
//!
//! ```text
//! ┌──────────┬───────┬──────────────────────────┐
//! │ DataKind │ Width │ Decoded as               │
//! ├──────────┼───────┼──────────────────────────┤
//! │ Bool     │ 1     │ Value::Bool (non-zero)   │
//! │ U8..I32  │ 1/2/4 │ Value::Int  (LE)         │
//! │ F32      │ 4     │ Value::Float (LE IEEE754)│
//! │ Bytes    │ any   │ Value::Bytes             │
//! └──────────┴───────┴──────────────────────────┘
//! ```
//!
//! Boards with richer payloads (accelerometer triples, timestamps) plug
//! their own [`EntryDecoder`] into the device.

use core::fmt;

use crate::register::{DataKind, Value};

/// Turns raw register bytes into a typed value.
pub trait EntryDecoder {
    fn decode(&self, kind: DataKind, raw: &[u8]) -> Result<Value, DecodeError>;
}

/// Errors from [`EntryDecoder::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload length does not match the kind's fixed width.
    LengthMismatch {
        kind: DataKind,
        expected: usize,
        actual: usize,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LengthMismatch {
                kind,
                expected,
                actual,
            } => write!(
                f,
                "{kind:?} payload must be {expected} bytes, got {actual}"
            ),
        }
    }
}

/// Default decoder for plain little-endian scalar registers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeDecoder;

impl EntryDecoder for LeDecoder {
    fn decode(&self, kind: DataKind, raw: &[u8]) -> Result<Value, DecodeError> {
        if let Some(expected) = kind.width() {
            if raw.len() != expected {
                return Err(DecodeError::LengthMismatch {
                    kind,
                    expected,
                    actual: raw.len(),
                });
            }
        }

        let value = match kind {
            DataKind::Bool => Value::Bool(raw[0] != 0),
            DataKind::U8 => Value::Int(i64::from(raw[0])),
            DataKind::I8 => Value::Int(i64::from(raw[0] as i8)),
            DataKind::U16 => Value::Int(i64::from(u16::from_le_bytes([raw[0], raw[1]]))),
            DataKind::I16 => Value::Int(i64::from(i16::from_le_bytes([raw[0], raw[1]]))),
            DataKind::U32 => Value::Int(i64::from(u32::from_le_bytes(le4(raw)))),
            DataKind::I32 => Value::Int(i64::from(i32::from_le_bytes(le4(raw)))),
            DataKind::F32 => Value::Float(f64::from(f32::from_le_bytes(le4(raw)))),
            DataKind::Bytes => Value::Bytes(raw.to_vec()),
        };
        Ok(value)
    }
}

fn le4(raw: &[u8]) -> [u8; 4] {
    [raw[0], raw[1], raw[2], raw[3]]
}
