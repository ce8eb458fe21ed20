//! Register abstraction.
//!
//! A register is an addressable location on the board.  [`Event`]s and
//! [`DataRegister`]s are both registers: they share an address, a data
//! kind and the connection session they were created under.
//!
//! [`Event`]: crate::graph::Event

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::session::ConnectionId;

// ---------------------------------------------------------------------------
// Addressing
// ---------------------------------------------------------------------------

/// Board module hosting the data-processing filters.
pub const FILTER_MODULE: u8 = 0x09;
/// Register of the filter module that carries filter outputs.
pub const FILTER_OUTPUT_REGISTER: u8 = 0x03;
/// Board module that binds command programs to event triggers.
pub const EVENT_MODULE: u8 = 0x0a;
/// Board module that owns the flash log.
pub const LOGGING_MODULE: u8 = 0x0b;

/// Opaque numeric identity of a register on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegisterAddr {
    pub module: u8,
    pub register: u8,
    pub index: u8,
}

impl RegisterAddr {
    pub const fn new(module: u8, register: u8, index: u8) -> Self {
        Self {
            module,
            register,
            index,
        }
    }

    /// Address of the output of filter slot `slot`.
    pub const fn filter_output(slot: u8) -> Self {
        Self::new(FILTER_MODULE, FILTER_OUTPUT_REGISTER, slot)
    }

    pub const fn is_filter_output(&self) -> bool {
        self.module == FILTER_MODULE && self.register == FILTER_OUTPUT_REGISTER
    }

    /// Module-level address used as the target of logical commands.
    pub const fn module_root(module: u8) -> Self {
        Self::new(module, 0, 0)
    }
}

impl fmt::Display for RegisterAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#04x}:{:#04x}[{}]",
            self.module, self.register, self.index
        )
    }
}

// ---------------------------------------------------------------------------
// Data kinds and values
// ---------------------------------------------------------------------------

/// Layout of the bytes a register produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataKind {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    /// Opaque bytes; never numeric.
    Bytes,
}

impl DataKind {
    /// Encoded width in bytes, `None` for variable-length kinds.
    pub const fn width(self) -> Option<usize> {
        match self {
            Self::Bool | Self::U8 | Self::I8 => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 | Self::F32 => Some(4),
            Self::Bytes => None,
        }
    }

    pub const fn is_numeric(self) -> bool {
        !matches!(self, Self::Bytes)
    }

    pub const fn is_signed(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::F32)
    }
}

/// A decoded register value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

impl Value {
    /// Numeric view; booleans count as 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            Self::Int(i) => Some(*i as f64),
            Self::Float(x) => Some(*x),
            Self::Bytes(_) => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::Bytes(_))
    }

    /// Sum of two numeric values.  Integers wrap the way the board's
    /// accumulator does; any float operand promotes the result.
    pub(crate) fn checked_sum(&self, other: &Value) -> Option<Value> {
        match (self.as_int(), other.as_int()) {
            (Some(a), Some(b)) => Some(Value::Int(a.wrapping_add(b))),
            _ => Some(Value::Float(self.as_f64()? + other.as_f64()?)),
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bytes(b) => write!(f, "{} bytes", b.len()),
        }
    }
}

// ---------------------------------------------------------------------------
// Register trait and data registers
// ---------------------------------------------------------------------------

/// Anything addressable on the board within one connection session.
pub trait Register {
    fn addr(&self) -> RegisterAddr;
    fn kind(&self) -> DataKind;
    fn connection(&self) -> ConnectionId;
}

/// A readable data source, e.g. a temperature or battery register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRegister {
    addr: RegisterAddr,
    kind: DataKind,
    connection: ConnectionId,
}

impl DataRegister {
    pub(crate) fn new(addr: RegisterAddr, kind: DataKind, connection: ConnectionId) -> Self {
        Self {
            addr,
            kind,
            connection,
        }
    }
}

impl Register for DataRegister {
    fn addr(&self) -> RegisterAddr {
        self.addr
    }

    fn kind(&self) -> DataKind {
        self.kind
    }

    fn connection(&self) -> ConnectionId {
        self.connection
    }
}
