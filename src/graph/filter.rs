//! Filter definitions and their single evaluation function.
//!
//! A [`FilterSpec`] is the serialisable description of a filter (what the
//! board is asked to instantiate and what the identifier registry stores).
//! A [`FilterState`] is a live instance of it.  [`FilterState::evaluate`]
//! is the only place filter semantics are defined: host-side notification
//! delivery calls it, and so does anything that simulates the board.

use core::fmt;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::register::{DataKind, RegisterAddr, Value};

/// Comparison operations supported by the board's comparator filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Comparison {
    Equal = 0,
    NotEqual = 1,
    LessThan = 2,
    LessThanOrEqual = 3,
    GreaterThan = 4,
    GreaterThanOrEqual = 5,
}

impl Comparison {
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Equal => lhs == rhs,
            Self::NotEqual => lhs != rhs,
            Self::LessThan => lhs < rhs,
            Self::LessThanOrEqual => lhs <= rhs,
            Self::GreaterThan => lhs > rhs,
            Self::GreaterThanOrEqual => lhs >= rhs,
        }
    }
}

/// How a derived event computes its firings from its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterSpec {
    /// Running sum of source outputs; fires on every source firing.
    Accumulate,
    /// At most one firing per `period_ms`.
    PeriodicSample { period_ms: u32 },
    /// On every source firing, read `data` and fire with its value.
    ReadCoupled { data: RegisterAddr, kind: DataKind },
    /// Pass source firings through only when `value <op> reference`.
    Compare { op: Comparison, reference: Value },
}

impl FilterSpec {
    /// Reject malformed parameters.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::PeriodicSample { period_ms: 0 } => {
                Err(Error::InvalidArgument("sample period must be greater than 0 ms"))
            }
            Self::Compare { reference, .. } if !reference.is_numeric() => {
                Err(Error::InvalidArgument("comparison reference must be numeric"))
            }
            _ => Ok(()),
        }
    }

    /// Data kind of the derived event given its source's kind.
    pub fn output_kind(&self, input: DataKind) -> DataKind {
        match self {
            Self::Accumulate => match input {
                DataKind::F32 => DataKind::F32,
                DataKind::Bytes => DataKind::Bytes,
                k if k.is_signed() => DataKind::I32,
                _ => DataKind::U32,
            },
            Self::PeriodicSample { .. } | Self::Compare { .. } => input,
            Self::ReadCoupled { kind, .. } => *kind,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Accumulate => "accumulate",
            Self::PeriodicSample { .. } => "periodic-sample",
            Self::ReadCoupled { .. } => "read-coupled",
            Self::Compare { .. } => "compare",
        }
    }
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accumulate => write!(f, "accumulate"),
            Self::PeriodicSample { period_ms } => write!(f, "periodic-sample({period_ms} ms)"),
            Self::ReadCoupled { data, .. } => write!(f, "read-coupled({data})"),
            Self::Compare { op, reference } => write!(f, "compare({op:?} {reference})"),
        }
    }
}

/// Outcome of feeding one source firing into a filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// The derived event fires with this value.
    Fire(Value),
    /// The firing is absorbed.
    Suppress,
    /// The derived event fires once `addr` has been read; its value is
    /// the firing payload.
    Read(RegisterAddr),
}

/// A live filter instance.
#[derive(Debug, Clone)]
pub struct FilterState {
    spec: FilterSpec,
    /// Running total (Accumulate).
    total: Option<Value>,
    /// End of the currently open window (PeriodicSample).
    window_end: Option<u64>,
}

impl FilterState {
    pub fn new(spec: FilterSpec) -> Self {
        Self {
            spec,
            total: None,
            window_end: None,
        }
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    /// Feed one source firing observed at board time `timestamp_ms`.
    ///
    /// `PeriodicSample` is leading-edge: a firing outside any open window
    /// fires immediately and opens a window of `period_ms`; firings inside
    /// the window are suppressed.
    pub fn evaluate(&mut self, input: &Value, timestamp_ms: u64) -> Evaluation {
        match &self.spec {
            FilterSpec::Accumulate => {
                let next = match &self.total {
                    Some(total) => total.checked_sum(input),
                    None if input.is_numeric() => Value::Int(0).checked_sum(input),
                    None => None,
                };
                match next {
                    Some(total) => {
                        self.total = Some(total.clone());
                        Evaluation::Fire(total)
                    }
                    None => {
                        warn!("accumulate: ignoring non-numeric input {}", input);
                        Evaluation::Suppress
                    }
                }
            }
            FilterSpec::PeriodicSample { period_ms } => match self.window_end {
                Some(end) if timestamp_ms < end => Evaluation::Suppress,
                _ => {
                    self.window_end = Some(timestamp_ms.saturating_add(u64::from(*period_ms)));
                    Evaluation::Fire(input.clone())
                }
            },
            FilterSpec::ReadCoupled { data, .. } => Evaluation::Read(*data),
            FilterSpec::Compare { op, reference } => {
                match (input.as_f64(), reference.as_f64()) {
                    (Some(lhs), Some(rhs)) if op.holds(lhs, rhs) => Evaluation::Fire(input.clone()),
                    _ => Evaluation::Suppress,
                }
            }
        }
    }
}
