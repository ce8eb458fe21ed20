//! Command programming.
//!
//! [`RegisterOps`] is the set of register operations a caller can perform
//! on the board.  The live [`Device`](crate::device::Device) executes them
//! immediately; a [`CommandRecorder`] turns them into [`Instruction`]s
//! instead, which the device then uploads bound to an event trigger.
//!
//! ```text
//!   program_commands(trigger, |rec| { rec.write_register(..); rec.read_data(..) })
//!        │
//!        ├─ Idle ──▶ Capturing (recorder alive) ──▶ Idle
//!        │
//!        └─ finish() ─▶ BindProgram { trigger, instructions }
//! ```
//!
//! Callbacks passed to a recorder are never invoked: a callback-bearing
//! call cannot run on the board, so the whole capture is rejected.

use heapless::Vec as BoundedVec;
use log::warn;

use crate::error::{Error, Result};
use crate::register::{DataRegister, Register, RegisterAddr, Value};
use crate::session::ConnectionId;

pub use crate::link::Instruction;

/// Size of the board's per-trigger instruction buffer.
pub const MAX_PROGRAM_INSTRUCTIONS: usize = 16;

/// Completion of a remote operation.
pub type Completion = Box<dyn FnOnce(Result<()>)>;

/// Receives the value of a register read.
pub type ReadHandler = Box<dyn FnOnce(Result<Value>)>;

/// Register operations shared by the live device and the recorder.
pub trait RegisterOps {
    /// Write `payload` to `target`.
    fn write_register(
        &mut self,
        target: RegisterAddr,
        payload: &[u8],
        on_done: Option<Completion>,
    ) -> Result<()>;

    /// Read `data`, refreshing its cached value.
    fn read_data(&mut self, data: &DataRegister, on_value: Option<ReadHandler>) -> Result<()>;
}

/// Captures register operations as a program instead of executing them.
pub struct CommandRecorder {
    connection: ConnectionId,
    instructions: BoundedVec<Instruction, MAX_PROGRAM_INSTRUCTIONS>,
    rejection: Option<&'static str>,
}

impl CommandRecorder {
    pub(crate) fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            instructions: BoundedVec::new(),
            rejection: None,
        }
    }

    /// Number of instructions captured so far.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Validate and hand over the captured program.
    pub(crate) fn finish(self) -> Result<Vec<Instruction>> {
        if let Some(reason) = self.rejection {
            return Err(Error::InvalidCommandSequence(reason));
        }
        Ok(self.instructions.into_iter().collect())
    }

    fn record(&mut self, instruction: Instruction) {
        if self.rejection.is_some() {
            return;
        }
        if self.instructions.push(instruction).is_err() {
            self.reject("program exceeds the board's instruction buffer");
        }
    }

    fn reject(&mut self, reason: &'static str) {
        warn!("program capture rejected: {}", reason);
        if self.rejection.is_none() {
            self.rejection = Some(reason);
        }
    }
}

impl RegisterOps for CommandRecorder {
    fn write_register(
        &mut self,
        target: RegisterAddr,
        payload: &[u8],
        on_done: Option<Completion>,
    ) -> Result<()> {
        if on_done.is_some() {
            self.reject("captured write carries a host callback");
            return Ok(());
        }
        self.record(Instruction::Write {
            target,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn read_data(&mut self, data: &DataRegister, on_value: Option<ReadHandler>) -> Result<()> {
        if data.connection() != self.connection {
            return Err(Error::CrossSession);
        }
        if on_value.is_some() {
            self.reject("captured read carries a host callback");
            return Ok(());
        }
        self.record(Instruction::Read {
            source: data.addr(),
        });
        Ok(())
    }
}
