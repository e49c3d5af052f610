//! Boundary to the bytecode execution engine.
//!
//! An engine runs a program to completion and hands the debugger one
//! suspension per instruction, before that instruction executes. The engine
//! does not advance until the [`Continuation`] it handed out is resumed; if the
//! continuation is dropped instead, the run is abandoned.

mod interpreter;

pub use interpreter::{Interpreter, InterpreterFactory, DEFAULT_GAS_LIMIT};

use crate::error::DebugError;
use primitive_types::U256;
use std::sync::mpsc::{self, SyncSender};
use thiserror::Error;

/// Point-in-time copy of the machine, taken before the instruction at `pc` runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSnapshot {
    pub pc: usize,
    pub opcode: u8,
    pub opcode_name: String,
    /// Top of stack last.
    pub stack: Vec<U256>,
    pub memory: Vec<u8>,
    pub gas_left: u64,
}

impl MachineSnapshot {
    pub fn memory_word_count(&self) -> usize {
        self.memory.len().div_ceil(32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Stopped,
    Returned,
    Reverted,
}

impl ExitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitStatus::Stopped => "stopped",
            ExitStatus::Returned => "returned",
            ExitStatus::Reverted => "reverted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub status: ExitStatus,
    pub return_value: Vec<u8>,
    pub gas_used: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The continuation was dropped without being resumed.
    #[error("engine run abandoned")]
    Abandoned,

    #[error("execution fault: {0}")]
    Fault(String),
}

/// One-shot resume capability for a suspended engine.
#[derive(Debug)]
pub struct Continuation {
    tx: SyncSender<()>,
}

impl Continuation {
    pub fn resume(self) {
        // The engine may already be gone if the session was torn down.
        let _ = self.tx.send(());
    }
}

/// Receives one call per instruction, on the engine's own thread.
pub trait SuspendHandler {
    fn on_suspend(&mut self, snapshot: MachineSnapshot, resume: Continuation);
}

pub trait Engine: Send {
    fn run_program(
        &mut self,
        code: &[u8],
        input: &[u8],
        handler: &mut dyn SuspendHandler,
    ) -> Result<ExecutionResult, EngineError>;
}

/// Builds a fresh engine per session.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Engine>, DebugError>;
}

/// Hand `snapshot` to the handler and park until the continuation is resumed.
pub fn suspend(
    handler: &mut dyn SuspendHandler,
    snapshot: MachineSnapshot,
) -> Result<(), EngineError> {
    let (tx, rx) = mpsc::sync_channel(1);
    handler.on_suspend(snapshot, Continuation { tx });
    rx.recv().map_err(|_| EngineError::Abandoned)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dropper;

    impl SuspendHandler for Dropper {
        fn on_suspend(&mut self, _snapshot: MachineSnapshot, resume: Continuation) {
            drop(resume);
        }
    }

    struct Resumer(usize);

    impl SuspendHandler for Resumer {
        fn on_suspend(&mut self, _snapshot: MachineSnapshot, resume: Continuation) {
            self.0 += 1;
            resume.resume();
        }
    }

    fn snapshot() -> MachineSnapshot {
        MachineSnapshot {
            pc: 0,
            opcode: 0,
            opcode_name: "STOP".to_string(),
            stack: Vec::new(),
            memory: vec![0; 33],
            gas_left: 0,
        }
    }

    #[test]
    fn test_dropped_continuation_abandons() {
        assert_eq!(suspend(&mut Dropper, snapshot()), Err(EngineError::Abandoned));
    }

    #[test]
    fn test_immediate_resume_does_not_block() {
        let mut handler = Resumer(0);
        assert_eq!(suspend(&mut handler, snapshot()), Ok(()));
        assert_eq!(handler.0, 1);
    }

    #[test]
    fn test_memory_word_count_rounds_up() {
        assert_eq!(snapshot().memory_word_count(), 2);
    }
}
