//! Bounded look-ahead over stack-only opcodes.
//!
//! Starting from a halted `(pc, stack)` the predictor replays pushes, pops,
//! dups, swaps and branches on a private copy of the stack, and stops at the
//! first opcode it cannot model. Indirect jumps it lands on are checked against
//! the program's static jump table; targets with no static edge are recorded
//! as dynamic jumps.

use crate::program::opcodes::{self, JUMP, JUMPDEST, JUMPI, POP};
use crate::program::{read_immediate, Program};
use primitive_types::U256;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::trace;

pub const DEFAULT_LOOKAHEAD: usize = 8;

/// An indirect jump target with no static edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicJump {
    pub address: usize,
    pub discovered_from: usize,
    pub is_dynamic: bool,
}

/// Dynamic jumps accumulated over one session, keyed by target.
#[derive(Debug, Clone, Default)]
pub struct DynamicJumps {
    records: BTreeMap<usize, DynamicJump>,
}

impl DynamicJumps {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent discovery of a target overwrites earlier ones.
    pub fn record(&mut self, address: usize, discovered_from: usize) -> DynamicJump {
        let jump = DynamicJump {
            address,
            discovered_from,
            is_dynamic: true,
        };
        self.records.insert(address, jump);
        jump
    }

    pub fn get(&self, address: usize) -> Option<&DynamicJump> {
        self.records.get(&address)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn to_vec(&self) -> Vec<DynamicJump> {
        self.records.values().copied().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "at", rename_all = "camelCase")]
pub enum StopReason {
    /// An opcode outside the modeled set (arithmetic, memory, storage, calls, ...).
    UnmodeledOpcode(u8),
    /// A taken branch to something other than a `JUMPDEST`.
    InvalidJumpTarget(usize),
    /// Reached a `JUMP`; nothing past it is predicted.
    IndirectJump(usize),
    StackUnderflow,
    EndOfCode,
    DepthExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LookaheadStep {
    pub pc: usize,
    pub opcode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prediction {
    pub trace: Vec<LookaheadStep>,
    pub stop: StopReason,
    pub discovered: Vec<DynamicJump>,
}

#[derive(Debug, Clone, Copy)]
pub struct Predictor {
    depth: usize,
}

impl Default for Predictor {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKAHEAD)
    }
}

enum Branch {
    Invalid(usize),
    Known(usize),
    Dynamic(usize),
}

impl Predictor {
    pub fn new(depth: usize) -> Self {
        Self { depth }
    }

    /// Look ahead from `pc` with a private copy of `stack`. Never fails; a
    /// prediction that cannot continue just stops.
    pub fn predict(
        &self,
        program: &Program,
        pc: usize,
        stack: &[U256],
        jumps: &mut DynamicJumps,
    ) -> Prediction {
        let mut pc = pc;
        let mut stack = stack.to_vec();
        let mut trace = Vec::new();
        let mut discovered = Vec::new();

        let stop = 'ahead: {
            for _ in 0..self.depth {
                let Some(op) = program.opcode_at(pc) else {
                    break 'ahead StopReason::EndOfCode;
                };
                trace.push(LookaheadStep {
                    pc,
                    opcode: opcodes::display_name(op),
                });

                match op {
                    JUMP => {
                        let Some(dest) = stack.pop() else {
                            break 'ahead StopReason::StackUnderflow;
                        };
                        break 'ahead match classify(program, &dest) {
                            Branch::Invalid(target) => StopReason::InvalidJumpTarget(target),
                            Branch::Known(target) => StopReason::IndirectJump(target),
                            Branch::Dynamic(target) => {
                                discovered.push(jumps.record(target, pc));
                                StopReason::IndirectJump(target)
                            }
                        };
                    }
                    JUMPI => {
                        if stack.len() < 2 {
                            break 'ahead StopReason::StackUnderflow;
                        }
                        let dest = stack.pop().unwrap_or_default();
                        let cond = stack.pop().unwrap_or_default();
                        if cond.is_zero() {
                            pc += 1;
                            continue;
                        }
                        pc = match classify(program, &dest) {
                            Branch::Invalid(target) => {
                                break 'ahead StopReason::InvalidJumpTarget(target)
                            }
                            Branch::Known(target) => target,
                            Branch::Dynamic(target) => {
                                discovered.push(jumps.record(target, pc));
                                target
                            }
                        };
                    }
                    JUMPDEST => pc += 1,
                    POP => {
                        if stack.pop().is_none() {
                            break 'ahead StopReason::StackUnderflow;
                        }
                        pc += 1;
                    }
                    op if opcodes::is_push(op) => {
                        let width = opcodes::immediate_width(op);
                        stack.push(read_immediate(program.bytecode(), pc + 1, width));
                        pc += 1 + width;
                    }
                    op if opcodes::is_dup(op) => {
                        let depth = (op - opcodes::DUP1) as usize + 1;
                        if depth > stack.len() {
                            break 'ahead StopReason::StackUnderflow;
                        }
                        let value = stack[stack.len() - depth];
                        stack.push(value);
                        pc += 1;
                    }
                    op if opcodes::is_swap(op) => {
                        let depth = (op - opcodes::SWAP1) as usize + 1;
                        let top = stack.len().wrapping_sub(1);
                        if depth >= stack.len() {
                            break 'ahead StopReason::StackUnderflow;
                        }
                        stack.swap(top, top - depth);
                        pc += 1;
                    }
                    other => {
                        // The unmodeled instruction is not part of the prediction.
                        trace.pop();
                        break 'ahead StopReason::UnmodeledOpcode(other);
                    }
                }
            }
            StopReason::DepthExhausted
        };

        trace!(steps = trace.len(), ?stop, found = discovered.len(), "lookahead");
        Prediction {
            trace,
            stop,
            discovered,
        }
    }
}

fn classify(program: &Program, dest: &U256) -> Branch {
    let Some(target) = program.address_of(dest) else {
        let clipped = if dest.bits() > 64 {
            usize::MAX
        } else {
            usize::try_from(dest.low_u64()).unwrap_or(usize::MAX)
        };
        return Branch::Invalid(clipped);
    };
    if !program.is_jump_dest(target) {
        Branch::Invalid(target)
    } else if program.has_static_edge_into(target) {
        Branch::Known(target)
    } else {
        Branch::Dynamic(target)
    }
}
