use super::{
    suspend, Engine, EngineError, EngineFactory, ExecutionResult, ExitStatus, MachineSnapshot,
    SuspendHandler,
};
use crate::error::DebugError;
use crate::program::opcodes::{self, JUMPDEST};
use crate::program::{decode, read_immediate};
use primitive_types::U256;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

pub const DEFAULT_GAS_LIMIT: u64 = 0xffff;

/// Flat per-instruction cost; this engine is not gas accurate.
const STEP_COST: u64 = 3;
const STACK_LIMIT: usize = 1024;
const MEMORY_LIMIT: usize = 1 << 20;

pub struct InterpreterFactory {
    gas_limit: u64,
}

impl InterpreterFactory {
    pub fn new(gas_limit: u64) -> Self {
        Self { gas_limit }
    }
}

impl Default for InterpreterFactory {
    fn default() -> Self {
        Self::new(DEFAULT_GAS_LIMIT)
    }
}

impl EngineFactory for InterpreterFactory {
    fn create(&self) -> Result<Box<dyn Engine>, DebugError> {
        if self.gas_limit == 0 {
            return Err(DebugError::EngineUnavailable(
                "gas limit must be non-zero".to_string(),
            ));
        }
        Ok(Box::new(Interpreter::new(self.gas_limit)))
    }
}

/// Small in-process engine covering the stack, memory, storage and control-flow
/// opcodes emitted by simple contracts.
pub struct Interpreter {
    gas_limit: u64,
}

impl Interpreter {
    pub fn new(gas_limit: u64) -> Self {
        Self { gas_limit }
    }
}

struct Machine<'a> {
    code: &'a [u8],
    input: &'a [u8],
    jump_dests: HashSet<usize>,
    pc: usize,
    stack: Vec<U256>,
    memory: Vec<u8>,
    storage: HashMap<U256, U256>,
    gas_left: u64,
}

enum Flow {
    Continue,
    Exit(ExitStatus, Vec<u8>),
}

fn fault(msg: impl Into<String>) -> EngineError {
    EngineError::Fault(msg.into())
}

impl Engine for Interpreter {
    fn run_program(
        &mut self,
        code: &[u8],
        input: &[u8],
        handler: &mut dyn SuspendHandler,
    ) -> Result<ExecutionResult, EngineError> {
        let jump_dests = decode(code)
            .into_iter()
            .filter(|i| i.bytecode == JUMPDEST)
            .map(|i| i.addr)
            .collect();

        let mut m = Machine {
            code,
            input,
            jump_dests,
            pc: 0,
            stack: Vec::new(),
            memory: Vec::new(),
            storage: HashMap::new(),
            gas_left: self.gas_limit,
        };

        debug!(code_len = code.len(), input_len = input.len(), "engine run started");

        loop {
            // Running off the end is an implicit STOP.
            let op = m.code.get(m.pc).copied().unwrap_or(opcodes::STOP);

            suspend(handler, m.snapshot(op))?;

            if m.gas_left < STEP_COST {
                return Err(fault("out of gas"));
            }
            m.gas_left -= STEP_COST;

            trace!(pc = m.pc, op = %opcodes::display_name(op), "execute");
            if let Flow::Exit(status, return_value) = m.execute(op)? {
                return Ok(ExecutionResult {
                    status,
                    return_value,
                    gas_used: self.gas_limit - m.gas_left,
                });
            }
        }
    }
}

impl<'a> Machine<'a> {
    fn snapshot(&self, op: u8) -> MachineSnapshot {
        MachineSnapshot {
            pc: self.pc,
            opcode: op,
            opcode_name: opcodes::display_name(op),
            stack: self.stack.clone(),
            memory: self.memory.clone(),
            gas_left: self.gas_left,
        }
    }

    fn pop(&mut self) -> Result<U256, EngineError> {
        self.stack.pop().ok_or_else(|| fault("stack underflow"))
    }

    fn push(&mut self, value: U256) -> Result<(), EngineError> {
        if self.stack.len() >= STACK_LIMIT {
            return Err(fault("stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    fn binary(&mut self, f: impl FnOnce(U256, U256) -> U256) -> Result<(), EngineError> {
        let a = self.pop()?;
        let b = self.pop()?;
        self.push(f(a, b))
    }

    fn to_usize(word: U256, what: &str) -> Result<usize, EngineError> {
        if word.bits() > 32 {
            return Err(fault(format!("{} out of range", what)));
        }
        Ok(word.low_u64() as usize)
    }

    fn expand(&mut self, offset: usize, len: usize) -> Result<(), EngineError> {
        if len == 0 {
            return Ok(());
        }
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= MEMORY_LIMIT)
            .ok_or_else(|| fault("memory limit exceeded"))?;
        let words = end.div_ceil(32) * 32;
        if words > self.memory.len() {
            self.memory.resize(words, 0);
        }
        Ok(())
    }

    fn jump_to(&mut self, dest: U256) -> Result<(), EngineError> {
        let target = Self::to_usize(dest, "jump destination")?;
        if !self.jump_dests.contains(&target) {
            return Err(fault(format!("invalid jump destination 0x{:x}", target)));
        }
        self.pc = target;
        Ok(())
    }

    fn copy_into_memory(
        &mut self,
        source: &[u8],
        dest: U256,
        offset: U256,
        len: U256,
    ) -> Result<(), EngineError> {
        let dest = Self::to_usize(dest, "memory offset")?;
        let len = Self::to_usize(len, "copy length")?;
        self.expand(dest, len)?;
        let offset = if offset.bits() > 32 {
            usize::MAX
        } else {
            offset.low_u64() as usize
        };
        for i in 0..len {
            self.memory[dest + i] = offset
                .checked_add(i)
                .and_then(|at| source.get(at))
                .copied()
                .unwrap_or(0);
        }
        Ok(())
    }

    fn execute(&mut self, op: u8) -> Result<Flow, EngineError> {
        let mut next_pc = self.pc + 1;

        match op {
            0x00 => return Ok(Flow::Exit(ExitStatus::Stopped, Vec::new())),
            0x01 => self.binary(|a, b| a.overflowing_add(b).0)?,
            0x02 => self.binary(|a, b| a.overflowing_mul(b).0)?,
            0x03 => self.binary(|a, b| a.overflowing_sub(b).0)?,
            0x04 => self.binary(|a, b| a.checked_div(b).unwrap_or_default())?,
            0x06 => self.binary(|a, b| a.checked_rem(b).unwrap_or_default())?,
            0x0a => self.binary(|a, b| a.overflowing_pow(b).0)?,
            0x10 => self.binary(|a, b| bool_word(a < b))?,
            0x11 => self.binary(|a, b| bool_word(a > b))?,
            0x14 => self.binary(|a, b| bool_word(a == b))?,
            0x15 => {
                let a = self.pop()?;
                self.push(bool_word(a.is_zero()))?;
            }
            0x16 => self.binary(|a, b| a & b)?,
            0x17 => self.binary(|a, b| a | b)?,
            0x18 => self.binary(|a, b| a ^ b)?,
            0x19 => {
                let a = self.pop()?;
                self.push(!a)?;
            }
            0x1a => self.binary(|i, x| {
                if i >= U256::from(32) {
                    U256::zero()
                } else {
                    U256::from(x.byte(31 - i.low_u64() as usize))
                }
            })?,
            0x1b => self.binary(|shift, value| {
                if shift >= U256::from(256) {
                    U256::zero()
                } else {
                    value << (shift.low_u64() as usize)
                }
            })?,
            0x1c => self.binary(|shift, value| {
                if shift >= U256::from(256) {
                    U256::zero()
                } else {
                    value >> (shift.low_u64() as usize)
                }
            })?,
            0x34 => self.push(U256::zero())?,
            0x35 => {
                let offset = self.pop()?;
                let word = if offset.bits() > 32 {
                    U256::zero()
                } else {
                    read_immediate(self.input, offset.low_u64() as usize, 32)
                };
                self.push(word)?;
            }
            0x36 => self.push(U256::from(self.input.len()))?,
            0x37 => {
                let (dest, offset, len) = (self.pop()?, self.pop()?, self.pop()?);
                let input = self.input;
                self.copy_into_memory(input, dest, offset, len)?;
            }
            0x38 => self.push(U256::from(self.code.len()))?,
            0x39 => {
                let (dest, offset, len) = (self.pop()?, self.pop()?, self.pop()?);
                let code = self.code;
                self.copy_into_memory(code, dest, offset, len)?;
            }
            0x50 => {
                self.pop()?;
            }
            0x51 => {
                let offset = Self::to_usize(self.pop()?, "memory offset")?;
                self.expand(offset, 32)?;
                let word = U256::from_big_endian(&self.memory[offset..offset + 32]);
                self.push(word)?;
            }
            0x52 => {
                let offset = Self::to_usize(self.pop()?, "memory offset")?;
                let value = self.pop()?;
                self.expand(offset, 32)?;
                value.to_big_endian(&mut self.memory[offset..offset + 32]);
            }
            0x53 => {
                let offset = Self::to_usize(self.pop()?, "memory offset")?;
                let value = self.pop()?;
                self.expand(offset, 1)?;
                self.memory[offset] = value.byte(0);
            }
            0x54 => {
                let key = self.pop()?;
                let value = self.storage.get(&key).copied().unwrap_or_default();
                self.push(value)?;
            }
            0x55 => {
                let key = self.pop()?;
                let value = self.pop()?;
                self.storage.insert(key, value);
            }
            0x56 => {
                let dest = self.pop()?;
                self.jump_to(dest)?;
                return Ok(Flow::Continue);
            }
            0x57 => {
                let dest = self.pop()?;
                let cond = self.pop()?;
                if !cond.is_zero() {
                    self.jump_to(dest)?;
                    return Ok(Flow::Continue);
                }
            }
            0x58 => self.push(U256::from(self.pc))?,
            0x59 => self.push(U256::from(self.memory.len()))?,
            0x5a => self.push(U256::from(self.gas_left))?,
            0x5b => {}
            op if opcodes::is_push(op) => {
                let width = opcodes::immediate_width(op);
                let value = read_immediate(self.code, self.pc + 1, width);
                self.push(value)?;
                next_pc += width;
            }
            op if opcodes::is_dup(op) => {
                let depth = (op - opcodes::DUP1) as usize + 1;
                let len = self.stack.len();
                if depth > len {
                    return Err(fault("stack underflow"));
                }
                let value = self.stack[len - depth];
                self.push(value)?;
            }
            op if opcodes::is_swap(op) => {
                let depth = (op - opcodes::SWAP1) as usize + 1;
                let len = self.stack.len();
                if depth >= len {
                    return Err(fault("stack underflow"));
                }
                self.stack.swap(len - 1, len - 1 - depth);
            }
            0xf3 | 0xfd => {
                let offset = Self::to_usize(self.pop()?, "memory offset")?;
                let len = Self::to_usize(self.pop()?, "return length")?;
                self.expand(offset, len)?;
                let data = if len == 0 {
                    Vec::new()
                } else {
                    self.memory[offset..offset + len].to_vec()
                };
                let status = if op == 0xf3 {
                    ExitStatus::Returned
                } else {
                    ExitStatus::Reverted
                };
                return Ok(Flow::Exit(status, data));
            }
            other => {
                return Err(fault(format!(
                    "unsupported opcode {} at 0x{:x}",
                    opcodes::display_name(other),
                    self.pc
                )))
            }
        }

        self.pc = next_pc;
        Ok(Flow::Continue)
    }
}

fn bool_word(b: bool) -> U256 {
    if b {
        U256::one()
    } else {
        U256::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Continuation;

    #[derive(Default)]
    struct Recorder {
        pcs: Vec<usize>,
    }

    impl SuspendHandler for Recorder {
        fn on_suspend(&mut self, snapshot: MachineSnapshot, resume: Continuation) {
            self.pcs.push(snapshot.pc);
            resume.resume();
        }
    }

    fn run(code: &[u8], input: &[u8]) -> (Result<ExecutionResult, EngineError>, Vec<usize>) {
        let mut recorder = Recorder::default();
        let result = Interpreter::new(DEFAULT_GAS_LIMIT).run_program(code, input, &mut recorder);
        (result, recorder.pcs)
    }

    #[test]
    fn test_suspends_before_every_instruction() {
        // PUSH1 0x03 JUMP JUMPDEST STOP
        let (result, pcs) = run(&[0x60, 0x03, 0x56, 0x5b, 0x00], &[]);
        assert_eq!(pcs, vec![0, 2, 3, 4]);
        let result = result.expect("program should stop");
        assert_eq!(result.status, ExitStatus::Stopped);
        assert_eq!(result.gas_used, 4 * STEP_COST);
    }

    #[test]
    fn test_return_value() {
        // PUSH1 0x2a PUSH1 0 MSTORE PUSH1 0x20 PUSH1 0 RETURN
        let code = [0x60, 0x2a, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xf3];
        let (result, _) = run(&code, &[]);
        let result = result.expect("program should return");
        assert_eq!(result.status, ExitStatus::Returned);
        assert_eq!(result.return_value.len(), 32);
        assert_eq!(result.return_value[31], 0x2a);
    }

    #[test]
    fn test_calldata_and_jumpi() {
        // PUSH1 0 CALLDATALOAD PUSH1 0x08 JUMPI INVALID.. JUMPDEST STOP
        let code = [0x60, 0x00, 0x35, 0x60, 0x08, 0x57, 0xfe, 0xfe, 0x5b, 0x00];
        let mut input = vec![0u8; 32];
        input[31] = 1;
        let (result, pcs) = run(&code, &input);
        assert!(result.is_ok());
        assert_eq!(pcs, vec![0, 2, 3, 5, 8, 9]);
    }

    #[test]
    fn test_bad_jump_faults() {
        // PUSH1 0x01 JUMP
        let (result, _) = run(&[0x60, 0x01, 0x56], &[]);
        assert!(matches!(result, Err(EngineError::Fault(_))));
    }

    #[test]
    fn test_out_of_gas() {
        let mut recorder = Recorder::default();
        let result = Interpreter::new(STEP_COST).run_program(&[0x5b, 0x5b], &[], &mut recorder);
        assert_eq!(result, Err(EngineError::Fault("out of gas".to_string())));
    }

    #[test]
    fn test_zero_gas_factory_is_unavailable() {
        assert!(matches!(
            InterpreterFactory::new(0).create(),
            Err(DebugError::EngineUnavailable(_))
        ));
    }
}
