use super::disassembler::disassemble;
use super::opcodes;
use crate::error::{DebugError, Result};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instruction {
    pub addr: usize,
    pub bytecode: u8,
    pub opcode: Option<String>,
    #[serde(rename = "operandValue", skip_serializing_if = "Option::is_none", default)]
    pub operand: Option<U256>,
}

/// A jump edge known without running the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JumpEdge {
    pub from: usize,
    #[serde(rename = "addr")]
    pub to: usize,
}

/// Byte range `[start, end)` of one code section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSection {
    pub start: usize,
    pub end: usize,
}

impl CodeSection {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disassembly {
    pub opcodes: Vec<Instruction>,
    pub jumps: Vec<JumpEdge>,
    pub labels: BTreeMap<usize, String>,
    pub functions: BTreeMap<usize, String>,
    pub code_sections: Vec<CodeSection>,
}

/// The code section under debug plus its disassembly. Immutable once built.
#[derive(Debug, Clone)]
pub struct Program {
    bytecode: Vec<u8>,
    disassembly: Disassembly,
    jump_targets: HashSet<usize>,
    jump_dests: HashSet<usize>,
}

impl Program {
    pub fn new(bytecode: Vec<u8>) -> Self {
        let disassembly = disassemble(&bytecode);
        Self::with_disassembly(bytecode, disassembly)
    }

    /// Build from an externally produced disassembly.
    pub fn with_disassembly(bytecode: Vec<u8>, disassembly: Disassembly) -> Self {
        let jump_targets = disassembly.jumps.iter().map(|e| e.to).collect();
        let jump_dests = disassembly
            .opcodes
            .iter()
            .filter(|i| i.bytecode == opcodes::JUMPDEST)
            .map(|i| i.addr)
            .collect();
        Self {
            bytecode,
            disassembly,
            jump_targets,
            jump_dests,
        }
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub fn disassembly(&self) -> &Disassembly {
        &self.disassembly
    }

    pub fn len(&self) -> usize {
        self.bytecode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytecode.is_empty()
    }

    pub fn sections(&self) -> &[CodeSection] {
        &self.disassembly.code_sections
    }

    /// Slice out one code section as a program of its own, addresses rebased to 0.
    pub fn section(&self, index: usize) -> Result<Program> {
        let sections = self.sections();
        let section = sections
            .get(index)
            .ok_or(DebugError::InvalidSectionIndex {
                index,
                count: sections.len(),
            })?;
        let end = section.end.min(self.bytecode.len());
        let start = section.start.min(end);
        Ok(Program::new(self.bytecode[start..end].to_vec()))
    }

    pub fn opcode_at(&self, addr: usize) -> Option<u8> {
        self.bytecode.get(addr).copied()
    }

    /// A legal destination for an indirect jump: a decoded `JUMPDEST`, not push data.
    pub fn is_jump_dest(&self, addr: usize) -> bool {
        self.jump_dests.contains(&addr)
    }

    pub fn has_static_edge_into(&self, addr: usize) -> bool {
        self.jump_targets.contains(&addr)
    }

    /// Function or label name attached to an address.
    pub fn name_at(&self, addr: usize) -> Option<&str> {
        self.disassembly
            .functions
            .get(&addr)
            .or_else(|| self.disassembly.labels.get(&addr))
            .map(String::as_str)
    }

    /// Stack words become addresses here and nowhere else.
    pub fn address_of(&self, word: &U256) -> Option<usize> {
        if word.bits() > 64 {
            return None;
        }
        let addr = usize::try_from(word.low_u64()).ok()?;
        (addr < self.bytecode.len()).then_some(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_of_bounds() {
        let program = Program::new(vec![0x60, 0x03, 0x56, 0x5b, 0x00]);
        assert_eq!(program.address_of(&U256::from(3)), Some(3));
        assert_eq!(program.address_of(&U256::from(5)), None);
        assert_eq!(program.address_of(&(U256::one() << 100)), None);
    }

    #[test]
    fn test_jump_dest_ignores_push_data() {
        // PUSH1 0x5b JUMPDEST
        let program = Program::new(vec![0x60, 0x5b, 0x5b]);
        assert!(!program.is_jump_dest(1));
        assert!(program.is_jump_dest(2));
    }

    #[test]
    fn test_section_out_of_range() {
        let program = Program::new(vec![0x00]);
        match program.section(1) {
            Err(DebugError::InvalidSectionIndex { index, count }) => {
                assert_eq!(index, 1);
                assert_eq!(count, 1);
            }
            other => panic!("unexpected: {:?}", other.map(|p| p.len())),
        }
    }
}
