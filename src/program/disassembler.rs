use super::opcodes::{self, EQ, INVALID, JUMP, JUMPDEST, JUMPI, PUSH4, RETURN};
use super::types::{CodeSection, Disassembly, Instruction, JumpEdge};
use crate::error::{DebugError, Result};
use primitive_types::U256;
use std::collections::{BTreeMap, HashSet};

/// Decode raw bytecode into instructions, static jump edges, names and code sections.
pub fn disassemble(bytes: &[u8]) -> Disassembly {
    let opcodes = decode(bytes);

    let dests: HashSet<usize> = opcodes
        .iter()
        .filter(|i| i.bytecode == JUMPDEST)
        .map(|i| i.addr)
        .collect();

    let jumps = static_jumps(&opcodes, &dests);
    let labels = dests
        .iter()
        .map(|&addr| (addr, format!("label_0x{:x}", addr)))
        .collect();
    let functions = dispatch_targets(&opcodes, &dests);
    let code_sections = code_sections(bytes, &opcodes);

    Disassembly {
        opcodes,
        jumps,
        labels,
        functions,
        code_sections,
    }
}

/// Linear sweep. Push immediates are data and never decoded as opcodes.
pub fn decode(bytes: &[u8]) -> Vec<Instruction> {
    let mut out = Vec::new();
    let mut pc = 0usize;

    while pc < bytes.len() {
        let op = bytes[pc];
        let width = opcodes::immediate_width(op);
        let operand = if width > 0 {
            Some(read_immediate(bytes, pc + 1, width))
        } else {
            None
        };

        out.push(Instruction {
            addr: pc,
            bytecode: op,
            opcode: opcodes::mnemonic(op).map(str::to_string),
            operand,
        });

        pc += 1 + width;
    }

    out
}

/// Read a `width`-byte big-endian immediate; bytes past the end read as zero.
pub fn read_immediate(bytes: &[u8], start: usize, width: usize) -> U256 {
    let mut buf = [0u8; 32];
    for i in 0..width.min(32) {
        buf[32 - width + i] = bytes.get(start + i).copied().unwrap_or(0);
    }
    U256::from_big_endian(&buf)
}

fn static_jumps(opcodes: &[Instruction], dests: &HashSet<usize>) -> Vec<JumpEdge> {
    let mut edges = Vec::new();
    for pair in opcodes.windows(2) {
        let (push, jump) = (&pair[0], &pair[1]);
        if jump.bytecode != JUMP && jump.bytecode != JUMPI {
            continue;
        }
        let Some(target) = push.operand.as_ref().and_then(word_to_addr) else {
            continue;
        };
        if dests.contains(&target) {
            edges.push(JumpEdge {
                from: jump.addr,
                to: target,
            });
        }
    }
    edges
}

/// Selector dispatch: `PUSH4 sel EQ PUSHk dest JUMPI`.
fn dispatch_targets(opcodes: &[Instruction], dests: &HashSet<usize>) -> BTreeMap<usize, String> {
    let mut functions = BTreeMap::new();
    for w in opcodes.windows(4) {
        if w[0].bytecode != PUSH4 || w[1].bytecode != EQ || w[3].bytecode != JUMPI {
            continue;
        }
        let (Some(selector), Some(dest)) = (
            w[0].operand.as_ref(),
            w[2].operand.as_ref().and_then(word_to_addr),
        ) else {
            continue;
        };
        if dests.contains(&dest) {
            functions.insert(dest, format!("fn_0x{:08x}", selector.low_u32()));
        }
    }
    functions
}

fn code_sections(bytes: &[u8], opcodes: &[Instruction]) -> Vec<CodeSection> {
    let code_end = metadata_start(bytes).unwrap_or(bytes.len());

    let mut boundaries = Vec::new();
    for pair in opcodes.windows(2) {
        if pair[1].addr >= code_end {
            break;
        }
        if pair[0].bytecode == RETURN && pair[1].bytecode == INVALID {
            boundaries.push(pair[1].addr + 1);
        }
    }

    let mut sections = Vec::with_capacity(boundaries.len() + 1);
    let mut start = 0usize;
    for boundary in boundaries {
        if boundary >= code_end {
            break;
        }
        sections.push(CodeSection {
            start,
            end: boundary,
        });
        start = boundary;
    }
    sections.push(CodeSection {
        start,
        end: code_end.max(start),
    });
    sections
}

/// Offset of a trailing CBOR metadata blob (Solidity appends one after the runtime code).
pub fn metadata_start(bytes: &[u8]) -> Option<usize> {
    let n = bytes.len();
    if n < 2 {
        return None;
    }
    let len = u16::from_be_bytes([bytes[n - 2], bytes[n - 1]]) as usize;
    if len == 0 || len + 2 > n {
        return None;
    }
    let start = n - 2 - len;
    (0xa1..=0xa7).contains(&bytes[start]).then_some(start)
}

fn word_to_addr(word: &U256) -> Option<usize> {
    if word.bits() > 64 {
        return None;
    }
    usize::try_from(word.low_u64()).ok()
}

/// Transport form of a disassembly.
pub fn serialize(disassembly: &Disassembly) -> Result<String> {
    serde_json::to_string(disassembly).map_err(|e| DebugError::Protocol(e.to_string()))
}

pub fn deserialize(text: &str) -> Result<Disassembly> {
    serde_json::from_str(text).map_err(|e| DebugError::Protocol(e.to_string()))
}
