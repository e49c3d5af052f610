mod disassembler;
pub mod opcodes;
mod source;
mod types;

pub use disassembler::{decode, deserialize, disassemble, metadata_start, read_immediate, serialize};
pub use source::{parse_address, parse_hex, to_hex, ProgramSource};
pub use types::{CodeSection, Disassembly, Instruction, JumpEdge, Program};
