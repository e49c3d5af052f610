//! Interactive single-instruction debugger for EVM bytecode.
//!
//! A run-to-completion engine is driven one instruction at a time through a
//! suspension callback. The [`debugger`] module owns sessions, breakpoints
//! and the stack-only look-ahead; [`dap`] and [`console`] are the two front ends.

pub mod config;
pub mod console;
pub mod dap;
pub mod debugger;
pub mod engine;
pub mod error;
pub mod logging;
pub mod program;
