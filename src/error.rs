use std::io;
use thiserror::Error;

/// Failures surfaced at the request boundary.
///
/// Predictor stop conditions (invalid jump target, unmodeled opcode) are not
/// errors and never show up here; see `debugger::predictor::StopReason`.
#[derive(Debug, Error)]
pub enum DebugError {
    #[error("execution engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("no active session")]
    NoActiveSession,

    #[error("invalid section index {index} ({count} sections)")]
    InvalidSectionIndex { index: usize, count: usize },

    #[error("invalid hex input: {0}")]
    InvalidHex(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DebugError {
    /// Stable name used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            DebugError::EngineUnavailable(_) => "EngineUnavailable",
            DebugError::InvalidState(_) => "InvalidState",
            DebugError::NoActiveSession => "NoActiveSession",
            DebugError::InvalidSectionIndex { .. } => "InvalidSectionIndex",
            DebugError::InvalidHex(_) => "InvalidHex",
            DebugError::Config(_) => "Config",
            DebugError::Protocol(_) => "Protocol",
            DebugError::Io(_) => "Io",
        }
    }
}

pub type Result<T> = std::result::Result<T, DebugError>;
