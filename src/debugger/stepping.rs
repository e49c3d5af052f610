/// How the engine proceeds after a suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Halt at every instruction.
    Stepping,
    /// Halt only at breakpoints.
    Free,
}

/// Controller phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running(RunMode),
    Suspended,
    Terminated,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Running(RunMode::Stepping) => "stepping",
            Phase::Running(RunMode::Free) => "running",
            Phase::Suspended => "suspended",
            Phase::Terminated => "terminated",
        }
    }
}
