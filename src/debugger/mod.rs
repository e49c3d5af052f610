mod breakpoints;
mod controller;
mod gate;
mod observers;
mod predictor;
mod session;
mod stepping;

pub use breakpoints::Breakpoints;
pub use controller::{Controller, DebuggerState, ExitInfo, StepOutcome};
pub use gate::{gate, GateReceiver, GateSender};
pub use observers::{
    Notification, ObserverId, ObserverRegistry, DEFAULT_DEAD_INTERVAL, DEFAULT_PING_INTERVAL,
};
pub use predictor::{
    DynamicJump, DynamicJumps, LookaheadStep, Prediction, Predictor, StopReason, DEFAULT_LOOKAHEAD,
};
pub use session::{Debugger, LoadedProgram};
pub use stepping::{Phase, RunMode};
