//! Pull-based stepping over a run-to-completion engine.
//!
//! The engine calls back once per instruction from its own thread. In stepping
//! mode the handler keeps the continuation instead of resuming it, which parks
//! the engine; `step()` resumes it and waits on a one-shot gate that the
//! handler fires at the very next halt (or at termination).

use super::breakpoints::Breakpoints;
use super::gate::{gate, GateSender};
use super::observers::{Notification, ObserverRegistry};
use super::predictor::{DynamicJump, DynamicJumps, Prediction, Predictor};
use super::stepping::{Phase, RunMode};
use crate::engine::{
    Continuation, EngineError, EngineFactory, ExecutionResult, ExitStatus, MachineSnapshot,
    SuspendHandler,
};
use crate::error::{DebugError, Result};
use crate::program::Program;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when the engine faulted or the session was abandoned.
    pub status: Option<ExitStatus>,
    pub return_value: Vec<u8>,
    pub gas_used: u64,
    pub error: Option<String>,
    pub abandoned: bool,
}

impl ExitInfo {
    fn abandoned() -> Self {
        Self {
            status: None,
            return_value: Vec::new(),
            gas_used: 0,
            error: None,
            abandoned: true,
        }
    }

    fn from_result(result: std::result::Result<ExecutionResult, EngineError>) -> Self {
        match result {
            Ok(r) => Self {
                status: Some(r.status),
                return_value: r.return_value,
                gas_used: r.gas_used,
                error: None,
                abandoned: false,
            },
            Err(EngineError::Abandoned) => Self::abandoned(),
            Err(EngineError::Fault(msg)) => Self {
                status: None,
                return_value: Vec::new(),
                gas_used: 0,
                error: Some(msg),
                abandoned: false,
            },
        }
    }

    fn notification(&self) -> Notification {
        Notification::Exit {
            status: self
                .status
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "failed".to_string()),
            return_value: self.return_value.clone(),
            gas_used: self.gas_used,
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Halted(MachineSnapshot),
    Terminated(ExitInfo),
}

impl StepOutcome {
    pub fn is_terminated(&self) -> bool {
        matches!(self, StepOutcome::Terminated(_))
    }

    pub fn pc(&self) -> Option<usize> {
        match self {
            StepOutcome::Halted(snapshot) => Some(snapshot.pc),
            StepOutcome::Terminated(_) => None,
        }
    }
}

/// Consolidated view published at each halt.
#[derive(Debug, Clone)]
pub struct DebuggerState {
    pub phase: Phase,
    pub snapshot: Option<MachineSnapshot>,
    pub dynamic_jumps: Vec<DynamicJump>,
    pub lookahead: Option<Prediction>,
    pub breakpoints: Vec<usize>,
    pub exit: Option<ExitInfo>,
}

struct Shared {
    phase: Phase,
    mode: RunMode,
    retained: Option<Continuation>,
    /// The single outstanding "wait for next halt" request, tagged so a timed
    /// out waiter only withdraws its own gate.
    gate: Option<(u64, GateSender<StepOutcome>)>,
    next_gate: u64,
    last: Option<MachineSnapshot>,
    lookahead: Option<Prediction>,
    jumps: DynamicJumps,
    exit: Option<ExitInfo>,
    abandoned: bool,
}

impl Shared {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            mode: RunMode::Stepping,
            retained: None,
            gate: None,
            next_gate: 0,
            last: None,
            lookahead: None,
            jumps: DynamicJumps::new(),
            exit: None,
            abandoned: false,
        }
    }

    fn arm(&mut self) -> Result<(u64, super::gate::GateReceiver<StepOutcome>)> {
        if self.gate.is_some() {
            return Err(DebugError::InvalidState("another caller is waiting for a halt"));
        }
        let (tx, rx) = gate();
        self.next_gate += 1;
        self.gate = Some((self.next_gate, tx));
        Ok((self.next_gate, rx))
    }

    fn release(&mut self, outcome: StepOutcome) {
        if let Some((_, tx)) = self.gate.take() {
            tx.fire(outcome);
        }
    }

    fn terminal(&self) -> StepOutcome {
        StepOutcome::Terminated(self.exit.clone().unwrap_or_else(ExitInfo::abandoned))
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Runs on the engine thread.
struct Handler {
    shared: Arc<Mutex<Shared>>,
    program: Arc<Program>,
    breakpoints: Breakpoints,
    predictor: Predictor,
    observers: ObserverRegistry,
}

impl SuspendHandler for Handler {
    fn on_suspend(&mut self, snapshot: MachineSnapshot, resume: Continuation) {
        let hit = self.breakpoints.contains(snapshot.pc);
        let mut s = lock(&self.shared);

        if s.abandoned {
            // Dropping the continuation ends the engine run without finishing it.
            drop(s);
            drop(resume);
            return;
        }

        if hit {
            s.mode = RunMode::Stepping;
        }
        if s.mode == RunMode::Free {
            drop(s);
            resume.resume();
            return;
        }

        let prediction =
            self.predictor
                .predict(&self.program, snapshot.pc, &snapshot.stack, &mut s.jumps);
        for jump in &prediction.discovered {
            debug!(
                target_addr = jump.address,
                from = jump.discovered_from,
                "dynamic jump predicted"
            );
        }

        s.lookahead = Some(prediction);
        s.last = Some(snapshot.clone());
        s.retained = Some(resume);
        s.phase = Phase::Suspended;

        let notification = if hit {
            info!(pc = snapshot.pc, "breakpoint hit");
            Notification::Breakpoint { pc: snapshot.pc }
        } else {
            Notification::Step { pc: snapshot.pc }
        };
        self.observers.broadcast(&notification);
        s.release(StepOutcome::Halted(snapshot));
    }
}

/// One engine invocation under interactive control.
pub struct Controller {
    shared: Arc<Mutex<Shared>>,
    breakpoints: Breakpoints,
    program: Arc<Program>,
}

impl Controller {
    /// Build an engine and start it on its own thread in stepping mode.
    ///
    /// Returns once the suspension handler is in place; it does not wait for
    /// the first instruction (see [`Controller::wait_for_halt`]).
    pub fn start(
        program: Arc<Program>,
        payload: Vec<u8>,
        factory: &dyn EngineFactory,
        observers: ObserverRegistry,
        predictor: Predictor,
    ) -> Result<Self> {
        let mut engine = factory.create()?;

        let shared = Arc::new(Mutex::new(Shared::new()));
        let breakpoints = Breakpoints::new();
        let mut handler = Handler {
            shared: Arc::clone(&shared),
            program: Arc::clone(&program),
            breakpoints: breakpoints.clone(),
            predictor,
            observers: observers.clone(),
        };

        lock(&shared).phase = Phase::Running(RunMode::Stepping);

        let engine_shared = Arc::clone(&shared);
        let engine_program = Arc::clone(&program);
        thread::Builder::new()
            .name("evm-engine".to_string())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    engine.run_program(engine_program.bytecode(), &payload, &mut handler)
                }))
                .unwrap_or_else(|_| Err(EngineError::Fault("engine panicked".to_string())));
                finish(&engine_shared, &observers, result);
            })
            .map_err(|e| {
                lock(&shared).phase = Phase::Idle;
                DebugError::EngineUnavailable(e.to_string())
            })?;

        info!(code_len = program.len(), "session started");
        Ok(Self {
            shared,
            breakpoints,
            program,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn is_terminated(&self) -> bool {
        self.phase() == Phase::Terminated
    }

    /// Execute the suspended instruction and wait for the next halt.
    ///
    /// After the engine has finished this reports the exit instead of failing.
    pub fn step(&self) -> Result<StepOutcome> {
        let rx = {
            let mut s = self.lock();
            match s.phase {
                Phase::Terminated => return Ok(s.terminal()),
                Phase::Suspended => {}
                _ => return Err(DebugError::InvalidState("step requires a suspended session")),
            }
            let Some(resume) = s.retained.take() else {
                return Err(DebugError::InvalidState("no suspended instruction"));
            };
            let (_, rx) = match s.arm() {
                Ok(armed) => armed,
                Err(e) => {
                    s.retained = Some(resume);
                    return Err(e);
                }
            };
            s.mode = RunMode::Stepping;
            s.phase = Phase::Running(RunMode::Stepping);
            drop(s);
            resume.resume();
            rx
        };

        Ok(rx.wait().unwrap_or_else(|| self.lock().terminal()))
    }

    /// Switch to free running and let the engine go. Does not wait.
    pub fn run(&self) -> Result<()> {
        let resume = {
            let mut s = self.lock();
            match s.phase {
                Phase::Suspended | Phase::Running(RunMode::Stepping) => {}
                Phase::Terminated => {
                    return Err(DebugError::InvalidState("session has terminated"))
                }
                _ => return Err(DebugError::InvalidState("session is not halted or stepping")),
            }
            s.mode = RunMode::Free;
            s.phase = Phase::Running(RunMode::Free);
            s.retained.take()
        };
        debug!("free run");
        if let Some(resume) = resume {
            resume.resume();
        }
        Ok(())
    }

    /// Block until the session is suspended or terminated, or until `timeout`
    /// passes (`Ok(None)`).
    pub fn wait_for_halt(&self, timeout: Duration) -> Result<Option<StepOutcome>> {
        let (id, rx) = {
            let mut s = self.lock();
            match s.phase {
                Phase::Suspended => {
                    if let Some(snapshot) = s.last.clone() {
                        return Ok(Some(StepOutcome::Halted(snapshot)));
                    }
                }
                Phase::Terminated => return Ok(Some(s.terminal())),
                Phase::Idle => return Err(DebugError::InvalidState("session not started")),
                Phase::Running(_) => {}
            }
            s.arm()?
        };

        match rx.wait_timeout(timeout) {
            Ok(Some(outcome)) => Ok(Some(outcome)),
            Ok(None) => Ok(Some(self.lock().terminal())),
            Err(_) => {
                let mut s = self.lock();
                if matches!(s.gate, Some((current, _)) if current == id) {
                    s.gate = None;
                }
                Ok(None)
            }
        }
    }

    /// Takes effect from the next instruction; ignored once terminated.
    pub fn add_breakpoint(&self, addr: usize) {
        if self.is_terminated() {
            warn!(addr, "breakpoint ignored, session has terminated");
            return;
        }
        self.breakpoints.add(addr);
    }

    pub fn remove_breakpoint(&self, addr: usize) {
        self.breakpoints.remove(addr);
    }

    pub fn breakpoints(&self) -> Vec<usize> {
        self.breakpoints.addresses()
    }

    pub fn state(&self) -> DebuggerState {
        let s = self.lock();
        DebuggerState {
            phase: s.phase,
            snapshot: s.last.clone(),
            dynamic_jumps: s.jumps.to_vec(),
            lookahead: s.lookahead.clone(),
            breakpoints: self.breakpoints.addresses(),
            exit: s.exit.clone(),
        }
    }

    /// Tear the session down without resuming the engine.
    pub fn abandon(&self) {
        let mut s = self.lock();
        if s.abandoned {
            return;
        }
        s.abandoned = true;
        // Dropping the continuation unparks the engine with `Abandoned`.
        drop(s.retained.take());
        if s.phase != Phase::Terminated {
            s.phase = Phase::Terminated;
            s.exit = Some(ExitInfo::abandoned());
        }
        let outcome = s.terminal();
        s.release(outcome);
        info!("session abandoned");
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.abandon();
    }
}

fn finish(
    shared: &Mutex<Shared>,
    observers: &ObserverRegistry,
    result: std::result::Result<ExecutionResult, EngineError>,
) {
    let mut s = lock(shared);
    if s.abandoned {
        debug!("engine thread exiting after abandon");
        return;
    }

    let info = ExitInfo::from_result(result);
    match &info.error {
        Some(msg) => error!(error = %msg, "engine failed"),
        None => info!(
            status = info.status.map(|st| st.as_str()).unwrap_or("none"),
            gas_used = info.gas_used,
            "engine finished"
        ),
    }

    s.phase = Phase::Terminated;
    s.retained = None;
    s.exit = Some(info.clone());
    observers.broadcast(&info.notification());
    s.release(StepOutcome::Terminated(info));
}
