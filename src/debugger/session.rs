use super::controller::{Controller, DebuggerState, StepOutcome};
use super::observers::ObserverRegistry;
use super::predictor::Predictor;
use crate::config::DebuggerConfig;
use crate::engine::EngineFactory;
use crate::error::{DebugError, Result};
use crate::program::{CodeSection, Disassembly, Program};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// What the request boundary hands out for `loadProgram`.
#[derive(Debug, Clone)]
pub struct LoadedProgram {
    pub bytecode: Vec<u8>,
    pub disassembly: Disassembly,
    pub section: usize,
    pub sections: Vec<CodeSection>,
}

/// Owns the full input bytes and at most one live [`Controller`].
///
/// Switching section or restarting always abandons the live session first,
/// so dynamic jump records and breakpoints never outlive the code they refer to.
pub struct Debugger {
    full: Program,
    section: usize,
    program: Arc<Program>,
    payload: Vec<u8>,
    factory: Box<dyn EngineFactory>,
    observers: ObserverRegistry,
    predictor: Predictor,
    session: Option<Controller>,
}

impl Debugger {
    pub fn new(
        config: &DebuggerConfig,
        factory: Box<dyn EngineFactory>,
        observers: ObserverRegistry,
    ) -> Result<Self> {
        let bytes = config.program.load()?;
        let payload = config.payload_bytes()?;
        Self::from_bytes(
            bytes,
            payload,
            config.section,
            factory,
            observers,
            Predictor::new(config.lookahead_depth),
        )
    }

    pub fn from_bytes(
        bytes: Vec<u8>,
        payload: Vec<u8>,
        section: usize,
        factory: Box<dyn EngineFactory>,
        observers: ObserverRegistry,
        predictor: Predictor,
    ) -> Result<Self> {
        let full = Program::new(bytes);
        let program = Arc::new(full.section(section)?);
        info!(
            bytes = full.len(),
            sections = full.sections().len(),
            section,
            "program loaded"
        );
        Ok(Self {
            full,
            section,
            program,
            payload,
            factory,
            observers,
            predictor,
            session: None,
        })
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn section(&self) -> usize {
        self.section
    }

    pub fn sections(&self) -> &[CodeSection] {
        self.full.sections()
    }

    pub fn load(&self) -> LoadedProgram {
        LoadedProgram {
            bytecode: self.program.bytecode().to_vec(),
            disassembly: self.program.disassembly().clone(),
            section: self.section,
            sections: self.full.sections().to_vec(),
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    fn discard(&mut self) {
        if let Some(session) = self.session.take() {
            session.abandon();
        }
    }

    /// Start (or restart) a session on the current section.
    pub fn start(&mut self) -> Result<()> {
        self.discard();
        let controller = Controller::start(
            Arc::clone(&self.program),
            self.payload.clone(),
            self.factory.as_ref(),
            self.observers.clone(),
            self.predictor,
        )?;
        self.session = Some(controller);
        Ok(())
    }

    pub fn restart(&mut self) -> Result<()> {
        info!(section = self.section, "restarting session");
        self.start()
    }

    pub fn change_section(&mut self, index: usize) -> Result<()> {
        let program = self.full.section(index)?;
        self.discard();
        info!(section = index, bytes = program.len(), "code section changed");
        self.section = index;
        self.program = Arc::new(program);
        self.start()
    }

    fn active(&self) -> Result<&Controller> {
        self.session.as_ref().ok_or(DebugError::NoActiveSession)
    }

    pub fn controller(&self) -> Result<&Controller> {
        self.active()
    }

    pub fn step(&self) -> Result<StepOutcome> {
        self.active()?.step()
    }

    pub fn run(&self) -> Result<()> {
        self.active()?.run()
    }

    pub fn wait_for_halt(&self, timeout: Duration) -> Result<Option<StepOutcome>> {
        self.active()?.wait_for_halt(timeout)
    }

    pub fn add_breakpoint(&self, addr: usize) -> Result<()> {
        self.active()?.add_breakpoint(addr);
        Ok(())
    }

    pub fn remove_breakpoint(&self, addr: usize) -> Result<()> {
        self.active()?.remove_breakpoint(addr);
        Ok(())
    }

    pub fn state(&self) -> Result<DebuggerState> {
        Ok(self.active()?.state())
    }
}
