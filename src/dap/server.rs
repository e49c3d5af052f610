use super::protocol::{write_message, DapMessage, DapMessageContent};
use crate::debugger::{
    Debugger, DebuggerState, Notification, ObserverId, StepOutcome,
};
use crate::error::{DebugError, Result};
use crate::program::{parse_address, serialize, to_hex};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long `launch` waits for the first instruction to suspend.
const FIRST_STOP_TIMEOUT: Duration = Duration::from_secs(2);

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Writes framed messages; shared between request handling and the event pump.
#[derive(Clone)]
pub struct Outbox {
    writer: SharedWriter,
    seq: Arc<AtomicU64>,
}

impl Outbox {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    fn send(&self, content: DapMessageContent) {
        let mut writer = match self.writer.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Sequence numbers are taken under the writer lock so they go out in order.
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let msg = DapMessage::new(seq, content);
        if let Err(e) = write_message(&mut **writer, &msg) {
            error!(error = %e, "failed to write message");
        }
    }

    pub fn send_response(
        &self,
        request_seq: u64,
        command: String,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    ) {
        self.send(DapMessageContent::Response {
            request_seq,
            success,
            command,
            message,
            body,
        });
    }

    pub fn send_event(&self, event: &str, body: Option<Value>) {
        self.send(DapMessageContent::Event {
            event: event.to_string(),
            body,
        });
    }
}

/// Forward observer notifications as protocol events until the observer is dropped.
pub fn spawn_event_pump(outbox: Outbox, rx: Receiver<Notification>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for notification in rx {
            let reason = notification.kind();
            match notification {
                Notification::Step { pc } | Notification::Breakpoint { pc } => {
                    outbox.send_event(
                        "stopped",
                        Some(json!({
                            "reason": reason,
                            "threadId": 1,
                            "allThreadsStopped": true,
                            "pc": pc,
                        })),
                    );
                }
                Notification::Exit {
                    status,
                    return_value,
                    gas_used,
                    error,
                } => {
                    let exit_code = if status == "returned" || status == "stopped" {
                        0
                    } else {
                        1
                    };
                    outbox.send_event(
                        "exited",
                        Some(json!({
                            "exitCode": exit_code,
                            "status": status,
                            "returnValue": to_hex(&return_value),
                            "gasUsed": gas_used,
                            "error": error,
                        })),
                    );
                    outbox.send_event("terminated", None);
                }
            }
        }
        debug!("event pump finished");
    })
}

pub struct DapServer {
    outbox: Outbox,
    debugger: Debugger,
    observer: ObserverId,
}

fn arg_u64(args: &Option<Value>, key: &str) -> Option<u64> {
    args.as_ref().and_then(|v| v.get(key)).and_then(Value::as_u64)
}

/// Accepts a JSON number or a decimal/hex string.
fn address_arg(value: Option<&Value>) -> Result<usize> {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| DebugError::Protocol("address must be non-negative".into())),
        Some(Value::String(s)) => parse_address(s),
        _ => Err(DebugError::Protocol("missing address".into())),
    }
}

fn outcome_body(outcome: &StepOutcome) -> Value {
    match outcome {
        StepOutcome::Halted(snapshot) => json!({
            "terminated": false,
            "pc": snapshot.pc,
            "opcode": snapshot.opcode_name,
        }),
        StepOutcome::Terminated(info) => json!({
            "terminated": true,
            "status": info.status.map(|s| s.as_str()),
            "error": info.error,
        }),
    }
}

pub fn state_body(state: &DebuggerState) -> Value {
    let lookahead = state.lookahead.as_ref().map(|p| {
        json!({
            "trace": p.trace,
            "stop": p.stop,
        })
    });
    let exit = state.exit.as_ref().map(|e| {
        json!({
            "status": e.status.map(|s| s.as_str()),
            "returnValue": to_hex(&e.return_value),
            "gasUsed": e.gas_used,
            "error": e.error,
            "abandoned": e.abandoned,
        })
    });

    match &state.snapshot {
        Some(snapshot) => json!({
            "phase": state.phase.as_str(),
            "pc": snapshot.pc,
            "opcode": { "name": snapshot.opcode_name },
            "stack": snapshot.stack.iter().map(|v| format!("{:x}", v)).collect::<Vec<_>>(),
            "memory": to_hex(&snapshot.memory),
            "memoryWordCount": format!("{:x}", snapshot.memory_word_count()),
            "dynamicJumps": state.dynamic_jumps,
            "lookahead": lookahead,
            "breakpoints": state.breakpoints,
            "exit": exit,
        }),
        None => json!({
            "phase": state.phase.as_str(),
            "pc": Value::Null,
            "dynamicJumps": state.dynamic_jumps,
            "breakpoints": state.breakpoints,
            "exit": exit,
        }),
    }
}

impl DapServer {
    /// Registers itself as an observer and starts forwarding events to `outbox`.
    pub fn new(debugger: Debugger, outbox: Outbox) -> Self {
        let (observer, rx) = debugger.observers().register();
        spawn_event_pump(outbox.clone(), rx);
        Self {
            outbox,
            debugger,
            observer,
        }
    }

    pub fn observer(&self) -> ObserverId {
        self.observer
    }

    pub fn debugger(&self) -> &Debugger {
        &self.debugger
    }

    /// Any request counts as a liveness echo. A client reaped while idle comes
    /// back as a fresh observer.
    fn touch(&mut self) {
        if self.debugger.observers().probe(self.observer) {
            return;
        }
        let (observer, rx) = self.debugger.observers().register();
        spawn_event_pump(self.outbox.clone(), rx);
        info!(old = self.observer, new = observer, "client re-registered");
        self.observer = observer;
    }

    fn respond(&self, seq: u64, command: String, result: Result<Option<Value>>) {
        match result {
            Ok(body) => self.outbox.send_response(seq, command, true, None, body),
            Err(e) => {
                warn!(command = %command, kind = e.kind(), error = %e, "request failed");
                self.outbox.send_response(
                    seq,
                    command,
                    false,
                    Some(e.kind().to_string()),
                    Some(json!({ "error": { "kind": e.kind(), "detail": e.to_string() } })),
                );
            }
        }
    }

    /// Handle one message. Returns false once the client has disconnected.
    pub fn handle_message(&mut self, msg: DapMessage) -> bool {
        let DapMessageContent::Request { command, arguments } = msg.content else {
            debug!("ignoring non-request message");
            return true;
        };
        let seq = msg.seq;
        debug!(seq, command = %command, "request");
        self.touch();

        match command.as_str() {
            "initialize" => {
                self.handle_initialize(seq, command);
            }
            "disconnect" => {
                self.debugger.observers().unregister(self.observer);
                self.respond(seq, command, Ok(None));
                return false;
            }
            _ => {
                let result = self.dispatch(&command, &arguments);
                self.respond(seq, command, result);
            }
        }
        true
    }

    fn dispatch(&mut self, command: &str, args: &Option<Value>) -> Result<Option<Value>> {
        match command {
            "configurationDone" => Ok(None),
            "loadProgram" => self.handle_load(),
            "changeSection" => {
                let index = arg_u64(args, "index")
                    .ok_or_else(|| DebugError::Protocol("missing section index".into()))?;
                self.debugger.change_section(index as usize)?;
                Ok(Some(json!({ "section": index })))
            }
            "launch" | "restart" => self.handle_launch(args),
            "next" | "stepIn" => {
                let outcome = self.debugger.step()?;
                Ok(Some(outcome_body(&outcome)))
            }
            "continue" => {
                self.debugger.run()?;
                Ok(Some(json!({ "allThreadsContinued": true })))
            }
            "addBreakpoint" => {
                let addr = address_arg(args.as_ref().and_then(|v| v.get("address")))?;
                self.debugger.add_breakpoint(addr)?;
                Ok(Some(json!({ "address": addr })))
            }
            "removeBreakpoint" => {
                let addr = address_arg(args.as_ref().and_then(|v| v.get("address")))?;
                self.debugger.remove_breakpoint(addr)?;
                Ok(Some(json!({ "address": addr })))
            }
            "setInstructionBreakpoints" => self.handle_set_breakpoints(args),
            "debuggerState" => {
                let state = self.debugger.state()?;
                Ok(Some(state_body(&state)))
            }
            "threads" => Ok(Some(json!({
                "threads": [{ "id": 1, "name": "EVM" }]
            }))),
            "stackTrace" => self.handle_stack_trace(),
            "scopes" => Ok(Some(json!({
                "scopes": [
                    { "name": "Stack", "variablesReference": 1, "expensive": false },
                    { "name": "Memory", "variablesReference": 2, "expensive": false }
                ]
            }))),
            "variables" => self.handle_variables(args),
            "ping" => Ok(Some(json!({ "pong": true }))),
            other => Err(DebugError::Protocol(format!("unhandled command '{}'", other))),
        }
    }

    fn handle_initialize(&self, seq: u64, command: String) {
        let body = json!({
            "supportsConfigurationDoneRequest": true,
            "supportsStepBack": false,
            "supportsInstructionBreakpoints": true,
            "supportsRestartRequest": true,
            "supportsFunctionBreakpoints": false,
            "supportsConditionalBreakpoints": false,
            "supportsSetVariable": false,
        });
        self.outbox.send_response(seq, command, true, None, Some(body));
        self.outbox.send_event("initialized", None);
    }

    fn handle_load(&self) -> Result<Option<Value>> {
        let loaded = self.debugger.load();
        Ok(Some(json!({
            "byteCode": to_hex(&loaded.bytecode),
            "disassembly": serialize(&loaded.disassembly)?,
            "section": loaded.section,
            "sections": loaded.sections,
        })))
    }

    fn handle_launch(&mut self, args: &Option<Value>) -> Result<Option<Value>> {
        let stop_on_entry = args
            .as_ref()
            .and_then(|v| v.get("stopOnEntry"))
            .and_then(Value::as_bool)
            .unwrap_or(true);

        self.debugger.restart()?;
        let first = self.debugger.wait_for_halt(FIRST_STOP_TIMEOUT)?;
        match &first {
            Some(outcome) => info!(pc = ?outcome.pc(), "first stop"),
            None => warn!("timed out waiting for first stop"),
        }

        if !stop_on_entry && matches!(first, Some(StepOutcome::Halted(_))) {
            self.debugger.run()?;
        }
        Ok(first.as_ref().map(outcome_body))
    }

    fn handle_set_breakpoints(&self, args: &Option<Value>) -> Result<Option<Value>> {
        let requested = args
            .as_ref()
            .and_then(|v| v.get("breakpoints"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let controller = self.debugger.controller()?;
        for addr in controller.breakpoints() {
            controller.remove_breakpoint(addr);
        }

        let program = controller.program();
        let mut verified = Vec::new();
        for bp in &requested {
            let reference = address_arg(bp.get("instructionReference"));
            let offset = bp.get("offset").and_then(Value::as_i64).unwrap_or(0);
            let resolved = reference.and_then(|base| {
                isize::try_from(offset)
                    .ok()
                    .and_then(|off| base.checked_add_signed(off))
                    .filter(|&addr| addr < program.len())
                    .ok_or_else(|| {
                        DebugError::Protocol(format!(
                            "0x{:x} offset {} is outside the program",
                            base, offset
                        ))
                    })
            });
            match resolved {
                Ok(addr) => {
                    controller.add_breakpoint(addr);
                    verified.push(json!({
                        "verified": true,
                        "instructionReference": format!("0x{:x}", addr),
                    }));
                }
                Err(e) => verified.push(json!({ "verified": false, "message": e.to_string() })),
            }
        }

        Ok(Some(json!({ "breakpoints": verified })))
    }

    fn handle_stack_trace(&self) -> Result<Option<Value>> {
        let controller = self.debugger.controller()?;
        let state = controller.state();
        let frames = match &state.snapshot {
            Some(snapshot) => {
                let name = controller
                    .program()
                    .name_at(snapshot.pc)
                    .unwrap_or("main")
                    .to_string();
                vec![json!({
                    "id": 0,
                    "name": name,
                    "line": 0,
                    "column": 0,
                    "instructionPointerReference": format!("0x{:x}", snapshot.pc),
                })]
            }
            None => Vec::new(),
        };
        Ok(Some(json!({
            "stackFrames": frames,
            "totalFrames": frames.len(),
        })))
    }

    fn handle_variables(&self, args: &Option<Value>) -> Result<Option<Value>> {
        let var_ref = arg_u64(args, "variablesReference").unwrap_or(0);
        let state = self.debugger.state()?;
        let mut variables = Vec::new();

        if let Some(snapshot) = &state.snapshot {
            match var_ref {
                1 => {
                    // Top of stack first, the way it is usually read.
                    for (depth, value) in snapshot.stack.iter().rev().enumerate() {
                        variables.push(json!({
                            "name": format!("[{}]", depth),
                            "value": format!("0x{:x}", value),
                            "variablesReference": 0
                        }));
                    }
                }
                2 => {
                    for (i, word) in snapshot.memory.chunks(32).enumerate() {
                        variables.push(json!({
                            "name": format!("0x{:x}", i * 32),
                            "value": to_hex(word),
                            "variablesReference": 0
                        }));
                    }
                }
                _ => {}
            }
        }

        Ok(Some(json!({ "variables": variables })))
    }
}
