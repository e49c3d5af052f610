mod protocol;
mod server;

use crate::config::{DebuggerConfig, LivenessConfig};
use crate::debugger::{Debugger, ObserverRegistry};
use crate::engine::InterpreterFactory;
use crate::error::Result;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info};

pub use protocol::{read_message, write_message, DapMessage, DapMessageContent};
pub use server::{spawn_event_pump, state_body, DapServer, Outbox};

/// Periodically drop observers that stopped answering pings.
fn spawn_reaper(
    observers: ObserverRegistry,
    liveness: LivenessConfig,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            thread::sleep(liveness.ping_interval());
            let dropped = observers.reap(liveness.dead_interval());
            if !dropped.is_empty() {
                debug!(count = dropped.len(), "reaped silent observers");
            }
        }
    })
}

/// Serve requests from `input` until disconnect or end of input.
pub fn serve<R: BufRead>(server: &mut DapServer, mut input: R) -> Result<()> {
    loop {
        match read_message(&mut input) {
            Ok(Some(msg)) => {
                if !server.handle_message(msg) {
                    info!("client disconnected");
                    break;
                }
            }
            Ok(None) => {
                info!("input closed");
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                // Malformed frame; keep the connection.
                error!(error = %e, "dropping malformed message");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

pub fn run_dap_mode(config: &DebuggerConfig) -> Result<()> {
    info!("request server starting on stdio");

    let observers = ObserverRegistry::new();
    let debugger = Debugger::new(
        config,
        Box::new(InterpreterFactory::new(config.gas_limit)),
        observers.clone(),
    )?;

    let stop = Arc::new(AtomicBool::new(false));
    spawn_reaper(observers, config.liveness, Arc::clone(&stop));

    let outbox = Outbox::new(Box::new(io::stdout()));
    let mut server = DapServer::new(debugger, outbox);
    let stdin = io::stdin();
    let result = serve(&mut server, stdin.lock());

    stop.store(true, Ordering::Relaxed);
    info!("request server exiting");
    result
}
