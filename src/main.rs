use clap::Parser;
use evm_debugger::config::{Args, DebuggerConfig};
use evm_debugger::debugger::{Debugger, ObserverRegistry};
use evm_debugger::engine::InterpreterFactory;
use evm_debugger::{console, dap, logging};
use std::io;
use std::process::ExitCode;
use tracing::{error, info};

fn run(args: &Args) -> evm_debugger::error::Result<()> {
    let config = DebuggerConfig::from_args(args)?;
    logging::init(config.log_file.as_deref())?;
    info!(dap = args.dap, "debugger started");

    if args.dap {
        dap::run_dap_mode(&config)?;
    } else {
        let mut debugger = Debugger::new(
            &config,
            Box::new(InterpreterFactory::new(config.gas_limit)),
            ObserverRegistry::new(),
        )?;
        let stdin = io::stdin();
        console::run_console(&mut debugger, stdin.lock(), io::stdout())?;
    }

    info!("debugger exiting");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = e.kind(), "{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
