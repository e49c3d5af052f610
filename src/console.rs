//! Line-oriented prompt for driving a session from a terminal.

use crate::debugger::{Debugger, StepOutcome};
use crate::error::{DebugError, Result};
use crate::program::{parse_address, to_hex};
use std::io::{BufRead, Write};
use std::time::Duration;
use tracing::warn;

const HELP: &str = "Commands: (s)tep, (c)ontinue/run, (b)reak <addr>, (d)elete <addr>, state, \
section <n>, restart, dis, (q)uit";

/// How long `continue` waits between checks for the next halt.
const RUN_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Step,
    Run,
    Break(usize),
    Delete(usize),
    State,
    Section(usize),
    Restart,
    Disassemble,
    Help,
    Quit,
}

/// `Ok(None)` for a blank line.
pub fn parse_command(line: &str) -> Result<Option<Command>> {
    let words = shlex::split(line)
        .ok_or_else(|| DebugError::Protocol(format!("unbalanced quotes in '{}'", line.trim())))?;
    let Some((head, rest)) = words.split_first() else {
        return Ok(None);
    };

    let address = |what: &str| -> Result<usize> {
        let arg = rest
            .first()
            .ok_or_else(|| DebugError::Protocol(format!("{} needs an address", what)))?;
        parse_address(arg)
    };

    let cmd = match head.as_str() {
        "s" | "step" | "n" | "next" => Command::Step,
        "c" | "continue" | "r" | "run" => Command::Run,
        "b" | "break" => Command::Break(address("break")?),
        "d" | "delete" => Command::Delete(address("delete")?),
        "state" | "i" | "info" => Command::State,
        "section" => Command::Section(address("section")?),
        "restart" => Command::Restart,
        "dis" | "disassemble" => Command::Disassemble,
        "h" | "help" | "?" => Command::Help,
        "q" | "quit" | "exit" => Command::Quit,
        other => return Err(DebugError::Protocol(format!("unknown command '{}'", other))),
    };
    Ok(Some(cmd))
}

fn print_outcome<W: Write>(out: &mut W, outcome: &StepOutcome) -> Result<()> {
    match outcome {
        StepOutcome::Halted(snapshot) => {
            let top = snapshot
                .stack
                .last()
                .map(|v| format!("0x{:x}", v))
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                out,
                "halted at 0x{:04x} {:<14} stack[{}] top={}",
                snapshot.pc,
                snapshot.opcode_name,
                snapshot.stack.len(),
                top
            )?;
        }
        StepOutcome::Terminated(info) => {
            let status = info.status.map(|s| s.as_str()).unwrap_or("failed");
            write!(out, "terminated: {} gas_used={}", status, info.gas_used)?;
            if !info.return_value.is_empty() {
                write!(out, " return={}", to_hex(&info.return_value))?;
            }
            if let Some(err) = &info.error {
                write!(out, " error={}", err)?;
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

fn print_state<W: Write>(out: &mut W, debugger: &Debugger) -> Result<()> {
    let state = debugger.state()?;
    writeln!(out, "phase: {}", state.phase.as_str())?;
    if let Some(snapshot) = &state.snapshot {
        writeln!(out, "pc: 0x{:x} ({})", snapshot.pc, snapshot.opcode_name)?;
        writeln!(out, "gas left: {}", snapshot.gas_left)?;
        for (depth, value) in snapshot.stack.iter().rev().enumerate() {
            writeln!(out, "  [{}] 0x{:x}", depth, value)?;
        }
        writeln!(out, "memory words: {}", snapshot.memory_word_count())?;
    }
    if let Some(prediction) = &state.lookahead {
        let path: Vec<String> = prediction
            .trace
            .iter()
            .map(|s| format!("0x{:x}:{}", s.pc, s.opcode))
            .collect();
        writeln!(out, "lookahead: {} ({:?})", path.join(" -> "), prediction.stop)?;
    }
    for jump in &state.dynamic_jumps {
        writeln!(
            out,
            "dynamic jump 0x{:x} (from 0x{:x})",
            jump.address, jump.discovered_from
        )?;
    }
    if !state.breakpoints.is_empty() {
        let list: Vec<String> = state.breakpoints.iter().map(|a| format!("0x{:x}", a)).collect();
        writeln!(out, "breakpoints: {}", list.join(", "))?;
    }
    Ok(())
}

fn print_disassembly<W: Write>(out: &mut W, debugger: &Debugger) -> Result<()> {
    let program = debugger.program();
    let disassembly = program.disassembly();
    for ins in &disassembly.opcodes {
        if let Some(label) = disassembly.labels.get(&ins.addr) {
            writeln!(out, "{}:", label)?;
        }
        let name = ins.opcode.as_deref().unwrap_or("???");
        match &ins.operand {
            Some(value) => writeln!(out, "  {:04x}  {} 0x{:x}", ins.addr, name, value)?,
            None => writeln!(out, "  {:04x}  {}", ins.addr, name)?,
        }
    }
    Ok(())
}

/// Apply one command. Returns false when the user asked to quit.
pub fn execute<W: Write>(debugger: &mut Debugger, cmd: Command, out: &mut W) -> Result<bool> {
    match cmd {
        Command::Step => {
            let outcome = debugger.step()?;
            print_outcome(out, &outcome)?;
        }
        Command::Run => {
            debugger.run()?;
            loop {
                if let Some(outcome) = debugger.wait_for_halt(RUN_POLL)? {
                    print_outcome(out, &outcome)?;
                    break;
                }
            }
        }
        Command::Break(addr) => {
            debugger.add_breakpoint(addr)?;
            writeln!(out, "breakpoint at 0x{:x}", addr)?;
        }
        Command::Delete(addr) => {
            debugger.remove_breakpoint(addr)?;
            writeln!(out, "removed breakpoint at 0x{:x}", addr)?;
        }
        Command::State => print_state(out, debugger)?,
        Command::Section(index) => {
            debugger.change_section(index)?;
            writeln!(
                out,
                "section {} of {} ({} bytes)",
                index,
                debugger.sections().len(),
                debugger.program().len()
            )?;
            if let Some(outcome) = debugger.wait_for_halt(RUN_POLL)? {
                print_outcome(out, &outcome)?;
            }
        }
        Command::Restart => {
            debugger.restart()?;
            if let Some(outcome) = debugger.wait_for_halt(RUN_POLL)? {
                print_outcome(out, &outcome)?;
            }
        }
        Command::Disassemble => print_disassembly(out, debugger)?,
        Command::Help => writeln!(out, "{}", HELP)?,
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

/// Prompt loop. Starts a session, then reads commands until quit or end of input.
pub fn run_console<R: BufRead, W: Write>(
    debugger: &mut Debugger,
    mut input: R,
    mut out: W,
) -> Result<()> {
    debugger.start()?;
    writeln!(out, "{}", HELP)?;
    if let Some(outcome) = debugger.wait_for_halt(RUN_POLL)? {
        print_outcome(&mut out, &outcome)?;
    }

    loop {
        write!(out, "> ")?;
        out.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            break;
        }

        let cmd = match parse_command(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(e) => {
                writeln!(out, "{}", e)?;
                continue;
            }
        };

        match execute(debugger, cmd, &mut out) {
            Ok(true) => {}
            Ok(false) => break,
            Err(DebugError::Io(e)) => return Err(DebugError::Io(e)),
            Err(e) => {
                warn!(kind = e.kind(), "command failed");
                writeln!(out, "error: {}", e)?;
            }
        }
    }
    Ok(())
}
