use evm_debugger::debugger::{
    Debugger, DynamicJump, Notification, ObserverRegistry, Phase, Predictor, StepOutcome,
};
use evm_debugger::engine::{ExitStatus, InterpreterFactory};
use evm_debugger::error::DebugError;
use evm_debugger::program::parse_hex;
use primitive_types::U256;
use std::sync::mpsc::Receiver;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

// Helper to build a debugger over hex bytecode with one registered observer
fn debugger_with_observer(hex: &str) -> (Debugger, Receiver<Notification>) {
    let observers = ObserverRegistry::new();
    let (_, rx) = observers.register();
    let debugger = Debugger::from_bytes(
        parse_hex(hex).expect("valid hex"),
        Vec::new(),
        0,
        Box::new(InterpreterFactory::default()),
        observers,
        Predictor::default(),
    )
    .expect("debugger should build");
    (debugger, rx)
}

// Helper to start a session and wait for the first halt
fn started(hex: &str) -> (Debugger, Receiver<Notification>) {
    let (mut debugger, rx) = debugger_with_observer(hex);
    debugger.start().expect("session should start");
    let first = debugger
        .wait_for_halt(WAIT)
        .expect("wait")
        .expect("first halt");
    assert_eq!(first.pc(), Some(0));
    (debugger, rx)
}

fn halted_pc(outcome: &StepOutcome) -> usize {
    match outcome {
        StepOutcome::Halted(snapshot) => snapshot.pc,
        other => panic!("expected a halt, got {:?}", other),
    }
}

fn kinds(rx: &Receiver<Notification>) -> Vec<&'static str> {
    rx.try_iter().map(|n| n.kind()).collect()
}

// JUMPDEST; PUSH1 0; JUMP. Never exits under a gas limit this large.
fn free_running_loop() -> Debugger {
    let mut debugger = Debugger::from_bytes(
        parse_hex("5b600056").expect("valid hex"),
        Vec::new(),
        0,
        Box::new(InterpreterFactory::new(u64::MAX)),
        ObserverRegistry::new(),
        Predictor::default(),
    )
    .expect("debugger should build");
    debugger.start().expect("session should start");
    debugger.wait_for_halt(WAIT).expect("wait").expect("first halt");
    debugger.run().expect("run");
    debugger
}

#[cfg(test)]
mod stepping_tests {
    use super::*;

    #[test]
    fn test_steps_visit_each_instruction_once() {
        // PUSH1 1; PUSH1 2; ADD; JUMPDEST; STOP
        let (debugger, _rx) = started("6001600201 5b00");

        let mut pcs = vec![0];
        loop {
            match debugger.step().expect("step") {
                StepOutcome::Halted(snapshot) => pcs.push(snapshot.pc),
                StepOutcome::Terminated(info) => {
                    assert_eq!(info.status, Some(ExitStatus::Stopped));
                    break;
                }
            }
        }
        assert_eq!(pcs, vec![0, 2, 4, 5, 6]);
    }

    #[test]
    fn test_step_after_exit_reports_termination() {
        let (debugger, _rx) = started("00");
        assert!(debugger.step().expect("step").is_terminated());

        // Further steps keep reporting the exit instead of failing.
        for _ in 0..3 {
            match debugger.step() {
                Ok(StepOutcome::Terminated(info)) => {
                    assert_eq!(info.status, Some(ExitStatus::Stopped));
                    assert!(!info.abandoned);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            debugger.state().expect("state").phase,
            Phase::Terminated
        );
    }

    #[test]
    fn test_step_reports_real_stack() {
        // PUSH1 1; PUSH1 2; SWAP1; DUP1; POP; STOP
        let (debugger, _rx) = started("6001 6002 90 80 50 00");
        debugger.step().expect("step");
        let at_swap = debugger.step().expect("step");
        assert_eq!(halted_pc(&at_swap), 4);

        let state = debugger.state().expect("state");
        let snapshot = state.snapshot.expect("snapshot");
        // The look-ahead replays SWAP1/DUP1/POP on its own copy.
        assert_eq!(snapshot.stack, vec![U256::from(1), U256::from(2)]);
        assert!(state.lookahead.expect("lookahead").trace.len() >= 3);

        match debugger.step().expect("step") {
            StepOutcome::Halted(after) => {
                assert_eq!(after.pc, 5);
                assert_eq!(after.stack, vec![U256::from(2), U256::from(1)]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_return_value_and_gas() {
        // PUSH1 0x2a; PUSH1 0; MSTORE; PUSH1 0x20; PUSH1 0; RETURN
        let (debugger, rx) = started("602a 6000 52 6020 6000 f3");
        debugger.run().expect("run");
        match debugger.wait_for_halt(WAIT).expect("wait") {
            Some(StepOutcome::Terminated(info)) => {
                assert_eq!(info.status, Some(ExitStatus::Returned));
                assert_eq!(info.return_value.len(), 32);
                assert_eq!(info.return_value[31], 0x2a);
                assert_eq!(info.gas_used, 6 * 3);
            }
            other => panic!("unexpected {:?}", other),
        }

        let exit = rx.try_iter().find(|n| n.kind() == "exit").expect("exit");
        match exit {
            Notification::Exit { status, .. } => assert_eq!(status, "returned"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_engine_fault_is_an_exit() {
        // JUMP with an empty stack
        let (debugger, rx) = started("56");
        match debugger.step().expect("step") {
            StepOutcome::Terminated(info) => {
                assert_eq!(info.status, None);
                assert!(info.error.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
        match rx.try_iter().last() {
            Some(Notification::Exit { status, error, .. }) => {
                assert_eq!(status, "failed");
                assert!(error.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_run_after_termination_is_invalid() {
        let (debugger, _rx) = started("00");
        debugger.run().expect("run");
        debugger.wait_for_halt(WAIT).expect("wait");
        assert!(matches!(debugger.run(), Err(DebugError::InvalidState(_))));
    }
}

#[cfg(test)]
mod breakpoint_tests {
    use super::*;

    #[test]
    fn test_run_halts_exactly_at_breakpoint() {
        let (debugger, rx) = started("5b5b5b5b00");
        debugger.add_breakpoint(3).expect("add");
        debugger.run().expect("run");

        let halt = debugger.wait_for_halt(WAIT).expect("wait").expect("halt");
        assert_eq!(halted_pc(&halt), 3);
        assert_eq!(debugger.state().expect("state").phase, Phase::Suspended);

        debugger.run().expect("run");
        let end = debugger.wait_for_halt(WAIT).expect("wait").expect("end");
        assert!(end.is_terminated());

        assert_eq!(kinds(&rx), vec!["step", "breakpoint", "exit"]);
    }

    #[test]
    fn test_run_halts_at_first_breakpoint_reached() {
        let (debugger, rx) = started("5b5b5b5b00");
        debugger.add_breakpoint(3).expect("add");
        debugger.add_breakpoint(1).expect("add");

        debugger.run().expect("run");
        let halt = debugger.wait_for_halt(WAIT).expect("wait").expect("halt");
        assert_eq!(halted_pc(&halt), 1);

        debugger.run().expect("run");
        let halt = debugger.wait_for_halt(WAIT).expect("wait").expect("halt");
        assert_eq!(halted_pc(&halt), 3);

        debugger.run().expect("run");
        let end = debugger.wait_for_halt(WAIT).expect("wait").expect("end");
        assert!(end.is_terminated());

        assert_eq!(kinds(&rx), vec!["step", "breakpoint", "breakpoint", "exit"]);
    }

    #[test]
    fn test_step_onto_breakpoint_notifies_once() {
        let (debugger, rx) = started("5b5b00");
        debugger.add_breakpoint(1).expect("add");
        let halt = debugger.step().expect("step");
        assert_eq!(halted_pc(&halt), 1);

        let seen: Vec<Notification> = rx.try_iter().collect();
        assert_eq!(
            seen,
            vec![Notification::Step { pc: 0 }, Notification::Breakpoint { pc: 1 }]
        );
    }

    #[test]
    fn test_removed_breakpoint_is_not_hit() {
        let (debugger, rx) = started("5b5b5b00");
        debugger.add_breakpoint(2).expect("add");
        debugger.remove_breakpoint(2).expect("remove");
        debugger.run().expect("run");
        assert!(debugger
            .wait_for_halt(WAIT)
            .expect("wait")
            .expect("end")
            .is_terminated());
        assert_eq!(kinds(&rx), vec!["step", "exit"]);
    }

    #[test]
    fn test_breakpoints_listed_sorted() {
        let (debugger, _rx) = started("5b5b5b5b00");
        for addr in [3, 1, 2, 1] {
            debugger.add_breakpoint(addr).expect("add");
        }
        assert_eq!(debugger.state().expect("state").breakpoints, vec![1, 2, 3]);
    }

    #[test]
    fn test_breakpoint_ignored_after_exit() {
        let (debugger, _rx) = started("00");
        debugger.step().expect("step");
        debugger.add_breakpoint(0).expect("add");
        assert!(debugger.state().expect("state").breakpoints.is_empty());
    }
}

#[cfg(test)]
mod lookahead_tests {
    use super::*;

    #[test]
    fn test_static_jump_is_not_recorded() {
        // PUSH1 0x03; JUMP; JUMPDEST; STOP
        let (debugger, _rx) = started("600356 5b00");
        loop {
            assert!(debugger.state().expect("state").dynamic_jumps.is_empty());
            if debugger.step().expect("step").is_terminated() {
                break;
            }
        }
    }

    #[test]
    fn test_computed_jump_is_recorded() {
        // PUSH1 0x07; DUP1; POP; JUMP; STOP; STOP; JUMPDEST; STOP
        let (debugger, _rx) = started("6007 80 50 56 00 00 5b 00");
        let expected = vec![DynamicJump {
            address: 7,
            discovered_from: 4,
            is_dynamic: true,
        }];
        assert_eq!(debugger.state().expect("state").dynamic_jumps, expected);

        // Seeing the same jump again does not add a second record.
        debugger.step().expect("step");
        assert_eq!(debugger.state().expect("state").dynamic_jumps, expected);

        let program = debugger.program();
        for jump in &debugger.state().expect("state").dynamic_jumps {
            assert!(!program.has_static_edge_into(jump.address));
            assert!(program.is_jump_dest(jump.address));
        }

        debugger.run().expect("run");
        match debugger.wait_for_halt(WAIT).expect("wait") {
            Some(StepOutcome::Terminated(info)) => {
                assert_eq!(info.status, Some(ExitStatus::Stopped))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_lookahead_stops_at_arithmetic() {
        // PUSH1 1; PUSH1 2; ADD; PUSH1 0x09; JUMP; STOP; JUMPDEST
        let (debugger, _rx) = started("6001 6002 01 6009 56 00 5b");
        let state = debugger.state().expect("state");
        let prediction = state.lookahead.expect("lookahead");
        assert_eq!(prediction.trace.len(), 2);
        assert!(prediction.discovered.is_empty());
        assert!(state.dynamic_jumps.is_empty());
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    // Section 0: the computed jump program followed by RETURN INVALID.
    // Section 1: JUMPDEST STOP.
    const TWO_SECTIONS: &str = "6007 80 50 56 00 00 5b 00 f3 fe 5b 00";

    #[test]
    fn test_sections_listed() {
        let (debugger, _rx) = debugger_with_observer(TWO_SECTIONS);
        let sections = debugger.sections();
        assert_eq!(sections.len(), 2);
        assert_eq!((sections[0].start, sections[0].end), (0, 11));
        assert_eq!((sections[1].start, sections[1].end), (11, 13));

        let loaded = debugger.load();
        assert_eq!(loaded.section, 0);
        assert_eq!(loaded.bytecode.len(), 11);
    }

    #[test]
    fn test_section_change_resets_session_state() {
        let (mut debugger, _rx) = started(TWO_SECTIONS);
        debugger.add_breakpoint(2).expect("add");
        assert_eq!(debugger.state().expect("state").dynamic_jumps.len(), 1);

        debugger.change_section(1).expect("change");
        let first = debugger.wait_for_halt(WAIT).expect("wait").expect("halt");
        match first {
            StepOutcome::Halted(snapshot) => {
                assert_eq!(snapshot.pc, 0);
                assert_eq!(snapshot.opcode, 0x5b);
            }
            other => panic!("unexpected {:?}", other),
        }

        let state = debugger.state().expect("state");
        assert!(state.dynamic_jumps.is_empty());
        assert!(state.breakpoints.is_empty());
        assert_eq!(debugger.section(), 1);
        assert_eq!(debugger.program().len(), 2);
    }

    #[test]
    fn test_bad_section_leaves_session_alone() {
        let (mut debugger, _rx) = started(TWO_SECTIONS);
        debugger.add_breakpoint(2).expect("add");
        assert!(matches!(
            debugger.change_section(7),
            Err(DebugError::InvalidSectionIndex { index: 7, count: 2 })
        ));
        assert_eq!(debugger.section(), 0);
        assert_eq!(debugger.state().expect("state").breakpoints, vec![2]);
    }

    #[test]
    fn test_restart_after_exit() {
        let (mut debugger, rx) = started("5b00");
        debugger.run().expect("run");
        assert!(debugger
            .wait_for_halt(WAIT)
            .expect("wait")
            .expect("end")
            .is_terminated());

        debugger.restart().expect("restart");
        let first = debugger.wait_for_halt(WAIT).expect("wait").expect("halt");
        assert_eq!(first.pc(), Some(0));
        assert_eq!(kinds(&rx), vec!["step", "exit", "step"]);
    }

    #[test]
    fn test_restart_mid_run_sends_no_exit() {
        let (mut debugger, rx) = started("5b5b00");
        debugger.step().expect("step");
        debugger.restart().expect("restart");
        debugger.wait_for_halt(WAIT).expect("wait");
        // The abandoned run is torn down silently.
        assert_eq!(kinds(&rx), vec!["step", "step", "step"]);
    }

    #[test]
    fn test_unavailable_engine_reported() {
        let mut debugger = Debugger::from_bytes(
            vec![0x00],
            Vec::new(),
            0,
            Box::new(InterpreterFactory::new(0)),
            ObserverRegistry::new(),
            Predictor::default(),
        )
        .expect("debugger should build");
        assert!(matches!(
            debugger.start(),
            Err(DebugError::EngineUnavailable(_))
        ));
        assert!(!debugger.has_session());
    }
}

#[cfg(test)]
mod free_run_tests {
    use super::*;
    use evm_debugger::debugger::RunMode;
    use std::thread;

    #[test]
    fn test_step_rejected_while_free_running() {
        let debugger = free_running_loop();
        assert!(matches!(debugger.step(), Err(DebugError::InvalidState(_))));
        assert_eq!(
            debugger.state().expect("state").phase,
            Phase::Running(RunMode::Free)
        );
    }

    #[test]
    fn test_second_waiter_rejected() {
        let debugger = free_running_loop();

        let (first, second) = thread::scope(|scope| {
            let first = scope.spawn(|| debugger.wait_for_halt(Duration::from_secs(2)));
            let second = scope.spawn(|| {
                thread::sleep(Duration::from_millis(100));
                debugger.wait_for_halt(Duration::from_millis(100))
            });
            (
                first.join().expect("first waiter"),
                second.join().expect("second waiter"),
            )
        });

        assert!(matches!(first, Ok(None)));
        assert!(matches!(second, Err(DebugError::InvalidState(_))));

        // The timed-out waiter gives the gate back.
        assert!(matches!(
            debugger.wait_for_halt(Duration::from_millis(10)),
            Ok(None)
        ));
    }
}
