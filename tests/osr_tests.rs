//! Integration tests for on-stack replacement and debugger breaks

mod common;
use common::{eager_config, engine_with, sum_loop};
use quicktier::scenarios;
use quicktier::{BreakEvent, DebugAction, DeoptReason, Engine, EngineConfig, RecordingListener, Tier, Value};

mod osr {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_hot_loop_transfers_mid_invocation() {
        let (mut engine, sum) = engine_with(sum_loop("sum"), eager_config());
        assert_eq!(engine.call(sum, &[Value::Smi(100)]).unwrap(), Value::Smi(4950));

        let stats = engine.stats();
        assert_eq!(stats.osr_compiles, 1);
        assert_eq!(stats.osr_transfers, 1);
        // The exit branch was never taken before the transfer
        assert_eq!(stats.deopts_for(DeoptReason::Unreachable), 1);
        // OSR only changes the running invocation
        assert_eq!(engine.tier(sum), Tier::Interpreted);
        // and the exit deopt invalidated the OSR code
        assert!(!engine.snapshot(sum).unwrap().has_osr_code);
    }

    #[test]
    fn test_short_loop_stays_interpreted() {
        let (mut engine, sum) = engine_with(sum_loop("sum"), eager_config());
        assert_eq!(engine.call(sum, &[Value::Smi(5)]).unwrap(), Value::Smi(10));
        assert_eq!(engine.stats().osr_compiles, 0);
    }

    #[test]
    fn test_never_optimize_blocks_osr() {
        let (mut engine, sum) = engine_with(sum_loop("sum"), eager_config());
        engine.never_optimize(sum);
        assert_eq!(engine.call(sum, &[Value::Smi(100)]).unwrap(), Value::Smi(4950));
        assert_eq!(engine.stats().osr_compiles, 0);
        assert_eq!(engine.stats().osr_transfers, 0);
    }

    #[test]
    fn test_loop_results_agree_with_interpreter() {
        let (mut reference, plain) = engine_with(sum_loop("sum"), eager_config());
        reference.never_optimize(plain);
        let (mut engine, sum) = engine_with(sum_loop("sum"), eager_config());
        for n in [0, 1, 17, 64, 250] {
            let expected = reference.call(plain, &[Value::Smi(n)]).unwrap();
            assert_eq!(engine.call(sum, &[Value::Smi(n)]).unwrap(), expected, "sum({})", n);
        }
    }

    #[test]
    fn test_explicit_request_in_every_iteration() {
        let report = scenarios::find("osr-sum").unwrap().run(EngineConfig::default()).unwrap();
        let failures: Vec<_> = report.failures().collect();
        assert!(failures.is_empty(), "{:#?}", failures);
        assert!(report.stats.osr_transfers >= 1);
    }

    #[test]
    fn test_tail_after_osr_loop_runs_interpreted() {
        let report = scenarios::find("osr-then-deopt").unwrap().run(EngineConfig::default()).unwrap();
        assert!(report.passed(), "{}", report);
        assert!(report.stats.deopts_for(DeoptReason::Unreachable) >= 1);
    }
}

mod breaks {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_break_at_function_entry() {
        let (mut engine, sum) = engine_with(sum_loop("sum"), eager_config());
        let listener = RecordingListener::new(DebugAction::Continue);
        let events = listener.events();
        engine.set_debug_listener(listener);
        engine.schedule_break();
        engine.call(sum, &[Value::Smi(3)]).unwrap();

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pc, 0);
        assert_eq!(events[0].tier, Tier::Interpreted);
        assert_eq!(events[0].locals[0], Value::Smi(3));
    }

    #[test]
    fn test_break_inside_osr_loop_keeps_compiled_frame() {
        let scenario = scenarios::find("osr-break").unwrap();
        let mut engine = Engine::new(scenario.program().unwrap(), EngineConfig::default()).unwrap();
        let f = engine.function("f").unwrap();
        let listener = RecordingListener::new(DebugAction::Continue);
        let events = listener.events();
        engine.set_debug_listener(listener);
        engine.prepare(f);

        assert_eq!(engine.call(f, &[]).unwrap(), Value::Smi(10));
        let events = events.borrow();
        assert_eq!(events.len(), 10);
        assert!(events.iter().any(|e| e.osr && e.tier == Tier::Optimized));
        assert_eq!(engine.stats().deopts_for(DeoptReason::ExplicitRequest), 0);
    }

    #[test]
    fn test_deoptimize_action_leaves_compiled_code() {
        let scenario = scenarios::find("osr-break").unwrap();
        let mut engine = Engine::new(scenario.program().unwrap(), EngineConfig::default()).unwrap();
        let f = engine.function("f").unwrap();
        let mut osr_breaks = 0;
        engine.set_debug_listener(move |event: &BreakEvent| {
            if event.osr {
                osr_breaks += 1;
            }
            if osr_breaks == 1 {
                DebugAction::Deoptimize
            } else {
                DebugAction::Continue
            }
        });
        engine.prepare(f);

        assert_eq!(engine.call(f, &[]).unwrap(), Value::Smi(10));
        assert!(engine.stats().deopts_for(DeoptReason::ExplicitRequest) >= 1);
        assert_eq!(engine.stats().debug_breaks, 10);
    }
}
