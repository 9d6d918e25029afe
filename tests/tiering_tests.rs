//! Integration tests for tier-up decisions and the control surface

mod common;
use common::{binary, eager_config, engine_with};
use quicktier::bytecode::{BinaryOp, FunctionBuilder, Instruction, Intrinsic, Program};
use quicktier::{Engine, EngineConfig, Tier, Value};

mod tier_up {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_counters_drive_baseline_then_optimized() {
        let (mut engine, add) = engine_with(binary("add", BinaryOp::Add), eager_config());
        assert_eq!(engine.tier(add), Tier::Interpreted);

        for _ in 0..2 {
            engine.call(add, &[Value::Smi(1), Value::Smi(2)]).unwrap();
        }
        assert_eq!(engine.tier(add), Tier::Baseline);

        for _ in 0..8 {
            let sum = engine.call(add, &[Value::Smi(1), Value::Smi(2)]).unwrap();
            assert_eq!(sum, Value::Smi(3));
        }
        assert_eq!(engine.tier(add), Tier::Optimized);
        assert!(engine.is_optimized(add));

        let stats = engine.stats();
        assert_eq!(stats.baseline_compiles, 1);
        assert_eq!(stats.optimized_compiles, 1);
        assert_eq!(stats.deopts, 0);
    }

    #[test]
    fn test_same_results_in_every_tier() {
        let (mut engine, sub) = engine_with(binary("sub", BinaryOp::Sub), eager_config());
        let mut seen = Vec::new();
        for n in 0..12 {
            let result = engine.call(sub, &[Value::Smi(n), Value::Smi(5)]).unwrap();
            assert_eq!(result, Value::Smi(n - 5));
            seen.push(engine.tier(sub));
        }
        assert!(seen.contains(&Tier::Baseline));
        assert_eq!(seen.last(), Some(&Tier::Optimized));
    }

    #[test]
    fn test_forced_optimization_without_prepare() {
        let (mut engine, mul) = engine_with(binary("mul", BinaryOp::Mul), EngineConfig::default());
        engine.optimize_on_next_call(mul);
        assert_eq!(engine.call(mul, &[Value::Smi(6), Value::Smi(7)]).unwrap(), Value::Smi(42));
        assert!(engine.is_optimized(mul));
    }

    #[test]
    fn test_never_optimize_pins_interpreter() {
        let (mut engine, add) = engine_with(binary("add", BinaryOp::Add), eager_config());
        engine.never_optimize(add);
        engine.optimize_on_next_call(add);
        for _ in 0..20 {
            engine.call(add, &[Value::Smi(1), Value::Smi(1)]).unwrap();
        }
        assert_eq!(engine.tier(add), Tier::Interpreted);
        let snapshot = engine.snapshot(add).unwrap();
        assert!(snapshot.never_optimize);
        assert!(!snapshot.eligible);
        assert_eq!(snapshot.invocations, 20);
    }

    #[test]
    fn test_deoptimize_function_falls_back_to_baseline() {
        let (mut engine, add) = engine_with(binary("add", BinaryOp::Add), eager_config());
        for _ in 0..10 {
            engine.call(add, &[Value::Smi(1), Value::Smi(2)]).unwrap();
        }
        assert!(engine.is_optimized(add));
        engine.deoptimize_function(add);
        assert!(!engine.is_optimized(add));
        assert_eq!(engine.tier(add), Tier::Baseline);
        assert_eq!(engine.call(add, &[Value::Smi(1), Value::Smi(2)]).unwrap(), Value::Smi(3));
    }
}

mod intrinsics {
    use super::*;
    use pretty_assertions::assert_eq;

    /// `function tier_of(f) { %OptimizeFunctionOnNextCall(f); f(1, 2); return %GetTier(f); }`
    fn program() -> (Program, quicktier::bytecode::FunctionId, quicktier::bytecode::FunctionId) {
        let mut program = Program::new();
        let add = program.add(binary("add", BinaryOp::Add)).unwrap();
        let mut b = FunctionBuilder::new("tier_of", 1);
        let tmp = b.register();
        let args = b.registers(2);
        let out = b.register();
        b.intrinsic(tmp, Intrinsic::PrepareFunctionForOptimization, 0);
        b.load_smi(args, 1);
        b.load_smi(args + 1, 2);
        b.emit(Instruction::Call { dst: out, callee: 0, first_arg: args, argc: 2 });
        b.intrinsic(tmp, Intrinsic::OptimizeFunctionOnNextCall, 0);
        b.emit(Instruction::Call { dst: out, callee: 0, first_arg: args, argc: 2 });
        b.intrinsic(out, Intrinsic::GetTier, 0);
        b.emit(Instruction::Return { src: out });
        let tier_of = program.add(b).unwrap();
        (program, add, tier_of)
    }

    #[test]
    fn test_optimize_and_query_from_bytecode() {
        let (program, add, tier_of) = program();
        let mut engine = Engine::new(program, EngineConfig::default()).unwrap();
        let tier = engine.call(tier_of, &[Value::Function(add)]).unwrap();
        assert_eq!(tier, Value::string("optimized"));
        assert!(engine.is_optimized(add));
    }

    #[test]
    fn test_intrinsic_rejects_non_function() {
        let (program, _, tier_of) = program();
        let mut engine = Engine::new(program, EngineConfig::default()).unwrap();
        let err = engine.call(tier_of, &[Value::Smi(3)]).unwrap_err();
        assert!(err.to_string().contains("is not a function"), "{}", err);
    }
}

mod introspection {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_snapshots_list_called_functions() {
        let mut program = Program::new();
        let add = program.add(binary("add", BinaryOp::Add)).unwrap();
        program.add(binary("unused", BinaryOp::Sub)).unwrap();
        let mut engine = Engine::new(program, eager_config()).unwrap();
        engine.call(add, &[Value::Smi(1), Value::Smi(2)]).unwrap();

        let snapshots = engine.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name, "add");
        assert_eq!(snapshots[0].tier, Tier::Interpreted);
        assert!(snapshots[0].feedback_sites > 0);
    }

    #[test]
    fn test_stats_render_and_serialize() {
        let (mut engine, add) = engine_with(binary("add", BinaryOp::Add), eager_config());
        for _ in 0..10 {
            engine.call(add, &[Value::Smi(1), Value::Smi(2)]).unwrap();
        }
        let stats = engine.stats();
        assert!(stats.to_string().contains("Compiles: 1 baseline, 1 optimized, 0 OSR"));
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["optimizedCompiles"], 1);
    }
}
