//! Shared test helpers for integration tests

use quicktier::bytecode::{BinaryOp, CompareOp, FunctionBuilder, FunctionId, Instruction, Program, Reg};
use quicktier::{CompileMode, Engine, EngineConfig};

/// Low thresholds so a handful of calls tiers a function up
#[allow(dead_code)]
pub fn eager_config() -> EngineConfig {
    EngineConfig::default().with_thresholds(2, 4).with_osr_threshold(10)
}

#[allow(dead_code)]
pub fn concurrent_config() -> EngineConfig {
    eager_config().with_compile_mode(CompileMode::Concurrent)
}

/// Build an engine over a single function
pub fn engine_with(builder: FunctionBuilder, config: EngineConfig) -> (Engine, FunctionId) {
    let mut program = Program::new();
    let id = program.add(builder).unwrap();
    (Engine::new(program, config).unwrap(), id)
}

/// `function name(a, b) { return a <op> b; }`
#[allow(dead_code)]
pub fn binary(name: &str, op: BinaryOp) -> FunctionBuilder {
    let mut b = FunctionBuilder::new(name, 2);
    let r = b.register();
    b.emit(Instruction::Binary { op, dst: r, lhs: 0, rhs: 1 });
    b.emit(Instruction::Return { src: r });
    b
}

/// `function name(x) { return x <op> k; }`
#[allow(dead_code)]
pub fn binary_const(name: &str, op: BinaryOp, k: i32) -> FunctionBuilder {
    let mut b = FunctionBuilder::new(name, 1);
    let rhs = b.register();
    let r = b.register();
    b.load_smi(rhs, k);
    b.emit(Instruction::Binary { op, dst: r, lhs: 0, rhs });
    b.emit(Instruction::Return { src: r });
    b
}

/// `function sum(n) { let s = 0; for (let i = 0; i < n; i++) s += i; return s; }`
#[allow(dead_code)]
pub fn sum_loop(name: &str) -> FunctionBuilder {
    let mut b = FunctionBuilder::new(name, 1);
    let s: Reg = b.register();
    let i = b.register();
    let cond = b.register();
    let one = b.register();
    b.load_smi(s, 0);
    b.load_smi(i, 0);
    b.load_smi(one, 1);
    let header = b.label();
    let exit = b.label();
    b.bind(header);
    b.emit(Instruction::Compare { op: CompareOp::Lt, dst: cond, lhs: i, rhs: 0 });
    b.jump_if_false(cond, exit);
    b.emit(Instruction::Binary { op: BinaryOp::Add, dst: s, lhs: s, rhs: i });
    b.emit(Instruction::Binary { op: BinaryOp::Add, dst: i, lhs: i, rhs: one });
    b.jump(header);
    b.bind(exit);
    b.emit(Instruction::Return { src: s });
    b
}
