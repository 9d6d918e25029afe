//! Performance benchmarks for Quicktier
//!
//! Run with: cargo bench
//!
//! These benchmarks measure:
//! - Steady-state calls in each tier
//! - Loops with and without OSR
//! - The cost of a deopt round trip
//! - Whole scenario runs

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quicktier::bytecode::{BinaryOp, CompareOp, FunctionBuilder, FunctionId, Instruction, Program};
use quicktier::scenarios;
use quicktier::{Engine, EngineConfig, Value};

fn add() -> FunctionBuilder {
    let mut b = FunctionBuilder::new("add", 2);
    let r = b.register();
    b.emit(Instruction::Binary { op: BinaryOp::Add, dst: r, lhs: 0, rhs: 1 });
    b.emit(Instruction::Return { src: r });
    b
}

fn sum_loop() -> FunctionBuilder {
    let mut b = FunctionBuilder::new("sum", 1);
    let s = b.register();
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

fn engine(builder: FunctionBuilder) -> (Engine, FunctionId) {
    let mut program = Program::new();
    let id = program.add(builder).unwrap();
    (Engine::new(program, EngineConfig::default()).unwrap(), id)
}

/// Benchmark: one call of a small function in each tier
fn bench_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("call");
    let args = [Value::Smi(20), Value::Smi(22)];

    group.bench_function("interpreted", |b| {
        let (mut engine, f) = engine(add());
        engine.never_optimize(f);
        b.iter(|| engine.call(f, black_box(&args)).unwrap())
    });

    group.bench_function("optimized", |b| {
        let (mut engine, f) = engine(add());
        engine.call(f, &args).unwrap();
        engine.optimize_on_next_call(f);
        engine.call(f, &args).unwrap();
        b.iter(|| engine.call(f, black_box(&args)).unwrap())
    });

    group.finish();
}

/// Benchmark: a counted loop with and without OSR
fn bench_loops(c: &mut Criterion) {
    let mut group = c.benchmark_group("loop");

    for n in [100, 10_000] {
        group.bench_with_input(BenchmarkId::new("interpreted", n), &n, |b, &n| {
            let (mut engine, f) = engine(sum_loop());
            engine.never_optimize(f);
            b.iter(|| engine.call(f, &[Value::Smi(black_box(n))]).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("tiered", n), &n, |b, &n| {
            let (mut engine, f) = engine(sum_loop());
            b.iter(|| engine.call(f, &[Value::Smi(black_box(n))]).unwrap())
        });
    }

    group.finish();
}

/// Benchmark: optimize, deopt on a type change, and recover
fn bench_deopt_round_trip(c: &mut Criterion) {
    c.bench_function("deopt_round_trip", |b| {
        b.iter(|| {
            let (mut engine, f) = engine(add());
            engine.call(f, &[Value::Smi(1), Value::Smi(2)]).unwrap();
            engine.optimize_on_next_call(f);
            engine.call(f, &[Value::Smi(1), Value::Smi(2)]).unwrap();
            black_box(engine.call(f, &[Value::string("a"), Value::Smi(2)]).unwrap())
        })
    });
}

/// Benchmark: whole scenario runs
fn bench_scenarios(c: &mut Criterion) {
    let mut group = c.benchmark_group("scenario");
    for scenario in scenarios::all() {
        group.bench_function(scenario.name, |b| {
            b.iter(|| scenario.run(EngineConfig::default()).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_calls, bench_loops, bench_deopt_round_trip, bench_scenarios);
criterion_main!(benches);
