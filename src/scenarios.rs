//! Canned programs
//!
//! Each scenario builds a small program, drives it through the engine the
//! way a test harness would, and records checks comparing what the program
//! returned against what the reference semantics require. The CLI, the
//! benchmarks and the integration tests all run these.

use crate::bytecode::{
    BinaryOp, CompareOp, Constant, FunctionBuilder, FunctionId, Instruction, Intrinsic, Program, Reg,
};
use crate::config::EngineConfig;
use crate::debugger::{DebugAction, RecordingListener};
use crate::engine::{Engine, FunctionSnapshot, TieringStats};
use crate::error::{Error, Result};
use crate::jit::DeoptReason;
use crate::runtime::Value;
use serde::Serialize;
use std::fmt;

/// One expectation of a scenario run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub label: String,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
}

/// Collects checks while a scenario runs
#[derive(Debug, Default)]
pub struct Checks {
    results: Vec<CheckResult>,
}

impl Checks {
    pub fn equal(&mut self, label: impl Into<String>, expected: impl Into<Value>, actual: Value) {
        let expected = expected.into();
        self.results.push(CheckResult {
            label: label.into(),
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
            passed: expected == actual,
        });
    }

    pub fn holds(&mut self, label: impl Into<String>, condition: bool) {
        self.equal(label, true, Value::Bool(condition));
    }

    pub fn results(&self) -> &[CheckResult] {
        &self.results
    }
}

/// Outcome of running one scenario
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    pub name: String,
    pub description: String,
    pub checks: Vec<CheckResult>,
    pub stats: TieringStats,
    pub functions: Vec<FunctionSnapshot>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} ===", self.name)?;
        writeln!(f, "{}", self.description)?;
        for check in &self.checks {
            let mark = if check.passed { "ok  " } else { "FAIL" };
            write!(f, "  {} {}: {}", mark, check.label, check.actual)?;
            if !check.passed {
                write!(f, " (expected {})", check.expected)?;
            }
            writeln!(f)?;
        }
        for function in &self.functions {
            writeln!(f, "  {}", function)?;
        }
        write!(f, "{}", self.stats)
    }
}

/// A named program plus the harness that exercises it
#[derive(Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    build: fn() -> Result<Program>,
    drive: fn(&mut Engine, &mut Checks) -> Result<()>,
}

impl Scenario {
    pub fn program(&self) -> Result<Program> {
        (self.build)()
    }

    /// Run against a fresh engine
    pub fn run(&self, config: EngineConfig) -> Result<ScenarioReport> {
        let (engine, checks) = self.execute(config)?;
        Ok(ScenarioReport {
            name: self.name.to_string(),
            description: self.description.to_string(),
            checks: checks.results,
            stats: engine.stats(),
            functions: engine.snapshots(),
        })
    }

    /// Run, then list the bytecode and the code each function ended up with
    pub fn disassemble(&self, config: EngineConfig) -> Result<String> {
        let (engine, _) = self.execute(config)?;
        Ok(engine.disassemble())
    }

    fn execute(&self, config: EngineConfig) -> Result<(Engine, Checks)> {
        let mut engine = Engine::new(self.program()?, config)?;
        let mut checks = Checks::default();
        (self.drive)(&mut engine, &mut checks)?;
        engine.finalize_optimization();
        Ok((engine, checks))
    }

    /// Run against an engine the caller already set up
    pub fn drive(&self, engine: &mut Engine, checks: &mut Checks) -> Result<()> {
        (self.drive)(engine, checks)
    }
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario").field("name", &self.name).finish()
    }
}

static SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "osr-sum",
        description: "4-iteration loop requesting OSR every iteration reaches optimized code",
        build: osr_sum_program,
        drive: drive_osr_sum,
    },
    Scenario {
        name: "compare",
        description: "small-integer comparisons agree before and after forced optimization",
        build: compare_program,
        drive: drive_compare,
    },
    Scenario {
        name: "shape-change",
        description: "property load survives a receiver gaining fields after optimization",
        build: shape_program,
        drive: drive_shape_change,
    },
    Scenario {
        name: "type-change",
        description: "unseen operand type deopts and produces the interpreter's result",
        build: multiply_program,
        drive: drive_type_change,
    },
    Scenario {
        name: "exception-unwind",
        description: "throw two frames below an optimized caller reaches its catch",
        build: unwind_program,
        drive: drive_exception_unwind,
    },
    Scenario {
        name: "osr-literals",
        description: "object literal built after leaving OSR code",
        build: literals_program,
        drive: drive_literals,
    },
    Scenario {
        name: "osr-break",
        description: "debugger breaks scheduled inside an OSR'd loop",
        build: break_program,
        drive: drive_break,
    },
    Scenario {
        name: "osr-then-deopt",
        description: "loop runs optimized and the code after it runs interpreted",
        build: osr_then_deopt_program,
        drive: drive_osr_then_deopt,
    },
];

pub fn all() -> &'static [Scenario] {
    SCENARIOS
}

pub fn find(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.name == name)
}

fn function(engine: &Engine, name: &str) -> Result<FunctionId> {
    engine
        .function(name)
        .ok_or_else(|| Error::internal(format!("scenario program has no function {}", name)))
}

// ==================== Program helpers ====================

/// `for (i = 0; i < count; i++) { body }` with `i` in `counter`
fn counted_loop(
    b: &mut FunctionBuilder,
    counter: Reg,
    count: i32,
    body: impl FnOnce(&mut FunctionBuilder),
) {
    let limit = b.register();
    let cond = b.register();
    let one = b.register();
    b.load_smi(counter, 0);
    b.load_smi(limit, count);
    b.load_smi(one, 1);
    let header = b.label();
    let exit = b.label();
    b.bind(header);
    b.emit(Instruction::Compare { op: CompareOp::Lt, dst: cond, lhs: counter, rhs: limit });
    b.jump_if_false(cond, exit);
    body(b);
    b.emit(Instruction::Binary { op: BinaryOp::Add, dst: counter, lhs: counter, rhs: one });
    b.jump(header);
    b.bind(exit);
}

// ==================== osr-sum ====================

/// ```text
/// function sum4(n) {
///   let s = 0, optimized = false;
///   for (let i = 0; i < 4; i++) {
///     %OptimizeOsr(); %PrepareFunctionForOptimization(sum4);
///     s += i + n;
///     optimized = %ActiveTierIsOptimized();
///   }
///   return {sum: s, optimized};
/// }
/// ```
fn osr_sum_program() -> Result<Program> {
    let mut program = Program::new();
    let id = program.declare("sum4");
    let mut b = FunctionBuilder::new("sum4", 1);
    let n = b.param(0);
    // `sum` and `optimized` are consecutive for the literal
    let s = b.registers(2);
    let optimized = s + 1;
    let i = b.register();
    let tmp = b.register();
    let me = b.register();
    b.load_smi(s, 0);
    let no = b.constant(Constant::Bool(false));
    b.emit(Instruction::LoadConst { dst: optimized, index: no });
    b.emit(Instruction::LoadFunction { dst: me, function: id });
    counted_loop(&mut b, i, 4, |b| {
        b.intrinsic(tmp, Intrinsic::OptimizeOsr, tmp);
        b.intrinsic(tmp, Intrinsic::PrepareFunctionForOptimization, me);
        b.emit(Instruction::Binary { op: BinaryOp::Add, dst: tmp, lhs: i, rhs: n });
        b.emit(Instruction::Binary { op: BinaryOp::Add, dst: s, lhs: s, rhs: tmp });
        b.intrinsic(optimized, Intrinsic::ActiveTierIsOptimized, optimized);
    });
    let result = b.register();
    b.new_object(result, &["sum", "optimized"], s);
    b.emit(Instruction::Return { src: result });
    program.define(id, b)?;
    Ok(program)
}

fn drive_osr_sum(engine: &mut Engine, checks: &mut Checks) -> Result<()> {
    let sum4 = function(engine, "sum4")?;
    engine.prepare(sum4);
    for n in 0..3 {
        let result = engine.call(sum4, &[Value::Smi(n)])?;
        checks.equal(format!("sum4({}).sum", n), 6 + 4 * n, engine.get_property(&result, "sum")?);
        checks.equal(
            format!("sum4({}) ran the loop optimized", n),
            true,
            engine.get_property(&result, "optimized")?,
        );
    }
    Ok(())
}

// ==================== compare ====================

/// `function cmp(a, b) { return [a < b, a <= b, a > b, a >= b]; }`
fn compare_program() -> Result<Program> {
    let mut program = Program::new();
    let mut b = FunctionBuilder::new("cmp", 2);
    let (a, rhs) = (b.param(0), b.param(1));
    let first = b.registers(4);
    let ops = [CompareOp::Lt, CompareOp::Le, CompareOp::Gt, CompareOp::Ge];
    for (k, op) in ops.iter().enumerate() {
        b.emit(Instruction::Compare { op: *op, dst: first + k as Reg, lhs: a, rhs });
    }
    let array = b.register();
    let elements: Box<[Option<Reg>]> = (0..4).map(|k| Some(first + k)).collect();
    b.emit(Instruction::NewArray { dst: array, elements });
    b.emit(Instruction::Return { src: array });
    program.add(b)?;
    Ok(program)
}

const COMPARE_PAIRS: [(i32, i32); 3] = [(10, 20), (20, 10), (15, 15)];

fn check_compare(engine: &mut Engine, checks: &mut Checks, cmp: FunctionId, phase: &str) -> Result<()> {
    for (a, b) in COMPARE_PAIRS {
        let result = engine.call(cmp, &[Value::Smi(a), Value::Smi(b)])?;
        let expected = [a < b, a <= b, a > b, a >= b];
        for (k, (symbol, want)) in ["<", "<=", ">", ">="].iter().zip(expected).enumerate() {
            checks.equal(
                format!("{} {} {} {}", phase, a, symbol, b),
                want,
                engine.get_element(&result, k)?,
            );
        }
    }
    Ok(())
}

fn drive_compare(engine: &mut Engine, checks: &mut Checks) -> Result<()> {
    let cmp = function(engine, "cmp")?;
    engine.prepare(cmp);
    check_compare(engine, checks, cmp, "before")?;
    engine.optimize_on_next_call(cmp);
    check_compare(engine, checks, cmp, "after")?;
    checks.holds("cmp is optimized", engine.is_optimized(cmp));
    Ok(())
}

// ==================== shape-change ====================

/// ```text
/// function getX(o) { return o.x; }
/// function reshape(o) { o.y = 1; o.z = 2; return o; }
/// ```
fn shape_program() -> Result<Program> {
    let mut program = Program::new();
    let mut b = FunctionBuilder::new("getX", 1);
    let x = b.register();
    b.get_named(x, 0, "x");
    b.emit(Instruction::Return { src: x });
    program.add(b)?;

    let mut b = FunctionBuilder::new("reshape", 1);
    let v = b.register();
    b.load_smi(v, 1);
    b.set_named(0, "y", v);
    b.load_smi(v, 2);
    b.set_named(0, "z", v);
    b.emit(Instruction::Return { src: 0 });
    program.add(b)?;
    Ok(program)
}

fn drive_shape_change(engine: &mut Engine, checks: &mut Checks) -> Result<()> {
    let get_x = function(engine, "getX")?;
    let reshape = function(engine, "reshape")?;
    let o = engine.new_object(&["x"], vec![Value::Smi(42)]);

    engine.prepare(get_x);
    for _ in 0..3 {
        engine.call(get_x, &[o.clone()])?;
    }
    engine.optimize_on_next_call(get_x);
    checks.equal("o.x optimized", 42, engine.call(get_x, &[o.clone()])?);
    checks.holds("getX is optimized", engine.is_optimized(get_x));

    engine.call(reshape, &[o.clone()])?;
    checks.equal("o.x after reshape", 42, engine.call(get_x, &[o.clone()])?);
    let reason = engine.last_deopt(get_x).map(|r| r.reason);
    checks.holds("reshape deopted on shape", reason == Some(DeoptReason::ShapeMismatch));

    // Both shapes are now known; the next optimized code handles either
    let fresh = engine.new_object(&["x"], vec![Value::Smi(7)]);
    engine.call(get_x, &[fresh.clone()])?;
    engine.optimize_on_next_call(get_x);
    checks.equal("fresh.x optimized", 7, engine.call(get_x, &[fresh])?);
    checks.equal("reshaped o.x optimized", 42, engine.call(get_x, &[o])?);
    checks.holds("getX is optimized again", engine.is_optimized(get_x));
    Ok(())
}

// ==================== type-change ====================

/// `function mul(a, b) { return a * b; }`
fn multiply_program() -> Result<Program> {
    let mut program = Program::new();
    let mut b = FunctionBuilder::new("mul", 2);
    let r = b.register();
    b.emit(Instruction::Binary { op: BinaryOp::Mul, dst: r, lhs: 0, rhs: 1 });
    b.emit(Instruction::Return { src: r });
    program.add(b)?;
    Ok(program)
}

fn drive_type_change(engine: &mut Engine, checks: &mut Checks) -> Result<()> {
    let mul = function(engine, "mul")?;
    engine.prepare(mul);
    for _ in 0..3 {
        engine.call(mul, &[Value::Smi(6), Value::Smi(7)])?;
    }
    engine.optimize_on_next_call(mul);
    checks.equal("6 * 7 optimized", 42, engine.call(mul, &[Value::Smi(6), Value::Smi(7)])?);
    checks.holds("mul is optimized", engine.is_optimized(mul));

    let product = engine.call(mul, &[Value::string("abc"), Value::Smi(2)])?;
    checks.equal("'abc' * 2", f64::NAN, product);
    let reason = engine.last_deopt(mul).map(|r| r.reason);
    checks.holds("string operand deopted", reason == Some(DeoptReason::TypeMismatch));
    checks.holds("mul left optimized code", !engine.is_optimized(mul));
    checks.equal("'3' * 2", 6, engine.call(mul, &[Value::string("3"), Value::Smi(2)])?);
    checks.equal("6 * 7 again", 42, engine.call(mul, &[Value::Smi(6), Value::Smi(7)])?);
    Ok(())
}

// ==================== exception-unwind ====================

/// ```text
/// function inner(n) { if (n < 0) throw n * 10; return n; }
/// function middle(n) { return inner(n); }
/// function outer(n) {
///   let r = n * 2;
///   try { middle(n); } catch (e) { return r + e; }
///   return r;
/// }
/// ```
fn unwind_program() -> Result<Program> {
    let mut program = Program::new();
    let inner = program.declare("inner");
    let middle = program.declare("middle");
    let outer = program.declare("outer");

    let mut b = FunctionBuilder::new("inner", 1);
    let cond = b.register();
    let tmp = b.register();
    let ok = b.label();
    b.load_smi(tmp, 0);
    b.emit(Instruction::Compare { op: CompareOp::Lt, dst: cond, lhs: 0, rhs: tmp });
    b.jump_if_false(cond, ok);
    b.load_smi(tmp, 10);
    b.emit(Instruction::Binary { op: BinaryOp::Mul, dst: tmp, lhs: 0, rhs: tmp });
    b.emit(Instruction::Throw { src: tmp });
    b.bind(ok);
    b.emit(Instruction::Return { src: 0 });
    program.define(inner, b)?;

    let mut b = FunctionBuilder::new("middle", 1);
    let callee = b.register();
    let out = b.register();
    b.emit(Instruction::LoadFunction { dst: callee, function: inner });
    b.emit(Instruction::Call { dst: out, callee, first_arg: 0, argc: 1 });
    b.emit(Instruction::Return { src: out });
    program.define(middle, b)?;

    let mut b = FunctionBuilder::new("outer", 1);
    let r = b.register();
    let tmp = b.register();
    let out = b.register();
    let e = b.register();
    let handler = b.label();
    b.load_smi(tmp, 2);
    b.emit(Instruction::Binary { op: BinaryOp::Mul, dst: r, lhs: 0, rhs: tmp });
    let region = b.begin_try();
    b.emit(Instruction::LoadFunction { dst: tmp, function: middle });
    b.emit(Instruction::Call { dst: out, callee: tmp, first_arg: 0, argc: 1 });
    b.end_try(region, handler, e);
    b.emit(Instruction::Return { src: r });
    b.bind(handler);
    b.emit(Instruction::Binary { op: BinaryOp::Add, dst: out, lhs: r, rhs: e });
    b.emit(Instruction::Return { src: out });
    program.define(outer, b)?;
    Ok(program)
}

fn drive_exception_unwind(engine: &mut Engine, checks: &mut Checks) -> Result<()> {
    let outer = function(engine, "outer")?;
    engine.prepare(outer);
    checks.equal("outer(-1) interpreted", -12, engine.call(outer, &[Value::Smi(-1)])?);
    for n in 1..4 {
        engine.call(outer, &[Value::Smi(n)])?;
    }
    engine.optimize_on_next_call(outer);
    checks.equal("outer(4) optimized", 8, engine.call(outer, &[Value::Smi(4)])?);
    checks.holds("outer is optimized", engine.is_optimized(outer));

    checks.equal("outer(-3)", -36, engine.call(outer, &[Value::Smi(-3)])?);
    let frames = engine.last_deopt(outer).map_or(0, |r| r.frames);
    checks.equal("frames rebuilt for outer, middle and inner", 3, Value::Smi(frames as i32));
    checks.equal("outer(5) afterwards", 10, engine.call(outer, &[Value::Smi(5)])?);
    Ok(())
}

// ==================== osr-literals ====================

/// ```text
/// function mod() {
///   let i;
///   for (i = 0; i < 4; i++) { %OptimizeOsr(); %PrepareFunctionForOptimization(mod); }
///   return {blah: i};
/// }
/// ```
fn literals_program() -> Result<Program> {
    let mut program = Program::new();
    let id = program.declare("mod");
    let mut b = FunctionBuilder::new("mod", 0);
    let i = b.register();
    let tmp = b.register();
    let me = b.register();
    b.emit(Instruction::LoadFunction { dst: me, function: id });
    counted_loop(&mut b, i, 4, |b| {
        b.intrinsic(tmp, Intrinsic::OptimizeOsr, tmp);
        b.intrinsic(tmp, Intrinsic::PrepareFunctionForOptimization, me);
    });
    let result = b.register();
    b.new_object(result, &["blah"], i);
    b.emit(Instruction::Return { src: result });
    program.define(id, b)?;
    Ok(program)
}

fn drive_literals(engine: &mut Engine, checks: &mut Checks) -> Result<()> {
    let module = function(engine, "mod")?;
    engine.prepare(module);
    for run in 0..3 {
        let result = engine.call(module, &[])?;
        checks.equal(format!("run {} blah", run), 4, engine.get_property(&result, "blah")?);
    }
    Ok(())
}

// ==================== osr-break ====================

/// ```text
/// function f() {
///   let i;
///   for (i = 0; i < 10; i++) {
///     %OptimizeOsr(); %ScheduleBreak(); %PrepareFunctionForOptimization(f);
///   }
///   return i;
/// }
/// ```
fn break_program() -> Result<Program> {
    let mut program = Program::new();
    let id = program.declare("f");
    let mut b = FunctionBuilder::new("f", 0);
    let i = b.register();
    let tmp = b.register();
    let me = b.register();
    b.emit(Instruction::LoadFunction { dst: me, function: id });
    counted_loop(&mut b, i, 10, |b| {
        b.intrinsic(tmp, Intrinsic::OptimizeOsr, tmp);
        b.intrinsic(tmp, Intrinsic::ScheduleBreak, tmp);
        b.intrinsic(tmp, Intrinsic::PrepareFunctionForOptimization, me);
    });
    b.emit(Instruction::Return { src: i });
    program.define(id, b)?;
    Ok(program)
}

fn drive_break(engine: &mut Engine, checks: &mut Checks) -> Result<()> {
    let f = function(engine, "f")?;
    let listener = RecordingListener::new(DebugAction::Continue);
    let events = listener.events();
    engine.set_debug_listener(listener);
    engine.prepare(f);
    checks.equal("f()", 10, engine.call(f, &[])?);

    let events = events.borrow();
    checks.equal("breaks delivered", 10, Value::Smi(events.len() as i32));
    checks.holds("a break hit OSR code", events.iter().any(|e| e.osr));
    // Locals seen at each break are the loop counter after the increment
    let counters: Vec<i32> = events
        .iter()
        .filter_map(|e| e.locals.first().map(Value::to_int32))
        .collect();
    checks.holds("locals reconstructed in order", counters == (1..=10).collect::<Vec<_>>());
    Ok(())
}

// ==================== osr-then-deopt ====================

/// ```text
/// function test_osr(x, y) {
///   let s = 0, loop_opt = false;
///   for (let i = 0; i < 20; i++) {
///     %OptimizeOsr(); s += i; loop_opt = %ActiveTierIsOptimized();
///   }
///   s *= x;
///   return {s, loop: loop_opt, after: %ActiveTierIsOptimized()};
/// }
/// ```
fn osr_then_deopt_program() -> Result<Program> {
    let mut program = Program::new();
    let mut b = FunctionBuilder::new("test_osr", 2);
    let x = b.param(0);
    let out = b.registers(3);
    let (s, loop_opt, after) = (out, out + 1, out + 2);
    let i = b.register();
    let tmp = b.register();
    b.load_smi(s, 0);
    counted_loop(&mut b, i, 20, |b| {
        b.intrinsic(tmp, Intrinsic::OptimizeOsr, tmp);
        b.emit(Instruction::Binary { op: BinaryOp::Add, dst: s, lhs: s, rhs: i });
        b.intrinsic(loop_opt, Intrinsic::ActiveTierIsOptimized, loop_opt);
    });
    b.emit(Instruction::Binary { op: BinaryOp::Mul, dst: s, lhs: s, rhs: x });
    b.intrinsic(after, Intrinsic::ActiveTierIsOptimized, after);
    let result = b.register();
    b.new_object(result, &["s", "loop", "after"], out);
    b.emit(Instruction::Return { src: result });
    program.add(b)?;
    Ok(program)
}

fn drive_osr_then_deopt(engine: &mut Engine, checks: &mut Checks) -> Result<()> {
    let test_osr = function(engine, "test_osr")?;
    engine.prepare(test_osr);
    let result = engine.call(test_osr, &[Value::Smi(3), Value::Number(42.42)])?;
    checks.equal("test_osr(3, 42.42)", 570, engine.get_property(&result, "s")?);
    checks.equal("loop ran optimized", true, engine.get_property(&result, "loop")?);
    checks.equal("tail ran interpreted", false, engine.get_property(&result, "after")?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<_> = all().iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), all().len());
        assert!(find("compare").is_some());
        assert!(find("nope").is_none());
    }

    #[test]
    fn test_every_program_builds() {
        for scenario in all() {
            assert!(scenario.program().is_ok(), "{} failed to build", scenario.name);
        }
    }

    #[test]
    fn test_disassembly_lists_bytecode_and_lir() {
        let listing = find("shape-change").unwrap().disassemble(EngineConfig::default()).unwrap();
        assert!(listing.contains("== getX (1 params"));
        assert!(listing.contains("== getX [optimized]"));
        assert!(listing.contains("== reshape (1 params"));
    }

    #[test]
    fn test_checks_treat_nan_as_equal() {
        let mut checks = Checks::default();
        checks.equal("nan", f64::NAN, Value::Number(f64::NAN));
        checks.equal("mismatch", 1, Value::Smi(2));
        assert!(checks.results()[0].passed);
        assert!(!checks.results()[1].passed);
    }
}
