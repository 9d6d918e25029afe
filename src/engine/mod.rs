//! The tiered execution engine
//!
//! `Engine` owns the program, the heap shapes and every tiering component.
//! It is the only writer of tiering state: background workers compile, but
//! their results are installed here, at safe points (function entry and
//! loop back-edges), on the engine's own thread.
//!
//! # Example
//!
//! ```
//! use quicktier::bytecode::{BinaryOp, FunctionBuilder, Instruction, Program};
//! use quicktier::{Engine, EngineConfig, Value};
//!
//! let mut program = Program::new();
//! let mut add = FunctionBuilder::new("add", 2);
//! let sum = add.register();
//! add.emit(Instruction::Binary { op: BinaryOp::Add, dst: sum, lhs: 0, rhs: 1 });
//! add.emit(Instruction::Return { src: sum });
//! let add = program.add(add).unwrap();
//!
//! let mut engine = Engine::new(program, EngineConfig::default()).unwrap();
//! for _ in 0..50 {
//!     assert_eq!(engine.call(add, &[Value::Smi(1), Value::Smi(2)]).unwrap(), Value::Smi(3));
//! }
//! assert!(engine.is_optimized(add));
//! ```

mod intrinsics;
mod stats;

pub use stats::{FunctionSnapshot, TieringStats};

use crate::bytecode::{FunctionBuilder, FunctionCode, FunctionId, Instruction, Program};
use crate::config::{CompileMode, EngineConfig};
use crate::debugger::{BreakEvent, DebugAction, DebugListener, Debugger};
use crate::error::{messages, Error, ErrorKind, Result};
use crate::interpreter::InterpreterFrame;
use crate::jit::compiler::InlineCandidate;
use crate::jit::executor::{self, ExecOutcome, SafePointAction};
use crate::jit::feedback::CallTarget;
use crate::jit::frame_state::materialize;
use crate::jit::{
    CompileDispatcher, CompileOutcome, CompileRequest, CompiledUnit, CompilerOptions, DeoptReason, DeoptRecord,
    DeoptimizationEngine, FeedbackStore, FrameStateId, OsrController, ResumeAt, Slot,
    SpeculativeCompiler, Tier, TierManager,
};
use crate::runtime::{ops, Abrupt, Completion, ShapeTable, Value};
use rustc_hash::FxHashMap as HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Tiered engine for one program
pub struct Engine {
    pub(crate) program: Program,
    pub(crate) config: EngineConfig,
    pub(crate) shapes: ShapeTable,
    pub(crate) feedback: FeedbackStore,
    pub(crate) tiers: TierManager,
    compiler: SpeculativeCompiler,
    /// Present in concurrent mode
    dispatcher: Option<CompileDispatcher>,
    pub(crate) deopt: DeoptimizationEngine,
    pub(crate) osr: OsrController,
    pub(crate) debugger: Debugger,
    stats: TieringStats,
    depth: usize,
}

impl Engine {
    pub fn new(program: Program, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let compiler = SpeculativeCompiler::new(CompilerOptions::from(&config));
        let dispatcher = match config.compile_mode {
            CompileMode::Concurrent => Some(CompileDispatcher::new(compiler, &config)),
            CompileMode::Synchronous => None,
        };
        debug!(functions = program.len(), mode = ?config.compile_mode, "engine created");
        Ok(Self {
            program,
            shapes: ShapeTable::new(),
            feedback: FeedbackStore::new(config.max_polymorphism),
            tiers: TierManager::new(&config),
            compiler,
            dispatcher,
            deopt: DeoptimizationEngine::new(),
            osr: OsrController::new(),
            debugger: Debugger::new(),
            stats: TieringStats::default(),
            depth: 0,
            config,
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn function(&self, name: &str) -> Option<FunctionId> {
        self.program.find(name)
    }

    // ==================== Calling ====================

    /// Call `function`; an uncaught exception becomes `Error::Uncaught`
    pub fn call(&mut self, function: FunctionId, args: &[Value]) -> Result<Value> {
        self.invoke(function, args.to_vec()).map_err(Abrupt::into_error)
    }

    pub fn call_by_name(&mut self, name: &str, args: &[Value]) -> Result<Value> {
        let function = self
            .program
            .find(name)
            .ok_or_else(|| Error::reference_error(format!("{} {}", messages::UNKNOWN_FUNCTION, name)))?;
        self.call(function, args)
    }

    /// Call whatever `callee` holds
    pub(crate) fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> Completion<Value> {
        match callee {
            Value::Function(id) => self.invoke(*id, args),
            other => Err(Abrupt::type_error(messages::not_a_function(&other.to_js_string()))),
        }
    }

    /// Enter `function` in the tier its record selects
    pub(crate) fn invoke(&mut self, function: FunctionId, args: Vec<Value>) -> Completion<Value> {
        let Some(code) = self.program.get(function).cloned() else {
            return Err(Abrupt::error(
                ErrorKind::ReferenceError,
                format!("{} {}", messages::UNKNOWN_FUNCTION, function),
            ));
        };
        if self.depth >= self.config.max_call_depth {
            return Err(Abrupt::range_error(messages::MAXIMUM_CALL_STACK));
        }
        self.depth += 1;
        let result = self.enter(&code, args);
        self.depth -= 1;
        result
    }

    fn enter(&mut self, code: &Arc<FunctionCode>, args: Vec<Value>) -> Completion<Value> {
        let function = code.id;
        self.install_ready();
        self.feedback.begin_invocation(function, code.version);

        let forced = self
            .tiers
            .record(function)
            .is_some_and(|r| r.optimize_on_next_call);
        if let Some(tier) = self.tiers.on_invocation(function, &code.name) {
            self.request_compile(code, tier, None, forced);
        }
        let unit = self.tiers.active_unit(function).filter(|u| u.is_valid());

        if self.debugger.take_pending() {
            let event = BreakEvent {
                function,
                name: code.name.clone(),
                pc: 0,
                tier: unit.as_ref().map_or(Tier::Interpreted, |u| u.tier),
                osr: false,
                locals: InterpreterFrame::new(Arc::clone(code), args.clone()).registers,
            };
            if self.debugger.deliver(event) == DebugAction::Deoptimize {
                let frame = InterpreterFrame::new(Arc::clone(code), args);
                return self.interpret(vec![frame], ResumeAt::Before);
            }
        }

        match unit {
            Some(unit) => {
                let mut slots = vec![Slot::default(); unit.slot_count];
                for (slot, arg) in slots
                    .iter_mut()
                    .zip(args.into_iter().take(code.param_count as usize))
                {
                    *slot = Slot::Tagged(arg);
                }
                self.run_compiled(&unit, slots, unit.entry)
            }
            None => {
                let frame = InterpreterFrame::new(Arc::clone(code), args);
                self.interpret(vec![frame], ResumeAt::Before)
            }
        }
    }

    /// Run compiled code; a deopt continues the invocation in the interpreter
    pub(crate) fn run_compiled(
        &mut self,
        unit: &Arc<CompiledUnit>,
        slots: Vec<Slot>,
        entry: usize,
    ) -> Completion<Value> {
        match executor::execute(self, unit, slots, entry)? {
            ExecOutcome::Return(value) => Ok(value),
            ExecOutcome::Deopt(exit) => {
                let deopt = self.deopt.trigger(&mut self.tiers, unit, exit)?;
                self.interpret(deopt.frames, deopt.resume)
            }
        }
    }

    // ==================== Compilation ====================

    fn request_compile(
        &mut self,
        code: &Arc<FunctionCode>,
        tier: Tier,
        osr_entry: Option<u32>,
        synchronous: bool,
    ) {
        let ticket = self.tiers.begin_compile(code.id, &code.name, tier, osr_entry);
        let request = self.compile_request(code, tier, ticket, osr_entry);
        if !synchronous {
            if let Some(dispatcher) = &self.dispatcher {
                match dispatcher.queue(request) {
                    Ok(()) => {
                        debug!(function = %code.name, %tier, osr = osr_entry.is_some(), "queued background compile");
                    }
                    Err(_) => {
                        debug!(function = %code.name, %tier, "compile queue full");
                        self.stats.queue_rejections += 1;
                        self.tiers.end_compile(code.id, ticket);
                    }
                }
                return;
            }
        }
        let result = self.compiler.compile(&request);
        self.finish_compile(CompileOutcome {
            function: code.id,
            tier,
            ticket,
            osr_entry,
            result,
        });
    }

    /// Gather feedback for `code` and, for the optimizing tier, for every
    /// monomorphic callee it may inline
    fn compile_request(
        &self,
        code: &Arc<FunctionCode>,
        tier: Tier,
        ticket: u64,
        osr_entry: Option<u32>,
    ) -> CompileRequest {
        let feedback = self.feedback.snapshot(code.id, code.version);
        let mut candidates: HashMap<FunctionId, InlineCandidate> = HashMap::default();
        if tier == Tier::Optimized {
            let mut frontier = vec![(Arc::clone(code), feedback.clone())];
            for _ in 0..self.config.max_inline_depth {
                let mut next = Vec::new();
                for (body, body_feedback) in &frontier {
                    for (pc, insn) in body.instructions.iter().enumerate() {
                        if !matches!(insn, Instruction::Call { .. }) {
                            continue;
                        }
                        let Some(CallTarget::Monomorphic(target)) =
                            body_feedback.call(pc as u32).map(|c| c.target)
                        else {
                            continue;
                        };
                        if target == code.id || candidates.contains_key(&target) {
                            continue;
                        }
                        let Some(callee) = self.program.get(target) else {
                            continue;
                        };
                        if callee.len() > self.config.max_inline_bytecode_length {
                            continue;
                        }
                        let candidate = InlineCandidate {
                            code: Arc::clone(callee),
                            feedback: self.feedback.snapshot(target, callee.version),
                        };
                        next.push((Arc::clone(callee), candidate.feedback.clone()));
                        candidates.insert(target, candidate);
                    }
                }
                frontier = next;
            }
        }
        CompileRequest {
            function: code.id,
            tier,
            ticket,
            osr_entry,
            code: Arc::clone(code),
            feedback,
            candidates,
        }
    }

    /// Install a finished compile unless something newer replaced it
    fn finish_compile(&mut self, outcome: CompileOutcome) {
        let CompileOutcome {
            function,
            tier,
            ticket,
            osr_entry,
            result,
        } = outcome;
        let name = self.program.name_of(function).to_string();
        if let Err(rejected) = self.tiers.check_current(function, ticket) {
            debug!(function = %name, %tier, ticket, %rejected, "discarding compile");
            self.stats.superseded += 1;
            self.tiers.end_compile(function, ticket);
            return;
        }
        match result {
            Ok(unit) => {
                let unit = Arc::new(unit);
                self.stats.note_compile(&unit);
                if unit.is_osr() {
                    info!(function = %name, loop_header = ?osr_entry, guards = unit.guards, "OSR code ready");
                    self.tiers.install(Arc::clone(&unit));
                    self.osr.insert(unit);
                } else if self.tiers.already_has(function, tier) {
                    self.tiers.end_compile(function, ticket);
                } else {
                    info!(
                        function = %name,
                        %tier,
                        guards = unit.guards,
                        inlined = unit.inlined.len(),
                        "installed compiled code"
                    );
                    self.tiers.install(unit);
                }
            }
            Err(Error::CompileFailed(failure)) => {
                debug!(function = %name, %tier, %failure, "compile failed");
                self.stats.compile_failures += 1;
                self.tiers.compile_failed(function, ticket);
            }
            Err(err) => {
                error!(function = %name, %tier, %err, "compiler defect, pinning function to the interpreter");
                debug_assert!(!err.is_fatal(), "{} compiled without deopt coverage: {}", name, err);
                self.stats.compile_failures += 1;
                self.tiers.never_optimize(function, &name);
                self.osr.evict(function);
            }
        }
    }

    /// Install whatever background compiles have finished
    fn install_ready(&mut self) {
        let outcomes = match &self.dispatcher {
            Some(dispatcher) => dispatcher.take_results(),
            None => return,
        };
        for outcome in outcomes {
            self.finish_compile(outcome);
        }
    }

    // ==================== Safe points and OSR ====================

    /// Back-edge of an interpreted loop. `Some` carries the return value of
    /// the whole invocation when it finished in OSR code.
    pub(crate) fn maybe_osr(
        &mut self,
        code: &Arc<FunctionCode>,
        loop_header: u32,
        registers: &[Value],
    ) -> Completion<Option<Value>> {
        self.install_ready();
        if self.debugger.take_pending() {
            self.debugger.deliver(BreakEvent {
                function: code.id,
                name: code.name.clone(),
                pc: loop_header,
                tier: Tier::Interpreted,
                osr: false,
                locals: registers.to_vec(),
            });
        }
        let unit = match self.osr.lookup(code.id, loop_header) {
            Some(unit) => Some(unit),
            None => self.osr_compile(code, loop_header),
        };
        match unit {
            Some(unit) => self.enter_osr(&unit, loop_header, registers),
            None => Ok(None),
        }
    }

    /// Back-edge of a compiled loop
    pub(crate) fn compiled_back_edge(
        &mut self,
        unit: &Arc<CompiledUnit>,
        loop_header: u32,
        state: FrameStateId,
        slots: &[Slot],
    ) -> Completion<SafePointAction> {
        self.install_ready();
        if self.debugger.take_pending() {
            if let Some(event) = self.compiled_break_event(unit, state, slots) {
                if self.debugger.deliver(event) == DebugAction::Deoptimize {
                    return Ok(SafePointAction::Deoptimize);
                }
            }
        }
        if unit.tier != Tier::Baseline {
            return Ok(SafePointAction::Continue);
        }
        let target = match self.osr.lookup(unit.function, loop_header) {
            Some(target) => Some(target),
            None => self.osr_compile(&unit.code, loop_header),
        };
        let Some(target) = target else {
            return Ok(SafePointAction::Continue);
        };
        let registers = unit
            .frame_states
            .get(state)
            .and_then(|entry| materialize(entry, slots).pop())
            .map(|frame| frame.registers)
            .ok_or(Error::FrameStateCoverageGap {
                function: unit.function,
                lir_index: usize::MAX,
            })?;
        Ok(match self.enter_osr(&target, loop_header, &registers)? {
            Some(value) => SafePointAction::Return(value),
            None => SafePointAction::Continue,
        })
    }

    fn compiled_break_event(
        &self,
        unit: &CompiledUnit,
        state: FrameStateId,
        slots: &[Slot],
    ) -> Option<BreakEvent> {
        let entry = unit.frame_states.get(state)?;
        let frame = materialize(entry, slots).pop()?;
        Some(BreakEvent {
            function: frame.function,
            name: self.program.name_of(frame.function).to_string(),
            pc: frame.bytecode_offset,
            tier: unit.tier,
            osr: unit.is_osr(),
            locals: frame.registers,
        })
    }

    /// Compile OSR code for a loop if it is due. An explicit request waits
    /// for background work instead of leaving the loop uncompiled.
    fn osr_compile(&mut self, code: &Arc<FunctionCode>, loop_header: u32) -> Option<Arc<CompiledUnit>> {
        let function = code.id;
        let (pending, requested) = match self.tiers.record(function) {
            Some(record) => (record.pending.is_some(), record.osr_requested),
            None => return None,
        };
        if pending {
            if !requested {
                return None;
            }
            if let Some(dispatcher) = &self.dispatcher {
                dispatcher.await_idle();
            }
            self.install_ready();
            if let Some(unit) = self.osr.lookup(function, loop_header) {
                self.tiers.record_mut(function, &code.name).osr_requested = false;
                return Some(unit);
            }
            if self.tiers.record(function).is_some_and(|r| r.pending.is_some()) {
                return None;
            }
        }
        if !self.tiers.on_loop_back_edge(function, loop_header) {
            return None;
        }
        self.tiers.reset_loop_counter(function, loop_header);
        self.tiers.record_mut(function, &code.name).osr_requested = false;
        self.request_compile(code, Tier::Optimized, Some(loop_header), false);
        self.osr.lookup(function, loop_header)
    }

    fn enter_osr(
        &mut self,
        unit: &Arc<CompiledUnit>,
        loop_header: u32,
        registers: &[Value],
    ) -> Completion<Option<Value>> {
        match self.osr.transplant(unit, loop_header, registers) {
            Ok(entry) => self.run_compiled(&entry.unit, entry.slots, entry.entry).map(Some),
            Err(_) => Ok(None),
        }
    }

    // ==================== Tiering controls ====================

    pub fn tier(&self, function: FunctionId) -> Tier {
        self.tiers.tier(function)
    }

    pub fn is_optimized(&self, function: FunctionId) -> bool {
        self.tiers
            .active_unit(function)
            .is_some_and(|u| u.tier == Tier::Optimized && u.is_valid())
    }

    /// Start tracking a function and clear its deopt bookkeeping
    pub fn prepare(&mut self, function: FunctionId) {
        let name = self.program.name_of(function).to_string();
        self.tiers.prepare(function, &name);
    }

    /// Compile and activate optimized code before the next call
    pub fn optimize_on_next_call(&mut self, function: FunctionId) {
        let name = self.program.name_of(function).to_string();
        self.tiers.force_optimize(function, &name);
    }

    /// Compile OSR code at the next back-edge of any loop in `function`
    pub fn request_osr(&mut self, function: FunctionId) {
        let name = self.program.name_of(function).to_string();
        self.tiers.request_osr(function, &name);
    }

    /// Pin to the interpreter and drop all compiled code
    pub fn never_optimize(&mut self, function: FunctionId) {
        let name = self.program.name_of(function).to_string();
        let dropped = self.tiers.never_optimize(function, &name);
        let evicted = self.osr.evict(function);
        debug!(function = %name, units = dropped.len() + evicted, "never optimize");
    }

    /// Invalidate optimized code; frames running it leave at their next return
    pub fn deoptimize_function(&mut self, function: FunctionId) {
        let dropped = self.tiers.force_deoptimize(function);
        let evicted = self.osr.evict(function);
        if dropped.len() + evicted > 0 {
            info!(function = %self.program.name_of(function), units = dropped.len() + evicted, "deoptimized function");
        }
    }

    /// Wait for background compiles and install their results
    pub fn finalize_optimization(&mut self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.await_idle();
        }
        self.install_ready();
    }

    /// Replace the body of `function`. Compiled code for the old body is
    /// invalidated and its feedback discarded.
    pub fn redefine(&mut self, function: FunctionId, builder: FunctionBuilder) -> Result<()> {
        self.program.define(function, builder)?;
        let dropped = self.tiers.discard_code(function);
        let evicted = self.osr.evict(function);
        debug!(function = %self.program.name_of(function), units = dropped.len() + evicted, "redefined");
        Ok(())
    }

    // ==================== Debugger ====================

    pub fn set_debug_listener(&mut self, listener: impl DebugListener + 'static) {
        self.debugger.set_listener(Box::new(listener));
    }

    pub fn clear_debug_listener(&mut self) {
        self.debugger.clear_listener();
    }

    /// Break at the next safe point
    pub fn schedule_break(&mut self) {
        self.debugger.schedule();
    }

    pub fn debugger(&self) -> &Debugger {
        &self.debugger
    }

    // ==================== Inspection ====================

    pub fn stats(&self) -> TieringStats {
        let mut stats = self.stats.clone();
        stats.deopts = self.deopt.total();
        stats.deopts_by_reason = self.deopt.counts().into_iter().collect();
        stats.lazy_deopts = self.deopt.count(DeoptReason::LazyInvalidation);
        stats.osr_transfers = self.osr.transfers();
        stats.osr_failures = self.osr.failures();
        stats.debug_breaks = self.debugger.breaks_delivered();
        stats
    }

    pub fn snapshot(&self, function: FunctionId) -> Option<FunctionSnapshot> {
        let record = self.tiers.record(function)?;
        let sites = self.feedback.function(function).map_or(0, |f| f.sites());
        Some(FunctionSnapshot::new(record, self.osr.has_unit(function), sites))
    }

    /// Snapshots of every function that has run, by id
    pub fn snapshots(&self) -> Vec<FunctionSnapshot> {
        let mut snapshots: Vec<_> = self
            .tiers
            .records()
            .map(|record| {
                let sites = self.feedback.function(record.id).map_or(0, |f| f.sites());
                FunctionSnapshot::new(record, self.osr.has_unit(record.id), sites)
            })
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    pub fn feedback(&self) -> &FeedbackStore {
        &self.feedback
    }

    pub fn deopt_history(&self) -> impl Iterator<Item = &DeoptRecord> {
        self.deopt.history()
    }

    pub fn last_deopt(&self, function: FunctionId) -> Option<&DeoptRecord> {
        self.deopt.last_for(function)
    }

    /// Optimized or baseline unit currently installed
    pub fn active_unit(&self, function: FunctionId) -> Option<Arc<CompiledUnit>> {
        self.tiers.active_unit(function)
    }

    /// Bytecode listing of every function, followed by the LIR of its
    /// installed unit when there is one
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for code in self.program.iter() {
            out.push_str(&code.disassemble());
            if let Some(unit) = self.tiers.active_unit(code.id) {
                out.push_str(&unit.disassemble());
            }
            out.push('\n');
        }
        out
    }

    // ==================== Host values ====================

    /// Allocate an object with the given properties in order
    pub fn new_object(&mut self, keys: &[&str], values: Vec<Value>) -> Value {
        let keys: Vec<Arc<str>> = keys.iter().map(|k| Arc::from(*k)).collect();
        ops::new_object(&mut self.shapes, &keys, values)
    }

    pub fn new_array(&mut self, values: Vec<Value>) -> Value {
        ops::new_array(values.into_iter().map(Some).collect())
    }

    /// Read a property the way bytecode would
    pub fn get_property(&self, object: &Value, key: &str) -> Result<Value> {
        ops::get_named(&self.shapes, object, key).map_err(Abrupt::into_error)
    }

    pub fn get_element(&self, array: &Value, index: usize) -> Result<Value> {
        let index = Value::number(index as f64);
        ops::get_indexed(&self.shapes, array, &index).map_err(Abrupt::into_error)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("functions", &self.program.len())
            .field("mode", &self.config.compile_mode)
            .field("depth", &self.depth)
            .field("debugger", &self.debugger)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BinaryOp, CompareOp, UnaryOp};
    use pretty_assertions::assert_eq;

    fn config() -> EngineConfig {
        EngineConfig::default().with_thresholds(2, 4).with_osr_threshold(5)
    }

    /// `function sum(n) { let s = 0; for (let i = 0; i < n; i++) s += i; return s }`
    fn sum_program() -> (Program, FunctionId) {
        let mut program = Program::new();
        let mut b = FunctionBuilder::new("sum", 1);
        let s = b.register();
        let i = b.register();
        let cond = b.register();
        b.load_smi(s, 0);
        b.load_smi(i, 0);
        let header = b.label();
        let exit = b.label();
        b.bind(header);
        b.emit(Instruction::Compare { op: CompareOp::Lt, dst: cond, lhs: i, rhs: 0 });
        b.jump_if_false(cond, exit);
        b.emit(Instruction::Binary { op: BinaryOp::Add, dst: s, lhs: s, rhs: i });
        b.emit(Instruction::Unary { op: UnaryOp::Inc, dst: i, src: i });
        b.jump(header);
        b.bind(exit);
        b.emit(Instruction::Return { src: s });
        let id = program.add(b).unwrap();
        (program, id)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = EngineConfig {
            worker_threads: 0,
            compile_mode: CompileMode::Concurrent,
            ..EngineConfig::default()
        };
        assert!(Engine::new(Program::new(), config).is_err());
    }

    #[test]
    fn test_tiers_up_through_baseline() {
        let (program, sum) = sum_program();
        let mut engine = Engine::new(program, config().with_osr_threshold(1_000)).unwrap();
        for _ in 0..2 {
            assert_eq!(engine.call(sum, &[Value::Smi(3)]).unwrap(), Value::Smi(3));
        }
        assert_eq!(engine.tier(sum), Tier::Baseline);
        for _ in 0..4 {
            assert_eq!(engine.call(sum, &[Value::Smi(4)]).unwrap(), Value::Smi(6));
        }
        assert_eq!(engine.tier(sum), Tier::Optimized);
        let stats = engine.stats();
        assert_eq!(stats.baseline_compiles, 1);
        assert_eq!(stats.optimized_compiles, 1);
    }

    #[test]
    fn test_long_loop_enters_osr_code() {
        let (program, sum) = sum_program();
        let mut engine = Engine::new(program, config()).unwrap();
        assert_eq!(engine.call(sum, &[Value::Smi(100)]).unwrap(), Value::Smi(4950));
        let stats = engine.stats();
        assert_eq!(stats.osr_compiles, 1);
        assert_eq!(stats.osr_transfers, 1);
        // The loop exit was never taken before OSR
        assert_eq!(stats.deopts_for(DeoptReason::Unreachable), 1);
    }

    #[test]
    fn test_unknown_function_and_non_callable() {
        let (program, _) = sum_program();
        let mut engine = Engine::new(program, config()).unwrap();
        let err = engine.call(FunctionId(42), &[]).unwrap_err();
        assert!(err.to_string().contains("ReferenceError"));
        let err = engine.call_value(&Value::Smi(1), Vec::new()).unwrap_err();
        assert!(matches!(err, Abrupt::Throw(_)));
        assert!(engine.call_by_name("missing", &[]).is_err());
    }

    #[test]
    fn test_call_depth_is_bounded() {
        let mut program = Program::new();
        let f = program.declare("forever");
        let mut b = FunctionBuilder::new("forever", 0);
        let callee = b.register();
        let out = b.register();
        b.emit(Instruction::LoadFunction { dst: callee, function: f });
        b.emit(Instruction::Call { dst: out, callee, first_arg: 0, argc: 0 });
        b.emit(Instruction::Return { src: out });
        program.define(f, b).unwrap();

        let config = EngineConfig {
            max_call_depth: 64,
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(program, config).unwrap();
        let err = engine.call(f, &[]).unwrap_err();
        assert!(err.to_string().contains(messages::MAXIMUM_CALL_STACK));
    }

    #[test]
    fn test_redefine_discards_code() {
        let (program, sum) = sum_program();
        let mut engine = Engine::new(program, config()).unwrap();
        engine.optimize_on_next_call(sum);
        engine.call(sum, &[Value::Smi(3)]).unwrap();
        assert!(engine.is_optimized(sum));

        let mut b = FunctionBuilder::new("sum", 1);
        let r = b.register();
        b.emit(Instruction::Binary { op: BinaryOp::Mul, dst: r, lhs: 0, rhs: 0 });
        b.emit(Instruction::Return { src: r });
        engine.redefine(sum, b).unwrap();
        assert_eq!(engine.tier(sum), Tier::Interpreted);
        assert_eq!(engine.call(sum, &[Value::Smi(3)]).unwrap(), Value::Smi(9));
    }

    #[test]
    fn test_host_objects() {
        let (program, _) = sum_program();
        let mut engine = Engine::new(program, config()).unwrap();
        let object = engine.new_object(&["x", "y"], vec![Value::Smi(1), Value::Smi(2)]);
        assert_eq!(engine.get_property(&object, "y").unwrap(), Value::Smi(2));
        assert_eq!(engine.get_property(&object, "z").unwrap(), Value::Undefined);
        assert!(engine.get_property(&Value::Null, "x").is_err());
    }
}
