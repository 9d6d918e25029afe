//! Deoptimization
//!
//! Turns a failed speculation (or a throw, or a stale return address) in
//! compiled code into interpreter frames. The frame state recorded at the
//! exit point tells us every live value of every logical frame; values are
//! copied out and boxed, never recomputed.

use super::compiler::CompiledUnit;
use super::frame_state::{materialize, FrameStateId, Slot};
use super::tiering::{DeoptSite, Tier, TierManager};
use crate::bytecode::FunctionId;
use crate::error::{Error, Result};
use crate::interpreter::InterpreterFrame;
use crate::runtime::Value;
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Deopt history entries kept for inspection
const HISTORY_LIMIT: usize = 256;

/// Why compiled code gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeoptReason {
    /// A value had a type the code was not specialized for
    TypeMismatch,
    /// A receiver had a shape the code was not specialized for
    ShapeMismatch,
    /// An element load hit a hole in a packed array
    HoleEncountered,
    /// Control reached a branch never taken during profiling
    Unreachable,
    /// A call site saw a different callee
    WrongCalleeOrArity,
    /// Small-integer arithmetic left the int32 range or was inexact
    Overflow,
    /// An element load was out of bounds
    OutOfBounds,
    /// The code was invalidated while this frame was in a call
    LazyInvalidation,
    /// An exception has to be dispatched by the interpreter
    ExceptionUnwind,
    /// A debugger or intrinsic asked for it
    ExplicitRequest,
}

impl DeoptReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeoptReason::TypeMismatch => "type-mismatch",
            DeoptReason::ShapeMismatch => "shape-mismatch",
            DeoptReason::HoleEncountered => "hole",
            DeoptReason::Unreachable => "unreachable",
            DeoptReason::WrongCalleeOrArity => "wrong-callee",
            DeoptReason::Overflow => "overflow",
            DeoptReason::OutOfBounds => "out-of-bounds",
            DeoptReason::LazyInvalidation => "lazy",
            DeoptReason::ExceptionUnwind => "exception",
            DeoptReason::ExplicitRequest => "explicit",
        }
    }

    /// Whether the unit must never run again after this deopt
    pub fn invalidates_code(self) -> bool {
        !matches!(self, DeoptReason::LazyInvalidation | DeoptReason::ExceptionUnwind)
    }

    /// Whether the deopt is a failed speculation that can repeat
    pub fn counts_toward_ineligibility(self) -> bool {
        matches!(
            self,
            DeoptReason::TypeMismatch
                | DeoptReason::ShapeMismatch
                | DeoptReason::HoleEncountered
                | DeoptReason::Unreachable
                | DeoptReason::WrongCalleeOrArity
                | DeoptReason::Overflow
                | DeoptReason::OutOfBounds
        )
    }
}

impl fmt::Display for DeoptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the innermost reconstructed frame continues
#[derive(Debug, Clone)]
pub enum ResumeAt {
    /// Re-execute the instruction at the recorded offset
    Before,
    /// The instruction at the recorded offset completed with this value
    After(Value),
    /// The instruction at the recorded offset threw this value
    Throw(Value),
}

/// A request to leave compiled code, produced by the executor
#[derive(Debug)]
pub struct DeoptExit {
    pub state: FrameStateId,
    pub reason: DeoptReason,
    pub resume: ResumeAt,
    pub slots: Vec<Slot>,
}

/// One deopt as kept in the history
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeoptRecord {
    pub function: String,
    pub function_id: u32,
    pub tier: Tier,
    pub reason: DeoptReason,
    /// Function and offset of the innermost frame
    pub site_function: u32,
    pub bytecode_offset: u32,
    /// Interpreter frames reconstructed
    pub frames: usize,
    pub invalidated: bool,
    pub made_ineligible: bool,
}

/// Result of a deopt: the frames to continue in the interpreter
#[derive(Debug)]
pub struct Deoptimization {
    pub frames: Vec<InterpreterFrame>,
    pub resume: ResumeAt,
    pub record: DeoptRecord,
}

/// Performs deopts and keeps their history
#[derive(Debug, Default)]
pub struct DeoptimizationEngine {
    history: VecDeque<DeoptRecord>,
    by_reason: HashMap<DeoptReason, u64>,
    total: u64,
}

impl DeoptimizationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave `unit` through the frame state named by `exit`.
    ///
    /// Reconstruction cannot fail once a unit exists: coverage was verified
    /// when it was compiled, so a missing entry here is an engine defect.
    pub fn trigger(
        &mut self,
        tiers: &mut TierManager,
        unit: &CompiledUnit,
        exit: DeoptExit,
    ) -> Result<Deoptimization> {
        let entry = unit
            .frame_states
            .get(exit.state)
            .ok_or(Error::FrameStateCoverageGap {
                function: unit.function,
                lir_index: usize::MAX,
            })?;

        let mut frames = Vec::with_capacity(entry.depth());
        for frame in materialize(entry, &exit.slots) {
            let code = unit
                .code_for(frame.function)
                .ok_or_else(|| Error::internal(format!("no bytecode for {} in {}", frame.function, unit.name)))?;
            frames.push(InterpreterFrame::resume(Arc::clone(code), frame.bytecode_offset, frame.registers));
        }
        let (site_function, bytecode_offset) = entry
            .innermost()
            .map(|f| (f.function, f.bytecode_offset))
            .unwrap_or((unit.function, 0));

        let invalidated = exit.reason.invalidates_code() && unit.is_valid();
        if invalidated {
            tiers.invalidate_unit(unit);
        }
        let site = DeoptSite {
            function: site_function,
            pc: bytecode_offset,
        };
        let made_ineligible = tiers.note_deopt(unit.function, site, exit.reason);

        let record = DeoptRecord {
            function: unit.name.clone(),
            function_id: unit.function.0,
            tier: unit.tier,
            reason: exit.reason,
            site_function: site_function.0,
            bytecode_offset,
            frames: frames.len(),
            invalidated,
            made_ineligible,
        };
        if exit.reason.counts_toward_ineligibility() {
            info!(
                function = %unit.name,
                reason = %exit.reason,
                pc = bytecode_offset,
                frames = frames.len(),
                "deoptimized"
            );
        } else {
            debug!(
                function = %unit.name,
                reason = %exit.reason,
                pc = bytecode_offset,
                "left compiled code"
            );
        }
        self.remember(record.clone());

        Ok(Deoptimization {
            frames,
            resume: exit.resume,
            record,
        })
    }

    fn remember(&mut self, record: DeoptRecord) {
        self.total += 1;
        *self.by_reason.entry(record.reason).or_insert(0) += 1;
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    pub fn history(&self) -> impl Iterator<Item = &DeoptRecord> {
        self.history.iter()
    }

    /// Most recent deopt of `function`
    pub fn last_for(&self, function: FunctionId) -> Option<&DeoptRecord> {
        self.history.iter().rev().find(|r| r.function_id == function.0)
    }

    pub fn count(&self, reason: DeoptReason) -> u64 {
        self.by_reason.get(&reason).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Counts per reason, sorted by reason
    pub fn counts(&self) -> Vec<(DeoptReason, u64)> {
        let mut counts: Vec<_> = self.by_reason.iter().map(|(r, c)| (*r, *c)).collect();
        counts.sort();
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BinaryOp, FunctionBuilder, Instruction, Program};
    use crate::config::EngineConfig;
    use crate::jit::compiler::{CompileRequest, CompilerOptions, Lir, SpeculativeCompiler};
    use crate::jit::feedback::FeedbackStore;
    use pretty_assertions::assert_eq;
    use rustc_hash::FxHashMap;

    fn optimized_add() -> (Program, Arc<CompiledUnit>) {
        let mut program = Program::new();
        let mut b = FunctionBuilder::new("add", 2);
        let r = b.register();
        b.emit(Instruction::Binary { op: BinaryOp::Add, dst: r, lhs: 0, rhs: 1 });
        b.emit(Instruction::Return { src: r });
        let id = program.add(b).unwrap();
        let code = Arc::clone(program.get(id).unwrap());

        let mut store = FeedbackStore::new(4);
        store.begin_invocation(id, code.version);
        store.record_arithmetic(id, 0, &Value::Smi(1), Some(&Value::Smi(2)), &Value::Smi(3));
        let request = CompileRequest {
            function: id,
            tier: Tier::Optimized,
            ticket: 1,
            osr_entry: None,
            feedback: store.snapshot(id, code.version),
            code,
            candidates: FxHashMap::default(),
        };
        let compiler = SpeculativeCompiler::new(CompilerOptions::from(&EngineConfig::default()));
        (program, Arc::new(compiler.compile(&request).unwrap()))
    }

    fn first_guard_state(unit: &CompiledUnit) -> FrameStateId {
        unit.lir
            .iter()
            .find_map(|l| match l {
                Lir::CheckSmi { state, .. } => Some(*state),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_reason_classification() {
        assert!(DeoptReason::TypeMismatch.invalidates_code());
        assert!(DeoptReason::ExplicitRequest.invalidates_code());
        assert!(!DeoptReason::LazyInvalidation.invalidates_code());
        assert!(!DeoptReason::ExceptionUnwind.invalidates_code());
        assert!(!DeoptReason::ExplicitRequest.counts_toward_ineligibility());
        assert!(DeoptReason::Overflow.counts_toward_ineligibility());
    }

    #[test]
    fn test_trigger_reconstructs_frame_and_invalidates() {
        let (_program, unit) = optimized_add();
        let mut tiers = TierManager::new(&EngineConfig::default());
        tiers.record_mut(unit.function, "add");
        tiers.install(Arc::clone(&unit));

        let mut deopt = DeoptimizationEngine::new();
        let slots = vec![Slot::Tagged(Value::string("x")), Slot::Tagged(Value::Smi(2)), Slot::default()];
        let result = deopt
            .trigger(
                &mut tiers,
                &unit,
                DeoptExit {
                    state: first_guard_state(&unit),
                    reason: DeoptReason::TypeMismatch,
                    resume: ResumeAt::Before,
                    slots,
                },
            )
            .unwrap();

        assert_eq!(result.frames.len(), 1);
        let frame = &result.frames[0];
        assert_eq!(frame.pc, 0);
        assert_eq!(frame.registers, vec![Value::string("x"), Value::Smi(2), Value::Undefined]);
        assert!(!unit.is_valid());
        assert_eq!(tiers.tier(unit.function), Tier::Interpreted);
        assert_eq!(deopt.count(DeoptReason::TypeMismatch), 1);
        assert_eq!(deopt.last_for(unit.function).unwrap().reason, DeoptReason::TypeMismatch);
    }

    #[test]
    fn test_exception_unwind_keeps_code() {
        let (_program, unit) = optimized_add();
        let mut tiers = TierManager::new(&EngineConfig::default());
        tiers.record_mut(unit.function, "add");
        let mut deopt = DeoptimizationEngine::new();
        let slots = vec![Slot::Tagged(Value::Smi(1)), Slot::Tagged(Value::Smi(2)), Slot::default()];
        let result = deopt
            .trigger(
                &mut tiers,
                &unit,
                DeoptExit {
                    state: first_guard_state(&unit),
                    reason: DeoptReason::ExceptionUnwind,
                    resume: ResumeAt::Throw(Value::string("boom")),
                    slots,
                },
            )
            .unwrap();
        assert!(unit.is_valid());
        assert!(!result.record.invalidated);
        assert!(matches!(result.resume, ResumeAt::Throw(_)));
    }

    #[test]
    fn test_unknown_state_is_a_coverage_gap() {
        let (_program, unit) = optimized_add();
        let mut tiers = TierManager::new(&EngineConfig::default());
        let mut deopt = DeoptimizationEngine::new();
        let err = deopt
            .trigger(
                &mut tiers,
                &unit,
                DeoptExit {
                    state: FrameStateId(999),
                    reason: DeoptReason::TypeMismatch,
                    resume: ResumeAt::Before,
                    slots: Vec::new(),
                },
            )
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
