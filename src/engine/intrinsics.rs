//! Engine intrinsics
//!
//! Test-harness controls reachable from bytecode through
//! `Instruction::Intrinsic`. Compiled code answers the frame-local ones
//! (`DeoptimizeNow`, `ActiveTierIsOptimized`) itself; everything that ends
//! up here runs with interpreter semantics.

use super::Engine;
use crate::bytecode::{FunctionId, Intrinsic};
use crate::error::messages;
use crate::runtime::{Abrupt, Completion, Value};
use tracing::trace;

fn function_argument(argument: &Value) -> Completion<FunctionId> {
    match argument {
        Value::Function(id) => Ok(*id),
        other => Err(Abrupt::type_error(messages::not_a_function(&other.to_js_string()))),
    }
}

impl Engine {
    /// Run `intrinsic` on behalf of `current`
    pub(crate) fn run_intrinsic(
        &mut self,
        intrinsic: Intrinsic,
        argument: Value,
        current: FunctionId,
    ) -> Completion<Value> {
        trace!(?intrinsic, function = %current, "intrinsic");
        let value = match intrinsic {
            Intrinsic::PrepareFunctionForOptimization => {
                self.prepare(function_argument(&argument)?);
                Value::Undefined
            }
            Intrinsic::OptimizeFunctionOnNextCall => {
                self.optimize_on_next_call(function_argument(&argument)?);
                Value::Undefined
            }
            Intrinsic::OptimizeOsr => {
                self.request_osr(current);
                Value::Undefined
            }
            // Interpreted frames have nothing to leave
            Intrinsic::DeoptimizeNow => Value::Undefined,
            Intrinsic::DeoptimizeFunction => {
                self.deoptimize_function(function_argument(&argument)?);
                Value::Undefined
            }
            Intrinsic::NeverOptimizeFunction => {
                self.never_optimize(function_argument(&argument)?);
                Value::Undefined
            }
            Intrinsic::IsOptimized => Value::Bool(self.is_optimized(function_argument(&argument)?)),
            Intrinsic::ActiveTierIsOptimized => Value::Bool(false),
            Intrinsic::GetTier => Value::string(self.tier(function_argument(&argument)?).as_str()),
            Intrinsic::FinalizeOptimization => {
                self.finalize_optimization();
                Value::Undefined
            }
            Intrinsic::ScheduleBreak => {
                self.debugger.schedule();
                Value::Undefined
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{FunctionBuilder, Instruction, Program};
    use crate::config::EngineConfig;
    use crate::jit::Tier;

    fn engine() -> (Engine, FunctionId) {
        let mut program = Program::new();
        let mut b = FunctionBuilder::new("id", 1);
        b.emit(Instruction::Return { src: 0 });
        let id = program.add(b).unwrap();
        (Engine::new(program, EngineConfig::default()).unwrap(), id)
    }

    #[test]
    fn test_function_argument_required() {
        let (mut engine, id) = engine();
        let err = engine
            .run_intrinsic(Intrinsic::IsOptimized, Value::Smi(1), id)
            .unwrap_err();
        assert!(matches!(err, Abrupt::Throw(Value::Str(ref s)) if s.contains("is not a function")));
    }

    #[test]
    fn test_tier_queries() {
        let (mut engine, id) = engine();
        let tier = engine
            .run_intrinsic(Intrinsic::GetTier, Value::Function(id), id)
            .unwrap();
        assert_eq!(tier, Value::string(Tier::Interpreted.as_str()));
        let active = engine
            .run_intrinsic(Intrinsic::ActiveTierIsOptimized, Value::Undefined, id)
            .unwrap();
        assert_eq!(active, Value::Bool(false));
    }

    #[test]
    fn test_optimize_on_next_call() {
        let (mut engine, id) = engine();
        engine.call(id, &[Value::Smi(1)]).unwrap();
        engine
            .run_intrinsic(Intrinsic::OptimizeFunctionOnNextCall, Value::Function(id), id)
            .unwrap();
        assert_eq!(engine.call(id, &[Value::Smi(2)]).unwrap(), Value::Smi(2));
        assert!(engine.is_optimized(id));
    }
}
