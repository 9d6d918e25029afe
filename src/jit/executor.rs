//! Compiled code execution
//!
//! Runs the LIR of a `CompiledUnit` over a frame of `Slot`s. Guards that fail
//! and throws that need a handler leave through a `DeoptExit`; the engine
//! turns that into interpreter frames. Baseline units record feedback exactly
//! like the interpreter does.

use super::compiler::{CompiledUnit, Lir, SlotId};
use super::deopt::{DeoptExit, DeoptReason, ResumeAt};
use super::frame_state::Slot;
use super::tiering::Tier;
use crate::bytecode::{CompareOp, Intrinsic, UnaryOp};
use crate::engine::Engine;
use crate::error::Error;
use crate::runtime::{ops, Abrupt, Completion, Value};
use std::sync::Arc;

/// How a run of compiled code ended
#[derive(Debug)]
pub enum ExecOutcome {
    Return(Value),
    Deopt(DeoptExit),
}

/// What a loop back-edge safe point decided
#[derive(Debug)]
pub enum SafePointAction {
    Continue,
    /// Leave compiled code through the back-edge frame state
    Deoptimize,
    /// The rest of the invocation ran elsewhere (OSR) and returned this
    Return(Value),
}

#[inline]
fn tagged(slots: &[Slot], slot: SlotId) -> Value {
    slots[slot as usize].to_value()
}

#[inline]
fn int_of(slot: &Slot) -> i32 {
    match slot {
        Slot::Int(i) => *i,
        other => other.to_value().to_int32(),
    }
}

#[inline]
fn float_of(slot: &Slot) -> f64 {
    match slot {
        Slot::Float(f) => *f,
        Slot::Int(i) => *i as f64,
        Slot::Tagged(v) => v.to_number(),
    }
}

fn int_unary(op: UnaryOp, a: i32) -> Option<i32> {
    match op {
        UnaryOp::Neg if a == 0 => None,
        UnaryOp::Neg => a.checked_neg(),
        UnaryOp::Inc => a.checked_add(1),
        UnaryOp::Dec => a.checked_sub(1),
        UnaryOp::BitNot => Some(!a),
        UnaryOp::Not | UnaryOp::ToNumber => None,
    }
}

fn float_unary(op: UnaryOp, a: f64) -> f64 {
    match op {
        UnaryOp::Neg => -a,
        UnaryOp::Inc => a + 1.0,
        UnaryOp::Dec => a - 1.0,
        _ => a,
    }
}

fn number_compare(op: CompareOp, lhs: &Slot, rhs: &Slot) -> bool {
    if let (Slot::Int(a), Slot::Int(b)) = (lhs, rhs) {
        return match op {
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
            CompareOp::Eq | CompareOp::StrictEq => a == b,
            CompareOp::Ne | CompareOp::StrictNe => a != b,
        };
    }
    let (a, b) = (float_of(lhs), float_of(rhs));
    match op {
        CompareOp::Lt => a < b,
        CompareOp::Le => a <= b,
        CompareOp::Gt => a > b,
        CompareOp::Ge => a >= b,
        CompareOp::Eq | CompareOp::StrictEq => a == b,
        CompareOp::Ne | CompareOp::StrictNe => a != b,
    }
}

/// Run `unit` from LIR index `entry` with the given frame
pub fn execute(
    engine: &mut Engine,
    unit: &Arc<CompiledUnit>,
    mut slots: Vec<Slot>,
    entry: usize,
) -> Completion<ExecOutcome> {
    let function = unit.function;
    let collects = unit.tier == Tier::Baseline;
    let mut pc = entry;

    macro_rules! deopt {
        ($state:expr, $reason:expr, $resume:expr) => {
            return Ok(ExecOutcome::Deopt(DeoptExit {
                state: $state,
                reason: $reason,
                resume: $resume,
                slots,
            }))
        };
    }

    // Language exceptions leave compiled code; the interpreter owns handlers
    macro_rules! throwing {
        ($completion:expr, $state:expr) => {
            match $completion {
                Ok(value) => value,
                Err(Abrupt::Throw(exception)) => {
                    deopt!($state, DeoptReason::ExceptionUnwind, ResumeAt::Throw(exception))
                }
                Err(fatal) => return Err(fatal),
            }
        };
    }

    loop {
        let Some(lir) = unit.lir.get(pc) else {
            return Err(Error::internal(format!("{} ran past its last instruction", unit.name)).into());
        };
        pc += 1;

        match lir {
            Lir::LoadConst { dst, value } => slots[*dst as usize] = Slot::Tagged(value.to_value()),
            Lir::LoadInt { dst, value } => slots[*dst as usize] = Slot::Int(*value),
            Lir::LoadFunction { dst, function } => {
                slots[*dst as usize] = Slot::Tagged(Value::Function(*function));
            }
            Lir::Move { dst, src } => slots[*dst as usize] = slots[*src as usize].clone(),
            Lir::Tag { slot } => {
                let value = tagged(&slots, *slot);
                slots[*slot as usize] = Slot::Tagged(value);
            }

            // ==================== Representation checks ====================
            Lir::CheckSmi { slot, state } => {
                let unboxed = match &slots[*slot as usize] {
                    Slot::Int(i) => Some(*i),
                    Slot::Tagged(Value::Smi(i)) => Some(*i),
                    Slot::Float(f) if f.fract() == 0.0 && !(*f == 0.0 && f.is_sign_negative()) => {
                        i32::try_from(*f as i64).ok().filter(|i| *i as f64 == *f)
                    }
                    _ => None,
                };
                match unboxed {
                    Some(i) => slots[*slot as usize] = Slot::Int(i),
                    None => deopt!(*state, DeoptReason::TypeMismatch, ResumeAt::Before),
                }
            }
            Lir::CheckNumber { slot, state } => {
                let unboxed = match &slots[*slot as usize] {
                    Slot::Float(f) => Some(*f),
                    Slot::Int(i) => Some(*i as f64),
                    Slot::Tagged(v) => v.as_f64(),
                };
                match unboxed {
                    Some(f) => slots[*slot as usize] = Slot::Float(f),
                    None => deopt!(*state, DeoptReason::TypeMismatch, ResumeAt::Before),
                }
            }

            // ==================== Arithmetic ====================
            Lir::IntBinary { op, dst, lhs, rhs, state } => {
                let a = int_of(&slots[*lhs as usize]);
                let b = int_of(&slots[*rhs as usize]);
                match op.eval(a, b) {
                    Some(r) => slots[*dst as usize] = Slot::Int(r),
                    None => deopt!(*state, DeoptReason::Overflow, ResumeAt::Before),
                }
            }
            Lir::IntUnary { op, dst, src, state } => {
                match int_unary(*op, int_of(&slots[*src as usize])) {
                    Some(r) => slots[*dst as usize] = Slot::Int(r),
                    None => deopt!(*state, DeoptReason::Overflow, ResumeAt::Before),
                }
            }
            Lir::FloatBinary { op, dst, lhs, rhs } => {
                let r = op.eval(float_of(&slots[*lhs as usize]), float_of(&slots[*rhs as usize]));
                slots[*dst as usize] = Slot::Float(r);
            }
            Lir::FloatUnary { op, dst, src } => {
                let r = float_unary(*op, float_of(&slots[*src as usize]));
                slots[*dst as usize] = Slot::Float(r);
            }
            Lir::NumberCompare { op, dst, lhs, rhs } => {
                let r = number_compare(*op, &slots[*lhs as usize], &slots[*rhs as usize]);
                slots[*dst as usize] = Slot::Tagged(Value::Bool(r));
            }
            Lir::GenericBinary { op, dst, lhs, rhs, site } => {
                let (a, b) = (tagged(&slots, *lhs), tagged(&slots, *rhs));
                let r = ops::binary(*op, &a, &b);
                if collects {
                    engine.feedback.record_arithmetic(function, *site, &a, Some(&b), &r);
                }
                slots[*dst as usize] = Slot::Tagged(r);
            }
            Lir::GenericUnary { op, dst, src, site } => {
                let a = tagged(&slots, *src);
                let r = ops::unary(*op, &a);
                if collects {
                    engine.feedback.record_arithmetic(function, *site, &a, None, &r);
                }
                slots[*dst as usize] = Slot::Tagged(r);
            }
            Lir::GenericCompare { op, dst, lhs, rhs, site } => {
                let (a, b) = (tagged(&slots, *lhs), tagged(&slots, *rhs));
                let r = Value::Bool(ops::compare(*op, &a, &b));
                if collects {
                    engine.feedback.record_arithmetic(function, *site, &a, Some(&b), &r);
                }
                slots[*dst as usize] = Slot::Tagged(r);
            }

            // ==================== Properties and elements ====================
            Lir::LoadNamed { dst, object, name, site, state } => {
                let receiver = tagged(&slots, *object);
                if collects {
                    engine.feedback.observe_named(function, *site, &engine.shapes, &receiver, name);
                }
                let value = throwing!(ops::get_named(&engine.shapes, &receiver, name), *state);
                slots[*dst as usize] = Slot::Tagged(value);
            }
            Lir::LoadNamedShaped { dst, object, cases, state } => {
                let receiver = tagged(&slots, *object);
                let Value::Object(obj) = &receiver else {
                    deopt!(*state, DeoptReason::TypeMismatch, ResumeAt::Before)
                };
                let loaded = {
                    let obj = obj.borrow();
                    let shape = obj.shape();
                    cases
                        .iter()
                        .find(|case| case.shape == shape)
                        .map(|case| case.offset.map(|o| obj.slot(o)).unwrap_or(Value::Undefined))
                };
                match loaded {
                    Some(value) => slots[*dst as usize] = Slot::Tagged(value),
                    None => deopt!(*state, DeoptReason::ShapeMismatch, ResumeAt::Before),
                }
            }
            Lir::StoreNamed { object, name, src, site, state } => {
                let receiver = tagged(&slots, *object);
                if collects {
                    engine.feedback.observe_named(function, *site, &engine.shapes, &receiver, name);
                }
                let value = tagged(&slots, *src);
                throwing!(ops::set_named(&mut engine.shapes, &receiver, name, value), *state);
            }
            Lir::StoreNamedShaped { object, cases, src, state } => {
                let receiver = tagged(&slots, *object);
                let Value::Object(obj) = &receiver else {
                    deopt!(*state, DeoptReason::TypeMismatch, ResumeAt::Before)
                };
                let shape = obj.borrow().shape();
                match cases.iter().find(|(s, _)| *s == shape) {
                    Some((_, offset)) => {
                        let value = tagged(&slots, *src);
                        obj.borrow_mut().set_slot(*offset, value);
                    }
                    None => deopt!(*state, DeoptReason::ShapeMismatch, ResumeAt::Before),
                }
            }
            Lir::LoadIndexed { dst, array, index, site, state } => {
                let (target, key) = (tagged(&slots, *array), tagged(&slots, *index));
                if collects {
                    engine.feedback.observe_element(function, *site, &target, &key);
                }
                let value = throwing!(ops::get_indexed(&engine.shapes, &target, &key), *state);
                slots[*dst as usize] = Slot::Tagged(value);
            }
            Lir::LoadElement { dst, array, index, holey, state } => {
                let target = tagged(&slots, *array);
                let Value::Array(arr) = &target else {
                    deopt!(*state, DeoptReason::TypeMismatch, ResumeAt::Before)
                };
                let i = match slots[*index as usize] {
                    Slot::Int(i) | Slot::Tagged(Value::Smi(i)) => Some(i),
                    _ => None,
                };
                let Some(i) = i else {
                    deopt!(*state, DeoptReason::TypeMismatch, ResumeAt::Before)
                };
                let element = {
                    let arr = arr.borrow();
                    match usize::try_from(i).ok().filter(|i| *i < arr.len()) {
                        None => Err(DeoptReason::OutOfBounds),
                        Some(i) => match arr.get(i) {
                            Some(value) => Ok(value),
                            None if *holey => Ok(Value::Undefined),
                            None => Err(DeoptReason::HoleEncountered),
                        },
                    }
                };
                match element {
                    Ok(value) => slots[*dst as usize] = Slot::Tagged(value),
                    Err(reason) => deopt!(*state, reason, ResumeAt::Before),
                }
            }
            Lir::StoreIndexed { array, index, src, state } => {
                let (target, key, value) = (tagged(&slots, *array), tagged(&slots, *index), tagged(&slots, *src));
                throwing!(ops::set_indexed(&mut engine.shapes, &target, &key, value), *state);
            }
            Lir::NewObject { dst, keys, first } => {
                let values = (0..keys.len() as SlotId).map(|i| tagged(&slots, first + i)).collect();
                let object = ops::new_object(&mut engine.shapes, keys, values);
                slots[*dst as usize] = Slot::Tagged(object);
            }
            Lir::NewArray { dst, elements } => {
                let values = elements.iter().map(|e| e.map(|s| tagged(&slots, s))).collect();
                slots[*dst as usize] = Slot::Tagged(ops::new_array(values));
            }

            // ==================== Calls ====================
            Lir::CheckCallee { callee, expected, state } => match tagged(&slots, *callee) {
                Value::Function(id) if id == *expected => {}
                _ => deopt!(*state, DeoptReason::WrongCalleeOrArity, ResumeAt::Before),
            },
            Lir::Call { dst, callee, args, site, state } => {
                let target = tagged(&slots, *callee);
                if collects {
                    engine.feedback.observe_call(function, *site, &target);
                }
                let args = args.iter().map(|a| tagged(&slots, *a)).collect();
                let value = throwing!(engine.call_value(&target, args), *state);
                if !unit.is_valid() {
                    deopt!(*state, DeoptReason::LazyInvalidation, ResumeAt::After(value));
                }
                slots[*dst as usize] = Slot::Tagged(value);
            }
            Lir::CallDirect { dst, function: target, args, state } => {
                let args = args.iter().map(|a| tagged(&slots, *a)).collect();
                let value = throwing!(engine.invoke(*target, args), *state);
                if !unit.is_valid() {
                    deopt!(*state, DeoptReason::LazyInvalidation, ResumeAt::After(value));
                }
                slots[*dst as usize] = Slot::Tagged(value);
            }

            // ==================== Control flow ====================
            Lir::Jump { target } => pc = *target,
            Lir::JumpIf { cond, when, target, site } => {
                let taken = tagged(&slots, *cond).to_boolean() == *when;
                if collects {
                    engine.feedback.record_branch(function, *site, taken);
                }
                if taken {
                    pc = *target;
                }
            }
            Lir::DeoptIf { cond, when, state } => {
                if tagged(&slots, *cond).to_boolean() == *when {
                    deopt!(*state, DeoptReason::Unreachable, ResumeAt::Before);
                }
            }
            Lir::LoopCheck { header, state } => {
                match engine.compiled_back_edge(unit, *header, *state, &slots)? {
                    SafePointAction::Continue => {}
                    SafePointAction::Deoptimize => {
                        deopt!(*state, DeoptReason::ExplicitRequest, ResumeAt::Before)
                    }
                    SafePointAction::Return(value) => return Ok(ExecOutcome::Return(value)),
                }
            }
            Lir::Intrinsic { dst, intrinsic, arg, state } => {
                let value = match intrinsic {
                    Intrinsic::DeoptimizeNow if unit.tier == Tier::Optimized => deopt!(
                        *state,
                        DeoptReason::ExplicitRequest,
                        ResumeAt::After(Value::Undefined)
                    ),
                    Intrinsic::ActiveTierIsOptimized => Value::Bool(unit.tier == Tier::Optimized),
                    Intrinsic::OptimizeOsr => {
                        if unit.tier == Tier::Baseline {
                            engine.request_osr(function);
                        }
                        Value::Undefined
                    }
                    other => {
                        let argument = tagged(&slots, *arg);
                        throwing!(engine.run_intrinsic(*other, argument, function), *state)
                    }
                };
                if !unit.is_valid() {
                    deopt!(*state, DeoptReason::LazyInvalidation, ResumeAt::After(value));
                }
                slots[*dst as usize] = Slot::Tagged(value);
            }
            Lir::Throw { src, state } => {
                let exception = tagged(&slots, *src);
                deopt!(*state, DeoptReason::ExceptionUnwind, ResumeAt::Throw(exception));
            }
            Lir::Return { src } => return Ok(ExecOutcome::Return(tagged(&slots, *src))),
        }
    }
}
