//! Bytecode interpreter
//!
//! The interpreter is the tier every function starts in and the tier every
//! deopt lands in. It runs an explicit stack of [`InterpreterFrame`]s so that
//! a deopt out of inlined code can hand over several frames at once; calls
//! that start in the interpreter recurse through the engine instead.
//!
//! Every instruction that can specialize later records type feedback here.
//! Backward jumps are the only safe points inside a function and are where
//! on-stack replacement is attempted.

mod frame;

pub use frame::InterpreterFrame;

use crate::bytecode::Instruction;
use crate::engine::Engine;
use crate::error::Error;
use crate::jit::ResumeAt;
use crate::runtime::{ops, Abrupt, Completion, Value};
use std::sync::Arc;

/// Find a handler for `exception`, popping frames that have none.
/// Returns false once the stack is empty.
fn unwind(stack: &mut Vec<InterpreterFrame>, exception: Value) -> bool {
    while let Some(frame) = stack.last_mut() {
        if let Some(handler) = frame.code.handler_for(frame.pc).copied() {
            frame.set(handler.exception, exception);
            frame.pc = handler.handler;
            return true;
        }
        stack.pop();
    }
    false
}

/// How the current instruction hands over control
enum Flow {
    Next,
    Jump(u32),
    Return(Value),
    /// The exception escaped the top frame entirely; continue with its caller
    Rethrow(Value),
}

impl Engine {
    /// Run `stack` (outermost frame first) to completion. `resume` says how
    /// the innermost frame continues.
    pub(crate) fn interpret(
        &mut self,
        mut stack: Vec<InterpreterFrame>,
        resume: ResumeAt,
    ) -> Completion<Value> {
        let mut pending = None;
        match resume {
            ResumeAt::Before => {}
            ResumeAt::After(value) => {
                if let Some(frame) = stack.last_mut() {
                    frame.complete(value);
                }
            }
            ResumeAt::Throw(exception) => pending = Some(exception),
        }

        loop {
            if let Some(exception) = pending.take() {
                if !unwind(&mut stack, exception.clone()) {
                    return Err(Abrupt::Throw(exception));
                }
            }
            let Some(frame) = stack.last_mut() else {
                return Err(Error::internal("interpreter ran out of frames").into());
            };
            let code = Arc::clone(&frame.code);
            let function = code.id;
            let pc = frame.pc;
            let Some(insn) = code.instructions.get(pc as usize) else {
                return Err(Error::internal(format!("{} ran past its last instruction", code.name)).into());
            };

            // Language exceptions stay at `pc` so the handler lookup sees the
            // throwing instruction
            macro_rules! catching {
                ($completion:expr) => {
                    match $completion {
                        Ok(value) => value,
                        Err(Abrupt::Throw(exception)) => {
                            pending = Some(exception);
                            continue;
                        }
                        Err(fatal) => return Err(fatal),
                    }
                };
            }

            let flow = match insn {
                Instruction::LoadConst { dst, index } => {
                    frame.set(*dst, code.constant(*index).to_value());
                    Flow::Next
                }
                Instruction::LoadUndefined { dst } => {
                    frame.set(*dst, Value::Undefined);
                    Flow::Next
                }
                Instruction::LoadFunction { dst, function } => {
                    frame.set(*dst, Value::Function(*function));
                    Flow::Next
                }
                Instruction::Move { dst, src } => {
                    let value = frame.get(*src);
                    frame.set(*dst, value);
                    Flow::Next
                }
                Instruction::Binary { op, dst, lhs, rhs } => {
                    let (a, b) = (frame.get(*lhs), frame.get(*rhs));
                    let r = ops::binary(*op, &a, &b);
                    self.feedback.record_arithmetic(function, pc, &a, Some(&b), &r);
                    frame.set(*dst, r);
                    Flow::Next
                }
                Instruction::Unary { op, dst, src } => {
                    let a = frame.get(*src);
                    let r = ops::unary(*op, &a);
                    self.feedback.record_arithmetic(function, pc, &a, None, &r);
                    frame.set(*dst, r);
                    Flow::Next
                }
                Instruction::Compare { op, dst, lhs, rhs } => {
                    let (a, b) = (frame.get(*lhs), frame.get(*rhs));
                    let r = Value::Bool(ops::compare(*op, &a, &b));
                    self.feedback.record_arithmetic(function, pc, &a, Some(&b), &r);
                    frame.set(*dst, r);
                    Flow::Next
                }

                Instruction::Jump { target } if *target <= pc => {
                    match self.maybe_osr(&code, *target, &frame.registers) {
                        Ok(Some(value)) => Flow::Return(value),
                        Ok(None) => Flow::Jump(*target),
                        Err(Abrupt::Throw(exception)) => Flow::Rethrow(exception),
                        Err(fatal) => return Err(fatal),
                    }
                }
                Instruction::Jump { target } => Flow::Jump(*target),
                Instruction::JumpIfFalse { cond, target } => {
                    let taken = !frame.get(*cond).to_boolean();
                    self.feedback.record_branch(function, pc, taken);
                    if taken {
                        Flow::Jump(*target)
                    } else {
                        Flow::Next
                    }
                }
                Instruction::JumpIfTrue { cond, target } => {
                    let taken = frame.get(*cond).to_boolean();
                    self.feedback.record_branch(function, pc, taken);
                    if taken {
                        Flow::Jump(*target)
                    } else {
                        Flow::Next
                    }
                }

                Instruction::GetNamed { dst, object, name } => {
                    let receiver = frame.get(*object);
                    let key = code.name_at(*name);
                    self.feedback.observe_named(function, pc, &self.shapes, &receiver, &key);
                    let value = catching!(ops::get_named(&self.shapes, &receiver, &key));
                    frame.set(*dst, value);
                    Flow::Next
                }
                Instruction::SetNamed { object, name, src } => {
                    let receiver = frame.get(*object);
                    let key = code.name_at(*name);
                    self.feedback.observe_named(function, pc, &self.shapes, &receiver, &key);
                    let value = frame.get(*src);
                    catching!(ops::set_named(&mut self.shapes, &receiver, &key, value));
                    Flow::Next
                }
                Instruction::GetIndexed { dst, array, index } => {
                    let (target, key) = (frame.get(*array), frame.get(*index));
                    self.feedback.observe_element(function, pc, &target, &key);
                    let value = catching!(ops::get_indexed(&self.shapes, &target, &key));
                    frame.set(*dst, value);
                    Flow::Next
                }
                Instruction::SetIndexed { array, index, src } => {
                    let (target, key, value) = (frame.get(*array), frame.get(*index), frame.get(*src));
                    catching!(ops::set_indexed(&mut self.shapes, &target, &key, value));
                    Flow::Next
                }
                Instruction::NewObject { dst, keys, first } => {
                    let names: Vec<Arc<str>> = keys.iter().map(|k| code.name_at(*k)).collect();
                    let values = (0..keys.len() as u16).map(|i| frame.get(first + i)).collect();
                    let object = ops::new_object(&mut self.shapes, &names, values);
                    frame.set(*dst, object);
                    Flow::Next
                }
                Instruction::NewArray { dst, elements } => {
                    let values = elements.iter().map(|e| e.map(|r| frame.get(r))).collect();
                    frame.set(*dst, ops::new_array(values));
                    Flow::Next
                }

                Instruction::Call { dst, callee, first_arg, argc } => {
                    let target = frame.get(*callee);
                    self.feedback.observe_call(function, pc, &target);
                    let args = (0..*argc).map(|i| frame.get(first_arg + i)).collect();
                    let value = catching!(self.call_value(&target, args));
                    frame.set(*dst, value);
                    Flow::Next
                }
                Instruction::Intrinsic { dst, intrinsic, arg } => {
                    let argument = frame.get(*arg);
                    let value = catching!(self.run_intrinsic(*intrinsic, argument, function));
                    frame.set(*dst, value);
                    Flow::Next
                }
                Instruction::Throw { src } => {
                    pending = Some(frame.get(*src));
                    continue;
                }
                Instruction::Return { src } => Flow::Return(frame.get(*src)),
            };

            match flow {
                Flow::Next => frame.pc = pc + 1,
                Flow::Jump(target) => frame.pc = target,
                Flow::Return(value) => {
                    stack.pop();
                    match stack.last_mut() {
                        Some(caller) => caller.complete(value),
                        None => return Ok(value),
                    }
                }
                Flow::Rethrow(exception) => {
                    stack.pop();
                    if stack.is_empty() {
                        return Err(Abrupt::Throw(exception));
                    }
                    pending = Some(exception);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BinaryOp, FunctionBuilder, FunctionCode, Program};

    fn code(builder: FunctionBuilder) -> Arc<FunctionCode> {
        let mut program = Program::new();
        let id = program.add(builder).unwrap();
        Arc::clone(program.get(id).unwrap())
    }

    #[test]
    fn test_unwind_finds_handler() {
        let mut b = FunctionBuilder::new("catcher", 0);
        let exc = b.register();
        let region = b.begin_try();
        b.emit(Instruction::Throw { src: exc });
        let handler = b.label();
        b.end_try(region, handler, exc);
        b.bind(handler);
        b.emit(Instruction::Return { src: exc });
        let code = code(b);

        let mut stack = vec![InterpreterFrame::new(Arc::clone(&code), Vec::new())];
        assert!(unwind(&mut stack, Value::Smi(7)));
        assert_eq!(stack[0].get(exc), Value::Smi(7));
        assert_eq!(stack[0].pc, code.handler_for(0).unwrap().handler);
    }

    #[test]
    fn test_unwind_pops_frames_without_handlers() {
        let mut b = FunctionBuilder::new("plain", 1);
        let r = b.register();
        b.emit(Instruction::Binary { op: BinaryOp::Add, dst: r, lhs: 0, rhs: 0 });
        b.emit(Instruction::Return { src: r });
        let code = code(b);
        let mut stack = vec![
            InterpreterFrame::new(Arc::clone(&code), vec![Value::Smi(1)]),
            InterpreterFrame::new(code, vec![Value::Smi(2)]),
        ];
        assert!(!unwind(&mut stack, Value::Undefined));
        assert!(stack.is_empty());
    }
}
