//! Interpreter frames

use crate::bytecode::{FunctionCode, FunctionId, Instruction, Reg};
use crate::runtime::Value;
use std::sync::Arc;

/// One activation in the interpreter tier. Deoptimization produces exactly
/// these, one per logical frame of the failing compiled code.
#[derive(Debug, Clone)]
pub struct InterpreterFrame {
    pub code: Arc<FunctionCode>,
    pub pc: u32,
    pub registers: Vec<Value>,
}

impl InterpreterFrame {
    /// Fresh frame at function entry. Missing arguments are undefined and
    /// extra ones are dropped.
    pub fn new(code: Arc<FunctionCode>, args: Vec<Value>) -> Self {
        let mut registers = vec![Value::Undefined; code.register_count as usize];
        for (register, arg) in registers
            .iter_mut()
            .zip(args.into_iter().take(code.param_count as usize))
        {
            *register = arg;
        }
        Self {
            code,
            pc: 0,
            registers,
        }
    }

    /// Frame reconstructed mid-function
    pub fn resume(code: Arc<FunctionCode>, pc: u32, registers: Vec<Value>) -> Self {
        Self { code, pc, registers }
    }

    pub fn function(&self) -> FunctionId {
        self.code.id
    }

    #[inline]
    pub fn get(&self, reg: Reg) -> Value {
        self.registers
            .get(reg as usize)
            .cloned()
            .unwrap_or(Value::Undefined)
    }

    #[inline]
    pub fn set(&mut self, reg: Reg, value: Value) {
        if let Some(slot) = self.registers.get_mut(reg as usize) {
            *slot = value;
        }
    }

    /// The instruction at `pc` finished with `value`: store it where that
    /// instruction writes and move on. A caller frame waiting in a call
    /// receives its callee's return value this way.
    pub fn complete(&mut self, value: Value) {
        let dst = self
            .code
            .instructions
            .get(self.pc as usize)
            .and_then(Instruction::destination);
        if let Some(dst) = dst {
            self.set(dst, value);
        }
        self.pc += 1;
    }
}
