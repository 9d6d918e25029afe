//! Register-machine instruction set
//!
//! Registers `0..param_count` hold the parameters; the rest are locals and
//! temporaries. A program counter is an index into the instruction vector
//! and doubles as the "bytecode offset" recorded in feedback and frame state.

use super::FunctionId;
use std::fmt;

/// Register index
pub type Reg = u16;

/// Arithmetic and bitwise operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Exp,
    BitOr,
    BitAnd,
    BitXor,
    Shl,
    /// Arithmetic shift right (`>>`)
    Sar,
    /// Logical shift right (`>>>`)
    Shr,
}

impl BinaryOp {
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinaryOp::BitOr | BinaryOp::BitAnd | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Sar | BinaryOp::Shr
        )
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Inc,
    Dec,
    BitNot,
    Not,
    ToNumber,
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
}

impl CompareOp {
    pub fn is_relational(self) -> bool {
        matches!(self, CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge)
    }
}

/// Engine control surface reachable from bytecode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    /// Start tracking feedback for the function in the argument register
    PrepareFunctionForOptimization,
    /// Compile and activate the argument function before its next call
    OptimizeFunctionOnNextCall,
    /// Request OSR of the current function at the next back-edge
    OptimizeOsr,
    /// Deoptimize the current frame right here
    DeoptimizeNow,
    /// Invalidate optimized code of the argument function
    DeoptimizeFunction,
    /// Pin the argument function to the interpreter
    NeverOptimizeFunction,
    /// Whether the argument function has optimized code installed
    IsOptimized,
    /// Whether the current frame runs fastest-tier code
    ActiveTierIsOptimized,
    /// Installed tier of the argument function, as a string
    GetTier,
    /// Wait for background compilations and install them
    FinalizeOptimization,
    /// Ask the debugger to break at the next safe point
    ScheduleBreak,
}

impl Intrinsic {
    /// Whether the intrinsic reads its argument register
    pub fn takes_argument(self) -> bool {
        matches!(
            self,
            Intrinsic::PrepareFunctionForOptimization
                | Intrinsic::OptimizeFunctionOnNextCall
                | Intrinsic::DeoptimizeFunction
                | Intrinsic::NeverOptimizeFunction
                | Intrinsic::IsOptimized
                | Intrinsic::GetTier
        )
    }
}

/// A single bytecode instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    LoadConst { dst: Reg, index: u16 },
    LoadUndefined { dst: Reg },
    LoadFunction { dst: Reg, function: FunctionId },
    Move { dst: Reg, src: Reg },
    Binary { op: BinaryOp, dst: Reg, lhs: Reg, rhs: Reg },
    Unary { op: UnaryOp, dst: Reg, src: Reg },
    Compare { op: CompareOp, dst: Reg, lhs: Reg, rhs: Reg },
    Jump { target: u32 },
    JumpIfFalse { cond: Reg, target: u32 },
    JumpIfTrue { cond: Reg, target: u32 },
    /// `dst = object[constants[name]]`
    GetNamed { dst: Reg, object: Reg, name: u16 },
    /// `object[constants[name]] = src`
    SetNamed { object: Reg, name: u16, src: Reg },
    GetIndexed { dst: Reg, array: Reg, index: Reg },
    SetIndexed { array: Reg, index: Reg, src: Reg },
    /// Object literal: key `keys[i]` takes the value of register `first + i`
    NewObject { dst: Reg, keys: Box<[u16]>, first: Reg },
    /// Array literal; `None` entries are holes
    NewArray { dst: Reg, elements: Box<[Option<Reg>]> },
    /// Call the function in `callee` with `argc` arguments from `first_arg`
    Call { dst: Reg, callee: Reg, first_arg: Reg, argc: u16 },
    Throw { src: Reg },
    Return { src: Reg },
    Intrinsic { dst: Reg, intrinsic: Intrinsic, arg: Reg },
}

impl Instruction {
    /// Branch target, if this instruction can transfer control
    pub fn jump_target(&self) -> Option<u32> {
        match self {
            Instruction::Jump { target }
            | Instruction::JumpIfFalse { target, .. }
            | Instruction::JumpIfTrue { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// Whether control never falls through to the next instruction
    pub fn ends_block(&self) -> bool {
        matches!(
            self,
            Instruction::Jump { .. } | Instruction::Return { .. } | Instruction::Throw { .. }
        )
    }

    /// Whether the interpreter records feedback for this instruction
    pub fn collects_feedback(&self) -> bool {
        matches!(
            self,
            Instruction::Binary { .. }
                | Instruction::Unary { .. }
                | Instruction::Compare { .. }
                | Instruction::JumpIfFalse { .. }
                | Instruction::JumpIfTrue { .. }
                | Instruction::GetNamed { .. }
                | Instruction::SetNamed { .. }
                | Instruction::GetIndexed { .. }
                | Instruction::Call { .. }
        )
    }

    /// Register written by this instruction
    pub fn destination(&self) -> Option<Reg> {
        match self {
            Instruction::LoadConst { dst, .. }
            | Instruction::LoadUndefined { dst }
            | Instruction::LoadFunction { dst, .. }
            | Instruction::Move { dst, .. }
            | Instruction::Binary { dst, .. }
            | Instruction::Unary { dst, .. }
            | Instruction::Compare { dst, .. }
            | Instruction::GetNamed { dst, .. }
            | Instruction::GetIndexed { dst, .. }
            | Instruction::NewObject { dst, .. }
            | Instruction::NewArray { dst, .. }
            | Instruction::Call { dst, .. }
            | Instruction::Intrinsic { dst, .. } => Some(*dst),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::LoadConst { dst, index } => write!(f, "r{} = k{}", dst, index),
            Instruction::LoadUndefined { dst } => write!(f, "r{} = undefined", dst),
            Instruction::LoadFunction { dst, function } => write!(f, "r{} = {}", dst, function),
            Instruction::Move { dst, src } => write!(f, "r{} = r{}", dst, src),
            Instruction::Binary { op, dst, lhs, rhs } => {
                write!(f, "r{} = {:?} r{}, r{}", dst, op, lhs, rhs)
            }
            Instruction::Unary { op, dst, src } => write!(f, "r{} = {:?} r{}", dst, op, src),
            Instruction::Compare { op, dst, lhs, rhs } => {
                write!(f, "r{} = {:?} r{}, r{}", dst, op, lhs, rhs)
            }
            Instruction::Jump { target } => write!(f, "jump @{}", target),
            Instruction::JumpIfFalse { cond, target } => write!(f, "jump_if_false r{} @{}", cond, target),
            Instruction::JumpIfTrue { cond, target } => write!(f, "jump_if_true r{} @{}", cond, target),
            Instruction::GetNamed { dst, object, name } => write!(f, "r{} = r{}.k{}", dst, object, name),
            Instruction::SetNamed { object, name, src } => write!(f, "r{}.k{} = r{}", object, name, src),
            Instruction::GetIndexed { dst, array, index } => write!(f, "r{} = r{}[r{}]", dst, array, index),
            Instruction::SetIndexed { array, index, src } => write!(f, "r{}[r{}] = r{}", array, index, src),
            Instruction::NewObject { dst, keys, first } => {
                write!(f, "r{} = new_object {} keys from r{}", dst, keys.len(), first)
            }
            Instruction::NewArray { dst, elements } => write!(f, "r{} = new_array [{}]", dst, elements.len()),
            Instruction::Call { dst, callee, first_arg, argc } => {
                write!(f, "r{} = call r{}(r{}..+{})", dst, callee, first_arg, argc)
            }
            Instruction::Throw { src } => write!(f, "throw r{}", src),
            Instruction::Return { src } => write!(f, "return r{}", src),
            Instruction::Intrinsic { dst, intrinsic, arg } => {
                write!(f, "r{} = %{:?}(r{})", dst, intrinsic, arg)
            }
        }
    }
}
