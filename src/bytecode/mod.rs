//! Bytecode representation
//!
//! A deliberately small register-based bytecode: enough to drive the tiering
//! engine with arithmetic, property and element access, calls, loops and
//! exceptions. `FunctionCode` is immutable once built and is shared with
//! background compile workers through `Arc`.

mod instruction;

pub use instruction::{BinaryOp, CompareOp, Instruction, Intrinsic, Reg, UnaryOp};

use crate::error::{Error, Result};
use crate::runtime::Value;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identity of a function in a `Program`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

/// Constant pool entry. Constants are `Send` so compile workers can read them.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Undefined,
    Null,
    Bool(bool),
    Smi(i32),
    Number(f64),
    Str(Arc<str>),
}

impl Constant {
    pub fn to_value(&self) -> Value {
        match self {
            Constant::Undefined => Value::Undefined,
            Constant::Null => Value::Null,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Smi(i) => Value::Smi(*i),
            Constant::Number(n) => Value::number(*n),
            Constant::Str(s) => Value::string(s),
        }
    }

    pub fn as_str(&self) -> Option<&Arc<str>> {
        match self {
            Constant::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Exception handler range: a throw at `start <= pc < end` lands at
/// `handler` with the exception value in register `exception`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerEntry {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub exception: Reg,
}

/// An immutable compiled function body
#[derive(Debug, Clone)]
pub struct FunctionCode {
    pub id: FunctionId,
    pub name: String,
    pub param_count: u16,
    pub register_count: u16,
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Constant>,
    /// Innermost handlers first
    pub handlers: Vec<HandlerEntry>,
    /// Hash of the body, used to reject stale feedback snapshots
    pub version: u64,
}

impl FunctionCode {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn constant(&self, index: u16) -> &Constant {
        static UNDEFINED: Constant = Constant::Undefined;
        self.constants.get(index as usize).unwrap_or(&UNDEFINED)
    }

    /// Property name stored at constant `index`
    pub fn name_at(&self, index: u16) -> Arc<str> {
        self.constant(index)
            .as_str()
            .cloned()
            .unwrap_or_else(|| Arc::from("undefined"))
    }

    /// Innermost exception handler covering `pc`
    pub fn handler_for(&self, pc: u32) -> Option<&HandlerEntry> {
        self.handlers.iter().find(|h| h.start <= pc && pc < h.end)
    }

    /// Targets of backward jumps; each one identifies a loop
    pub fn loop_headers(&self) -> Vec<u32> {
        let mut headers: Vec<u32> = self
            .instructions
            .iter()
            .enumerate()
            .filter_map(|(pc, insn)| match insn {
                Instruction::Jump { target } if (*target as usize) <= pc => Some(*target),
                _ => None,
            })
            .collect();
        headers.sort_unstable();
        headers.dedup();
        headers
    }

    /// Whether `pc` starts a basic block
    pub fn block_leaders(&self) -> Vec<bool> {
        let mut leaders = vec![false; self.instructions.len() + 1];
        if let Some(first) = leaders.first_mut() {
            *first = true;
        }
        for (pc, insn) in self.instructions.iter().enumerate() {
            if let Some(target) = insn.jump_target() {
                leaders[target as usize] = true;
                leaders[pc + 1] = true;
            }
            if insn.ends_block() {
                leaders[pc + 1] = true;
            }
        }
        for handler in &self.handlers {
            leaders[handler.handler as usize] = true;
            leaders[handler.start as usize] = true;
            leaders[handler.end as usize] = true;
        }
        leaders
    }

    /// Print a disassembly listing
    pub fn disassemble(&self) -> String {
        let mut out = format!(
            "== {} ({} params, {} registers) ==\n",
            self.name, self.param_count, self.register_count
        );
        for (pc, insn) in self.instructions.iter().enumerate() {
            out.push_str(&format!("{:>4}  {}\n", pc, insn));
        }
        for (i, k) in self.constants.iter().enumerate() {
            out.push_str(&format!("  k{} = {:?}\n", i, k));
        }
        out
    }
}

/// Forward-referencable branch target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// An open `try` range
#[derive(Debug)]
pub struct TryRegion {
    start: u32,
}

/// Builds a `FunctionCode` with labels and handler ranges
#[derive(Debug)]
pub struct FunctionBuilder {
    name: String,
    param_count: u16,
    register_count: u16,
    instructions: Vec<Instruction>,
    constants: Vec<Constant>,
    handlers: Vec<HandlerEntry>,
    labels: Vec<Option<u32>>,
    patches: Vec<(usize, Label)>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, param_count: u16) -> Self {
        Self {
            name: name.into(),
            param_count,
            register_count: param_count,
            instructions: Vec::new(),
            constants: Vec::new(),
            handlers: Vec::new(),
            labels: Vec::new(),
            patches: Vec::new(),
        }
    }

    /// Parameter register
    pub fn param(&self, index: u16) -> Reg {
        debug_assert!(index < self.param_count);
        index
    }

    /// Allocate a fresh local register
    pub fn register(&mut self) -> Reg {
        let reg = self.register_count;
        self.register_count += 1;
        reg
    }

    /// Allocate `count` consecutive registers, returning the first
    pub fn registers(&mut self, count: u16) -> Reg {
        let first = self.register_count;
        self.register_count += count;
        first
    }

    /// Intern a constant
    pub fn constant(&mut self, constant: Constant) -> u16 {
        if let Some(index) = self.constants.iter().position(|k| *k == constant) {
            return index as u16;
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u16
    }

    /// Intern a property name
    pub fn name(&mut self, name: &str) -> u16 {
        self.constant(Constant::Str(Arc::from(name)))
    }

    /// Next instruction's pc
    pub fn pc(&self) -> u32 {
        self.instructions.len() as u32
    }

    pub fn emit(&mut self, insn: Instruction) -> u32 {
        let pc = self.pc();
        self.instructions.push(insn);
        pc
    }

    pub fn load_smi(&mut self, dst: Reg, value: i32) -> u32 {
        let index = self.constant(Constant::Smi(value));
        self.emit(Instruction::LoadConst { dst, index })
    }

    pub fn load_number(&mut self, dst: Reg, value: f64) -> u32 {
        let index = self.constant(Constant::Number(value));
        self.emit(Instruction::LoadConst { dst, index })
    }

    pub fn load_str(&mut self, dst: Reg, value: &str) -> u32 {
        let index = self.constant(Constant::Str(Arc::from(value)));
        self.emit(Instruction::LoadConst { dst, index })
    }

    pub fn get_named(&mut self, dst: Reg, object: Reg, name: &str) -> u32 {
        let name = self.name(name);
        self.emit(Instruction::GetNamed { dst, object, name })
    }

    pub fn set_named(&mut self, object: Reg, name: &str, src: Reg) -> u32 {
        let name = self.name(name);
        self.emit(Instruction::SetNamed { object, name, src })
    }

    /// Object literal from consecutive registers starting at `first`
    pub fn new_object(&mut self, dst: Reg, keys: &[&str], first: Reg) -> u32 {
        let keys: Box<[u16]> = keys.iter().map(|k| self.name(k)).collect();
        self.emit(Instruction::NewObject { dst, keys, first })
    }

    pub fn intrinsic(&mut self, dst: Reg, intrinsic: Intrinsic, arg: Reg) -> u32 {
        self.emit(Instruction::Intrinsic { dst, intrinsic, arg })
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next instruction
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.pc());
    }

    pub fn jump(&mut self, label: Label) -> u32 {
        self.patches.push((self.instructions.len(), label));
        self.emit(Instruction::Jump { target: u32::MAX })
    }

    pub fn jump_if_false(&mut self, cond: Reg, label: Label) -> u32 {
        self.patches.push((self.instructions.len(), label));
        self.emit(Instruction::JumpIfFalse { cond, target: u32::MAX })
    }

    pub fn jump_if_true(&mut self, cond: Reg, label: Label) -> u32 {
        self.patches.push((self.instructions.len(), label));
        self.emit(Instruction::JumpIfTrue { cond, target: u32::MAX })
    }

    pub fn begin_try(&mut self) -> TryRegion {
        TryRegion { start: self.pc() }
    }

    /// Close a `try` range whose handler starts at `handler`
    pub fn end_try(&mut self, region: TryRegion, handler: Label, exception: Reg) {
        self.handlers.push(HandlerEntry {
            start: region.start,
            end: self.pc(),
            handler: u32::MAX,
            exception,
        });
        self.patches.push((usize::MAX - (self.handlers.len() - 1), handler));
    }

    /// Resolve labels and produce the finished body
    pub fn finish(mut self, id: FunctionId) -> Result<FunctionCode> {
        for (site, label) in std::mem::take(&mut self.patches) {
            let target = self.labels[label.0]
                .ok_or_else(|| Error::internal(format!("unbound label in {}", self.name)))?;
            if site > usize::MAX / 2 {
                self.handlers[usize::MAX - site].handler = target;
                continue;
            }
            match &mut self.instructions[site] {
                Instruction::Jump { target: t }
                | Instruction::JumpIfFalse { target: t, .. }
                | Instruction::JumpIfTrue { target: t, .. } => *t = target,
                _ => return Err(Error::internal("label patch on non-branch")),
            }
        }
        if !matches!(
            self.instructions.last(),
            Some(Instruction::Return { .. } | Instruction::Throw { .. } | Instruction::Jump { .. })
        ) {
            let dst = self.register();
            self.emit(Instruction::LoadUndefined { dst });
            self.emit(Instruction::Return { src: dst });
        }
        for insn in &self.instructions {
            if let Some(target) = insn.jump_target() {
                if target as usize >= self.instructions.len() {
                    return Err(Error::internal(format!("branch out of range in {}", self.name)));
                }
            }
        }

        let mut hasher = DefaultHasher::new();
        self.name.hash(&mut hasher);
        format!("{:?}{:?}{:?}", self.instructions, self.constants, self.handlers).hash(&mut hasher);

        Ok(FunctionCode {
            id,
            name: self.name,
            param_count: self.param_count,
            register_count: self.register_count,
            instructions: self.instructions,
            constants: self.constants,
            handlers: self.handlers,
            version: hasher.finish(),
        })
    }
}

/// The function table
#[derive(Debug, Clone, Default)]
pub struct Program {
    functions: Vec<Option<Arc<FunctionCode>>>,
    names: Vec<String>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id so bodies can reference functions defined later
    pub fn declare(&mut self, name: impl Into<String>) -> FunctionId {
        self.functions.push(None);
        self.names.push(name.into());
        FunctionId((self.functions.len() - 1) as u32)
    }

    /// Attach a body to a declared id
    pub fn define(&mut self, id: FunctionId, builder: FunctionBuilder) -> Result<FunctionId> {
        let slot = self
            .functions
            .get_mut(id.0 as usize)
            .ok_or_else(|| Error::reference_error(format!("{} was never declared", id)))?;
        *slot = Some(Arc::new(builder.finish(id)?));
        Ok(id)
    }

    /// Declare and define in one step
    pub fn add(&mut self, builder: FunctionBuilder) -> Result<FunctionId> {
        let id = self.declare(builder.name.clone());
        self.define(id, builder)
    }

    pub fn get(&self, id: FunctionId) -> Option<&Arc<FunctionCode>> {
        self.functions.get(id.0 as usize)?.as_ref()
    }

    /// Defined functions in id order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<FunctionCode>> {
        self.functions.iter().flatten()
    }

    pub fn find(&self, name: &str) -> Option<FunctionId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| FunctionId(i as u32))
    }

    pub fn name_of(&self, id: FunctionId) -> &str {
        self.names.get(id.0 as usize).map(String::as_str).unwrap_or("<unknown>")
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
