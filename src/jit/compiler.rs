//! Speculative compiler
//!
//! Lowers bytecode to a small register-transfer IR (`Lir`) over the slots of
//! a compiled frame. Baseline units are non-speculative: every operation is
//! the generic one and feedback keeps being collected. Optimized units pick a
//! representation per operation from the feedback snapshot: raw integer
//! arithmetic with overflow checks, raw float arithmetic, shape-checked field
//! loads, kind-checked element loads, callee checks with inlining. Each check
//! refers to a `FrameStateEntry`; a unit is only handed out after every
//! deopt-capable instruction has been verified to have one.
//!
//! Representations are tracked per basic block. All raw slots are boxed
//! before control leaves a block, so block entries (and OSR entries) always
//! see tagged registers.

use super::feedback::{CacheState, CallTarget, ElementKinds, FeedbackSnapshot, ShapeEntry};
use super::frame_state::{
    FrameStateId, FrameStateRecorder, FrameStateTable, LiveValue, LogicalFrame, Representation,
    ValueLocation,
};
use super::tiering::Tier;
use crate::bytecode::{
    BinaryOp, CompareOp, Constant, FunctionCode, FunctionId, Instruction, Intrinsic, Reg, UnaryOp,
};
use crate::config::EngineConfig;
use crate::error::{CompileFailure, Error, Result};
use crate::runtime::ShapeId;
use rustc_hash::FxHashMap as HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Index of a slot in a compiled frame
pub type SlotId = u32;

// ==================== LIR ====================

/// Raw integer operations; the ones that can leave the int32 range deopt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitOr,
    BitAnd,
    BitXor,
    Shl,
    Sar,
    Shr,
}

impl IntOp {
    fn from_binary(op: BinaryOp) -> Option<IntOp> {
        Some(match op {
            BinaryOp::Add => IntOp::Add,
            BinaryOp::Sub => IntOp::Sub,
            BinaryOp::Mul => IntOp::Mul,
            BinaryOp::Div => IntOp::Div,
            BinaryOp::Mod => IntOp::Mod,
            BinaryOp::BitOr => IntOp::BitOr,
            BinaryOp::BitAnd => IntOp::BitAnd,
            BinaryOp::BitXor => IntOp::BitXor,
            BinaryOp::Shl => IntOp::Shl,
            BinaryOp::Sar => IntOp::Sar,
            BinaryOp::Shr => IntOp::Shr,
            BinaryOp::Exp => return None,
        })
    }

    /// Evaluate; `None` when the result is not an int32 or would be -0
    pub fn eval(self, a: i32, b: i32) -> Option<i32> {
        match self {
            IntOp::Add => a.checked_add(b),
            IntOp::Sub => a.checked_sub(b),
            IntOp::Mul => match a.checked_mul(b)? {
                0 if a < 0 || b < 0 => None,
                r => Some(r),
            },
            IntOp::Div => {
                if b == 0 || (a == 0 && b < 0) || a.checked_rem(b)? != 0 {
                    None
                } else {
                    a.checked_div(b)
                }
            }
            IntOp::Mod => {
                if b == 0 {
                    return None;
                }
                match a.wrapping_rem(b) {
                    0 if a < 0 => None,
                    r => Some(r),
                }
            }
            IntOp::BitOr => Some(a | b),
            IntOp::BitAnd => Some(a & b),
            IntOp::BitXor => Some(a ^ b),
            IntOp::Shl => Some(a.wrapping_shl(b as u32 & 31)),
            IntOp::Sar => Some(a >> (b as u32 & 31)),
            IntOp::Shr => i32::try_from((a as u32) >> (b as u32 & 31)).ok(),
        }
    }
}

/// Raw float operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl FloatOp {
    fn from_binary(op: BinaryOp) -> Option<FloatOp> {
        Some(match op {
            BinaryOp::Add => FloatOp::Add,
            BinaryOp::Sub => FloatOp::Sub,
            BinaryOp::Mul => FloatOp::Mul,
            BinaryOp::Div => FloatOp::Div,
            BinaryOp::Mod => FloatOp::Mod,
            _ => return None,
        })
    }

    pub fn eval(self, a: f64, b: f64) -> f64 {
        match self {
            FloatOp::Add => a + b,
            FloatOp::Sub => a - b,
            FloatOp::Mul => a * b,
            FloatOp::Div => a / b,
            FloatOp::Mod => a % b,
        }
    }
}

/// Low-level instruction over compiled-frame slots
#[derive(Debug, Clone, PartialEq)]
pub enum Lir {
    LoadConst { dst: SlotId, value: Constant },
    /// Load an untagged integer constant
    LoadInt { dst: SlotId, value: i32 },
    LoadFunction { dst: SlotId, function: FunctionId },
    Move { dst: SlotId, src: SlotId },
    /// Box a raw slot in place
    Tag { slot: SlotId },
    /// Unbox to a raw integer in place, or deopt
    CheckSmi { slot: SlotId, state: FrameStateId },
    /// Unbox to a raw float in place, or deopt
    CheckNumber { slot: SlotId, state: FrameStateId },
    IntBinary { op: IntOp, dst: SlotId, lhs: SlotId, rhs: SlotId, state: FrameStateId },
    IntUnary { op: UnaryOp, dst: SlotId, src: SlotId, state: FrameStateId },
    FloatBinary { op: FloatOp, dst: SlotId, lhs: SlotId, rhs: SlotId },
    FloatUnary { op: UnaryOp, dst: SlotId, src: SlotId },
    /// Compare two raw numbers, producing a tagged boolean
    NumberCompare { op: CompareOp, dst: SlotId, lhs: SlotId, rhs: SlotId },
    GenericBinary { op: BinaryOp, dst: SlotId, lhs: SlotId, rhs: SlotId, site: u32 },
    GenericUnary { op: UnaryOp, dst: SlotId, src: SlotId, site: u32 },
    GenericCompare { op: CompareOp, dst: SlotId, lhs: SlotId, rhs: SlotId, site: u32 },
    LoadNamed { dst: SlotId, object: SlotId, name: Arc<str>, site: u32, state: FrameStateId },
    /// Field load for the observed shapes; any other receiver deopts
    LoadNamedShaped { dst: SlotId, object: SlotId, cases: Box<[ShapeEntry]>, state: FrameStateId },
    StoreNamed { object: SlotId, name: Arc<str>, src: SlotId, site: u32, state: FrameStateId },
    StoreNamedShaped {
        object: SlotId,
        cases: Box<[(ShapeId, usize)]>,
        src: SlotId,
        state: FrameStateId,
    },
    LoadIndexed { dst: SlotId, array: SlotId, index: SlotId, site: u32, state: FrameStateId },
    /// In-bounds array element load; holes read as undefined only when `holey`
    LoadElement { dst: SlotId, array: SlotId, index: SlotId, holey: bool, state: FrameStateId },
    StoreIndexed { array: SlotId, index: SlotId, src: SlotId, state: FrameStateId },
    NewObject { dst: SlotId, keys: Box<[Arc<str>]>, first: SlotId },
    NewArray { dst: SlotId, elements: Box<[Option<SlotId>]> },
    CheckCallee { callee: SlotId, expected: FunctionId, state: FrameStateId },
    Call { dst: SlotId, callee: SlotId, args: Box<[SlotId]>, site: u32, state: FrameStateId },
    CallDirect { dst: SlotId, function: FunctionId, args: Box<[SlotId]>, state: FrameStateId },
    Jump { target: usize },
    /// Jump when `to_boolean(cond) == when`
    JumpIf { cond: SlotId, when: bool, target: usize, site: u32 },
    /// Deopt when `to_boolean(cond) == when`; the branch was never seen going that way
    DeoptIf { cond: SlotId, when: bool, state: FrameStateId },
    /// Safe point on a loop back-edge
    LoopCheck { header: u32, state: FrameStateId },
    Intrinsic { dst: SlotId, intrinsic: Intrinsic, arg: SlotId, state: FrameStateId },
    Throw { src: SlotId, state: FrameStateId },
    Return { src: SlotId },
}

impl Lir {
    /// Frame state of an instruction that can leave compiled code
    pub fn frame_state(&self) -> Option<FrameStateId> {
        match self {
            Lir::CheckSmi { state, .. }
            | Lir::CheckNumber { state, .. }
            | Lir::IntBinary { state, .. }
            | Lir::IntUnary { state, .. }
            | Lir::LoadNamed { state, .. }
            | Lir::LoadNamedShaped { state, .. }
            | Lir::StoreNamed { state, .. }
            | Lir::StoreNamedShaped { state, .. }
            | Lir::LoadIndexed { state, .. }
            | Lir::LoadElement { state, .. }
            | Lir::StoreIndexed { state, .. }
            | Lir::CheckCallee { state, .. }
            | Lir::Call { state, .. }
            | Lir::CallDirect { state, .. }
            | Lir::DeoptIf { state, .. }
            | Lir::LoopCheck { state, .. }
            | Lir::Intrinsic { state, .. }
            | Lir::Throw { state, .. } => Some(*state),
            _ => None,
        }
    }

    /// Whether this instruction can deoptimize, throw or suspend
    pub fn can_deopt(&self) -> bool {
        !matches!(
            self,
            Lir::LoadConst { .. }
                | Lir::LoadInt { .. }
                | Lir::LoadFunction { .. }
                | Lir::Move { .. }
                | Lir::Tag { .. }
                | Lir::FloatBinary { .. }
                | Lir::FloatUnary { .. }
                | Lir::NumberCompare { .. }
                | Lir::GenericBinary { .. }
                | Lir::GenericUnary { .. }
                | Lir::GenericCompare { .. }
                | Lir::NewObject { .. }
                | Lir::NewArray { .. }
                | Lir::Jump { .. }
                | Lir::JumpIf { .. }
                | Lir::Return { .. }
        )
    }

    /// Whether this is a speculation guard rather than a throw or call point
    pub fn is_guard(&self) -> bool {
        matches!(
            self,
            Lir::CheckSmi { .. }
                | Lir::CheckNumber { .. }
                | Lir::IntBinary { .. }
                | Lir::IntUnary { .. }
                | Lir::LoadNamedShaped { .. }
                | Lir::StoreNamedShaped { .. }
                | Lir::LoadElement { .. }
                | Lir::CheckCallee { .. }
                | Lir::DeoptIf { .. }
        )
    }
}

// ==================== Compiled Unit ====================

/// What a unit's entry point is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Entered at function entry
    Function,
    /// Entered mid-function at a loop header
    Osr { loop_header: u32 },
}

/// Compiled code for one (function, tier) pair
#[derive(Debug)]
pub struct CompiledUnit {
    pub function: FunctionId,
    pub name: String,
    pub tier: Tier,
    pub kind: UnitKind,
    pub ticket: u64,
    pub code: Arc<FunctionCode>,
    pub lir: Vec<Lir>,
    /// LIR index where execution starts
    pub entry: usize,
    pub slot_count: usize,
    pub frame_states: FrameStateTable,
    /// Feedback the speculation was based on
    pub feedback: FeedbackSnapshot,
    /// Bodies inlined into this unit
    pub inlined: Vec<Arc<FunctionCode>>,
    pub guards: usize,
    pub compile_time: Duration,
    valid: AtomicBool,
}

impl CompiledUnit {
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn is_osr(&self) -> bool {
        matches!(self.kind, UnitKind::Osr { .. })
    }

    /// Bytecode for a function appearing in this unit's frame states
    pub fn code_for(&self, function: FunctionId) -> Option<&Arc<FunctionCode>> {
        if function == self.function {
            return Some(&self.code);
        }
        self.inlined.iter().find(|c| c.id == function)
    }

    /// Print the LIR listing
    pub fn disassemble(&self) -> String {
        let mut out = format!("== {} [{}] {:?} ==\n", self.name, self.tier, self.kind);
        for (i, lir) in self.lir.iter().enumerate() {
            let marker = if i == self.entry { ">" } else { " " };
            out.push_str(&format!("{}{:>4}  {:?}\n", marker, i, lir));
        }
        out
    }
}

impl fmt::Display for CompiledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {} LIR, {} guards, {} frame states",
            self.name,
            self.tier,
            self.lir.len(),
            self.guards,
            self.frame_states.len()
        )
    }
}

// ==================== Compile Request ====================

/// Bytecode and feedback of a function the compiler may inline
#[derive(Debug, Clone)]
pub struct InlineCandidate {
    pub code: Arc<FunctionCode>,
    pub feedback: FeedbackSnapshot,
}

/// Everything a compile needs; owned so it can move to a worker thread
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub function: FunctionId,
    pub tier: Tier,
    pub ticket: u64,
    pub osr_entry: Option<u32>,
    pub code: Arc<FunctionCode>,
    pub feedback: FeedbackSnapshot,
    pub candidates: HashMap<FunctionId, InlineCandidate>,
}

/// Inlining limits
#[derive(Debug, Clone, Copy)]
pub struct CompilerOptions {
    pub max_inline_bytecode_length: usize,
    pub max_inline_depth: usize,
}

impl From<&EngineConfig> for CompilerOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_inline_bytecode_length: config.max_inline_bytecode_length,
            max_inline_depth: config.max_inline_depth,
        }
    }
}

// ==================== Compiler ====================

/// Turns compile requests into compiled units
#[derive(Debug, Clone, Copy)]
pub struct SpeculativeCompiler {
    options: CompilerOptions,
}

impl SpeculativeCompiler {
    pub fn new(options: CompilerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    /// Compile a request. Failures are `Error::CompileFailed` (retryable) or
    /// `Error::FrameStateCoverageGap` (a compiler defect).
    pub fn compile(&self, request: &CompileRequest) -> Result<CompiledUnit> {
        let start = Instant::now();
        let code = &request.code;
        if request.feedback.code_version != code.version {
            return Err(CompileFailure::ContradictoryFeedback.into());
        }
        match request.tier {
            Tier::Interpreted => {
                return Err(Error::internal("cannot compile for the interpreter tier"))
            }
            Tier::Optimized if request.feedback.invocations == 0 => {
                return Err(CompileFailure::InsufficientFeedback.into())
            }
            _ => {}
        }

        let mut lowering = Lowering {
            request,
            options: &self.options,
            tier: request.tier,
            lir: Vec::new(),
            recorder: FrameStateRecorder::new(),
            slot_count: code.register_count as u32,
            inlined: Vec::new(),
            guards: 0,
        };
        let mut ctx = Context::root(code, &request.feedback);
        let labels = lowering.lower_body(&mut ctx)?;

        let (kind, entry) = match request.osr_entry {
            None => (UnitKind::Function, 0),
            Some(loop_header) => {
                let entry = labels
                    .get(loop_header as usize)
                    .copied()
                    .filter(|&l| l != usize::MAX)
                    .ok_or_else(|| Error::internal(format!("no loop header at {}", loop_header)))?;
                (UnitKind::Osr { loop_header }, entry)
            }
        };

        let frame_states = lowering.recorder.finish();
        let mut layouts: HashMap<FunctionId, usize> = HashMap::default();
        layouts.insert(code.id, code.register_count as usize);
        for inlined in &lowering.inlined {
            layouts.insert(inlined.id, inlined.register_count as usize);
        }
        verify_coverage(code.id, &lowering.lir, &frame_states, &layouts)?;

        let unit = CompiledUnit {
            function: request.function,
            name: code.name.clone(),
            tier: request.tier,
            kind,
            ticket: request.ticket,
            code: Arc::clone(code),
            lir: lowering.lir,
            entry,
            slot_count: lowering.slot_count as usize,
            frame_states,
            feedback: request.feedback.clone(),
            inlined: lowering.inlined,
            guards: lowering.guards,
            compile_time: start.elapsed(),
            valid: AtomicBool::new(true),
        };
        debug!(
            function = %unit.name,
            tier = ?unit.tier,
            kind = ?unit.kind,
            lir = unit.lir.len(),
            guards = unit.guards,
            inlined = unit.inlined.len(),
            "compiled"
        );
        Ok(unit)
    }
}

/// Check that every instruction able to leave compiled code has a frame
/// state, and that each state matches the interpreter frame layout
pub fn verify_coverage(
    function: FunctionId,
    lir: &[Lir],
    table: &FrameStateTable,
    layouts: &HashMap<FunctionId, usize>,
) -> Result<()> {
    for (lir_index, insn) in lir.iter().enumerate() {
        if !insn.can_deopt() {
            continue;
        }
        let entry = insn
            .frame_state()
            .and_then(|id| table.get(id))
            .ok_or(Error::FrameStateCoverageGap { function, lir_index })?;
        for frame in &entry.frames {
            if layouts.get(&frame.function) != Some(&frame.values.len()) {
                return Err(Error::FrameStateCoverageGap { function, lir_index });
            }
        }
    }
    Ok(())
}

/// An enclosing frame of an inlined body
#[derive(Debug, Clone, Copy)]
struct OuterFrame {
    function: FunctionId,
    call_pc: u32,
    base: SlotId,
    register_count: u16,
}

/// Lowering state for one (possibly inlined) function body
struct Context<'c> {
    code: &'c FunctionCode,
    feedback: &'c FeedbackSnapshot,
    base: SlotId,
    repr: Vec<Representation>,
    /// Registers holding a constant loaded in the current block
    known: Vec<Option<Constant>>,
    outer: Vec<OuterFrame>,
    /// Where an inlined body delivers its result, and the jumps to patch
    inline_return: Option<(SlotId, Vec<usize>)>,
}

impl<'c> Context<'c> {
    fn root(code: &'c FunctionCode, feedback: &'c FeedbackSnapshot) -> Self {
        Self::new(code, feedback, 0, Vec::new(), None)
    }

    fn new(
        code: &'c FunctionCode,
        feedback: &'c FeedbackSnapshot,
        base: SlotId,
        outer: Vec<OuterFrame>,
        inline_return: Option<(SlotId, Vec<usize>)>,
    ) -> Self {
        let registers = code.register_count as usize;
        Self {
            code,
            feedback,
            base,
            repr: vec![Representation::Tagged; registers],
            known: vec![None; registers],
            outer,
            inline_return,
        }
    }

    fn slot(&self, reg: Reg) -> SlotId {
        self.base + reg as SlotId
    }

    fn write(&mut self, reg: Reg, repr: Representation) {
        self.repr[reg as usize] = repr;
        self.known[reg as usize] = None;
    }

    fn is_inlined_function(&self, function: FunctionId) -> bool {
        self.code.id == function || self.outer.iter().any(|o| o.function == function)
    }
}

struct Lowering<'r> {
    request: &'r CompileRequest,
    options: &'r CompilerOptions,
    tier: Tier,
    lir: Vec<Lir>,
    recorder: FrameStateRecorder,
    slot_count: u32,
    inlined: Vec<Arc<FunctionCode>>,
    guards: usize,
}

impl<'r> Lowering<'r> {
    fn optimizing(&self) -> bool {
        self.tier == Tier::Optimized
    }

    /// Lower a whole body; returns the LIR index of every bytecode offset
    fn lower_body(&mut self, ctx: &mut Context<'_>) -> Result<Vec<usize>> {
        let code = ctx.code;
        let leaders = code.block_leaders();
        let mut labels = vec![usize::MAX; code.len() + 1];
        let mut patches: Vec<(usize, u32)> = Vec::new();

        for (index, insn) in code.instructions.iter().enumerate() {
            let pc = index as u32;
            if leaders[index] {
                let falls_through = index > 0 && !code.instructions[index - 1].ends_block();
                if falls_through {
                    self.tag_all(ctx);
                }
                ctx.repr.fill(Representation::Tagged);
                ctx.known.fill(None);
            }
            labels[index] = self.lir.len();
            self.lower_instruction(ctx, pc, insn, &mut patches)?;
        }

        for (at, target) in patches {
            let resolved = labels[target as usize];
            match &mut self.lir[at] {
                Lir::Jump { target } | Lir::JumpIf { target, .. } => *target = resolved,
                _ => return Err(Error::internal("jump patch on non-jump LIR")),
            }
        }
        Ok(labels)
    }

    fn emit(&mut self, lir: Lir) -> usize {
        if lir.is_guard() {
            self.guards += 1;
        }
        self.lir.push(lir);
        self.lir.len() - 1
    }

    /// Record the frame state at `pc` of the current body
    fn state(&mut self, ctx: &Context<'_>, pc: u32) -> FrameStateId {
        let mut frames: Vec<LogicalFrame> = ctx
            .outer
            .iter()
            .map(|outer| LogicalFrame {
                function: outer.function,
                bytecode_offset: outer.call_pc,
                values: (0..outer.register_count as SlotId)
                    .map(|r| LiveValue::slot(outer.base + r, Representation::Tagged))
                    .collect(),
            })
            .collect();
        frames.push(LogicalFrame {
            function: ctx.code.id,
            bytecode_offset: pc,
            values: ctx
                .repr
                .iter()
                .zip(&ctx.known)
                .enumerate()
                .map(|(r, (repr, known))| match known {
                    Some(k) => LiveValue {
                        representation: Representation::Tagged,
                        location: ValueLocation::Constant(k.clone()),
                    },
                    None => LiveValue::slot(ctx.base + r as SlotId, *repr),
                })
                .collect(),
        });
        self.recorder.record(frames)
    }

    /// Box every raw register of the current body
    fn tag_all(&mut self, ctx: &mut Context<'_>) {
        for reg in 0..ctx.repr.len() {
            if ctx.repr[reg] != Representation::Tagged {
                self.emit(Lir::Tag { slot: ctx.base + reg as SlotId });
                ctx.repr[reg] = Representation::Tagged;
            }
        }
    }

    fn tag(&mut self, ctx: &mut Context<'_>, reg: Reg) {
        if ctx.repr[reg as usize] != Representation::Tagged {
            self.emit(Lir::Tag { slot: ctx.slot(reg) });
            ctx.repr[reg as usize] = Representation::Tagged;
        }
    }

    fn ensure_int(&mut self, ctx: &mut Context<'_>, reg: Reg, pc: u32) {
        if ctx.repr[reg as usize] == Representation::RawInt {
            return;
        }
        let state = self.state(ctx, pc);
        self.emit(Lir::CheckSmi { slot: ctx.slot(reg), state });
        ctx.repr[reg as usize] = Representation::RawInt;
    }

    fn ensure_float(&mut self, ctx: &mut Context<'_>, reg: Reg, pc: u32) {
        if ctx.repr[reg as usize] == Representation::RawFloat {
            return;
        }
        let state = self.state(ctx, pc);
        self.emit(Lir::CheckNumber { slot: ctx.slot(reg), state });
        ctx.repr[reg as usize] = Representation::RawFloat;
    }

    fn lower_instruction(
        &mut self,
        ctx: &mut Context<'_>,
        pc: u32,
        insn: &Instruction,
        patches: &mut Vec<(usize, u32)>,
    ) -> Result<()> {
        match insn {
            Instruction::LoadConst { dst, index } => {
                let value = ctx.code.constant(*index).clone();
                let slot = ctx.slot(*dst);
                match value {
                    Constant::Smi(i) if self.optimizing() => {
                        self.emit(Lir::LoadInt { dst: slot, value: i });
                        ctx.write(*dst, Representation::RawInt);
                    }
                    _ => {
                        self.emit(Lir::LoadConst { dst: slot, value: value.clone() });
                        ctx.write(*dst, Representation::Tagged);
                    }
                }
                ctx.known[*dst as usize] = Some(value);
            }
            Instruction::LoadUndefined { dst } => {
                self.emit(Lir::LoadConst { dst: ctx.slot(*dst), value: Constant::Undefined });
                ctx.write(*dst, Representation::Tagged);
                ctx.known[*dst as usize] = Some(Constant::Undefined);
            }
            Instruction::LoadFunction { dst, function } => {
                self.emit(Lir::LoadFunction { dst: ctx.slot(*dst), function: *function });
                ctx.write(*dst, Representation::Tagged);
            }
            Instruction::Move { dst, src } => {
                self.emit(Lir::Move { dst: ctx.slot(*dst), src: ctx.slot(*src) });
                let (repr, known) = (ctx.repr[*src as usize], ctx.known[*src as usize].clone());
                ctx.write(*dst, repr);
                ctx.known[*dst as usize] = known;
            }
            Instruction::Binary { op, dst, lhs, rhs } => self.lower_binary(ctx, pc, *op, *dst, *lhs, *rhs),
            Instruction::Unary { op, dst, src } => self.lower_unary(ctx, pc, *op, *dst, *src),
            Instruction::Compare { op, dst, lhs, rhs } => {
                let feedback = ctx.feedback.arithmetic(pc).copied().filter(|_| self.optimizing());
                match feedback {
                    Some(fb) if fb.operands_small_int() => {
                        self.ensure_int(ctx, *lhs, pc);
                        self.ensure_int(ctx, *rhs, pc);
                        self.emit_number_compare(ctx, *op, *dst, *lhs, *rhs);
                    }
                    Some(fb) if fb.is_number() => {
                        self.ensure_float(ctx, *lhs, pc);
                        self.ensure_float(ctx, *rhs, pc);
                        self.emit_number_compare(ctx, *op, *dst, *lhs, *rhs);
                    }
                    _ => {
                        self.emit(Lir::GenericCompare {
                            op: *op,
                            dst: ctx.slot(*dst),
                            lhs: ctx.slot(*lhs),
                            rhs: ctx.slot(*rhs),
                            site: pc,
                        });
                        ctx.write(*dst, Representation::Tagged);
                    }
                }
            }
            Instruction::Jump { target } => {
                self.tag_all(ctx);
                if *target <= pc {
                    let state = self.state(ctx, pc);
                    self.emit(Lir::LoopCheck { header: *target, state });
                }
                let at = self.emit(Lir::Jump { target: usize::MAX });
                patches.push((at, *target));
            }
            Instruction::JumpIfFalse { cond, target } | Instruction::JumpIfTrue { cond, target } => {
                let when = matches!(insn, Instruction::JumpIfTrue { .. });
                self.tag_all(ctx);
                let branch = ctx.feedback.branch(pc).copied().filter(|_| self.optimizing());
                match branch {
                    Some(fb) if fb.taken > 0 && fb.not_taken == 0 => {
                        let state = self.state(ctx, pc);
                        self.emit(Lir::DeoptIf { cond: ctx.slot(*cond), when: !when, state });
                        let at = self.emit(Lir::Jump { target: usize::MAX });
                        patches.push((at, *target));
                    }
                    Some(fb) if fb.not_taken > 0 && fb.taken == 0 => {
                        let state = self.state(ctx, pc);
                        self.emit(Lir::DeoptIf { cond: ctx.slot(*cond), when, state });
                    }
                    _ => {
                        let at = self.emit(Lir::JumpIf {
                            cond: ctx.slot(*cond),
                            when,
                            target: usize::MAX,
                            site: pc,
                        });
                        patches.push((at, *target));
                    }
                }
            }
            Instruction::GetNamed { dst, object, name } => {
                let state = self.state(ctx, pc);
                let cases = self.shape_cases(ctx, pc);
                match cases {
                    Some(cases) => {
                        self.emit(Lir::LoadNamedShaped {
                            dst: ctx.slot(*dst),
                            object: ctx.slot(*object),
                            cases,
                            state,
                        });
                    }
                    None => {
                        self.emit(Lir::LoadNamed {
                            dst: ctx.slot(*dst),
                            object: ctx.slot(*object),
                            name: ctx.code.name_at(*name),
                            site: pc,
                            state,
                        });
                    }
                }
                ctx.write(*dst, Representation::Tagged);
            }
            Instruction::SetNamed { object, name, src } => {
                let state = self.state(ctx, pc);
                let stores: Option<Box<[(ShapeId, usize)]>> = self
                    .shape_cases(ctx, pc)
                    .and_then(|cases| cases.iter().map(|c| c.offset.map(|o| (c.shape, o))).collect());
                match stores {
                    Some(cases) => {
                        self.emit(Lir::StoreNamedShaped {
                            object: ctx.slot(*object),
                            cases,
                            src: ctx.slot(*src),
                            state,
                        });
                    }
                    None => {
                        self.emit(Lir::StoreNamed {
                            object: ctx.slot(*object),
                            name: ctx.code.name_at(*name),
                            src: ctx.slot(*src),
                            site: pc,
                            state,
                        });
                    }
                }
            }
            Instruction::GetIndexed { dst, array, index } => {
                let state = self.state(ctx, pc);
                let element = ctx.feedback.element(pc).copied().filter(|_| self.optimizing());
                match element {
                    Some(fb)
                        if !fb.kinds.is_empty()
                            && !fb.kinds.intersects(ElementKinds::OUT_OF_BOUNDS | ElementKinds::NON_ARRAY)
                            && fb.index.is_small_int() =>
                    {
                        self.emit(Lir::LoadElement {
                            dst: ctx.slot(*dst),
                            array: ctx.slot(*array),
                            index: ctx.slot(*index),
                            holey: fb.kinds.contains(ElementKinds::HOLEY),
                            state,
                        });
                    }
                    _ => {
                        self.emit(Lir::LoadIndexed {
                            dst: ctx.slot(*dst),
                            array: ctx.slot(*array),
                            index: ctx.slot(*index),
                            site: pc,
                            state,
                        });
                    }
                }
                ctx.write(*dst, Representation::Tagged);
            }
            Instruction::SetIndexed { array, index, src } => {
                let state = self.state(ctx, pc);
                self.emit(Lir::StoreIndexed {
                    array: ctx.slot(*array),
                    index: ctx.slot(*index),
                    src: ctx.slot(*src),
                    state,
                });
            }
            Instruction::NewObject { dst, keys, first } => {
                let keys: Box<[Arc<str>]> = keys.iter().map(|k| ctx.code.name_at(*k)).collect();
                self.emit(Lir::NewObject { dst: ctx.slot(*dst), keys, first: ctx.slot(*first) });
                ctx.write(*dst, Representation::Tagged);
            }
            Instruction::NewArray { dst, elements } => {
                let elements: Box<[Option<SlotId>]> =
                    elements.iter().map(|e| e.map(|r| ctx.slot(r))).collect();
                self.emit(Lir::NewArray { dst: ctx.slot(*dst), elements });
                ctx.write(*dst, Representation::Tagged);
            }
            Instruction::Call { dst, callee, first_arg, argc } => {
                self.lower_call(ctx, pc, *dst, *callee, *first_arg, *argc)?;
            }
            Instruction::Throw { src } => {
                let state = self.state(ctx, pc);
                self.emit(Lir::Throw { src: ctx.slot(*src), state });
            }
            Instruction::Return { src } => match ctx.inline_return.as_ref().map(|(dst, _)| *dst) {
                Some(dst) => {
                    self.tag(ctx, *src);
                    self.emit(Lir::Move { dst, src: ctx.slot(*src) });
                    let at = self.emit(Lir::Jump { target: usize::MAX });
                    if let Some((_, exits)) = ctx.inline_return.as_mut() {
                        exits.push(at);
                    }
                }
                None => {
                    self.emit(Lir::Return { src: ctx.slot(*src) });
                }
            },
            Instruction::Intrinsic { dst, intrinsic, arg } => {
                let state = self.state(ctx, pc);
                self.emit(Lir::Intrinsic {
                    dst: ctx.slot(*dst),
                    intrinsic: *intrinsic,
                    arg: ctx.slot(*arg),
                    state,
                });
                ctx.write(*dst, Representation::Tagged);
            }
        }
        Ok(())
    }

    fn lower_binary(&mut self, ctx: &mut Context<'_>, pc: u32, op: BinaryOp, dst: Reg, lhs: Reg, rhs: Reg) {
        let feedback = ctx.feedback.arithmetic(pc).copied().filter(|_| self.optimizing());
        if let Some(fb) = feedback {
            if let Some(int_op) = IntOp::from_binary(op).filter(|_| fb.is_small_int()) {
                self.ensure_int(ctx, lhs, pc);
                self.ensure_int(ctx, rhs, pc);
                let state = self.state(ctx, pc);
                self.emit(Lir::IntBinary {
                    op: int_op,
                    dst: ctx.slot(dst),
                    lhs: ctx.slot(lhs),
                    rhs: ctx.slot(rhs),
                    state,
                });
                ctx.write(dst, Representation::RawInt);
                return;
            }
            if let Some(float_op) = FloatOp::from_binary(op).filter(|_| fb.is_number()) {
                self.ensure_float(ctx, lhs, pc);
                self.ensure_float(ctx, rhs, pc);
                self.emit(Lir::FloatBinary {
                    op: float_op,
                    dst: ctx.slot(dst),
                    lhs: ctx.slot(lhs),
                    rhs: ctx.slot(rhs),
                });
                ctx.write(dst, Representation::RawFloat);
                return;
            }
        }
        self.emit(Lir::GenericBinary {
            op,
            dst: ctx.slot(dst),
            lhs: ctx.slot(lhs),
            rhs: ctx.slot(rhs),
            site: pc,
        });
        ctx.write(dst, Representation::Tagged);
    }

    fn lower_unary(&mut self, ctx: &mut Context<'_>, pc: u32, op: UnaryOp, dst: Reg, src: Reg) {
        let feedback = ctx.feedback.arithmetic(pc).copied().filter(|_| self.optimizing());
        let int_capable = matches!(op, UnaryOp::Neg | UnaryOp::Inc | UnaryOp::Dec | UnaryOp::BitNot);
        let float_capable = matches!(op, UnaryOp::Neg | UnaryOp::Inc | UnaryOp::Dec);
        match feedback {
            Some(fb) if int_capable && fb.is_small_int() => {
                self.ensure_int(ctx, src, pc);
                let state = self.state(ctx, pc);
                self.emit(Lir::IntUnary { op, dst: ctx.slot(dst), src: ctx.slot(src), state });
                ctx.write(dst, Representation::RawInt);
            }
            Some(fb) if float_capable && fb.is_number() => {
                self.ensure_float(ctx, src, pc);
                self.emit(Lir::FloatUnary { op, dst: ctx.slot(dst), src: ctx.slot(src) });
                ctx.write(dst, Representation::RawFloat);
            }
            _ => {
                self.emit(Lir::GenericUnary { op, dst: ctx.slot(dst), src: ctx.slot(src), site: pc });
                ctx.write(dst, Representation::Tagged);
            }
        }
    }

    fn emit_number_compare(&mut self, ctx: &mut Context<'_>, op: CompareOp, dst: Reg, lhs: Reg, rhs: Reg) {
        self.emit(Lir::NumberCompare {
            op,
            dst: ctx.slot(dst),
            lhs: ctx.slot(lhs),
            rhs: ctx.slot(rhs),
        });
        ctx.write(dst, Representation::Tagged);
    }

    /// Observed receiver shapes, if the site is mono- or polymorphic
    fn shape_cases(&self, ctx: &Context<'_>, pc: u32) -> Option<Box<[ShapeEntry]>> {
        if !self.optimizing() {
            return None;
        }
        let fb = ctx.feedback.property(pc)?;
        match fb.state() {
            CacheState::Monomorphic | CacheState::Polymorphic => Some(fb.entries().into()),
            CacheState::Uninitialized | CacheState::Megamorphic => None,
        }
    }

    fn lower_call(
        &mut self,
        ctx: &mut Context<'_>,
        pc: u32,
        dst: Reg,
        callee: Reg,
        first_arg: Reg,
        argc: u16,
    ) -> Result<()> {
        self.tag_all(ctx);
        let state = self.state(ctx, pc);
        let args: Box<[SlotId]> = (0..argc).map(|i| ctx.slot(first_arg + i)).collect();
        let target = match ctx.feedback.call(pc).map(|fb| fb.target) {
            Some(CallTarget::Monomorphic(target)) if self.optimizing() => target,
            _ => {
                self.emit(Lir::Call { dst: ctx.slot(dst), callee: ctx.slot(callee), args, site: pc, state });
                ctx.write(dst, Representation::Tagged);
                return Ok(());
            }
        };

        self.emit(Lir::CheckCallee { callee: ctx.slot(callee), expected: target, state });
        let request = self.request;
        let candidate = request.candidates.get(&target);
        match candidate.filter(|c| self.can_inline(ctx, &c.code, &c.feedback, argc)) {
            Some(candidate) => {
                let candidate = candidate.clone();
                self.inline(ctx, pc, dst, &args, &candidate)?;
            }
            None => {
                self.emit(Lir::CallDirect { dst: ctx.slot(dst), function: target, args, state });
            }
        }
        ctx.write(dst, Representation::Tagged);
        Ok(())
    }

    fn can_inline(&self, ctx: &Context<'_>, callee: &FunctionCode, feedback: &FeedbackSnapshot, argc: u16) -> bool {
        ctx.outer.len() < self.options.max_inline_depth
            && callee.len() <= self.options.max_inline_bytecode_length
            && callee.param_count == argc
            && callee.handlers.is_empty()
            && callee.loop_headers().is_empty()
            && feedback.invocations > 0
            && feedback.code_version == callee.version
            && !ctx.is_inlined_function(callee.id)
            && callee.id != self.request.function
    }

    fn inline(
        &mut self,
        ctx: &mut Context<'_>,
        call_pc: u32,
        dst: Reg,
        args: &[SlotId],
        candidate: &InlineCandidate,
    ) -> Result<()> {
        let callee = &candidate.code;
        let base = self.slot_count;
        self.slot_count += callee.register_count as u32;
        for reg in 0..callee.register_count as u32 {
            match args.get(reg as usize).filter(|_| reg < callee.param_count as u32) {
                Some(&arg) => self.emit(Lir::Move { dst: base + reg, src: arg }),
                None => self.emit(Lir::LoadConst { dst: base + reg, value: Constant::Undefined }),
            };
        }
        if !self.inlined.iter().any(|c| c.id == callee.id) {
            self.inlined.push(Arc::clone(callee));
        }

        let mut outer = ctx.outer.clone();
        outer.push(OuterFrame {
            function: ctx.code.id,
            call_pc,
            base: ctx.base,
            register_count: ctx.code.register_count,
        });
        let mut inner = Context::new(callee, &candidate.feedback, base, outer, Some((ctx.slot(dst), Vec::new())));
        self.lower_body(&mut inner)?;

        let continuation = self.lir.len();
        if let Some((_, exits)) = inner.inline_return {
            for at in exits {
                if let Lir::Jump { target } = &mut self.lir[at] {
                    *target = continuation;
                }
            }
        }
        debug!(caller = %ctx.code.name, callee = %callee.name, "inlined call");
        Ok(())
    }
}
