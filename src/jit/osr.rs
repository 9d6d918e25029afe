//! On-stack replacement
//!
//! OSR units are compiled for one (function, loop header) pair and cached
//! here rather than installed on the function record: entering one affects
//! only the running invocation. A transfer maps the interpreter registers
//! 1:1 onto the first slots of a fresh compiled frame; every slot is tagged
//! at a loop header, so no unboxing is needed at entry.

use super::compiler::{CompiledUnit, UnitKind};
use super::frame_state::Slot;
use crate::bytecode::FunctionId;
use crate::error::OsrTransferFailure;
use crate::runtime::Value;
use rustc_hash::FxHashMap as HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A prepared transfer into an OSR unit
#[derive(Debug)]
pub struct OsrEntry {
    pub unit: Arc<CompiledUnit>,
    pub slots: Vec<Slot>,
    /// LIR index to start at
    pub entry: usize,
}

/// OSR unit cache and transfer logic
#[derive(Debug, Default)]
pub struct OsrController {
    cache: HashMap<(FunctionId, u32), Arc<CompiledUnit>>,
    transfers: u64,
    failures: u64,
}

impl OsrController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Valid cached unit for a loop; invalidated units are evicted
    pub fn lookup(&mut self, function: FunctionId, loop_header: u32) -> Option<Arc<CompiledUnit>> {
        let key = (function, loop_header);
        match self.cache.get(&key) {
            Some(unit) if unit.is_valid() => Some(Arc::clone(unit)),
            Some(_) => {
                self.cache.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn has_unit(&self, function: FunctionId) -> bool {
        self.cache
            .iter()
            .any(|((f, _), unit)| *f == function && unit.is_valid())
    }

    /// Cache a freshly compiled OSR unit
    pub fn insert(&mut self, unit: Arc<CompiledUnit>) {
        if let UnitKind::Osr { loop_header } = unit.kind {
            debug!(function = %unit.name, loop_header, "cached OSR unit");
            self.cache.insert((unit.function, loop_header), unit);
        }
    }

    /// Drop every OSR unit of a function
    pub fn evict(&mut self, function: FunctionId) -> usize {
        let before = self.cache.len();
        self.cache.retain(|(f, _), unit| {
            if *f == function {
                unit.invalidate();
                false
            } else {
                true
            }
        });
        before - self.cache.len()
    }

    /// Transplant live interpreter registers into a compiled frame for
    /// `unit` at `loop_header`
    pub fn transplant(
        &mut self,
        unit: &Arc<CompiledUnit>,
        loop_header: u32,
        registers: &[Value],
    ) -> Result<OsrEntry, OsrTransferFailure> {
        match self.prepare(unit, loop_header, registers) {
            Ok(entry) => {
                self.transfers += 1;
                debug!(function = %unit.name, loop_header, tier = ?unit.tier, "OSR transfer");
                Ok(entry)
            }
            Err(failure) => {
                self.failures += 1;
                warn!(function = %unit.name, loop_header, %failure, "OSR transfer failed");
                Err(failure)
            }
        }
    }

    fn prepare(
        &self,
        unit: &Arc<CompiledUnit>,
        loop_header: u32,
        registers: &[Value],
    ) -> Result<OsrEntry, OsrTransferFailure> {
        if unit.kind != (UnitKind::Osr { loop_header }) {
            return Err(OsrTransferFailure::NoEntryForLoop);
        }
        if !unit.is_valid() {
            return Err(OsrTransferFailure::Invalidated);
        }
        let expected = unit.code.register_count as usize;
        if registers.len() != expected {
            return Err(OsrTransferFailure::FrameLayoutMismatch {
                expected,
                actual: registers.len(),
            });
        }
        let mut slots = vec![Slot::default(); unit.slot_count.max(expected)];
        for (slot, value) in slots.iter_mut().zip(registers) {
            *slot = Slot::Tagged(value.clone());
        }
        Ok(OsrEntry {
            unit: Arc::clone(unit),
            slots,
            entry: unit.entry,
        })
    }

    pub fn transfers(&self) -> u64 {
        self.transfers
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn cached_units(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BinaryOp, CompareOp, FunctionBuilder, Instruction, Program};
    use crate::config::EngineConfig;
    use crate::jit::compiler::{CompileRequest, CompilerOptions, SpeculativeCompiler};
    use crate::jit::feedback::FeedbackStore;
    use crate::jit::tiering::Tier;

    /// `for (i = 0; i < n; i++) {}` with the header at the compare
    fn counting_loop() -> (Program, FunctionId, u32) {
        let mut program = Program::new();
        let mut b = FunctionBuilder::new("count", 1);
        let i = b.register();
        let cond = b.register();
        b.load_smi(i, 0);
        let header = b.label();
        let exit = b.label();
        b.bind(header);
        let header_pc = b.pc();
        b.emit(Instruction::Compare { op: CompareOp::Lt, dst: cond, lhs: i, rhs: 0 });
        b.jump_if_false(cond, exit);
        b.emit(Instruction::Unary { op: crate::bytecode::UnaryOp::Inc, dst: i, src: i });
        b.jump(header);
        b.bind(exit);
        b.emit(Instruction::Binary { op: BinaryOp::Add, dst: i, lhs: i, rhs: i });
        b.emit(Instruction::Return { src: i });
        let id = program.add(b).unwrap();
        (program, id, header_pc)
    }

    fn osr_unit(program: &Program, id: FunctionId, header: u32) -> Arc<CompiledUnit> {
        let code = Arc::clone(program.get(id).unwrap());
        let mut store = FeedbackStore::new(4);
        store.begin_invocation(id, code.version);
        let request = CompileRequest {
            function: id,
            tier: Tier::Optimized,
            ticket: 1,
            osr_entry: Some(header),
            feedback: store.snapshot(id, code.version),
            code,
            candidates: HashMap::default(),
        };
        let compiler = SpeculativeCompiler::new(CompilerOptions::from(&EngineConfig::default()));
        Arc::new(compiler.compile(&request).unwrap())
    }

    #[test]
    fn test_transplant_maps_registers() {
        let (program, id, header) = counting_loop();
        let unit = osr_unit(&program, id, header);
        let mut osr = OsrController::new();
        let registers = vec![Value::Smi(10), Value::Smi(4), Value::Bool(true)];
        let entry = osr.transplant(&unit, header, &registers).unwrap();
        assert_eq!(entry.entry, unit.entry);
        assert_eq!(entry.slots[0].to_value(), Value::Smi(10));
        assert_eq!(entry.slots[1].to_value(), Value::Smi(4));
        assert_eq!(osr.transfers(), 1);
    }

    #[test]
    fn test_transfer_failures() {
        let (program, id, header) = counting_loop();
        let unit = osr_unit(&program, id, header);
        let mut osr = OsrController::new();
        assert_eq!(
            osr.transplant(&unit, header, &[Value::Smi(1)]).unwrap_err(),
            OsrTransferFailure::FrameLayoutMismatch { expected: 3, actual: 1 }
        );
        assert_eq!(
            osr.transplant(&unit, header + 1, &[Value::Smi(1), Value::Smi(0), Value::Undefined])
                .unwrap_err(),
            OsrTransferFailure::NoEntryForLoop
        );
        unit.invalidate();
        assert_eq!(
            osr.transplant(&unit, header, &[Value::Smi(1), Value::Smi(0), Value::Undefined])
                .unwrap_err(),
            OsrTransferFailure::Invalidated
        );
        assert_eq!(osr.failures(), 3);
    }

    #[test]
    fn test_cache_evicts_invalid_units() {
        let (program, id, header) = counting_loop();
        let unit = osr_unit(&program, id, header);
        let mut osr = OsrController::new();
        osr.insert(Arc::clone(&unit));
        assert!(osr.lookup(id, header).is_some());
        unit.invalidate();
        assert!(osr.lookup(id, header).is_none());
        assert_eq!(osr.cached_units(), 0);

        let fresh = osr_unit(&program, id, header);
        osr.insert(Arc::clone(&fresh));
        assert_eq!(osr.evict(id), 1);
        assert!(!fresh.is_valid());
    }
}
