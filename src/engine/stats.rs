//! Tiering statistics and per-function snapshots

use crate::jit::{CompiledUnit, DeoptReason, FunctionRecord, Tier};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Engine-wide tiering counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TieringStats {
    pub baseline_compiles: u64,
    pub optimized_compiles: u64,
    pub osr_compiles: u64,
    pub compile_failures: u64,
    /// Results dropped because a newer request or an invalidation replaced them
    pub superseded: u64,
    /// Requests refused by a full background queue
    pub queue_rejections: u64,
    pub compile_time_us: u64,
    pub deopts: u64,
    pub deopts_by_reason: BTreeMap<DeoptReason, u64>,
    /// Frames that left invalidated code when a call returned
    pub lazy_deopts: u64,
    pub osr_transfers: u64,
    pub osr_failures: u64,
    pub debug_breaks: u64,
}

impl TieringStats {
    pub(crate) fn note_compile(&mut self, unit: &CompiledUnit) {
        self.compile_time_us += unit.compile_time.as_micros() as u64;
        if unit.is_osr() {
            self.osr_compiles += 1;
            return;
        }
        match unit.tier {
            Tier::Baseline => self.baseline_compiles += 1,
            Tier::Optimized => self.optimized_compiles += 1,
            Tier::Interpreted => {}
        }
    }

    pub fn deopts_for(&self, reason: DeoptReason) -> u64 {
        self.deopts_by_reason.get(&reason).copied().unwrap_or(0)
    }
}

impl fmt::Display for TieringStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Tiering Summary ===")?;
        writeln!(
            f,
            "Compiles: {} baseline, {} optimized, {} OSR ({} us)",
            self.baseline_compiles, self.optimized_compiles, self.osr_compiles, self.compile_time_us
        )?;
        writeln!(
            f,
            "Dropped compiles: {} failed, {} superseded, {} rejected",
            self.compile_failures, self.superseded, self.queue_rejections
        )?;
        write!(f, "Deoptimizations: {}", self.deopts)?;
        if !self.deopts_by_reason.is_empty() {
            let reasons: Vec<String> = self
                .deopts_by_reason
                .iter()
                .map(|(reason, count)| format!("{} {}", count, reason))
                .collect();
            write!(f, " ({})", reasons.join(", "))?;
        }
        writeln!(f)?;
        writeln!(f, "Lazy deoptimizations: {}", self.lazy_deopts)?;
        writeln!(f, "OSR transfers: {} ok, {} failed", self.osr_transfers, self.osr_failures)?;
        writeln!(f, "Debug breaks: {}", self.debug_breaks)?;
        Ok(())
    }
}

/// Tiering state of one function
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSnapshot {
    pub id: u32,
    pub name: String,
    pub tier: Tier,
    pub invocations: u64,
    pub deopt_count: u32,
    pub eligible: bool,
    pub never_optimize: bool,
    pub compiling: bool,
    pub has_baseline: bool,
    pub has_optimized: bool,
    pub has_osr_code: bool,
    /// Bytecode sites with type feedback
    pub feedback_sites: usize,
}

impl FunctionSnapshot {
    pub(crate) fn new(record: &FunctionRecord, has_osr_code: bool, feedback_sites: usize) -> Self {
        Self {
            id: record.id.0,
            name: record.name.clone(),
            tier: record.tier,
            invocations: record.invocations,
            deopt_count: record.deopt_count,
            eligible: record.is_eligible(),
            never_optimize: record.never_optimize,
            compiling: record.pending.is_some(),
            has_baseline: record.baseline.as_ref().is_some_and(|u| u.is_valid()),
            has_optimized: record.optimized.as_ref().is_some_and(|u| u.is_valid()),
            has_osr_code,
            feedback_sites,
        }
    }
}

impl fmt::Display for FunctionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] calls={} deopts={}",
            self.name, self.tier, self.invocations, self.deopt_count
        )?;
        if !self.eligible {
            write!(f, " ineligible")?;
        }
        if self.compiling {
            write!(f, " compiling")?;
        }
        if self.has_osr_code {
            write!(f, " osr")?;
        }
        Ok(())
    }
}
