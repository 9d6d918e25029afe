//! Tier management
//!
//! One `FunctionRecord` per function, created on first call and owned by the
//! `TierManager`. The manager counts invocations and loop back-edges, decides
//! when to request a compile, tracks which compiled units are installed, and
//! keeps the deopt bookkeeping that makes a thrashing function ineligible.

use super::compiler::CompiledUnit;
use super::deopt::DeoptReason;
use crate::bytecode::FunctionId;
use crate::config::EngineConfig;
use crate::error::CompileFailure;
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Execution tier of a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Bytecode interpreter
    Interpreted,
    /// Non-speculative compiled code that still collects feedback
    Baseline,
    /// Speculative code with deopt guards
    Optimized,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Interpreted => "interpreted",
            Tier::Baseline => "baseline",
            Tier::Optimized => "optimized",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outstanding compile request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCompile {
    pub tier: Tier,
    pub ticket: u64,
    /// Loop header for OSR requests
    pub osr_entry: Option<u32>,
}

/// A (function, bytecode offset) pair identifying where a deopt happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeoptSite {
    pub function: FunctionId,
    pub pc: u32,
}

/// Per-function tiering state
#[derive(Debug, Clone)]
pub struct FunctionRecord {
    pub id: FunctionId,
    pub name: String,
    /// Tier that new invocations enter
    pub tier: Tier,
    /// Invocations since creation
    pub invocations: u64,
    /// Invocations since the last tier change
    pub hotness: u64,
    /// Back-edges per loop header since the last OSR attempt
    pub loop_counters: HashMap<u32, u32>,
    pub deopt_count: u32,
    pub deopt_sites: HashMap<(DeoptSite, DeoptReason), u32>,
    /// Invocation count at which the function becomes eligible again
    pub ineligible_until: Option<u64>,
    pub never_optimize: bool,
    pub prepared: bool,
    pub optimize_on_next_call: bool,
    pub osr_requested: bool,
    pub pending: Option<PendingCompile>,
    /// Bumped by every trigger and every invalidation; results carrying an
    /// older ticket are superseded
    pub ticket: u64,
    pub baseline: Option<Arc<CompiledUnit>>,
    pub optimized: Option<Arc<CompiledUnit>>,
}

impl FunctionRecord {
    pub fn new(id: FunctionId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            tier: Tier::Interpreted,
            invocations: 0,
            hotness: 0,
            loop_counters: HashMap::default(),
            deopt_count: 0,
            deopt_sites: HashMap::default(),
            ineligible_until: None,
            never_optimize: false,
            prepared: false,
            optimize_on_next_call: false,
            osr_requested: false,
            pending: None,
            ticket: 0,
            baseline: None,
            optimized: None,
        }
    }

    pub fn is_eligible(&self) -> bool {
        !self.never_optimize && self.ineligible_until.is_none()
    }

    /// Installed unit for new invocations
    pub fn active_unit(&self) -> Option<&Arc<CompiledUnit>> {
        match self.tier {
            Tier::Optimized => self.optimized.as_ref(),
            Tier::Baseline => self.baseline.as_ref(),
            Tier::Interpreted => None,
        }
    }

    fn fallback_tier(&self) -> Tier {
        if self.baseline.as_ref().is_some_and(|u| u.is_valid()) {
            Tier::Baseline
        } else {
            Tier::Interpreted
        }
    }
}

/// Tier-up and eligibility decisions for every function
#[derive(Debug)]
pub struct TierManager {
    records: HashMap<FunctionId, FunctionRecord>,
    invocation_threshold: u64,
    optimize_threshold: u64,
    osr_threshold: u32,
    deopt_threshold: u32,
    ineligible_cooldown: u64,
}

impl TierManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            records: HashMap::default(),
            invocation_threshold: config.invocation_threshold,
            optimize_threshold: config.optimize_threshold,
            osr_threshold: config.osr_threshold,
            deopt_threshold: config.deopt_threshold,
            ineligible_cooldown: config.ineligible_cooldown,
        }
    }

    pub fn record(&self, function: FunctionId) -> Option<&FunctionRecord> {
        self.records.get(&function)
    }

    /// Record for `function`, created on first use
    pub fn record_mut(&mut self, function: FunctionId, name: &str) -> &mut FunctionRecord {
        self.records
            .entry(function)
            .or_insert_with(|| FunctionRecord::new(function, name))
    }

    pub fn records(&self) -> impl Iterator<Item = &FunctionRecord> {
        self.records.values()
    }

    pub fn tier(&self, function: FunctionId) -> Tier {
        self.records
            .get(&function)
            .map(|r| r.tier)
            .unwrap_or(Tier::Interpreted)
    }

    pub fn active_unit(&self, function: FunctionId) -> Option<Arc<CompiledUnit>> {
        self.records.get(&function)?.active_unit().cloned()
    }

    /// Count an invocation and decide whether a compile should be requested
    pub fn on_invocation(&mut self, function: FunctionId, name: &str) -> Option<Tier> {
        let (invocation_threshold, optimize_threshold) =
            (self.invocation_threshold, self.optimize_threshold);
        let record = self.record_mut(function, name);
        record.invocations += 1;
        record.hotness += 1;

        if let Some(until) = record.ineligible_until {
            if record.invocations >= until {
                debug!(function = %record.name, "ineligibility cooldown expired");
                record.ineligible_until = None;
            }
        }
        if record.never_optimize {
            record.optimize_on_next_call = false;
            return None;
        }
        if record.optimize_on_next_call {
            record.optimize_on_next_call = false;
            record.ineligible_until = None;
            return Some(Tier::Optimized);
        }
        if record.pending.is_some() || !record.is_eligible() {
            return None;
        }
        if record.tier < Tier::Optimized && record.hotness >= optimize_threshold {
            return Some(Tier::Optimized);
        }
        if record.tier == Tier::Interpreted
            && record.baseline.is_none()
            && record.hotness >= invocation_threshold
        {
            return Some(Tier::Baseline);
        }
        None
    }

    /// Count a back-edge of `loop_header`; true when OSR should be attempted
    pub fn on_loop_back_edge(&mut self, function: FunctionId, loop_header: u32) -> bool {
        let osr_threshold = self.osr_threshold;
        let Some(record) = self.records.get_mut(&function) else {
            return false;
        };
        if record.never_optimize {
            record.osr_requested = false;
            return false;
        }
        if record.osr_requested {
            return true;
        }
        if !record.is_eligible() {
            return false;
        }
        let counter = record.loop_counters.entry(loop_header).or_insert(0);
        *counter += 1;
        *counter >= osr_threshold
    }

    /// Restart back-edge counting for a loop after an OSR attempt
    pub fn reset_loop_counter(&mut self, function: FunctionId, loop_header: u32) {
        if let Some(record) = self.records.get_mut(&function) {
            record.loop_counters.insert(loop_header, 0);
        }
    }

    /// Compile and activate before the next call, bypassing counters
    pub fn force_optimize(&mut self, function: FunctionId, name: &str) {
        let record = self.record_mut(function, name);
        if record.never_optimize {
            return;
        }
        record.optimize_on_next_call = true;
    }

    /// Request OSR at the next back-edge of any loop
    pub fn request_osr(&mut self, function: FunctionId, name: &str) {
        let record = self.record_mut(function, name);
        if !record.never_optimize {
            record.osr_requested = true;
        }
    }

    /// Register for tracking and clear eligibility bookkeeping
    pub fn prepare(&mut self, function: FunctionId, name: &str) {
        let record = self.record_mut(function, name);
        record.prepared = true;
        record.deopt_sites.clear();
        record.ineligible_until = None;
    }

    /// Pin to the interpreter for good
    pub fn never_optimize(&mut self, function: FunctionId, name: &str) -> Vec<Arc<CompiledUnit>> {
        let record = self.record_mut(function, name);
        record.never_optimize = true;
        record.optimize_on_next_call = false;
        record.osr_requested = false;
        let mut dropped = Self::drop_units(record);
        if let Some(baseline) = record.baseline.take() {
            baseline.invalidate();
            dropped.push(baseline);
        }
        record.tier = Tier::Interpreted;
        dropped
    }

    /// Suppress tier-up until the cooldown has passed
    pub fn mark_ineligible(&mut self, function: FunctionId) {
        let cooldown = self.ineligible_cooldown;
        if let Some(record) = self.records.get_mut(&function) {
            let until = record.invocations + cooldown;
            warn!(function = %record.name, until, "function is ineligible for optimization");
            record.ineligible_until = Some(until);
            record.optimize_on_next_call = false;
            record.osr_requested = false;
        }
    }

    /// Count a deopt; marks the function ineligible and returns true once the
    /// same site and reason exceeded the threshold
    pub fn note_deopt(&mut self, function: FunctionId, site: DeoptSite, reason: DeoptReason) -> bool {
        let threshold = self.deopt_threshold;
        let Some(record) = self.records.get_mut(&function) else {
            return false;
        };
        record.deopt_count += 1;
        if !reason.counts_toward_ineligibility() {
            return false;
        }
        let count = record.deopt_sites.entry((site, reason)).or_insert(0);
        *count += 1;
        if *count > threshold {
            self.mark_ineligible(function);
            return true;
        }
        false
    }

    /// Start a compile and hand out its ticket
    pub fn begin_compile(
        &mut self,
        function: FunctionId,
        name: &str,
        tier: Tier,
        osr_entry: Option<u32>,
    ) -> u64 {
        let record = self.record_mut(function, name);
        record.ticket += 1;
        record.pending = Some(PendingCompile {
            tier,
            ticket: record.ticket,
            osr_entry,
        });
        record.ticket
    }

    /// Whether a result with `ticket` may still be activated
    pub fn check_current(&self, function: FunctionId, ticket: u64) -> Result<(), CompileFailure> {
        match self.records.get(&function) {
            Some(record) if record.never_optimize => Err(CompileFailure::NeverOptimize),
            Some(record) if record.ineligible_until.is_some() => Err(CompileFailure::Ineligible),
            Some(record) if record.ticket == ticket => Ok(()),
            _ => Err(CompileFailure::Superseded),
        }
    }

    /// Clear the pending request after a failed or discarded compile
    pub fn end_compile(&mut self, function: FunctionId, ticket: u64) {
        if let Some(record) = self.records.get_mut(&function) {
            if record.pending.is_some_and(|p| p.ticket == ticket) {
                record.pending = None;
            }
        }
    }

    /// A compile failed; retry only after the function is hot again
    pub fn compile_failed(&mut self, function: FunctionId, ticket: u64) {
        self.end_compile(function, ticket);
        if let Some(record) = self.records.get_mut(&function) {
            record.hotness = 0;
        }
    }

    /// Activate a function unit; OSR units are cached by the OSR controller
    pub fn install(&mut self, unit: Arc<CompiledUnit>) {
        let Some(record) = self.records.get_mut(&unit.function) else {
            return;
        };
        if record.pending.is_some_and(|p| p.ticket == unit.ticket) {
            record.pending = None;
        }
        if unit.is_osr() {
            return;
        }
        let tier = unit.tier;
        match tier {
            Tier::Baseline => record.baseline = Some(unit),
            Tier::Optimized => record.optimized = Some(unit),
            Tier::Interpreted => return,
        }
        if tier > record.tier {
            debug!(function = %record.name, from = ?record.tier, to = ?tier, "tier up");
            record.tier = tier;
            record.hotness = 0;
        }
    }

    /// Whether a non-OSR result would replace code that is already installed
    pub fn already_has(&self, function: FunctionId, tier: Tier) -> bool {
        self.records.get(&function).is_some_and(|r| match tier {
            Tier::Optimized => r.optimized.as_ref().is_some_and(|u| u.is_valid()),
            Tier::Baseline => r.baseline.as_ref().is_some_and(|u| u.is_valid()),
            Tier::Interpreted => true,
        })
    }

    /// Invalidate one unit after a deopt and fall back a tier if it was
    /// the installed one
    pub fn invalidate_unit(&mut self, unit: &CompiledUnit) {
        unit.invalidate();
        let Some(record) = self.records.get_mut(&unit.function) else {
            return;
        };
        record.ticket += 1;
        record.pending = None;
        record.hotness = 0;
        if unit.is_osr() {
            return;
        }
        let installed = match unit.tier {
            Tier::Optimized => &mut record.optimized,
            Tier::Baseline => &mut record.baseline,
            Tier::Interpreted => return,
        };
        if installed.as_ref().is_some_and(|u| u.ticket == unit.ticket) {
            *installed = None;
        }
        let fallback = record.fallback_tier();
        if record.tier != fallback {
            debug!(function = %record.name, from = ?record.tier, to = ?fallback, "tier down");
            record.tier = fallback;
        }
    }

    /// Drop optimized code so the next call runs a slower tier
    pub fn force_deoptimize(&mut self, function: FunctionId) -> Vec<Arc<CompiledUnit>> {
        let Some(record) = self.records.get_mut(&function) else {
            return Vec::new();
        };
        let dropped = Self::drop_units(record);
        record.tier = record.fallback_tier();
        dropped
    }

    /// Forget every unit of a function whose bytecode was replaced
    pub fn discard_code(&mut self, function: FunctionId) -> Vec<Arc<CompiledUnit>> {
        let Some(record) = self.records.get_mut(&function) else {
            return Vec::new();
        };
        let mut dropped = Self::drop_units(record);
        if let Some(baseline) = record.baseline.take() {
            baseline.invalidate();
            dropped.push(baseline);
        }
        record.tier = Tier::Interpreted;
        record.deopt_sites.clear();
        record.ineligible_until = None;
        dropped
    }

    fn drop_units(record: &mut FunctionRecord) -> Vec<Arc<CompiledUnit>> {
        record.ticket += 1;
        record.pending = None;
        record.hotness = 0;
        record.loop_counters.clear();
        let mut dropped = Vec::new();
        if let Some(optimized) = record.optimized.take() {
            optimized.invalidate();
            dropped.push(optimized);
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const F: FunctionId = FunctionId(1);

    fn manager() -> TierManager {
        TierManager::new(
            &EngineConfig::default()
                .with_thresholds(2, 4)
                .with_osr_threshold(3)
                .with_deopt_threshold(1, 5),
        )
    }

    #[test]
    fn test_invocation_thresholds() {
        let mut tiers = manager();
        assert_eq!(tiers.on_invocation(F, "f"), None);
        assert_eq!(tiers.on_invocation(F, "f"), Some(Tier::Baseline));
        tiers.begin_compile(F, "f", Tier::Baseline, None);
        // A pending compile suppresses further requests
        assert_eq!(tiers.on_invocation(F, "f"), None);
        let ticket = tiers.record(F).unwrap().ticket;
        tiers.end_compile(F, ticket);
        assert_eq!(tiers.on_invocation(F, "f"), Some(Tier::Optimized));
    }

    #[test]
    fn test_force_optimize_bypasses_counters() {
        let mut tiers = manager();
        tiers.force_optimize(F, "f");
        assert_eq!(tiers.on_invocation(F, "f"), Some(Tier::Optimized));
        assert_eq!(tiers.on_invocation(F, "f"), Some(Tier::Baseline));
    }

    #[test]
    fn test_never_optimize_wins() {
        let mut tiers = manager();
        tiers.never_optimize(F, "f");
        tiers.force_optimize(F, "f");
        for _ in 0..10 {
            assert_eq!(tiers.on_invocation(F, "f"), None);
        }
        tiers.request_osr(F, "f");
        assert!(!tiers.on_loop_back_edge(F, 0));
    }

    #[test]
    fn test_back_edge_threshold() {
        let mut tiers = manager();
        tiers.on_invocation(F, "f");
        assert!(!tiers.on_loop_back_edge(F, 4));
        assert!(!tiers.on_loop_back_edge(F, 4));
        assert!(tiers.on_loop_back_edge(F, 4));
        tiers.reset_loop_counter(F, 4);
        assert!(!tiers.on_loop_back_edge(F, 4));
    }

    #[test]
    fn test_repeated_deopts_make_function_ineligible() {
        let mut tiers = manager();
        tiers.on_invocation(F, "f");
        let site = DeoptSite { function: F, pc: 3 };
        assert!(!tiers.note_deopt(F, site, DeoptReason::TypeMismatch));
        // Different reasons are counted separately
        assert!(!tiers.note_deopt(F, site, DeoptReason::Overflow));
        assert!(tiers.note_deopt(F, site, DeoptReason::TypeMismatch));
        assert!(!tiers.record(F).unwrap().is_eligible());
        for _ in 0..4 {
            assert_eq!(tiers.on_invocation(F, "f"), None);
        }
        // Cooldown of 5 invocations has passed
        assert!(tiers.on_invocation(F, "f").is_some());
    }

    #[test]
    fn test_exception_unwind_never_counts() {
        let mut tiers = manager();
        tiers.on_invocation(F, "f");
        let site = DeoptSite { function: F, pc: 0 };
        for _ in 0..5 {
            assert!(!tiers.note_deopt(F, site, DeoptReason::ExceptionUnwind));
        }
        assert!(tiers.record(F).unwrap().is_eligible());
        assert_eq!(tiers.record(F).unwrap().deopt_count, 5);
    }

    #[test]
    fn test_prepare_resets_eligibility() {
        let mut tiers = manager();
        tiers.on_invocation(F, "f");
        tiers.mark_ineligible(F);
        tiers.prepare(F, "f");
        assert!(tiers.record(F).unwrap().is_eligible());
    }

    #[test]
    fn test_tickets_supersede() {
        let mut tiers = manager();
        let first = tiers.begin_compile(F, "f", Tier::Optimized, None);
        let second = tiers.begin_compile(F, "f", Tier::Optimized, None);
        assert_eq!(tiers.check_current(F, first), Err(CompileFailure::Superseded));
        assert_eq!(tiers.check_current(F, second), Ok(()));
        tiers.force_deoptimize(F);
        assert_eq!(tiers.check_current(F, second), Err(CompileFailure::Superseded));
    }

    #[test]
    fn test_results_rejected_for_pinned_functions() {
        let mut tiers = manager();
        tiers.on_invocation(F, "f");
        let ticket = tiers.begin_compile(F, "f", Tier::Optimized, None);
        tiers.mark_ineligible(F);
        assert_eq!(tiers.check_current(F, ticket), Err(CompileFailure::Ineligible));
        tiers.never_optimize(F, "f");
        assert_eq!(tiers.check_current(F, ticket), Err(CompileFailure::NeverOptimize));
    }

    #[test]
    fn test_discard_code_resets_to_interpreter() {
        let mut tiers = manager();
        tiers.on_invocation(F, "f");
        tiers.mark_ineligible(F);
        assert!(tiers.discard_code(F).is_empty());
        let record = tiers.record(F).unwrap();
        assert_eq!(record.tier, Tier::Interpreted);
        assert!(record.is_eligible());
        assert!(tiers.discard_code(FunctionId(99)).is_empty());
    }
}
