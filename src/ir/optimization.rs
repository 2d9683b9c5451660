//! Optimization Pass Infrastructure
//!
//! The pass trait, the pass manager, the optimizer configuration, and the
//! whole-pipeline entry point [`optimize_function`]. Every pass recomputes
//! the analyses it needs at the start of its run, so facts derived before an
//! earlier mutation can never leak into a later decision.

use super::barriers::{BarrierDecision, CollectorPolicy, WriteBarrierPass};
use super::escape_analysis::analyze_allocations;
use super::loop_analysis::{DominatorTree, LoopNestInfo};
use super::predication::{PredicationPass, PredicationRecord};
use super::validation::{verify_function, StructuralError};
use super::{GuardId, IrFunction};
use fxhash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

/// Result of running a single optimization pass on a function.
#[derive(Debug, Clone, Default)]
pub struct OptimizationResult {
    /// Whether the pass changed anything
    pub modified: bool,

    /// Number of instructions removed
    pub instructions_eliminated: usize,

    /// Pass-specific counters
    pub stats: FxHashMap<String, usize>,
}

impl OptimizationResult {
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Merge another result into this one (for pass pipelines).
    pub fn merge(&mut self, other: OptimizationResult) {
        self.modified |= other.modified;
        self.instructions_eliminated += other.instructions_eliminated;
        for (key, value) in other.stats {
            *self.stats.entry(key).or_insert(0) += value;
        }
    }
}

/// A transformation over a single function.
pub trait OptimizationPass {
    /// Name for logs and reports
    fn name(&self) -> &'static str;

    /// Run the pass. Analyses are computed inside the call; the function is
    /// structurally valid on entry and must be structurally valid on exit.
    fn run_on_function(
        &mut self,
        function: &mut IrFunction,
    ) -> Result<OptimizationResult, StructuralError>;
}

impl OptimizationPass for PredicationPass {
    fn name(&self) -> &'static str {
        "range-check-predication"
    }

    fn run_on_function(
        &mut self,
        function: &mut IrFunction,
    ) -> Result<OptimizationResult, StructuralError> {
        let domtree = DominatorTree::compute(function);
        let loop_info = LoopNestInfo::analyze(function, &domtree)?;

        let records_before = self.records.len();
        let removed = self.run(function, &domtree, &loop_info);

        let hoisted = self.records[records_before..]
            .iter()
            .filter(|r| r.hoisted_guard.is_some())
            .count();

        let mut result = OptimizationResult {
            modified: removed > 0,
            instructions_eliminated: removed,
            stats: FxHashMap::default(),
        };
        result.stats.insert("checks_removed".into(), removed);
        result.stats.insert("guards_hoisted".into(), hoisted);
        Ok(result)
    }
}

impl OptimizationPass for WriteBarrierPass {
    fn name(&self) -> &'static str {
        "write-barrier-elision"
    }

    fn run_on_function(
        &mut self,
        function: &mut IrFunction,
    ) -> Result<OptimizationResult, StructuralError> {
        let domtree = DominatorTree::compute(function);
        let tracking = analyze_allocations(function, &domtree);

        let decisions_before = self.decisions.len();
        let elided = self.run(function, &tracking);
        let decided = self.decisions.len() - decisions_before;

        let mut result = OptimizationResult {
            modified: decided > 0,
            instructions_eliminated: 0,
            stats: FxHashMap::default(),
        };
        result.stats.insert("stores_decided".into(), decided);
        result.stats.insert("barriers_elided".into(), elided);
        result.stats.insert(
            "allocations_tracked".into(),
            tracking.allocations.len(),
        );
        result.stats.insert(
            "allocations_escaped".into(),
            tracking
                .allocations
                .values()
                .filter(|a| a.state.is_escaped())
                .count(),
        );
        Ok(result)
    }
}

/// Runs a pipeline of passes over functions, verifying structure between
/// passes.
pub struct PassManager {
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl PassManager {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    pub fn add_pass(&mut self, pass: Box<dyn OptimizationPass>) {
        self.passes.push(pass);
    }

    pub fn run(&mut self, function: &mut IrFunction) -> Result<OptimizationResult, StructuralError> {
        verify_function(function)?;

        let mut total = OptimizationResult::unchanged();
        for pass in &mut self.passes {
            let result = pass.run_on_function(function)?;
            log::debug!(
                "{}: pass {} modified={} eliminated={}",
                function.name,
                pass.name(),
                result.modified,
                result.instructions_eliminated
            );
            verify_function(function)?;
            total.merge(result);
        }
        Ok(total)
    }
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for one optimizer invocation. No global state: everything
/// the passes may consult travels in here.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Collector the emitted barriers must cooperate with
    pub collector: CollectorPolicy,

    /// Guard ids whose speculation already failed at runtime; the predication
    /// pass leaves the corresponding checks in place (retry-once)
    pub failed_speculations: FxHashSet<GuardId>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            collector: CollectorPolicy::SerialCardMark,
            failed_speculations: FxHashSet::default(),
        }
    }
}

/// Everything the optimizer did to one function, serializable for tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteReport {
    /// Function name
    pub function: String,

    /// Per-(loop, array) predication outcomes
    pub predications: Vec<PredicationRecord>,

    /// Per-store barrier decisions
    pub barrier_decisions: Vec<BarrierDecision>,

    /// Total bounds checks deleted
    pub checks_removed: usize,

    /// Total stores whose barrier was elided
    pub barriers_elided: usize,

    /// Allocations seen by the escape tracker
    pub allocations_tracked: usize,

    /// Of those, how many escape
    pub allocations_escaped: usize,
}

impl RewriteReport {
    /// Whether the optimizer changed the function at all. Barrier decisions
    /// on previously undecided stores count as changes.
    pub fn modified(&self) -> bool {
        self.checks_removed > 0
            || self
                .predications
                .iter()
                .any(|p| p.hoisted_guard.is_some() || !p.removed_checks.is_empty())
            || !self.barrier_decisions.is_empty()
    }
}

/// Optimize one function: validate, predicate range checks, then decide
/// write barriers. Each stage runs on freshly computed analyses.
pub fn optimize_function(
    function: &mut IrFunction,
    config: &OptimizerConfig,
) -> Result<RewriteReport, StructuralError> {
    verify_function(function)?;

    let mut predication = PredicationPass::new(config.failed_speculations.clone());
    let pred_result = predication.run_on_function(function)?;
    verify_function(function)?;

    let mut barriers = WriteBarrierPass::new(config.collector);
    let wb_result = barriers.run_on_function(function)?;
    verify_function(function)?;

    let report = RewriteReport {
        function: function.name.clone(),
        predications: predication.records,
        barrier_decisions: barriers.decisions,
        checks_removed: pred_result.instructions_eliminated,
        barriers_elided: wb_result.stats.get("barriers_elided").copied().unwrap_or(0),
        allocations_tracked: wb_result
            .stats
            .get("allocations_tracked")
            .copied()
            .unwrap_or(0),
        allocations_escaped: wb_result
            .stats
            .get("allocations_escaped")
            .copied()
            .unwrap_or(0),
    };

    log::info!(
        "{}: removed {} checks, hoisted {} guards, elided {} barriers",
        function.name,
        report.checks_removed,
        report
            .predications
            .iter()
            .filter(|p| p.hoisted_guard.is_some())
            .count(),
        report.barriers_elided
    );

    Ok(report)
}
