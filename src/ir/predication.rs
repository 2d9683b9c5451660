//! Range-Check Predication
//!
//! Replaces per-iteration array bounds checks inside counted loops with a
//! single proof. When the induction variable's bounds and the array length
//! are compile-time constants the proof is static and the in-loop checks are
//! simply deleted; otherwise one loop-invariant [`IrInstruction::Guard`] is
//! hoisted into the preheader and the checks it subsumes are deleted.
//!
//! The rewrite only touches checks that execute on every completed iteration
//! (their block dominates every back-edge source). All index range reasoning
//! is done in `i64`/`i128` over values the analysis proved stay in `i32`
//! range; any expression that could leave the `i32` range refuses predication
//! for that access.

use super::induction::{
    analyze_induction_variables, constant_defs, definition_sites, is_loop_invariant, Bound,
    InductionVariable,
};
use super::loop_analysis::{DominatorTree, LoopNestInfo, NaturalLoop};
use super::{
    BinaryOp, CompareOp, GuardId, IrBlockId, IrFunction, IrId, IrInstruction, IrType, IrValue,
    UnaryOp,
};
use fxhash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

/// An affine index expression `scale * iv + offset` feeding a bounds check,
/// with constant scale and offset.
#[derive(Debug, Clone, Copy)]
pub struct AffineAccess {
    /// Header phi of the induction variable
    pub iv: IrId,

    /// Constant multiplier
    pub scale: i64,

    /// Constant displacement
    pub offset: i64,

    /// The register the check actually tests
    pub index_reg: IrId,
}

/// Outcome of predicating the checks of one loop against one array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicationRecord {
    /// Header of the loop the checks lived in
    pub loop_header: IrBlockId,

    /// Guard ids of the deleted per-iteration checks
    pub removed_checks: Vec<GuardId>,

    /// Guard id of the hoisted preheader guard, if the proof was dynamic
    pub hoisted_guard: Option<GuardId>,

    /// Smallest index the loop can touch, when computable at compile time
    pub min_index: Option<i64>,

    /// Largest index the loop can touch, when computable at compile time
    pub max_index: Option<i64>,

    /// Whether the proof needed no runtime guard at all
    pub static_proof: bool,
}

/// The predication rewrite pass.
///
/// Checks whose [`GuardId`] appears in `failed_speculations` were hoisted
/// before and deoptimized at runtime; they are left untouched so the same
/// speculation is never retried.
pub struct PredicationPass {
    failed_speculations: FxHashSet<GuardId>,

    /// One record per (loop, array) group that was rewritten
    pub records: Vec<PredicationRecord>,
}

/// A check that qualifies for predication: affine over a recognized
/// induction variable, executed on every completed iteration.
#[derive(Debug, Clone)]
struct Candidate {
    guard: GuardId,
    access: AffineAccess,
    length: IrId,
}

/// How one group of candidates gets rewritten.
enum ProofPlan {
    /// Bounds, length, and domain all constant and in range: delete only.
    Static {
        removed: Vec<GuardId>,
        min: i64,
        max: i64,
    },
    /// Constant domain, symbolic length: guard `max < length`.
    ConstDomain {
        removed: Vec<GuardId>,
        min: i64,
        max: i64,
        length: IrId,
    },
    /// Symbolic bounds: guard `loop empty || (min >= 0 && max < length)`
    /// with endpoints materialized from the induction variable in `i64`.
    Symbolic {
        removed: Vec<GuardId>,
        iv: InductionVariable,
        scale: i64,
        offset_min: i64,
        offset_max: i64,
        length: IrId,
    },
}

impl PredicationPass {
    pub fn new(failed_speculations: FxHashSet<GuardId>) -> Self {
        Self {
            failed_speculations,
            records: Vec::new(),
        }
    }

    /// Run predication over every loop, innermost first. Returns the number
    /// of bounds checks deleted.
    pub fn run(
        &mut self,
        function: &mut IrFunction,
        domtree: &DominatorTree,
        loop_info: &LoopNestInfo,
    ) -> usize {
        let headers: Vec<IrBlockId> = loop_info
            .loops_innermost_first()
            .iter()
            .map(|l| l.header)
            .collect();

        let mut removed_total = 0;
        for header in headers {
            let natural_loop = loop_info.loops[&header].clone();
            removed_total += self.predicate_loop(function, domtree, &natural_loop);
        }
        removed_total
    }

    /// Plan and apply predication for one loop. Only the preheader gains
    /// instructions and only in-loop checks are deleted, so the loop
    /// structure stays valid for the remaining loops of this run.
    fn predicate_loop(
        &mut self,
        function: &mut IrFunction,
        domtree: &DominatorTree,
        natural_loop: &NaturalLoop,
    ) -> usize {
        let preheader = match natural_loop.preheader {
            Some(p) => p,
            None => {
                log::debug!(
                    "{}: loop {} has no preheader, skipping predication",
                    function.name,
                    natural_loop.header
                );
                return 0;
            }
        };

        let ivs = analyze_induction_variables(function, natural_loop);
        if ivs.is_empty() {
            return 0;
        }
        let iv_by_phi: FxHashMap<IrId, InductionVariable> =
            ivs.into_iter().map(|iv| (iv.phi, iv)).collect();

        let consts = constant_defs(function);
        let candidates = self.collect_candidates(function, domtree, natural_loop, &iv_by_phi, &consts);
        if candidates.is_empty() {
            return 0;
        }

        // Group by (induction variable, array): sibling accesses against the
        // same array are smeared into one combined range.
        let mut group_keys: Vec<(IrId, IrId)> = Vec::new();
        let mut groups: FxHashMap<(IrId, IrId), Vec<Candidate>> = FxHashMap::default();
        for cand in candidates {
            let key = (cand.access.iv, cand.length);
            if !groups.contains_key(&key) {
                group_keys.push(key);
            }
            groups.entry(key).or_default().push(cand);
        }

        let mut plans = Vec::new();
        for key in group_keys {
            let group = &groups[&key];
            let iv = &iv_by_phi[&key.0];
            if let Some(plan) = plan_group(function, iv, group, &consts) {
                plans.push(plan);
            }
        }

        let mut removed_total = 0;
        for plan in plans {
            removed_total += self.apply_plan(function, natural_loop, preheader, plan);
        }
        removed_total
    }

    fn collect_candidates(
        &self,
        function: &IrFunction,
        domtree: &DominatorTree,
        natural_loop: &NaturalLoop,
        iv_by_phi: &FxHashMap<IrId, InductionVariable>,
        consts: &FxHashMap<IrId, i64>,
    ) -> Vec<Candidate> {
        let defs = definition_sites(function);
        let phis: FxHashSet<IrId> = function
            .cfg
            .blocks
            .values()
            .flat_map(|b| b.phi_nodes.iter().map(|p| p.dest))
            .collect();

        let mut block_ids: Vec<IrBlockId> = natural_loop.blocks.iter().copied().collect();
        block_ids.sort();

        let mut candidates = Vec::new();
        for block_id in block_ids {
            // Header checks observe the exit value of the induction variable,
            // outside the body iteration domain.
            if block_id == natural_loop.header {
                continue;
            }
            if !natural_loop.dominates_back_edges(domtree, block_id) {
                continue;
            }
            let block = match function.cfg.get_block(block_id) {
                Some(b) => b,
                None => continue,
            };
            for inst in &block.instructions {
                let (index, length, guard) = match inst {
                    IrInstruction::BoundsCheck {
                        index,
                        length,
                        guard,
                    } => (*index, *length, *guard),
                    _ => continue,
                };
                if self.failed_speculations.contains(&guard) {
                    log::trace!(
                        "{}: {} failed speculation before, leaving check in place",
                        function.name,
                        guard
                    );
                    continue;
                }
                let access = match recover_affine(function, &defs, consts, &phis, index) {
                    Some(a) => a,
                    None => continue,
                };
                if !iv_by_phi.contains_key(&access.iv) {
                    continue;
                }
                if !is_loop_invariant(function, natural_loop, consts, length) {
                    continue;
                }
                candidates.push(Candidate {
                    guard,
                    access,
                    length,
                });
            }
        }
        candidates
    }

    fn apply_plan(
        &mut self,
        function: &mut IrFunction,
        natural_loop: &NaturalLoop,
        preheader: IrBlockId,
        plan: ProofPlan,
    ) -> usize {
        let record = match plan {
            ProofPlan::Static { removed, min, max } => {
                log::debug!(
                    "{}: loop {}: static proof [{}, {}], deleting {} checks",
                    function.name,
                    natural_loop.header,
                    min,
                    max,
                    removed.len()
                );
                delete_checks(function, natural_loop, &removed);
                PredicationRecord {
                    loop_header: natural_loop.header,
                    removed_checks: removed,
                    hoisted_guard: None,
                    min_index: Some(min),
                    max_index: Some(max),
                    static_proof: true,
                }
            }
            ProofPlan::ConstDomain {
                removed,
                min,
                max,
                length,
            } => {
                let mut em = GuardEmitter::new(function);
                let max_reg = em.const_i64(max);
                let len64 = em.widen(length);
                let in_range = em.cmp(CompareOp::Lt, max_reg, len64);
                let guard = em.guard(in_range);
                em.flush(preheader);

                log::debug!(
                    "{}: loop {}: hoisted {} testing {} < len for domain [{}, {}]",
                    function.name,
                    natural_loop.header,
                    guard,
                    max,
                    min,
                    max
                );
                delete_checks(function, natural_loop, &removed);
                PredicationRecord {
                    loop_header: natural_loop.header,
                    removed_checks: removed,
                    hoisted_guard: Some(guard),
                    min_index: Some(min),
                    max_index: Some(max),
                    static_proof: false,
                }
            }
            ProofPlan::Symbolic {
                removed,
                iv,
                scale,
                offset_min,
                offset_max,
                length,
            } => {
                let guard = emit_symbolic_guard(
                    function, preheader, &iv, scale, offset_min, offset_max, length,
                );
                log::debug!(
                    "{}: loop {}: hoisted symbolic-range {} (scale {}, offsets [{}, {}])",
                    function.name,
                    natural_loop.header,
                    guard,
                    scale,
                    offset_min,
                    offset_max
                );
                delete_checks(function, natural_loop, &removed);
                PredicationRecord {
                    loop_header: natural_loop.header,
                    removed_checks: removed,
                    hoisted_guard: Some(guard),
                    min_index: None,
                    max_index: None,
                    static_proof: false,
                }
            }
        };

        let count = record.removed_checks.len();
        self.records.push(record);
        count
    }
}

/// Decide how (or whether) one group of same-array candidates is rewritten.
fn plan_group(
    function: &IrFunction,
    iv: &InductionVariable,
    group: &[Candidate],
    consts: &FxHashMap<IrId, i64>,
) -> Option<ProofPlan> {
    match iv.iter_domain() {
        Some(domain) => {
            // Exact iteration domain: evaluate each access at both endpoints
            // (affine in the induction variable, so extremes are at the
            // endpoints) and union the ranges.
            let mut removed = Vec::new();
            let mut min = i64::MAX;
            let mut max = i64::MIN;
            for cand in group {
                let at_first =
                    cand.access.scale as i128 * domain.first as i128 + cand.access.offset as i128;
                let at_last =
                    cand.access.scale as i128 * domain.last as i128 + cand.access.offset as i128;
                let lo = at_first.min(at_last);
                let hi = at_first.max(at_last);
                if !fits_i32(lo) || !fits_i32(hi) {
                    log::debug!(
                        "{}: index range [{}, {}] leaves i32, keeping {}",
                        function.name,
                        lo,
                        hi,
                        cand.guard
                    );
                    continue;
                }
                removed.push(cand.guard);
                min = min.min(lo as i64);
                max = max.max(hi as i64);
            }
            if removed.is_empty() {
                return None;
            }
            if min < 0 {
                // Guaranteed to trip at runtime; the per-iteration checks
                // stay and catch it at the right iteration.
                return None;
            }
            let length = group[0].length;
            match consts.get(&length) {
                Some(&len) => {
                    if max < len {
                        Some(ProofPlan::Static { removed, min, max })
                    } else {
                        None
                    }
                }
                None => Some(ProofPlan::ConstDomain {
                    removed,
                    min,
                    max,
                    length,
                }),
            }
        }
        None => {
            // No closed-form domain. Constant bounds that still failed
            // (overflowing exit value, zero-trip) must not be guarded over.
            if iv.start.as_constant().is_some() && iv.stop.as_constant().is_some() {
                return None;
            }
            // Symbolic bounds are only predicable for unit strides with
            // strict-inequality exits, where the endpoint expressions are
            // `start` and `stop -/+ 1`.
            let unit = (iv.stride == 1 && iv.cmp == CompareOp::Lt)
                || (iv.stride == -1 && iv.cmp == CompareOp::Gt);
            if !unit {
                return None;
            }

            // All siblings must share a scale so the union range is still a
            // single affine pair of endpoints.
            let scale = group[0].access.scale;
            if scale == 0 {
                return None;
            }
            let mut removed = Vec::new();
            let mut offset_min = i64::MAX;
            let mut offset_max = i64::MIN;
            for cand in group {
                if cand.access.scale != scale {
                    continue;
                }
                // Keeping scale and offset in i32 range bounds the guard's
                // i64 arithmetic away from overflow.
                if !fits_i32(cand.access.scale as i128) || !fits_i32(cand.access.offset as i128) {
                    continue;
                }
                removed.push(cand.guard);
                offset_min = offset_min.min(cand.access.offset);
                offset_max = offset_max.max(cand.access.offset);
            }
            if removed.is_empty() {
                return None;
            }
            Some(ProofPlan::Symbolic {
                removed,
                iv: iv.clone(),
                scale,
                offset_min,
                offset_max,
                length: group[0].length,
            })
        }
    }
}

/// Delete the bounds checks with the given guard ids from the loop body.
fn delete_checks(function: &mut IrFunction, natural_loop: &NaturalLoop, removed: &[GuardId]) {
    let removed: FxHashSet<GuardId> = removed.iter().copied().collect();
    for &block_id in &natural_loop.blocks {
        if let Some(block) = function.cfg.get_block_mut(block_id) {
            block.instructions.retain(|inst| match inst {
                IrInstruction::BoundsCheck { guard, .. } => !removed.contains(guard),
                _ => true,
            });
        }
    }
}

/// Materialize `loop empty || (min_index >= 0 && max_index < length)` in the
/// preheader, all arithmetic in `i64`, and guard on it.
fn emit_symbolic_guard(
    function: &mut IrFunction,
    preheader: IrBlockId,
    iv: &InductionVariable,
    scale: i64,
    offset_min: i64,
    offset_max: i64,
    length: IrId,
) -> GuardId {
    let mut em = GuardEmitter::new(function);

    let start = em.bound(iv.start);
    let stop = em.bound(iv.stop);

    // Iteration values span [lo, hi] when the loop is entered at all.
    let (lo, hi) = if iv.stride == 1 {
        let one = em.const_i64(1);
        let last = em.binop(BinaryOp::Sub, stop, one);
        (start, last)
    } else {
        let one = em.const_i64(1);
        let last = em.binop(BinaryOp::Add, stop, one);
        (last, start)
    };

    // Affine extremes sit at the endpoints; the sign of the scale says which.
    let (min_src, max_src) = if scale > 0 { (lo, hi) } else { (hi, lo) };
    let idx_min = em.affine(scale, min_src, offset_min);
    let idx_max = em.affine(scale, max_src, offset_max);

    let zero = em.const_i64(0);
    let ge_zero = em.cmp(CompareOp::Ge, idx_min, zero);
    let len64 = em.widen(length);
    let lt_len = em.cmp(CompareOp::Lt, idx_max, len64);
    let in_range = em.binop_bool(BinaryOp::And, ge_zero, lt_len);

    // A loop that never runs touches nothing; the endpoint expressions are
    // meaningless then and must not deoptimize.
    let entered_cmp = if iv.stride == 1 {
        CompareOp::Lt
    } else {
        CompareOp::Gt
    };
    let entered = em.cmp(entered_cmp, start, stop);
    let empty = em.not(entered);
    let cond = em.binop_bool(BinaryOp::Or, empty, in_range);

    let guard = em.guard(cond);
    em.flush(preheader);
    guard
}

/// Recover `scale * phi + offset` from an index register by walking its
/// defining instructions. Only a single header phi may appear; constant
/// arithmetic folds into scale/offset with overflow-checked `i64` math.
pub fn recover_affine(
    function: &IrFunction,
    defs: &FxHashMap<IrId, (IrBlockId, usize)>,
    consts: &FxHashMap<IrId, i64>,
    phis: &FxHashSet<IrId>,
    index: IrId,
) -> Option<AffineAccess> {
    let (base, scale, offset) = affine_term(function, defs, consts, phis, index, 0)?;
    let iv = base?;
    Some(AffineAccess {
        iv,
        scale,
        offset,
        index_reg: index,
    })
}

const AFFINE_MAX_DEPTH: usize = 16;

/// `(base, scale, offset)` with value `scale * base + offset`; a `None`
/// base means a pure constant.
fn affine_term(
    function: &IrFunction,
    defs: &FxHashMap<IrId, (IrBlockId, usize)>,
    consts: &FxHashMap<IrId, i64>,
    phis: &FxHashSet<IrId>,
    reg: IrId,
    depth: usize,
) -> Option<(Option<IrId>, i64, i64)> {
    if depth > AFFINE_MAX_DEPTH {
        return None;
    }
    if let Some(&c) = consts.get(&reg) {
        return Some((None, 0, c));
    }
    if phis.contains(&reg) {
        return Some((Some(reg), 1, 0));
    }

    let &(block_id, idx) = defs.get(&reg)?;
    let inst = &function.cfg.get_block(block_id)?.instructions[idx];
    match inst {
        IrInstruction::Copy { src, .. } => affine_term(function, defs, consts, phis, *src, depth + 1),
        IrInstruction::BinOp {
            op, left, right, ..
        } => {
            let l = affine_term(function, defs, consts, phis, *left, depth + 1)?;
            let r = affine_term(function, defs, consts, phis, *right, depth + 1)?;
            match op {
                BinaryOp::Add => combine(l, r, 1),
                BinaryOp::Sub => combine(l, r, -1),
                BinaryOp::Mul => {
                    // Exactly one side may carry the phi.
                    let (var, konst) = match (l.0, r.0) {
                        (_, None) => (l, r.2),
                        (None, _) => (r, l.2),
                        _ => return None,
                    };
                    Some((
                        var.0,
                        var.1.checked_mul(konst)?,
                        var.2.checked_mul(konst)?,
                    ))
                }
                BinaryOp::Shl => {
                    // Variable shifted left by a constant amount.
                    let shift = match r.0 {
                        None => r.2,
                        Some(_) => return None,
                    };
                    if !(0..=31).contains(&shift) {
                        return None;
                    }
                    let factor = 1i64 << shift;
                    Some((
                        l.0,
                        l.1.checked_mul(factor)?,
                        l.2.checked_mul(factor)?,
                    ))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn combine(
    l: (Option<IrId>, i64, i64),
    r: (Option<IrId>, i64, i64),
    sign: i64,
) -> Option<(Option<IrId>, i64, i64)> {
    let base = match (l.0, r.0) {
        (a, None) => a,
        (None, b) => b,
        (Some(a), Some(b)) if a == b => Some(a),
        _ => return None,
    };
    Some((
        base,
        l.1.checked_add(r.1.checked_mul(sign)?)?,
        l.2.checked_add(r.2.checked_mul(sign)?)?,
    ))
}

fn fits_i32(v: i128) -> bool {
    v >= i32::MIN as i128 && v <= i32::MAX as i128
}

/// Small instruction emitter for preheader guard materialization. Registers
/// are allocated against the function; instructions are buffered and appended
/// to the target block on flush.
struct GuardEmitter<'f> {
    function: &'f mut IrFunction,
    insts: Vec<IrInstruction>,
}

impl<'f> GuardEmitter<'f> {
    fn new(function: &'f mut IrFunction) -> Self {
        Self {
            function,
            insts: Vec::new(),
        }
    }

    fn reg(&mut self, ty: IrType) -> IrId {
        let r = self.function.alloc_reg();
        self.function.register_types.insert(r, ty);
        r
    }

    fn const_i64(&mut self, v: i64) -> IrId {
        let dest = self.reg(IrType::I64);
        self.insts.push(IrInstruction::Const {
            dest,
            value: IrValue::I64(v),
        });
        dest
    }

    /// Widen a register to i64, inserting a cast if needed.
    fn widen(&mut self, reg: IrId) -> IrId {
        if matches!(self.function.register_type(reg), Some(IrType::I64)) {
            return reg;
        }
        let from_ty = self
            .function
            .register_type(reg)
            .cloned()
            .unwrap_or(IrType::I32);
        let dest = self.reg(IrType::I64);
        self.insts.push(IrInstruction::Cast {
            dest,
            src: reg,
            from_ty,
            to_ty: IrType::I64,
        });
        dest
    }

    fn bound(&mut self, b: Bound) -> IrId {
        match b {
            Bound::Constant(v) => self.const_i64(v),
            Bound::Symbolic(reg) => self.widen(reg),
        }
    }

    fn binop(&mut self, op: BinaryOp, left: IrId, right: IrId) -> IrId {
        let dest = self.reg(IrType::I64);
        self.insts.push(IrInstruction::BinOp {
            dest,
            op,
            left,
            right,
        });
        dest
    }

    fn binop_bool(&mut self, op: BinaryOp, left: IrId, right: IrId) -> IrId {
        let dest = self.reg(IrType::Bool);
        self.insts.push(IrInstruction::BinOp {
            dest,
            op,
            left,
            right,
        });
        dest
    }

    fn cmp(&mut self, op: CompareOp, left: IrId, right: IrId) -> IrId {
        let dest = self.reg(IrType::Bool);
        self.insts.push(IrInstruction::Cmp {
            dest,
            op,
            left,
            right,
        });
        dest
    }

    fn not(&mut self, operand: IrId) -> IrId {
        let dest = self.reg(IrType::Bool);
        self.insts.push(IrInstruction::UnOp {
            dest,
            op: UnaryOp::Not,
            operand,
        });
        dest
    }

    fn affine(&mut self, scale: i64, base: IrId, offset: i64) -> IrId {
        let mut value = base;
        if scale != 1 {
            let s = self.const_i64(scale);
            value = self.binop(BinaryOp::Mul, value, s);
        }
        if offset != 0 {
            let o = self.const_i64(offset);
            value = self.binop(BinaryOp::Add, value, o);
        }
        value
    }

    fn guard(&mut self, condition: IrId) -> GuardId {
        let guard = self.function.alloc_guard();
        self.insts.push(IrInstruction::Guard { condition, guard });
        guard
    }

    fn flush(self, block: IrBlockId) {
        if let Some(b) = self.function.cfg.get_block_mut(block) {
            b.instructions.extend(self.insts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::IrTerminator;

    /// `for (i = start; i cmp stop; i += stride) { check(scale*i + offset, len) }`
    /// with `len` either a constant or a parameter.
    fn checked_loop(
        start: i32,
        stop: i32,
        stride: i32,
        cmp: CompareOp,
        scale: i32,
        offset: i32,
        const_len: Option<i32>,
    ) -> (IrFunction, IrBlockId, IrBlockId, GuardId) {
        let mut b = IrBuilder::new("checked");
        let len = match const_len {
            Some(_) => IrId::invalid(),
            None => b.add_parameter("len", IrType::I32),
        };

        let header = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();

        let start_reg = b.build_i32(start);
        let len = if let Some(l) = const_len {
            b.build_i32(l)
        } else {
            len
        };
        b.build_branch(header);

        b.switch_to_block(header);
        let i = b.build_phi(header, IrType::I32);
        let stop_reg = b.build_i32(stop);
        let cond = b.build_cmp(cmp, i, stop_reg);
        b.build_cond_branch(cond, body, exit);

        b.switch_to_block(body);
        let scale_reg = b.build_i32(scale);
        let scaled = b.build_binop(BinaryOp::Mul, i, scale_reg);
        let offset_reg = b.build_i32(offset);
        let idx = b.build_binop(BinaryOp::Add, scaled, offset_reg);
        let guard = b.build_bounds_check(idx, len);
        let stride_reg = b.build_i32(stride);
        let next = b.build_binop(BinaryOp::Add, i, stride_reg);
        b.build_branch(header);

        let entry = b.function.entry_block();
        b.add_phi_incoming(header, i, entry, start_reg);
        b.add_phi_incoming(header, i, body, next);

        b.switch_to_block(exit);
        b.build_return(None);

        (b.finish(), header, body, guard)
    }

    fn run_pass(f: &mut IrFunction) -> PredicationPass {
        let domtree = DominatorTree::compute(f);
        let loops = LoopNestInfo::analyze(f, &domtree).unwrap();
        let mut pass = PredicationPass::new(FxHashSet::default());
        pass.run(f, &domtree, &loops);
        pass
    }

    fn count_checks(f: &IrFunction) -> usize {
        f.cfg
            .blocks
            .values()
            .flat_map(|b| b.instructions.iter())
            .filter(|i| matches!(i, IrInstruction::BoundsCheck { .. }))
            .count()
    }

    fn count_guards(f: &IrFunction, block: IrBlockId) -> usize {
        f.cfg
            .get_block(block)
            .unwrap()
            .instructions
            .iter()
            .filter(|i| matches!(i, IrInstruction::Guard { .. }))
            .count()
    }

    #[test]
    fn test_static_proof_deletes_checks() {
        let (mut f, header, _, guard) = checked_loop(0, 1000, 1, CompareOp::Lt, 1, 0, Some(1000));
        let pass = run_pass(&mut f);

        assert_eq!(count_checks(&f), 0);
        assert_eq!(pass.records.len(), 1);
        let rec = &pass.records[0];
        assert_eq!(rec.loop_header, header);
        assert!(rec.static_proof);
        assert_eq!(rec.hoisted_guard, None);
        assert_eq!(rec.removed_checks, vec![guard]);
        assert_eq!(rec.min_index, Some(0));
        assert_eq!(rec.max_index, Some(999));
    }

    #[test]
    fn test_out_of_range_domain_keeps_check() {
        // max index 1000 is not < 1000
        let (mut f, _, _, _) = checked_loop(0, 1001, 1, CompareOp::Lt, 1, 0, Some(1000));
        let pass = run_pass(&mut f);
        assert_eq!(count_checks(&f), 1);
        assert!(pass.records.is_empty());
    }

    #[test]
    fn test_negative_min_keeps_check() {
        let (mut f, _, _, _) = checked_loop(-1, 1000, 1, CompareOp::Lt, 1, 0, Some(1000));
        run_pass(&mut f);
        assert_eq!(count_checks(&f), 1);
    }

    #[test]
    fn test_symbolic_length_hoists_guard() {
        let (mut f, _, _, _) = checked_loop(0, 500, 1, CompareOp::Lt, 2, 10, None);
        let pass = run_pass(&mut f);

        assert_eq!(count_checks(&f), 0);
        let entry = f.entry_block();
        assert_eq!(count_guards(&f, entry), 1);
        let rec = &pass.records[0];
        assert!(!rec.static_proof);
        assert!(rec.hoisted_guard.is_some());
        assert_eq!(rec.min_index, Some(10));
        assert_eq!(rec.max_index, Some(1008));
    }

    #[test]
    fn test_overflowing_exit_value_refused() {
        // i from MAX-3 by 2: the exiting value wraps, no predication.
        let (mut f, _, _, _) =
            checked_loop(i32::MAX - 3, i32::MAX, 2, CompareOp::Lt, 1, 0, Some(100));
        let pass = run_pass(&mut f);
        assert_eq!(count_checks(&f), 1);
        assert!(pass.records.is_empty());
    }

    #[test]
    fn test_failed_speculation_left_alone() {
        let (mut f, _, _, guard) = checked_loop(0, 1000, 1, CompareOp::Lt, 1, 0, Some(1000));
        let domtree = DominatorTree::compute(&f);
        let loops = LoopNestInfo::analyze(&f, &domtree).unwrap();
        let mut failed = FxHashSet::default();
        failed.insert(guard);
        let mut pass = PredicationPass::new(failed);
        let removed = pass.run(&mut f, &domtree, &loops);

        assert_eq!(removed, 0);
        assert_eq!(count_checks(&f), 1);
    }

    #[test]
    fn test_conditional_check_not_predicated() {
        // The check sits on one arm of a diamond inside the loop, so it does
        // not dominate the back edge and must stay.
        let mut b = IrBuilder::new("diamond_in_loop");
        let flag = b.add_parameter("flag", IrType::Bool);

        let header = b.create_block();
        let then_bb = b.create_block();
        let else_bb = b.create_block();
        let latch = b.create_block();
        let exit = b.create_block();

        let zero = b.build_i32(0);
        let len = b.build_i32(1000);
        b.build_branch(header);

        b.switch_to_block(header);
        let i = b.build_phi(header, IrType::I32);
        let stop = b.build_i32(1000);
        let cond = b.build_cmp(CompareOp::Lt, i, stop);
        let body = b.create_block();
        b.build_cond_branch(cond, body, exit);

        b.switch_to_block(body);
        b.build_cond_branch(flag, then_bb, else_bb);

        b.switch_to_block(then_bb);
        b.build_bounds_check(i, len);
        b.build_branch(latch);

        b.switch_to_block(else_bb);
        b.build_branch(latch);

        b.switch_to_block(latch);
        let one = b.build_i32(1);
        let next = b.build_binop(BinaryOp::Add, i, one);
        b.build_branch(header);

        let entry = b.function.entry_block();
        b.add_phi_incoming(header, i, entry, zero);
        b.add_phi_incoming(header, i, latch, next);

        b.switch_to_block(exit);
        b.build_return(None);

        let mut f = b.finish();
        let pass = run_pass(&mut f);
        assert_eq!(count_checks(&f), 1);
        assert!(pass.records.is_empty());
    }

    #[test]
    fn test_sibling_accesses_smeared_into_one_proof() {
        // a[i] and a[i + 2] against the same constant-length array: one
        // record, both checks gone.
        let mut b = IrBuilder::new("smear");
        let header = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();

        let zero = b.build_i32(0);
        let len = b.build_i32(1000);
        b.build_branch(header);

        b.switch_to_block(header);
        let i = b.build_phi(header, IrType::I32);
        let stop = b.build_i32(998);
        let cond = b.build_cmp(CompareOp::Lt, i, stop);
        b.build_cond_branch(cond, body, exit);

        b.switch_to_block(body);
        let g1 = b.build_bounds_check(i, len);
        let two = b.build_i32(2);
        let idx2 = b.build_binop(BinaryOp::Add, i, two);
        let g2 = b.build_bounds_check(idx2, len);
        let one = b.build_i32(1);
        let next = b.build_binop(BinaryOp::Add, i, one);
        b.build_branch(header);

        let entry = b.function.entry_block();
        b.add_phi_incoming(header, i, entry, zero);
        b.add_phi_incoming(header, i, body, next);

        b.switch_to_block(exit);
        b.build_return(None);

        let mut f = b.finish();
        let pass = run_pass(&mut f);

        assert_eq!(count_checks(&f), 0);
        assert_eq!(pass.records.len(), 1);
        let rec = &pass.records[0];
        assert_eq!(rec.removed_checks.len(), 2);
        assert!(rec.removed_checks.contains(&g1));
        assert!(rec.removed_checks.contains(&g2));
        assert_eq!(rec.min_index, Some(0));
        assert_eq!(rec.max_index, Some(999));
        assert!(rec.static_proof);
    }

    #[test]
    fn test_symbolic_stop_unit_stride_guarded() {
        // for (i = 0; i < n; i++) check(i, n): runtime guard in preheader.
        let mut b = IrBuilder::new("symbolic_stop");
        let n = b.add_parameter("n", IrType::I32);

        let header = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();

        let zero = b.build_i32(0);
        b.build_branch(header);

        b.switch_to_block(header);
        let i = b.build_phi(header, IrType::I32);
        let cond = b.build_cmp(CompareOp::Lt, i, n);
        b.build_cond_branch(cond, body, exit);

        b.switch_to_block(body);
        b.build_bounds_check(i, n);
        let one = b.build_i32(1);
        let next = b.build_binop(BinaryOp::Add, i, one);
        b.build_branch(header);

        let entry = b.function.entry_block();
        b.add_phi_incoming(header, i, entry, zero);
        b.add_phi_incoming(header, i, body, next);

        b.switch_to_block(exit);
        b.build_return(None);

        let mut f = b.finish();
        let pass = run_pass(&mut f);

        assert_eq!(count_checks(&f), 0);
        assert_eq!(count_guards(&f, f.entry_block()), 1);
        let rec = &pass.records[0];
        assert!(!rec.static_proof);
        assert_eq!(rec.min_index, None);
    }

    #[test]
    fn test_rerun_is_noop() {
        let (mut f, _, _, _) = checked_loop(0, 500, 1, CompareOp::Lt, 2, 10, None);
        run_pass(&mut f);
        let before = serde_json::to_string(&f).unwrap();

        let second = run_pass(&mut f);
        assert!(second.records.is_empty());
        assert_eq!(serde_json::to_string(&f).unwrap(), before);
    }

    #[test]
    fn test_affine_recovery_through_shift() {
        // idx = (i << 2) - 4
        let mut b = IrBuilder::new("shift");
        let header = b.create_block();
        b.build_branch(header);
        b.switch_to_block(header);
        let i = b.build_phi(header, IrType::I32);
        let two = b.build_i32(2);
        let shifted = b.build_binop(BinaryOp::Shl, i, two);
        let four = b.build_i32(4);
        let idx = b.build_binop(BinaryOp::Sub, shifted, four);
        b.build_return(None);

        let f = b.finish();
        let defs = definition_sites(&f);
        let consts = constant_defs(&f);
        let phis: FxHashSet<IrId> = [i].into_iter().collect();

        let access = recover_affine(&f, &defs, &consts, &phis, idx).unwrap();
        assert_eq!(access.iv, i);
        assert_eq!(access.scale, 4);
        assert_eq!(access.offset, -4);
    }

    #[test]
    fn test_affine_recovery_rejects_two_phis() {
        let mut b = IrBuilder::new("two_phis");
        let header = b.create_block();
        b.build_branch(header);
        b.switch_to_block(header);
        let i = b.build_phi(header, IrType::I32);
        let j = b.build_phi(header, IrType::I32);
        let idx = b.build_binop(BinaryOp::Add, i, j);
        b.build_return(None);

        let f = b.finish();
        let defs = definition_sites(&f);
        let consts = constant_defs(&f);
        let phis: FxHashSet<IrId> = [i, j].into_iter().collect();

        assert!(recover_affine(&f, &defs, &consts, &phis, idx).is_none());
    }

    #[test]
    fn test_guard_placed_before_preheader_terminator() {
        let (mut f, _, _, _) = checked_loop(0, 500, 1, CompareOp::Lt, 1, 0, None);
        run_pass(&mut f);
        let entry = f.entry_block();
        let block = f.cfg.get_block(entry).unwrap();
        assert!(matches!(block.terminator, IrTerminator::Branch { .. }));
        assert!(matches!(
            block.instructions.last(),
            Some(IrInstruction::Guard { .. })
        ));
    }
}
