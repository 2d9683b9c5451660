//! Write-Barrier Decisions
//!
//! Commits a barrier kind on every reference store. A store may skip its
//! barrier only when the target object is the most recently allocated,
//! not-yet-published object at that program point: no other allocation, no
//! call, no publication of the target, and no control-flow merge sits between
//! the `Alloc` and the store. Everything else gets the kind dictated by the
//! collector policy.
//!
//! Each store's decision is committed exactly once; already-decided stores
//! are never revisited, so re-running the pass is a no-op.

use super::escape_analysis::AllocationTracking;
use super::{BarrierKind, IrBlockId, IrFunction, IrId, IrInstruction};
use fxhash::FxHashSet;
use serde::{Deserialize, Serialize};

/// Garbage collector the generated code must cooperate with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectorPolicy {
    /// Serial or parallel generational collector: post-write card mark
    SerialCardMark,

    /// Concurrent collector: SATB pre-write barrier plus post-write barrier
    GenerationalPrePost,
}

impl CollectorPolicy {
    /// Barrier shape this collector requires on a non-elidable store.
    pub fn barrier_kind(&self) -> BarrierKind {
        match self {
            CollectorPolicy::SerialCardMark => BarrierKind::CardMark,
            CollectorPolicy::GenerationalPrePost => BarrierKind::PreAndPost,
        }
    }
}

/// One committed store decision, for the rewrite report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierDecision {
    pub block: IrBlockId,

    /// Instruction index of the store at decision time
    pub index: usize,

    pub kind: BarrierKind,

    /// Whether the barrier was elided on freshness grounds
    pub elided: bool,
}

/// The barrier decision pass.
pub struct WriteBarrierPass {
    policy: CollectorPolicy,

    /// Every decision committed by this run
    pub decisions: Vec<BarrierDecision>,
}

impl WriteBarrierPass {
    pub fn new(policy: CollectorPolicy) -> Self {
        Self {
            policy,
            decisions: Vec::new(),
        }
    }

    /// Decide all undecided stores. Returns the number of stores whose
    /// barrier was elided.
    pub fn run(&mut self, function: &mut IrFunction, tracking: &AllocationTracking) -> usize {
        // Decide first over the immutable function, commit after.
        let mut pending: Vec<(IrBlockId, usize, BarrierKind, bool)> = Vec::new();

        let block_ids: Vec<IrBlockId> = function.cfg.blocks.keys().copied().collect();
        for block_id in block_ids {
            let block = match function.cfg.get_block(block_id) {
                Some(b) => b,
                None => continue,
            };
            for (index, inst) in block.instructions.iter().enumerate() {
                let (ptr, value, barrier) = match inst {
                    IrInstruction::Store {
                        ptr,
                        value,
                        barrier,
                    } => (*ptr, *value, barrier),
                    _ => continue,
                };
                if barrier.is_some() {
                    continue;
                }

                let is_ref = function
                    .register_type(value)
                    .map(|t| t.is_reference())
                    .unwrap_or(true);
                if !is_ref {
                    // Primitive stores are invisible to the collector.
                    pending.push((block_id, index, BarrierKind::NoBarrier, false));
                    continue;
                }

                let fresh = tracking
                    .root_of(ptr)
                    .map(|root| target_is_fresh(function, tracking, block_id, index, root))
                    .unwrap_or(false);

                if fresh {
                    log::trace!(
                        "{}: store at {}[{}] hits fresh allocation, eliding barrier",
                        function.name,
                        block_id,
                        index
                    );
                    pending.push((block_id, index, BarrierKind::NoBarrier, true));
                } else {
                    pending.push((block_id, index, self.policy.barrier_kind(), false));
                }
            }
        }

        let mut elided = 0;
        for (block_id, index, kind, was_elided) in pending {
            if let Some(block) = function.cfg.get_block_mut(block_id) {
                if let Some(IrInstruction::Store { barrier, .. }) =
                    block.instructions.get_mut(index)
                {
                    *barrier = Some(kind);
                }
            }
            if was_elided {
                elided += 1;
            }
            self.decisions.push(BarrierDecision {
                block: block_id,
                index,
                kind,
                elided: was_elided,
            });
        }

        log::debug!(
            "{}: {} store decisions, {} elided",
            function.name,
            self.decisions.len(),
            elided
        );
        elided
    }
}

/// Whether `root` is the most recently allocated, not-yet-published object
/// at the given program point.
///
/// Walks backwards from the store, continuing into the predecessor only
/// while the path is unique (single predecessor with a single successor —
/// a merge or a branch in between kills the freshness fact). The walk stops
/// at the first event that settles the question:
/// - the allocation of `root` itself: fresh
/// - any other allocation: `root` is no longer the most recent
/// - a call: may observe or move the object
/// - a store publishing `root` as a value: no longer private
fn target_is_fresh(
    function: &IrFunction,
    tracking: &AllocationTracking,
    block: IrBlockId,
    index: usize,
    root: IrId,
) -> bool {
    let mut current = block;
    let mut upto = index;
    let mut visited: FxHashSet<IrBlockId> = FxHashSet::default();

    loop {
        let b = match function.cfg.get_block(current) {
            Some(b) => b,
            None => return false,
        };

        for inst in b.instructions[..upto].iter().rev() {
            match inst {
                IrInstruction::Alloc { dest, .. } => {
                    return *dest == root;
                }
                IrInstruction::Call { .. } => return false,
                IrInstruction::Store { value, .. } => {
                    if tracking.root_of(*value) == Some(root) {
                        return false;
                    }
                }
                _ => {}
            }
        }

        if !visited.insert(current) {
            return false;
        }

        // Extend through a straight-line predecessor only.
        if b.predecessors.len() != 1 {
            return false;
        }
        let pred = b.predecessors[0];
        let pred_block = match function.cfg.get_block(pred) {
            Some(p) => p,
            None => return false,
        };
        if pred_block.successors().len() != 1 {
            return false;
        }

        upto = pred_block.instructions.len();
        current = pred;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::escape_analysis::analyze_allocations;
    use crate::ir::loop_analysis::DominatorTree;
    use crate::ir::{IrType, IrValue};

    fn decide(f: &mut IrFunction, policy: CollectorPolicy) -> WriteBarrierPass {
        let domtree = DominatorTree::compute(f);
        let tracking = analyze_allocations(f, &domtree);
        let mut pass = WriteBarrierPass::new(policy);
        pass.run(f, &tracking);
        pass
    }

    fn store_barriers(f: &IrFunction) -> Vec<Option<BarrierKind>> {
        f.cfg
            .blocks
            .values()
            .flat_map(|b| b.instructions.iter())
            .filter_map(|i| match i {
                IrInstruction::Store { barrier, .. } => Some(*barrier),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_fresh_allocation_store_elided() {
        let mut b = IrBuilder::new("init");
        let a = b.build_alloc(IrType::I64);
        let zero = b.build_i32(0);
        let slot = b.build_gep(a, zero, IrType::I64);
        let null = b.build_const(IrValue::Null);
        b.build_store(slot, null);
        b.build_return(None);

        let mut f = b.finish();
        let pass = decide(&mut f, CollectorPolicy::SerialCardMark);

        assert_eq!(store_barriers(&f), vec![Some(BarrierKind::NoBarrier)]);
        assert_eq!(pass.decisions.len(), 1);
        assert!(pass.decisions[0].elided);
    }

    #[test]
    fn test_primitive_store_needs_no_barrier() {
        let mut b = IrBuilder::new("prim");
        let a = b.build_alloc(IrType::I64);
        let zero = b.build_i32(0);
        let slot = b.build_gep(a, zero, IrType::I64);
        let v = b.build_i64(7);
        b.build_store(slot, v);
        b.build_return(None);

        let mut f = b.finish();
        let pass = decide(&mut f, CollectorPolicy::GenerationalPrePost);

        assert_eq!(store_barriers(&f), vec![Some(BarrierKind::NoBarrier)]);
        assert!(!pass.decisions[0].elided);
    }

    #[test]
    fn test_cross_referencing_allocations_keep_both_barriers() {
        // a = alloc; b = alloc; a[0] = b; b[0] = a
        // The store into a sees b as the most recent allocation; the store
        // into b happens after b was published into a. Neither is elidable.
        let mut bld = IrBuilder::new("cross");
        let a = bld.build_alloc(IrType::I64);
        let b = bld.build_alloc(IrType::I64);
        let zero = bld.build_i32(0);
        let a0 = bld.build_gep(a, zero, IrType::I64);
        let b0 = bld.build_gep(b, zero, IrType::I64);
        bld.build_store(a0, b);
        bld.build_store(b0, a);
        bld.build_return(None);

        let mut f = bld.finish();
        decide(&mut f, CollectorPolicy::SerialCardMark);

        assert_eq!(
            store_barriers(&f),
            vec![Some(BarrierKind::CardMark), Some(BarrierKind::CardMark)]
        );
    }

    #[test]
    fn test_init_then_publish_elides_init_only() {
        // a = alloc; a[0] = null; global = a
        let mut b = IrBuilder::new("publish");
        let global = b.add_parameter("global", IrType::Ptr(Box::new(IrType::I64)));
        let a = b.build_alloc(IrType::I64);
        let zero = b.build_i32(0);
        let slot = b.build_gep(a, zero, IrType::I64);
        let null = b.build_const(IrValue::Null);
        b.build_store(slot, null);
        b.build_store(global, a);
        b.build_return(None);

        let mut f = b.finish();
        decide(&mut f, CollectorPolicy::SerialCardMark);

        assert_eq!(
            store_barriers(&f),
            vec![Some(BarrierKind::NoBarrier), Some(BarrierKind::CardMark)]
        );
    }

    #[test]
    fn test_call_between_alloc_and_store_keeps_barrier() {
        let mut b = IrBuilder::new("call_between");
        let a = b.build_alloc(IrType::I64);
        b.build_call("maybe_gc", vec![], IrType::Void);
        let zero = b.build_i32(0);
        let slot = b.build_gep(a, zero, IrType::I64);
        let null = b.build_const(IrValue::Null);
        b.build_store(slot, null);
        b.build_return(None);

        let mut f = b.finish();
        decide(&mut f, CollectorPolicy::SerialCardMark);

        assert_eq!(store_barriers(&f), vec![Some(BarrierKind::CardMark)]);
    }

    #[test]
    fn test_merge_between_alloc_and_store_keeps_barrier() {
        let mut b = IrBuilder::new("merge");
        let cond = b.build_bool(true);
        let a = b.build_alloc(IrType::I64);
        let left = b.create_block();
        let right = b.create_block();
        let join = b.create_block();
        b.build_cond_branch(cond, left, right);

        b.switch_to_block(left);
        b.build_branch(join);
        b.switch_to_block(right);
        b.build_branch(join);

        b.switch_to_block(join);
        let zero = b.build_i32(0);
        let slot = b.build_gep(a, zero, IrType::I64);
        let null = b.build_const(IrValue::Null);
        b.build_store(slot, null);
        b.build_return(None);

        let mut f = b.finish();
        decide(&mut f, CollectorPolicy::SerialCardMark);

        assert_eq!(store_barriers(&f), vec![Some(BarrierKind::CardMark)]);
    }

    #[test]
    fn test_straight_line_chain_still_fresh() {
        // alloc in one block, store in the unique successor: still fresh
        let mut b = IrBuilder::new("chain");
        let a = b.build_alloc(IrType::I64);
        let next = b.create_block();
        b.build_branch(next);

        b.switch_to_block(next);
        let zero = b.build_i32(0);
        let slot = b.build_gep(a, zero, IrType::I64);
        let null = b.build_const(IrValue::Null);
        b.build_store(slot, null);
        b.build_return(None);

        let mut f = b.finish();
        let pass = decide(&mut f, CollectorPolicy::SerialCardMark);

        assert_eq!(store_barriers(&f), vec![Some(BarrierKind::NoBarrier)]);
        assert!(pass.decisions[0].elided);
    }

    #[test]
    fn test_policy_selects_pre_and_post() {
        let mut b = IrBuilder::new("satb");
        let target = b.add_parameter("target", IrType::Ptr(Box::new(IrType::I64)));
        let a = b.build_alloc(IrType::I64);
        b.build_store(target, a);
        b.build_return(None);

        let mut f = b.finish();
        decide(&mut f, CollectorPolicy::GenerationalPrePost);

        assert_eq!(store_barriers(&f), vec![Some(BarrierKind::PreAndPost)]);
    }

    #[test]
    fn test_decisions_committed_once() {
        let mut b = IrBuilder::new("once");
        let a = b.build_alloc(IrType::I64);
        let zero = b.build_i32(0);
        let slot = b.build_gep(a, zero, IrType::I64);
        let null = b.build_const(IrValue::Null);
        b.build_store(slot, null);
        b.build_return(None);

        let mut f = b.finish();
        decide(&mut f, CollectorPolicy::SerialCardMark);

        // A second run under a different policy must not flip anything.
        let second = decide(&mut f, CollectorPolicy::GenerationalPrePost);
        assert!(second.decisions.is_empty());
        assert_eq!(store_barriers(&f), vec![Some(BarrierKind::NoBarrier)]);
    }
}
