//! Allocation and Escape Tracking
//!
//! Tracks each `Alloc` and every register derived from it (through
//! `GetElementPtr`, `Cast`, `Copy`) to a single allocation root, then decides
//! whether the allocation escapes: stored as a value into memory, passed to a
//! call, returned, or merged through a phi. Uses the analysis cannot model
//! degrade the state to `Unknown`, which downstream consumers treat exactly
//! like `Escaped`.
//!
//! The tracking feeds the write-barrier pass: only an allocation that has not
//! escaped can ever have its store barriers elided.

use super::loop_analysis::DominatorTree;
use super::{IrBlockId, IrFunction, IrId, IrInstruction, IrTerminator};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Whether an allocation's reference can be observed outside the code the
/// analysis has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscapeState {
    /// Every use is accounted for and none publishes the reference
    NotEscaped,

    /// The reference is published (stored, passed, returned, or phi-merged)
    Escaped,

    /// A use the analysis cannot model; treated as escaped
    Unknown,
}

impl EscapeState {
    pub fn is_escaped(&self) -> bool {
        !matches!(self, EscapeState::NotEscaped)
    }
}

/// Per-allocation facts.
#[derive(Debug, Clone)]
pub struct AllocationInfo {
    /// Register holding the fresh reference
    pub dest: IrId,

    /// Block containing the `Alloc`
    pub block: IrBlockId,

    /// Instruction index within the block
    pub index: usize,

    pub state: EscapeState,

    /// Position in the chain of allocations dominating this program point
    /// (0 = first allocation on the path from entry)
    pub rank: usize,
}

/// Result of allocation tracking for one function.
#[derive(Debug, Clone, Default)]
pub struct AllocationTracking {
    /// All allocations keyed by their defining register
    pub allocations: FxHashMap<IrId, AllocationInfo>,

    /// Derived register -> allocation root (includes roots themselves)
    roots: FxHashMap<IrId, IrId>,
}

impl AllocationTracking {
    /// Resolve a register to the allocation it points into, if tracked.
    pub fn root_of(&self, reg: IrId) -> Option<IrId> {
        self.roots.get(&reg).copied()
    }

    /// Escape state of an allocation register. Untracked registers are
    /// `Unknown` (they may alias anything).
    pub fn state_of(&self, alloc: IrId) -> EscapeState {
        self.allocations
            .get(&alloc)
            .map(|info| info.state)
            .unwrap_or(EscapeState::Unknown)
    }
}

/// Track every allocation in a function and compute its escape state and
/// dominating-chain rank.
pub fn analyze_allocations(function: &IrFunction, domtree: &DominatorTree) -> AllocationTracking {
    let mut tracking = AllocationTracking::default();

    // Collect allocation sites; each is its own root.
    for (&block_id, block) in &function.cfg.blocks {
        for (index, inst) in block.instructions.iter().enumerate() {
            if let IrInstruction::Alloc { dest, .. } = inst {
                tracking.roots.insert(*dest, *dest);
                tracking.allocations.insert(
                    *dest,
                    AllocationInfo {
                        dest: *dest,
                        block: block_id,
                        index,
                        state: EscapeState::NotEscaped,
                        rank: 0,
                    },
                );
            }
        }
    }

    if tracking.allocations.is_empty() {
        return tracking;
    }

    // Propagate roots through pointer-preserving instructions to a fixpoint.
    // Blocks iterate in creation order, so forward defs converge in few
    // passes.
    let mut changed = true;
    while changed {
        changed = false;
        for block in function.cfg.blocks.values() {
            for inst in &block.instructions {
                let (dest, src) = match inst {
                    IrInstruction::Copy { dest, src } => (*dest, *src),
                    IrInstruction::Cast { dest, src, .. } => (*dest, *src),
                    IrInstruction::GetElementPtr { dest, ptr, .. } => (*dest, *ptr),
                    _ => continue,
                };
                if let Some(&root) = tracking.roots.get(&src) {
                    if tracking.roots.insert(dest, root) != Some(root) {
                        changed = true;
                    }
                }
            }
        }
    }

    // Escape marking.
    for block in function.cfg.blocks.values() {
        for phi in &block.phi_nodes {
            // A reference merged across control flow loses its identity.
            for (_, value) in &phi.incoming {
                mark(&mut tracking, *value, EscapeState::Escaped);
            }
        }

        for inst in &block.instructions {
            match inst {
                IrInstruction::Store { value, .. } => {
                    // Storing the reference itself publishes it. Storing
                    // *into* the object (the ptr operand) does not.
                    mark(&mut tracking, *value, EscapeState::Escaped);
                }
                IrInstruction::Call { args, .. } => {
                    for &arg in args {
                        mark(&mut tracking, arg, EscapeState::Escaped);
                    }
                }
                // Pointer-preserving uses, loads through the pointer, and
                // the checks never publish.
                IrInstruction::Copy { .. }
                | IrInstruction::Cast { .. }
                | IrInstruction::GetElementPtr { .. }
                | IrInstruction::Load { .. }
                | IrInstruction::Alloc { .. }
                | IrInstruction::Const { .. }
                | IrInstruction::BoundsCheck { .. }
                | IrInstruction::Guard { .. } => {}
                // Arithmetic over a tracked pointer is not modeled.
                IrInstruction::BinOp { left, right, .. } => {
                    mark(&mut tracking, *left, EscapeState::Unknown);
                    mark(&mut tracking, *right, EscapeState::Unknown);
                }
                IrInstruction::UnOp { operand, .. } => {
                    mark(&mut tracking, *operand, EscapeState::Unknown);
                }
                IrInstruction::Cmp { .. } => {}
            }
        }

        if let IrTerminator::Return { value: Some(value) } = &block.terminator {
            mark(&mut tracking, *value, EscapeState::Escaped);
        }
    }

    compute_ranks(function, domtree, &mut tracking);

    log::trace!(
        "{}: {} allocations, {} escaped",
        function.name,
        tracking.allocations.len(),
        tracking
            .allocations
            .values()
            .filter(|a| a.state.is_escaped())
            .count()
    );

    tracking
}

/// Upgrade the state of the allocation `reg` resolves to. `Escaped` is
/// sticky over `Unknown`.
fn mark(tracking: &mut AllocationTracking, reg: IrId, state: EscapeState) {
    let root = match tracking.roots.get(&reg) {
        Some(&r) => r,
        None => return,
    };
    if let Some(info) = tracking.allocations.get_mut(&root) {
        info.state = match (info.state, state) {
            (EscapeState::Escaped, _) | (_, EscapeState::Escaped) => EscapeState::Escaped,
            (EscapeState::Unknown, _) | (_, EscapeState::Unknown) => EscapeState::Unknown,
            _ => EscapeState::NotEscaped,
        };
    }
}

/// Rank of each allocation: how many allocations execute before it on every
/// path, counted over strictly dominating blocks plus earlier instructions
/// in its own block.
fn compute_ranks(function: &IrFunction, domtree: &DominatorTree, tracking: &mut AllocationTracking) {
    let allocs_per_block: FxHashMap<IrBlockId, usize> = function
        .cfg
        .blocks
        .iter()
        .map(|(&id, block)| {
            let n = block
                .instructions
                .iter()
                .filter(|i| matches!(i, IrInstruction::Alloc { .. }))
                .count();
            (id, n)
        })
        .collect();

    for info in tracking.allocations.values_mut() {
        let mut rank = 0;

        let mut current = info.block;
        while let Some(dom) = domtree.idom(current) {
            rank += allocs_per_block.get(&dom).copied().unwrap_or(0);
            current = dom;
        }

        if let Some(block) = function.cfg.get_block(info.block) {
            rank += block.instructions[..info.index]
                .iter()
                .filter(|i| matches!(i, IrInstruction::Alloc { .. }))
                .count();
        }

        info.rank = rank;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IrBuilder;
    use crate::ir::IrType;

    fn obj() -> IrType {
        IrType::Ref(Box::new(IrType::I64))
    }

    #[test]
    fn test_local_allocation_does_not_escape() {
        let mut b = IrBuilder::new("local");
        let a = b.build_alloc(IrType::I64);
        let zero = b.build_i32(0);
        let slot = b.build_gep(a, zero, IrType::I64);
        let v = b.build_i64(42);
        b.build_store(slot, v);
        b.build_return(None);

        let f = b.finish();
        let domtree = DominatorTree::compute(&f);
        let tracking = analyze_allocations(&f, &domtree);

        assert_eq!(tracking.state_of(a), EscapeState::NotEscaped);
        assert_eq!(tracking.root_of(slot), Some(a));
    }

    #[test]
    fn test_store_as_value_escapes() {
        let mut b = IrBuilder::new("published");
        let field = b.add_parameter("field", IrType::Ptr(Box::new(obj())));
        let a = b.build_alloc(IrType::I64);
        b.build_store(field, a);
        b.build_return(None);

        let f = b.finish();
        let domtree = DominatorTree::compute(&f);
        let tracking = analyze_allocations(&f, &domtree);

        assert_eq!(tracking.state_of(a), EscapeState::Escaped);
    }

    #[test]
    fn test_call_argument_escapes() {
        let mut b = IrBuilder::new("called");
        let a = b.build_alloc(IrType::I64);
        b.build_call("consume", vec![a], IrType::Void);
        b.build_return(None);

        let f = b.finish();
        let domtree = DominatorTree::compute(&f);
        let tracking = analyze_allocations(&f, &domtree);

        assert_eq!(tracking.state_of(a), EscapeState::Escaped);
    }

    #[test]
    fn test_return_escapes_through_cast() {
        let mut b = IrBuilder::new("returned");
        let a = b.build_alloc(IrType::I64);
        let c = b.build_cast(a, obj(), obj());
        b.build_return(Some(c));

        let f = b.finish();
        let domtree = DominatorTree::compute(&f);
        let tracking = analyze_allocations(&f, &domtree);

        assert_eq!(tracking.root_of(c), Some(a));
        assert_eq!(tracking.state_of(a), EscapeState::Escaped);
    }

    #[test]
    fn test_phi_merge_escapes() {
        let mut b = IrBuilder::new("merged");
        let cond = b.build_bool(true);
        let then_bb = b.create_block();
        let else_bb = b.create_block();
        let join = b.create_block();
        b.build_cond_branch(cond, then_bb, else_bb);

        b.switch_to_block(then_bb);
        let a1 = b.build_alloc(IrType::I64);
        b.build_branch(join);

        b.switch_to_block(else_bb);
        let a2 = b.build_alloc(IrType::I64);
        b.build_branch(join);

        b.switch_to_block(join);
        let merged = b.build_phi(join, obj());
        b.add_phi_incoming(join, merged, then_bb, a1);
        b.add_phi_incoming(join, merged, else_bb, a2);
        b.build_return(None);

        let f = b.finish();
        let domtree = DominatorTree::compute(&f);
        let tracking = analyze_allocations(&f, &domtree);

        assert_eq!(tracking.state_of(a1), EscapeState::Escaped);
        assert_eq!(tracking.state_of(a2), EscapeState::Escaped);
    }

    #[test]
    fn test_unmodeled_use_is_unknown() {
        let mut b = IrBuilder::new("weird");
        let a = b.build_alloc(IrType::I64);
        let one = b.build_i64(1);
        let _sum = b.build_binop(crate::ir::BinaryOp::Add, a, one);
        b.build_return(None);

        let f = b.finish();
        let domtree = DominatorTree::compute(&f);
        let tracking = analyze_allocations(&f, &domtree);

        assert_eq!(tracking.state_of(a), EscapeState::Unknown);
        assert!(tracking.state_of(a).is_escaped());
    }

    #[test]
    fn test_allocation_ranks_across_dominators() {
        let mut b = IrBuilder::new("ranks");
        let a0 = b.build_alloc(IrType::I64);
        let a1 = b.build_alloc(IrType::I64);
        let next = b.create_block();
        b.build_branch(next);

        b.switch_to_block(next);
        let a2 = b.build_alloc(IrType::I64);
        b.build_return(None);

        let f = b.finish();
        let domtree = DominatorTree::compute(&f);
        let tracking = analyze_allocations(&f, &domtree);

        assert_eq!(tracking.allocations[&a0].rank, 0);
        assert_eq!(tracking.allocations[&a1].rank, 1);
        assert_eq!(tracking.allocations[&a2].rank, 2);
    }
}
