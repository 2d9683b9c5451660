//! Loop Analysis
//!
//! Loop analysis infrastructure for the optimization passes:
//! - Dominator tree computation (iterative dataflow algorithm)
//! - Natural loop detection via back-edge identification
//! - Irreducible control flow detection (retreating edges without a
//!   dominating header)
//! - Loop nesting info and preheader identification
//!
//! Analysis results are derived facts: they are computed fresh per pass run
//! and must be recomputed after any CFG mutation.

use super::validation::StructuralError;
use super::{IrBlockId, IrControlFlowGraph, IrFunction};
use fxhash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

/// Dominator tree for a function's control flow graph.
///
/// A block D dominates block B if every path from the entry to B goes
/// through D. The immediate dominator (idom) of B is the closest strict
/// dominator.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    /// Immediate dominator for each block (entry block has no idom)
    idom: FxHashMap<IrBlockId, IrBlockId>,

    /// Children in the dominator tree
    children: FxHashMap<IrBlockId, Vec<IrBlockId>>,

    /// Dominator tree depth for each block (entry = 0)
    depth: FxHashMap<IrBlockId, usize>,

    /// Entry block of the function
    entry: IrBlockId,
}

impl DominatorTree {
    /// Compute the dominator tree using Cooper, Harvey, and Kennedy's simple
    /// iterative algorithm, which is efficient for typical CFGs.
    pub fn compute(function: &IrFunction) -> Self {
        let cfg = &function.cfg;
        let entry = cfg.entry_block;

        // Blocks in reverse postorder for efficient iteration
        let rpo = reverse_postorder(cfg, entry);
        let rpo_index: FxHashMap<IrBlockId, usize> =
            rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        let mut idom: FxHashMap<IrBlockId, Option<IrBlockId>> = FxHashMap::default();
        for &block in &rpo {
            idom.insert(block, None);
        }
        idom.insert(entry, Some(entry));

        // Iterative dataflow until fixed point
        let mut changed = true;
        while changed {
            changed = false;

            for &block in &rpo {
                if block == entry {
                    continue;
                }

                let predecessors = cfg
                    .get_block(block)
                    .map(|b| b.predecessors.clone())
                    .unwrap_or_default();

                let mut new_idom: Option<IrBlockId> = None;
                for &pred in &predecessors {
                    if idom.get(&pred).copied().flatten().is_none() {
                        continue;
                    }
                    new_idom = match new_idom {
                        None => Some(pred),
                        Some(current) => Some(Self::intersect(current, pred, &idom, &rpo_index)),
                    };
                }

                if new_idom != idom[&block] {
                    idom.insert(block, new_idom);
                    changed = true;
                }
            }
        }

        // Strip entry's self-domination
        let mut final_idom: FxHashMap<IrBlockId, IrBlockId> = FxHashMap::default();
        for (&block, &dom) in &idom {
            if let Some(d) = dom {
                if block != entry {
                    final_idom.insert(block, d);
                }
            }
        }

        let mut children: FxHashMap<IrBlockId, Vec<IrBlockId>> = FxHashMap::default();
        for (&block, &dom) in &final_idom {
            children.entry(dom).or_default().push(block);
        }
        for child_list in children.values_mut() {
            child_list.sort();
        }

        // Depths via BFS from entry
        let mut depth: FxHashMap<IrBlockId, usize> = FxHashMap::default();
        depth.insert(entry, 0);
        let mut queue: VecDeque<IrBlockId> = VecDeque::new();
        queue.push_back(entry);

        while let Some(block) = queue.pop_front() {
            let d = depth[&block];
            if let Some(child_list) = children.get(&block) {
                for &child in child_list {
                    depth.insert(child, d + 1);
                    queue.push_back(child);
                }
            }
        }

        Self {
            idom: final_idom,
            children,
            depth,
            entry,
        }
    }

    /// Find the common dominator of two blocks, walking up by RPO index.
    fn intersect(
        mut b1: IrBlockId,
        mut b2: IrBlockId,
        idom: &FxHashMap<IrBlockId, Option<IrBlockId>>,
        rpo_index: &FxHashMap<IrBlockId, usize>,
    ) -> IrBlockId {
        while b1 != b2 {
            let mut idx1 = rpo_index.get(&b1).copied().unwrap_or(usize::MAX);
            let mut idx2 = rpo_index.get(&b2).copied().unwrap_or(usize::MAX);

            while idx1 > idx2 {
                match idom.get(&b1) {
                    Some(Some(dom)) => {
                        b1 = *dom;
                        idx1 = rpo_index.get(&b1).copied().unwrap_or(usize::MAX);
                    }
                    _ => return b1,
                }
            }

            while idx2 > idx1 {
                match idom.get(&b2) {
                    Some(Some(dom)) => {
                        b2 = *dom;
                        idx2 = rpo_index.get(&b2).copied().unwrap_or(usize::MAX);
                    }
                    _ => return b2,
                }
            }
        }
        b1
    }

    /// Get the immediate dominator of a block.
    pub fn idom(&self, block: IrBlockId) -> Option<IrBlockId> {
        self.idom.get(&block).copied()
    }

    /// Get children of a block in the dominator tree.
    pub fn children(&self, block: IrBlockId) -> &[IrBlockId] {
        self.children
            .get(&block)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Get the depth of a block in the dominator tree.
    pub fn depth(&self, block: IrBlockId) -> usize {
        self.depth.get(&block).copied().unwrap_or(0)
    }

    /// Check if block A dominates block B.
    pub fn dominates(&self, a: IrBlockId, b: IrBlockId) -> bool {
        if a == b {
            return true;
        }

        let mut current = b;
        while let Some(dom) = self.idom.get(&current) {
            if *dom == a {
                return true;
            }
            current = *dom;
        }

        a == self.entry
    }

    /// Check if block A strictly dominates block B.
    pub fn strictly_dominates(&self, a: IrBlockId, b: IrBlockId) -> bool {
        a != b && self.dominates(a, b)
    }
}

/// Compute reverse postorder of blocks reachable from the entry.
fn reverse_postorder(cfg: &IrControlFlowGraph, entry: IrBlockId) -> Vec<IrBlockId> {
    let mut visited = FxHashSet::default();
    let mut postorder = Vec::new();

    fn dfs(
        cfg: &IrControlFlowGraph,
        block: IrBlockId,
        visited: &mut FxHashSet<IrBlockId>,
        postorder: &mut Vec<IrBlockId>,
    ) {
        if !visited.insert(block) {
            return;
        }

        if let Some(b) = cfg.get_block(block) {
            for succ in b.successors() {
                dfs(cfg, succ, visited, postorder);
            }
        }

        postorder.push(block);
    }

    dfs(cfg, entry, &mut visited, &mut postorder);
    postorder.reverse();
    postorder
}

/// A natural loop in the control flow graph.
///
/// A natural loop is defined by back edges (edges from B to H where H
/// dominates B). The loop header is H, and the loop body contains all blocks
/// from which a back-edge source can be reached without going through H.
#[derive(Debug, Clone)]
pub struct NaturalLoop {
    /// Loop header block (the single entry point of the loop)
    pub header: IrBlockId,

    /// Sources of the back edges into the header
    pub back_edge_sources: Vec<IrBlockId>,

    /// All blocks in the loop body (including header)
    pub blocks: FxHashSet<IrBlockId>,

    /// Exit blocks (blocks in the loop with edges outside the loop)
    pub exit_blocks: Vec<IrBlockId>,

    /// Preheader block if one exists (single predecessor of header from
    /// outside the loop whose only successor is the header)
    pub preheader: Option<IrBlockId>,

    /// Nesting depth (0 = outermost)
    pub nesting_depth: usize,

    /// Parent loop header if this is a nested loop
    pub parent: Option<IrBlockId>,

    /// Child loop headers (directly nested loops)
    pub children: Vec<IrBlockId>,
}

impl NaturalLoop {
    /// Whether the given block dominates every back edge of this loop,
    /// i.e. whether instructions in it execute on every completed iteration.
    pub fn dominates_back_edges(&self, domtree: &DominatorTree, block: IrBlockId) -> bool {
        self.back_edge_sources
            .iter()
            .all(|&source| domtree.dominates(block, source))
    }
}

/// Loop nest information for a function.
#[derive(Debug, Clone)]
pub struct LoopNestInfo {
    /// All natural loops indexed by header block
    pub loops: FxHashMap<IrBlockId, NaturalLoop>,

    /// Top-level loops (not nested in any other loop)
    pub top_level_loops: Vec<IrBlockId>,

    /// Map from block to its innermost containing loop header
    pub block_to_loop: FxHashMap<IrBlockId, IrBlockId>,

    /// All back edges, as (source, header) pairs
    back_edges: FxHashSet<(IrBlockId, IrBlockId)>,
}

impl LoopNestInfo {
    /// Analyze loops in a function.
    ///
    /// Fails with [`StructuralError::IrreducibleControlFlow`] if any
    /// retreating edge targets a block that does not dominate its source —
    /// downstream passes must not run over such a region.
    pub fn analyze(
        function: &IrFunction,
        domtree: &DominatorTree,
    ) -> Result<Self, StructuralError> {
        let cfg = &function.cfg;

        // Reject irreducible regions before building any loop.
        check_reducible(cfg, domtree)?;

        // Group back edges by header.
        let mut back_edges: FxHashSet<(IrBlockId, IrBlockId)> = FxHashSet::default();
        let mut sources_by_header: FxHashMap<IrBlockId, Vec<IrBlockId>> = FxHashMap::default();
        for (&block_id, block) in &cfg.blocks {
            for succ in block.successors() {
                if domtree.dominates(succ, block_id) {
                    back_edges.insert((block_id, succ));
                    sources_by_header.entry(succ).or_default().push(block_id);
                }
            }
        }

        let mut loops: FxHashMap<IrBlockId, NaturalLoop> = FxHashMap::default();
        for (header, mut sources) in sources_by_header {
            sources.sort();
            let blocks = find_loop_blocks(cfg, header, &sources);
            let exit_blocks = find_exit_blocks(cfg, &blocks);
            let preheader = find_preheader(cfg, header, &blocks);

            loops.insert(
                header,
                NaturalLoop {
                    header,
                    back_edge_sources: sources,
                    blocks,
                    exit_blocks,
                    preheader,
                    nesting_depth: 0,
                    parent: None,
                    children: Vec::new(),
                },
            );
        }

        // Compute nesting: the parent is the innermost other loop whose body
        // contains this header.
        let loop_headers: Vec<IrBlockId> = loops.keys().copied().collect();
        for &header in &loop_headers {
            let mut parent: Option<IrBlockId> = None;
            for &other in &loop_headers {
                if header == other {
                    continue;
                }
                let other_loop = &loops[&other];
                if !other_loop.blocks.contains(&header) || loops[&header].blocks.contains(&other) {
                    continue;
                }
                parent = match parent {
                    Some(current) if loops[&current].blocks.len() <= other_loop.blocks.len() => {
                        Some(current)
                    }
                    _ => Some(other),
                };
            }
            loops.get_mut(&header).unwrap().parent = parent;
        }

        for &header in &loop_headers {
            if let Some(parent) = loops[&header].parent {
                loops.get_mut(&parent).unwrap().children.push(header);
            }
        }

        let mut top_level_loops: Vec<IrBlockId> = loop_headers
            .iter()
            .filter(|&&h| loops[&h].parent.is_none())
            .copied()
            .collect();
        top_level_loops.sort();

        fn set_depth(
            loops: &mut FxHashMap<IrBlockId, NaturalLoop>,
            header: IrBlockId,
            depth: usize,
        ) {
            loops.get_mut(&header).unwrap().nesting_depth = depth;
            let children: Vec<IrBlockId> = loops[&header].children.clone();
            for child in children {
                set_depth(loops, child, depth + 1);
            }
        }

        for &top_level in &top_level_loops {
            set_depth(&mut loops, top_level, 0);
        }

        // Map each block to its innermost containing loop.
        let mut block_to_loop: FxHashMap<IrBlockId, IrBlockId> = FxHashMap::default();
        for (&header, loop_info) in &loops {
            for &block in &loop_info.blocks {
                match block_to_loop.get(&block) {
                    Some(&existing)
                        if loops[&existing].nesting_depth >= loops[&header].nesting_depth => {}
                    _ => {
                        block_to_loop.insert(block, header);
                    }
                }
            }
        }

        Ok(Self {
            loops,
            top_level_loops,
            block_to_loop,
            back_edges,
        })
    }

    /// Get the innermost loop containing a block, if any.
    pub fn loop_of(&self, block: IrBlockId) -> Option<&NaturalLoop> {
        self.block_to_loop
            .get(&block)
            .and_then(|h| self.loops.get(h))
    }

    /// Check if a block is a loop header.
    pub fn is_loop_header(&self, block: IrBlockId) -> bool {
        self.loops.contains_key(&block)
    }

    /// Check if an edge is a back edge.
    pub fn is_back_edge(&self, from: IrBlockId, to: IrBlockId) -> bool {
        self.back_edges.contains(&(from, to))
    }

    /// Iterate over all loops in reverse nesting order (innermost first).
    pub fn loops_innermost_first(&self) -> Vec<&NaturalLoop> {
        let mut loops: Vec<&NaturalLoop> = self.loops.values().collect();
        loops.sort_by_key(|l| (std::cmp::Reverse(l.nesting_depth), l.header));
        loops
    }
}

/// Reject irreducible control flow: every retreating edge found during a DFS
/// from the entry must target a dominator of its source.
fn check_reducible(cfg: &IrControlFlowGraph, domtree: &DominatorTree) -> Result<(), StructuralError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }

    let mut color: FxHashMap<IrBlockId, Color> = FxHashMap::default();
    // Explicit stack of (block, next successor index) to avoid recursion.
    let mut stack: Vec<(IrBlockId, usize)> = vec![(cfg.entry_block, 0)];
    color.insert(cfg.entry_block, Color::Grey);

    while let Some(&mut (block, ref mut next)) = stack.last_mut() {
        let successors = cfg
            .get_block(block)
            .map(|b| b.successors())
            .unwrap_or_default();

        if *next >= successors.len() {
            color.insert(block, Color::Black);
            stack.pop();
            continue;
        }

        let succ = successors[*next];
        *next += 1;

        match color.get(&succ).copied().unwrap_or(Color::White) {
            Color::White => {
                color.insert(succ, Color::Grey);
                stack.push((succ, 0));
            }
            Color::Grey => {
                // Retreating edge: must be a back edge to a dominator.
                if !domtree.dominates(succ, block) {
                    return Err(StructuralError::IrreducibleControlFlow {
                        from: block,
                        to: succ,
                    });
                }
            }
            Color::Black => {}
        }
    }

    Ok(())
}

/// Find all blocks in a natural loop given its header and back-edge sources.
fn find_loop_blocks(
    cfg: &IrControlFlowGraph,
    header: IrBlockId,
    back_edge_sources: &[IrBlockId],
) -> FxHashSet<IrBlockId> {
    let mut loop_blocks = FxHashSet::default();
    loop_blocks.insert(header);

    let mut worklist: Vec<IrBlockId> = Vec::new();
    for &source in back_edge_sources {
        if loop_blocks.insert(source) {
            worklist.push(source);
        }
    }

    while let Some(block) = worklist.pop() {
        if let Some(b) = cfg.get_block(block) {
            for &pred in &b.predecessors {
                if loop_blocks.insert(pred) {
                    worklist.push(pred);
                }
            }
        }
    }

    loop_blocks
}

/// Find exit blocks (blocks in loop with successors outside loop).
fn find_exit_blocks(cfg: &IrControlFlowGraph, loop_blocks: &FxHashSet<IrBlockId>) -> Vec<IrBlockId> {
    let mut exits = Vec::new();

    for &block in loop_blocks {
        if let Some(b) = cfg.get_block(block) {
            if b.successors().iter().any(|s| !loop_blocks.contains(s)) {
                exits.push(block);
            }
        }
    }

    exits.sort();
    exits
}

/// Find a preheader block if one exists.
fn find_preheader(
    cfg: &IrControlFlowGraph,
    header: IrBlockId,
    loop_blocks: &FxHashSet<IrBlockId>,
) -> Option<IrBlockId> {
    let header_block = cfg.get_block(header)?;

    let outside_preds: Vec<IrBlockId> = header_block
        .predecessors
        .iter()
        .filter(|p| !loop_blocks.contains(p))
        .copied()
        .collect();

    // A preheader is the unique outside predecessor with a single successor.
    if outside_preds.len() == 1 {
        let pred = outside_preds[0];
        if let Some(pred_block) = cfg.get_block(pred) {
            if pred_block.successors().len() == 1 {
                return Some(pred);
            }
        }
    }

    None
}
