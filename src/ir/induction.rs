//! Induction-Variable Analysis
//!
//! Classifies each loop-carried value merged in a loop header as a linear
//! induction variable or as opaque. A value is linear when the back-edge
//! incoming value is a single `phi + c` / `phi - c` update with a
//! compile-time constant step; anything else (non-constant step, multi-step
//! recurrences, unsupported exit comparisons) is opaque. Opaque is not an
//! error, only a missed optimization.
//!
//! Descriptors are derived facts: they are invalidated by any CFG mutation
//! and must be recomputed, never persisted.

use super::loop_analysis::NaturalLoop;
use super::{BinaryOp, CompareOp, IrBlockId, IrFunction, IrId, IrInstruction, IrTerminator};
use fxhash::FxHashMap;

/// A loop-invariant bound of an induction variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// Known at compile time
    Constant(i64),
    /// A register defined outside the loop (e.g. a parameter)
    Symbolic(IrId),
}

impl Bound {
    pub fn as_constant(&self) -> Option<i64> {
        match self {
            Bound::Constant(v) => Some(*v),
            Bound::Symbolic(_) => None,
        }
    }
}

/// Direction of a linear induction variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Increasing,
    Decreasing,
}

/// A linear induction variable: `i` starts at `start`, steps by `stride`
/// every iteration, and the loop continues while `cmp(i, stop)` holds.
#[derive(Debug, Clone)]
pub struct InductionVariable {
    /// The header phi carrying the value
    pub phi: IrId,

    /// Value on loop entry
    pub start: Bound,

    /// Constant per-iteration step (never zero)
    pub stride: i64,

    /// Loop-continuation bound
    pub stop: Bound,

    /// Continuation comparison, normalized to `cmp(phi, stop)`
    pub cmp: CompareOp,

    /// Direction implied by the stride sign
    pub direction: Direction,
}

/// Range of the induction variable values observed by loop-body iterations,
/// computed in closed form from constant bounds.
#[derive(Debug, Clone, Copy)]
pub struct IterDomain {
    /// Value on the first iteration
    pub first: i64,

    /// Value on the last iteration
    pub last: i64,

    /// Number of iterations (always > 0)
    pub trip_count: i64,
}

impl IterDomain {
    pub fn min_value(&self) -> i64 {
        self.first.min(self.last)
    }

    pub fn max_value(&self) -> i64 {
        self.first.max(self.last)
    }
}

impl InductionVariable {
    /// Closed-form iteration domain for constant bounds.
    ///
    /// Returns `None` when the bounds are symbolic, the loop body never runs,
    /// the comparison shape cannot be counted exactly (`!=` with a stride
    /// that does not evenly divide the distance), or the value that finally
    /// fails the exit test would leave the signed 32-bit range — in that
    /// last case the loop wraps around instead of exiting, so no closed form
    /// is sound and predication must be refused.
    pub fn iter_domain(&self) -> Option<IterDomain> {
        let start = self.start.as_constant()?;
        let stop = self.stop.as_constant()?;
        let stride = self.stride;

        // The 32-bit domain is the analysis boundary; wider constants are
        // treated as opaque.
        if !fits_i32(start) || !fits_i32(stop) {
            return None;
        }

        let distance = stop as i128 - start as i128;
        let trip_count: i128 = match (self.cmp, stride > 0) {
            (CompareOp::Lt, true) => {
                if distance <= 0 {
                    return None;
                }
                div_ceil(distance, stride as i128)
            }
            (CompareOp::Le, true) => {
                if distance < 0 {
                    return None;
                }
                distance / stride as i128 + 1
            }
            (CompareOp::Gt, false) => {
                if distance >= 0 {
                    return None;
                }
                div_ceil(-distance, -(stride as i128))
            }
            (CompareOp::Ge, false) => {
                if distance > 0 {
                    return None;
                }
                (-distance) / -(stride as i128) + 1
            }
            (CompareOp::Ne, up) => {
                // Equality exits need an exact trip count: the stride must
                // evenly divide the distance in the travel direction.
                let step = stride as i128;
                if distance == 0 || (distance > 0) != up || distance % step != 0 {
                    return None;
                }
                distance / step
            }
            _ => return None,
        };

        if trip_count <= 0 {
            return None;
        }

        let first = start as i128;
        let last = first + (trip_count - 1) * stride as i128;
        // Value that finally fails the exit test; it must be representable
        // or the loop wraps instead of exiting.
        let exit_value = first + trip_count * stride as i128;
        if !fits_i32_i128(last) || !fits_i32_i128(exit_value) {
            return None;
        }

        Some(IterDomain {
            first: first as i64,
            last: last as i64,
            trip_count: trip_count as i64,
        })
    }
}

fn fits_i32(v: i64) -> bool {
    v >= i32::MIN as i64 && v <= i32::MAX as i64
}

fn fits_i32_i128(v: i128) -> bool {
    v >= i32::MIN as i128 && v <= i32::MAX as i128
}

fn div_ceil(a: i128, b: i128) -> i128 {
    // a > 0, b > 0 in every call site
    (a + b - 1) / b
}

/// Map from register to the integer constant it is defined to, across the
/// whole function. `Const` definitions are loop-invariant wherever they sit.
pub fn constant_defs(function: &IrFunction) -> FxHashMap<IrId, i64> {
    let mut consts = FxHashMap::default();
    for block in function.cfg.blocks.values() {
        for inst in &block.instructions {
            if let IrInstruction::Const { dest, value } = inst {
                if let Some(v) = value.as_int() {
                    consts.insert(*dest, v);
                }
            }
        }
    }
    consts
}

/// Map from register to its defining (block, instruction index).
pub fn definition_sites(function: &IrFunction) -> FxHashMap<IrId, (IrBlockId, usize)> {
    let mut map = FxHashMap::default();
    for (&block_id, block) in &function.cfg.blocks {
        for (idx, inst) in block.instructions.iter().enumerate() {
            if let Some(dest) = inst.dest() {
                map.insert(dest, (block_id, idx));
            }
        }
    }
    map
}

/// Whether a register's value is invariant across the given loop: a
/// constant, a parameter, a phi outside the loop, or any definition in a
/// block outside the loop body.
pub fn is_loop_invariant(
    function: &IrFunction,
    natural_loop: &NaturalLoop,
    consts: &FxHashMap<IrId, i64>,
    reg: IrId,
) -> bool {
    if consts.contains_key(&reg) || function.is_parameter(reg) {
        return true;
    }
    for (&block_id, block) in &function.cfg.blocks {
        let in_loop = natural_loop.blocks.contains(&block_id);
        for phi in &block.phi_nodes {
            if phi.dest == reg {
                return !in_loop;
            }
        }
        for inst in &block.instructions {
            if inst.dest() == Some(reg) {
                return !in_loop;
            }
        }
    }
    // No definition found at all: treat as an external input.
    true
}

/// Analyze the header phis of a natural loop and return every value that
/// classifies as a linear induction variable.
pub fn analyze_induction_variables(
    function: &IrFunction,
    natural_loop: &NaturalLoop,
) -> Vec<InductionVariable> {
    let header = match function.cfg.get_block(natural_loop.header) {
        Some(b) => b,
        None => return Vec::new(),
    };

    let consts = constant_defs(function);
    let defs = definition_sites(function);

    // The header's exit test gives stop and comparison kind for every phi.
    let exit_test = header_exit_test(function, natural_loop);

    let mut ivs = Vec::new();

    for phi in &header.phi_nodes {
        // Exactly one incoming from outside and one from a back edge.
        let mut entry_value: Option<IrId> = None;
        let mut latch_value: Option<IrId> = None;
        let mut simple_shape = true;
        for (pred, value) in &phi.incoming {
            if natural_loop.blocks.contains(pred) {
                if latch_value.replace(*value).is_some() {
                    simple_shape = false;
                }
            } else if entry_value.replace(*value).is_some() {
                simple_shape = false;
            }
        }
        let (entry_value, latch_value) = match (simple_shape, entry_value, latch_value) {
            (true, Some(e), Some(l)) => (e, l),
            _ => continue,
        };

        // The back-edge value must be a single-step linear update of the phi.
        let stride = match linear_step(function, &defs, &consts, natural_loop, phi.dest, latch_value)
        {
            Some(s) if s != 0 => s,
            _ => {
                log::trace!(
                    "{}: phi {} in {} is opaque (no single constant step)",
                    function.name,
                    phi.dest,
                    natural_loop.header
                );
                continue;
            }
        };

        // The exit test must compare this phi against a loop-invariant stop.
        let (cmp, stop) = match &exit_test {
            Some(test) if test.tested == phi.dest => (test.cmp, test.bound),
            _ => continue,
        };
        if !is_loop_invariant(function, natural_loop, &consts, stop) {
            continue;
        }

        let stop = match consts.get(&stop) {
            Some(&v) => Bound::Constant(v),
            None => Bound::Symbolic(stop),
        };
        let start = match consts.get(&entry_value) {
            Some(&v) => Bound::Constant(v),
            None => Bound::Symbolic(entry_value),
        };

        // Supported continuation comparisons only; `==` makes no sense as a
        // continuation condition.
        if cmp == CompareOp::Eq {
            continue;
        }

        let direction = if stride > 0 {
            Direction::Increasing
        } else {
            Direction::Decreasing
        };

        let iv = InductionVariable {
            phi: phi.dest,
            start,
            stride,
            stop,
            cmp,
            direction,
        };

        // Equality exits are usable only with an exact constant trip count.
        if cmp == CompareOp::Ne && iv.iter_domain().is_none() {
            log::trace!(
                "{}: phi {} exits by != but trip count is inexact, opaque",
                function.name,
                phi.dest
            );
            continue;
        }

        ivs.push(iv);
    }

    ivs
}

/// The loop-continuation test found in the header: `cmp(tested, bound)`
/// holding means another iteration runs.
struct ExitTest {
    tested: IrId,
    cmp: CompareOp,
    bound: IrId,
}

fn header_exit_test(function: &IrFunction, natural_loop: &NaturalLoop) -> Option<ExitTest> {
    let header = function.cfg.get_block(natural_loop.header)?;

    let (condition, true_target, false_target) = match &header.terminator {
        IrTerminator::CondBranch {
            condition,
            true_target,
            false_target,
        } => (*condition, *true_target, *false_target),
        _ => return None,
    };

    // One target continues the loop, the other leaves it.
    let true_in = natural_loop.blocks.contains(&true_target);
    let false_in = natural_loop.blocks.contains(&false_target);
    let continue_on_true = match (true_in, false_in) {
        (true, false) => true,
        (false, true) => false,
        _ => return None,
    };

    // The condition must be a compare defined in the header itself.
    let (op, left, right) = header.instructions.iter().find_map(|inst| match inst {
        IrInstruction::Cmp {
            dest,
            op,
            left,
            right,
        } if *dest == condition => Some((*op, *left, *right)),
        _ => None,
    })?;

    // Normalize so the phi (whichever operand it is) sits on the left, and
    // so the comparison expresses the continue condition.
    let header_phis: Vec<IrId> = header.phi_nodes.iter().map(|p| p.dest).collect();
    let (tested, mut cmp, bound) = if header_phis.contains(&left) {
        (left, op, right)
    } else if header_phis.contains(&right) {
        (right, op.swapped(), left)
    } else {
        return None;
    };

    if !continue_on_true {
        cmp = cmp.negated();
    }

    Some(ExitTest { tested, cmp, bound })
}

/// If `latch_value` is a single `phi + c` or `phi - c` update computed inside
/// the loop, return the signed step. Chained updates (the value flowing back
/// is an update of an update) and non-constant steps return `None`.
fn linear_step(
    function: &IrFunction,
    defs: &FxHashMap<IrId, (IrBlockId, usize)>,
    consts: &FxHashMap<IrId, i64>,
    natural_loop: &NaturalLoop,
    phi: IrId,
    latch_value: IrId,
) -> Option<i64> {
    let &(block_id, idx) = defs.get(&latch_value)?;
    if !natural_loop.blocks.contains(&block_id) {
        return None;
    }

    let inst = &function.cfg.get_block(block_id)?.instructions[idx];
    match inst {
        IrInstruction::BinOp {
            op: BinaryOp::Add,
            left,
            right,
            ..
        } => {
            // The operand that is not the phi must be a constant; the other
            // must be the phi itself, not a derived value.
            if *left == phi {
                consts.get(right).copied()
            } else if *right == phi {
                consts.get(left).copied()
            } else {
                None
            }
        }
        IrInstruction::BinOp {
            op: BinaryOp::Sub,
            left,
            right,
            ..
        } => {
            if *left == phi {
                consts.get(right).copied().map(|c| -c)
            } else {
                // `c - phi` alternates sign each iteration: not linear.
                None
            }
        }
        _ => None,
    }
}
