//! Structural CFG Verification
//!
//! Checks the invariants every pass relies on: the entry block exists, every
//! block is terminated, every successor edge targets an existing block, and
//! phi inputs only name actual predecessors. Structural problems are fatal
//! for the function being transformed and are reported as [`StructuralError`];
//! they are never silently ignored.

use super::{IrBlockId, IrFunction};
use std::error::Error;
use std::fmt;

/// Fatal structural problems in a function's CFG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    /// The entry block id does not exist in the block arena
    MissingEntry,

    /// A block has no terminator
    UnterminatedBlock(IrBlockId),

    /// A terminator targets a block that does not exist
    UnknownSuccessor { from: IrBlockId, to: IrBlockId },

    /// A successor edge is missing from the target's predecessor list
    MissingPredecessor { from: IrBlockId, to: IrBlockId },

    /// A phi node names an incoming block that is not a predecessor
    PhiFromNonPredecessor { block: IrBlockId, pred: IrBlockId },

    /// A predecessor contributes no incoming value to a phi node
    PhiIncomingMissing { block: IrBlockId, pred: IrBlockId },

    /// A retreating edge whose target does not dominate its source:
    /// irreducible control flow. Loop passes must treat the region
    /// conservatively, so the transform aborts for this function.
    IrreducibleControlFlow { from: IrBlockId, to: IrBlockId },
}

impl fmt::Display for StructuralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuralError::MissingEntry => write!(f, "entry block not found"),
            StructuralError::UnterminatedBlock(b) => {
                write!(f, "block {} is not properly terminated", b)
            }
            StructuralError::UnknownSuccessor { from, to } => {
                write!(f, "block {} references non-existent successor {}", from, to)
            }
            StructuralError::MissingPredecessor { from, to } => {
                write!(
                    f,
                    "edge {} -> {} is missing from the predecessor list of {}",
                    from, to, to
                )
            }
            StructuralError::PhiFromNonPredecessor { block, pred } => {
                write!(
                    f,
                    "phi node in block {} references non-predecessor block {}",
                    block, pred
                )
            }
            StructuralError::PhiIncomingMissing { block, pred } => {
                write!(
                    f,
                    "phi node in block {} has no incoming value for predecessor {}",
                    block, pred
                )
            }
            StructuralError::IrreducibleControlFlow { from, to } => {
                write!(
                    f,
                    "irreducible control flow: retreating edge {} -> {} has no dominating header",
                    from, to
                )
            }
        }
    }
}

impl Error for StructuralError {}

/// Verify CFG integrity for a function.
pub fn verify_function(function: &IrFunction) -> Result<(), StructuralError> {
    let cfg = &function.cfg;

    if !cfg.blocks.contains_key(&cfg.entry_block) {
        return Err(StructuralError::MissingEntry);
    }

    for (&id, block) in &cfg.blocks {
        if !block.is_terminated() {
            return Err(StructuralError::UnterminatedBlock(id));
        }

        for succ in block.successors() {
            let succ_block = cfg
                .blocks
                .get(&succ)
                .ok_or(StructuralError::UnknownSuccessor { from: id, to: succ })?;
            if !succ_block.predecessors.contains(&id) {
                return Err(StructuralError::MissingPredecessor { from: id, to: succ });
            }
        }

        for phi in &block.phi_nodes {
            for (pred, _) in &phi.incoming {
                if !block.predecessors.contains(pred) {
                    return Err(StructuralError::PhiFromNonPredecessor {
                        block: id,
                        pred: *pred,
                    });
                }
            }
            for &pred in &block.predecessors {
                if phi.incoming_from(pred).is_none() {
                    return Err(StructuralError::PhiIncomingMissing { block: id, pred });
                }
            }
        }
    }

    Ok(())
}
