//! IR Instructions
//!
//! Defines the instruction set for the intermediate representation.
//! Instructions are created during CFG construction, may be deleted or
//! replaced by a dominating equivalent during rewrites, and are never mutated
//! in place except for operand rewiring and barrier-decision commits.

use super::{GuardId, IrId, IrType, IrValue};
use serde::{Deserialize, Serialize};

/// IR instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IrInstruction {
    // === Value Operations ===
    /// Load constant value
    Const { dest: IrId, value: IrValue },

    /// Copy value from one register to another
    Copy { dest: IrId, src: IrId },

    /// Load value from memory
    Load { dest: IrId, ptr: IrId, ty: IrType },

    /// Store value to memory.
    ///
    /// `barrier` is the write-barrier decision attached to this store. It is
    /// `None` until the barrier pass commits a decision; after that it is
    /// never mutated again.
    Store {
        ptr: IrId,
        value: IrId,
        barrier: Option<BarrierKind>,
    },

    // === Arithmetic Operations ===
    /// Binary arithmetic operation
    BinOp {
        dest: IrId,
        op: BinaryOp,
        left: IrId,
        right: IrId,
    },

    /// Unary operation
    UnOp {
        dest: IrId,
        op: UnaryOp,
        operand: IrId,
    },

    /// Compare operation
    Cmp {
        dest: IrId,
        op: CompareOp,
        left: IrId,
        right: IrId,
    },

    // === Calls and Memory ===
    /// Call to an external function. The optimizer treats every call as an
    /// escape and publication point for all reference arguments.
    Call {
        dest: Option<IrId>,
        callee: String,
        args: Vec<IrId>,
    },

    /// Allocate a fresh managed object; `dest` is the only reference to it.
    Alloc { dest: IrId, ty: IrType },

    /// Get element pointer: address of `ptr[index]`
    GetElementPtr {
        dest: IrId,
        ptr: IrId,
        index: IrId,
        ty: IrType,
    },

    /// Type cast
    Cast {
        dest: IrId,
        src: IrId,
        from_ty: IrType,
        to_ty: IrType,
    },

    // === Deoptimization points ===
    /// Array bounds check: deoptimizes unless `0 <= index < length`.
    ///
    /// Fixed in schedule (it must precede the access it protects). `guard`
    /// identifies the deopt site for speculation bookkeeping.
    BoundsCheck {
        index: IrId,
        length: IrId,
        guard: GuardId,
    },

    /// Loop-invariant guard: deoptimizes unless `condition` is true.
    ///
    /// Hoisted by predication into a loop preheader where it subsumes the
    /// per-iteration bounds checks it replaced.
    Guard { condition: IrId, guard: GuardId },
}

/// Binary operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Shl,
}

/// Unary operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Comparison operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// The comparison with swapped operands (`a op b` == `b op.swapped() a`).
    pub fn swapped(self) -> Self {
        match self {
            CompareOp::Eq => CompareOp::Eq,
            CompareOp::Ne => CompareOp::Ne,
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
        }
    }

    /// The logical negation of this comparison.
    pub fn negated(self) -> Self {
        match self {
            CompareOp::Eq => CompareOp::Ne,
            CompareOp::Ne => CompareOp::Eq,
            CompareOp::Lt => CompareOp::Ge,
            CompareOp::Le => CompareOp::Gt,
            CompareOp::Gt => CompareOp::Le,
            CompareOp::Ge => CompareOp::Lt,
        }
    }
}

/// Write-barrier code shape for a reference store.
///
/// Presence/absence is decided by escape analysis; the kind for present
/// barriers is a pure function of the collector policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarrierKind {
    /// No barrier: sound only for the most recently allocated,
    /// not-yet-published object.
    NoBarrier,
    /// Post-write card mark (serial/generational collector).
    CardMark,
    /// SATB pre-write plus post-write barrier (concurrent collector).
    PreAndPost,
}

impl IrInstruction {
    /// Get the destination register if this instruction produces a value
    pub fn dest(&self) -> Option<IrId> {
        match self {
            IrInstruction::Const { dest, .. }
            | IrInstruction::Copy { dest, .. }
            | IrInstruction::Load { dest, .. }
            | IrInstruction::BinOp { dest, .. }
            | IrInstruction::UnOp { dest, .. }
            | IrInstruction::Cmp { dest, .. }
            | IrInstruction::Alloc { dest, .. }
            | IrInstruction::GetElementPtr { dest, .. }
            | IrInstruction::Cast { dest, .. } => Some(*dest),

            IrInstruction::Call { dest, .. } => *dest,

            IrInstruction::Store { .. }
            | IrInstruction::BoundsCheck { .. }
            | IrInstruction::Guard { .. } => None,
        }
    }

    /// Get all registers used by this instruction
    pub fn uses(&self) -> Vec<IrId> {
        match self {
            IrInstruction::Const { .. } => vec![],
            IrInstruction::Copy { src, .. } => vec![*src],
            IrInstruction::Load { ptr, .. } => vec![*ptr],
            IrInstruction::Store { ptr, value, .. } => vec![*ptr, *value],
            IrInstruction::BinOp { left, right, .. } => vec![*left, *right],
            IrInstruction::UnOp { operand, .. } => vec![*operand],
            IrInstruction::Cmp { left, right, .. } => vec![*left, *right],
            IrInstruction::Call { args, .. } => args.clone(),
            IrInstruction::Alloc { .. } => vec![],
            IrInstruction::GetElementPtr { ptr, index, .. } => vec![*ptr, *index],
            IrInstruction::Cast { src, .. } => vec![*src],
            IrInstruction::BoundsCheck { index, length, .. } => vec![*index, *length],
            IrInstruction::Guard { condition, .. } => vec![*condition],
        }
    }

    /// Check if this instruction has side effects and must stay in place
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            IrInstruction::Store { .. }
                | IrInstruction::Call { .. }
                | IrInstruction::Alloc { .. }
                | IrInstruction::BoundsCheck { .. }
                | IrInstruction::Guard { .. }
        )
    }

    /// Check if this instruction is a deoptimization point
    pub fn is_deopt_point(&self) -> bool {
        matches!(
            self,
            IrInstruction::BoundsCheck { .. } | IrInstruction::Guard { .. }
        )
    }
}
