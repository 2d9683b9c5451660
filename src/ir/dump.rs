//! IR Dump Utility
//!
//! Pretty-prints a function in a human-readable format similar to LLVM IR /
//! Cranelift CLIF. Useful for debugging the rewrite passes. Also renders the
//! rewrite report as JSON for tooling.

use super::optimization::RewriteReport;
use super::{
    BarrierKind, BinaryOp, CompareOp, IrBasicBlock, IrControlFlowGraph, IrFunction, IrInstruction,
    IrPhiNode, IrTerminator, UnaryOp,
};
use std::fmt::Write;

/// Dump a single function to a string.
pub fn dump_function(func: &IrFunction) -> String {
    let mut out = String::new();

    let params: Vec<String> = func
        .parameters
        .iter()
        .map(|p| format!("{}: {}", p.reg, p.ty))
        .collect();

    writeln!(out, "fn @{}({}) {{", func.name, params.join(", ")).unwrap();
    write!(out, "{}", dump_cfg(&func.cfg)).unwrap();
    writeln!(out, "}}").unwrap();
    out
}

/// Dump a CFG to a string.
pub fn dump_cfg(cfg: &IrControlFlowGraph) -> String {
    let mut out = String::new();

    // Sort blocks by ID for consistent output
    let mut block_ids: Vec<_> = cfg.blocks.keys().collect();
    block_ids.sort();

    for &block_id in &block_ids {
        write!(out, "{}", dump_block(&cfg.blocks[block_id])).unwrap();
    }

    out
}

/// Dump a basic block to a string.
pub fn dump_block(block: &IrBasicBlock) -> String {
    let mut out = String::new();

    let label = block
        .label
        .as_ref()
        .map(|l| format!(" ; {}", l))
        .unwrap_or_default();
    writeln!(out, "  {}:{}", block.id, label).unwrap();

    if !block.predecessors.is_empty() {
        let preds: Vec<String> = block.predecessors.iter().map(|p| p.to_string()).collect();
        writeln!(out, "    ; preds: {}", preds.join(", ")).unwrap();
    }

    for phi in &block.phi_nodes {
        writeln!(out, "    {}", dump_phi(phi)).unwrap();
    }

    for inst in &block.instructions {
        writeln!(out, "    {}", dump_instruction(inst)).unwrap();
    }

    writeln!(out, "    {}", dump_terminator(&block.terminator)).unwrap();
    writeln!(out).unwrap();

    out
}

/// Dump a phi node to a string.
pub fn dump_phi(phi: &IrPhiNode) -> String {
    let incoming: Vec<String> = phi
        .incoming
        .iter()
        .map(|(block, val)| format!("[{}: {}]", block, val))
        .collect();

    format!("{} = phi {} {}", phi.dest, phi.ty, incoming.join(", "))
}

/// Dump an instruction to a string.
pub fn dump_instruction(inst: &IrInstruction) -> String {
    match inst {
        IrInstruction::Const { dest, value } => format!("{} = const {}", dest, value),
        IrInstruction::Copy { dest, src } => format!("{} = copy {}", dest, src),
        IrInstruction::Load { dest, ptr, ty } => format!("{} = load {} {}", dest, ty, ptr),
        IrInstruction::Store {
            ptr,
            value,
            barrier,
        } => {
            let barrier = match barrier {
                None => " ; barrier: undecided".to_string(),
                Some(BarrierKind::NoBarrier) => String::new(),
                Some(BarrierKind::CardMark) => " ; card-mark".to_string(),
                Some(BarrierKind::PreAndPost) => " ; pre+post".to_string(),
            };
            format!("store {} -> {}{}", value, ptr, barrier)
        }
        IrInstruction::BinOp {
            dest,
            op,
            left,
            right,
        } => format!("{} = {} {}, {}", dest, dump_binop(*op), left, right),
        IrInstruction::UnOp { dest, op, operand } => {
            format!("{} = {} {}", dest, dump_unop(*op), operand)
        }
        IrInstruction::Cmp {
            dest,
            op,
            left,
            right,
        } => format!("{} = cmp.{} {}, {}", dest, dump_cmpop(*op), left, right),
        IrInstruction::Call { dest, callee, args } => {
            let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            match dest {
                Some(dest) => format!("{} = call @{}({})", dest, callee, args.join(", ")),
                None => format!("call @{}({})", callee, args.join(", ")),
            }
        }
        IrInstruction::Alloc { dest, ty } => format!("{} = alloc {}", dest, ty),
        IrInstruction::GetElementPtr {
            dest,
            ptr,
            index,
            ty,
        } => format!("{} = gep {} {}[{}]", dest, ty, ptr, index),
        IrInstruction::Cast {
            dest,
            src,
            from_ty,
            to_ty,
        } => format!("{} = cast {} {} to {}", dest, from_ty, src, to_ty),
        IrInstruction::BoundsCheck {
            index,
            length,
            guard,
        } => format!("bounds_check {} < {} ; {}", index, length, guard),
        IrInstruction::Guard { condition, guard } => {
            format!("guard {} ; {}", condition, guard)
        }
    }
}

/// Dump a terminator to a string.
pub fn dump_terminator(term: &IrTerminator) -> String {
    match term {
        IrTerminator::Branch { target } => format!("br {}", target),
        IrTerminator::CondBranch {
            condition,
            true_target,
            false_target,
        } => format!("br_if {}, {}, {}", condition, true_target, false_target),
        IrTerminator::Return { value: Some(v) } => format!("ret {}", v),
        IrTerminator::Return { value: None } => "ret".to_string(),
        IrTerminator::Unreachable => "unreachable".to_string(),
    }
}

fn dump_binop(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::Div => "div",
        BinaryOp::And => "and",
        BinaryOp::Or => "or",
        BinaryOp::Shl => "shl",
    }
}

fn dump_unop(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Neg => "neg",
        UnaryOp::Not => "not",
    }
}

fn dump_cmpop(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "eq",
        CompareOp::Ne => "ne",
        CompareOp::Lt => "lt",
        CompareOp::Le => "le",
        CompareOp::Gt => "gt",
        CompareOp::Ge => "ge",
    }
}

/// Render a rewrite report as pretty JSON.
pub fn dump_report(report: &RewriteReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}
