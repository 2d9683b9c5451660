//! IR Builder
//!
//! A builder interface for constructing function bodies in a convenient way.
//! The builder maintains a current-block cursor and provides helper methods
//! for common patterns; branch helpers keep predecessor lists up to date.

use super::{
    BarrierKind, BinaryOp, CompareOp, GuardId, IrBlockId, IrFunction, IrId, IrInstruction,
    IrPhiNode, IrTerminator, IrType, IrValue, UnaryOp,
};

/// Builder for a single function body
pub struct IrBuilder {
    /// The function being built
    pub function: IrFunction,

    /// Current basic block being built
    current_block: IrBlockId,
}

impl IrBuilder {
    /// Create a new builder positioned at the function's entry block
    pub fn new(name: impl Into<String>) -> Self {
        let function = IrFunction::new(name);
        let current_block = function.entry_block();
        Self {
            function,
            current_block,
        }
    }

    /// Finish building and return the function
    pub fn finish(self) -> IrFunction {
        self.function
    }

    // === Block Building ===

    /// Create a new basic block
    pub fn create_block(&mut self) -> IrBlockId {
        self.function.cfg.create_block()
    }

    /// Create a new basic block with a label
    pub fn create_block_with_label(&mut self, label: impl Into<String>) -> IrBlockId {
        let block_id = self.create_block();
        if let Some(block) = self.function.cfg.get_block_mut(block_id) {
            block.label = Some(label.into());
        }
        block_id
    }

    /// Switch to building in a different block
    pub fn switch_to_block(&mut self, block: IrBlockId) {
        self.current_block = block;
    }

    /// Get the current block
    pub fn current_block(&self) -> IrBlockId {
        self.current_block
    }

    // === Register Management ===

    /// Allocate a new register
    pub fn alloc_reg(&mut self) -> IrId {
        self.function.alloc_reg()
    }

    /// Declare a function parameter
    pub fn add_parameter(&mut self, name: impl Into<String>, ty: IrType) -> IrId {
        self.function.add_parameter(name, ty)
    }

    /// Set the type of a register
    pub fn set_register_type(&mut self, reg: IrId, ty: IrType) {
        self.function.register_types.insert(reg, ty);
    }

    /// Get the type of a register
    pub fn get_register_type(&self, reg: IrId) -> Option<IrType> {
        self.function.register_types.get(&reg).cloned()
    }

    // === Instruction Building ===

    fn add_instruction(&mut self, inst: IrInstruction) {
        let block_id = self.current_block;
        if let Some(block) = self.function.cfg.get_block_mut(block_id) {
            block.add_instruction(inst);
        }
    }

    /// Build a constant instruction
    pub fn build_const(&mut self, value: IrValue) -> IrId {
        let dest = self.alloc_reg();
        self.set_register_type(dest, value.ty());
        self.add_instruction(IrInstruction::Const { dest, value });
        dest
    }

    /// Build an i32 constant
    pub fn build_i32(&mut self, value: i32) -> IrId {
        self.build_const(IrValue::I32(value))
    }

    /// Build an i64 constant
    pub fn build_i64(&mut self, value: i64) -> IrId {
        self.build_const(IrValue::I64(value))
    }

    /// Build a bool constant
    pub fn build_bool(&mut self, value: bool) -> IrId {
        self.build_const(IrValue::Bool(value))
    }

    /// Build a copy instruction
    pub fn build_copy(&mut self, src: IrId) -> IrId {
        let dest = self.alloc_reg();
        if let Some(ty) = self.get_register_type(src) {
            self.set_register_type(dest, ty);
        }
        self.add_instruction(IrInstruction::Copy { dest, src });
        dest
    }

    /// Build a load instruction
    pub fn build_load(&mut self, ptr: IrId, ty: IrType) -> IrId {
        let dest = self.alloc_reg();
        self.set_register_type(dest, ty.clone());
        self.add_instruction(IrInstruction::Load { dest, ptr, ty });
        dest
    }

    /// Build a store instruction. The barrier decision starts undecided.
    pub fn build_store(&mut self, ptr: IrId, value: IrId) {
        self.add_instruction(IrInstruction::Store {
            ptr,
            value,
            barrier: None,
        });
    }

    /// Build a store instruction with a pre-committed barrier decision
    pub fn build_store_with_barrier(&mut self, ptr: IrId, value: IrId, barrier: BarrierKind) {
        self.add_instruction(IrInstruction::Store {
            ptr,
            value,
            barrier: Some(barrier),
        });
    }

    /// Build a binary operation
    pub fn build_binop(&mut self, op: BinaryOp, left: IrId, right: IrId) -> IrId {
        let dest = self.alloc_reg();
        if let Some(ty) = self
            .get_register_type(left)
            .or_else(|| self.get_register_type(right))
        {
            self.set_register_type(dest, ty);
        }
        self.add_instruction(IrInstruction::BinOp {
            dest,
            op,
            left,
            right,
        });
        dest
    }

    /// Build a unary operation
    pub fn build_unop(&mut self, op: UnaryOp, operand: IrId) -> IrId {
        let dest = self.alloc_reg();
        if let Some(ty) = self.get_register_type(operand) {
            self.set_register_type(dest, ty);
        }
        self.add_instruction(IrInstruction::UnOp { dest, op, operand });
        dest
    }

    /// Build a comparison operation (always produces Bool)
    pub fn build_cmp(&mut self, op: CompareOp, left: IrId, right: IrId) -> IrId {
        let dest = self.alloc_reg();
        self.set_register_type(dest, IrType::Bool);
        self.add_instruction(IrInstruction::Cmp {
            dest,
            op,
            left,
            right,
        });
        dest
    }

    /// Build a call to an external function
    pub fn build_call(
        &mut self,
        callee: impl Into<String>,
        args: Vec<IrId>,
        return_type: IrType,
    ) -> Option<IrId> {
        let dest = if return_type == IrType::Void {
            None
        } else {
            let dest = self.alloc_reg();
            self.set_register_type(dest, return_type);
            Some(dest)
        };
        self.add_instruction(IrInstruction::Call {
            dest,
            callee: callee.into(),
            args,
        });
        dest
    }

    /// Build an allocation of a fresh managed object
    pub fn build_alloc(&mut self, ty: IrType) -> IrId {
        let dest = self.alloc_reg();
        self.set_register_type(dest, IrType::Ref(Box::new(ty.clone())));
        self.add_instruction(IrInstruction::Alloc { dest, ty });
        dest
    }

    /// Build a get-element-pointer instruction
    pub fn build_gep(&mut self, ptr: IrId, index: IrId, ty: IrType) -> IrId {
        let dest = self.alloc_reg();
        self.set_register_type(dest, IrType::Ptr(Box::new(ty.clone())));
        self.add_instruction(IrInstruction::GetElementPtr {
            dest,
            ptr,
            index,
            ty,
        });
        dest
    }

    /// Build a cast instruction
    pub fn build_cast(&mut self, src: IrId, from_ty: IrType, to_ty: IrType) -> IrId {
        let dest = self.alloc_reg();
        self.set_register_type(dest, to_ty.clone());
        self.add_instruction(IrInstruction::Cast {
            dest,
            src,
            from_ty,
            to_ty,
        });
        dest
    }

    /// Build a bounds check deopt point, allocating its guard id
    pub fn build_bounds_check(&mut self, index: IrId, length: IrId) -> GuardId {
        let guard = self.function.alloc_guard();
        self.add_instruction(IrInstruction::BoundsCheck {
            index,
            length,
            guard,
        });
        guard
    }

    /// Build a loop-invariant guard deopt point, allocating its guard id
    pub fn build_guard(&mut self, condition: IrId) -> GuardId {
        let guard = self.function.alloc_guard();
        self.add_instruction(IrInstruction::Guard { condition, guard });
        guard
    }

    // === Terminators ===

    /// Build an unconditional branch
    pub fn build_branch(&mut self, target: IrBlockId) {
        let from = self.current_block;
        if let Some(block) = self.function.cfg.get_block_mut(from) {
            block.set_terminator(IrTerminator::Branch { target });
        }
        self.function.cfg.connect_blocks(from, target);
    }

    /// Build a conditional branch
    pub fn build_cond_branch(
        &mut self,
        condition: IrId,
        true_target: IrBlockId,
        false_target: IrBlockId,
    ) {
        let from = self.current_block;
        if let Some(block) = self.function.cfg.get_block_mut(from) {
            block.set_terminator(IrTerminator::CondBranch {
                condition,
                true_target,
                false_target,
            });
        }
        self.function.cfg.connect_blocks(from, true_target);
        self.function.cfg.connect_blocks(from, false_target);
    }

    /// Build a return terminator
    pub fn build_return(&mut self, value: Option<IrId>) {
        let from = self.current_block;
        if let Some(block) = self.function.cfg.get_block_mut(from) {
            block.set_terminator(IrTerminator::Return { value });
        }
    }

    // === Phi Nodes ===

    /// Create an empty phi node in the given block
    pub fn build_phi(&mut self, block: IrBlockId, ty: IrType) -> IrId {
        let dest = self.alloc_reg();
        self.set_register_type(dest, ty.clone());
        if let Some(b) = self.function.cfg.get_block_mut(block) {
            b.add_phi(IrPhiNode {
                dest,
                incoming: Vec::new(),
                ty,
            });
        }
        dest
    }

    /// Add an incoming value to an existing phi node
    pub fn add_phi_incoming(&mut self, block: IrBlockId, phi: IrId, pred: IrBlockId, value: IrId) {
        if let Some(b) = self.function.cfg.get_block_mut(block) {
            if let Some(node) = b.phi_nodes.iter_mut().find(|p| p.dest == phi) {
                node.incoming.push((pred, value));
            }
        }
    }
}
