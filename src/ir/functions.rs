//! IR Functions
//!
//! A function owns its control flow graph, its parameter list, and the type
//! information for all registers. Register and guard ids are allocated from
//! per-function counters.

use super::{GuardId, IrBlockId, IrControlFlowGraph, IrId, IrType};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Function parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrParameter {
    /// Parameter name (for debugging)
    pub name: String,

    /// Register assigned to this parameter
    pub reg: IrId,

    /// Parameter type
    pub ty: IrType,
}

/// IR function representation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrFunction {
    /// Function name
    pub name: String,

    /// Parameters (their registers have no defining instruction)
    pub parameters: Vec<IrParameter>,

    /// Control flow graph (function body)
    pub cfg: IrControlFlowGraph,

    /// Type information for all registers
    pub register_types: FxHashMap<IrId, IrType>,

    /// Next available register ID
    pub next_reg_id: u32,

    /// Next available guard ID
    pub next_guard_id: u32,
}

impl IrFunction {
    /// Create a new function with an empty entry block
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            cfg: IrControlFlowGraph::new(),
            register_types: FxHashMap::default(),
            next_reg_id: 0,
            next_guard_id: 0,
        }
    }

    /// Allocate a fresh register
    pub fn alloc_reg(&mut self) -> IrId {
        let id = IrId::new(self.next_reg_id);
        self.next_reg_id += 1;
        id
    }

    /// Allocate a fresh guard id
    pub fn alloc_guard(&mut self) -> GuardId {
        let id = GuardId::new(self.next_guard_id);
        self.next_guard_id += 1;
        id
    }

    /// Add a parameter and return its register
    pub fn add_parameter(&mut self, name: impl Into<String>, ty: IrType) -> IrId {
        let reg = self.alloc_reg();
        self.register_types.insert(reg, ty.clone());
        self.parameters.push(IrParameter {
            name: name.into(),
            reg,
            ty,
        });
        reg
    }

    /// Entry block of the function body
    pub fn entry_block(&self) -> IrBlockId {
        self.cfg.entry_block
    }

    /// Type of a register, if known
    pub fn register_type(&self, reg: IrId) -> Option<&IrType> {
        self.register_types.get(&reg)
    }

    /// Check whether a register is a parameter
    pub fn is_parameter(&self, reg: IrId) -> bool {
        self.parameters.iter().any(|p| p.reg == reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_registers_and_params() {
        let mut f = IrFunction::new("test");
        let p = f.add_parameter("len", IrType::I32);
        let r = f.alloc_reg();
        assert_ne!(p, r);
        assert!(f.is_parameter(p));
        assert!(!f.is_parameter(r));
        assert_eq!(f.register_type(p), Some(&IrType::I32));
    }

    #[test]
    fn test_guard_ids_are_unique() {
        let mut f = IrFunction::new("test");
        let g0 = f.alloc_guard();
        let g1 = f.alloc_guard();
        assert_ne!(g0, g1);
    }
}
