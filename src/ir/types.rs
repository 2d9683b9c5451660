//! IR Type System
//!
//! Defines the type system for the intermediate representation. Types are
//! low-level and map directly to runtime representations; reference types
//! (`Ref`) are the ones the garbage collector cares about and the only ones
//! for which write barriers are ever emitted.

use serde::{Deserialize, Serialize};
use std::fmt;

/// IR type representation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IrType {
    /// Void type (no value)
    Void,

    /// Boolean type
    Bool,

    /// 32-bit signed integer (index arithmetic domain)
    I32,

    /// 64-bit signed integer
    I64,

    /// 64-bit float
    F64,

    /// Raw pointer type (unmanaged)
    Ptr(Box<IrType>),

    /// Reference type (managed pointer, subject to GC barriers)
    Ref(Box<IrType>),
}

impl IrType {
    /// Whether a store of a value of this type needs a barrier decision.
    pub fn is_reference(&self) -> bool {
        matches!(self, IrType::Ref(_))
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, IrType::I32 | IrType::I64)
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::Void => write!(f, "void"),
            IrType::Bool => write!(f, "bool"),
            IrType::I32 => write!(f, "i32"),
            IrType::I64 => write!(f, "i64"),
            IrType::F64 => write!(f, "f64"),
            IrType::Ptr(inner) => write!(f, "ptr<{}>", inner),
            IrType::Ref(inner) => write!(f, "ref<{}>", inner),
        }
    }
}

/// Constant values carried by `Const` instructions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IrValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    /// Null reference
    Null,
}

impl IrValue {
    /// Integer view of this constant, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            IrValue::I32(v) => Some(*v as i64),
            IrValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn ty(&self) -> IrType {
        match self {
            IrValue::Bool(_) => IrType::Bool,
            IrValue::I32(_) => IrType::I32,
            IrValue::I64(_) => IrType::I64,
            IrValue::F64(_) => IrType::F64,
            IrValue::Null => IrType::Ref(Box::new(IrType::Void)),
        }
    }
}

impl fmt::Display for IrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrValue::Bool(v) => write!(f, "{}", v),
            IrValue::I32(v) => write!(f, "{}i32", v),
            IrValue::I64(v) => write!(f, "{}i64", v),
            IrValue::F64(v) => write!(f, "{}f64", v),
            IrValue::Null => write!(f, "null"),
        }
    }
}
