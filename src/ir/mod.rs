//! Mid-level IR for the loopguard optimizer
//!
//! This module defines a small, explicit, register-based intermediate
//! representation over which the optimization passes run. The IR is designed
//! to be:
//! - Simple and explicit (no implicit operations)
//! - Strongly typed with explicit type information
//! - Easy to analyze and rewrite in place
//!
//! Blocks live in an arena owned by the control-flow graph and reference each
//! other by id, so the cyclic-looking graph carries no ownership cycles.

pub mod barriers;
pub mod blocks;
pub mod builder;
pub mod dump;
pub mod escape_analysis;
pub mod functions;
pub mod induction;
pub mod instructions;
pub mod loop_analysis;
pub mod optimization;
pub mod predication;
pub mod types;
pub mod validation;

pub use blocks::*;
pub use builder::*;
pub use functions::*;
pub use instructions::*;
pub use types::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for IR registers (values)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IrId(u32);

impl IrId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn invalid() -> Self {
        Self(u32::MAX)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != u32::MAX
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for IrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// Stable identity of a deoptimization site (bounds check or hoisted guard).
///
/// Guard ids survive rewrites: the profiling side reports failed speculations
/// against these ids, and the caller feeds them back through
/// [`optimization::OptimizerConfig::failed_speculations`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GuardId(u32);

impl GuardId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for GuardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "guard{}", self.0)
    }
}
