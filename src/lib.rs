//! loopguard — loop range-check predication and write-barrier elision
//!
//! A standalone optimizer over a small register-based IR with explicit
//! control flow. Two rewrites run per function:
//!
//! 1. **Range-check predication**: per-iteration array bounds checks inside
//!    counted loops are replaced by a static proof (checks deleted outright)
//!    or by a single loop-invariant guard hoisted into the preheader.
//! 2. **Write-barrier elision**: every reference store gets a committed
//!    barrier decision; stores into the most recently allocated,
//!    not-yet-published object skip the barrier, everything else gets the
//!    shape the configured collector requires.
//!
//! The entry point is [`ir::optimization::optimize_function`], which
//! validates the function, runs both rewrites on freshly computed analyses,
//! and returns a serializable [`ir::optimization::RewriteReport`].
//!
//! ```rust
//! use loopguard::ir::builder::IrBuilder;
//! use loopguard::ir::optimization::{optimize_function, OptimizerConfig};
//!
//! let mut builder = IrBuilder::new("empty");
//! builder.build_return(None);
//! let mut function = builder.finish();
//!
//! let report = optimize_function(&mut function, &OptimizerConfig::default()).unwrap();
//! assert!(!report.modified());
//! ```

pub mod ir;
pub mod logging;

pub use ir::barriers::CollectorPolicy;
pub use ir::optimization::{optimize_function, OptimizerConfig, RewriteReport};
pub use ir::validation::StructuralError;
