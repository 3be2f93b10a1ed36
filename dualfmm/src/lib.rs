//! # Adaptive dual-tree Fast Multipole Method
//!
//! Evaluates pairwise N-body interactions (potentials and fields) in
//! near-linear time: an adaptive octree over the bodies, an upward pass
//! aggregating multipole expansions, a dual-tree traversal trading accuracy
//! for cost through a geometric acceptance criterion, and a downward pass
//! distributing local expansions back to the bodies. Periodic image shells
//! approximate an infinite domain.
//!
//! Notable features of this library are:
//! * Swappable expansion kernels behind a six-operation trait, with a
//!   Cartesian Taylor Laplace kernel included.
//! * Task-parallel tree construction and traversal via rayon.
//! * An optional `mpi` feature with recursive-bisection domain
//!   decomposition and Local-Essential-Tree exchange across ranks.
#![cfg_attr(feature = "strict", deny(warnings))]
#![warn(missing_docs)]

pub mod fmm;
pub mod kernel;
pub mod traits;
pub mod tree;

// Public API
#[doc(inline)]
pub use fmm::builder::FmmBuilder;
#[doc(inline)]
pub use fmm::types::{Fmm, FmmParameters, TraversalStats};
#[doc(inline)]
pub use kernel::laplace::LaplaceKernel;
#[doc(inline)]
pub use kernel::KernelParams;
#[doc(inline)]
pub use traits::kernel::Kernel;
#[doc(inline)]
pub use traits::types::FmmError;
#[doc(inline)]
pub use tree::types::{Body, Bounds};
