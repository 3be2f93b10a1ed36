//! Spatial data structures: bounds, the adaptive octree, and the
//! distributed partition.
pub mod bounds;
pub mod build;
pub mod helpers;
#[cfg(feature = "mpi")]
pub mod partition;
pub mod types;
