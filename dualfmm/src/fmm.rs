//! The FMM engine: expansion passes, dual-tree traversal, and the facade.
pub mod builder;
pub mod let_exchange;
pub mod traversal;
pub mod types;
pub mod up_down_pass;
