//! In-memory [`ResourceFactory`] with failure injection.

pub mod factory;

pub use factory::{MockFactory, Op};
