pub mod allocator;
pub mod error;
pub mod range;
