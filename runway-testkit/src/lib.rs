//! Recording mocks and fixtures for testing runway orchestration.

pub mod context;
pub mod mock;

pub use context::*;
pub use mock::*;
