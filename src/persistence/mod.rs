// Process-local implementations of the storage boundaries.
pub mod memory;

pub use memory::{InMemoryOrderRepository, InMemoryUserDirectory};
