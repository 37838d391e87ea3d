// ============================================================================
// Order Domain - Business Logic for Order Aggregate
// ============================================================================
//
// - Value objects (OrderStatus)
// - Commands (the transition table)
// - Errors (ValidationError, IllegalTransitionError)
// - Aggregate (Order)
// - Events (DomainEvent and its wire format)
// - Repository (storage boundary)
//
// ============================================================================

pub mod value_objects;
pub mod commands;
pub mod errors;
pub mod aggregate;
pub mod events;
pub mod repository;

// Re-export for convenience
pub use value_objects::*;
pub use commands::*;
pub use errors::*;
pub use aggregate::*;
pub use events::*;
pub use repository::*;
