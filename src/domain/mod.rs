// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Storage and messaging stay out of this layer. The order aggregate is pure
// state-machine logic; `user` only describes the lookup the service needs.
//
// ============================================================================

pub mod order;
pub mod user;
