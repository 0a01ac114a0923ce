//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services sit on top of the repository traits, so they run unchanged
//! against Postgres or the in-memory store.

pub mod graph;
pub mod resource;
pub mod state;

// Re-export for convenience
pub use graph::GraphService;
pub use resource::{GrantedLease, ResourceAllocator};
pub use state::StateTransitionManager;
