//! Repository Module
//!
//! Data access layer for the orchestrator.
//! Each repository trait covers one record family; every write that depends
//! on current state is a conditional update and reports a conflict when the
//! condition did not hold.
//!
//! Two stores implement all four traits:
//! - [`PgStore`]: Postgres, the production store
//! - [`MemoryStore`]: a single-process store for tests and local tooling

pub mod definition;
pub mod execution;
pub mod memory;
pub mod postgres;
pub mod request;
pub mod resource;

// Re-export traits
pub use definition::JobDefinitionRepository;
pub use execution::JobExecutionRepository;
pub use request::JobRequestRepository;
pub use resource::JobResourceRepository;

// Re-export implementations
pub use memory::MemoryStore;
pub use postgres::PgStore;
