//! Scheduler layer
//!
//! Periodic maintenance driven from outside the core: requeueing orphaned
//! requests and releasing expired resource leases.

pub mod sweeper;

pub use sweeper::Sweeper;
