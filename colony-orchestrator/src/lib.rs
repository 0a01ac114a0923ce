//! Colony Orchestrator
//!
//! Persistence and lifecycle services for colony jobs:
//! - Repositories: async store traits with Postgres and in-memory backends
//! - Services: state transitions, resource allocation, task graphs
//! - Scheduler: periodic orphan and lease sweeps

pub mod config;
pub mod db;
pub mod repository;
pub mod scheduler;
pub mod service;
