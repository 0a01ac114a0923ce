//! Colony Core
//!
//! Core types and the task graph builder for the Colony job orchestrator.
//!
//! This crate contains:
//! - Domain types: definitions, requests, executions, resources and the
//!   lifecycle states they share
//! - Resolvers: the collaborator traits the graph builder delegates to
//! - Graph: the reachable task graph of a job, overlaid with runtime state
//!
//! Persistence lives in `colony-orchestrator`; nothing here performs I/O.

pub mod domain;
pub mod error;
pub mod graph;
pub mod resolver;

pub use error::{Error, Result};
