//! Core domain types
//!
//! Definitions describe what a job is, requests and executions record what
//! a job is doing, resources bound how many jobs may do it at once.

pub mod execution;
pub mod job;
pub mod request;
pub mod resource;
pub mod state;
pub mod task;

pub use execution::{JobExecution, TaskExecution};
pub use job::JobDefinition;
pub use request::JobRequest;
pub use resource::{JobResource, JobResourceUse};
pub use state::{RequestState, StateChange};
pub use task::{TaskDefinition, TaskMethod};
