//! Job and task execution repository

use async_trait::async_trait;
use colony_core::Result;
use colony_core::domain::{JobExecution, RequestState, StateChange, TaskExecution};
use uuid::Uuid;

/// Repository trait for job executions and their task records
///
/// Job-level writes always move the execution and the request linked to it
/// together: both must match the expected state or neither changes.
#[async_trait]
pub trait JobExecutionRepository: Send + Sync {
    /// Inserts a new execution together with any task records it carries
    async fn save(&self, execution: &JobExecution) -> Result<()>;

    /// Loads an execution with its task records, oldest attempt first
    async fn get(&self, id: Uuid) -> Result<Option<JobExecution>>;

    /// Moves an execution and its request from `old` to `new`
    async fn update_state(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()>;

    /// Like [`update_state`](Self::update_state), also recording the end
    /// time and cost of the execution
    async fn finalize(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()>;

    /// Inserts a task attempt
    ///
    /// A previous attempt of the same task type must be terminal; the new
    /// attempt supersedes it.
    async fn save_task(&self, task: &TaskExecution) -> Result<()>;

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskExecution>>;

    /// Moves a task attempt from `old` to `new`
    async fn update_task_state(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()>;

    /// Like [`update_task_state`](Self::update_task_state), also recording
    /// the end time and cost of the attempt
    async fn finalize_task(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()>;
}
