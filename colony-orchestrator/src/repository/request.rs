//! Job request repository

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colony_core::Result;
use colony_core::domain::{JobRequest, RequestState, StateChange};
use uuid::Uuid;

/// Repository trait for job requests
#[async_trait]
pub trait JobRequestRepository: Send + Sync {
    /// Inserts a new request
    async fn save(&self, request: &JobRequest) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<JobRequest>>;

    /// Moves a request from `old` to `new`
    ///
    /// Applies only while the stored state equals `old` and is not terminal.
    async fn update_state(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()>;

    /// Flips a PENDING or PAUSED request to READY, linking it to an
    /// existing execution of that request
    async fn set_ready_to_execute(&self, id: Uuid, job_execution_id: Uuid) -> Result<()>;

    /// Records a failed scheduling attempt and backs the request off
    async fn increment_schedule_attempts(
        &self,
        id: Uuid,
        delay: Duration,
        priority_decrement: i32,
        message: &str,
    ) -> Result<()>;

    /// Moves in-flight requests not updated since `stale_before` back to
    /// PENDING, returning how many were moved
    async fn requeue_orphans(&self, stale_before: DateTime<Utc>) -> Result<u64>;

    /// Due requests in `state` whose job type has a schedulable definition,
    /// highest priority first, then oldest first
    ///
    /// An empty `job_types` slice matches every job type.
    async fn next_schedulable(
        &self,
        job_types: &[String],
        state: RequestState,
        limit: usize,
    ) -> Result<Vec<JobRequest>>;
}
