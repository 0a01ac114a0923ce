//! State transition service
//!
//! Every lifecycle write goes through [`StateTransitionManager`]. It checks
//! the requested edge against the transition table, then hands the write to
//! the store as a compare-and-swap. A write that matched no row comes back as
//! a conflict and is never retried here.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use colony_core::domain::{JobRequest, RequestState, StateChange, TaskExecution};
use colony_core::{Error, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::repository::{JobExecutionRepository, JobRequestRepository};

/// Guards the lifecycle of job requests, job executions and task executions
#[derive(Clone)]
pub struct StateTransitionManager {
    requests: Arc<dyn JobRequestRepository>,
    executions: Arc<dyn JobExecutionRepository>,
}

impl StateTransitionManager {
    pub fn new(
        requests: Arc<dyn JobRequestRepository>,
        executions: Arc<dyn JobExecutionRepository>,
    ) -> Self {
        Self {
            requests,
            executions,
        }
    }

    /// Builds a manager over a single store implementing both repositories
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: JobRequestRepository + JobExecutionRepository + 'static,
    {
        Self::new(store.clone(), store)
    }

    // ===== Job requests =====

    /// Moves a job request from `old` to `new`
    pub async fn transition_request(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()> {
        check_edge("job request", id, old, new)?;
        observe(
            self.requests.update_state(id, old, new, change).await,
            "job request",
            id,
            old,
            new,
        )
    }

    /// Flips a PENDING or PAUSED request to READY, backed by an existing
    /// execution of that request
    pub async fn mark_ready_to_execute(&self, id: Uuid, job_execution_id: Uuid) -> Result<()> {
        // Referential pre-check: the execution must already be stored
        let backed = self
            .executions
            .get(job_execution_id)
            .await?
            .is_some_and(|execution| execution.job_request_id == id);
        if !backed {
            warn!(
                "Job request {} cannot become ready: execution {} not found",
                id, job_execution_id
            );
            return Err(Error::Conflict(format!(
                "job execution {} of request {} not found",
                job_execution_id, id
            )));
        }

        match self.requests.set_ready_to_execute(id, job_execution_id).await {
            Ok(()) => {
                info!(
                    "Job request {} ready to execute as {}",
                    id, job_execution_id
                );
                Ok(())
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!("Job request {} not marked ready: {}", id, e);
                }
                Err(e)
            }
        }
    }

    /// Moves requests stuck in READY, STARTED or EXECUTING for longer than
    /// `stale_after` back to PENDING
    pub async fn requeue_orphans(&self, stale_after: Duration) -> Result<u64> {
        let stale_after = TimeDelta::from_std(stale_after).unwrap_or(TimeDelta::MAX);
        let stale_before = Utc::now()
            .checked_sub_signed(stale_after)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let requeued = self.requests.requeue_orphans(stale_before).await?;
        if requeued > 0 {
            info!("Requeued {} orphaned job request(s)", requeued);
        } else {
            debug!("No orphaned job requests");
        }
        Ok(requeued)
    }

    /// Records a scheduling attempt that could not be dispatched and backs
    /// the request off by `delay`
    pub async fn increment_schedule_attempts(
        &self,
        id: Uuid,
        delay: Duration,
        priority_decrement: i32,
        message: &str,
    ) -> Result<()> {
        self.requests
            .increment_schedule_attempts(id, delay, priority_decrement, message)
            .await?;
        debug!(
            "Job request {} backed off by {:?}: {}",
            id, delay, message
        );
        Ok(())
    }

    /// Due requests in `state` with an enabled definition
    pub async fn next_schedulable(
        &self,
        job_types: &[String],
        state: RequestState,
        limit: usize,
    ) -> Result<Vec<JobRequest>> {
        self.requests.next_schedulable(job_types, state, limit).await
    }

    // ===== Job executions =====

    /// Moves a job execution and its request to a non-terminal state
    pub async fn transition_job(
        &self,
        job_execution_id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()> {
        if new.is_terminal() {
            return Err(Error::Validation(format!(
                "{} is terminal; finalize the job instead",
                new
            )));
        }
        check_edge("job execution", job_execution_id, old, new)?;
        observe(
            self.executions
                .update_state(job_execution_id, old, new, change)
                .await,
            "job execution",
            job_execution_id,
            old,
            new,
        )
    }

    /// Moves a job execution and its request to a terminal state in one unit
    /// of work, recording error details and cost
    pub async fn finalize_job(
        &self,
        job_execution_id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()> {
        require_terminal(new)?;
        check_edge("job execution", job_execution_id, old, new)?;
        observe(
            self.executions
                .finalize(job_execution_id, old, new, change)
                .await,
            "job execution",
            job_execution_id,
            old,
            new,
        )
    }

    // ===== Task executions =====

    /// Stores a new task attempt, superseding a finished attempt of the same
    /// task type
    pub async fn save_task(&self, task: &TaskExecution) -> Result<()> {
        self.executions.save_task(task).await?;
        info!(
            "Task {} attempt {} started in execution {}",
            task.task_type, task.retried, task.job_execution_id
        );
        Ok(())
    }

    /// Moves a task attempt to a non-terminal state
    pub async fn transition_task(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()> {
        if new.is_terminal() {
            return Err(Error::Validation(format!(
                "{} is terminal; finalize the task instead",
                new
            )));
        }
        check_edge("task execution", id, old, new)?;
        observe(
            self.executions.update_task_state(id, old, new, change).await,
            "task execution",
            id,
            old,
            new,
        )
    }

    /// Moves a task attempt to a terminal state, recording its exit code,
    /// error details and cost
    pub async fn finalize_task(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()> {
        require_terminal(new)?;
        check_edge("task execution", id, old, new)?;
        observe(
            self.executions.finalize_task(id, old, new, change).await,
            "task execution",
            id,
            old,
            new,
        )
    }
}

/// Rejects edges the lifecycle does not allow before touching the store
fn check_edge(kind: &str, id: Uuid, old: RequestState, new: RequestState) -> Result<()> {
    if old.is_terminal() {
        warn!("Rejected {} {} transition out of terminal {}", kind, id, old);
        return Err(Error::Conflict(format!(
            "{} {} cannot leave terminal state {}",
            kind, id, old
        )));
    }
    if !old.can_transition_to(new) {
        return Err(Error::Validation(format!(
            "illegal {} transition {} -> {}",
            kind, old, new
        )));
    }
    Ok(())
}

fn require_terminal(new: RequestState) -> Result<()> {
    if new.is_terminal() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "cannot finalize into non-terminal state {}",
            new
        )))
    }
}

fn observe(
    result: Result<()>,
    kind: &str,
    id: Uuid,
    old: RequestState,
    new: RequestState,
) -> Result<()> {
    match &result {
        Ok(()) => info!("{} {} moved {} -> {}", kind, id, old, new),
        Err(e) if e.is_conflict() => warn!("{} {} not moved {} -> {}: {}", kind, id, old, new, e),
        Err(_) => {}
    }
    result
}
