//! In-memory store
//!
//! Implements every repository trait over one set of tables guarded by a
//! single `RwLock`, so each trait method is its own unit of work. Not shared
//! across processes; intended for tests and local tooling.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colony_core::domain::state::shift;
use colony_core::domain::{
    JobDefinition, JobExecution, JobRequest, JobResource, JobResourceUse, RequestState,
    StateChange, TaskExecution,
};
use colony_core::{Error, Result};
use uuid::Uuid;

use super::{
    JobDefinitionRepository, JobExecutionRepository, JobRequestRepository, JobResourceRepository,
};

#[derive(Debug, Default)]
struct Tables {
    definitions: Vec<JobDefinition>,
    requests: HashMap<Uuid, JobRequest>,
    /// Stored without their task records
    executions: HashMap<Uuid, JobExecution>,
    tasks: Vec<TaskExecution>,
    resources: HashMap<Uuid, JobResource>,
    uses: Vec<JobResourceUse>,
}

impl Tables {
    fn used_quota(&self, resource_id: Uuid) -> i64 {
        self.uses
            .iter()
            .filter(|entry| entry.active && entry.job_resource_id == resource_id)
            .map(|entry| i64::from(entry.amount))
            .sum()
    }

    fn latest_task(&self, job_execution_id: Uuid, task_type: &str) -> Option<&TaskExecution> {
        self.tasks
            .iter()
            .rev()
            .find(|task| task.job_execution_id == job_execution_id && task.task_type == task_type)
    }

    /// Request linked to an execution, if it currently sits in `old`
    fn linked_request_id(&self, job_execution_id: Uuid, old: RequestState) -> Option<Uuid> {
        self.requests
            .values()
            .find(|request| {
                request.job_execution_id == Some(job_execution_id)
                    && request.job_state == old
                    && !request.job_state.is_terminal()
            })
            .map(|request| request.id)
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("memory store lock poisoned")
}

fn apply_request_change(
    request: &mut JobRequest,
    new: RequestState,
    change: &StateChange,
    now: DateTime<Utc>,
) {
    request.job_state = new;
    if let Some(code) = &change.error_code {
        request.error_code = Some(code.clone());
    }
    if let Some(message) = &change.error_message {
        request.error_message = Some(message.clone());
    }
    if let Some(task) = &change.current_task {
        request.current_task = Some(task.clone());
    }
    if let Some(retried) = change.retried {
        request.retried = retried;
    }
    if let Some(at) = change.rescheduled_at(new, now) {
        request.scheduled_at = at;
    }
    request.updated_at = now;
}

fn apply_task_change(
    task: &mut TaskExecution,
    new: RequestState,
    change: &StateChange,
    now: DateTime<Utc>,
) {
    task.task_state = new;
    if let Some(exit_code) = &change.exit_code {
        task.exit_code = Some(exit_code.clone());
    }
    if let Some(code) = &change.error_code {
        task.error_code = Some(code.clone());
    }
    if let Some(message) = &change.error_message {
        task.error_message = Some(message.clone());
    }
    task.updated_at = now;
}

/// Store keeping every table in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(poison_err)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(poison_err)
    }

    /// Paired job-level write shared by `update_state` and `finalize`
    fn update_job(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
        finished: bool,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tables = self.write()?;

        let execution_matches = tables
            .executions
            .get(&id)
            .is_some_and(|execution| execution.job_state == old && !old.is_terminal());
        if !execution_matches {
            return Err(Error::Conflict(format!(
                "job execution {} is not in state {}",
                id, old
            )));
        }
        let request_id = tables.linked_request_id(id, old).ok_or_else(|| {
            Error::Conflict(format!(
                "job request of execution {} is not in state {}",
                id, old
            ))
        })?;

        if let Some(request) = tables.requests.get_mut(&request_id) {
            apply_request_change(request, new, change, now);
        }
        if let Some(execution) = tables.executions.get_mut(&id) {
            execution.job_state = new;
            if let Some(code) = &change.error_code {
                execution.error_code = Some(code.clone());
            }
            if let Some(message) = &change.error_message {
                execution.error_message = Some(message.clone());
            }
            if finished {
                execution.ended_at = Some(now);
                if let Some(cost) = change.cost_secs {
                    execution.cost_secs = cost;
                }
            }
            execution.updated_at = now;
        }
        Ok(())
    }

    /// Task-level write shared by `update_task_state` and `finalize_task`
    fn update_task(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
        finished: bool,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tables = self.write()?;

        let task = tables
            .tasks
            .iter_mut()
            .find(|task| task.id == id && task.task_state == old && !old.is_terminal())
            .ok_or_else(|| {
                Error::Conflict(format!("task execution {} is not in state {}", id, old))
            })?;

        apply_task_change(task, new, change, now);
        if finished {
            task.ended_at = Some(now);
            let cost = change.cost_secs.unwrap_or_else(|| task.elapsed_secs());
            task.cost_secs = cost;
        }
        Ok(())
    }
}

// ===== Job definitions =====

#[async_trait]
impl JobDefinitionRepository for MemoryStore {
    async fn save(&self, mut definition: JobDefinition) -> Result<JobDefinition> {
        let now = Utc::now();
        let mut tables = self.write()?;

        let mut version = 0;
        for existing in tables
            .definitions
            .iter_mut()
            .filter(|existing| existing.job_type == definition.job_type)
        {
            version = version.max(existing.version);
            existing.active = false;
            existing.updated_at = now;
        }

        definition.version = version + 1;
        definition.active = true;
        definition.updated_at = now;
        tables.definitions.push(definition.clone());
        Ok(definition)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<JobDefinition>> {
        let tables = self.read()?;
        Ok(tables.definitions.iter().find(|d| d.id == id).cloned())
    }

    async fn find_latest(&self, job_type: &str) -> Result<Option<JobDefinition>> {
        let tables = self.read()?;
        Ok(tables
            .definitions
            .iter()
            .filter(|d| d.job_type == job_type && d.active)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn set_disabled(&self, job_type: &str, disabled: bool) -> Result<()> {
        let mut tables = self.write()?;
        let definition = tables
            .definitions
            .iter_mut()
            .find(|d| d.job_type == job_type && d.active)
            .ok_or_else(|| Error::Conflict(format!("job definition {} not found", job_type)))?;
        definition.disabled = disabled;
        definition.updated_at = Utc::now();
        Ok(())
    }
}

// ===== Job requests =====

#[async_trait]
impl JobRequestRepository for MemoryStore {
    async fn save(&self, request: &JobRequest) -> Result<()> {
        let mut tables = self.write()?;
        if tables.requests.contains_key(&request.id) {
            return Err(Error::Conflict(format!(
                "job request {} already exists",
                request.id
            )));
        }
        tables.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRequest>> {
        let tables = self.read()?;
        Ok(tables.requests.get(&id).cloned())
    }

    async fn update_state(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()> {
        let mut tables = self.write()?;
        let request = tables
            .requests
            .get_mut(&id)
            .filter(|request| request.job_state == old && !old.is_terminal())
            .ok_or_else(|| Error::Conflict(format!("job request {} is not in state {}", id, old)))?;
        apply_request_change(request, new, change, Utc::now());
        Ok(())
    }

    async fn set_ready_to_execute(&self, id: Uuid, job_execution_id: Uuid) -> Result<()> {
        let mut tables = self.write()?;

        let backed = tables
            .executions
            .get(&job_execution_id)
            .is_some_and(|execution| execution.job_request_id == id);
        if !backed {
            return Err(Error::Conflict(format!(
                "job execution {} of request {} not found",
                job_execution_id, id
            )));
        }

        let request = tables
            .requests
            .get_mut(&id)
            .filter(|request| request.job_state.is_schedulable())
            .ok_or_else(|| {
                Error::Conflict(format!("job request {} is not pending or paused", id))
            })?;
        request.last_job_execution_id = request.job_execution_id.or(Some(job_execution_id));
        request.job_execution_id = Some(job_execution_id);
        request.job_state = RequestState::Ready;
        request.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_schedule_attempts(
        &self,
        id: Uuid,
        delay: Duration,
        priority_decrement: i32,
        message: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tables = self.write()?;
        let request = tables
            .requests
            .get_mut(&id)
            .filter(|request| !request.job_state.is_terminal())
            .ok_or_else(|| Error::Conflict(format!("job request {} is not schedulable", id)))?;
        request.schedule_attempts += 1;
        request.scheduled_at = shift(now, delay);
        request.job_priority = request.job_priority.saturating_sub(priority_decrement);
        request.error_message = Some(message.to_string());
        request.updated_at = now;
        Ok(())
    }

    async fn requeue_orphans(&self, stale_before: DateTime<Utc>) -> Result<u64> {
        let now = Utc::now();
        let mut tables = self.write()?;
        let mut requeued = 0;
        for request in tables.requests.values_mut().filter(|request| {
            request.job_state.is_orphan_candidate() && request.updated_at < stale_before
        }) {
            request.job_state = RequestState::Pending;
            request.scheduled_at = now;
            request.updated_at = now;
            requeued += 1;
        }
        Ok(requeued)
    }

    async fn next_schedulable(
        &self,
        job_types: &[String],
        state: RequestState,
        limit: usize,
    ) -> Result<Vec<JobRequest>> {
        let now = Utc::now();
        let tables = self.read()?;

        let enabled: HashSet<&str> = tables
            .definitions
            .iter()
            .filter(|d| d.is_schedulable())
            .map(|d| d.job_type.as_str())
            .collect();

        let mut due: Vec<&JobRequest> = tables
            .requests
            .values()
            .filter(|request| request.is_due(state, now))
            .filter(|request| enabled.contains(request.job_type.as_str()))
            .filter(|request| job_types.is_empty() || job_types.contains(&request.job_type))
            .collect();
        due.sort_by_key(|request| (Reverse(request.job_priority), request.created_at));

        Ok(due.into_iter().take(limit).cloned().collect())
    }
}

// ===== Job executions =====

#[async_trait]
impl JobExecutionRepository for MemoryStore {
    async fn save(&self, execution: &JobExecution) -> Result<()> {
        let mut tables = self.write()?;
        if tables.executions.contains_key(&execution.id) {
            return Err(Error::Conflict(format!(
                "job execution {} already exists",
                execution.id
            )));
        }
        let mut stored = execution.clone();
        tables.tasks.extend(std::mem::take(&mut stored.tasks));
        tables.executions.insert(stored.id, stored);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobExecution>> {
        let tables = self.read()?;
        Ok(tables.executions.get(&id).map(|execution| {
            let mut execution = execution.clone();
            execution.tasks = tables
                .tasks
                .iter()
                .filter(|task| task.job_execution_id == id)
                .cloned()
                .collect();
            execution
        }))
    }

    async fn update_state(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()> {
        self.update_job(id, old, new, change, false)
    }

    async fn finalize(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()> {
        self.update_job(id, old, new, change, true)
    }

    async fn save_task(&self, task: &TaskExecution) -> Result<()> {
        let mut tables = self.write()?;

        let live = tables
            .executions
            .get(&task.job_execution_id)
            .is_some_and(|execution| !execution.job_state.is_terminal());
        if !live {
            return Err(Error::Conflict(format!(
                "job execution {} not found or already finished",
                task.job_execution_id
            )));
        }
        if tables.tasks.iter().any(|existing| existing.id == task.id) {
            return Err(Error::Conflict(format!(
                "task execution {} already exists",
                task.id
            )));
        }
        if let Some(previous) = tables.latest_task(task.job_execution_id, &task.task_type) {
            if !previous.task_state.is_terminal() {
                return Err(Error::Conflict(format!(
                    "task {} of execution {} is still {}",
                    task.task_type, task.job_execution_id, previous.task_state
                )));
            }
        }

        tables.tasks.push(task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskExecution>> {
        let tables = self.read()?;
        Ok(tables.tasks.iter().find(|task| task.id == id).cloned())
    }

    async fn update_task_state(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()> {
        self.update_task(id, old, new, change, false)
    }

    async fn finalize_task(
        &self,
        id: Uuid,
        old: RequestState,
        new: RequestState,
        change: &StateChange,
    ) -> Result<()> {
        self.update_task(id, old, new, change, true)
    }
}

// ===== Job resources =====

#[async_trait]
impl JobResourceRepository for MemoryStore {
    async fn save(&self, resource: &JobResource) -> Result<()> {
        let mut tables = self.write()?;
        if tables.resources.contains_key(&resource.id) {
            return Err(Error::Conflict(format!(
                "job resource {} already exists",
                resource.id
            )));
        }
        tables.resources.insert(resource.id, resource.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobResource>> {
        let tables = self.read()?;
        Ok(tables.resources.get(&id).cloned())
    }

    async fn set_paused(&self, id: Uuid, paused: bool) -> Result<()> {
        let mut tables = self.write()?;
        let resource = tables
            .resources
            .get_mut(&id)
            .filter(|resource| resource.active)
            .ok_or_else(|| Error::Conflict(format!("job resource {} not found", id)))?;
        resource.paused = paused;
        resource.updated_at = Utc::now();
        Ok(())
    }

    async fn retire(&self, id: Uuid) -> Result<()> {
        let mut tables = self.write()?;
        let resource = tables
            .resources
            .get_mut(&id)
            .filter(|resource| resource.active)
            .ok_or_else(|| Error::Conflict(format!("job resource {} not found", id)))?;
        resource.active = false;
        resource.updated_at = Utc::now();
        Ok(())
    }

    async fn allocate(&self, lease: &JobResourceUse) -> Result<i64> {
        let mut tables = self.write()?;

        let quota = tables
            .resources
            .get(&lease.job_resource_id)
            .filter(|resource| resource.active)
            .map(|resource| resource.quota)
            .ok_or_else(|| {
                Error::Conflict(format!("job resource {} not found", lease.job_resource_id))
            })?;
        if tables.uses.iter().any(|entry| entry.id == lease.id) {
            return Err(Error::Conflict(format!(
                "job resource use {} already exists",
                lease.id
            )));
        }

        let mut entry = lease.clone();
        entry.active = true;
        tables.uses.push(entry);

        let used = tables.used_quota(lease.job_resource_id);
        if used > i64::from(quota) {
            // compensate before the lock is released
            tables.uses.pop();
            return Err(Error::QuotaExceeded {
                resource_id: lease.job_resource_id,
                requested: lease.amount,
                used: used - i64::from(lease.amount),
                quota,
            });
        }
        Ok(i64::from(quota) - used)
    }

    async fn deallocate(&self, use_id: Uuid) -> Result<()> {
        let mut tables = self.write()?;
        let entry = tables
            .uses
            .iter_mut()
            .find(|entry| entry.id == use_id && entry.active)
            .ok_or_else(|| {
                Error::Conflict(format!("active job resource use {} not found", use_id))
            })?;
        entry.active = false;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn used_quota(&self, resource_id: Uuid) -> Result<i64> {
        let tables = self.read()?;
        Ok(tables.used_quota(resource_id))
    }

    async fn match_by_tags(
        &self,
        resource_type: &str,
        platform: &str,
        tags: &[String],
        amount: i32,
    ) -> Result<Vec<JobResource>> {
        let tables = self.read()?;
        let mut matched: Vec<JobResource> = tables
            .resources
            .values()
            .filter(|resource| {
                resource.is_available()
                    && resource.resource_type == resource_type
                    && resource.platform == platform
                    && i64::from(resource.quota) - tables.used_quota(resource.id)
                        >= i64::from(amount)
                    && resource.matches_tags(tags)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|resource| resource.created_at);
        Ok(matched)
    }

    async fn resource_uses(&self, resource_id: Uuid) -> Result<Vec<JobResourceUse>> {
        let tables = self.read()?;
        Ok(tables
            .uses
            .iter()
            .filter(|entry| entry.active && entry.job_resource_id == resource_id)
            .cloned()
            .collect())
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.write()?;
        let mut released = 0;
        for entry in tables
            .uses
            .iter_mut()
            .filter(|entry| entry.active && entry.is_expired(now))
        {
            entry.active = false;
            entry.updated_at = now;
            released += 1;
        }
        Ok(released)
    }
}
