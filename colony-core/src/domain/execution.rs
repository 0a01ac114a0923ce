//! Job and task execution records

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::request::JobRequest;
use super::state::RequestState;

/// One runtime instance of a job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: Uuid,
    pub job_request_id: Uuid,
    pub job_state: RequestState,
    /// Ordered oldest first; a retried task appears once per attempt
    pub tasks: Vec<TaskExecution>,
    /// Variables accumulated by tasks while the job runs
    pub contexts: HashMap<String, serde_json::Value>,
    pub cost_secs: f64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobExecution {
    /// Creates the execution backing `request`, ready to be dispatched
    pub fn new(request: &JobRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_request_id: request.id,
            job_state: RequestState::Ready,
            tasks: Vec::new(),
            contexts: HashMap::new(),
            cost_secs: 0.0,
            error_code: None,
            error_message: None,
            started_at: now,
            ended_at: None,
            updated_at: now,
        }
    }

    pub fn with_context(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.contexts.insert(name.into(), value);
        self
    }

    /// Latest attempt of the given task type
    pub fn task_by_type(&self, task_type: &str) -> Option<&TaskExecution> {
        self.tasks.iter().rev().find(|task| task.task_type == task_type)
    }

    /// Most recent task that has left the processing phase
    pub fn last_executed_task(&self) -> Option<&TaskExecution> {
        self.tasks
            .iter()
            .rev()
            .find(|task| !task.task_state.is_processing())
    }

    /// Total cost of all task attempts, including inherited retry cost
    pub fn execution_cost_secs(&self) -> f64 {
        self.tasks
            .iter()
            .filter(|task| !self.is_superseded(task))
            .map(TaskExecution::execution_cost_secs)
            .sum()
    }

    /// An attempt followed by a later attempt of the same task type
    fn is_superseded(&self, task: &TaskExecution) -> bool {
        self.task_by_type(&task.task_type)
            .is_some_and(|latest| latest.id != task.id)
    }
}

/// One runtime record per executed task attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: Uuid,
    pub job_execution_id: Uuid,
    pub task_type: String,
    pub task_state: RequestState,
    pub exit_code: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Attempt number, 0 for the first dispatch
    pub retried: i32,
    /// Cost recorded for this attempt when it finished
    pub cost_secs: f64,
    /// Cost carried over from the superseded attempt
    pub inherited_cost_secs: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TaskExecution {
    /// Creates the first attempt of a task, in STARTED state
    pub fn new(job_execution_id: Uuid, task_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_execution_id,
            task_type: task_type.into(),
            task_state: RequestState::Started,
            exit_code: None,
            error_code: None,
            error_message: None,
            retried: 0,
            cost_secs: 0.0,
            inherited_cost_secs: 0.0,
            started_at: now,
            ended_at: None,
            updated_at: now,
        }
    }

    /// Creates the attempt that supersedes `previous`, inheriting its cost
    pub fn retry_of(previous: &TaskExecution) -> Self {
        let mut next = Self::new(previous.job_execution_id, previous.task_type.clone());
        next.retried = previous.retried + 1;
        next.inherited_cost_secs = previous.execution_cost_secs();
        next
    }

    pub fn with_state(mut self, state: RequestState) -> Self {
        self.task_state = state;
        self
    }

    pub fn with_exit_code(mut self, exit_code: impl Into<String>) -> Self {
        self.exit_code = Some(exit_code.into());
        self
    }

    /// Wall-clock seconds of this attempt, up to `ended_at` or now
    pub fn elapsed_secs(&self) -> f64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    /// Own cost plus cost inherited from earlier attempts
    ///
    /// An attempt that has not recorded a cost yet is charged its elapsed time.
    pub fn execution_cost_secs(&self) -> f64 {
        let own = if self.cost_secs > 0.0 {
            self.cost_secs
        } else {
            self.elapsed_secs()
        };
        own + self.inherited_cost_secs
    }

    /// Exit code, falling back to the state label when none was recorded
    pub fn outcome_label(&self) -> String {
        match self.exit_code.as_deref() {
            Some(code) if !code.trim().is_empty() => code.to_string(),
            _ => self.task_state.as_str().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn finished(execution_id: Uuid, task_type: &str, cost: f64) -> TaskExecution {
        let mut task =
            TaskExecution::new(execution_id, task_type).with_state(RequestState::Failed);
        task.cost_secs = cost;
        task.ended_at = Some(task.started_at);
        task
    }

    #[test]
    fn test_retry_inherits_cost() {
        let first = finished(Uuid::new_v4(), "encode", 12.5);
        let mut second = TaskExecution::retry_of(&first);
        second.cost_secs = 2.5;

        assert_eq!(second.retried, 1);
        assert_eq!(second.inherited_cost_secs, 12.5);
        assert_eq!(second.execution_cost_secs(), 15.0);
        assert_eq!(second.task_state, RequestState::Started);
    }

    #[test]
    fn test_task_by_type_returns_latest_attempt() {
        let mut execution = JobExecution {
            tasks: Vec::new(),
            ..sample_execution()
        };
        let first = finished(execution.id, "encode", 4.0);
        let mut second = TaskExecution::retry_of(&first);
        second.cost_secs = 1.0;
        second.ended_at = Some(second.started_at);
        execution.tasks = vec![first, second.clone()];

        assert_eq!(execution.task_by_type("encode").unwrap().id, second.id);
        // superseded attempt is already counted through inheritance
        assert_eq!(execution.execution_cost_secs(), 5.0);
    }

    #[test]
    fn test_last_executed_task_skips_running_tasks() {
        let mut execution = sample_execution();
        let done = finished(execution.id, "download", 1.0).with_state(RequestState::Completed);
        let running =
            TaskExecution::new(execution.id, "encode").with_state(RequestState::Executing);
        execution.tasks = vec![done.clone(), running];

        assert_eq!(execution.last_executed_task().unwrap().id, done.id);
    }

    #[test]
    fn test_elapsed_secs() {
        let mut task = TaskExecution::new(Uuid::new_v4(), "sleep");
        task.ended_at = Some(task.started_at + TimeDelta::milliseconds(1500));
        assert_eq!(task.elapsed_secs(), 1.5);
    }

    #[test]
    fn test_outcome_label_falls_back_to_state() {
        let task = TaskExecution::new(Uuid::new_v4(), "x").with_state(RequestState::Failed);
        assert_eq!(task.outcome_label(), "FAILED");
        assert_eq!(task.with_exit_code("137").outcome_label(), "137");
    }

    fn sample_execution() -> JobExecution {
        let now = Utc::now();
        JobExecution {
            id: Uuid::new_v4(),
            job_request_id: Uuid::new_v4(),
            job_state: RequestState::Executing,
            tasks: Vec::new(),
            contexts: HashMap::new(),
            cost_secs: 0.0,
            error_code: None,
            error_message: None,
            started_at: now,
            ended_at: None,
            updated_at: now,
        }
    }
}
