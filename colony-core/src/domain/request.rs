//! Job request types

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::JobDefinition;
use super::state::RequestState;

/// Default priority of a new request
pub const DEFAULT_PRIORITY: i32 = 5;

/// A request to run one job
///
/// The request is the scheduling record: it carries priority, back-off
/// bookkeeping and a link to the execution created for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: Uuid,
    pub job_definition_id: Uuid,
    pub job_type: String,
    pub job_version: i32,
    pub job_state: RequestState,
    pub job_priority: i32,
    pub schedule_attempts: i32,
    pub retried: i32,
    pub job_execution_id: Option<Uuid>,
    pub last_job_execution_id: Option<Uuid>,
    pub current_task: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub parameters: HashMap<String, serde_json::Value>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRequest {
    /// Creates a PENDING request eligible for scheduling immediately
    pub fn new(definition: &JobDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_definition_id: definition.id,
            job_type: definition.job_type.clone(),
            job_version: definition.version,
            job_state: RequestState::Pending,
            job_priority: DEFAULT_PRIORITY,
            schedule_attempts: 0,
            retried: 0,
            job_execution_id: None,
            last_job_execution_id: None,
            current_task: None,
            error_code: None,
            error_message: None,
            parameters: HashMap::new(),
            scheduled_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.job_priority = priority;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    /// True if the request is waiting and its schedule time has passed
    pub fn is_due(&self, state: RequestState, now: DateTime<Utc>) -> bool {
        self.job_state == state && self.scheduled_at <= now
    }
}
