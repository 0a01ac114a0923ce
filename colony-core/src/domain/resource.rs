//! Shared resource pools and their usage ledger

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::shift;
use crate::error::{Error, Result};

/// A named, tagged capacity pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResource {
    pub id: Uuid,
    pub resource_type: String,
    pub platform: String,
    pub description: Option<String>,
    /// Maximum total amount of concurrent active usage
    pub quota: i32,
    pub tags: Vec<String>,
    /// How long a lease stays valid before the reaper may release it
    pub lease_timeout_secs: i64,
    pub paused: bool,
    /// Retired resources are kept for history but never matched
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobResource {
    pub fn new(
        resource_type: impl Into<String>,
        platform: impl Into<String>,
        quota: i32,
        lease_timeout: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            resource_type: resource_type.into(),
            platform: platform.into(),
            description: None,
            quota,
            tags: Vec::new(),
            lease_timeout_secs: i64::try_from(lease_timeout.as_secs()).unwrap_or(i64::MAX),
            paused: false,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.resource_type.trim().is_empty() {
            return Err(Error::Validation("resource type is not specified".into()));
        }
        if self.quota <= 0 {
            return Err(Error::Validation(format!(
                "resource {} quota must be positive, got {}",
                self.resource_type, self.quota
            )));
        }
        if self.lease_timeout_secs <= 0 {
            return Err(Error::Validation(format!(
                "resource {} lease timeout is not specified",
                self.resource_type
            )));
        }
        Ok(())
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.lease_timeout_secs).unwrap_or(0))
    }

    /// Returns true if the resource carries every requested tag.
    ///
    /// Comparison ignores case; blank requested tags are ignored. A resource
    /// without tags only matches a request without tags.
    pub fn matches_tags<S: AsRef<str>>(&self, requested: &[S]) -> bool {
        requested
            .iter()
            .map(|tag| tag.as_ref().trim())
            .filter(|tag| !tag.is_empty())
            .all(|wanted| self.tags.iter().any(|have| have.trim().eq_ignore_ascii_case(wanted)))
    }

    /// True if the resource is eligible for new leases
    pub fn is_available(&self) -> bool {
        self.active && !self.paused
    }
}

/// One ledger entry against a resource
///
/// Entries are never physically removed; deallocation flips `active` off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResourceUse {
    pub id: Uuid,
    pub job_resource_id: Uuid,
    pub job_request_id: Uuid,
    pub task_execution_id: Uuid,
    pub amount: i32,
    pub active: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobResourceUse {
    /// Creates an active lease on `resource` that expires after its lease timeout
    pub fn new(
        resource: &JobResource,
        job_request_id: Uuid,
        task_execution_id: Uuid,
        amount: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_resource_id: resource.id,
            job_request_id,
            task_execution_id,
            amount,
            active: true,
            expires_at: shift(now, resource.lease_timeout()),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.amount <= 0 {
            return Err(Error::Validation(format!(
                "lease amount must be positive, got {}",
                self.amount
            )));
        }
        if self.job_resource_id.is_nil() {
            return Err(Error::Validation("lease resource id is not specified".into()));
        }
        if self.job_request_id.is_nil() {
            return Err(Error::Validation("lease request id is not specified".into()));
        }
        if self.task_execution_id.is_nil() {
            return Err(Error::Validation("lease task id is not specified".into()));
        }
        if self.expires_at <= self.created_at {
            return Err(Error::Validation("lease expiry must follow its creation".into()));
        }
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}
