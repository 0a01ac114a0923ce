//! Lifecycle states
//!
//! One state vocabulary is shared by job requests, job executions and task
//! executions. States only advance toward a terminal value.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lifecycle state of a job request, job execution or task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Pending,
    Ready,
    Started,
    Executing,
    ManualApprovalRequired,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub const ALL: [RequestState; 9] = [
        RequestState::Pending,
        RequestState::Ready,
        RequestState::Started,
        RequestState::Executing,
        RequestState::ManualApprovalRequired,
        RequestState::Paused,
        RequestState::Completed,
        RequestState::Failed,
        RequestState::Cancelled,
    ];

    /// States with no outgoing edges
    pub const TERMINAL: [RequestState; 3] = [
        RequestState::Completed,
        RequestState::Failed,
        RequestState::Cancelled,
    ];

    /// In-flight states swept back to PENDING once stale
    pub const ORPHAN: [RequestState; 3] = [
        RequestState::Started,
        RequestState::Ready,
        RequestState::Executing,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// True while the record has not yet left the processing phase
    pub fn is_processing(self) -> bool {
        !self.is_terminal()
    }

    pub fn is_orphan_candidate(self) -> bool {
        Self::ORPHAN.contains(&self)
    }

    /// States from which a request may be flipped to READY
    pub fn is_schedulable(self) -> bool {
        matches!(self, RequestState::Pending | RequestState::Paused)
    }

    /// Returns true if `next` is a legal successor of this state.
    ///
    /// Terminal states have no successors. Every non-terminal state may be
    /// cancelled.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;

        if self.is_terminal() {
            return false;
        }
        if next == Cancelled {
            return true;
        }

        match self {
            Pending | Paused | ManualApprovalRequired => matches!(next, Ready | Failed),
            Ready => matches!(next, Started | Failed | Pending | Paused),
            Started => matches!(next, Executing | Failed),
            Executing => matches!(
                next,
                Completed | Failed | Paused | ManualApprovalRequired
            ),
            Completed | Failed | Cancelled => false,
        }
    }

    /// Display color used by presentation layers
    pub fn color(self) -> &'static str {
        match self {
            RequestState::Completed => "darkseagreen4",
            RequestState::Failed | RequestState::Cancelled => "firebrick4",
            RequestState::Executing => "skyblue2",
            _ => "gray",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::Pending => "PENDING",
            RequestState::Ready => "READY",
            RequestState::Started => "STARTED",
            RequestState::Executing => "EXECUTING",
            RequestState::ManualApprovalRequired => "MANUAL_APPROVAL_REQUIRED",
            RequestState::Paused => "PAUSED",
            RequestState::Completed => "COMPLETED",
            RequestState::Failed => "FAILED",
            RequestState::Cancelled => "CANCELLED",
        }
    }

    /// Labels of the terminal states, for store-side guards
    pub fn terminal_labels() -> Vec<String> {
        Self::TERMINAL.iter().map(|s| s.as_str().to_string()).collect()
    }

    /// Labels of the orphan candidate states, for store-side sweeps
    pub fn orphan_labels() -> Vec<String> {
        Self::ORPHAN.iter().map(|s| s.as_str().to_string()).collect()
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Validation(format!("unknown state: {}", s)))
    }
}

/// Side data recorded alongside a state change
///
/// Every field is optional. Stores leave a column untouched when the
/// matching field is `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateChange {
    pub exit_code: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub current_task: Option<String>,
    /// Pushes the next eligible schedule time forward when the new state is
    /// PENDING or PAUSED
    pub schedule_delay: Option<Duration>,
    pub retried: Option<i32>,
    pub cost_secs: Option<f64>,
}

impl StateChange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit_code(mut self, exit_code: impl Into<String>) -> Self {
        self.exit_code = Some(exit_code.into());
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }

    pub fn with_current_task(mut self, task_type: impl Into<String>) -> Self {
        self.current_task = Some(task_type.into());
        self
    }

    pub fn with_schedule_delay(mut self, delay: Duration) -> Self {
        self.schedule_delay = Some(delay);
        self
    }

    pub fn with_retried(mut self, retried: i32) -> Self {
        self.retried = Some(retried);
        self
    }

    pub fn with_cost(mut self, cost_secs: f64) -> Self {
        self.cost_secs = Some(cost_secs);
        self
    }

    /// New schedule time implied by this change, if any
    pub fn rescheduled_at(&self, new_state: RequestState, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !new_state.is_schedulable() {
            return None;
        }
        self.schedule_delay.map(|delay| shift(now, delay))
    }
}

/// Adds a std duration to a timestamp, saturating at the latest representable time
pub fn shift(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
