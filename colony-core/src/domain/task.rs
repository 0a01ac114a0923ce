//! Task definition types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Exit-code targets that name a lifecycle action rather than a task
pub const RESERVED_TARGETS: [&str; 7] = [
    "FATAL",
    "RESTART_JOB",
    "PAUSE_JOB",
    "RESTART_TASK",
    "EXECUTING",
    "FAILED",
    "COMPLETED",
];

/// Returns true if `target` is a lifecycle action or an `ERR_*` code
pub fn is_reserved_target(target: &str) -> bool {
    RESERVED_TARGETS.contains(&target) || target.starts_with("ERR_")
}

/// How a task is carried out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum TaskMethod {
    /// Ordinary execution by a worker
    Execute,
    /// Launches a sub-job of the given type asynchronously
    ForkJob { fork_job_type: String },
    /// Blocks until the sub-jobs launched by the named fork tasks finish
    AwaitForkedJob { await_forked_tasks: Vec<String> },
    /// Waits for a human approval
    Manual,
    /// Synthesized placeholder standing in for a forked sub-job
    ForkedJob,
}

impl TaskMethod {
    pub fn label(&self) -> &'static str {
        match self {
            TaskMethod::Execute => "execute",
            TaskMethod::ForkJob { .. } => "fork_job",
            TaskMethod::AwaitForkedJob { .. } => "await_forked_job",
            TaskMethod::Manual => "manual",
            TaskMethod::ForkedJob => "forked_job",
        }
    }
}

/// One node of a job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_type: String,
    #[serde(flatten)]
    pub method: TaskMethod,
    /// Exit code or state label (upper-cased) to next task type
    #[serde(default)]
    pub on_exit_code: BTreeMap<String, String>,
    /// Fires when no other successor of its predecessor fired
    #[serde(default)]
    pub always_run: bool,
    /// A failure still follows the COMPLETED edge
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TaskDefinition {
    pub fn new(task_type: impl Into<String>, method: TaskMethod) -> Self {
        Self {
            task_type: task_type.into(),
            method,
            on_exit_code: BTreeMap::new(),
            always_run: false,
            allow_failure: false,
            tags: Vec::new(),
        }
    }

    pub fn execute(task_type: impl Into<String>) -> Self {
        Self::new(task_type, TaskMethod::Execute)
    }

    pub fn fork(task_type: impl Into<String>, fork_job_type: impl Into<String>) -> Self {
        Self::new(
            task_type,
            TaskMethod::ForkJob {
                fork_job_type: fork_job_type.into(),
            },
        )
    }

    pub fn await_forked<I, S>(task_type: impl Into<String>, awaited: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            task_type,
            TaskMethod::AwaitForkedJob {
                await_forked_tasks: awaited.into_iter().map(Into::into).collect(),
            },
        )
    }

    /// Placeholder node for a sub-job of `fork_job_type`
    pub fn forked_placeholder(fork_job_type: impl Into<String>) -> Self {
        Self::new(fork_job_type, TaskMethod::ForkedJob)
    }

    /// Adds an edge keyed by exit code or state label
    pub fn add_exit_code(&mut self, code: &str, target: impl Into<String>) {
        self.on_exit_code
            .insert(code.trim().to_ascii_uppercase(), target.into());
    }

    pub fn with_exit_code(mut self, code: &str, target: impl Into<String>) -> Self {
        self.add_exit_code(code, target);
        self
    }

    pub fn with_always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    pub fn with_allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    /// Target for an exit code or state label, matched case-insensitively
    pub fn target_for(&self, code: &str) -> Option<&str> {
        self.on_exit_code
            .get(&code.trim().to_ascii_uppercase())
            .map(String::as_str)
    }

    /// Distinct task types reachable through exit-code edges, in label order
    pub fn next_task_types(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for target in self.on_exit_code.values() {
            if !seen.contains(&target.as_str()) {
                seen.push(target.as_str());
            }
        }
        seen
    }

    pub fn fork_job_type(&self) -> Option<&str> {
        match &self.method {
            TaskMethod::ForkJob { fork_job_type } => Some(fork_job_type),
            _ => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.method, TaskMethod::ForkedJob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_upper_cased() {
        let task = TaskDefinition::execute("check-env")
            .with_exit_code("dev", "deploy-dev")
            .with_exit_code(" Staging ", "deploy-staging");

        assert_eq!(task.target_for("DEV"), Some("deploy-dev"));
        assert_eq!(task.target_for("staging"), Some("deploy-staging"));
        assert_eq!(task.target_for("prod"), None);
    }

    #[test]
    fn test_next_task_types_are_distinct() {
        let task = TaskDefinition::execute("build")
            .with_exit_code("0", "test")
            .with_exit_code("COMPLETED", "test")
            .with_exit_code("FAILED", "cleanup");

        assert_eq!(task.next_task_types(), vec!["test", "cleanup"]);
    }

    #[test]
    fn test_reserved_targets() {
        assert!(is_reserved_target("RESTART_TASK"));
        assert!(is_reserved_target("ERR_TIMEOUT"));
        assert!(!is_reserved_target("deploy"));
    }

    #[test]
    fn test_method_serializes_flat() {
        let task = TaskDefinition::fork("fork-encode", "encode");
        let value = serde_json::to_value(&task).unwrap();

        assert_eq!(value["method"], "fork_job");
        assert_eq!(value["fork_job_type"], "encode");

        let back: TaskDefinition = serde_json::from_value(value).unwrap();
        assert_eq!(back.fork_job_type(), Some("encode"));
    }
}
