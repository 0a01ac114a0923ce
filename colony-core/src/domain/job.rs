//! Job definition types

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{TaskDefinition, is_reserved_target};
use crate::error::{Error, Result};

/// Versioned, immutable graph of tasks
///
/// A definition is never edited in place: publishing new content records a
/// new version and deactivates the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: Uuid,
    pub job_type: String,
    pub version: i32,
    pub platform: String,
    pub description: Option<String>,
    /// Disabled definitions are skipped by scheduling queries
    pub disabled: bool,
    /// Only the latest version of a job type is active
    pub active: bool,
    pub tasks: Vec<TaskDefinition>,
    /// Declared parameter defaults
    pub variables: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobDefinition {
    pub fn new(
        job_type: impl Into<String>,
        platform: impl Into<String>,
        tasks: Vec<TaskDefinition>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            version: 0,
            platform: platform.into(),
            description: None,
            disabled: false,
            active: true,
            tasks,
            variables: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn get_task(&self, task_type: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|task| task.task_type == task_type)
    }

    /// Task types reachable from some other task through an exit-code edge
    fn referenced_task_types(&self) -> HashSet<&str> {
        self.tasks
            .iter()
            .flat_map(|task| task.on_exit_code.values())
            .filter(|target| !is_reserved_target(target))
            .map(String::as_str)
            .collect()
    }

    /// Returns the head task: the one task no other task points at.
    ///
    /// # Errors
    /// Returns a validation error when the definition has no tasks, when every
    /// task is referenced, or when more than one task is unreferenced.
    pub fn first_task(&self) -> Result<&TaskDefinition> {
        if let [only] = self.tasks.as_slice() {
            return Ok(only);
        }

        let referenced = self.referenced_task_types();
        let mut heads = self
            .tasks
            .iter()
            .filter(|task| !referenced.contains(task.task_type.as_str()));

        match (heads.next(), heads.next()) {
            (Some(head), None) => Ok(head),
            (None, _) => Err(Error::Validation(format!(
                "job {} has no head task",
                self.job_type
            ))),
            (Some(first), Some(second)) => Err(Error::Validation(format!(
                "job {} has more than one head task: {} and {}",
                self.job_type, first.task_type, second.task_type
            ))),
        }
    }

    /// Last declared task whose edges lead nowhere inside the definition
    pub fn last_task(&self) -> Option<&TaskDefinition> {
        self.tasks.iter().rev().find(|task| {
            task.on_exit_code
                .values()
                .all(|target| self.get_task(target).is_none())
        })
    }

    /// True if requests for this definition may be scheduled
    pub fn is_schedulable(&self) -> bool {
        self.active && !self.disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> JobDefinition {
        JobDefinition::new(
            "video-encode",
            "LINUX",
            vec![
                TaskDefinition::execute("download").with_exit_code("COMPLETED", "encode"),
                TaskDefinition::execute("validate").with_exit_code("COMPLETED", "download"),
                TaskDefinition::execute("encode")
                    .with_exit_code("COMPLETED", "cleanup")
                    .with_exit_code("FAILED", "cleanup"),
                TaskDefinition::execute("cleanup").with_always_run(),
            ],
        )
    }

    #[test]
    fn test_first_task_is_unreferenced_task() {
        let job = pipeline();
        assert_eq!(job.first_task().unwrap().task_type, "validate");
    }

    #[test]
    fn test_single_task_is_head() {
        let job = JobDefinition::new("noop", "LINUX", vec![TaskDefinition::execute("only")]);
        assert_eq!(job.first_task().unwrap().task_type, "only");
    }

    #[test]
    fn test_missing_head_is_validation_error() {
        let empty = JobDefinition::new("empty", "LINUX", vec![]);
        assert!(empty.first_task().unwrap_err().is_validation());

        let cycle = JobDefinition::new(
            "cycle",
            "LINUX",
            vec![
                TaskDefinition::execute("a").with_exit_code("COMPLETED", "b"),
                TaskDefinition::execute("b").with_exit_code("COMPLETED", "a"),
            ],
        );
        assert!(cycle.first_task().unwrap_err().is_validation());
    }

    #[test]
    fn test_two_heads_is_validation_error() {
        let job = JobDefinition::new(
            "split",
            "LINUX",
            vec![
                TaskDefinition::execute("a").with_exit_code("COMPLETED", "c"),
                TaskDefinition::execute("b").with_exit_code("COMPLETED", "c"),
                TaskDefinition::execute("c"),
            ],
        );
        let err = job.first_task().unwrap_err();
        assert!(err.to_string().contains("more than one head"));
    }

    #[test]
    fn test_last_task() {
        assert_eq!(pipeline().last_task().unwrap().task_type, "cleanup");
    }
}
