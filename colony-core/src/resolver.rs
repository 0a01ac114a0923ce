//! Collaborators consulted while building a task graph
//!
//! The graph builder never interprets templates or exit-code rules on its
//! own. It delegates to three narrow traits:
//! - [`DefinitionValidator`]: rejects malformed definitions before a build
//! - [`DynamicTaskResolver`]: substitutes a concrete task for a templated one
//! - [`NextTaskResolver`]: picks the successor that actually ran
//!
//! Each trait has a default implementation used by
//! [`TaskGraphBuilder::default`](crate::graph::TaskGraphBuilder).

use std::collections::{HashMap, HashSet};

use crate::domain::state::RequestState;
use crate::domain::task::{TaskDefinition, TaskMethod, is_reserved_target};
use crate::domain::JobDefinition;
use crate::error::{Error, Result};

/// Variables visible to dynamic task resolution
pub type Environment = HashMap<String, serde_json::Value>;

/// Checks a definition before any graph is built from it
pub trait DefinitionValidator: Send + Sync {
    fn validate(&self, definition: &JobDefinition) -> Result<()>;
}

/// A task definition after template substitution
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTask {
    pub task: TaskDefinition,
    /// Extra options produced by the resolver, surfaced on the graph node
    pub options: HashMap<String, serde_json::Value>,
}

/// Substitutes a concrete task definition for a templated one
pub trait DynamicTaskResolver: Send + Sync {
    fn resolve(
        &self,
        definition: &JobDefinition,
        task_type: &str,
        environment: &Environment,
    ) -> Result<ResolvedTask>;
}

/// Successor chosen by a [`NextTaskResolver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextTask {
    pub task_type: String,
    /// True when the successor was chosen by an explicit exit-code match
    pub decision: bool,
}

/// Decides which task follows `current` given its outcome
pub trait NextTaskResolver: Send + Sync {
    fn next_task(
        &self,
        definition: &JobDefinition,
        current: &TaskDefinition,
        state: RequestState,
        exit_code: Option<&str>,
    ) -> Result<Option<NextTask>>;
}

// ===== Default implementations =====

/// Structural checks on a definition
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralValidator;

impl DefinitionValidator for StructuralValidator {
    fn validate(&self, definition: &JobDefinition) -> Result<()> {
        if definition.job_type.trim().is_empty() {
            return Err(Error::Validation("job type is not specified".into()));
        }
        if definition.tasks.is_empty() {
            return Err(Error::Validation(format!(
                "job {} has no tasks",
                definition.job_type
            )));
        }

        let mut seen = HashSet::new();
        for task in &definition.tasks {
            if task.task_type.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "job {} has a task without a type",
                    definition.job_type
                )));
            }
            if !seen.insert(task.task_type.as_str()) {
                return Err(Error::Validation(format!(
                    "job {} declares task {} twice",
                    definition.job_type, task.task_type
                )));
            }
        }

        for task in &definition.tasks {
            for (code, target) in &task.on_exit_code {
                if definition.get_task(target).is_none() && !is_reserved_target(target) {
                    return Err(Error::Validation(format!(
                        "task {} routes {} to undefined task {}",
                        task.task_type, code, target
                    )));
                }
            }

            match &task.method {
                TaskMethod::ForkJob { fork_job_type } if fork_job_type.trim().is_empty() => {
                    return Err(Error::Validation(format!(
                        "fork task {} has no fork job type",
                        task.task_type
                    )));
                }
                TaskMethod::ForkJob { fork_job_type }
                    if definition.get_task(fork_job_type).is_some() =>
                {
                    return Err(Error::Validation(format!(
                        "fork task {} forks {} which is also a task of job {}",
                        task.task_type, fork_job_type, definition.job_type
                    )));
                }
                TaskMethod::AwaitForkedJob { await_forked_tasks }
                    if await_forked_tasks.is_empty() =>
                {
                    return Err(Error::Validation(format!(
                        "await task {} awaits nothing",
                        task.task_type
                    )));
                }
                TaskMethod::ForkedJob => {
                    return Err(Error::Validation(format!(
                        "task {} uses a synthesized method",
                        task.task_type
                    )));
                }
                _ => {}
            }
        }

        let head = definition.first_task()?;
        if definition.tasks.len() > 1 && head.on_exit_code.is_empty() {
            return Err(Error::Validation(format!(
                "head task {} of job {} leads nowhere",
                head.task_type, definition.job_type
            )));
        }

        Ok(())
    }
}

/// Returns the static definition unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticTaskResolver;

impl DynamicTaskResolver for StaticTaskResolver {
    fn resolve(
        &self,
        definition: &JobDefinition,
        task_type: &str,
        _environment: &Environment,
    ) -> Result<ResolvedTask> {
        let task = definition.get_task(task_type).ok_or_else(|| {
            Error::Resolution(format!(
                "task {} is not defined in job {}",
                task_type, definition.job_type
            ))
        })?;

        Ok(ResolvedTask {
            task: task.clone(),
            options: HashMap::new(),
        })
    }
}

/// Follows exit-code edges, then state edges, then the allow-failure edge
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitCodeResolver;

impl ExitCodeResolver {
    /// Maps a lifecycle target to the edge that handles it
    fn redirect<'a>(current: &'a TaskDefinition, target: &'a str) -> Option<&'a str> {
        match target {
            "PAUSED" | "PAUSE_JOB" => current.target_for("PAUSE_JOB"),
            "COMPLETED" => current.target_for("COMPLETED"),
            "FAILED" | "FATAL" => current.target_for("FAILED"),
            other => Some(other),
        }
    }
}

impl NextTaskResolver for ExitCodeResolver {
    fn next_task(
        &self,
        definition: &JobDefinition,
        current: &TaskDefinition,
        state: RequestState,
        exit_code: Option<&str>,
    ) -> Result<Option<NextTask>> {
        if current.on_exit_code.is_empty() {
            return Ok(None);
        }

        let matched = exit_code
            .filter(|code| !code.trim().is_empty())
            .and_then(|code| current.target_for(code));
        // keep running the same task
        if matched == Some(RequestState::Executing.as_str()) {
            return Ok(Some(NextTask {
                task_type: current.task_type.clone(),
                decision: false,
            }));
        }

        let by_exit_code = matched
            .and_then(|target| Self::redirect(current, target))
            .filter(|target| definition.get_task(target).is_some());
        if let Some(target) = by_exit_code {
            return Ok(Some(NextTask {
                task_type: target.to_string(),
                decision: true,
            }));
        }

        let by_state = current
            .target_for(state.as_str())
            .filter(|target| definition.get_task(target).is_some())
            .or_else(|| {
                (current.allow_failure && state == RequestState::Failed)
                    .then(|| current.target_for("COMPLETED"))
                    .flatten()
                    .filter(|target| definition.get_task(target).is_some())
            });

        Ok(by_state.map(|target| NextTask {
            task_type: target.to_string(),
            decision: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deploy_job() -> JobDefinition {
        JobDefinition::new(
            "deploy",
            "LINUX",
            vec![
                TaskDefinition::execute("check-env")
                    .with_exit_code("dev", "deploy-dev")
                    .with_exit_code("staging", "deploy-staging")
                    .with_exit_code("prod", "deploy-prod")
                    .with_exit_code("FAILED", "notify"),
                TaskDefinition::execute("deploy-dev").with_exit_code("COMPLETED", "notify"),
                TaskDefinition::execute("deploy-staging").with_exit_code("COMPLETED", "notify"),
                TaskDefinition::execute("deploy-prod").with_exit_code("COMPLETED", "notify"),
                TaskDefinition::execute("notify"),
            ],
        )
    }

    #[test]
    fn test_structural_validator_accepts_valid_job() {
        assert!(StructuralValidator.validate(&deploy_job()).is_ok());
    }

    #[test]
    fn test_structural_validator_rejects_bad_jobs() {
        let mut job = deploy_job();
        job.tasks[0].add_exit_code("qa", "deploy-qa");
        assert!(StructuralValidator.validate(&job).unwrap_err().is_validation());

        let mut job = deploy_job();
        job.tasks.push(TaskDefinition::execute("notify"));
        assert!(StructuralValidator.validate(&job).is_err());

        let job = JobDefinition::new(
            "bad-fork",
            "LINUX",
            vec![TaskDefinition::fork("fork", "").with_exit_code("COMPLETED", "RESTART_JOB")],
        );
        assert!(StructuralValidator.validate(&job).is_err());

        let job = JobDefinition::new(
            "self-fork",
            "LINUX",
            vec![
                TaskDefinition::fork("fork", "encode").with_exit_code("COMPLETED", "encode"),
                TaskDefinition::execute("encode"),
            ],
        );
        assert!(StructuralValidator.validate(&job).unwrap_err().is_validation());

        let job = JobDefinition::new(
            "stranded",
            "LINUX",
            vec![TaskDefinition::execute("a"), TaskDefinition::execute("b")],
        );
        assert!(StructuralValidator.validate(&job).is_err());
    }

    #[test]
    fn test_reserved_targets_are_allowed() {
        let job = JobDefinition::new(
            "retrying",
            "LINUX",
            vec![
                TaskDefinition::execute("a")
                    .with_exit_code("COMPLETED", "b")
                    .with_exit_code("1", "RESTART_TASK")
                    .with_exit_code("2", "ERR_FLAKY"),
                TaskDefinition::execute("b"),
            ],
        );
        assert!(StructuralValidator.validate(&job).is_ok());
    }

    #[test]
    fn test_exit_code_match_is_a_decision() {
        let job = deploy_job();
        let check = job.get_task("check-env").unwrap();

        let next = ExitCodeResolver
            .next_task(&job, check, RequestState::Completed, Some("staging"))
            .unwrap()
            .unwrap();
        assert_eq!(next.task_type, "deploy-staging");
        assert!(next.decision);
    }

    #[test]
    fn test_state_edge_when_exit_code_unknown() {
        let job = deploy_job();
        let check = job.get_task("check-env").unwrap();

        let next = ExitCodeResolver
            .next_task(&job, check, RequestState::Failed, Some("qa"))
            .unwrap()
            .unwrap();
        assert_eq!(next.task_type, "notify");
        assert!(!next.decision);

        let none = ExitCodeResolver
            .next_task(&job, check, RequestState::Completed, None)
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_exit_code_naming_lifecycle_target_is_redirected() {
        let job = JobDefinition::new(
            "redirect",
            "LINUX",
            vec![
                TaskDefinition::execute("a")
                    .with_exit_code("3", "FAILED")
                    .with_exit_code("4", "EXECUTING")
                    .with_exit_code("FAILED", "b"),
                TaskDefinition::execute("b"),
            ],
        );
        let a = job.get_task("a").unwrap();

        let failed = ExitCodeResolver
            .next_task(&job, a, RequestState::Completed, Some("3"))
            .unwrap()
            .unwrap();
        assert_eq!(failed.task_type, "b");

        let again = ExitCodeResolver
            .next_task(&job, a, RequestState::Completed, Some("4"))
            .unwrap()
            .unwrap();
        assert_eq!(again.task_type, "a");
        assert!(!again.decision);
    }

    #[test]
    fn test_allow_failure_follows_completed_edge() {
        let job = JobDefinition::new(
            "lenient",
            "LINUX",
            vec![
                TaskDefinition::execute("lint")
                    .with_allow_failure()
                    .with_exit_code("COMPLETED", "build"),
                TaskDefinition::execute("build"),
            ],
        );
        let lint = job.get_task("lint").unwrap();

        let next = ExitCodeResolver
            .next_task(&job, lint, RequestState::Failed, Some("1"))
            .unwrap()
            .unwrap();
        assert_eq!(next.task_type, "build");
    }

    #[test]
    fn test_static_resolver() {
        let job = deploy_job();
        let resolved = StaticTaskResolver
            .resolve(&job, "notify", &Environment::new())
            .unwrap();
        assert_eq!(resolved.task.task_type, "notify");

        let err = StaticTaskResolver
            .resolve(&job, "missing", &Environment::new())
            .unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
    }
}
