//! Task graph builder
//!
//! Walks a job definition depth-first from its head task. All traversal
//! state lives in a [`Walk`] owned by one `build` call, so builds for
//! different jobs can run concurrently on a shared builder.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use super::{Edge, EdgeKind, IDLE_COLOR, Node, TaskGraph};
use crate::domain::state::RequestState;
use crate::domain::task::{TaskDefinition, TaskMethod};
use crate::domain::{JobDefinition, JobExecution, TaskExecution};
use crate::error::Result;
use crate::resolver::{
    DefinitionValidator, DynamicTaskResolver, Environment, ExitCodeResolver, NextTask,
    NextTaskResolver, ResolvedTask, StaticTaskResolver, StructuralValidator,
};

/// Builds [`TaskGraph`]s from definitions and execution snapshots
#[derive(Clone)]
pub struct TaskGraphBuilder {
    validator: Arc<dyn DefinitionValidator>,
    task_resolver: Arc<dyn DynamicTaskResolver>,
    next_resolver: Arc<dyn NextTaskResolver>,
}

impl Default for TaskGraphBuilder {
    fn default() -> Self {
        Self::new(
            Arc::new(StructuralValidator),
            Arc::new(StaticTaskResolver),
            Arc::new(ExitCodeResolver),
        )
    }
}

impl TaskGraphBuilder {
    pub fn new(
        validator: Arc<dyn DefinitionValidator>,
        task_resolver: Arc<dyn DynamicTaskResolver>,
        next_resolver: Arc<dyn NextTaskResolver>,
    ) -> Self {
        Self {
            validator,
            task_resolver,
            next_resolver,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn DefinitionValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_task_resolver(mut self, task_resolver: Arc<dyn DynamicTaskResolver>) -> Self {
        self.task_resolver = task_resolver;
        self
    }

    pub fn with_next_resolver(mut self, next_resolver: Arc<dyn NextTaskResolver>) -> Self {
        self.next_resolver = next_resolver;
        self
    }

    /// Builds the reachable graph of `definition`, overlaid with `execution`.
    ///
    /// # Errors
    /// Returns a validation error when the definition is rejected by the
    /// validator or has no head task. Task resolution failures never abort
    /// the build; the static task definition is used instead.
    pub fn build(
        &self,
        definition: &JobDefinition,
        execution: Option<&JobExecution>,
    ) -> Result<TaskGraph> {
        self.validator.validate(definition)?;
        let head = definition.first_task()?;

        let mut walk = Walk {
            builder: self,
            definition,
            execution,
            environment: environment(definition, execution),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            edge_index: HashMap::new(),
            expanded: HashSet::new(),
        };
        walk.nodes
            .insert(head.task_type.clone(), Node::new(head.clone()));
        walk.expand(&head.task_type);

        debug!(
            "Built graph for job {} v{}: {} nodes, {} edges",
            definition.job_type,
            definition.version,
            walk.nodes.len(),
            walk.edges.len()
        );

        Ok(TaskGraph {
            root: head.task_type.clone(),
            nodes: walk.nodes,
            edges: walk.edges,
        })
    }
}

/// Parameter defaults, synthetic retry placeholders and execution context
fn environment(definition: &JobDefinition, execution: Option<&JobExecution>) -> Environment {
    let mut env = definition.variables.clone();
    for placeholder in ["job_retry", "task_retry", "nonce", "job_elapsed_secs"] {
        env.insert(placeholder.to_string(), serde_json::Value::from(0));
    }
    if let Some(execution) = execution {
        env.extend(
            execution
                .contexts
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
    }
    env
}

/// Number of distinct successors reached through exit-code labels
fn branch_count(definition: &JobDefinition, task: &TaskDefinition) -> usize {
    let mut targets: Vec<&str> = task
        .on_exit_code
        .iter()
        .filter(|(label, _)| label.parse::<RequestState>().is_err())
        .filter(|(_, target)| definition.get_task(target).is_some())
        .map(|(_, target)| target.as_str())
        .collect();
    targets.sort_unstable();
    targets.dedup();
    targets.len()
}

struct Walk<'a> {
    builder: &'a TaskGraphBuilder,
    definition: &'a JobDefinition,
    execution: Option<&'a JobExecution>,
    environment: Environment,
    nodes: BTreeMap<String, Node>,
    edges: Vec<Edge>,
    /// (from, to) to position in `edges`
    edge_index: HashMap<(String, String), usize>,
    expanded: HashSet<String>,
}

impl<'a> Walk<'a> {
    fn expand(&mut self, name: &str) {
        if !self.expanded.insert(name.to_string()) {
            return;
        }
        let definition = self.definition;
        let Some(declared) = definition.get_task(name) else {
            return;
        };

        let resolved = self.resolve(declared);
        let record = self.execution.and_then(|execution| execution.task_by_type(name));

        let node = self
            .nodes
            .entry(name.to_string())
            .or_insert_with(|| Node::new(declared.clone()));
        node.task = resolved.task.clone();
        node.options = resolved.options;
        if let Some(record) = record {
            node.apply_state(record.task_state);
            node.exit_code = record.exit_code.clone();
        }

        let task = resolved.task;
        match &task.method {
            TaskMethod::ForkJob { fork_job_type } => self.link_fork(name, fork_job_type, record),
            TaskMethod::AwaitForkedJob { await_forked_tasks } => {
                self.link_await(name, await_forked_tasks, record)
            }
            TaskMethod::Execute | TaskMethod::Manual | TaskMethod::ForkedJob => {}
        }

        for child in self.link_exit_codes(name, &task, record) {
            self.expand(&child);
        }
    }

    fn resolve(&self, declared: &TaskDefinition) -> ResolvedTask {
        match self.builder.task_resolver.resolve(
            self.definition,
            &declared.task_type,
            &self.environment,
        ) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(
                    "Task {} of job {} keeps its static definition: {}",
                    declared.task_type, self.definition.job_type, err
                );
                ResolvedTask {
                    task: declared.clone(),
                    options: HashMap::new(),
                }
            }
        }
    }

    fn link_fork(&mut self, name: &str, fork_job_type: &str, record: Option<&TaskExecution>) {
        self.placeholder(fork_job_type);
        let bold = record.is_some_and(|record| record.task_state.is_terminal());
        self.add_edge(name, fork_job_type, "fork", bold, EdgeKind::Fork);
    }

    /// Links the placeholders of awaited forks visited earlier in this walk
    fn link_await(&mut self, name: &str, awaited: &[String], record: Option<&TaskExecution>) {
        for awaited_task in awaited {
            if !self.expanded.contains(awaited_task) {
                debug!(
                    "Task {} awaits {} which was not visited yet",
                    name, awaited_task
                );
                continue;
            }
            let Some(fork_job_type) = self
                .nodes
                .get(awaited_task)
                .and_then(|node| node.task.fork_job_type())
                .map(str::to_string)
            else {
                continue;
            };

            let placeholder = self.placeholder(&fork_job_type);
            let bold = match record {
                Some(record) => {
                    placeholder.apply_state(record.task_state);
                    record.task_state.is_terminal()
                }
                None => false,
            };
            self.add_edge(name, &fork_job_type, "await", bold, EdgeKind::Await);
        }
    }

    /// Adds exit-code edges and returns the successors still to expand
    fn link_exit_codes(
        &mut self,
        name: &str,
        task: &TaskDefinition,
        record: Option<&TaskExecution>,
    ) -> Vec<String> {
        let definition = self.definition;
        let next = record.and_then(|record| self.next_task(task, record));

        let decision =
            next.as_ref().is_some_and(|next| next.decision) || branch_count(definition, task) > 1;
        if let Some(node) = self.nodes.get_mut(name) {
            node.decision = decision;
        }

        let mut pending = Vec::new();
        for (label, target) in &task.on_exit_code {
            let Some(target_task) = definition.get_task(target) else {
                // lifecycle action such as RESTART_TASK
                continue;
            };

            let mut edge_label = label.clone();
            let bold = match (&next, record) {
                (Some(next), _) => next.task_type == *target,
                (None, Some(record)) if target_task.always_run && !self.fired_past(target_task) => {
                    edge_label = record.outcome_label();
                    true
                }
                _ => false,
            };

            self.nodes
                .entry(target.clone())
                .or_insert_with(|| Node::new(target_task.clone()));
            self.add_edge(name, target, &edge_label, bold, EdgeKind::ExitCode);

            if !self.expanded.contains(target) && !pending.contains(target) {
                pending.push(target.clone());
            }
        }
        pending
    }

    fn next_task(&self, task: &TaskDefinition, record: &TaskExecution) -> Option<NextTask> {
        match self.builder.next_resolver.next_task(
            self.definition,
            task,
            record.task_state,
            record.exit_code.as_deref(),
        ) {
            Ok(next) => next,
            Err(err) => {
                warn!(
                    "Could not resolve successor of task {} in job {}: {}",
                    task.task_type, self.definition.job_type, err
                );
                None
            }
        }
    }

    /// True if a successor of `task` already has an execution record
    fn fired_past(&self, task: &TaskDefinition) -> bool {
        self.execution.is_some_and(|execution| {
            task.on_exit_code
                .values()
                .any(|successor| execution.task_by_type(successor).is_some())
        })
    }

    fn placeholder(&mut self, fork_job_type: &str) -> &mut Node {
        self.nodes
            .entry(fork_job_type.to_string())
            .or_insert_with(|| Node::new(TaskDefinition::forked_placeholder(fork_job_type)))
    }

    /// Records an edge once per (from, to) pair; a repeat can only promote it to bold
    fn add_edge(&mut self, from: &str, to: &str, label: &str, bold: bool, kind: EdgeKind) {
        let color = if bold {
            self.nodes
                .get(from)
                .map(|node| node.color.clone())
                .unwrap_or_else(|| IDLE_COLOR.to_string())
        } else {
            IDLE_COLOR.to_string()
        };

        let key = (from.to_string(), to.to_string());
        if let Some(&index) = self.edge_index.get(&key) {
            let edge = &mut self.edges[index];
            if bold && !edge.bold {
                edge.bold = true;
                edge.label = label.to_string();
                edge.color = color;
            }
            return;
        }

        self.edge_index.insert(key, self.edges.len());
        self.edges.push(Edge {
            from: from.to_string(),
            to: to.to_string(),
            label: label.to_string(),
            color: color.clone(),
            bold,
            kind,
        });

        if let Some(parent) = self.nodes.get_mut(from) {
            parent.children.push(to.to_string());
        }
        if let Some(child) = self.nodes.get_mut(to) {
            if child.arrow_label.is_none() {
                child.arrow_label = Some(label.to_string());
                child.arrow_color = Some(color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use proptest::prelude::*;

    fn record(
        execution: &mut JobExecution,
        task_type: &str,
        state: RequestState,
        exit_code: Option<&str>,
    ) {
        let mut task = TaskExecution::new(execution.id, task_type).with_state(state);
        task.exit_code = exit_code.map(str::to_string);
        execution.tasks.push(task);
    }

    fn execution(job: &JobDefinition) -> JobExecution {
        let request = crate::domain::JobRequest::new(job);
        JobExecution::new(&request)
    }

    fn encode_job() -> JobDefinition {
        JobDefinition::new(
            "media",
            "LINUX",
            vec![
                TaskDefinition::execute("validate").with_exit_code("COMPLETED", "download"),
                TaskDefinition::execute("download").with_exit_code("COMPLETED", "split"),
                TaskDefinition::execute("split").with_exit_code("COMPLETED", "fork-encode"),
                TaskDefinition::fork("fork-encode", "encode").with_exit_code("COMPLETED", "fork-await"),
                TaskDefinition::await_forked("fork-await", ["fork-encode"]),
            ],
        )
    }

    fn deploy_job() -> JobDefinition {
        JobDefinition::new(
            "deploy",
            "LINUX",
            vec![
                TaskDefinition::execute("check-env")
                    .with_exit_code("dev", "deploy-dev")
                    .with_exit_code("staging", "deploy-staging")
                    .with_exit_code("prod", "deploy-prod"),
                TaskDefinition::execute("deploy-dev"),
                TaskDefinition::execute("deploy-staging"),
                TaskDefinition::execute("deploy-prod"),
            ],
        )
    }

    #[test]
    fn test_fork_await_snapshot() {
        let job = encode_job();
        let mut snapshot = execution(&job);
        for task in ["validate", "download", "split", "fork-encode"] {
            record(&mut snapshot, task, RequestState::Completed, None);
        }
        record(&mut snapshot, "fork-await", RequestState::Executing, None);

        let graph = TaskGraphBuilder::default().build(&job, Some(&snapshot)).unwrap();

        assert_eq!(graph.root_name(), "validate");
        for (from, to) in [
            ("validate", "download"),
            ("download", "split"),
            ("split", "fork-encode"),
        ] {
            assert!(graph.edge(from, to).unwrap().bold, "{} -> {}", from, to);
        }

        let fork = graph.node("fork-encode").unwrap();
        assert_eq!(fork.children, vec!["encode", "fork-await"]);
        let fork_edge = graph.edge("fork-encode", "encode").unwrap();
        assert_eq!(fork_edge.kind, EdgeKind::Fork);
        assert!(fork_edge.bold);

        let placeholder = graph.node("encode").unwrap();
        assert!(placeholder.task.is_placeholder());
        assert_eq!(placeholder.state, Some(RequestState::Executing));
        assert!(!placeholder.bold);

        assert!(graph.node("split").unwrap().bold);
        assert!(!graph.node("fork-await").unwrap().bold);

        let await_edge = graph.edge("fork-await", "encode").unwrap();
        assert_eq!(await_edge.kind, EdgeKind::Await);
        assert_eq!(await_edge.label, "await");
        assert!(!await_edge.bold);
        assert_eq!(graph.node("fork-await").unwrap().children, vec!["encode"]);
        assert_eq!(graph.nodes().len(), 6);
    }

    #[test]
    fn test_await_edge_bold_once_awaiting_task_finished() {
        let job = encode_job();
        let mut snapshot = execution(&job);
        for task in ["validate", "download", "split", "fork-encode", "fork-await"] {
            record(&mut snapshot, task, RequestState::Completed, None);
        }

        let graph = TaskGraphBuilder::default().build(&job, Some(&snapshot)).unwrap();

        assert!(graph.edge("fork-await", "encode").unwrap().bold);
        let placeholder = graph.node("encode").unwrap();
        assert!(placeholder.is_settled());
        assert!(placeholder.bold);
    }

    #[test]
    fn test_await_without_visited_fork_has_no_placeholder() {
        let job = JobDefinition::new(
            "orphan-await",
            "LINUX",
            vec![
                TaskDefinition::execute("start").with_exit_code("COMPLETED", "wait"),
                TaskDefinition::await_forked("wait", ["never-forked"]),
            ],
        );

        let graph = TaskGraphBuilder::default().build(&job, None).unwrap();

        assert!(graph.node("wait").unwrap().children.is_empty());
        assert_eq!(graph.edges().len(), 1);
    }

    #[test]
    fn test_decision_branch_follows_exit_code() {
        let job = deploy_job();
        let mut snapshot = execution(&job);
        record(&mut snapshot, "check-env", RequestState::Completed, Some("staging"));

        let graph = TaskGraphBuilder::default().build(&job, Some(&snapshot)).unwrap();

        assert!(graph.node("check-env").unwrap().decision);
        assert!(graph.edge("check-env", "deploy-staging").unwrap().bold);
        assert!(!graph.edge("check-env", "deploy-dev").unwrap().bold);
        assert!(!graph.edge("check-env", "deploy-prod").unwrap().bold);
    }

    #[test]
    fn test_branching_task_is_decision_without_snapshot() {
        let graph = TaskGraphBuilder::default().build(&deploy_job(), None).unwrap();

        assert!(graph.node("check-env").unwrap().decision);
        assert_eq!(graph.bold_edges().count(), 0);
        assert!(graph.nodes().values().all(|node| !node.bold));
    }

    fn cleanup_job() -> JobDefinition {
        JobDefinition::new(
            "with-cleanup",
            "LINUX",
            vec![
                TaskDefinition::execute("build")
                    .with_exit_code("0", "test")
                    .with_exit_code("1", "cleanup"),
                TaskDefinition::execute("test").with_exit_code("COMPLETED", "cleanup"),
                TaskDefinition::execute("cleanup")
                    .with_always_run()
                    .with_exit_code("COMPLETED", "report"),
                TaskDefinition::execute("report"),
            ],
        )
    }

    #[test]
    fn test_always_run_fallback_is_bold_and_relabelled() {
        let job = cleanup_job();
        let mut snapshot = execution(&job);
        record(&mut snapshot, "build", RequestState::Failed, Some("137"));

        let graph = TaskGraphBuilder::default().build(&job, Some(&snapshot)).unwrap();

        let edge = graph.edge("build", "cleanup").unwrap();
        assert!(edge.bold);
        assert_eq!(edge.label, "137");
        assert!(!graph.edge("build", "test").unwrap().bold);
    }

    #[test]
    fn test_always_run_fallback_relabels_with_state_without_exit_code() {
        let job = cleanup_job();
        let mut snapshot = execution(&job);
        record(&mut snapshot, "build", RequestState::Cancelled, None);

        let graph = TaskGraphBuilder::default().build(&job, Some(&snapshot)).unwrap();

        assert_eq!(graph.edge("build", "cleanup").unwrap().label, "CANCELLED");
    }

    #[test]
    fn test_always_run_fallback_suppressed_once_fired() {
        let job = cleanup_job();
        let mut snapshot = execution(&job);
        record(&mut snapshot, "build", RequestState::Failed, Some("137"));
        record(&mut snapshot, "cleanup", RequestState::Completed, None);
        record(&mut snapshot, "report", RequestState::Executing, None);

        let graph = TaskGraphBuilder::default().build(&job, Some(&snapshot)).unwrap();

        let edge = graph.edge("build", "cleanup").unwrap();
        assert!(!edge.bold);
        assert_eq!(edge.label, "1");
    }

    #[test]
    fn test_convergent_edges_rendered_once() {
        let job = JobDefinition::new(
            "converge",
            "LINUX",
            vec![
                TaskDefinition::execute("a")
                    .with_exit_code("0", "b")
                    .with_exit_code("COMPLETED", "b")
                    .with_exit_code("FAILED", "cleanup"),
                TaskDefinition::execute("b")
                    .with_exit_code("COMPLETED", "cleanup")
                    .with_exit_code("FAILED", "cleanup"),
                TaskDefinition::execute("cleanup").with_always_run(),
            ],
        );
        let mut snapshot = execution(&job);
        record(&mut snapshot, "a", RequestState::Completed, Some("0"));

        let graph = TaskGraphBuilder::default().build(&job, Some(&snapshot)).unwrap();

        assert_eq!(graph.edges().len(), 3);
        assert_eq!(graph.node("a").unwrap().children, vec!["b", "cleanup"]);
        assert!(graph.edge("a", "b").unwrap().bold);
        assert_eq!(graph.node("b").unwrap().children, vec!["cleanup"]);
    }

    #[test]
    fn test_missing_head_fails_build() {
        let job = JobDefinition::new(
            "loop",
            "LINUX",
            vec![
                TaskDefinition::execute("a").with_exit_code("COMPLETED", "b"),
                TaskDefinition::execute("b").with_exit_code("COMPLETED", "a"),
            ],
        );

        let err = TaskGraphBuilder::default().build(&job, None).unwrap_err();
        assert!(err.is_validation());
    }

    struct FailingResolver;

    impl DynamicTaskResolver for FailingResolver {
        fn resolve(&self, _: &JobDefinition, task_type: &str, _: &Environment) -> Result<ResolvedTask> {
            Err(Error::Resolution(format!("template for {} did not render", task_type)))
        }
    }

    #[test]
    fn test_resolution_failure_keeps_static_definition() {
        let builder = TaskGraphBuilder::default().with_task_resolver(Arc::new(FailingResolver));

        let graph = builder.build(&encode_job(), None).unwrap();

        assert_eq!(graph.nodes().len(), 6);
        assert_eq!(
            graph.node("fork-encode").unwrap().task.fork_job_type(),
            Some("encode")
        );
    }

    /// Reroutes `download` according to the `mirror` job variable
    struct MirrorResolver;

    impl DynamicTaskResolver for MirrorResolver {
        fn resolve(
            &self,
            definition: &JobDefinition,
            task_type: &str,
            environment: &Environment,
        ) -> Result<ResolvedTask> {
            let mut resolved = StaticTaskResolver.resolve(definition, task_type, environment)?;
            if task_type == "download" {
                if let Some(mirror) = environment.get("mirror").and_then(|v| v.as_str()) {
                    resolved.options.insert("mirror".into(), mirror.into());
                }
                assert_eq!(environment.get("job_retry"), Some(&serde_json::Value::from(0)));
            }
            Ok(resolved)
        }
    }

    #[test]
    fn test_resolver_sees_merged_environment() {
        let job = encode_job().with_variable("mirror", "eu-west".into());
        let mut snapshot = execution(&job).with_context("mirror", "us-east".into());
        record(&mut snapshot, "validate", RequestState::Completed, None);

        let graph = TaskGraphBuilder::default()
            .with_task_resolver(Arc::new(MirrorResolver))
            .build(&job, Some(&snapshot))
            .unwrap();

        assert_eq!(
            graph.node("download").unwrap().options.get("mirror"),
            Some(&serde_json::Value::from("us-east"))
        );
    }

    struct RejectAll;

    impl DefinitionValidator for RejectAll {
        fn validate(&self, definition: &JobDefinition) -> Result<()> {
            Err(Error::Validation(format!("{} is frozen", definition.job_type)))
        }
    }

    #[test]
    fn test_validator_runs_before_build() {
        let builder = TaskGraphBuilder::default().with_validator(Arc::new(RejectAll));
        assert!(builder.build(&deploy_job(), None).unwrap_err().is_validation());
    }

    // Forward-only edges keep generated definitions acyclic with a single head.
    fn chain_job_strategy(max_tasks: usize) -> impl Strategy<Value = (JobDefinition, Vec<u8>)> {
        (2..=max_tasks).prop_flat_map(|count| {
            let edges = proptest::collection::vec(
                proptest::collection::vec((0..4usize, any::<usize>()), 0..4),
                count,
            );
            let states = proptest::collection::vec(0..4u8, count);
            (edges, states).prop_map(move |(raw_edges, states)| {
                let labels = ["FAILED", "0", "1", "2"];
                let tasks = (0..count)
                    .map(|i| {
                        let mut task = TaskDefinition::execute(format!("task_{}", i));
                        if i + 1 < count {
                            task.add_exit_code("COMPLETED", format!("task_{}", i + 1));
                            for (label, target) in &raw_edges[i] {
                                let target = i + 1 + target % (count - i - 1);
                                task.add_exit_code(labels[*label], format!("task_{}", target));
                            }
                        }
                        if i % 3 == 2 {
                            task.always_run = true;
                        }
                        task
                    })
                    .collect();
                (JobDefinition::new("generated", "LINUX", tasks), states)
            })
        })
    }

    proptest! {
        #[test]
        fn test_edges_rendered_at_most_once((job, states) in chain_job_strategy(8)) {
            let mut snapshot = execution(&job);
            for (task, state) in job.tasks.iter().zip(states) {
                let state = match state {
                    0 => continue,
                    1 => RequestState::Completed,
                    2 => RequestState::Failed,
                    _ => RequestState::Executing,
                };
                record(&mut snapshot, &task.task_type, state, Some("0"));
            }

            let graph = TaskGraphBuilder::default().build(&job, Some(&snapshot)).unwrap();

            let mut seen = HashSet::new();
            for edge in graph.edges() {
                prop_assert!(seen.insert((edge.from.clone(), edge.to.clone())));
                prop_assert!(graph.node(&edge.from).is_some());
                prop_assert!(graph.node(&edge.to).is_some());
            }
            prop_assert_eq!(graph.nodes().len(), job.tasks.len());
        }
    }
}
