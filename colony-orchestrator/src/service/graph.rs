//! Task graph service
//!
//! Loads the definition and, when available, the execution snapshot of a
//! job, then hands both to the [`TaskGraphBuilder`].

use std::sync::Arc;

use colony_core::domain::{JobDefinition, JobExecution};
use colony_core::graph::{TaskGraph, TaskGraphBuilder};
use colony_core::{Error, Result};
use tracing::debug;
use uuid::Uuid;

use crate::repository::{JobDefinitionRepository, JobExecutionRepository, JobRequestRepository};

/// Builds task graphs from stored definitions and executions
#[derive(Clone)]
pub struct GraphService {
    definitions: Arc<dyn JobDefinitionRepository>,
    requests: Arc<dyn JobRequestRepository>,
    executions: Arc<dyn JobExecutionRepository>,
    builder: TaskGraphBuilder,
}

impl GraphService {
    pub fn new(
        definitions: Arc<dyn JobDefinitionRepository>,
        requests: Arc<dyn JobRequestRepository>,
        executions: Arc<dyn JobExecutionRepository>,
    ) -> Self {
        Self {
            definitions,
            requests,
            executions,
            builder: TaskGraphBuilder::default(),
        }
    }

    /// Builds a service over a single store implementing all repositories
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: JobDefinitionRepository + JobRequestRepository + JobExecutionRepository + 'static,
    {
        Self::new(store.clone(), store.clone(), store)
    }

    /// Replaces the default builder, e.g. to plug in other resolvers
    pub fn with_builder(mut self, builder: TaskGraphBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Graph of the active definition of `job_type`, overlaid with the
    /// execution `job_execution_id` when given
    pub async fn build_for_type(
        &self,
        job_type: &str,
        job_execution_id: Option<Uuid>,
    ) -> Result<TaskGraph> {
        let definition = self
            .definitions
            .find_latest(job_type)
            .await?
            .ok_or_else(|| Error::Conflict(format!("job definition {} not found", job_type)))?;

        let execution = match job_execution_id {
            Some(id) => Some(self.load_execution(id).await?),
            None => None,
        };

        self.build(&definition, execution.as_ref())
    }

    /// Graph of the definition version a request was created from, overlaid
    /// with its current execution
    pub async fn build_for_request(&self, job_request_id: Uuid) -> Result<TaskGraph> {
        let request = self
            .requests
            .get(job_request_id)
            .await?
            .ok_or_else(|| {
                Error::Conflict(format!("job request {} not found", job_request_id))
            })?;

        let definition = self
            .definitions
            .find_by_id(request.job_definition_id)
            .await?
            .ok_or_else(|| {
                Error::Conflict(format!(
                    "job definition {} of request {} not found",
                    request.job_definition_id, job_request_id
                ))
            })?;

        let execution = match request.job_execution_id {
            Some(id) => Some(self.load_execution(id).await?),
            None => None,
        };

        self.build(&definition, execution.as_ref())
    }

    async fn load_execution(&self, id: Uuid) -> Result<JobExecution> {
        self.executions
            .get(id)
            .await?
            .ok_or_else(|| Error::Conflict(format!("job execution {} not found", id)))
    }

    fn build(
        &self,
        definition: &JobDefinition,
        execution: Option<&JobExecution>,
    ) -> Result<TaskGraph> {
        debug!(
            "Building graph for job {} v{} (snapshot: {})",
            definition.job_type,
            definition.version,
            execution.is_some()
        );
        self.builder.build(definition, execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colony_core::domain::{JobRequest, RequestState, TaskDefinition, TaskExecution};

    use crate::repository::MemoryStore;

    fn release_job() -> JobDefinition {
        JobDefinition::new(
            "release",
            "LINUX",
            vec![
                TaskDefinition::execute("build").with_exit_code("COMPLETED", "publish"),
                TaskDefinition::execute("publish"),
            ],
        )
    }

    #[tokio::test]
    async fn test_build_for_type_without_snapshot() {
        let store = Arc::new(MemoryStore::new());
        JobDefinitionRepository::save(store.as_ref(), release_job())
            .await
            .unwrap();
        let service = GraphService::from_store(store);

        let graph = service.build_for_type("release", None).await.unwrap();

        assert_eq!(graph.root_name(), "build");
        assert!(!graph.edge("build", "publish").unwrap().bold);
    }

    #[tokio::test]
    async fn test_build_for_request_overlays_execution() {
        let store = Arc::new(MemoryStore::new());
        let definition = JobDefinitionRepository::save(store.as_ref(), release_job())
            .await
            .unwrap();
        let request = JobRequest::new(&definition);
        JobRequestRepository::save(store.as_ref(), &request)
            .await
            .unwrap();
        let execution = JobExecution::new(&request);
        JobExecutionRepository::save(store.as_ref(), &execution)
            .await
            .unwrap();
        JobRequestRepository::set_ready_to_execute(store.as_ref(), request.id, execution.id)
            .await
            .unwrap();
        JobExecutionRepository::save_task(
            store.as_ref(),
            &TaskExecution::new(execution.id, "build").with_state(RequestState::Completed),
        )
        .await
        .unwrap();

        // a newer version does not change the graph of an existing request
        JobDefinitionRepository::save(
            store.as_ref(),
            JobDefinition::new("release", "LINUX", vec![TaskDefinition::execute("only")]),
        )
        .await
        .unwrap();

        let service = GraphService::from_store(store);
        let graph = service.build_for_request(request.id).await.unwrap();

        assert_eq!(graph.root_name(), "build");
        assert_eq!(
            graph.node("build").unwrap().state,
            Some(RequestState::Completed)
        );
        assert!(graph.edge("build", "publish").unwrap().bold);
    }

    #[tokio::test]
    async fn test_missing_records_are_conflicts() {
        let store = Arc::new(MemoryStore::new());
        JobDefinitionRepository::save(store.as_ref(), release_job())
            .await
            .unwrap();
        let service = GraphService::from_store(store);

        assert!(
            service
                .build_for_type("unknown", None)
                .await
                .unwrap_err()
                .is_conflict()
        );
        assert!(
            service
                .build_for_type("release", Some(Uuid::new_v4()))
                .await
                .unwrap_err()
                .is_conflict()
        );
        assert!(
            service
                .build_for_request(Uuid::new_v4())
                .await
                .unwrap_err()
                .is_conflict()
        );
    }
}
