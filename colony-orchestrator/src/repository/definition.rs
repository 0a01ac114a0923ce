//! Job definition repository

use async_trait::async_trait;
use colony_core::Result;
use colony_core::domain::JobDefinition;
use uuid::Uuid;

/// Repository trait for published job definitions
#[async_trait]
pub trait JobDefinitionRepository: Send + Sync {
    /// Publishes a definition as the next version of its job type
    ///
    /// Every earlier version of the job type is deactivated in the same unit
    /// of work. Returns the stored definition with its assigned version.
    async fn save(&self, definition: JobDefinition) -> Result<JobDefinition>;

    /// Finds a definition by ID, active or not
    async fn find_by_id(&self, id: Uuid) -> Result<Option<JobDefinition>>;

    /// Finds the active version of a job type
    async fn find_latest(&self, job_type: &str) -> Result<Option<JobDefinition>>;

    /// Enables or disables scheduling of a job type
    async fn set_disabled(&self, job_type: &str, disabled: bool) -> Result<()>;
}
