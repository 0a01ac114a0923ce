//! Job resource repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colony_core::Result;
use colony_core::domain::{JobResource, JobResourceUse};
use uuid::Uuid;

/// Repository trait for resource pools and their usage ledger
#[async_trait]
pub trait JobResourceRepository: Send + Sync {
    async fn save(&self, resource: &JobResource) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<JobResource>>;

    async fn set_paused(&self, id: Uuid, paused: bool) -> Result<()>;

    /// Soft-deletes a resource; its ledger is kept
    async fn retire(&self, id: Uuid) -> Result<()>;

    /// Records `lease` and returns the quota left on its resource
    ///
    /// The entry is committed only if the active usage of the resource,
    /// including the new entry, stays within quota.
    async fn allocate(&self, lease: &JobResourceUse) -> Result<i64>;

    /// Marks an active ledger entry inactive
    async fn deallocate(&self, use_id: Uuid) -> Result<()>;

    /// Sum of active usage on a resource
    async fn used_quota(&self, resource_id: Uuid) -> Result<i64>;

    /// Active, unpaused resources of a type and platform carrying every tag
    /// in `tags` with at least `amount` quota left
    async fn match_by_tags(
        &self,
        resource_type: &str,
        platform: &str,
        tags: &[String],
        amount: i32,
    ) -> Result<Vec<JobResource>>;

    /// Active ledger entries of a resource
    async fn resource_uses(&self, resource_id: Uuid) -> Result<Vec<JobResourceUse>>;

    /// Marks active entries that expired before `now` inactive, returning
    /// how many were released
    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}
