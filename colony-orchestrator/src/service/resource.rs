//! Resource allocation service
//!
//! Arbitrates the capacity of resource pools. Usage is only ever changed
//! through [`ResourceAllocator::allocate`] and
//! [`ResourceAllocator::deallocate`], so the committed usage of a resource
//! never exceeds its quota.

use std::sync::Arc;

use chrono::Utc;
use colony_core::domain::{JobResource, JobResourceUse};
use colony_core::Result;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::repository::JobResourceRepository;

/// A lease granted by [`ResourceAllocator::lease`]
#[derive(Debug, Clone)]
pub struct GrantedLease {
    pub lease: JobResourceUse,
    pub resource: JobResource,
    /// Quota left on the resource once the lease was committed
    pub remaining: i64,
}

/// Allocates and releases capacity on job resources
#[derive(Clone)]
pub struct ResourceAllocator {
    resources: Arc<dyn JobResourceRepository>,
}

impl ResourceAllocator {
    pub fn new(resources: Arc<dyn JobResourceRepository>) -> Self {
        Self { resources }
    }

    /// Validates and stores a new resource pool
    pub async fn register(&self, resource: &JobResource) -> Result<()> {
        resource.validate()?;
        self.resources.save(resource).await?;
        info!(
            "Registered {} resource {} on {} (quota: {})",
            resource.resource_type, resource.id, resource.platform, resource.quota
        );
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<JobResource>> {
        self.resources.get(id).await
    }

    pub async fn set_paused(&self, id: Uuid, paused: bool) -> Result<()> {
        self.resources.set_paused(id, paused).await?;
        info!("Resource {} paused: {}", id, paused);
        Ok(())
    }

    /// Takes a resource out of service; its ledger is kept
    pub async fn retire(&self, id: Uuid) -> Result<()> {
        self.resources.retire(id).await?;
        info!("Resource {} retired", id);
        Ok(())
    }

    /// Records `lease` against its resource and returns the quota left
    ///
    /// # Errors
    /// Quota exceeded when the lease would push active usage past the quota;
    /// nothing is recorded in that case.
    pub async fn allocate(&self, lease: &JobResourceUse) -> Result<i64> {
        lease.validate()?;
        match self.resources.allocate(lease).await {
            Ok(remaining) => {
                info!(
                    "Allocated {} on resource {} for request {} ({} left)",
                    lease.amount, lease.job_resource_id, lease.job_request_id, remaining
                );
                Ok(remaining)
            }
            Err(e) => {
                if e.is_quota_exceeded() {
                    debug!("Allocation rejected: {}", e);
                } else if e.is_conflict() {
                    warn!("Allocation on resource {} failed: {}", lease.job_resource_id, e);
                }
                Err(e)
            }
        }
    }

    /// Releases an active lease
    pub async fn deallocate(&self, use_id: Uuid) -> Result<()> {
        self.resources.deallocate(use_id).await?;
        info!("Released resource use {}", use_id);
        Ok(())
    }

    pub async fn used_quota(&self, resource_id: Uuid) -> Result<i64> {
        self.resources.used_quota(resource_id).await
    }

    /// Available resources of a type and platform carrying all `tags`, with
    /// at least `amount` quota left
    pub async fn match_by_tags(
        &self,
        resource_type: &str,
        platform: &str,
        tags: &[String],
        amount: i32,
    ) -> Result<Vec<JobResource>> {
        self.resources
            .match_by_tags(resource_type, platform, tags, amount)
            .await
    }

    /// Allocates `amount` on the first matching resource that accepts it
    ///
    /// Candidates that fill up between matching and allocating are skipped.
    /// Returns `None` when no resource has room.
    pub async fn lease(
        &self,
        resource_type: &str,
        platform: &str,
        tags: &[String],
        amount: i32,
        job_request_id: Uuid,
        task_execution_id: Uuid,
    ) -> Result<Option<GrantedLease>> {
        let candidates = self
            .match_by_tags(resource_type, platform, tags, amount)
            .await?;

        for resource in candidates {
            let lease = JobResourceUse::new(&resource, job_request_id, task_execution_id, amount);
            match self.allocate(&lease).await {
                Ok(remaining) => {
                    return Ok(Some(GrantedLease {
                        lease,
                        resource,
                        remaining,
                    }));
                }
                Err(e) if e.is_quota_exceeded() => continue,
                Err(e) => return Err(e),
            }
        }

        debug!(
            "No {} resource on {} can take {} for request {}",
            resource_type, platform, amount, job_request_id
        );
        Ok(None)
    }

    /// Active leases on a resource
    pub async fn resource_uses(&self, resource_id: Uuid) -> Result<Vec<JobResourceUse>> {
        self.resources.resource_uses(resource_id).await
    }

    /// Releases every lease whose expiry has passed
    pub async fn release_expired(&self) -> Result<u64> {
        let released = self.resources.release_expired(Utc::now()).await?;
        if released > 0 {
            info!("Released {} expired resource lease(s)", released);
        } else {
            debug!("No expired resource leases");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    use chrono::TimeDelta;
    use colony_core::Error;

    use crate::repository::MemoryStore;

    fn allocator() -> (Arc<MemoryStore>, ResourceAllocator) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), ResourceAllocator::new(store))
    }

    fn ci(platform: &str, quota: i32, tags: &[&str]) -> JobResource {
        JobResource::new("CI", platform, quota, Duration::from_secs(600))
            .with_tags(tags.iter().copied())
    }

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|tag| tag.to_string()).collect()
    }

    #[tokio::test]
    async fn test_quota_is_enforced_and_released() {
        let (_, allocator) = allocator();
        let resource = ci("LINUX", 10, &[]);
        allocator.register(&resource).await.unwrap();
        let request_id = Uuid::new_v4();

        let mut leases = Vec::new();
        for expected_left in (0..10).rev() {
            let lease = JobResourceUse::new(&resource, request_id, Uuid::new_v4(), 1);
            assert_eq!(allocator.allocate(&lease).await.unwrap(), expected_left);
            leases.push(lease);
        }

        let eleventh = JobResourceUse::new(&resource, request_id, Uuid::new_v4(), 1);
        let err = allocator.allocate(&eleventh).await.unwrap_err();
        assert!(matches!(
            err,
            Error::QuotaExceeded {
                used: 10,
                quota: 10,
                ..
            }
        ));
        assert_eq!(allocator.used_quota(resource.id).await.unwrap(), 10);

        allocator.deallocate(leases[0].id).await.unwrap();
        assert_eq!(allocator.used_quota(resource.id).await.unwrap(), 9);

        let retry = JobResourceUse::new(&resource, request_id, Uuid::new_v4(), 1);
        assert_eq!(allocator.allocate(&retry).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deallocate_twice_is_conflict() {
        let (_, allocator) = allocator();
        let resource = ci("LINUX", 2, &[]);
        allocator.register(&resource).await.unwrap();
        let lease = JobResourceUse::new(&resource, Uuid::new_v4(), Uuid::new_v4(), 2);
        allocator.allocate(&lease).await.unwrap();

        allocator.deallocate(lease.id).await.unwrap();
        assert!(allocator.deallocate(lease.id).await.unwrap_err().is_conflict());
        assert!(
            allocator
                .deallocate(Uuid::new_v4())
                .await
                .unwrap_err()
                .is_conflict()
        );
    }

    #[tokio::test]
    async fn test_match_by_tags_filters_platform_tags_and_capacity() {
        let (_, allocator) = allocator();
        let windows_full = ci("WINDOWS", 5, &["build", "test", "gpu"]);
        let windows_small = ci("WINDOWS", 1, &["build", "test"]);
        let windows_partial_tags = ci("WINDOWS", 8, &["build"]);
        let linux = ci("LINUX", 8, &["build", "test"]);
        let windows_busy = ci("WINDOWS", 3, &["Build", "Test"]);
        for resource in [
            &windows_full,
            &windows_small,
            &windows_partial_tags,
            &linux,
            &windows_busy,
        ] {
            allocator.register(resource).await.unwrap();
        }
        // leaves one unit on the busy resource
        allocator
            .allocate(&JobResourceUse::new(
                &windows_busy,
                Uuid::new_v4(),
                Uuid::new_v4(),
                2,
            ))
            .await
            .unwrap();

        let matched = allocator
            .match_by_tags("CI", "WINDOWS", &tags(&["build", "test"]), 2)
            .await
            .unwrap();
        let ids: HashSet<Uuid> = matched.iter().map(|r| r.id).collect();
        assert_eq!(ids, HashSet::from([windows_full.id]));

        // with room for one unit the busy resource matches, tags compared case-insensitively
        let matched = allocator
            .match_by_tags("CI", "WINDOWS", &tags(&["build", "test"]), 1)
            .await
            .unwrap();
        let ids: HashSet<Uuid> = matched.iter().map(|r| r.id).collect();
        assert_eq!(
            ids,
            HashSet::from([windows_full.id, windows_small.id, windows_busy.id])
        );
    }

    #[tokio::test]
    async fn test_paused_and_retired_resources_do_not_match() {
        let (_, allocator) = allocator();
        let paused = ci("LINUX", 4, &["build"]);
        let retired = ci("LINUX", 4, &["build"]);
        let open = ci("LINUX", 4, &["build"]);
        for resource in [&paused, &retired, &open] {
            allocator.register(resource).await.unwrap();
        }
        allocator.set_paused(paused.id, true).await.unwrap();
        allocator.retire(retired.id).await.unwrap();

        let matched = allocator
            .match_by_tags("CI", "LINUX", &tags(&["build"]), 1)
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, open.id);

        // retired resources take no new leases
        let lease = JobResourceUse::new(&retired, Uuid::new_v4(), Uuid::new_v4(), 1);
        assert!(allocator.allocate(&lease).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_resource() {
        let (_, allocator) = allocator();
        let err = allocator
            .register(&ci("LINUX", 0, &[]))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_lease_skips_full_candidates() {
        let (_, allocator) = allocator();
        let mut first = ci("LINUX", 2, &["build"]);
        first.created_at -= TimeDelta::minutes(1);
        let second = ci("LINUX", 2, &["build"]);
        allocator.register(&first).await.unwrap();
        allocator.register(&second).await.unwrap();

        let request_id = Uuid::new_v4();
        let build = tags(&["build"]);
        let granted = allocator
            .lease("CI", "LINUX", &build, 2, request_id, Uuid::new_v4())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(granted.resource.id, first.id);
        assert_eq!(granted.remaining, 0);

        let granted = allocator
            .lease("CI", "LINUX", &build, 2, request_id, Uuid::new_v4())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(granted.resource.id, second.id);

        assert!(
            allocator
                .lease("CI", "LINUX", &build, 1, request_id, Uuid::new_v4())
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(allocator.resource_uses(first.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_release_expired_frees_capacity() {
        let (_, allocator) = allocator();
        let resource = ci("LINUX", 3, &[]);
        allocator.register(&resource).await.unwrap();

        let mut expired = JobResourceUse::new(&resource, Uuid::new_v4(), Uuid::new_v4(), 2);
        expired.created_at -= TimeDelta::minutes(10);
        expired.expires_at = Utc::now() - TimeDelta::seconds(5);
        let live = JobResourceUse::new(&resource, Uuid::new_v4(), Uuid::new_v4(), 1);
        allocator.allocate(&expired).await.unwrap();
        allocator.allocate(&live).await.unwrap();

        assert_eq!(allocator.release_expired().await.unwrap(), 1);
        assert_eq!(allocator.used_quota(resource.id).await.unwrap(), 1);
        let uses = allocator.resource_uses(resource.id).await.unwrap();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].id, live.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_never_exceed_quota() {
        let (_, allocator) = allocator();
        let resource = ci("LINUX", 10, &[]);
        allocator.register(&resource).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let allocator = allocator.clone();
            let lease = JobResourceUse::new(&resource, Uuid::new_v4(), Uuid::new_v4(), 1);
            handles.push(tokio::spawn(async move { allocator.allocate(&lease).await }));
        }

        let mut granted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => granted += 1,
                Err(e) => assert!(e.is_quota_exceeded()),
            }
        }
        assert_eq!(granted, 10);
        assert_eq!(allocator.used_quota(resource.id).await.unwrap(), 10);
    }
}
