//! Maintenance sweeper
//!
//! Runs the two time-based corrections on their own intervals: orphaned
//! in-flight requests go back to PENDING, and leases past their expiry are
//! released so their capacity returns to the pool.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::service::{ResourceAllocator, StateTransitionManager};

/// Periodically requeues orphans and reaps expired leases
pub struct Sweeper {
    transitions: StateTransitionManager,
    allocator: ResourceAllocator,
    orphan_sweep_interval: Duration,
    orphan_stale_after: Duration,
    lease_reap_interval: Duration,
}

impl Sweeper {
    /// Creates a new sweeper
    pub fn new(
        config: &Config,
        transitions: StateTransitionManager,
        allocator: ResourceAllocator,
    ) -> Self {
        Self {
            transitions,
            allocator,
            orphan_sweep_interval: config.orphan_sweep_interval,
            orphan_stale_after: config.orphan_stale_after,
            lease_reap_interval: config.lease_reap_interval,
        }
    }

    /// Starts the sweep loops; only returns if the runtime shuts down
    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting sweeper (orphans every {:?}, stale after {:?}; leases every {:?})",
            self.orphan_sweep_interval, self.orphan_stale_after, self.lease_reap_interval
        );

        let mut orphan_interval = time::interval(self.orphan_sweep_interval);
        orphan_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lease_interval = time::interval(self.lease_reap_interval);
        lease_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = orphan_interval.tick() => {
                    if let Err(e) = self.sweep_orphans_once().await {
                        error!("Error during orphan sweep cycle: {:#}", e);
                    }
                }
                _ = lease_interval.tick() => {
                    if let Err(e) = self.reap_leases_once().await {
                        error!("Error during lease reap cycle: {:#}", e);
                    }
                }
            }
        }
    }

    /// Performs a single orphan sweep
    pub async fn sweep_orphans_once(&self) -> Result<u64> {
        debug!("Sweeping orphaned job requests");
        self.transitions
            .requeue_orphans(self.orphan_stale_after)
            .await
            .context("Failed to requeue orphaned job requests")
    }

    /// Performs a single expired-lease reap
    pub async fn reap_leases_once(&self) -> Result<u64> {
        debug!("Reaping expired resource leases");
        self.allocator
            .release_expired()
            .await
            .context("Failed to release expired resource leases")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{TimeDelta, Utc};
    use colony_core::domain::{
        JobDefinition, JobRequest, JobResource, JobResourceUse, RequestState, TaskDefinition,
    };

    use crate::repository::{
        JobDefinitionRepository, JobRequestRepository, JobResourceRepository, MemoryStore,
    };

    fn sweeper(store: Arc<MemoryStore>) -> Sweeper {
        Sweeper::new(
            &Config::default(),
            StateTransitionManager::from_store(store.clone()),
            ResourceAllocator::new(store),
        )
    }

    #[tokio::test]
    async fn test_sweep_cycles() {
        let store = Arc::new(MemoryStore::new());
        let definition = JobDefinitionRepository::save(
            store.as_ref(),
            JobDefinition::new("nightly", "LINUX", vec![TaskDefinition::execute("run")]),
        )
        .await
        .unwrap();

        let mut orphan = JobRequest::new(&definition);
        orphan.job_state = RequestState::Ready;
        orphan.updated_at -= TimeDelta::hours(1);
        JobRequestRepository::save(store.as_ref(), &orphan)
            .await
            .unwrap();

        let resource = JobResource::new("CI", "LINUX", 2, std::time::Duration::from_secs(60));
        JobResourceRepository::save(store.as_ref(), &resource)
            .await
            .unwrap();
        let mut lease = JobResourceUse::new(&resource, orphan.id, uuid::Uuid::new_v4(), 2);
        lease.expires_at = Utc::now() - TimeDelta::seconds(1);
        store.allocate(&lease).await.unwrap();

        let sweeper = sweeper(store.clone());
        assert_eq!(sweeper.sweep_orphans_once().await.unwrap(), 1);
        assert_eq!(sweeper.sweep_orphans_once().await.unwrap(), 0);
        assert_eq!(sweeper.reap_leases_once().await.unwrap(), 1);
        assert_eq!(store.used_quota(resource.id).await.unwrap(), 0);

        let requeued = JobRequestRepository::get(store.as_ref(), orphan.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(requeued.job_state, RequestState::Pending);
    }
}
