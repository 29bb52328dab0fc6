use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::apply::{ApplyStats, apply_records};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::gateway::Gateway;
use crate::lifecycle::LifecycleController;
use crate::store::Store;

/// Counts reported by [`SyncEngine::full_sync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Chats known upstream.
    pub conversations: u32,
    pub pages: u32,
    /// Raw records received across all pages.
    pub fetched: u32,
    pub inserted: u32,
    pub updated: u32,
    pub unchanged: u32,
    pub stale: u32,
    pub skipped: u32,
    pub failed: u32,
}

impl SyncReport {
    fn absorb(&mut self, stats: ApplyStats) {
        self.inserted += stats.inserted;
        self.updated += stats.updated;
        self.unchanged += stats.unchanged;
        self.stale += stats.stale;
        self.skipped += stats.skipped;
        self.failed += stats.failed;
    }

    fn summary(&self) -> String {
        format!(
            "conversations={} fetched={} inserted={} updated={} unchanged={} stale={} skipped={} failed={}",
            self.conversations,
            self.fetched,
            self.inserted,
            self.updated,
            self.unchanged,
            self.stale,
            self.skipped,
            self.failed
        )
    }
}

type InFlight = Arc<Mutex<HashSet<String>>>;

/// Marks an instance as syncing; released on drop, whatever the exit path.
struct InFlightGuard {
    in_flight: InFlight,
    instance_name: String,
}

impl InFlightGuard {
    fn acquire(in_flight: &InFlight, instance_name: &str) -> Option<Self> {
        let mut set = in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(instance_name.to_string()) {
            return None;
        }
        Some(Self {
            in_flight: Arc::clone(in_flight),
            instance_name: instance_name.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.instance_name);
    }
}

/// Pulls remote history and applies it through the shared write path.
///
/// Gateway errors are returned to the caller and recorded in the instance
/// log. Only a gateway answer that the instance no longer exists changes
/// instance status, and that goes through the lifecycle controller.
///
/// Two layers keep one sync per instance: an in-process set, and a lease
/// row in the store that also covers other processes on the same database.
pub struct SyncEngine {
    store: Store,
    gateway: Arc<dyn Gateway>,
    lifecycle: Arc<LifecycleController>,
    config: SyncConfig,
    in_flight: InFlight,
    /// Lease owner id of this engine.
    owner: String,
}

impl SyncEngine {
    pub fn new(
        store: Store,
        gateway: Arc<dyn Gateway>,
        lifecycle: Arc<LifecycleController>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            lifecycle,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            owner: format!("{}:{}", std::process::id(), uuid::Uuid::new_v4()),
        }
    }

    pub fn is_syncing(&self, instance_name: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(instance_name)
    }

    fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.config.lease_secs.max(1))
    }

    /// Full synchronization of one instance.
    ///
    /// Returns `Conflict` immediately if a sync for the same instance is
    /// already running here or in another process. Messages applied before
    /// a gateway error stay applied.
    pub async fn full_sync(&self, instance_name: &str) -> Result<SyncReport> {
        self.store.require_instance(instance_name).await?;

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, instance_name) else {
            return Err(SyncError::Conflict(format!(
                "full sync already running for {}",
                instance_name
            )));
        };
        if !self
            .store
            .acquire_sync_lease(instance_name, &self.owner, self.lease_ttl())
            .await?
        {
            return Err(SyncError::Conflict(format!(
                "full sync for {} is held by another process",
                instance_name
            )));
        }

        let result = self.run(instance_name).await;

        if let Err(e) = self.store.release_sync_lease(instance_name, &self.owner).await {
            tracing::warn!("Sync: could not release lease for {}: {}", instance_name, e);
        }
        result
    }

    async fn run(&self, instance_name: &str) -> Result<SyncReport> {
        tracing::info!("Sync: full sync started for {}", instance_name);
        self.store
            .append_log(instance_name, "FULL_SYNC_STARTED", None)
            .await?;

        match self.pull(instance_name).await {
            Ok(report) => {
                tracing::info!(
                    "Sync: full sync of {} completed: {}",
                    instance_name,
                    report.summary()
                );
                self.log_best_effort(instance_name, "FULL_SYNC_COMPLETED", &report.summary())
                    .await;
                Ok(report)
            }
            Err(e) => {
                tracing::warn!("Sync: full sync of {} failed: {}", instance_name, e);
                self.log_best_effort(instance_name, "FULL_SYNC_FAILED", &e.to_string())
                    .await;
                if e.is_upstream_instance_missing()
                    && let Err(mark_err) = self
                        .lifecycle
                        .mark_failed(instance_name, &e.to_string())
                        .await
                {
                    tracing::warn!(
                        "Sync: could not mark {} failed: {}",
                        instance_name,
                        mark_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn pull(&self, instance_name: &str) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let chats = self.gateway.find_chats(instance_name).await?;
        report.conversations = chats.len() as u32;
        for chat in &chats {
            self.store
                .ensure_conversation(instance_name, &chat.remote_jid, chat.name.as_deref())
                .await?;
        }

        let page_size = self.config.page_size.max(1);
        let mut page_no = 1;
        loop {
            if page_no > self.config.max_pages {
                tracing::warn!(
                    "Sync: stopped {} after {} pages (max_pages)",
                    instance_name,
                    self.config.max_pages
                );
                break;
            }

            if page_no > 1
                && !self
                    .store
                    .renew_sync_lease(instance_name, &self.owner, self.lease_ttl())
                    .await?
            {
                return Err(SyncError::Conflict(format!(
                    "sync lease for {} was taken over",
                    instance_name
                )));
            }

            let page = self
                .gateway
                .find_messages(instance_name, page_no, page_size)
                .await?;
            report.pages += 1;
            report.fetched += page.records.len() as u32;

            let stats = apply_records(&self.store, instance_name, &page.records).await;
            tracing::debug!(
                "Sync: {} page {}/{}: {} records",
                instance_name,
                page.page,
                page.pages,
                page.records.len()
            );
            report.absorb(stats);

            if page.is_last() {
                break;
            }
            page_no += 1;
        }

        Ok(report)
    }

    async fn log_best_effort(&self, instance_name: &str, event: &str, detail: &str) {
        if let Err(e) = self
            .store
            .append_log(instance_name, event, Some(detail))
            .await
        {
            tracing::warn!("Sync: could not append {} log: {}", event, e);
        }
    }
}
