//! Full-sync leases
//!
//! A row per instance naming the process that currently runs its full sync.
//! The in-process guard in `sync::engine` only covers one `SyncEngine`; the
//! lease also excludes a `sync` CLI run against the database a server is
//! using. Leases expire so a crashed holder does not block forever.

use chrono::Utc;
use std::time::Duration;

use super::Store;
use crate::error::Result;

impl Store {
    /// Take the lease for `instance_name` unless another owner holds an
    /// unexpired one. Re-acquiring an own lease extends it.
    pub async fn acquire_sync_lease(
        &self,
        instance_name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now().timestamp();
        let expires_at = now.saturating_add(ttl.as_secs() as i64);
        let taken = sqlx::query(
            "INSERT INTO sync_leases (instance_name, owner, expires_at)
             VALUES (?, ?, ?)
             ON CONFLICT(instance_name) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
             WHERE sync_leases.owner = excluded.owner
                OR sync_leases.expires_at <= ?",
        )
        .bind(instance_name)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .execute(self.pool())
        .await?
        .rows_affected()
            == 1;
        Ok(taken)
    }

    /// Push the expiry of a held lease forward. Returns false if the lease
    /// was lost to another owner in the meantime.
    pub async fn renew_sync_lease(
        &self,
        instance_name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let expires_at = Utc::now().timestamp().saturating_add(ttl.as_secs() as i64);
        let renewed = sqlx::query(
            "UPDATE sync_leases SET expires_at = ? WHERE instance_name = ? AND owner = ?",
        )
        .bind(expires_at)
        .bind(instance_name)
        .bind(owner)
        .execute(self.pool())
        .await?
        .rows_affected()
            == 1;
        Ok(renewed)
    }

    pub async fn release_sync_lease(&self, instance_name: &str, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_leases WHERE instance_name = ? AND owner = ?")
            .bind(instance_name)
            .bind(owner)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_lease_excludes_other_owner_until_released() {
        let store = Store::in_memory().await.unwrap();
        assert!(store.acquire_sync_lease("shop-1", "serve", HOUR).await.unwrap());
        assert!(!store.acquire_sync_lease("shop-1", "cli", HOUR).await.unwrap());
        // Same owner may re-take its own lease
        assert!(store.acquire_sync_lease("shop-1", "serve", HOUR).await.unwrap());

        store.release_sync_lease("shop-1", "serve").await.unwrap();
        assert!(store.acquire_sync_lease("shop-1", "cli", HOUR).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = Store::in_memory().await.unwrap();
        assert!(store.acquire_sync_lease("shop-1", "crashed", Duration::ZERO).await.unwrap());
        assert!(store.acquire_sync_lease("shop-1", "cli", HOUR).await.unwrap());
        assert!(!store.renew_sync_lease("shop-1", "crashed", HOUR).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_by_non_owner_is_a_no_op() {
        let store = Store::in_memory().await.unwrap();
        store.acquire_sync_lease("shop-1", "serve", HOUR).await.unwrap();
        store.release_sync_lease("shop-1", "cli").await.unwrap();
        assert!(!store.acquire_sync_lease("shop-1", "cli", HOUR).await.unwrap());
    }

    #[tokio::test]
    async fn test_leases_are_per_instance() {
        let store = Store::in_memory().await.unwrap();
        assert!(store.acquire_sync_lease("shop-1", "serve", HOUR).await.unwrap());
        assert!(store.acquire_sync_lease("shop-2", "cli", HOUR).await.unwrap());
    }
}
