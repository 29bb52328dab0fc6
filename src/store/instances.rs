//! Instance State Store
//!
//! Identity, connection status, pairing QR and the append-only operational
//! log of each instance. Status and QR are written only through
//! [`Store::save_instance_state`], which is crate-private and called by the
//! lifecycle controller alone.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::Store;
use crate::error::{Result, SyncError};
use crate::gateway::validate_instance_name;
use crate::lifecycle::InstanceStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub instance_name: String,
    pub status: InstanceStatus,
    pub qr_code: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<InstanceStatus>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(Self {
            instance_name: row.try_get("instance_name")?,
            status,
            qr_code: row.try_get("qr_code")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceLogEntry {
    pub id: i64,
    pub event: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Create the instance record if it does not exist yet.
    ///
    /// Returns the record and whether it was created by this call. Existing
    /// records are left untouched (names are never reused or renamed).
    pub async fn create_instance(&self, instance_name: &str) -> Result<(Instance, bool)> {
        validate_instance_name(instance_name)
            .map_err(|e| SyncError::InvalidInput(e.to_string()))?;

        let now = Utc::now();
        let created = sqlx::query(
            "INSERT INTO instances (instance_name, status, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(instance_name) DO NOTHING",
        )
        .bind(instance_name)
        .bind(InstanceStatus::Disconnected.as_str())
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?
        .rows_affected()
            == 1;

        if created {
            tracing::info!("Store: created instance {}", instance_name);
            self.append_log(instance_name, "INSTANCE_CREATED", None).await?;
        }

        let instance = self.require_instance(instance_name).await?;
        Ok((instance, created))
    }

    pub async fn get_instance(&self, instance_name: &str) -> Result<Option<Instance>> {
        let row = sqlx::query("SELECT * FROM instances WHERE instance_name = ?")
            .bind(instance_name)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(Instance::from_row).transpose()
    }

    /// Like [`Store::get_instance`] but absent records are `NotFound`.
    pub async fn require_instance(&self, instance_name: &str) -> Result<Instance> {
        self.get_instance(instance_name)
            .await?
            .ok_or_else(|| SyncError::not_found("instance", instance_name))
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        let rows = sqlx::query("SELECT * FROM instances ORDER BY instance_name")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(Instance::from_row).collect()
    }

    /// Persist the outcome of a lifecycle transition.
    pub(crate) async fn save_instance_state(
        &self,
        instance_name: &str,
        status: InstanceStatus,
        qr_code: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<Instance> {
        let updated = sqlx::query(
            "UPDATE instances
             SET status = ?, qr_code = ?, last_error = ?, updated_at = ?
             WHERE instance_name = ?",
        )
        .bind(status.as_str())
        .bind(qr_code)
        .bind(last_error)
        .bind(Utc::now())
        .bind(instance_name)
        .execute(self.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(SyncError::not_found("instance", instance_name));
        }
        self.require_instance(instance_name).await
    }

    /// Append an operational log entry. Entries are never updated or deleted.
    pub async fn append_log(
        &self,
        instance_name: &str,
        event: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO instance_logs (instance_name, event, detail, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(instance_name)
        .bind(event)
        .bind(detail)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// The latest `limit` log entries, oldest first.
    pub async fn recent_logs(
        &self,
        instance_name: &str,
        limit: u32,
    ) -> Result<Vec<InstanceLogEntry>> {
        let rows = sqlx::query(
            "SELECT id, event, detail, created_at FROM instance_logs
             WHERE instance_name = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(instance_name)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        let mut entries = rows
            .iter()
            .map(|r| {
                Ok(InstanceLogEntry {
                    id: r.try_get("id")?,
                    event: r.try_get("event")?,
                    detail: r.try_get("detail")?,
                    created_at: r.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        entries.reverse();
        Ok(entries)
    }
}
