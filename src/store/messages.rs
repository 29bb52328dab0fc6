//! Message/Conversation Store
//!
//! Messages are keyed by `(instance_name, external_id)`; the gateway's id is
//! the idempotency key. Writes go through one timestamp-gated upsert so that
//! replays and out-of-order deliveries converge on the same row whatever
//! their arrival order. Reads are ordered by gateway time and paged with a
//! `(before, before_id)` cursor instead of offsets.

use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::fmt;
use std::str::FromStr;

use super::Store;
use crate::error::{Result, SyncError};

pub const DEFAULT_PAGE_LIMIT: i64 = 20;
pub const MAX_PAGE_LIMIT: i64 = 100;

// Content and delivery status are separate last-writer-wins registers, each
// keyed by the timestamp of the event that carried it. A field is replaced
// when the incoming `(ts, value)` sorts above the stored one, so any arrival
// order of the same events leaves the same row. Events that omit a field
// (a status-only update) never clear it.
const UPSERT_MESSAGE: &str = "
    INSERT INTO messages
        (instance_name, external_id, conversation_id, timestamp, direction,
         content, content_ts, delivery_status, status_ts, status_rank)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(instance_name, external_id) DO UPDATE SET
        timestamp = MAX(messages.timestamp, excluded.timestamp),
        content = CASE WHEN excluded.content_ts IS NOT NULL
                        AND (messages.content_ts IS NULL
                             OR (excluded.content_ts, excluded.content)
                                > (messages.content_ts, messages.content))
                       THEN excluded.content ELSE messages.content END,
        content_ts = CASE WHEN excluded.content_ts IS NOT NULL
                           AND (messages.content_ts IS NULL
                                OR (excluded.content_ts, excluded.content)
                                   > (messages.content_ts, messages.content))
                          THEN excluded.content_ts ELSE messages.content_ts END,
        delivery_status = CASE WHEN excluded.status_ts IS NOT NULL
                                AND (messages.status_ts IS NULL
                                     OR (excluded.status_ts, excluded.status_rank, excluded.delivery_status)
                                        > (messages.status_ts, messages.status_rank, messages.delivery_status))
                               THEN excluded.delivery_status ELSE messages.delivery_status END,
        status_ts = CASE WHEN excluded.status_ts IS NOT NULL
                          AND (messages.status_ts IS NULL
                               OR (excluded.status_ts, excluded.status_rank, excluded.delivery_status)
                                  > (messages.status_ts, messages.status_rank, messages.delivery_status))
                         THEN excluded.status_ts ELSE messages.status_ts END,
        status_rank = CASE WHEN excluded.status_ts IS NOT NULL
                            AND (messages.status_ts IS NULL
                                 OR (excluded.status_ts, excluded.status_rank, excluded.delivery_status)
                                    > (messages.status_ts, messages.status_rank, messages.delivery_status))
                           THEN excluded.status_rank ELSE messages.status_rank END,
        revision = messages.revision + 1
    WHERE excluded.timestamp > messages.timestamp
       OR (excluded.content_ts IS NOT NULL
           AND (messages.content_ts IS NULL
                OR (excluded.content_ts, excluded.content)
                   > (messages.content_ts, messages.content)))
       OR (excluded.status_ts IS NOT NULL
           AND (messages.status_ts IS NULL
                OR (excluded.status_ts, excluded.status_rank, excluded.delivery_status)
                   > (messages.status_ts, messages.status_rank, messages.delivery_status)))
    RETURNING revision";

/// Progress order of gateway delivery states, used to break ties between
/// two statuses reported for the same event time.
pub(crate) fn status_rank(status: &str) -> i64 {
    match status {
        "ERROR" => 1,
        "PENDING" => 2,
        "SERVER_ACK" => 3,
        "DELIVERY_ACK" => 4,
        "READ" => 5,
        "PLAYED" => 6,
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message direction: {0:?}")]
pub struct UnknownDirection(pub String);

impl FromStr for Direction {
    type Err = UnknownDirection;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(UnknownDirection(other.to_string())),
        }
    }
}

/// A message as reported by the gateway, already normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub external_id: String,
    pub remote_jid: String,
    /// Gateway event time, seconds since epoch.
    pub timestamp: i64,
    pub direction: Direction,
    pub content: Option<String>,
    pub delivery_status: Option<String>,
    /// Sender display name, only meaningful for inbound messages.
    pub push_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub instance_name: String,
    pub remote_jid: String,
    pub display_name: Option<String>,
    pub last_message_at: Option<i64>,
}

impl Conversation {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_name: row.try_get("instance_name")?,
            remote_jid: row.try_get("remote_jid")?,
            display_name: row.try_get("display_name")?,
            last_message_at: row.try_get("last_message_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub external_id: String,
    pub conversation_id: i64,
    pub timestamp: i64,
    pub direction: Direction,
    pub content: Option<String>,
    pub delivery_status: Option<String>,
}

impl StoredMessage {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let direction: String = row.try_get("direction")?;
        Ok(Self {
            external_id: row.try_get("external_id")?,
            conversation_id: row.try_get("conversation_id")?,
            timestamp: row.try_get("timestamp")?,
            direction: direction
                .parse()
                .map_err(|e: UnknownDirection| sqlx::Error::Decode(Box::new(e)))?,
            content: row.try_get("content")?,
            delivery_status: row.try_get("delivery_status")?,
        })
    }
}

/// Result of one upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    /// The incoming event moved the row timestamp or replaced a field.
    Updated,
    /// Changed nothing and is not older than the stored row.
    Duplicate,
    /// Older than the stored row and changed nothing.
    Stale,
}

/// Validated page parameters.
///
/// The cursor is the sort key of the last row already seen. `before` alone
/// means "strictly older than this timestamp"; adding `before_id` also
/// returns the rows sharing that timestamp whose id sorts below it, so a
/// page boundary inside a run of equal timestamps loses nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: i64,
    pub before: Option<i64>,
    pub before_id: Option<String>,
}

impl PageRequest {
    /// `limit` defaults to [`DEFAULT_PAGE_LIMIT`], must be positive, and is
    /// clamped to [`MAX_PAGE_LIMIT`].
    pub fn new(limit: Option<i64>, before: Option<i64>) -> Result<Self> {
        let limit = match limit {
            None => DEFAULT_PAGE_LIMIT,
            Some(l) if l <= 0 => {
                return Err(SyncError::InvalidInput(format!(
                    "limit must be a positive integer, got {}",
                    l
                )));
            }
            Some(l) => l.min(MAX_PAGE_LIMIT),
        };
        Ok(Self {
            limit,
            before,
            before_id: None,
        })
    }

    /// Attach the id half of the cursor. Only valid together with `before`.
    pub fn with_before_id(mut self, before_id: Option<String>) -> Result<Self> {
        let before_id = before_id.filter(|id| !id.is_empty());
        if before_id.is_some() && self.before.is_none() {
            return Err(SyncError::InvalidInput("before_id requires before".to_string()));
        }
        self.before_id = before_id;
        Ok(self)
    }
}

/// One page of results plus the cursor for the next (older) page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Pass as `before` (and `next_before_id` as `before_id`) to continue;
    /// `None` when this was the last page.
    pub next_before: Option<i64>,
    pub next_before_id: Option<String>,
}

impl<T> Page<T> {
    fn from_items(items: Vec<T>, limit: i64, key: impl Fn(&T) -> (i64, String)) -> Self {
        let cursor = if items.len() as i64 == limit {
            items.last().map(key)
        } else {
            None
        };
        let (next_before, next_before_id) = cursor.unzip();
        Self {
            items,
            next_before,
            next_before_id,
        }
    }
}

impl Store {
    /// Insert or update one message, each field gated by the timestamp of
    /// the event that carried it.
    ///
    /// The conversation is created on first reference and its
    /// `last_message_at` only ever moves forward. Crate-private: the shared
    /// apply path in `sync::apply` is the only caller.
    pub(crate) async fn upsert_message(
        &self,
        instance_name: &str,
        message: &RemoteMessage,
    ) -> Result<UpsertOutcome> {
        let mut tx = self.pool().begin().await?;

        // Writing first takes the write lock up front, so concurrent
        // upserts queue on busy_timeout instead of failing a lock upgrade.
        let push_name = match message.direction {
            Direction::Inbound => message.push_name.as_deref().filter(|n| !n.is_empty()),
            Direction::Outbound => None,
        };
        let conversation_id: i64 = sqlx::query_scalar(
            "INSERT INTO conversations (instance_name, remote_jid, display_name, last_message_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(instance_name, remote_jid) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, conversations.display_name),
                last_message_at = MAX(COALESCE(conversations.last_message_at, excluded.last_message_at),
                                      excluded.last_message_at)
             RETURNING id",
        )
        .bind(instance_name)
        .bind(&message.remote_jid)
        .bind(push_name)
        .bind(message.timestamp)
        .fetch_one(&mut *tx)
        .await?;

        // revision 0 on insert, bumped on every accepted update; no row
        // returned means neither the row timestamp nor any field moved.
        let carried_at = |present: bool| present.then_some(message.timestamp);
        let revision: Option<i64> = sqlx::query_scalar(UPSERT_MESSAGE)
            .bind(instance_name)
            .bind(&message.external_id)
            .bind(conversation_id)
            .bind(message.timestamp)
            .bind(message.direction.as_str())
            .bind(&message.content)
            .bind(carried_at(message.content.is_some()))
            .bind(&message.delivery_status)
            .bind(carried_at(message.delivery_status.is_some()))
            .bind(message.delivery_status.as_deref().map_or(0, status_rank))
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match revision {
            Some(0) => UpsertOutcome::Inserted,
            Some(_) => UpsertOutcome::Updated,
            None => {
                let stored: i64 = sqlx::query_scalar(
                    "SELECT timestamp FROM messages WHERE instance_name = ? AND external_id = ?",
                )
                .bind(instance_name)
                .bind(&message.external_id)
                .fetch_one(&mut *tx)
                .await?;
                if stored > message.timestamp {
                    UpsertOutcome::Stale
                } else {
                    UpsertOutcome::Duplicate
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Create the conversation if missing (used when a chat is known
    /// upstream before any of its messages were fetched).
    pub(crate) async fn ensure_conversation(
        &self,
        instance_name: &str,
        remote_jid: &str,
        display_name: Option<&str>,
    ) -> Result<i64> {
        let id = sqlx::query_scalar(
            "INSERT INTO conversations (instance_name, remote_jid, display_name)
             VALUES (?, ?, ?)
             ON CONFLICT(instance_name, remote_jid) DO UPDATE SET
                display_name = COALESCE(conversations.display_name, excluded.display_name)
             RETURNING id",
        )
        .bind(instance_name)
        .bind(remote_jid)
        .bind(display_name)
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn get_message(
        &self,
        instance_name: &str,
        external_id: &str,
    ) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT external_id, conversation_id, timestamp, direction, content, delivery_status
             FROM messages WHERE instance_name = ? AND external_id = ?",
        )
        .bind(instance_name)
        .bind(external_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(StoredMessage::from_row).transpose()
    }

    pub async fn count_messages(&self, instance_name: &str) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE instance_name = ?")
            .bind(instance_name)
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    pub async fn get_conversation(&self, conversation_id: i64) -> Result<Conversation> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| SyncError::not_found("conversation", conversation_id.to_string()))?;
        Conversation::from_row(&row)
    }

    pub async fn find_conversation(
        &self,
        instance_name: &str,
        remote_jid: &str,
    ) -> Result<Conversation> {
        let row = sqlx::query(
            "SELECT * FROM conversations WHERE instance_name = ? AND remote_jid = ?",
        )
        .bind(instance_name)
        .bind(remote_jid)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| {
            SyncError::not_found("conversation", format!("{}/{}", instance_name, remote_jid))
        })?;
        Conversation::from_row(&row)
    }

    /// Conversations of an instance, most recently active first.
    /// Conversations with no messages yet sort last, keyed as time 0; the
    /// `(last_message_at, id)` cursor walks through them like any other run
    /// of equal timestamps.
    pub async fn list_conversations(
        &self,
        instance_name: &str,
        page: PageRequest,
    ) -> Result<Page<Conversation>> {
        let before_id = page
            .before_id
            .as_deref()
            .map(|id| {
                id.parse::<i64>().map_err(|_| {
                    SyncError::InvalidInput(format!(
                        "before_id must be a conversation id, got {:?}",
                        id
                    ))
                })
            })
            .transpose()?;

        let rows = sqlx::query(
            "SELECT * FROM conversations
             WHERE instance_name = ?
               AND (? IS NULL
                    OR COALESCE(last_message_at, 0) < ?
                    OR (? IS NOT NULL AND COALESCE(last_message_at, 0) = ? AND id < ?))
             ORDER BY COALESCE(last_message_at, 0) DESC, id DESC
             LIMIT ?",
        )
        .bind(instance_name)
        .bind(page.before)
        .bind(page.before)
        .bind(before_id)
        .bind(page.before)
        .bind(before_id)
        .bind(page.limit)
        .fetch_all(self.pool())
        .await?;

        let items = rows
            .iter()
            .map(Conversation::from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::from_items(items, page.limit, |c| {
            (c.last_message_at.unwrap_or(0), c.id.to_string())
        }))
    }

    /// Messages of a conversation, newest first. With `before = T` only
    /// messages with `timestamp < T` are returned; with `before_id = I` as
    /// well, messages at exactly `T` whose external id sorts below `I` too.
    pub async fn list_messages(
        &self,
        conversation_id: i64,
        page: PageRequest,
    ) -> Result<Page<StoredMessage>> {
        // Surface NotFound rather than an empty page for unknown ids.
        self.get_conversation(conversation_id).await?;

        let rows = sqlx::query(
            "SELECT external_id, conversation_id, timestamp, direction, content, delivery_status
             FROM messages
             WHERE conversation_id = ?
               AND (? IS NULL
                    OR timestamp < ?
                    OR (? IS NOT NULL AND timestamp = ? AND external_id < ?))
             ORDER BY timestamp DESC, external_id DESC
             LIMIT ?",
        )
        .bind(conversation_id)
        .bind(page.before)
        .bind(page.before)
        .bind(&page.before_id)
        .bind(page.before)
        .bind(&page.before_id)
        .bind(page.limit)
        .fetch_all(self.pool())
        .await?;

        let items = rows
            .iter()
            .map(StoredMessage::from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::from_items(items, page.limit, |m| {
            (m.timestamp, m.external_id.clone())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    async fn test_store() -> Store {
        let store = Store::in_memory().await.unwrap();
        store.create_instance("shop-1").await.unwrap();
        store
    }

    fn msg(id: &str, ts: i64, content: &str) -> RemoteMessage {
        RemoteMessage {
            external_id: id.to_string(),
            remote_jid: "5511999@s.whatsapp.net".to_string(),
            timestamp: ts,
            direction: Direction::Inbound,
            content: Some(content.to_string()),
            delivery_status: None,
            push_name: Some("Ana".to_string()),
        }
    }

    #[tokio::test]
    async fn test_insert_then_duplicate() {
        let store = test_store().await;
        let m = msg("m1", 100, "hi");
        assert_eq!(store.upsert_message("shop-1", &m).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_message("shop-1", &m).await.unwrap(), UpsertOutcome::Duplicate);
        assert_eq!(store.count_messages("shop-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_redelivery_does_not_clobber() {
        let store = test_store().await;
        store.upsert_message("shop-1", &msg("m1", 100, "new")).await.unwrap();
        let outcome = store.upsert_message("shop-1", &msg("m1", 90, "old")).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Stale);

        let stored = store.get_message("shop-1", "m1").await.unwrap().unwrap();
        assert_eq!(stored.content.as_deref(), Some("new"));
        assert_eq!(stored.timestamp, 100);
    }

    #[tokio::test]
    async fn test_newer_event_updates() {
        let store = test_store().await;
        store.upsert_message("shop-1", &msg("m1", 100, "draft")).await.unwrap();
        let outcome = store.upsert_message("shop-1", &msg("m1", 120, "edited")).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        let stored = store.get_message("shop-1", "m1").await.unwrap().unwrap();
        assert_eq!(stored.content.as_deref(), Some("edited"));
    }

    fn with_status(
        mut m: RemoteMessage,
        content: Option<&str>,
        status: Option<&str>,
    ) -> RemoteMessage {
        m.content = content.map(str::to_string);
        m.delivery_status = status.map(str::to_string);
        m
    }

    async fn row_after(events: &[RemoteMessage]) -> (i64, Option<String>, Option<String>) {
        let store = test_store().await;
        for event in events {
            store.upsert_message("shop-1", event).await.unwrap();
        }
        let stored = store.get_message("shop-1", "m1").await.unwrap().unwrap();
        (stored.timestamp, stored.content, stored.delivery_status)
    }

    #[tokio::test]
    async fn test_status_update_keeps_content() {
        let store = test_store().await;
        store.upsert_message("shop-1", &msg("m1", 100, "hi")).await.unwrap();

        let status_only = with_status(msg("m1", 100, ""), None, Some("READ"));
        let outcome = store.upsert_message("shop-1", &status_only).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);

        let stored = store.get_message("shop-1", "m1").await.unwrap().unwrap();
        assert_eq!(stored.content.as_deref(), Some("hi"));
        assert_eq!(stored.delivery_status.as_deref(), Some("READ"));
    }

    #[rstest]
    #[case::status_after_message(
        with_status(msg("m1", 90, ""), Some("hi"), Some("DELIVERY_ACK")),
        with_status(msg("m1", 100, ""), None, Some("READ")),
        (100, Some("hi"), Some("READ"))
    )]
    #[case::newer_event_without_status(
        with_status(msg("m1", 90, ""), Some("hi"), Some("DELIVERY_ACK")),
        with_status(msg("m1", 100, ""), Some("hi"), None),
        (100, Some("hi"), Some("DELIVERY_ACK"))
    )]
    #[case::same_time_statuses(
        with_status(msg("m1", 100, ""), Some("hi"), Some("DELIVERY_ACK")),
        with_status(msg("m1", 100, ""), None, Some("READ")),
        (100, Some("hi"), Some("READ"))
    )]
    #[case::newer_edit(
        with_status(msg("m1", 100, ""), Some("draft"), Some("SERVER_ACK")),
        with_status(msg("m1", 120, ""), Some("edited"), None),
        (120, Some("edited"), Some("SERVER_ACK"))
    )]
    #[tokio::test]
    async fn test_both_arrival_orders_converge(
        #[case] first: RemoteMessage,
        #[case] second: RemoteMessage,
        #[case] expected: (i64, Option<&'static str>, Option<&'static str>),
    ) {
        let expected = (
            expected.0,
            expected.1.map(str::to_string),
            expected.2.map(str::to_string),
        );
        assert_eq!(row_after(&[first.clone(), second.clone()]).await, expected);
        assert_eq!(row_after(&[second, first]).await, expected);
    }

    #[tokio::test]
    async fn test_older_event_fills_missing_content_without_moving_timestamp() {
        let store = test_store().await;
        let status_only = with_status(msg("m1", 100, ""), None, Some("READ"));
        store.upsert_message("shop-1", &status_only).await.unwrap();

        let outcome = store.upsert_message("shop-1", &msg("m1", 90, "hi")).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        // A replay of the same older event changes nothing
        let outcome = store.upsert_message("shop-1", &msg("m1", 90, "hi")).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Stale);

        let stored = store.get_message("shop-1", "m1").await.unwrap().unwrap();
        assert_eq!(stored.timestamp, 100);
        assert_eq!(stored.content.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_same_external_id_in_other_instance_is_separate() {
        let store = test_store().await;
        store.create_instance("shop-2").await.unwrap();
        store.upsert_message("shop-1", &msg("m1", 100, "a")).await.unwrap();
        let outcome = store.upsert_message("shop-2", &msg("m1", 100, "b")).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_conversation_created_lazily_and_tracks_latest() {
        let store = test_store().await;
        store.upsert_message("shop-1", &msg("m2", 200, "b")).await.unwrap();
        store.upsert_message("shop-1", &msg("m1", 100, "a")).await.unwrap();

        let conv = store
            .find_conversation("shop-1", "5511999@s.whatsapp.net")
            .await
            .unwrap();
        assert_eq!(conv.last_message_at, Some(200));
        assert_eq!(conv.display_name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn test_outbound_message_does_not_rename_conversation() {
        let store = test_store().await;
        store.upsert_message("shop-1", &msg("m1", 100, "hi")).await.unwrap();
        let mut out = msg("m2", 110, "hello back");
        out.direction = Direction::Outbound;
        out.push_name = Some("Shop Owner".to_string());
        store.upsert_message("shop-1", &out).await.unwrap();

        let conv = store
            .find_conversation("shop-1", "5511999@s.whatsapp.net")
            .await
            .unwrap();
        assert_eq!(conv.display_name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn test_pagination_25_messages() {
        let store = test_store().await;
        for i in 1..=25 {
            store
                .upsert_message("shop-1", &msg(&format!("m{:02}", i), i * 10, "x"))
                .await
                .unwrap();
        }
        let conv = store
            .find_conversation("shop-1", "5511999@s.whatsapp.net")
            .await
            .unwrap();

        let first = store
            .list_messages(conv.id, PageRequest::new(Some(20), None).unwrap())
            .await
            .unwrap();
        assert_eq!(first.items.len(), 20);
        assert_eq!(first.items[0].timestamp, 250);
        let twentieth = first.items[19].timestamp;
        assert_eq!(first.next_before, Some(twentieth));

        let second = store
            .list_messages(conv.id, PageRequest::new(Some(20), Some(twentieth)).unwrap())
            .await
            .unwrap();
        assert_eq!(second.items.len(), 5);
        assert!(second.items.iter().all(|m| m.timestamp < twentieth));
        assert!(second.next_before.is_none());
    }

    #[tokio::test]
    async fn test_cursor_page_stable_after_new_arrivals() {
        let store = test_store().await;
        for i in 1..=10 {
            store
                .upsert_message("shop-1", &msg(&format!("m{:02}", i), i * 10, "x"))
                .await
                .unwrap();
        }
        let conv = store
            .find_conversation("shop-1", "5511999@s.whatsapp.net")
            .await
            .unwrap();
        let req = PageRequest::new(Some(3), Some(60)).unwrap();
        let before = store.list_messages(conv.id, req.clone()).await.unwrap();

        store.upsert_message("shop-1", &msg("late", 1000, "new")).await.unwrap();
        let after = store.list_messages(conv.id, req).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_list_messages_unknown_conversation() {
        let store = test_store().await;
        let err = store
            .list_messages(999, PageRequest::new(None, None).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_conversations_most_recent_first() {
        let store = test_store().await;
        store
            .ensure_conversation("shop-1", "empty@s.whatsapp.net", Some("Empty"))
            .await
            .unwrap();
        let mut a = msg("a1", 100, "x");
        a.remote_jid = "a@s.whatsapp.net".to_string();
        let mut b = msg("b1", 300, "x");
        b.remote_jid = "b@s.whatsapp.net".to_string();
        store.upsert_message("shop-1", &a).await.unwrap();
        store.upsert_message("shop-1", &b).await.unwrap();

        let page = store
            .list_conversations("shop-1", PageRequest::new(None, None).unwrap())
            .await
            .unwrap();
        let jids: Vec<_> = page.items.iter().map(|c| c.remote_jid.as_str()).collect();
        assert_eq!(
            jids,
            vec!["b@s.whatsapp.net", "a@s.whatsapp.net", "empty@s.whatsapp.net"]
        );
    }

    #[tokio::test]
    async fn test_cursor_inside_run_of_equal_timestamps() {
        let store = test_store().await;
        for id in ["a", "b", "c"] {
            store.upsert_message("shop-1", &msg(id, 100, "x")).await.unwrap();
        }
        store.upsert_message("shop-1", &msg("older", 50, "x")).await.unwrap();
        let conv = store
            .find_conversation("shop-1", "5511999@s.whatsapp.net")
            .await
            .unwrap();

        let first = store
            .list_messages(conv.id, PageRequest::new(Some(2), None).unwrap())
            .await
            .unwrap();
        let ids: Vec<_> = first.items.iter().map(|m| m.external_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert_eq!(first.next_before, Some(100));
        assert_eq!(first.next_before_id.as_deref(), Some("b"));

        let req = PageRequest::new(Some(2), first.next_before)
            .unwrap()
            .with_before_id(first.next_before_id)
            .unwrap();
        let second = store.list_messages(conv.id, req).await.unwrap();
        let ids: Vec<_> = second.items.iter().map(|m| m.external_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "older"]);

        // The timestamp alone still means strictly older
        let plain = store
            .list_messages(conv.id, PageRequest::new(Some(2), Some(100)).unwrap())
            .await
            .unwrap();
        assert_eq!(plain.items.len(), 1);
        assert_eq!(plain.items[0].external_id, "older");
    }

    #[tokio::test]
    async fn test_conversation_pages_reach_empty_conversations() {
        let store = test_store().await;
        let mut a = msg("a1", 100, "x");
        a.remote_jid = "a@s.whatsapp.net".to_string();
        store.upsert_message("shop-1", &a).await.unwrap();
        for jid in ["e1@s.whatsapp.net", "e2@s.whatsapp.net", "e3@s.whatsapp.net"] {
            store.ensure_conversation("shop-1", jid, None).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut req = PageRequest::new(Some(2), None).unwrap();
        loop {
            let page = store.list_conversations("shop-1", req).await.unwrap();
            seen.extend(page.items.iter().map(|c| c.remote_jid.clone()));
            let Some(before) = page.next_before else {
                break;
            };
            req = PageRequest::new(Some(2), Some(before))
                .unwrap()
                .with_before_id(page.next_before_id)
                .unwrap();
        }
        assert_eq!(
            seen,
            vec![
                "a@s.whatsapp.net",
                "e3@s.whatsapp.net",
                "e2@s.whatsapp.net",
                "e1@s.whatsapp.net"
            ]
        );
    }

    #[tokio::test]
    async fn test_conversation_cursor_id_must_be_numeric() {
        let store = test_store().await;
        let req = PageRequest::new(None, Some(100))
            .unwrap()
            .with_before_id(Some("abc".to_string()))
            .unwrap();
        let err = store.list_conversations("shop-1", req).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
    }

    #[test]
    fn test_page_request_validation() {
        assert_eq!(PageRequest::new(None, None).unwrap().limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(PageRequest::new(Some(5000), None).unwrap().limit, MAX_PAGE_LIMIT);
        assert!(PageRequest::new(Some(0), None).is_err());
        assert!(PageRequest::new(Some(-3), None).is_err());
        assert!(
            PageRequest::new(None, None)
                .unwrap()
                .with_before_id(Some("m1".to_string()))
                .is_err()
        );
        let empty_id = PageRequest::new(None, None)
            .unwrap()
            .with_before_id(Some(String::new()))
            .unwrap();
        assert!(empty_id.before_id.is_none());
    }
}
