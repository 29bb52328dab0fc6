//! The single write path for messages.
//!
//! Webhook ingest and full sync both end here, so a message delivered both
//! ways lands in exactly one row and the timestamp gate decides which
//! version survives.

use serde::Serialize;
use serde_json::Value;

use super::event::normalize_message;
use crate::error::Result;
use crate::store::{RemoteMessage, Store, UpsertOutcome};
use crate::utils::preview;

/// Apply one normalized gateway message.
pub async fn apply_remote_message(
    store: &Store,
    instance_name: &str,
    message: &RemoteMessage,
) -> Result<UpsertOutcome> {
    let outcome = store.upsert_message(instance_name, message).await?;
    tracing::debug!(
        "Sync: {} {}@{} {:?} [{}]",
        instance_name,
        message.external_id,
        message.timestamp,
        outcome,
        preview(message.content.as_deref())
    );
    Ok(outcome)
}

/// Per-batch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    pub inserted: u32,
    pub updated: u32,
    /// Identical redelivery.
    pub unchanged: u32,
    pub stale: u32,
    /// Records that could not be normalized.
    pub skipped: u32,
    /// Records that failed to persist.
    pub failed: u32,
}

impl ApplyStats {
    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Duplicate => self.unchanged += 1,
            UpsertOutcome::Stale => self.stale += 1,
        }
    }

    pub fn merge(&mut self, other: ApplyStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.stale += other.stale;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    pub fn applied(&self) -> u32 {
        self.inserted + self.updated + self.unchanged + self.stale
    }
}

/// Normalize and apply a batch of raw gateway records, one at a time.
///
/// A record that fails does not stop the rest; it is counted and logged.
pub async fn apply_records(store: &Store, instance_name: &str, records: &[Value]) -> ApplyStats {
    let mut stats = ApplyStats::default();
    for record in records {
        let message = match normalize_message(record) {
            Ok(message) => message,
            Err(reason) => {
                tracing::warn!("Sync: skipped record for {}: {}", instance_name, reason);
                stats.skipped += 1;
                continue;
            }
        };
        match apply_remote_message(store, instance_name, &message).await {
            Ok(outcome) => stats.record(outcome),
            Err(e) => {
                tracing::error!(
                    "Sync: failed to store {} for {}: {}",
                    message.external_id,
                    instance_name,
                    e
                );
                stats.failed += 1;
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Direction;
    use crate::store::messages::status_rank;
    use proptest::prelude::*;
    use serde_json::json;

    fn message(id: &str, ts: i64, content: &str) -> RemoteMessage {
        RemoteMessage {
            external_id: id.to_string(),
            remote_jid: "5511999@s.whatsapp.net".to_string(),
            timestamp: ts,
            direction: Direction::Inbound,
            content: Some(content.to_string()),
            delivery_status: None,
            push_name: None,
        }
    }

    async fn store_with_instance() -> Store {
        let store = Store::in_memory().await.unwrap();
        store.create_instance("shop-1").await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_reapplying_identical_event_changes_nothing() {
        let store = store_with_instance().await;
        let m = message("m1", 100, "hi");
        assert_eq!(
            apply_remote_message(&store, "shop-1", &m).await.unwrap(),
            UpsertOutcome::Inserted
        );
        let before = store.get_message("shop-1", "m1").await.unwrap();
        assert_eq!(
            apply_remote_message(&store, "shop-1", &m).await.unwrap(),
            UpsertOutcome::Duplicate
        );
        assert_eq!(store.get_message("shop-1", "m1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_apply_records_counts_outcomes() {
        let store = store_with_instance().await;
        let record = |id: &str, ts: i64, text: &str| {
            json!({
                "key": {"remoteJid": "5511999@s.whatsapp.net", "fromMe": false, "id": id},
                "message": {"conversation": text},
                "messageTimestamp": ts
            })
        };
        let records = vec![
            record("m1", 100, "hi"),
            record("m2", 101, "there"),
            record("m1", 90, "older"),
            record("m2", 105, "edited"),
            json!({"key": {"id": "broken"}}),
        ];

        let stats = apply_records(&store, "shop-1", &records).await;
        assert_eq!(
            stats,
            ApplyStats {
                inserted: 2,
                updated: 1,
                unchanged: 0,
                stale: 1,
                skipped: 1,
                failed: 0,
            }
        );
        assert_eq!(stats.applied(), 4);
        let m2 = store.get_message("shop-1", "m2").await.unwrap().unwrap();
        assert_eq!(m2.content.as_deref(), Some("edited"));
    }

    type Event = (i64, Option<&'static str>, Option<&'static str>);

    fn event_strategy() -> impl Strategy<Value = Event> {
        (
            100i64..104,
            proptest::option::of(prop::sample::select(vec!["hi", "edited"])),
            proptest::option::of(prop::sample::select(vec![
                "SERVER_ACK",
                "DELIVERY_ACK",
                "READ",
            ])),
        )
    }

    fn final_row(events: &[Event]) -> (i64, Option<String>, Option<String>) {
        tokio_test::block_on(async {
            let store = store_with_instance().await;
            for &(ts, content, status) in events {
                let mut m = message("m1", ts, "");
                m.content = content.map(str::to_string);
                m.delivery_status = status.map(str::to_string);
                apply_remote_message(&store, "shop-1", &m).await.unwrap();
            }
            let stored = store.get_message("shop-1", "m1").await.unwrap().unwrap();
            (stored.timestamp, stored.content, stored.delivery_status)
        })
    }

    /// Newest timestamp overall; each field from the newest event carrying it.
    fn expected_row(events: &[Event]) -> (i64, Option<String>, Option<String>) {
        let timestamp = events.iter().map(|e| e.0).max().unwrap_or_default();
        let content = events
            .iter()
            .filter_map(|&(ts, c, _)| c.map(|c| (ts, c)))
            .max()
            .map(|(_, c)| c.to_string());
        let status = events
            .iter()
            .filter_map(|&(ts, _, s)| s.map(|s| (ts, status_rank(s), s)))
            .max()
            .map(|(_, _, s)| s.to_string());
        (timestamp, content, status)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_final_row_is_newest_regardless_of_order(
            order in Just((0..6).collect::<Vec<i64>>()).prop_shuffle()
        ) {
            let final_content = tokio_test::block_on(async {
                let store = store_with_instance().await;
                for i in &order {
                    let ts = 100 + i * 10;
                    apply_remote_message(&store, "shop-1", &message("m1", ts, &format!("v{}", i)))
                        .await
                        .unwrap();
                }
                let stored = store.get_message("shop-1", "m1").await.unwrap().unwrap();
                (stored.timestamp, stored.content)
            });
            prop_assert_eq!(final_content, (150, Some("v5".to_string())));
        }

        // Narrow timestamp range so ties are common; every event is also
        // delivered twice to cover replays.
        #[test]
        fn prop_mixed_events_converge_in_any_order(
            (events, shuffled) in prop::collection::vec(event_strategy(), 1..6)
                .prop_map(|mut events| {
                    let replays = events.clone();
                    events.extend(replays);
                    events
                })
                .prop_flat_map(|events| (Just(events.clone()), Just(events).prop_shuffle()))
        ) {
            let expected = expected_row(&events);
            prop_assert_eq!(final_row(&events), expected.clone());
            prop_assert_eq!(final_row(&shuffled), expected);
        }
    }
}
