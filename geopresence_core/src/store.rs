//! Update ingest and merge store.
//!
//! Owns the only mutable reference to the presence view. Every merge
//! produces a fresh `PresenceSnapshot` and publishes it on a watch channel.

use crate::snapshot::{PositionUpdate, PresenceSnapshot};
use chrono::{DateTime, Utc};
use geopresence_env::PresenceContext;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Counters for ingest diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Frames that produced a merge
    pub accepted: u64,

    /// Malformed frames dropped at ingest
    pub dropped: u64,

    /// Merges that appended a new identity
    pub inserted: u64,

    /// Merges that replaced an existing identity in place
    pub replaced: u64,
}

/// Identity-keyed merge store.
pub struct MergeStore<Ctx: PresenceContext> {
    context: Arc<Ctx>,
    current: PresenceSnapshot,
    publisher: watch::Sender<PresenceSnapshot>,
    stats: IngestStats,
}

impl<Ctx: PresenceContext> MergeStore<Ctx> {
    /// Creates an empty store.
    pub fn new(context: Arc<Ctx>) -> Self {
        let (publisher, _) = watch::channel(PresenceSnapshot::empty());
        Self {
            context,
            current: PresenceSnapshot::empty(),
            publisher,
            stats: IngestStats::default(),
        }
    }

    /// Subscribes to published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<PresenceSnapshot> {
        self.publisher.subscribe()
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> PresenceSnapshot {
        self.current.clone()
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Parses `(latitude, longitude, identity)` and merges it.
    ///
    /// `observed_at` is the ingest time. Frames with the wrong shape are
    /// dropped and logged; the snapshot is left untouched.
    pub fn ingest(&mut self, arguments: &[Value]) -> Option<PresenceSnapshot> {
        let observed_at = DateTime::<Utc>::from(self.context.system_time());

        match PositionUpdate::from_arguments(arguments, observed_at) {
            Ok(update) => {
                self.stats.accepted += 1;
                Some(self.merge(update))
            }
            Err(e) => {
                self.stats.dropped += 1;
                warn!(error = %e, "dropping malformed position frame");
                None
            }
        }
    }

    /// Upserts by identity and publishes the new snapshot.
    pub fn merge(&mut self, update: PositionUpdate) -> PresenceSnapshot {
        if self.current.position_of(update.identity()).is_some() {
            self.stats.replaced += 1;
        } else {
            self.stats.inserted += 1;
        }
        debug!(identity = update.identity(), lat = update.latitude(), lon = update.longitude(), "merge");

        self.current = self.current.merged(update);
        self.publisher.send_replace(self.current.clone());
        self.current.clone()
    }

    /// Clears to an empty snapshot (fresh session).
    pub fn reset(&mut self) {
        self.current = PresenceSnapshot::empty();
        self.stats = IngestStats::default();
        self.publisher.send_replace(self.current.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    /// Fixed clock; nothing in these tests sleeps or spawns.
    struct FixedClock;

    #[async_trait]
    impl PresenceContext for FixedClock {
        fn now(&self) -> Duration {
            Duration::ZERO
        }

        fn system_time(&self) -> SystemTime {
            UNIX_EPOCH + Duration::from_secs(1_704_067_200)
        }

        async fn sleep(&self, _duration: Duration) {}

        fn spawn<F>(&self, _name: &str, future: F)
        where
            F: std::future::Future<Output = ()> + Send + 'static,
        {
            tokio::spawn(future);
        }

        fn seed(&self) -> u64 {
            0
        }
    }

    fn store() -> MergeStore<FixedClock> {
        MergeStore::new(Arc::new(FixedClock))
    }

    #[test]
    fn test_ingest_upserts_and_publishes() {
        let mut store = store();
        let mut rx = store.subscribe();

        store.ingest(&[json!(40.7128), json!(-74.0060), json!("alice")]);
        store.ingest(&[json!(51.5074), json!(-0.1278), json!("bob")]);
        store.ingest(&[json!(40.71), json!(-74.00), json!("alice")]);

        let published = rx.borrow_and_update().clone();
        assert_eq!(published.identities(), vec!["alice", "bob"]);
        assert_eq!(published.get("alice").unwrap().latitude(), 40.71);
        assert_eq!(
            published.get("alice").unwrap().observed_at().timestamp(),
            1_704_067_200
        );
        assert_eq!(
            store.stats(),
            IngestStats {
                accepted: 3,
                dropped: 0,
                inserted: 2,
                replaced: 1
            }
        );
    }

    #[test]
    fn test_malformed_frame_leaves_snapshot_untouched() {
        let mut store = store();
        store.ingest(&[json!(1.0), json!(2.0), json!("alice")]);
        let before = store.snapshot();
        let mut rx = store.subscribe();

        assert!(store.ingest(&[json!("oops")]).is_none());
        assert!(store.ingest(&[json!(1.0), json!(2.0), json!(3.0)]).is_none());

        assert!(store.snapshot().same_instance(&before));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(store.stats().dropped, 2);
    }

    #[test]
    fn test_ingest_keeps_what_the_sender_published() {
        let mut store = store();

        assert!(store.ingest(&[json!(95.0), json!(200.0), json!("carol")]).is_some());
        assert!(store.ingest(&[json!(10.0), json!(20.0), json!("")]).is_some());

        let snapshot = store.snapshot();
        assert_eq!(snapshot.identities(), vec!["carol", ""]);
        assert_eq!(snapshot.get("carol").unwrap().longitude(), 200.0);
        assert_eq!(store.stats().accepted, 2);
        assert_eq!(store.stats().dropped, 0);
    }

    #[test]
    fn test_reset_clears() {
        let mut store = store();
        store.ingest(&[json!(1.0), json!(2.0), json!("alice")]);

        store.reset();

        assert!(store.snapshot().is_empty());
        assert_eq!(store.snapshot().version(), 0);
        assert_eq!(store.stats(), IngestStats::default());
    }
}
