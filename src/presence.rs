//! Presence tracking.
//!
//! The tracker keeps one [`PresenceEntry`] per user. Entries come from three
//! places: `UserStatusChanged` pushes, `PresenceSnapshot` answers to
//! [`PresenceTracker::query_batch`], and [`PresenceTracker::seed`] (a friend
//! list fetched over REST). All three go through the same merge rule: an
//! entry replaces the cached one only if its `last_active_at` is strictly
//! newer. Entries are never removed.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::connection::SignalSink;
use crate::dispatcher::EventDispatcher;
use crate::error::{HubError, Result};
use crate::event::HubEvent;
use crate::lock::lock;
use crate::protocol::{ClientMessage, PresenceEntry, PresenceSnapshot, RequestId, UserId};

type PendingQueries = Mutex<HashMap<RequestId, oneshot::Sender<()>>>;

struct Inner {
    entries: Mutex<HashMap<UserId, PresenceEntry>>,
    pending: PendingQueries,
    sink: Arc<dyn SignalSink>,
    dispatcher: EventDispatcher,
    query_timeout: Duration,
}

/// Cached online/offline state of the users the client cares about.
///
/// Cloning is cheap; clones share the cache.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<Inner>,
}

impl PresenceTracker {
    pub fn new(sink: Arc<dyn SignalSink>, dispatcher: EventDispatcher, config: &HubConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                sink,
                dispatcher,
                query_timeout: config.presence_query_timeout,
            }),
        }
    }

    pub fn get_cached(&self, user_id: &str) -> Option<PresenceEntry> {
        lock(&self.inner.entries).get(user_id).cloned()
    }

    /// Users currently cached as online, sorted.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut online: Vec<UserId> = lock(&self.inner.entries)
            .values()
            .filter(|e| e.is_online)
            .map(|e| e.user_id.clone())
            .collect();
        online.sort();
        online
    }

    /// Merge entries fetched elsewhere (e.g. a REST friend list).
    ///
    /// Returns how many cached entries changed.
    pub fn seed(&self, entries: impl IntoIterator<Item = PresenceEntry>) -> usize {
        let changed = self.merge(entries);
        let count = changed.len();
        self.announce(changed);
        count
    }

    /// Ask the server for the presence of `user_ids` and wait for the answer.
    ///
    /// Duplicate ids are sent once. The returned map holds the merged cache
    /// entry for every requested id the tracker knows about afterwards.
    ///
    /// # Errors
    ///
    /// - The send error if the query cannot be handed to the connection.
    /// - [`HubError::Timeout`] if no snapshot arrives within the configured
    ///   presence query timeout.
    /// - [`HubError::NotConnected`] if the connection drops while waiting.
    pub async fn query_batch<I, S>(&self, user_ids: I) -> Result<HashMap<UserId, PresenceEntry>>
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        let mut seen = HashSet::new();
        let user_ids: Vec<UserId> = user_ids
            .into_iter()
            .map(Into::into)
            .filter(|id| seen.insert(id.clone()))
            .collect();
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(request_id, tx);
        let _pending = PendingGuard {
            pending: &self.inner.pending,
            request_id,
        };

        debug!(%request_id, count = user_ids.len(), "querying presence");
        self.inner.sink.enqueue(ClientMessage::PresenceQuery {
            request_id,
            user_ids: user_ids.clone(),
        })?;

        match tokio::time::timeout(self.inner.query_timeout, rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(HubError::NotConnected),
            Err(_) => {
                warn!(%request_id, "presence query timed out");
                return Err(HubError::Timeout);
            }
        }

        let entries = lock(&self.inner.entries);
        Ok(user_ids
            .into_iter()
            .filter_map(|id| entries.get(&id).cloned().map(|e| (id, e)))
            .collect())
    }

    /// Apply a pushed status change.
    pub(crate) fn handle_status(&self, entry: PresenceEntry) {
        let changed = self.merge([entry]);
        self.announce(changed);
    }

    /// Merge a snapshot and release whoever asked for it.
    pub(crate) fn handle_snapshot(&self, snapshot: PresenceSnapshot) {
        let changed = self.merge(snapshot.entries);
        self.announce(changed);

        match lock(&self.inner.pending).remove(&snapshot.request_id) {
            Some(waiter) => {
                let _ = waiter.send(());
            }
            None => debug!(request_id = %snapshot.request_id, "unsolicited presence snapshot merged"),
        }
    }

    /// Fail every in-flight query with `NotConnected`.
    pub(crate) fn abandon_queries(&self) {
        let dropped = std::mem::take(&mut *lock(&self.inner.pending));
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "abandoning presence queries");
        }
    }

    /// Newer-wins merge. Returns the entries that replaced cached ones.
    fn merge(&self, incoming: impl IntoIterator<Item = PresenceEntry>) -> Vec<PresenceEntry> {
        let mut entries = lock(&self.inner.entries);
        let mut changed = Vec::new();
        for entry in incoming {
            let newer = entries
                .get(&entry.user_id)
                .is_none_or(|cached| entry.last_active_at > cached.last_active_at);
            if newer {
                entries.insert(entry.user_id.clone(), entry.clone());
                changed.push(entry);
            } else {
                debug!(user_id = %entry.user_id, "stale presence update discarded");
            }
        }
        changed
    }

    fn announce(&self, changed: Vec<PresenceEntry>) {
        for entry in changed {
            self.inner.dispatcher.emit(&HubEvent::PresenceChanged(entry));
        }
    }
}

impl fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("cached", &lock(&self.inner.entries).len())
            .field("pending_queries", &lock(&self.inner.pending).len())
            .finish()
    }
}

/// Removes a query's waiter when the query finishes or is cancelled.
struct PendingGuard<'a> {
    pending: &'a PendingQueries,
    request_id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.request_id);
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        frames: StdMutex<Vec<ClientMessage>>,
    }

    impl SignalSink for RecordingSink {
        fn enqueue(&self, message: ClientMessage) -> Result<()> {
            self.frames.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn entry(user: &str, online: bool, secs: i64) -> PresenceEntry {
        PresenceEntry {
            user_id: user.into(),
            is_online: online,
            last_active_at: at(secs),
        }
    }

    fn tracker() -> (PresenceTracker, Arc<RecordingSink>, EventDispatcher) {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = EventDispatcher::new();
        let config = HubConfig::new("me").with_presence_query_timeout(Duration::from_secs(5));
        let tracker = PresenceTracker::new(
            Arc::clone(&sink) as Arc<dyn SignalSink>,
            dispatcher.clone(),
            &config,
        );
        (tracker, sink, dispatcher)
    }

    /// Wait until the spawned query has put its frame on the sink.
    async fn sent_query(sink: &RecordingSink) -> (RequestId, Vec<UserId>) {
        loop {
            if let Some(ClientMessage::PresenceQuery {
                request_id,
                user_ids,
            }) = sink.frames.lock().unwrap().last().cloned()
            {
                return (request_id, user_ids);
            }
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn older_push_is_discarded() {
        let (tracker, _sink, dispatcher) = tracker();
        let changes = Arc::new(StdMutex::new(0));
        let counter = Arc::clone(&changes);
        let _sub = dispatcher.on(EventKind::PresenceChanged, move |_| {
            *counter.lock().unwrap() += 1;
        });

        tracker.handle_status(entry("bob", true, 10));
        tracker.handle_status(entry("bob", false, 5));

        let cached = tracker.get_cached("bob").unwrap();
        assert!(cached.is_online);
        assert_eq!(cached.last_active_at, at(10));
        assert_eq!(*changes.lock().unwrap(), 1);
    }

    #[test]
    fn equal_timestamp_does_not_replace() {
        let (tracker, _sink, _dispatcher) = tracker();
        tracker.handle_status(entry("bob", true, 10));
        tracker.handle_status(entry("bob", false, 10));
        assert!(tracker.get_cached("bob").unwrap().is_online);
    }

    #[test]
    fn seed_uses_the_same_merge_rule() {
        let (tracker, _sink, _dispatcher) = tracker();
        tracker.handle_status(entry("bob", true, 20));
        let changed = tracker.seed([entry("bob", false, 1), entry("carol", true, 1)]);

        assert_eq!(changed, 1);
        assert_eq!(tracker.online_users(), vec!["bob".to_owned(), "carol".to_owned()]);
    }

    #[tokio::test]
    async fn empty_query_sends_nothing() {
        let (tracker, sink, _dispatcher) = tracker();
        let result = tracker.query_batch(Vec::<String>::new()).await.unwrap();
        assert!(result.is_empty());
        assert!(sink.frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn query_merges_snapshot_without_regressing_newer_push() {
        let (tracker, sink, _dispatcher) = tracker();
        tracker.handle_status(entry("bob", true, 50));

        let querying = tracker.clone();
        let query =
            tokio::spawn(async move { querying.query_batch(["bob", "carol", "bob"]).await });

        let (request_id, user_ids) = sent_query(&sink).await;
        assert_eq!(user_ids, vec!["bob".to_owned(), "carol".to_owned()]);

        tracker.handle_snapshot(PresenceSnapshot {
            request_id,
            entries: vec![entry("bob", false, 40), entry("carol", true, 45)],
        });

        let result = query.await.unwrap().unwrap();
        assert_eq!(result.len(), 2);
        assert!(result["bob"].is_online);
        assert_eq!(result["bob"].last_active_at, at(50));
        assert!(result["carol"].is_online);
    }

    #[tokio::test(start_paused = true)]
    async fn query_times_out_without_snapshot() {
        let (tracker, _sink, _dispatcher) = tracker();
        let err = tracker.query_batch(["bob"]).await.unwrap_err();
        assert!(matches!(err, HubError::Timeout));
        assert!(lock(&tracker.inner.pending).is_empty());
    }

    #[tokio::test]
    async fn abandoned_query_fails_with_not_connected() {
        let (tracker, sink, _dispatcher) = tracker();
        let querying = tracker.clone();
        let query = tokio::spawn(async move { querying.query_batch(["bob"]).await });

        sent_query(&sink).await;
        tracker.abandon_queries();

        let err = query.await.unwrap().unwrap_err();
        assert!(matches!(err, HubError::NotConnected));
    }

    #[test]
    fn unsolicited_snapshot_is_still_merged() {
        let (tracker, _sink, _dispatcher) = tracker();
        tracker.handle_snapshot(PresenceSnapshot {
            request_id: Uuid::new_v4(),
            entries: vec![entry("dave", true, 1)],
        });
        assert!(tracker.get_cached("dave").is_some());
    }
}
