//! The watch engine: range subscriptions over the revision stream, replayed
//! from a bounded history buffer when a client asks for events starting in
//! the past, and delivered live as the apply pipeline produces new
//! revisions. Each subscription gets its own bounded `tokio::sync::mpsc`
//! channel, the way the teacher's `mvcc::scan` keeps one iterator per
//! caller rather than a single shared cursor; a slow receiver that can't
//! keep its channel drained is evicted rather than allowed to stall the
//! whole engine.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::{CResult, Error};
use crate::revision::{Event, Revision};

pub type WatchId = i64;

/// Default bound on each subscription's outgoing channel. A watcher that
/// falls this far behind gets canceled instead of backing up memory.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Number of revisions' worth of events kept for replay. A start_revision
/// older than what's in this buffer (and not yet compacted) still returns
/// `CompactedOutOfRange`-like behavior in spirit, but bounded by buffer
/// size rather than the backend's compaction watermark -- see DESIGN.md.
const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

#[derive(Clone, Debug)]
pub struct WatchRequest {
    pub key: Vec<u8>,
    pub range_end: Option<Vec<u8>>,
    /// 0 means "start from now"; a positive value replays history from
    /// (and including) that revision.
    pub start_revision: Revision,
    pub progress_notify: bool,
}

#[derive(Clone, Debug)]
pub enum WatchResponse {
    Events { watch_id: WatchId, revision: Revision, events: Vec<Event> },
    Progress { watch_id: WatchId, revision: Revision },
    Canceled { watch_id: WatchId, reason: String },
}

struct Watcher {
    key: Vec<u8>,
    range_end: Option<Vec<u8>>,
    progress_notify: bool,
    sender: mpsc::Sender<WatchResponse>,
}

impl Watcher {
    fn matches(&self, key: &[u8]) -> bool {
        match &self.range_end {
            None => key == self.key.as_slice(),
            Some(end) if end.is_empty() => key >= self.key.as_slice(),
            Some(end) => key >= self.key.as_slice() && key < end.as_slice(),
        }
    }
}

struct State {
    next_id: WatchId,
    watchers: HashMap<WatchId, Watcher>,
    history: VecDeque<(Revision, Vec<Event>)>,
    history_cap: usize,
}

pub struct WatchEngine {
    state: Mutex<State>,
    channel_capacity: usize,
}

impl WatchEngine {
    pub fn new() -> Self {
        Self::with_capacities(DEFAULT_CHANNEL_CAPACITY, DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacities(channel_capacity: usize, history_capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1,
                watchers: HashMap::new(),
                history: VecDeque::with_capacity(history_capacity),
                history_cap: history_capacity,
            }),
            channel_capacity,
        }
    }

    /// Called once per applied revision, after the backend mutation that
    /// produced `events` commits. Fans events out to matching live
    /// watchers and appends to the replay buffer.
    pub fn notify(&self, revision: Revision, events: Vec<Event>) -> CResult<()> {
        let mut state = self.state.lock()?;

        if state.history.len() == state.history_cap {
            state.history.pop_front();
        }
        state.history.push_back((revision, events.clone()));

        let mut dead = Vec::new();
        for (&id, watcher) in state.watchers.iter() {
            let matched: Vec<Event> = events.iter().filter(|e| watcher.matches(&e.kv.key)).cloned().collect();
            if matched.is_empty() {
                continue;
            }
            if watcher
                .sender
                .try_send(WatchResponse::Events { watch_id: id, revision, events: matched })
                .is_err()
            {
                dead.push(id);
            }
        }
        for id in dead {
            if let Some(w) = state.watchers.remove(&id) {
                let _ = w.sender.try_send(WatchResponse::Canceled {
                    watch_id: id,
                    reason: "slow watcher evicted".into(),
                });
            }
        }
        Ok(())
    }

    /// Sends a `Progress` response to every subscriber that asked for it,
    /// carrying the store's current revision. Intended to be called off a
    /// periodic tick even when no keys in a watcher's range have changed,
    /// so clients can detect a live-but-idle connection.
    pub fn notify_progress(&self, current_revision: Revision) -> CResult<()> {
        let state = self.state.lock()?;
        for (&id, watcher) in state.watchers.iter() {
            if watcher.progress_notify {
                let _ = watcher
                    .sender
                    .try_send(WatchResponse::Progress { watch_id: id, revision: current_revision });
            }
        }
        Ok(())
    }

    /// Registers a new subscription, replaying any buffered history at or
    /// after `req.start_revision` before the caller starts reading live
    /// events off the returned receiver.
    pub fn subscribe(
        &self,
        req: WatchRequest,
        compacted_revision: Revision,
    ) -> CResult<(WatchId, mpsc::Receiver<WatchResponse>)> {
        if req.start_revision > 0 && req.start_revision <= compacted_revision {
            return Err(Error::CompactedOutOfRange {
                requested: req.start_revision,
                compacted: compacted_revision,
            });
        }

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let mut state = self.state.lock()?;
        let id = state.next_id;
        state.next_id += 1;

        let watcher = Watcher {
            key: req.key.clone(),
            range_end: req.range_end.clone(),
            progress_notify: req.progress_notify,
            sender: tx,
        };

        if req.start_revision > 0 {
            for (revision, events) in state.history.iter() {
                if *revision < req.start_revision {
                    continue;
                }
                let matched: Vec<Event> =
                    events.iter().filter(|e| watcher.matches(&e.kv.key)).cloned().collect();
                if !matched.is_empty() {
                    let _ = watcher.sender.try_send(WatchResponse::Events {
                        watch_id: id,
                        revision: *revision,
                        events: matched,
                    });
                }
            }
        }

        state.watchers.insert(id, watcher);
        Ok((id, rx))
    }

    /// Idempotent: canceling an id that's already gone (already evicted,
    /// or never existed) is not an error.
    pub fn cancel(&self, id: WatchId) -> CResult<()> {
        let mut state = self.state.lock()?;
        if let Some(w) = state.watchers.remove(&id) {
            let _ = w.sender.try_send(WatchResponse::Canceled { watch_id: id, reason: "canceled".into() });
        }
        Ok(())
    }

    pub fn watcher_count(&self) -> usize {
        self.state.lock().map(|s| s.watchers.len()).unwrap_or(0)
    }
}

impl Default for WatchEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{EventType, KeyValue};

    fn put_event(key: &[u8], rev: Revision) -> Event {
        Event {
            kind: EventType::Put,
            kv: KeyValue { key: key.to_vec(), value: vec![], create_revision: rev, mod_revision: rev, version: 1, lease: 0 },
            prev_kv: None,
        }
    }

    #[tokio::test]
    async fn live_watcher_receives_matching_events() {
        let engine = WatchEngine::new();
        let req = WatchRequest { key: b"a".to_vec(), range_end: None, start_revision: 0, progress_notify: false };
        let (_id, mut rx) = engine.subscribe(req, 0).unwrap();

        engine.notify(1, vec![put_event(b"a", 1)]).unwrap();
        engine.notify(2, vec![put_event(b"z", 2)]).unwrap();

        let msg = rx.recv().await.unwrap();
        match msg {
            WatchResponse::Events { revision, events, .. } => {
                assert_eq!(revision, 1);
                assert_eq!(events.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn subscribe_replays_buffered_history() {
        let engine = WatchEngine::new();
        engine.notify(1, vec![put_event(b"a", 1)]).unwrap();
        engine.notify(2, vec![put_event(b"a", 2)]).unwrap();

        let req = WatchRequest { key: b"a".to_vec(), range_end: None, start_revision: 1, progress_notify: false };
        let (_id, mut rx) = engine.subscribe(req, 0).unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, WatchResponse::Events { revision: 1, .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, WatchResponse::Events { revision: 2, .. }));
    }

    #[test]
    fn subscribe_rejects_compacted_start_revision() {
        let engine = WatchEngine::new();
        let req = WatchRequest { key: b"a".to_vec(), range_end: None, start_revision: 3, progress_notify: false };
        assert!(matches!(engine.subscribe(req, 5), Err(Error::CompactedOutOfRange { .. })));
    }

    #[test]
    fn cancel_is_idempotent() {
        let engine = WatchEngine::new();
        let req = WatchRequest { key: b"a".to_vec(), range_end: None, start_revision: 0, progress_notify: false };
        let (id, _rx) = engine.subscribe(req, 0).unwrap();
        engine.cancel(id).unwrap();
        engine.cancel(id).unwrap();
        assert_eq!(engine.watcher_count(), 0);
    }
}
