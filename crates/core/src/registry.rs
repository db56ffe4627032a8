//! C5 — stream registry: per-session index of open, observable data
//! streams. Exists for operator visibility (`streams` listing) and
//! forced teardown; pure command streams (the one the session opens
//! for itself) are never registered here.
//!
//! A registered entry can't simply own the `Stream` the way the
//! source's Go map does (the splice in [`crate::relay`] needs both
//! read and write halves at once, and "force close" has to interrupt
//! an in-flight copy rather than just dropping an idle handle). So
//! each entry is a [`CancellationToken`] the relay task selects on
//! alongside its copy futures: cancelling it drops the stream halves
//! mid-copy, which is what a forced `streams kill` needs to do.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::mux::StreamId;

#[derive(Default)]
pub struct Registry {
    streams: DashMap<StreamId, CancellationToken>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: StreamId, token: CancellationToken) {
        tracing::debug!(stream_id = %id, "stream registered");
        self.streams.insert(id, token);
    }

    pub fn unregister(&self, id: StreamId) {
        if self.streams.remove(&id).is_some() {
            tracing::debug!(stream_id = %id, "stream unregistered");
        }
    }

    pub fn ids(&self) -> Vec<StreamId> {
        self.streams.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Close and drop every registered stream exactly once.
    pub fn close_all(&self) {
        let ids: Vec<StreamId> = self.streams.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.close(id);
        }
    }

    /// Cancel a single registered stream's relay, used by `streams kill <id>`.
    pub fn close(&self, id: StreamId) -> bool {
        if let Some((_, token)) = self.streams.remove(&id) {
            tracing::debug!(stream_id = %id, "closing registered stream");
            token.cancel();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_list() {
        let registry = Registry::new();
        registry.register(StreamId(1), CancellationToken::new());
        registry.register(StreamId(2), CancellationToken::new());
        assert_eq!(registry.len(), 2);
        let mut ids = registry.ids();
        ids.sort();
        assert_eq!(ids, vec![StreamId(1), StreamId(2)]);
    }

    #[test]
    fn close_cancels_token_and_removes_entry() {
        let registry = Registry::new();
        let token = CancellationToken::new();
        registry.register(StreamId(1), token.clone());

        assert!(registry.close(StreamId(1)));
        assert!(token.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn close_unknown_id_returns_false() {
        let registry = Registry::new();
        assert!(!registry.close(StreamId(99)));
    }

    #[test]
    fn close_all_cancels_every_token() {
        let registry = Registry::new();
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        registry.register(StreamId(1), a.clone());
        registry.register(StreamId(2), b.clone());

        registry.close_all();

        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_without_cancelling() {
        let registry = Registry::new();
        let token = CancellationToken::new();
        registry.register(StreamId(1), token.clone());
        registry.unregister(StreamId(1));
        assert!(!token.is_cancelled());
        assert!(registry.is_empty());
    }
}
