//! Idempotent responder cache.
//!
//! Records the exact response sent for a request fingerprint (request bytes
//! hash plus sender), so a retransmitted request is answered from cache and
//! never reprocessed.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use super::DatagramSink;
use crate::crypto::sha256;

type Fingerprint = ([u8; 32], SocketAddr);

#[derive(Debug)]
struct CachedResponse {
    response: Vec<u8>,
    expires_ms: u64,
}

#[derive(Debug)]
pub struct ResponderCache {
    entries: HashMap<Fingerprint, CachedResponse>,
    order: VecDeque<(Fingerprint, u64)>,
    retention_ms: u64,
    capacity: usize,
}

impl ResponderCache {
    pub fn new(retention_ms: u64, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            retention_ms,
            capacity,
        }
    }

    fn fingerprint(request: &[u8], from: SocketAddr) -> Fingerprint {
        (sha256(request), from)
    }

    /// If `request` from `from` was answered before, resend that answer.
    pub fn replay(&self, request: &[u8], from: SocketAddr, sink: &mut impl DatagramSink) -> bool {
        match self.entries.get(&Self::fingerprint(request, from)) {
            Some(cached) => {
                sink.send_datagram(from, cached.response.clone());
                true
            }
            None => false,
        }
    }

    /// Send `response` to `from` and remember it for `request`.
    pub fn respond(
        &mut self,
        request: &[u8],
        from: SocketAddr,
        response: Vec<u8>,
        now_ms: u64,
        sink: &mut impl DatagramSink,
    ) {
        sink.send_datagram(from, response.clone());

        let key = Self::fingerprint(request, from);
        if !self.entries.contains_key(&key) {
            self.evict_for_capacity();
        }
        let expires_ms = now_ms + self.retention_ms;
        self.entries.insert(
            key,
            CachedResponse {
                response,
                expires_ms,
            },
        );
        self.order.push_back((key, expires_ms));
    }

    /// Drop the oldest entries until one more fits. Order records left
    /// behind by a refresh are skipped, not counted.
    fn evict_for_capacity(&mut self) {
        while self.entries.len() >= self.capacity {
            let Some((oldest, expires_ms)) = self.order.pop_front() else {
                break;
            };
            if self
                .entries
                .get(&oldest)
                .is_some_and(|c| c.expires_ms == expires_ms)
            {
                self.entries.remove(&oldest);
            }
        }
    }

    /// Evict entries past their retention.
    pub fn on_tick(&mut self, now_ms: u64) {
        while let Some((key, expires_ms)) = self.order.front().copied() {
            if expires_ms > now_ms {
                break;
            }
            self.order.pop_front();
            // A re-response may have refreshed this key
            if self
                .entries
                .get(&key)
                .is_some_and(|c| c.expires_ms <= now_ms)
            {
                self.entries.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliable::Outbox;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_replay_identical_request() {
        let mut cache = ResponderCache::new(1_000, 16);
        let mut out = Outbox::new();

        assert!(!cache.replay(b"syn", addr(1), &mut out));
        cache.respond(b"syn", addr(1), b"npack".to_vec(), 0, &mut out);
        assert_eq!(out.pop().unwrap().data, b"npack".to_vec());

        assert!(cache.replay(b"syn", addr(1), &mut out));
        assert_eq!(out.pop().unwrap().data, b"npack".to_vec());

        // Different sender or bytes is a different request
        assert!(!cache.replay(b"syn", addr(2), &mut out));
        assert!(!cache.replay(b"syn2", addr(1), &mut out));
    }

    #[test]
    fn test_eviction_by_time() {
        let mut cache = ResponderCache::new(1_000, 16);
        let mut out = Outbox::new();
        cache.respond(b"a", addr(1), vec![1], 0, &mut out);
        cache.on_tick(999);
        assert_eq!(cache.len(), 1);
        cache.on_tick(1_000);
        assert!(cache.is_empty());
        assert!(!cache.replay(b"a", addr(1), &mut out));
    }

    #[test]
    fn test_eviction_by_size() {
        let mut cache = ResponderCache::new(10_000, 2);
        let mut out = Outbox::new();
        cache.respond(b"a", addr(1), vec![1], 0, &mut out);
        cache.respond(b"b", addr(1), vec![2], 0, &mut out);
        cache.respond(b"c", addr(1), vec![3], 0, &mut out);
        assert_eq!(cache.len(), 2);
        assert!(!cache.replay(b"a", addr(1), &mut out));
        assert!(cache.replay(b"c", addr(1), &mut out));
    }

    #[test]
    fn test_size_eviction_skips_refreshed_entry() {
        let mut cache = ResponderCache::new(10_000, 2);
        let mut out = Outbox::new();
        cache.respond(b"a", addr(1), vec![1], 0, &mut out);
        cache.respond(b"b", addr(1), vec![2], 10, &mut out);
        // Refreshing "a" makes "b" the oldest live entry
        cache.respond(b"a", addr(1), vec![1], 20, &mut out);
        assert_eq!(cache.len(), 2);

        cache.respond(b"c", addr(1), vec![3], 30, &mut out);
        assert_eq!(cache.len(), 2);
        assert!(cache.replay(b"a", addr(1), &mut out));
        assert!(!cache.replay(b"b", addr(1), &mut out));
        assert!(cache.replay(b"c", addr(1), &mut out));
    }

    #[test]
    fn test_refresh_survives_old_expiry() {
        let mut cache = ResponderCache::new(1_000, 16);
        let mut out = Outbox::new();
        cache.respond(b"a", addr(1), vec![1], 0, &mut out);
        cache.respond(b"a", addr(1), vec![1], 500, &mut out);
        cache.on_tick(1_000);
        assert_eq!(cache.len(), 1);
        cache.on_tick(1_500);
        assert!(cache.is_empty());
    }
}
