//! Pending-wait set.
//!
//! Every wait carries a caller-defined `waiter` tag that identifies the
//! continuation to resume. Each wait produces exactly one outcome: a
//! [`Matched`] response from [`PendingRequests::on_datagram`] or an
//! [`Expired`] timeout from [`PendingRequests::on_tick`]. Cancelled waits
//! produce neither.

use std::fmt;
use std::net::SocketAddr;

use tracing::{debug, warn};

use super::{DatagramSink, RequestError, RetransmitSchedule};

/// Opaque id of one pending wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(u64);

/// Predicate deciding whether an inbound datagram answers a wait.
///
/// The sender address and a fixed byte prefix are compared first; the
/// optional content filter (e.g. HMAC verification) runs only on prefix
/// matches.
pub struct ResponseMatcher {
    from: SocketAddr,
    prefix: Vec<u8>,
    filter: Option<Box<dyn Fn(&[u8]) -> bool + Send>>,
}

impl ResponseMatcher {
    pub fn new(from: SocketAddr, prefix: Vec<u8>) -> Self {
        Self {
            from,
            prefix,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Fn(&[u8]) -> bool + Send + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn matches(&self, from: SocketAddr, data: &[u8]) -> bool {
        if from != self.from || !data.starts_with(&self.prefix) {
            return false;
        }
        match &self.filter {
            Some(filter) => filter(data),
            None => true,
        }
    }
}

impl fmt::Debug for ResponseMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseMatcher")
            .field("from", &self.from)
            .field("prefix", &hex::encode(&self.prefix))
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// A wait resolved by a matching datagram.
#[derive(Debug)]
pub struct Matched<W> {
    pub handle: RequestHandle,
    pub waiter: W,
    pub response: Vec<u8>,
}

/// A wait whose deadline passed.
#[derive(Debug)]
pub struct Expired<W> {
    pub handle: RequestHandle,
    pub waiter: W,
    pub transmissions: u32,
}

struct PendingRequest<W> {
    handle: RequestHandle,
    destination: SocketAddr,
    payload: Option<Vec<u8>>,
    matcher: ResponseMatcher,
    expires_ms: u64,
    next_send_ms: u64,
    interval_ms: u64,
    transmissions: u32,
    waiter: W,
}

/// All outstanding waits of one engine, in registration order.
pub struct PendingRequests<W> {
    entries: Vec<PendingRequest<W>>,
    next_handle: u64,
    capacity: usize,
}

impl<W> PendingRequests<W> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_handle: 1,
            capacity,
        }
    }

    /// Register a wait. With a payload, send it now and retransmit on
    /// `schedule` until matched or `expires_ms`; without one, only wait.
    #[allow(clippy::too_many_arguments)]
    pub fn send_and_wait(
        &mut self,
        destination: SocketAddr,
        payload: Option<Vec<u8>>,
        matcher: ResponseMatcher,
        expires_ms: u64,
        schedule: &RetransmitSchedule,
        waiter: W,
        now_ms: u64,
        sink: &mut impl DatagramSink,
    ) -> Result<RequestHandle, RequestError> {
        if self.entries.len() >= self.capacity {
            warn!(
                capacity = self.capacity,
                destination = %destination,
                "Pending request table overflow"
            );
            return Err(RequestError::Overflow {
                capacity: self.capacity,
            });
        }

        let handle = RequestHandle(self.next_handle);
        self.next_handle += 1;

        let mut transmissions = 0;
        if let Some(data) = &payload {
            sink.send_datagram(destination, data.clone());
            transmissions = 1;
        }

        self.entries.push(PendingRequest {
            handle,
            destination,
            payload,
            matcher,
            expires_ms,
            next_send_ms: now_ms + schedule.initial_interval_ms,
            interval_ms: schedule.initial_interval_ms,
            transmissions,
            waiter,
        });
        Ok(handle)
    }

    /// Offer an inbound datagram. The first matching wait is removed and
    /// returned.
    pub fn on_datagram(&mut self, from: SocketAddr, data: &[u8]) -> Option<Matched<W>> {
        let index = self
            .entries
            .iter()
            .position(|p| p.matcher.matches(from, data))?;
        let entry = self.entries.remove(index);
        Some(Matched {
            handle: entry.handle,
            waiter: entry.waiter,
            response: data.to_vec(),
        })
    }

    /// Remove a wait without producing an outcome.
    pub fn cancel(&mut self, handle: RequestHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|p| p.handle != handle);
        before != self.entries.len()
    }

    /// Cancel every wait whose tag satisfies `pred`.
    pub fn cancel_where(&mut self, pred: impl Fn(&W) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|p| !pred(&p.waiter));
        before - self.entries.len()
    }

    /// Retransmit due payloads and expire waits past their deadline.
    pub fn on_tick(
        &mut self,
        now_ms: u64,
        schedule: &RetransmitSchedule,
        sink: &mut impl DatagramSink,
    ) -> Vec<Expired<W>> {
        let mut expired = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if now_ms >= self.entries[i].expires_ms {
                let entry = self.entries.remove(i);
                debug!(
                    destination = %entry.destination,
                    transmissions = entry.transmissions,
                    "Pending request expired"
                );
                expired.push(Expired {
                    handle: entry.handle,
                    waiter: entry.waiter,
                    transmissions: entry.transmissions,
                });
                continue;
            }

            let entry = &mut self.entries[i];
            if now_ms >= entry.next_send_ms {
                if let Some(data) = &entry.payload {
                    sink.send_datagram(entry.destination, data.clone());
                    entry.transmissions += 1;
                }
                entry.interval_ms = schedule.next_interval(entry.interval_ms);
                entry.next_send_ms = now_ms + entry.interval_ms;
            }
            i += 1;
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, handle: RequestHandle) -> bool {
        self.entries.iter().any(|p| p.handle == handle)
    }

    /// Iterate over the tags of all outstanding waits.
    pub fn waiters(&self) -> impl Iterator<Item = &W> {
        self.entries.iter().map(|p| &p.waiter)
    }
}
