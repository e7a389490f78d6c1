//! Reliable Request Layer
//!
//! Request/response over UDP without a connection: a pending-wait set that
//! retransmits on a geometric schedule until a matching datagram arrives or
//! the deadline passes, and a responder cache that answers retransmitted
//! requests with the exact bytes sent the first time.
//!
//! Both structures are driven by the engine's fixed tick and never block.

mod pending;
mod responder;

use std::collections::VecDeque;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use pending::{Expired, Matched, PendingRequests, RequestHandle, ResponseMatcher};
pub use responder::ResponderCache;

/// Errors from the reliable request layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,

    #[error("pending request table full ({capacity} entries)")]
    Overflow { capacity: usize },
}

/// Anything that accepts outbound datagrams.
pub trait DatagramSink {
    fn send_datagram(&mut self, to: SocketAddr, data: Vec<u8>);
}

/// A datagram waiting to be written to the socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundDatagram {
    pub to: SocketAddr,
    pub data: Vec<u8>,
}

/// FIFO of datagrams produced by one engine step.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<OutboundDatagram>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&mut self) -> Option<OutboundDatagram> {
        self.queue.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = OutboundDatagram> + '_ {
        self.queue.drain(..)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl DatagramSink for Outbox {
    fn send_datagram(&mut self, to: SocketAddr, data: Vec<u8>) {
        self.queue.push_back(OutboundDatagram { to, data });
    }
}

/// Geometric retransmission schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetransmitSchedule {
    /// First retransmission delay (`retransmit.initial_interval_ms`).
    #[serde(default = "RetransmitSchedule::default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Multiplier applied after each retransmission (`retransmit.increment`).
    #[serde(default = "RetransmitSchedule::default_increment")]
    pub increment: f64,

    /// Upper bound on the interval (`retransmit.max_interval_ms`).
    #[serde(default = "RetransmitSchedule::default_max_interval_ms")]
    pub max_interval_ms: u64,
}

impl Default for RetransmitSchedule {
    fn default() -> Self {
        Self {
            initial_interval_ms: Self::default_initial_interval_ms(),
            increment: Self::default_increment(),
            max_interval_ms: Self::default_max_interval_ms(),
        }
    }
}

impl RetransmitSchedule {
    fn default_initial_interval_ms() -> u64 {
        300
    }
    fn default_increment() -> f64 {
        1.5
    }
    fn default_max_interval_ms() -> u64 {
        3_000
    }

    /// Interval following `current`.
    pub fn next_interval(&self, current_ms: u64) -> u64 {
        let next = (current_ms as f64 * self.increment.max(1.0)) as u64;
        next.clamp(1, self.max_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_geometric_and_capped() {
        let s = RetransmitSchedule {
            initial_interval_ms: 100,
            increment: 2.0,
            max_interval_ms: 500,
        };
        assert_eq!(s.next_interval(100), 200);
        assert_eq!(s.next_interval(200), 400);
        assert_eq!(s.next_interval(400), 500);
    }

    #[test]
    fn test_schedule_never_shrinks() {
        let s = RetransmitSchedule {
            initial_interval_ms: 100,
            increment: 0.5,
            max_interval_ms: 500,
        };
        assert_eq!(s.next_interval(100), 100);
    }

    #[test]
    fn test_outbox_fifo() {
        let mut out = Outbox::new();
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        out.send_datagram(a, vec![1]);
        out.send_datagram(a, vec![2]);
        assert_eq!(out.len(), 2);
        assert_eq!(out.pop().unwrap().data, vec![1]);
        assert_eq!(out.drain().count(), 1);
        assert!(out.is_empty());
    }
}
