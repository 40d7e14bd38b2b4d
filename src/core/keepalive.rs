//! Application-level keepalive for the feed socket.
//!
//! Pings are `{"type":"ping","timestamp":ms}` text frames; the server echoes the timestamp back
//! in a `pong`. Outstanding pings are keyed by that timestamp. A ping left unanswered for longer
//! than the pong timeout counts as one miss; enough consecutive misses declare the socket dead.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::envelope::encode_ping;
use super::frame::WsFrame;
use super::types::FeedResult;
use crate::config::KeepaliveConfig;

/// What the actor should do on a keepalive tick.
#[derive(Debug, Clone, PartialEq)]
pub enum KeepaliveTick {
    SendPing { timestamp: u64, payload: Bytes },
    Dead { missed: u32 },
}

#[derive(Debug)]
pub struct Keepalive {
    config: KeepaliveConfig,
    pending: HashMap<u64, Instant>,
    missed: u32,
}

impl Keepalive {
    pub fn new(config: KeepaliveConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            missed: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Expire overdue pings, then either emit a new ping or report the socket dead.
    pub fn on_tick(&mut self, now: Instant, wall_ms: u64) -> FeedResult<KeepaliveTick> {
        let timeout = self.config.pong_timeout;
        let before = self.pending.len();
        self.pending
            .retain(|_, sent| now.saturating_duration_since(*sent) <= timeout);
        let expired = (before - self.pending.len()) as u32;
        self.missed = self.missed.saturating_add(expired);

        if self.config.max_missed > 0 && self.missed >= self.config.max_missed {
            return Ok(KeepaliveTick::Dead {
                missed: self.missed,
            });
        }

        // Two ticks inside the same millisecond must not share a key.
        let mut timestamp = wall_ms;
        while self.pending.contains_key(&timestamp) {
            timestamp = timestamp.wrapping_add(1);
        }
        let payload = encode_ping(timestamp)?;
        self.pending.insert(timestamp, now);
        Ok(KeepaliveTick::SendPing { timestamp, payload })
    }

    /// Match a pong against an outstanding ping; returns the round-trip time when matched.
    pub fn on_pong(&mut self, timestamp: u64, now: Instant) -> Option<Duration> {
        let sent = self.pending.remove(&timestamp)?;
        self.missed = 0;
        Some(now.saturating_duration_since(sent))
    }

    /// Protocol-level pings are answered with a pong carrying the same payload.
    pub fn protocol_reply(frame: &WsFrame) -> Option<WsFrame> {
        match frame {
            WsFrame::Ping(payload) => Some(WsFrame::Pong(payload.clone())),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.missed = 0;
    }
}
