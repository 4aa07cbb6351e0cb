//! Engine configuration.
//!
//! Every timing and ranking knob lives here rather than as a hidden
//! constant: priorities and retry curves are venue policy, not protocol.

use crate::protocol::MessageKind;
use rand::Rng;
use std::time::Duration;

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Human-readable device name shown on other tablets.
    pub device_name: String,
    /// How often each peer loop sends a heartbeat.
    pub heartbeat_interval: Duration,
    /// How long a peer may stay silent (any traffic counts) before it is
    /// marked disconnected and its loop ends.
    pub liveness_timeout: Duration,
    /// Bound on a single connect attempt, per mechanism.
    pub connect_timeout: Duration,
    /// Bound on a single send.
    pub send_timeout: Duration,
    /// How long `stop_sync` waits for peer loops to finish in-flight work.
    pub drain_timeout: Duration,
    /// Retransmission policy for unacknowledged outbox entries.
    pub retry: RetryPolicy,
    /// Priority ranks per message kind.
    pub priorities: PriorityMap,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_name: "Comanda Device".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(3),
            send_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            priorities: PriorityMap::default(),
        }
    }
}

/// Exponential backoff policy for unacknowledged sends.
///
/// The delay for attempt `n` is `base * factor^n`, capped at `max_delay`,
/// with a ± `jitter` fraction applied so a roomful of tablets does not
/// retry in lockstep. Exhausting `max_attempts` presumes the peer
/// unreachable for this connection; the outbox entry itself is never
/// discarded.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before the peer is presumed unreachable.
    pub max_attempts: u32,
    /// Delay before the first retransmission.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Exponential growth factor.
    pub factor: f64,
    /// Jitter fraction in `[0.0, 1.0]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Returns the backoff delay for the given attempt number (0-based),
    /// without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Returns the jittered delay for the given attempt number.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt).as_millis() as f64;
        if self.jitter <= 0.0 {
            return Duration::from_millis(base as u64);
        }
        let spread = base * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((base + offset).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts` tries.
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Priority ranks assigned to message kinds.
///
/// A kitchen claim outranks every plain edit regardless of version, and a
/// deletion outranks ordinary field updates. Heartbeats and acks never
/// enter conflict resolution.
#[derive(Debug, Clone)]
pub struct PriorityMap {
    /// Rank for kitchen claim events.
    pub chief_claim: i64,
    /// Rank for order deletions.
    pub order_delete: i64,
    /// Rank for every other change kind.
    pub default: i64,
}

impl Default for PriorityMap {
    fn default() -> Self {
        Self {
            chief_claim: 10,
            order_delete: 5,
            default: 0,
        }
    }
}

impl PriorityMap {
    /// Returns the rank for a message kind.
    pub fn rank(&self, kind: MessageKind) -> i64 {
        match kind {
            MessageKind::ChiefClaim => self.chief_claim,
            MessageKind::OrderDelete => self.order_delete,
            MessageKind::Heartbeat | MessageKind::Ack => 0,
            _ => self.default,
        }
    }
}
