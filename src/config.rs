//! Transport configuration.
//!
//! Options consumed by the [`crate::bridge::TransportBridge`] and the
//! reliable-delivery layer. Defaults match the wire protocol the peer CLI
//! ships with; changing them on one side only degrades (but does not break)
//! delivery.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which underlying driver the bridge uses for main traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Subscription-oriented signaling relay; frames are JSON envelopes.
    #[default]
    Relay,
    /// Direct peer data channel; frames are binary.
    Peer,
}

/// Tuning knobs for the reliable-delivery layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReliableConfig {
    /// Base retransmission timeout in milliseconds.
    pub retransmit_timeout_ms: u64,
    /// Cap for exponential backoff in milliseconds.
    pub max_retransmit_ms: u64,
    /// Multiplicative backoff factor per attempt.
    pub backoff: f64,
    /// Maximum transmission attempts before a pending frame is dropped.
    pub max_attempts: u32,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            retransmit_timeout_ms: 3000,
            max_retransmit_ms: 30000,
            backoff: 1.5,
            max_attempts: 10,
        }
    }
}

impl ReliableConfig {
    /// Timeout for a given attempt count using exponential backoff.
    pub fn timeout_for(&self, attempts: u32) -> Duration {
        let base = self.retransmit_timeout_ms as f64;
        let backed_off = base * self.backoff.powi(attempts.saturating_sub(1) as i32);
        let capped = backed_off.min(self.max_retransmit_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Bridge-level transport options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportOptions {
    /// Which driver carries main traffic.
    pub transport: TransportKind,
    /// Reliable-delivery tuning.
    pub reliable: ReliableConfig,
    /// How long `subscribe` waits for peer confirmation, in milliseconds.
    pub subscribe_timeout_ms: u64,
    /// Delay between the last release of a hub and channel teardown,
    /// in milliseconds. Absorbs navigation churn.
    pub grace_close_ms: u64,
    /// Gzip threshold for outbound JSON payloads. `None` disables
    /// compression entirely.
    pub compression_threshold: Option<usize>,
    /// Consecutive decrypt failures on one subscription before the session
    /// is declared invalid.
    pub decrypt_failure_threshold: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            transport: TransportKind::Relay,
            reliable: ReliableConfig::default(),
            subscribe_timeout_ms: 10000,
            grace_close_ms: 2000,
            compression_threshold: Some(4096),
            decrypt_failure_threshold: 3,
        }
    }
}

impl TransportOptions {
    /// Subscribe confirmation timeout as a `Duration`.
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    /// Grace-close delay as a `Duration`.
    pub fn grace_close(&self) -> Duration {
        Duration::from_millis(self.grace_close_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_increases_and_caps() {
        let cfg = ReliableConfig::default();
        let t1 = cfg.timeout_for(1);
        let t2 = cfg.timeout_for(2);
        assert_eq!(t1, Duration::from_millis(3000));
        assert!(t2 > t1);
        assert!(cfg.timeout_for(50) <= Duration::from_millis(30000));
    }

    #[test]
    fn test_defaults_match_wire_protocol() {
        let opts = TransportOptions::default();
        assert_eq!(opts.subscribe_timeout(), Duration::from_secs(10));
        assert_eq!(opts.grace_close(), Duration::from_secs(2));
        assert_eq!(opts.reliable.max_attempts, 10);
        assert_eq!(opts.decrypt_failure_threshold, 3);
    }

    #[test]
    fn test_transport_kind_serde() {
        let json = serde_json::to_string(&TransportKind::Peer).expect("serialize");
        assert_eq!(json, "\"peer\"");
        let kind: TransportKind = serde_json::from_str("\"relay\"").expect("deserialize");
        assert_eq!(kind, TransportKind::Relay);
    }
}
