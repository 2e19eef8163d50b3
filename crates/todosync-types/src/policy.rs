//! Synchronization policy knobs.

use serde::{Deserialize, Serialize};

/// Tunables for presence liveness, retention, and replay bounds.
///
/// Loaded from the `[sync]` section of the server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncPolicy {
    /// A live session with no heartbeat for this long is evicted.
    pub heartbeat_timeout_secs: u64,
    /// How often the presence sweeper looks for silent sessions.
    pub sweep_interval_secs: u64,
    /// Events older than this are force-expired even if unacknowledged.
    pub retention_secs: u64,
    /// How often the retention task runs.
    pub expiry_interval_secs: u64,
    /// Reconnect backlogs larger than this get `ResyncRequired` instead of replay.
    pub max_replay_events: u64,
    /// Disconnected sessions are forgotten after this long.
    pub session_retention_secs: u64,
    /// Capacity of each connection's outbound frame buffer.
    pub outbound_buffer: usize,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 45,
            sweep_interval_secs: 15,
            retention_secs: 7 * 24 * 60 * 60,
            expiry_interval_secs: 300,
            max_replay_events: 1_000,
            session_retention_secs: 30 * 24 * 60 * 60,
            outbound_buffer: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_values() {
        let policy = SyncPolicy::default();
        assert_eq!(policy.heartbeat_timeout_secs, 45);
        assert_eq!(policy.sweep_interval_secs, 15);
        assert_eq!(policy.retention_secs, 604_800);
        assert_eq!(policy.max_replay_events, 1_000);
        assert_eq!(policy.outbound_buffer, 256);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let policy: SyncPolicy =
            serde_json::from_str(r#"{"max_replay_events": 10}"#).expect("should deserialize");
        assert_eq!(policy.max_replay_events, 10);
        assert_eq!(policy.heartbeat_timeout_secs, 45);
    }
}
