//! Session tuning loaded from TOML.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tandem_net::{
    ConnectionConfig, FullSyncConfig, IceConfig, LivenessConfig, RendezvousConfig,
};

/// Every timer, threshold and server list a session uses. Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Ping period.
    pub heartbeat_interval_ms: u64,
    /// Intervals without a pong before disconnecting.
    pub heartbeat_timeout_multiplier: u32,
    /// Outbound buffer level above which snapshots and keys are dropped.
    pub backpressure_threshold: usize,
    /// Wait before the single retry of a failed critical send.
    pub critical_retry_delay_ms: u64,
    /// Full-sync resends after the first send.
    pub full_sync_retry_budget: u32,
    /// Wait before the first full-sync resend; doubles each time.
    pub full_sync_backoff_ms: u64,
    /// Host snapshot period; also the guest's interpolation window.
    pub snapshot_interval_ms: u64,
    /// Bound on a whole rendezvous negotiation.
    pub negotiation_timeout_ms: u64,
    /// Bound on dialing one candidate.
    pub candidate_timeout_ms: u64,
    /// Fresh room codes tried after a collision.
    pub max_collision_retries: u32,
    /// STUN and relay servers.
    pub ice: IceConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_multiplier: 5,
            backpressure_threshold: 64 * 1024,
            critical_retry_delay_ms: 100,
            full_sync_retry_budget: 3,
            full_sync_backoff_ms: 500,
            snapshot_interval_ms: 50,
            negotiation_timeout_ms: 15_000,
            candidate_timeout_ms: 3_000,
            max_collision_retries: 5,
            ice: IceConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Connection manager settings.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            liveness: LivenessConfig {
                interval: Duration::from_millis(self.heartbeat_interval_ms),
                timeout_multiplier: self.heartbeat_timeout_multiplier,
            },
            backpressure_threshold: self.backpressure_threshold,
            critical_retry_delay: Duration::from_millis(self.critical_retry_delay_ms),
        }
    }

    /// Full-sync retry settings.
    pub fn full_sync(&self) -> FullSyncConfig {
        FullSyncConfig {
            retry_budget: self.full_sync_retry_budget,
            base_backoff: Duration::from_millis(self.full_sync_backoff_ms),
        }
    }

    /// Rendezvous bounds.
    pub fn rendezvous(&self) -> RendezvousConfig {
        RendezvousConfig {
            negotiation_timeout: Duration::from_millis(self.negotiation_timeout_ms),
            candidate_timeout: Duration::from_millis(self.candidate_timeout_ms),
            max_collision_retries: self.max_collision_retries,
        }
    }

    /// Snapshot period.
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_library_constants() {
        let config = SessionConfig::default();
        assert_eq!(config.connection(), ConnectionConfig::default());
        assert_eq!(config.full_sync(), FullSyncConfig::default());
        assert_eq!(config.rendezvous(), RendezvousConfig::default());
        assert_eq!(
            config.snapshot_interval(),
            tandem_net::interpolation::DEFAULT_SNAPSHOT_INTERVAL
        );
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: SessionConfig = toml::from_str(
            r#"
            heartbeat_interval_ms = 250

            [ice]
            stun_servers = ["stun.example.net:3478"]
            "#,
        )
        .expect("parse");
        assert_eq!(config.heartbeat_interval_ms, 250);
        assert_eq!(config.full_sync_retry_budget, 3);
        assert_eq!(config.ice.stun_servers, vec!["stun.example.net:3478"]);
        assert!(config.ice.relays.is_empty());
    }

    #[test]
    fn relay_credentials_parse() {
        let config: SessionConfig = toml::from_str(
            r#"
            [[ice.relays]]
            address = "turn.example.net:3478"
            username = "tandem"
            password = "hunter2"

            [[ice.relays]]
            address = "open-relay.example.net:3478"
            "#,
        )
        .expect("parse");
        assert_eq!(
            config.ice.relays,
            vec![
                tandem_net::RelayServer {
                    address: "turn.example.net:3478".into(),
                    username: "tandem".into(),
                    password: "hunter2".into(),
                },
                tandem_net::RelayServer {
                    address: "open-relay.example.net:3478".into(),
                    ..Default::default()
                },
            ]
        );
    }

    #[test]
    fn toml_roundtrip() {
        let config = SessionConfig::default();
        let text = toml::to_string_pretty(&config).expect("serialize");
        let back: SessionConfig = toml::from_str(&text).expect("parse");
        assert_eq!(config, back);
    }
}
