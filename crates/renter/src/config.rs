use anyhow::Context;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::backoff::BackoffPolicy;
use crate::error::ConfigError;

pub const DEFAULT_LISTEN: &str = "/ip4/0.0.0.0/tcp/9100";

/// Upper bound for any single configured duration.
pub const MAX_CONFIG_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenterConfig {
    pub listen: String,
    /// Candidate hosts, either bare peer ids or `/p2p/` multiaddrs.
    pub hosts: Vec<String>,
    pub negotiation: NegotiationConfig,
    pub backoff: BackoffPolicy,
}

impl Default for RenterConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            hosts: Vec::new(),
            negotiation: NegotiationConfig::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// What a negotiator does when the drawn host does not accept the session's token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenMismatchPolicy {
    /// Fail the attempt and draw a different host on the next one.
    Redraw,
    /// Stop negotiating the shard and abort the session.
    StopShard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    #[serde(with = "duration_secs")]
    pub token_check_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub push_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub ack_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub watch_interval: Duration,
    pub token_mismatch: TokenMismatchPolicy,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            token_check_timeout: Duration::from_secs(60),
            push_timeout: Duration::from_secs(10),
            // Hosts must acknowledge within this window or the contract is void.
            ack_timeout: Duration::from_secs(30),
            watch_interval: Duration::from_secs(5),
            token_mismatch: TokenMismatchPolicy::Redraw,
        }
    }
}

impl RenterConfig {
    /// Reads a JSON config, falling back to defaults when the file does not exist.
    /// The result is validated before it is returned.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let cfg = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read renter config {}", path.display()))?;
            serde_json::from_str::<RenterConfig>(&raw)
                .with_context(|| format!("failed to parse renter config {}", path.display()))?
        } else {
            RenterConfig::default()
        };
        cfg.validate()
            .with_context(|| format!("invalid renter config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)
            .with_context(|| format!("failed to write renter config {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = &self.negotiation;
        let b = &self.backoff;
        for (field, value) in [
            ("negotiation.token_check_timeout", n.token_check_timeout),
            ("negotiation.push_timeout", n.push_timeout),
            ("negotiation.ack_timeout", n.ack_timeout),
            ("negotiation.watch_interval", n.watch_interval),
            ("backoff.initial_interval", b.initial_interval),
            ("backoff.max_interval", b.max_interval),
            ("backoff.max_elapsed", b.max_elapsed),
        ] {
            if value < Duration::from_millis(1) || value > MAX_CONFIG_DURATION {
                return Err(ConfigError::DurationOutOfRange {
                    field,
                    value,
                    max: MAX_CONFIG_DURATION,
                });
            }
        }

        if !b.multiplier.is_finite() || b.multiplier < 1.0 {
            return Err(ConfigError::Backoff(format!(
                "multiplier must be at least 1, got {}",
                b.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&b.randomization_factor) {
            return Err(ConfigError::Backoff(format!(
                "randomization_factor must be within [0, 1], got {}",
                b.randomization_factor
            )));
        }
        if b.max_interval < b.initial_interval {
            return Err(ConfigError::Backoff(
                "max_interval is shorter than initial_interval".to_string(),
            ));
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<Multiaddr, ConfigError> {
        self.listen.trim().parse().map_err(|e: libp2p::multiaddr::Error| ConfigError::Listen {
            addr: self.listen.clone(),
            reason: e.to_string(),
        })
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("neuro-renter-{tag}-{}", rand::random::<u64>()))
    }

    #[test]
    fn defaults_match_protocol_budgets() {
        let cfg = RenterConfig::default();
        assert_eq!(cfg.negotiation.token_check_timeout, Duration::from_secs(60));
        assert_eq!(cfg.negotiation.push_timeout, Duration::from_secs(10));
        assert_eq!(cfg.negotiation.ack_timeout, Duration::from_secs(30));
        assert_eq!(cfg.negotiation.watch_interval, Duration::from_secs(5));
        assert_eq!(cfg.negotiation.token_mismatch, TokenMismatchPolicy::Redraw);
        assert_eq!(cfg.backoff.max_elapsed, Duration::from_secs(300));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: RenterConfig = serde_json::from_str(
            r#"{ "hosts": ["12D3KooWabc"], "negotiation": { "ack_timeout": 12.5, "token_mismatch": "stop_shard" } }"#,
        )
        .expect("parse");
        assert_eq!(cfg.hosts, vec!["12D3KooWabc".to_string()]);
        assert_eq!(cfg.negotiation.ack_timeout, Duration::from_millis(12_500));
        assert_eq!(cfg.negotiation.push_timeout, Duration::from_secs(10));
        assert_eq!(cfg.negotiation.token_mismatch, TokenMismatchPolicy::StopShard);
        assert_eq!(cfg.listen, DEFAULT_LISTEN);
    }

    #[test]
    fn zero_and_huge_durations_are_rejected() {
        let mut cfg = RenterConfig::default();
        cfg.negotiation.ack_timeout = Duration::ZERO;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DurationOutOfRange {
                field: "negotiation.ack_timeout",
                ..
            })
        ));

        let cfg: RenterConfig =
            serde_json::from_str(r#"{ "backoff": { "max_interval": 1e18 } }"#).expect("parse");
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DurationOutOfRange {
                field: "backoff.max_interval",
                ..
            })
        ));
    }

    #[test]
    fn backoff_shape_is_checked() {
        let mut cfg = RenterConfig::default();
        cfg.backoff.multiplier = 0.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::Backoff(_))));

        let mut cfg = RenterConfig::default();
        cfg.backoff.randomization_factor = 1.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::Backoff(_))));

        let mut cfg = RenterConfig::default();
        cfg.backoff.max_interval = Duration::from_secs(1);
        assert!(matches!(cfg.validate(), Err(ConfigError::Backoff(_))));
    }

    #[test]
    fn bad_listen_address_is_rejected() {
        let cfg = RenterConfig {
            listen: "tcp://0.0.0.0:9100".to_string(),
            ..RenterConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Listen { .. })));
    }

    #[test]
    fn missing_file_loads_defaults_and_saved_file_round_trips() {
        let dir = scratch_dir("cfg");
        let path = dir.join("nested").join("renter-config.json");
        let loaded = RenterConfig::load(&path).expect("missing file is not an error");
        assert_eq!(loaded.listen, DEFAULT_LISTEN);

        let mut cfg = RenterConfig::default();
        cfg.hosts.push("/ip4/127.0.0.1/tcp/9000".to_string());
        cfg.negotiation.token_mismatch = TokenMismatchPolicy::StopShard;
        cfg.save(&path).expect("save");

        let loaded = RenterConfig::load(&path).expect("load");
        assert_eq!(loaded.hosts, cfg.hosts);
        assert_eq!(loaded.negotiation.token_mismatch, TokenMismatchPolicy::StopShard);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_reports_parse_and_validation_failures_with_path() {
        let dir = scratch_dir("bad");
        fs::create_dir_all(&dir).expect("mkdir");

        let malformed = dir.join("malformed.json");
        fs::write(&malformed, "{ not json").expect("write");
        let err = RenterConfig::load(&malformed).expect_err("must fail");
        assert!(format!("{err:#}").contains("failed to parse renter config"));

        let invalid = dir.join("invalid.json");
        fs::write(&invalid, r#"{ "negotiation": { "push_timeout": 0 } }"#).expect("write");
        let err = RenterConfig::load(&invalid).expect_err("must fail");
        let msg = format!("{err:#}");
        assert!(msg.contains("invalid renter config"), "{msg}");
        assert!(msg.contains("negotiation.push_timeout"), "{msg}");
        let _ = fs::remove_dir_all(dir);
    }
}
