//! Gateway configuration loaded from a JSON file.
//!
//! Every field has a default, so an empty object is a valid configuration.
//! Durations are written as integer milliseconds (`*_ms` keys).

use crate::gateway::services::{BalancerConfig, HealthConfig, InsightsConfig, MetricsConfig};
use camino::Utf8Path;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// The file could not be opened or read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path that was read.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The file is not a valid configuration document.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Path that was parsed.
        path: String,
        /// Underlying decoding failure.
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// A value is outside its permitted range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Longest accepted probe or discovery timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3_600);

/// Longest accepted loop interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(86_400);

/// Longest accepted inactive TTL.
pub const MAX_INACTIVE_TTL: Duration = Duration::from_secs(30 * 86_400);

/// Complete gateway configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Health monitor settings.
    pub health: HealthConfig,
    /// Load balancer settings.
    pub balancer: BalancerConfig,
    /// Metrics collector settings.
    pub metrics: MetricsConfig,
    /// Anomaly detector and optimizer settings.
    pub insights: InsightsConfig,
    /// Upper bound on fetching one info document during discovery.
    #[serde(with = "duration_ms", rename = "discovery_timeout_ms")]
    pub discovery_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            balancer: BalancerConfig::default(),
            metrics: MetricsConfig::default(),
            insights: InsightsConfig::default(),
            discovery_timeout: Duration::from_secs(5),
        }
    }
}

impl GatewayConfig {
    /// Reads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] when the file cannot be read,
    /// [`ConfigError::Parse`] when it is not valid JSON for this shape and
    /// [`ConfigError::Invalid`] when a value is out of range.
    pub fn load(path: &Utf8Path) -> ConfigResult<Self> {
        let contents = read_config_file(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source: Arc::new(source),
        })?;
        let config = Self::from_json(&contents).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_string(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Parses and validates a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_json(contents: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(contents).map_err(|source| ConfigError::Parse {
            path: String::from("<inline>"),
            source: Arc::new(source),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero thresholds and capacities, out-of-range ratios, and
    /// durations that are zero or beyond their upper bound.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> ConfigResult<()> {
        ensure_positive("health.degrade_after", self.health.degrade_after)?;
        ensure_positive("health.deactivate_after", self.health.deactivate_after)?;
        ensure_nonzero_usize(
            "health.max_concurrent_probes",
            self.health.max_concurrent_probes,
        )?;
        ensure_duration("health.interval_ms", self.health.interval, MAX_INTERVAL)?;
        ensure_duration("health.probe_timeout_ms", self.health.probe_timeout, MAX_TIMEOUT)?;
        if self.health.inactive_ttl > MAX_INACTIVE_TTL {
            return Err(ConfigError::Invalid {
                field: "health.inactive_ttl_ms",
                reason: format!("must not exceed {} ms", MAX_INACTIVE_TTL.as_millis()),
            });
        }
        ensure_unit_ratio("health.jitter_ratio", self.health.jitter_ratio)?;

        ensure_positive("balancer.max_attempts", self.balancer.max_attempts)?;

        ensure_nonzero_usize("metrics.window_capacity", self.metrics.window_capacity)?;
        ensure_nonzero_usize("metrics.shard_count", self.metrics.shard_count)?;
        ensure_unit_ratio("metrics.ewma_alpha", self.metrics.ewma_alpha)?;

        ensure_duration("insights.interval_ms", self.insights.interval, MAX_INTERVAL)?;
        ensure_nonzero_usize("insights.baseline_windows", self.insights.baseline_windows)?;
        ensure_nonzero_usize(
            "insights.min_baseline_samples",
            self.insights.min_baseline_samples,
        )?;
        ensure_positive("insights.sustain_evaluations", self.insights.sustain_evaluations)?;
        ensure_nonzero_usize("insights.history_limit", self.insights.history_limit)?;
        ensure_unit_ratio("insights.skew_tolerance", self.insights.skew_tolerance)?;
        if !(self.insights.sigma_threshold.is_finite() && self.insights.sigma_threshold > 0.0) {
            return Err(ConfigError::Invalid {
                field: "insights.sigma_threshold",
                reason: format!("must be a positive number, got {}", self.insights.sigma_threshold),
            });
        }

        ensure_duration("discovery_timeout_ms", self.discovery_timeout, MAX_TIMEOUT)
    }
}

fn read_config_file(path: &Utf8Path) -> std::io::Result<String> {
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::other("config path must include a file name"))?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    dir.read_to_string(file_name)
}

fn ensure_positive(field: &'static str, value: u32) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(())
}

fn ensure_nonzero_usize(field: &'static str, value: usize) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(())
}

fn ensure_duration(field: &'static str, value: Duration, max: Duration) -> ConfigResult<()> {
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_owned(),
        });
    }
    if value > max {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("must not exceed {} ms", max.as_millis()),
        });
    }
    Ok(())
}

fn ensure_unit_ratio(field: &'static str, value: f64) -> ConfigResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("must lie in [0, 1], got {value}"),
        });
    }
    Ok(())
}

/// Serde adapter writing [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes `value` as whole milliseconds, saturating at `u64::MAX`.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserializes whole milliseconds into a [`Duration`].
    ///
    /// # Errors
    ///
    /// Propagates deserializer errors.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::services::StrategyKind;
    use camino::Utf8PathBuf;
    use rstest::rstest;

    #[test]
    fn empty_document_yields_defaults() {
        let config = GatewayConfig::from_json("{}").expect("defaults are valid");

        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.health.degrade_after, 3);
        assert_eq!(config.health.deactivate_after, 3);
        assert_eq!(config.balancer.max_attempts, 3);
        assert_eq!(config.metrics.window_capacity, 1024);
    }

    #[test]
    fn durations_are_read_as_milliseconds() {
        let config = GatewayConfig::from_json(
            r#"{"health": {"interval_ms": 1500, "inactive_ttl_ms": 60000},
                "balancer": {"strategy": "least_latency"}}"#,
        )
        .expect("valid config");

        assert_eq!(config.health.interval, Duration::from_millis(1500));
        assert_eq!(config.health.inactive_ttl, Duration::from_secs(60));
        assert_eq!(config.balancer.strategy, StrategyKind::LeastLatency);
    }

    #[rstest]
    #[case(r#"{"health": {"degrade_after": 0}}"#, "health.degrade_after")]
    #[case(r#"{"health": {"jitter_ratio": 1.5}}"#, "health.jitter_ratio")]
    #[case(r#"{"balancer": {"max_attempts": 0}}"#, "balancer.max_attempts")]
    #[case(r#"{"metrics": {"shard_count": 0}}"#, "metrics.shard_count")]
    #[case(r#"{"insights": {"sigma_threshold": -1.0}}"#, "insights.sigma_threshold")]
    #[case(r#"{"health": {"probe_timeout_ms": 18446744073709551615}}"#, "health.probe_timeout_ms")]
    #[case(r#"{"health": {"inactive_ttl_ms": 18446744073709551615}}"#, "health.inactive_ttl_ms")]
    #[case(r#"{"discovery_timeout_ms": 3600001}"#, "discovery_timeout_ms")]
    fn out_of_range_values_are_rejected(#[case] document: &str, #[case] expected: &str) {
        let result = GatewayConfig::from_json(document);
        assert!(
            matches!(result, Err(ConfigError::Invalid { field, .. }) if field == expected),
            "expected {expected} to be rejected"
        );
    }

    #[test]
    fn load_reads_through_capability_directory() {
        let dir = std::env::temp_dir().join(format!("toolmesh-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.join("gateway.json")).expect("utf-8 temp path");
        std::fs::write(&path, r#"{"discovery_timeout_ms": 750}"#).expect("write config");

        let config = GatewayConfig::load(&path).expect("config loads");
        std::fs::remove_dir_all(&dir).expect("cleanup");

        assert_eq!(config.discovery_timeout, Duration::from_millis(750));
    }

    #[test]
    fn missing_files_report_read_errors() {
        let result = GatewayConfig::load(Utf8Path::new("/nonexistent/toolmesh/gateway.json"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
