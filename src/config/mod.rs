// Configuration for tunetrail - TOML in the user config dir, defaults written on first run
// Also turns the flat settings into the option structs each source's engine and poller take

use crate::discovery::{DiscoveryOptions, DEFAULT_HISTORY_CAPACITY};
use crate::error::ConfigError;
use crate::matching::{ScrobbleThresholds, TemporalOptions, COARSE_TEMPORAL_THRESHOLD};
use crate::player::{PositionalOptions, ScrobbleAuthority, StateIntervals, TrackerStrategy};
use crate::polling::PollingOptions;
use crate::sources::REPLAY_KIND;
use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub polling: PollingConfig,
    pub thresholds: ThresholdConfig,
    pub discovery: DiscoveryConfig,
    pub player: PlayerConfig,
    pub logging: LoggingConfig,
    pub sources: Vec<SourceConfig>,
}

/// All durations in whole seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval: u64,
    pub max_interval: u64,
    pub max_poll_retries: u32,
    pub retry_multiplier: f64,
    pub retry_base: u64,
    pub max_backoff: u64,
    pub boundary_window: u64,
    pub boundary_delay: u64,
    pub stop_check: u64,
    pub stop_wait: u64,
    pub heartbeat_interval: u64,
    pub sweep_interval: u64,
}

/// Set either to 0 to switch that check off. Both off means nothing ever scrobbles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub duration: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub history_capacity: usize,
    pub dedup_all_platforms: bool,
    pub temporal_threshold: f64,
    /// source timestamps only have minute precision
    pub coarse_timestamps: bool,
    pub fuzzy_temporal: bool,
    pub fuzzy_window: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Timestamp,
    Positional,
    HighDrift,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlayerConfig {
    pub authority: ScrobbleAuthority,
    /// multiples of the polling interval, derived from the authority when unset
    pub stale_multiplier: Option<f64>,
    pub orphaned_multiplier: Option<f64>,
    pub strategy: StrategyKind,
    pub allowed_drift: Option<f64>,
    pub end_grace: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub filter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub path: PathBuf,
    /// overrides polling.interval for this source
    #[serde(default)]
    pub interval: Option<u64>,
    /// source can't tell listeners apart
    #[serde(default)]
    pub single_platform: bool,
}

fn default_kind() -> String {
    REPLAY_KIND.to_string()
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: 10,
            max_interval: 30,
            max_poll_retries: 5,
            retry_multiplier: 1.5,
            retry_base: 5,
            max_backoff: 300,
            boundary_window: 5,
            boundary_delay: 3,
            stop_check: 2,
            stop_wait: 10,
            heartbeat_interval: 60,
            sweep_interval: 10,
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            duration: 240.0,
            percent: 50.0,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            dedup_all_platforms: false,
            temporal_threshold: 10.0,
            coarse_timestamps: false,
            fuzzy_temporal: false,
            fuzzy_window: 10.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            filter: "info,tunetrail=debug".to_string(),
        }
    }
}

impl SourceConfig {
    pub fn replay(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: default_kind(),
            path: path.into(),
            interval: None,
            single_platform: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?
            .join("tunetrail");

        Ok(config_dir.join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let polling = &self.polling;
        let positive = [
            ("polling.interval", polling.interval),
            ("polling.max_interval", polling.max_interval),
            ("polling.retry_base", polling.retry_base),
            ("polling.max_backoff", polling.max_backoff),
            ("polling.stop_check", polling.stop_check),
            ("polling.heartbeat_interval", polling.heartbeat_interval),
            ("polling.sweep_interval", polling.sweep_interval),
            ("discovery.history_capacity", self.discovery.history_capacity as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::NotPositive { field });
            }
        }
        if self.sources.iter().any(|source| source.interval == Some(0)) {
            return Err(ConfigError::NotPositive {
                field: "sources.interval",
            });
        }

        if !polling.retry_multiplier.is_finite() || polling.retry_multiplier < 1.0 {
            return Err(ConfigError::RetryMultiplier(polling.retry_multiplier));
        }
        if polling.stop_check > 2 {
            return Err(ConfigError::StopCheckTooCoarse(polling.stop_check));
        }
        if !(0.0..=100.0).contains(&self.thresholds.percent) {
            return Err(ConfigError::PercentOutOfRange(self.thresholds.percent));
        }
        Ok(())
    }

    fn source_interval(&self, source: &SourceConfig) -> u64 {
        source.interval.unwrap_or(self.polling.interval)
    }

    pub fn polling_options(&self, source: &SourceConfig) -> PollingOptions {
        let polling = &self.polling;
        let interval = self.source_interval(source);
        PollingOptions {
            interval: Duration::from_secs(interval),
            max_interval: Duration::from_secs(polling.max_interval.max(interval)),
            max_poll_retries: polling.max_poll_retries,
            retry_multiplier: polling.retry_multiplier,
            retry_base: Duration::from_secs(polling.retry_base),
            max_backoff: Duration::from_secs(polling.max_backoff.max(polling.retry_base)),
            boundary_window: Duration::from_secs(polling.boundary_window),
            boundary_delay: Duration::from_secs(polling.boundary_delay),
            stop_check: Duration::from_secs(polling.stop_check),
            stop_wait: Duration::from_secs(polling.stop_wait),
        }
    }

    pub fn strategy(&self) -> TrackerStrategy {
        let base = match self.player.strategy {
            StrategyKind::Timestamp => return TrackerStrategy::Timestamp,
            StrategyKind::Positional => PositionalOptions::default(),
            StrategyKind::HighDrift => PositionalOptions::high_drift(),
        };
        TrackerStrategy::Positional(PositionalOptions {
            allowed_drift: self.player.allowed_drift.unwrap_or(base.allowed_drift),
            end_grace: self.player.end_grace.unwrap_or(base.end_grace),
            repeat: base.repeat,
        })
    }

    pub fn thresholds(&self) -> ScrobbleThresholds {
        let enabled = |value: f64| (value > 0.0).then_some(value);
        ScrobbleThresholds {
            duration: enabled(self.thresholds.duration),
            percent: enabled(self.thresholds.percent),
        }
    }

    pub fn discovery_options(&self, source: &SourceConfig) -> DiscoveryOptions {
        let player = &self.player;
        let (stale, orphaned) = player.authority.default_multipliers();
        let intervals = StateIntervals::from_multipliers(
            self.source_interval(source) as f64,
            player.stale_multiplier.unwrap_or(stale),
            player.orphaned_multiplier.unwrap_or(orphaned),
        );

        let discovery = &self.discovery;
        let threshold = if discovery.coarse_timestamps {
            discovery.temporal_threshold.max(COARSE_TEMPORAL_THRESHOLD)
        } else {
            discovery.temporal_threshold
        };

        DiscoveryOptions {
            strategy: self.strategy(),
            intervals,
            thresholds: self.thresholds(),
            temporal: TemporalOptions {
                threshold,
                fuzzy: discovery.fuzzy_temporal,
                fuzzy_window: discovery.fuzzy_window,
            },
            history_capacity: discovery.history_capacity,
            dedup_all_platforms: discovery.dedup_all_platforms,
            single_platform: source.single_platform,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.validate(), Ok(()));
        assert!(config.sources.is_empty());
        assert_eq!(config.polling.interval, 10);
        assert_eq!(config.logging.filter, "info,tunetrail=debug");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.player.strategy = StrategyKind::HighDrift;
        config.sources.push(SourceConfig::replay("kitchen", "/tmp/kitchen.json"));
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[polling]
interval = 15

[player]
authority = "history"

[[sources]]
name = "desk"
path = "desk.json"
single_platform = true
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.polling.interval, 15);
        assert_eq!(config.polling.max_poll_retries, 5);
        assert_eq!(config.thresholds, ThresholdConfig::default());
        assert_eq!(config.sources[0].kind, "replay");

        let options = config.discovery_options(&config.sources[0]);
        assert!(options.single_platform);
        assert_eq!(options.intervals.stale, 15.0);
        assert_eq!(options.intervals.orphaned, 75.0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.polling.retry_multiplier = 0.5;
        assert_eq!(config.validate(), Err(ConfigError::RetryMultiplier(0.5)));

        let mut config = Config::default();
        config.polling.retry_multiplier = f64::INFINITY;
        assert_eq!(config.validate(), Err(ConfigError::RetryMultiplier(f64::INFINITY)));

        let mut config = Config::default();
        config.polling.max_backoff = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive {
                field: "polling.max_backoff"
            })
        );

        let mut config = Config::default();
        config.polling.stop_check = 5;
        assert_eq!(config.validate(), Err(ConfigError::StopCheckTooCoarse(5)));

        let mut config = Config::default();
        config.polling.interval = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive {
                field: "polling.interval"
            })
        );

        let mut config = Config::default();
        config.thresholds.percent = 150.0;
        assert!(matches!(config.validate(), Err(ConfigError::PercentOutOfRange(_))));
    }

    #[test]
    fn test_source_overrides_interval() {
        let config = Config::default();
        let mut source = SourceConfig::replay("desk", "desk.json");
        source.interval = Some(45);

        let polling = config.polling_options(&source);
        assert_eq!(polling.interval, Duration::from_secs(45));
        // ceiling never below the base interval
        assert_eq!(polling.max_interval, Duration::from_secs(45));

        let discovery = config.discovery_options(&source);
        assert_eq!(discovery.intervals.stale, 135.0);
    }

    #[test]
    fn test_strategy_presets_and_overrides() {
        let mut config = Config::default();
        assert_eq!(config.strategy(), TrackerStrategy::Timestamp);

        config.player.strategy = StrategyKind::HighDrift;
        match config.strategy() {
            TrackerStrategy::Positional(opts) => {
                assert_eq!(opts.allowed_drift, 17.0);
                assert_eq!(opts.end_grace, 6.0);
            }
            other => panic!("unexpected strategy {:?}", other),
        }

        config.player.allowed_drift = Some(5.0);
        match config.strategy() {
            TrackerStrategy::Positional(opts) => assert_eq!(opts.allowed_drift, 5.0),
            other => panic!("unexpected strategy {:?}", other),
        }
    }

    #[test]
    fn test_zero_threshold_disables_check() {
        let mut config = Config::default();
        config.thresholds.duration = 0.0;
        let thresholds = config.thresholds();
        assert_eq!(thresholds.duration, None);
        assert_eq!(thresholds.percent, Some(50.0));

        config.discovery.coarse_timestamps = true;
        let options = config.discovery_options(&SourceConfig::replay("desk", "desk.json"));
        assert_eq!(options.temporal.threshold, 60.0);
    }
}
