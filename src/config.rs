// Closed configuration record with explicit defaults.
//
// Every key the scheduler consumes is an enumerated field here; unknown keys
// are rejected by the loader instead of being passed through to the core.

use crate::drives::DriveType;
use crate::policy::PolicyRule;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-drive overrides applied on top of enumeration results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriveOverride {
    pub letter: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_sec: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive_type: Option<DriveType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_dir: Option<PathBuf>,
}

/// Scheduler configuration.
///
/// Defaults match the shipped behavior; `load` fills anything a config file
/// omits and rejects anything it does not recognize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RevenantConfig {
    /// Base cadence for drives without an override, in seconds.
    pub default_interval_sec: u64,

    /// Floor for any configured interval, in seconds.
    pub interval_min_sec: u64,

    /// Maximum deterministic shift applied to a firing, in seconds.
    pub jitter_sec: u64,

    /// Hard ceiling on consecutive-probe separation for mechanical drives.
    pub hdd_max_gap_sec: u64,

    /// Late slack tolerated for mechanical drives before a firing is pulled
    /// earlier, in seconds.
    pub deadline_margin_sec: f64,

    /// Whether write probes attempt a durability flush.
    pub fsync: bool,

    /// Deadline for the durability flush before the probe is recorded as a
    /// partial flush and the schedule moves on.
    pub max_flush_ms: u64,

    /// Delay before the single retry after a sharing-violation on replace.
    pub lock_retry_ms: u64,

    /// Consecutive probe errors before a drive is quarantined.
    pub error_quarantine_after: u32,

    /// Length of the quarantine blackout, in seconds.
    pub error_quarantine_sec: u64,

    /// Idle threshold in minutes; 0 disables the idle pause rule.
    pub idle_pause_min: u64,

    /// Evaluation order for pause conditions.
    pub policy_precedence: Vec<PolicyRule>,

    /// Whether drives of unknown type follow the SSD op cadence.
    pub treat_unknown_as_ssd: bool,

    /// Per-install stable identifier feeding phase and jitter derivation.
    pub install_id: Uuid,

    /// Per-drive overrides applied on top of enumeration.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub drives: Vec<DriveOverride>,
}

impl Default for RevenantConfig {
    fn default() -> Self {
        Self {
            default_interval_sec: 20,
            interval_min_sec: 3,
            jitter_sec: 2,
            hdd_max_gap_sec: 45,
            deadline_margin_sec: 0.3,
            fsync: true,
            max_flush_ms: 150,
            lock_retry_ms: 750,
            error_quarantine_after: 5,
            error_quarantine_sec: 60,
            idle_pause_min: 0,
            policy_precedence: PolicyRule::default_precedence(),
            treat_unknown_as_ssd: true,
            install_id: Uuid::new_v4(),
            drives: Vec::new(),
        }
    }
}

impl RevenantConfig {
    /// Load a configuration file, writing defaults back on first run so the
    /// generated `install_id` stays stable across restarts.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "wrote default configuration");
            return Ok(config);
        }

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let rendered = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, rendered).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_min_sec == 0 {
            return Err(ConfigError::Invalid("interval_min_sec must be >= 1".into()));
        }
        if self.default_interval_sec < self.interval_min_sec {
            return Err(ConfigError::Invalid(format!(
                "default_interval_sec {} is below interval_min_sec {}",
                self.default_interval_sec, self.interval_min_sec
            )));
        }
        if self.hdd_max_gap_sec < self.interval_min_sec {
            return Err(ConfigError::Invalid(format!(
                "hdd_max_gap_sec {} is below interval_min_sec {}",
                self.hdd_max_gap_sec, self.interval_min_sec
            )));
        }
        if self.jitter_sec > self.interval_min_sec {
            return Err(ConfigError::Invalid(format!(
                "jitter_sec {} exceeds interval_min_sec {}",
                self.jitter_sec, self.interval_min_sec
            )));
        }
        if !(0.0..=2.0).contains(&self.deadline_margin_sec) {
            return Err(ConfigError::Invalid(
                "deadline_margin_sec must be within [0.0, 2.0]".into(),
            ));
        }
        if self.max_flush_ms == 0 {
            return Err(ConfigError::Invalid("max_flush_ms must be >= 1".into()));
        }
        if self.error_quarantine_after == 0 {
            return Err(ConfigError::Invalid(
                "error_quarantine_after must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Clamp a requested interval for a drive of the given type. Mechanical
    /// drives are additionally capped at the maximum tolerated gap.
    pub fn clamp_interval(&self, requested_sec: u64, drive_type: DriveType) -> Duration {
        let floor = self.interval_min_sec;
        let clamped = match drive_type {
            DriveType::HDD => requested_sec.clamp(floor, self.hdd_max_gap_sec),
            _ => requested_sec.max(floor),
        };
        Duration::from_secs(clamped)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_secs(self.jitter_sec)
    }

    pub fn deadline_margin(&self) -> Duration {
        Duration::from_secs_f64(self.deadline_margin_sec)
    }

    pub fn hdd_max_gap(&self) -> Duration {
        Duration::from_secs(self.hdd_max_gap_sec)
    }

    pub fn quarantine_window(&self) -> Duration {
        Duration::from_secs(self.error_quarantine_sec)
    }

    /// Jump threshold beyond which the scheduler smooths instead of firing
    /// backlog.
    pub fn resume_jump_threshold(&self) -> Duration {
        Duration::from_secs((2 * self.interval_min_sec).max(5))
    }

    pub fn override_for(&self, letter: char) -> Option<&DriveOverride> {
        self.drives.iter().find(|entry| {
            crate::drives::normalize_letter(&entry.letter)
                .map(|l| l == letter)
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_shipped_values() {
        let config = RevenantConfig::default();
        assert_eq!(config.default_interval_sec, 20);
        assert_eq!(config.interval_min_sec, 3);
        assert_eq!(config.jitter_sec, 2);
        assert_eq!(config.hdd_max_gap_sec, 45);
        assert!((config.deadline_margin_sec - 0.3).abs() < f64::EPSILON);
        assert!(config.fsync);
        assert_eq!(config.max_flush_ms, 150);
        assert_eq!(config.lock_retry_ms, 750);
        assert_eq!(config.error_quarantine_after, 5);
        assert_eq!(config.error_quarantine_sec, 60);
        assert!(config.treat_unknown_as_ssd);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = r#"{ "default_interval_sec": 20, "spin_harder": true }"#;
        let parsed: Result<RevenantConfig, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn partial_files_fill_from_defaults() {
        let raw = r#"{ "default_interval_sec": 12, "fsync": false }"#;
        let parsed: RevenantConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.default_interval_sec, 12);
        assert!(!parsed.fsync);
        assert_eq!(parsed.interval_min_sec, 3);
        assert_eq!(parsed.lock_retry_ms, 750);
    }

    #[test]
    fn first_load_persists_install_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("revenant.json");

        let first = RevenantConfig::load(&path).unwrap();
        let second = RevenantConfig::load(&path).unwrap();
        assert_eq!(first.install_id, second.install_id);
    }

    #[test]
    fn hdd_intervals_clamp_to_max_gap() {
        let config = RevenantConfig::default();
        let clamped = config.clamp_interval(300, DriveType::HDD);
        assert_eq!(clamped, Duration::from_secs(45));

        let floor = config.clamp_interval(1, DriveType::HDD);
        assert_eq!(floor, Duration::from_secs(3));

        // The clamp is a maximum for HDDs, not a minimum: short intervals
        // well under hdd_max_gap_sec pass through untouched.
        let short = config.clamp_interval(6, DriveType::HDD);
        assert_eq!(short, Duration::from_secs(6));

        let ssd = config.clamp_interval(300, DriveType::SSD);
        assert_eq!(ssd, Duration::from_secs(300));
    }

    #[test]
    fn validation_rejects_inverted_bounds() {
        let config = RevenantConfig {
            default_interval_sec: 2,
            interval_min_sec: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RevenantConfig {
            jitter_sec: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
