// Per-volume state and the enumeration boundary.

pub mod detection;

pub use detection::SysinfoEnumerator;

use crate::clock::MonoTime;
use crate::RevenantError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How many recent probe outcomes each drive remembers.
pub const OUTCOME_HISTORY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveType {
    SSD,
    HDD,
    Removable,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveState {
    Active,
    Paused,
    Quarantined,
    Disabled,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeOp {
    Read,
    Write,
}

impl ProbeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeOp::Read => "read",
            ProbeOp::Write => "write",
        }
    }
}

/// Outcome classification for a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProbeCode {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "SKIP_LOCKED")]
    SkipLocked,
    #[serde(rename = "PARTIAL_FLUSH")]
    PartialFlush,
    #[serde(rename = "ERROR")]
    Error,
}

impl ProbeCode {
    /// Partial flushes are soft successes: the payload landed even if the
    /// durability wait was abandoned.
    pub fn counts_as_success(&self) -> bool {
        matches!(self, ProbeCode::Ok | ProbeCode::PartialFlush)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub op: ProbeOp,
    pub code: ProbeCode,
    pub latency_ms: u64,
    pub at: MonoTime,
    pub notes: Option<String>,
}

/// Mutable fields accepted from the configuration surface.
#[derive(Debug, Clone, Default)]
pub struct DriveConfigUpdate {
    pub interval_sec: Option<u64>,
    pub drive_type: Option<DriveType>,
    pub enabled: Option<bool>,
    pub ping_dir: Option<PathBuf>,
}

/// One managed volume, keyed by normalized letter.
///
/// All fields are owned by the scheduler task; observers only ever see
/// snapshot copies.
#[derive(Debug, Clone)]
pub struct Drive {
    pub letter: char,
    pub drive_type: DriveType,
    pub interval: Duration,
    pub enabled: bool,
    pub user_paused: bool,
    pub ping_dir: PathBuf,
    pub state: DriveState,
    pub consecutive_failures: u32,
    pub quarantine_until: Option<MonoTime>,
    pub next_due: MonoTime,

    /// Per-install stable phase, in grid cells. Constant for the lifetime
    /// of an enable period.
    pub phase_offset_cells: u64,

    /// t_nom(0) on the grid. Recomputed only by resume smoothing or a
    /// re-enable.
    pub cadence_anchor: MonoTime,

    /// Index of the next nominal firing.
    pub firing_index: u64,

    /// Launch instant of the last executed probe.
    pub last_fire_actual: Option<MonoTime>,

    /// Set when a read probe found no canonical file; the next firing
    /// becomes a write regardless of cadence position.
    pub force_write: bool,

    /// Set by `ping_now`; cleared once the extra probe executes.
    pub ping_requested: bool,

    pub last_policy_reason: crate::policy::DenyReason,

    outcomes: Vec<ProbeOutcome>,
}

impl Drive {
    pub fn new(letter: char, drive_type: DriveType, interval: Duration, ping_dir: PathBuf) -> Self {
        Self {
            letter,
            drive_type,
            interval,
            enabled: true,
            user_paused: false,
            ping_dir,
            state: DriveState::Active,
            consecutive_failures: 0,
            quarantine_until: None,
            next_due: MonoTime::ZERO,
            phase_offset_cells: 0,
            cadence_anchor: MonoTime::ZERO,
            firing_index: 0,
            last_fire_actual: None,
            force_write: false,
            ping_requested: false,
            last_policy_reason: crate::policy::DenyReason::None,
            outcomes: Vec::with_capacity(OUTCOME_HISTORY),
        }
    }

    /// Nominal firing instant for index `k` on the canonical cadence.
    pub fn t_nom(&self, k: u64) -> MonoTime {
        self.cadence_anchor + self.interval.saturating_mul(k as u32)
    }

    pub fn record_outcome(&mut self, outcome: ProbeOutcome) {
        self.outcomes.insert(0, outcome);
        self.outcomes.truncate(OUTCOME_HISTORY);
    }

    /// Most-recent-first probe history, at most [`OUTCOME_HISTORY`] deep.
    pub fn recent_outcomes(&self) -> &[ProbeOutcome] {
        &self.outcomes
    }

    /// Whether the planner schedules this drive at all. Quarantined drives
    /// keep `next_due` pinned to the quarantine expiry; offline drives are
    /// dropped until re-enumerated.
    pub fn is_schedulable(&self) -> bool {
        !matches!(self.state, DriveState::Quarantined | DriveState::Offline)
    }
}

/// One volume reported by the enumeration layer.
#[derive(Debug, Clone)]
pub struct DiscoveredDrive {
    pub letter: char,
    pub drive_type: DriveType,
    pub size_bytes: u64,
    pub removable: bool,
}

/// Enumeration boundary. Called at startup and on device-change
/// notifications, which arrive debounced from the outside.
pub trait DriveEnumerator: Send + Sync {
    fn list(&self) -> anyhow::Result<Vec<DiscoveredDrive>>;
}

/// Normalize a volume identifier to its single uppercase letter.
///
/// Accepts `"e"`, `"E"`, `"E:"`, and `"E:\"` style spellings.
pub fn normalize_letter(raw: &str) -> Result<char, RevenantError> {
    let trimmed = raw
        .trim()
        .trim_end_matches(['\\', '/'])
        .trim_end_matches(':');
    let mut chars = trimmed.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Ok(c.to_ascii_uppercase()),
        _ => Err(RevenantError::InvalidLetter(raw.to_string())),
    }
}

/// Default probe directory for a volume.
pub fn default_ping_dir(letter: char) -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(format!("{letter}:\\.drive_revenant"))
    }
    #[cfg(not(windows))]
    {
        PathBuf::from(format!(
            "/mnt/{}/.drive_revenant",
            letter.to_ascii_lowercase()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("e", 'E'; "lowercase bare")]
    #[test_case("E", 'E'; "uppercase bare")]
    #[test_case("E:", 'E'; "uppercase colon")]
    #[test_case("e:\\", 'E'; "lowercase colon backslash")]
    #[test_case(" f: ", 'F'; "padded colon")]
    fn normalize_accepts_common_spellings(raw: &str, expected: char) {
        assert_eq!(normalize_letter(raw).unwrap(), expected);
    }

    #[test_case(""; "empty")]
    #[test_case("EF"; "two letters")]
    #[test_case("1:"; "digit")]
    #[test_case("/dev/sda"; "device path")]
    fn normalize_rejects_invalid(raw: &str) {
        assert!(normalize_letter(raw).is_err());
    }

    #[test]
    fn outcome_ring_keeps_newest_three() {
        let mut drive = Drive::new(
            'E',
            DriveType::SSD,
            Duration::from_secs(20),
            default_ping_dir('E'),
        );

        for i in 0..5u64 {
            drive.record_outcome(ProbeOutcome {
                op: ProbeOp::Write,
                code: ProbeCode::Ok,
                latency_ms: i,
                at: MonoTime::from_millis(i * 1000),
                notes: None,
            });
        }

        let recent = drive.recent_outcomes();
        assert_eq!(recent.len(), OUTCOME_HISTORY);
        assert_eq!(recent[0].latency_ms, 4);
        assert_eq!(recent[2].latency_ms, 2);
    }

    #[test]
    fn nominal_cadence_is_origin_anchored() {
        let mut drive = Drive::new(
            'E',
            DriveType::SSD,
            Duration::from_secs(20),
            default_ping_dir('E'),
        );
        drive.cadence_anchor = MonoTime::from_millis(1500);

        assert_eq!(drive.t_nom(0), MonoTime::from_millis(1500));
        assert_eq!(drive.t_nom(3), MonoTime::from_millis(61_500));
    }
}
