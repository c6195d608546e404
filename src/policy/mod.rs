// Precedence-ordered pause evaluation and quarantine bookkeeping.

use crate::clock::MonoTime;
use crate::config::RevenantConfig;
use crate::drives::{Drive, DriveState, ProbeCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Pause conditions evaluated in configured order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRule {
    GlobalPause,
    Battery,
    Idle,
    PerDriveDisable,
}

impl PolicyRule {
    pub fn default_precedence() -> Vec<PolicyRule> {
        vec![
            PolicyRule::GlobalPause,
            PolicyRule::Battery,
            PolicyRule::Idle,
            PolicyRule::PerDriveDisable,
        ]
    }
}

/// Why a scheduled op was denied, or `None` when it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    None,
    User,
    Global,
    Battery,
    Idle,
    PerDriveDisable,
    Quarantine,
    Offline,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DenyReason::None => "none",
            DenyReason::User => "user",
            DenyReason::Global => "global",
            DenyReason::Battery => "battery",
            DenyReason::Idle => "idle",
            DenyReason::PerDriveDisable => "per_drive_disable",
            DenyReason::Quarantine => "quarantine",
            DenyReason::Offline => "offline",
        };
        f.write_str(text)
    }
}

/// External conditions read at the top of each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyInputs {
    pub global_paused: bool,
    pub on_battery: bool,
    pub idle_seconds: u64,
}

/// Boundary for battery/idle/global-pause state. Implementations poll
/// whatever the host exposes; the scheduler only ever sees this record.
pub trait PolicyInputSource: Send + Sync {
    fn read(&self) -> PolicyInputs;
}

/// Process-local input source. The binary wires this up directly; tests
/// flip fields through the shared handle.
#[derive(Clone, Default)]
pub struct StaticPolicyInputs {
    inner: Arc<Mutex<PolicyInputs>>,
}

impl StaticPolicyInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_global_paused(&self, paused: bool) {
        self.inner.lock().unwrap().global_paused = paused;
    }

    pub fn set_on_battery(&self, on_battery: bool) {
        self.inner.lock().unwrap().on_battery = on_battery;
    }

    pub fn set_idle_seconds(&self, idle: u64) {
        self.inner.lock().unwrap().idle_seconds = idle;
    }
}

impl PolicyInputSource for StaticPolicyInputs {
    fn read(&self) -> PolicyInputs {
        *self.inner.lock().unwrap()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allow: bool,
    pub reason: DenyReason,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allow: true,
            reason: DenyReason::None,
        }
    }

    fn deny(reason: DenyReason) -> Self {
        Self {
            allow: false,
            reason,
        }
    }
}

/// Decides whether a scheduled op may run and tracks failure quarantine.
pub struct PolicyArbiter {
    precedence: Vec<PolicyRule>,
    idle_pause_min: u64,
    quarantine_after: u32,
    quarantine_window: Duration,
}

impl PolicyArbiter {
    pub fn new(config: &RevenantConfig) -> Self {
        Self {
            precedence: config.policy_precedence.clone(),
            idle_pause_min: config.idle_pause_min,
            quarantine_after: config.error_quarantine_after,
            quarantine_window: config.quarantine_window(),
        }
    }

    /// Evaluate whether `drive` may probe right now.
    ///
    /// User pause is checked first unconditionally so a user-paused drive
    /// stays paused through a global resume. Quarantine and offline are
    /// inherent states and block regardless of the configured precedence.
    pub fn decide(&self, drive: &Drive, inputs: &PolicyInputs) -> Decision {
        if drive.user_paused {
            return Decision::deny(DenyReason::User);
        }

        match drive.state {
            DriveState::Quarantined => return Decision::deny(DenyReason::Quarantine),
            DriveState::Offline => return Decision::deny(DenyReason::Offline),
            _ => {}
        }

        for rule in &self.precedence {
            match rule {
                PolicyRule::GlobalPause if inputs.global_paused => {
                    return Decision::deny(DenyReason::Global);
                }
                PolicyRule::Battery if inputs.on_battery => {
                    return Decision::deny(DenyReason::Battery);
                }
                PolicyRule::Idle if self.idle_matches(inputs) => {
                    return Decision::deny(DenyReason::Idle);
                }
                PolicyRule::PerDriveDisable if !drive.enabled => {
                    return Decision::deny(DenyReason::PerDriveDisable);
                }
                _ => {}
            }
        }

        Decision::allow()
    }

    /// The drive-independent part of the decision, used for the global view
    /// in snapshots.
    pub fn global_reason(&self, inputs: &PolicyInputs) -> Option<DenyReason> {
        for rule in &self.precedence {
            match rule {
                PolicyRule::GlobalPause if inputs.global_paused => {
                    return Some(DenyReason::Global);
                }
                PolicyRule::Battery if inputs.on_battery => return Some(DenyReason::Battery),
                PolicyRule::Idle if self.idle_matches(inputs) => return Some(DenyReason::Idle),
                _ => {}
            }
        }
        None
    }

    fn idle_matches(&self, inputs: &PolicyInputs) -> bool {
        self.idle_pause_min > 0 && inputs.idle_seconds >= self.idle_pause_min * 60
    }

    /// Fold a probe outcome into the drive's failure tracking.
    ///
    /// Returns true when this outcome pushed the drive into quarantine.
    /// Lock skips leave the count untouched; any success resets it.
    pub fn note_outcome(&self, drive: &mut Drive, code: ProbeCode, now: MonoTime) -> bool {
        match code {
            ProbeCode::Ok | ProbeCode::PartialFlush => {
                drive.consecutive_failures = 0;
                false
            }
            ProbeCode::SkipLocked => false,
            ProbeCode::Error => {
                drive.consecutive_failures += 1;
                if drive.consecutive_failures >= self.quarantine_after {
                    self.enter_quarantine(drive, now);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn enter_quarantine(&self, drive: &mut Drive, now: MonoTime) {
        let until = now + self.quarantine_window;
        drive.state = DriveState::Quarantined;
        drive.quarantine_until = Some(until);
        drive.next_due = until;
        tracing::warn!(
            drive = %drive.letter,
            failures = drive.consecutive_failures,
            window = %humantime::format_duration(self.quarantine_window),
            "drive quarantined after consecutive probe errors"
        );
    }

    /// Lift an expired quarantine. Returns true when the drive came back,
    /// in which case the caller replans its cadence.
    pub fn expire_quarantine(&self, drive: &mut Drive, now: MonoTime) -> bool {
        if drive.state != DriveState::Quarantined {
            return false;
        }
        match drive.quarantine_until {
            Some(until) if until <= now => {
                self.release_quarantine(drive);
                true
            }
            _ => false,
        }
    }

    /// Unconditionally lift a quarantine, used by the manual release call.
    pub fn release_quarantine(&self, drive: &mut Drive) {
        drive.state = if drive.user_paused {
            DriveState::Paused
        } else {
            DriveState::Active
        };
        drive.quarantine_until = None;
        drive.consecutive_failures = 0;
        tracing::info!(drive = %drive.letter, "quarantine lifted");
    }
}
