// Immutable per-tick view for observers.
//
// Observers never read scheduler state directly; they receive these by
// value and diff them however they like.

use crate::clock::MonoTime;
use crate::drives::{Drive, DriveState, DriveType, ProbeCode, ProbeOp};
use crate::policy::DenyReason;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeView {
    pub op: ProbeOp,
    pub code: ProbeCode,
    pub latency_ms: u64,
    pub mono_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriveView {
    pub letter: char,
    pub drive_type: DriveType,
    pub state: DriveState,
    pub interval_sec: u64,
    pub next_due_ms: u64,
    pub seconds_until_next: f64,
    pub last_outcomes: Vec<OutcomeView>,
    pub quarantine_remaining_sec: Option<f64>,
    pub policy_reason: DenyReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalView {
    pub paused: bool,
    pub pause_reason: Option<DenyReason>,
    pub now_ms: u64,
}

/// Point-in-time view of every managed drive, published after the ops of a
/// grid cell complete.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub taken_at_ms: u64,
    pub drives: Vec<DriveView>,
    pub global: GlobalView,
}

impl Snapshot {
    pub fn capture(
        now: MonoTime,
        drives: &BTreeMap<char, Drive>,
        pause_reason: Option<DenyReason>,
    ) -> Self {
        let views = drives
            .values()
            .map(|drive| {
                let until_due = drive.next_due.saturating_since(now);
                let quarantine_remaining_sec = drive
                    .quarantine_until
                    .map(|until| until.saturating_since(now).as_secs_f64());

                DriveView {
                    letter: drive.letter,
                    drive_type: drive.drive_type,
                    state: drive.state,
                    interval_sec: drive.interval.as_secs(),
                    next_due_ms: drive.next_due.as_millis(),
                    seconds_until_next: until_due.as_secs_f64(),
                    last_outcomes: drive
                        .recent_outcomes()
                        .iter()
                        .map(|o| OutcomeView {
                            op: o.op,
                            code: o.code,
                            latency_ms: o.latency_ms,
                            mono_ms: o.at.as_millis(),
                        })
                        .collect(),
                    quarantine_remaining_sec,
                    policy_reason: drive.last_policy_reason,
                }
            })
            .collect();

        Self {
            taken_at_ms: now.as_millis(),
            drives: views,
            global: GlobalView {
                paused: pause_reason.is_some(),
                pause_reason,
                now_ms: now.as_millis(),
            },
        }
    }

    /// Whether two snapshots differ in anything an observer acts on.
    /// Clock-derived fields tick forward every capture and are ignored.
    pub fn same_observable(&self, other: &Snapshot) -> bool {
        if self.global.paused != other.global.paused
            || self.global.pause_reason != other.global.pause_reason
            || self.drives.len() != other.drives.len()
        {
            return false;
        }

        self.drives.iter().zip(&other.drives).all(|(a, b)| {
            a.letter == b.letter
                && a.drive_type == b.drive_type
                && a.state == b.state
                && a.interval_sec == b.interval_sec
                && a.next_due_ms == b.next_due_ms
                && a.last_outcomes == b.last_outcomes
                && a.policy_reason == b.policy_reason
        })
    }

    pub fn drive(&self, letter: char) -> Option<&DriveView> {
        self.drives.iter().find(|d| d.letter == letter)
    }
}
