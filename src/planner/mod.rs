// Drift-free firing plans: canonical cadence, deterministic jitter,
// HDD guard, and collision packing.

#[cfg(test)]
mod planner_tests;

use crate::clock::{MonoTime, GRID, MIN_SPACING, WRITE_SPACING};
use crate::config::RevenantConfig;
use crate::drives::{Drive, DriveType, ProbeOp};
use crate::RevenantError;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::time::Duration;
use uuid::Uuid;

/// Upper bound on the firing-index search in [`JitterPlanner::plan_next`].
/// Hitting it means the cadence arithmetic is inconsistent; the caller
/// disables the drive and keeps the loop alive.
const PLAN_SEARCH_LIMIT: u64 = 1_000_000;

/// One drive-firing due in the current grid cell, before packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Firing {
    pub letter: char,
    pub op: ProbeOp,
    pub firing_index: u64,
    pub due: MonoTime,
    /// An extra probe requested out of cadence; does not advance the
    /// firing index when it executes.
    pub extra: bool,
}

/// A firing with its assigned launch instant and packing telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedOp {
    pub letter: char,
    pub op: ProbeOp,
    pub firing_index: u64,
    pub extra: bool,
    pub launch: MonoTime,
    pub tie_epoch: u64,
    pub tie_rank: u32,
    pub pack_size: u32,
}

/// Result of packing one grid cell. Deferred firings overflowed the cell
/// and are re-evaluated in the next one.
#[derive(Debug, Default)]
pub struct PackResult {
    pub ops: Vec<PlannedOp>,
    pub deferred: Vec<Firing>,
}

/// Maps (drive, firing index) to scheduled instants.
///
/// Every derived quantity comes from a keyed hash of the per-install id, so
/// two installs sharing a machine spread differently but a single install
/// reproduces the same plan for the same local day.
pub struct JitterPlanner {
    install_id: Uuid,
    jitter: Duration,
    deadline_margin: Duration,
    hdd_max_gap: Duration,
}

impl JitterPlanner {
    pub fn new(config: &RevenantConfig) -> Self {
        Self {
            install_id: config.install_id,
            jitter: config.jitter(),
            deadline_margin: config.deadline_margin(),
            hdd_max_gap: config.hdd_max_gap(),
        }
    }

    fn hash128(&self, parts: &[&[u8]]) -> u128 {
        let mut hasher = Sha256::new();
        hasher.update(self.install_id.as_bytes());
        for part in parts {
            // Length prefix keeps adjacent parts from running together.
            hasher.update([part.len() as u8]);
            hasher.update(part);
        }
        let digest = hasher.finalize();
        u128::from_be_bytes(digest[..16].try_into().expect("digest is 32 bytes"))
    }

    /// Per-install stable phase for a drive, in grid cells within one
    /// interval. Changes at most once per local day, and only when the
    /// drive re-enables.
    pub fn phase_offset_cells(&self, letter: char, date: NaiveDate, interval: Duration) -> u64 {
        let cells = (interval.as_millis() / GRID.as_millis()).max(1) as u64;
        let h = self.hash128(&[
            &[letter as u8],
            date.to_string().as_bytes(),
        ]);
        (h % cells as u128) as u64
    }

    /// Deterministic shift for firing `k`, in signed grid cells.
    ///
    /// Mechanical drives only ever shift earlier; the late side is limited
    /// to the deadline margin, which is below one grid cell at the default
    /// configuration and therefore snaps to zero.
    pub fn offset_cells(
        &self,
        letter: char,
        k: u64,
        date: NaiveDate,
        drive_type: DriveType,
    ) -> i64 {
        let jitter_cells = (self.jitter.as_millis() / GRID.as_millis()) as i64;
        if jitter_cells == 0 {
            return 0;
        }

        let h = self.hash128(&[
            &[letter as u8],
            &k.to_le_bytes(),
            date.to_string().as_bytes(),
        ]);
        let span = (2 * jitter_cells + 1) as u128;
        let mut offset = (h % span) as i64 - jitter_cells;

        if drive_type == DriveType::HDD {
            let margin_cells = (self.deadline_margin.as_millis() / GRID.as_millis()) as i64;
            offset = offset.min(margin_cells);
        }
        offset
    }

    /// Within-cell ordering key. Writes sort before reads elsewhere; this
    /// key breaks ties inside each class.
    pub fn tie_key(&self, letter: char, cell: u64) -> u128 {
        self.hash128(&[&[letter as u8], &cell.to_le_bytes()])
    }

    fn candidate(&self, drive: &Drive, k: u64, date: NaiveDate) -> MonoTime {
        let base = drive.t_nom(k);
        let offset = self.offset_cells(drive.letter, k, date, drive.drive_type);
        if offset >= 0 {
            base + GRID * offset as u32
        } else {
            base - GRID * (-offset) as u32
        }
    }

    /// Compute the drive's next due instant from the canonical cadence.
    ///
    /// Advances the firing index past candidates that are already in the
    /// past, so a firing is never dropped and never doubled. The result is
    /// always at least one grid cell in the future.
    pub fn plan_next(
        &self,
        drive: &mut Drive,
        now: MonoTime,
        date: NaiveDate,
    ) -> Result<(), RevenantError> {
        let earliest = (now + GRID).grid_ceil();
        let mut k = drive.firing_index;

        for _ in 0..PLAN_SEARCH_LIMIT {
            let mut due = self.candidate(drive, k, date);

            if drive.drive_type == DriveType::HDD {
                if let Some(last) = drive.last_fire_actual {
                    let span = (drive.interval + self.deadline_margin).min(self.hdd_max_gap);
                    let cap = (last + span).grid_floor();
                    if due > cap {
                        // Pull earlier by whole cells, but never into the
                        // no-immediate-fire window.
                        due = cap.max(earliest);
                    }
                }
            }

            if due >= earliest {
                drive.firing_index = k;
                drive.next_due = due;
                return Ok(());
            }
            k += 1;
        }

        Err(RevenantError::PlanOverflow(drive.letter))
    }

    /// Order the firings due in one grid cell and assign launch instants.
    ///
    /// Writes come first, then reads; within each class the order is the
    /// per-install tie hash. Launches honor the any-any and write-write
    /// spacing floors, including against `last_launch` from the previous
    /// cell. Once a firing would launch past the cell end, it and everything
    /// after it defer to the next cell, preserving pack order.
    pub fn pack_cell(
        &self,
        cell_start: MonoTime,
        mut due: Vec<Firing>,
        last_launch: Option<(MonoTime, ProbeOp)>,
    ) -> PackResult {
        let cell = cell_start.cell();
        due.sort_by_key(|f| {
            let class = match f.op {
                ProbeOp::Write => 0u8,
                ProbeOp::Read => 1u8,
            };
            (class, self.tie_key(f.letter, cell), f.letter)
        });

        let pack_size = due.len() as u32;
        let cell_end = cell_start + GRID;
        let mut result = PackResult::default();
        let mut prev = last_launch;

        let mut pending = due.into_iter();
        let mut rank = 0u32;
        while let Some(firing) = pending.next() {
            let mut launch = firing.due.max(cell_start);
            if let Some((prev_at, prev_op)) = prev {
                let gap = if prev_op == ProbeOp::Write && firing.op == ProbeOp::Write {
                    WRITE_SPACING
                } else {
                    MIN_SPACING
                };
                launch = launch.max(prev_at + gap);
            }

            if launch >= cell_end {
                result.deferred.push(firing);
                result.deferred.extend(pending);
                break;
            }

            result.ops.push(PlannedOp {
                letter: firing.letter,
                op: firing.op,
                firing_index: firing.firing_index,
                extra: firing.extra,
                launch,
                tie_epoch: cell,
                tie_rank: rank,
                pack_size,
            });
            prev = Some((launch, firing.op));
            rank += 1;
        }

        result
    }
}
