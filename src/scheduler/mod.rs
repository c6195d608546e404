// Tick orchestration: plan, arbitrate, execute, record, publish.
//
// A single task owns every mutable Drive. External callers talk to it
// through a bounded command channel drained at the top of each tick, and
// observe it through value snapshots. No error leaves a tick.

use crate::clock::{Clock, MonoTime, GRID};
use crate::config::RevenantConfig;
use crate::drives::{
    default_ping_dir, DiscoveredDrive, Drive, DriveConfigUpdate, DriveState, DriveType, ProbeCode,
    ProbeOp,
};
use crate::events::{wall_ts, Event, EventSink, ProbeRecord};
use crate::planner::{Firing, JitterPlanner, PlannedOp};
use crate::policy::{DenyReason, PolicyArbiter, PolicyInputSource, PolicyInputs};
use crate::probe::{ProbeEngine, ProbeSettings, NOTE_CREATED, NOTE_DEVICE_GONE};
use crate::snapshot::Snapshot;
use crate::{RevenantError, RevenantResult};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const COMMAND_QUEUE_DEPTH: usize = 64;

/// How long in-flight work may finish after a cancellation before it is
/// abandoned.
const DRAIN_WINDOW: Duration = Duration::from_millis(2000);

/// Mutation intents accepted from outside the scheduler task.
#[derive(Debug)]
pub enum Command {
    SetDriveConfig {
        letter: char,
        update: DriveConfigUpdate,
    },
    PauseDrive {
        letter: char,
    },
    ResumeDrive {
        letter: char,
    },
    ReleaseQuarantine {
        letter: char,
    },
    PingNow {
        letter: char,
    },
    RemoveDrive {
        letter: char,
    },
    SyncDrives {
        drives: Vec<DiscoveredDrive>,
    },
}

/// Cloneable front door to a running scheduler.
#[derive(Clone)]
pub struct RevenantHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Arc<Snapshot>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl RevenantHandle {
    async fn send(&self, command: Command) -> RevenantResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RevenantError::ChannelClosed)
    }

    pub async fn set_drive_config(
        &self,
        letter: char,
        update: DriveConfigUpdate,
    ) -> RevenantResult<()> {
        self.send(Command::SetDriveConfig { letter, update }).await
    }

    pub async fn pause_drive(&self, letter: char) -> RevenantResult<()> {
        self.send(Command::PauseDrive { letter }).await
    }

    pub async fn resume_drive(&self, letter: char) -> RevenantResult<()> {
        self.send(Command::ResumeDrive { letter }).await
    }

    pub async fn release_quarantine(&self, letter: char) -> RevenantResult<()> {
        self.send(Command::ReleaseQuarantine { letter }).await
    }

    /// Request one extra probe as soon as the spacing rules allow.
    pub async fn ping_now(&self, letter: char) -> RevenantResult<()> {
        self.send(Command::PingNow { letter }).await
    }

    pub async fn remove_drive(&self, letter: char) -> RevenantResult<()> {
        self.send(Command::RemoveDrive { letter }).await
    }

    /// Reconcile the drive set with a fresh enumeration pass.
    pub async fn sync_drives(&self, drives: Vec<DiscoveredDrive>) -> RevenantResult<()> {
        self.send(Command::SyncDrives { drives }).await
    }

    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.borrow().clone()
    }

    /// Every newly published snapshot arrives on the returned receiver.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshots.clone()
    }

    /// Signal the loop to stop. In-flight work gets a bounded drain.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// The scheduler task. Construct with [`SchedulerLoop::new`], then drive it
/// with `run().await`, usually inside `tokio::spawn`.
pub struct SchedulerLoop {
    config: RevenantConfig,
    clock: Arc<dyn Clock>,
    planner: JitterPlanner,
    arbiter: PolicyArbiter,
    engine: ProbeEngine,
    policy_inputs: Arc<dyn PolicyInputSource>,
    sink: Arc<dyn EventSink>,
    drives: BTreeMap<char, Drive>,
    seed: Vec<DiscoveredDrive>,
    commands: mpsc::Receiver<Command>,
    snapshots: watch::Sender<Arc<Snapshot>>,
    shutdown: watch::Receiver<bool>,
    last_wake: MonoTime,
    last_launch: Option<(MonoTime, ProbeOp)>,
    last_inputs: PolicyInputs,
}

impl SchedulerLoop {
    pub fn new(
        config: RevenantConfig,
        clock: Arc<dyn Clock>,
        policy_inputs: Arc<dyn PolicyInputSource>,
        sink: Arc<dyn EventSink>,
        seed: Vec<DiscoveredDrive>,
    ) -> (Self, RevenantHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let initial = Snapshot::capture(clock.now(), &BTreeMap::new(), None);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(initial));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = RevenantHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            shutdown: Arc::new(shutdown_tx),
        };

        let scheduler = Self {
            planner: JitterPlanner::new(&config),
            arbiter: PolicyArbiter::new(&config),
            engine: ProbeEngine::new(ProbeSettings::from(&config), clock.clone()),
            config,
            clock,
            policy_inputs,
            sink,
            drives: BTreeMap::new(),
            seed,
            commands: command_rx,
            snapshots: snapshot_tx,
            shutdown: shutdown_rx,
            last_wake: MonoTime::ZERO,
            last_launch: None,
            last_inputs: PolicyInputs::default(),
        };

        (scheduler, handle)
    }

    pub async fn run(mut self) {
        let date = local_date();
        let now = self.clock.now();
        for discovered in std::mem::take(&mut self.seed) {
            self.enable_drive(discovered, now, date);
        }
        self.last_wake = now;
        self.last_inputs = self.policy_inputs.read();
        self.publish(now, true);
        tracing::info!(drives = self.drives.len(), "scheduler started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let now = self.clock.now();
            let next_grid = now.grid_floor() + GRID;
            let sleep_for = next_grid.saturating_since(now);
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.shutdown.changed() => break,
            }

            let wake = self.clock.now();
            let date = local_date();

            let jump = wake.saturating_since(self.last_wake);
            if jump > self.config.resume_jump_threshold() {
                self.smooth_resume(wake, jump);
            }
            self.last_wake = wake;

            self.drain_commands(wake, date);

            let inputs = self.policy_inputs.read();
            self.note_global_transition(&inputs, wake);
            self.last_inputs = inputs;

            self.expire_quarantines(wake, date);

            let cell_start = wake.grid_floor();
            self.run_cell(cell_start, &inputs, date).await;

            self.publish(self.clock.now(), false);
        }

        tracing::info!("scheduler stopped");
    }

    // One grid cell: collect due firings, arbitrate, pack, execute.
    async fn run_cell(&mut self, cell_start: MonoTime, inputs: &PolicyInputs, date: NaiveDate) {
        let window_end = cell_start + GRID;
        let mut due = Vec::new();

        let letters: Vec<char> = self.drives.keys().copied().collect();
        for letter in letters {
            let Some(drive) = self.drives.get_mut(&letter) else {
                continue;
            };
            if !drive.is_schedulable() {
                continue;
            }
            let regular_due = drive.next_due < window_end;
            if !regular_due && !drive.ping_requested {
                continue;
            }

            let decision = self.arbiter.decide(drive, inputs);
            if !decision.allow {
                if drive.last_policy_reason != decision.reason {
                    drive.last_policy_reason = decision.reason;
                    self.sink.emit(&Event::PolicyChange {
                        ts: wall_ts(),
                        mono_ms: cell_start.as_millis(),
                        drive: Some(letter.to_string()),
                        reason: decision.reason,
                    });
                }
                drive.ping_requested = false;
                if regular_due {
                    // Denied ops advance the cadence as if they fired, so a
                    // later resume starts clean instead of flushing backlog.
                    drive.firing_index += 1;
                    self.replan(letter, cell_start, date);
                }
                continue;
            }

            if drive.last_policy_reason != DenyReason::None {
                drive.last_policy_reason = DenyReason::None;
                self.sink.emit(&Event::PolicyChange {
                    ts: wall_ts(),
                    mono_ms: cell_start.as_millis(),
                    drive: Some(letter.to_string()),
                    reason: DenyReason::None,
                });
            }

            let extra = drive.ping_requested && !regular_due;
            let op = if drive.ping_requested || drive.force_write {
                ProbeOp::Write
            } else {
                Self::cadence_op(&self.config, drive)
            };
            due.push(Firing {
                letter,
                op,
                firing_index: drive.firing_index,
                due: if extra { cell_start } else { drive.next_due },
                extra,
            });
        }

        let packed = self.planner.pack_cell(cell_start, due, self.last_launch);

        for firing in &packed.deferred {
            // Spilled firings are re-evaluated in the next cell. Extra
            // probes keep their request flag instead.
            if !firing.extra {
                if let Some(drive) = self.drives.get_mut(&firing.letter) {
                    drive.next_due = window_end;
                }
            }
        }

        for op in packed.ops {
            if *self.shutdown.borrow() {
                break;
            }
            self.execute_planned(op, date).await;
        }
    }

    async fn execute_planned(&mut self, op: PlannedOp, date: NaiveDate) {
        let Some(ping_dir) = self.drives.get(&op.letter).map(|d| d.ping_dir.clone()) else {
            return;
        };

        let now = self.clock.now();
        if op.launch > now {
            let wait = op.launch.saturating_since(now);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown.changed() => return,
            }
        }

        let launch_actual = self.clock.now();

        // A cancellation mid-probe grants the bounded drain window; after
        // that the outcome is abandoned.
        let outcome = {
            let engine = &self.engine;
            let shutdown = &mut self.shutdown;
            let probe = async {
                match op.op {
                    ProbeOp::Write => engine.probe_write(&ping_dir).await,
                    ProbeOp::Read => engine.probe_read(&ping_dir).await,
                }
            };
            tokio::pin!(probe);

            tokio::select! {
                outcome = &mut probe => Some(outcome),
                _ = shutdown.changed() => {
                    tokio::time::timeout(DRAIN_WINDOW, &mut probe).await.ok()
                }
            }
        };
        let Some(outcome) = outcome else {
            tracing::warn!(drive = %op.letter, "in-flight probe abandoned at shutdown");
            return;
        };

        self.last_launch = Some((launch_actual, op.op));
        self.record_outcome(op, launch_actual, outcome, date);
    }

    fn record_outcome(
        &mut self,
        op: PlannedOp,
        launch_actual: MonoTime,
        outcome: crate::drives::ProbeOutcome,
        date: NaiveDate,
    ) {
        let now = self.clock.now();
        let Some(drive) = self.drives.get_mut(&op.letter) else {
            return;
        };

        self.sink.emit(&Event::Probe(ProbeRecord {
            ts: wall_ts(),
            mono_ms: outcome.at.as_millis(),
            drive: op.letter.to_string(),
            op: op.op,
            code: outcome.code,
            latency_ms: outcome.latency_ms,
            tie_epoch: op.tie_epoch,
            tie_rank: op.tie_rank,
            pack_size: op.pack_size,
            notes: outcome.notes.clone(),
        }));
        tracing::debug!(
            drive = %op.letter,
            op = op.op.as_str(),
            code = ?outcome.code,
            latency_ms = outcome.latency_ms,
            "probe finished"
        );

        if op.op == ProbeOp::Read && outcome.notes.as_deref() == Some(NOTE_CREATED) {
            drive.force_write = true;
        }
        if op.op == ProbeOp::Write && outcome.code.counts_as_success() {
            drive.force_write = false;
        }
        drive.ping_requested = false;

        if outcome.code == ProbeCode::Error
            && outcome.notes.as_deref() == Some(NOTE_DEVICE_GONE)
        {
            drive.record_outcome(outcome);
            drive.state = DriveState::Offline;
            drive.last_policy_reason = DenyReason::Offline;
            tracing::warn!(drive = %op.letter, "volume vanished, marking offline");
            return;
        }

        let code = outcome.code;
        drive.record_outcome(outcome);
        drive.last_fire_actual = Some(launch_actual);

        if self.arbiter.note_outcome(drive, code, now) {
            let until = drive.quarantine_until.unwrap_or(drive.next_due);
            let failures = drive.consecutive_failures;
            drive.last_policy_reason = DenyReason::Quarantine;
            self.sink.emit(&Event::QuarantineEnter {
                ts: wall_ts(),
                mono_ms: now.as_millis(),
                drive: op.letter.to_string(),
                until_mono_ms: until.as_millis(),
                failures,
            });
            return;
        }

        if !op.extra {
            drive.firing_index += 1;
        }
        self.replan(op.letter, now, date);
    }

    /// Op selection on the canonical cadence. Mechanical drives always
    /// write; flash drives write on the first firing and every Nth after,
    /// reading in between.
    fn cadence_op(config: &RevenantConfig, drive: &Drive) -> ProbeOp {
        let mechanical = match drive.drive_type {
            DriveType::HDD => true,
            DriveType::Unknown => !config.treat_unknown_as_ssd,
            DriveType::SSD | DriveType::Removable => false,
        };
        if mechanical {
            return ProbeOp::Write;
        }

        let every = drive.interval.as_secs().div_ceil(30).max(1);
        if drive.firing_index % every == 0 {
            ProbeOp::Write
        } else {
            ProbeOp::Read
        }
    }

    fn replan(&mut self, letter: char, now: MonoTime, date: NaiveDate) {
        let Some(drive) = self.drives.get_mut(&letter) else {
            return;
        };
        if let Err(error) = self.planner.plan_next(drive, now, date) {
            // Planner inconsistency is a programming error; the drive is
            // benched but the loop must keep running.
            tracing::error!(drive = %letter, %error, "planning failed, disabling drive");
            drive.enabled = false;
            drive.state = DriveState::Disabled;
        }
    }

    fn note_global_transition(&mut self, inputs: &PolicyInputs, now: MonoTime) {
        let current = self.arbiter.global_reason(inputs);
        let previous = self.arbiter.global_reason(&self.last_inputs);
        if current != previous {
            tracing::info!(reason = %current.unwrap_or(DenyReason::None), "global policy changed");
            self.sink.emit(&Event::PolicyChange {
                ts: wall_ts(),
                mono_ms: now.as_millis(),
                drive: None,
                reason: current.unwrap_or(DenyReason::None),
            });
        }
    }

    fn expire_quarantines(&mut self, now: MonoTime, date: NaiveDate) {
        let letters: Vec<char> = self.drives.keys().copied().collect();
        for letter in letters {
            let Some(drive) = self.drives.get_mut(&letter) else {
                continue;
            };
            if self.arbiter.expire_quarantine(drive, now) {
                drive.last_policy_reason = DenyReason::None;
                self.sink.emit(&Event::QuarantineExit {
                    ts: wall_ts(),
                    mono_ms: now.as_millis(),
                    drive: letter.to_string(),
                });
                self.replan(letter, now, date);
            }
        }
    }

    /// Reset every enabled drive to a short future offset after a clock
    /// jump instead of firing the accumulated backlog.
    fn smooth_resume(&mut self, now: MonoTime, jump: Duration) {
        let mut count = 0u32;
        for drive in self.drives.values_mut() {
            if matches!(drive.state, DriveState::Quarantined | DriveState::Offline) {
                continue;
            }
            let offset = Duration::from_secs(2).min(drive.interval / 2);
            let due = (now + offset).grid_ceil();
            drive.cadence_anchor = due;
            drive.firing_index = 0;
            drive.next_due = due;
            drive.last_fire_actual = None;
            count += 1;
        }

        if count > 0 {
            tracing::info!(
                jump = %humantime::format_duration(jump),
                drives = count,
                "monotonic clock jumped, smoothing cadence"
            );
            self.sink.emit(&Event::ResumeSmooth {
                ts: wall_ts(),
                mono_ms: now.as_millis(),
                jump_ms: jump.as_millis() as u64,
                drives: count,
            });
        }
        self.last_launch = None;
    }

    fn drain_commands(&mut self, now: MonoTime, date: NaiveDate) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply_command(command, now, date);
        }
    }

    fn apply_command(&mut self, command: Command, now: MonoTime, date: NaiveDate) {
        match command {
            Command::SetDriveConfig { letter, update } => {
                self.apply_drive_config(letter, update, now, date);
            }
            Command::PauseDrive { letter } => {
                if let Some(drive) = self.drives.get_mut(&letter) {
                    drive.user_paused = true;
                    if drive.state == DriveState::Active {
                        drive.state = DriveState::Paused;
                    }
                    tracing::info!(drive = %letter, "paused by user");
                }
            }
            Command::ResumeDrive { letter } => {
                if let Some(drive) = self.drives.get_mut(&letter) {
                    drive.user_paused = false;
                    if drive.state == DriveState::Paused {
                        drive.state = DriveState::Active;
                    }
                    tracing::info!(drive = %letter, "resumed by user");
                }
            }
            Command::ReleaseQuarantine { letter } => {
                let Some(drive) = self.drives.get_mut(&letter) else {
                    return;
                };
                if drive.state == DriveState::Quarantined {
                    self.arbiter.release_quarantine(drive);
                    drive.last_policy_reason = DenyReason::None;
                    self.sink.emit(&Event::QuarantineExit {
                        ts: wall_ts(),
                        mono_ms: now.as_millis(),
                        drive: letter.to_string(),
                    });
                    self.replan(letter, now, date);
                }
            }
            Command::PingNow { letter } => {
                if let Some(drive) = self.drives.get_mut(&letter) {
                    drive.ping_requested = true;
                }
            }
            Command::RemoveDrive { letter } => {
                if self.drives.remove(&letter).is_some() {
                    tracing::info!(drive = %letter, "removed");
                }
            }
            Command::SyncDrives { drives } => {
                self.sync_drives(drives, now, date);
            }
        }
    }

    fn apply_drive_config(
        &mut self,
        letter: char,
        update: DriveConfigUpdate,
        now: MonoTime,
        date: NaiveDate,
    ) {
        if !self.drives.contains_key(&letter) {
            // Config restore path: a drive we have not enumerated yet.
            let drive_type = update.drive_type.unwrap_or(DriveType::Unknown);
            let discovered = DiscoveredDrive {
                letter,
                drive_type,
                size_bytes: 0,
                removable: drive_type == DriveType::Removable,
            };
            self.enable_drive(discovered, now, date);
        }

        let Some(drive) = self.drives.get_mut(&letter) else {
            return;
        };

        if let Some(drive_type) = update.drive_type {
            drive.drive_type = drive_type;
        }
        if let Some(ping_dir) = update.ping_dir {
            drive.ping_dir = ping_dir;
        }
        let requested = update
            .interval_sec
            .unwrap_or_else(|| drive.interval.as_secs());
        drive.interval = self.config.clamp_interval(requested, drive.drive_type);

        match update.enabled {
            Some(false) if drive.enabled => {
                drive.enabled = false;
                drive.state = DriveState::Disabled;
                drive.quarantine_until = None;
                tracing::info!(drive = %letter, "disabled");
            }
            Some(true) if !drive.enabled => {
                // A fresh enable period gets a fresh phase.
                drive.enabled = true;
                drive.state = if drive.user_paused {
                    DriveState::Paused
                } else {
                    DriveState::Active
                };
                drive.consecutive_failures = 0;
                self.prime_cadence(letter, now, date);
                tracing::info!(drive = %letter, "enabled");
            }
            _ => {
                self.replan(letter, now, date);
            }
        }
    }

    fn sync_drives(&mut self, discovered: Vec<DiscoveredDrive>, now: MonoTime, date: NaiveDate) {
        let present: Vec<char> = discovered.iter().map(|d| d.letter).collect();

        for item in discovered {
            match self.drives.get_mut(&item.letter) {
                Some(drive) => {
                    if drive.drive_type != item.drive_type {
                        drive.drive_type = item.drive_type;
                        drive.interval =
                            self.config.clamp_interval(drive.interval.as_secs(), item.drive_type);
                    }
                    if drive.state == DriveState::Offline {
                        drive.state = if drive.user_paused {
                            DriveState::Paused
                        } else {
                            DriveState::Active
                        };
                        drive.consecutive_failures = 0;
                        drive.last_policy_reason = DenyReason::None;
                        self.prime_cadence(item.letter, now, date);
                        tracing::info!(drive = %item.letter, "volume back online");
                    }
                }
                None => self.enable_drive(item, now, date),
            }
        }

        for (letter, drive) in self.drives.iter_mut() {
            if !present.contains(letter) && drive.state != DriveState::Offline {
                drive.state = DriveState::Offline;
                drive.last_policy_reason = DenyReason::Offline;
                tracing::warn!(drive = %letter, "volume missing from enumeration, marking offline");
            }
        }
    }

    fn enable_drive(&mut self, discovered: DiscoveredDrive, now: MonoTime, date: NaiveDate) {
        let letter = discovered.letter;
        let (interval_req, type_override, enabled, ping_dir) = match self.config.override_for(letter)
        {
            Some(entry) => (
                entry.interval_sec,
                entry.drive_type,
                entry.enabled,
                entry.ping_dir.clone(),
            ),
            None => (None, None, None, None),
        };

        let drive_type = type_override.unwrap_or(discovered.drive_type);
        let requested = interval_req.unwrap_or(self.config.default_interval_sec);
        let interval = self.config.clamp_interval(requested, drive_type);
        let ping_dir = ping_dir.unwrap_or_else(|| default_ping_dir(letter));

        let mut drive = Drive::new(letter, drive_type, interval, ping_dir);
        if enabled == Some(false) {
            drive.enabled = false;
            drive.state = DriveState::Disabled;
        }
        self.drives.insert(letter, drive);
        self.prime_cadence(letter, now, date);

        tracing::info!(
            drive = %letter,
            drive_type = ?drive_type,
            interval = %humantime::format_duration(interval),
            "managing volume"
        );
    }

    /// Start a fresh enable period: derive the phase, anchor the cadence,
    /// and plan the first firing.
    fn prime_cadence(&mut self, letter: char, now: MonoTime, date: NaiveDate) {
        let Some(drive) = self.drives.get_mut(&letter) else {
            return;
        };
        drive.phase_offset_cells =
            self.planner
                .phase_offset_cells(drive.letter, date, drive.interval);
        drive.cadence_anchor = now.grid_floor() + GRID * drive.phase_offset_cells as u32;
        drive.firing_index = 0;
        drive.last_fire_actual = None;
        self.replan(letter, now, date);
    }

    fn publish(&mut self, now: MonoTime, force: bool) {
        let pause_reason = self.arbiter.global_reason(&self.last_inputs);
        let snapshot = Snapshot::capture(now, &self.drives, pause_reason);
        let changed = force || !self.snapshots.borrow().same_observable(&snapshot);
        if changed {
            let _ = self.snapshots.send_replace(Arc::new(snapshot));
        }
    }
}

fn local_date() -> NaiveDate {
    chrono::Local::now().date_naive()
}
