/// Common test utilities for scheduler integration tests
///
/// Provides a paused-time test rig: real temp-dir probe targets, a
/// collecting event sink, and a running scheduler task behind its handle.
use drive_revenant::config::DriveOverride;
use drive_revenant::drives::DiscoveredDrive;
use drive_revenant::events::ProbeRecord;
use drive_revenant::{
    DriveType, Event, EventSink, RevenantConfig, RevenantHandle, SchedulerLoop,
    StaticPolicyInputs, SystemClock,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

/// Collects every emitted event for later inspection.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn probe_records(&self) -> Vec<ProbeRecord> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Probe(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    pub fn probes_for(&self, letter: char) -> Vec<ProbeRecord> {
        self.probe_records()
            .into_iter()
            .filter(|record| record.drive == letter.to_string())
            .collect()
    }

    pub fn count_matching(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// One drive the rig should manage.
pub struct RigDrive {
    pub letter: char,
    pub drive_type: DriveType,
    pub interval_sec: u64,
    /// Override the probe directory, e.g. to point somewhere unwritable.
    pub ping_dir: Option<PathBuf>,
}

impl RigDrive {
    pub fn new(letter: char, drive_type: DriveType, interval_sec: u64) -> Self {
        Self {
            letter,
            drive_type,
            interval_sec,
            ping_dir: None,
        }
    }
}

pub struct Rig {
    pub handle: RevenantHandle,
    pub sink: RecordingSink,
    pub inputs: Arc<StaticPolicyInputs>,
    pub dir: TempDir,
    pub task: tokio::task::JoinHandle<()>,
}

impl Rig {
    pub fn ping_dir(&self, letter: char) -> PathBuf {
        self.dir.path().join(letter.to_string())
    }
}

/// Assert the global spacing floors over a sequence of probe records in
/// execution order.
pub fn assert_min_spacing(records: &[ProbeRecord]) {
    use drive_revenant::ProbeOp;

    for pair in records.windows(2) {
        let gap = pair[1].mono_ms.saturating_sub(pair[0].mono_ms);
        assert!(
            gap >= 500,
            "any-any spacing violated: {}ms between {} and {}",
            gap,
            pair[0].drive,
            pair[1].drive
        );
        if pair[0].op == ProbeOp::Write && pair[1].op == ProbeOp::Write {
            assert!(
                gap >= 1_000,
                "write-write spacing violated: {}ms between {} and {}",
                gap,
                pair[0].drive,
                pair[1].drive
            );
        }
    }
}

/// Start a scheduler under paused tokio time.
///
/// Durability flushes are disabled so probes never touch the blocking pool;
/// everything else is the production path against a real filesystem.
pub fn start_rig(mut config: RevenantConfig, drives: Vec<RigDrive>) -> Rig {
    config.fsync = false;
    config.install_id = Uuid::parse_str("9d4b1f3a-5c27-4e88-b1d0-7a6e5c403f19").unwrap();

    let dir = TempDir::new().expect("temp dir");
    let mut seed = Vec::new();
    for drive in &drives {
        let ping_dir = drive
            .ping_dir
            .clone()
            .unwrap_or_else(|| dir.path().join(drive.letter.to_string()));
        config.drives.push(DriveOverride {
            letter: drive.letter.to_string(),
            interval_sec: Some(drive.interval_sec),
            drive_type: Some(drive.drive_type),
            enabled: None,
            ping_dir: Some(ping_dir),
        });
        seed.push(DiscoveredDrive {
            letter: drive.letter,
            drive_type: drive.drive_type,
            size_bytes: 0,
            removable: drive.drive_type == DriveType::Removable,
        });
    }

    let sink = RecordingSink::new();
    let inputs = Arc::new(StaticPolicyInputs::new());
    let (scheduler, handle) = SchedulerLoop::new(
        config,
        Arc::new(SystemClock::new()),
        inputs.clone(),
        Arc::new(sink.clone()),
        seed,
    );
    let task = tokio::spawn(scheduler.run());

    Rig {
        handle,
        sink,
        inputs,
        dir,
        task,
    }
}
