// Probe execution: tiny bounded writes and reads against the probe file.

use crate::clock::{Clock, MonoTime};
use crate::config::RevenantConfig;
use crate::drives::{ProbeCode, ProbeOp, ProbeOutcome};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Fixed name of the canonical probe file inside each ping directory.
pub const PROBE_FILE_NAME: &str = "drive_revenant";

/// Note attached to a read that found no canonical file yet.
pub const NOTE_CREATED: &str = "created";

/// Note attached when the volume root itself is gone.
pub const NOTE_DEVICE_GONE: &str = "device_gone";

/// Read probes never pull more than this many bytes.
const READ_CAP_BYTES: u64 = 4096;

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub fsync: bool,
    pub max_flush: Duration,
    pub lock_retry: Duration,
}

impl From<&RevenantConfig> for ProbeSettings {
    fn from(config: &RevenantConfig) -> Self {
        Self {
            fsync: config.fsync,
            max_flush: Duration::from_millis(config.max_flush_ms),
            lock_retry: Duration::from_millis(config.lock_retry_ms),
        }
    }
}

enum FlushResult {
    Completed,
    TimedOut,
    Failed(std::io::Error),
}

/// Executes one probe at a time. All failures are classified into an
/// outcome; nothing propagates as an error.
pub struct ProbeEngine {
    settings: ProbeSettings,
    clock: Arc<dyn Clock>,
}

impl ProbeEngine {
    pub fn new(settings: ProbeSettings, clock: Arc<dyn Clock>) -> Self {
        Self { settings, clock }
    }

    /// Touch the canonical probe file through an atomic staged replace.
    ///
    /// The payload is a single short ASCII line. When a durability flush is
    /// requested it runs on the blocking pool with a deadline; a timeout
    /// downgrades the outcome to a partial flush but the replace still
    /// happens, since partial durability is acceptable for a keep-alive
    /// touch.
    pub async fn probe_write(&self, ping_dir: &Path) -> ProbeOutcome {
        let started = self.clock.now();

        if let Err(error) = std::fs::create_dir_all(ping_dir) {
            let (code, notes) = classify_failure(&error);
            tracing::debug!(dir = %ping_dir.display(), %error, "ping dir unavailable");
            return self.outcome(ProbeOp::Write, code, started, Some(notes));
        }

        let mut staged = match tempfile::Builder::new()
            .prefix(PROBE_FILE_NAME)
            .suffix(".tmp")
            .tempfile_in(ping_dir)
        {
            Ok(staged) => staged,
            Err(error) => {
                let (code, notes) = classify_failure(&error);
                return self.outcome(ProbeOp::Write, code, started, Some(notes));
            }
        };

        let payload = format!("{PROBE_FILE_NAME} {}\n", started.as_millis());
        debug_assert!(payload.len() <= 64);
        if let Err(error) = staged.write_all(payload.as_bytes()) {
            let (code, notes) = classify_failure(&error);
            return self.outcome(ProbeOp::Write, code, started, Some(notes));
        }

        let mut code = ProbeCode::Ok;
        let mut notes = None;
        if self.settings.fsync {
            match self.flush_bounded(staged.as_file()).await {
                FlushResult::Completed => {}
                FlushResult::TimedOut => {
                    code = ProbeCode::PartialFlush;
                    notes = Some(format!(
                        "flush exceeded {}ms",
                        self.settings.max_flush.as_millis()
                    ));
                }
                FlushResult::Failed(error) => {
                    let (code, notes) = classify_failure(&error);
                    return self.outcome(ProbeOp::Write, code, started, Some(notes));
                }
            }
        }

        let canonical = ping_dir.join(PROBE_FILE_NAME);
        match staged.persist(&canonical) {
            Ok(_) => self.outcome(ProbeOp::Write, code, started, notes),
            Err(persist_error) if is_lock_error(&persist_error.error) => {
                // One retry after the configured backoff; a second lock
                // means somebody is holding the file and we step aside.
                tokio::time::sleep(self.settings.lock_retry).await;
                match persist_error.file.persist(&canonical) {
                    Ok(_) => self.outcome(ProbeOp::Write, code, started, notes),
                    Err(retry_error) if is_lock_error(&retry_error.error) => self.outcome(
                        ProbeOp::Write,
                        ProbeCode::SkipLocked,
                        started,
                        Some("sharing_violation".into()),
                    ),
                    Err(retry_error) => {
                        let (code, notes) = classify_failure(&retry_error.error);
                        self.outcome(ProbeOp::Write, code, started, Some(notes))
                    }
                }
            }
            Err(persist_error) => {
                let (code, notes) = classify_failure(&persist_error.error);
                self.outcome(ProbeOp::Write, code, started, Some(notes))
            }
        }
    }

    /// Read back the canonical probe file.
    ///
    /// A missing file is not a failure: the volume was touched recently
    /// enough that the directory exists, so report success and let the
    /// scheduler turn the next firing into a write.
    pub async fn probe_read(&self, ping_dir: &Path) -> ProbeOutcome {
        let started = self.clock.now();
        let canonical = ping_dir.join(PROBE_FILE_NAME);

        match File::open(&canonical) {
            Ok(file) => {
                let mut content = Vec::new();
                match file.take(READ_CAP_BYTES).read_to_end(&mut content) {
                    Ok(_) => self.outcome(ProbeOp::Read, ProbeCode::Ok, started, None),
                    Err(error) => {
                        let (code, notes) = classify_failure(&error);
                        self.outcome(ProbeOp::Read, code, started, Some(notes))
                    }
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => self.outcome(
                ProbeOp::Read,
                ProbeCode::Ok,
                started,
                Some(NOTE_CREATED.into()),
            ),
            Err(error) if is_lock_error(&error) => self.outcome(
                ProbeOp::Read,
                ProbeCode::SkipLocked,
                started,
                Some("sharing_violation".into()),
            ),
            Err(error) => {
                let (code, notes) = classify_failure(&error);
                self.outcome(ProbeOp::Read, code, started, Some(notes))
            }
        }
    }

    async fn flush_bounded(&self, file: &File) -> FlushResult {
        let dup = match file.try_clone() {
            Ok(dup) => dup,
            Err(error) => return FlushResult::Failed(error),
        };

        let flush = tokio::task::spawn_blocking(move || dup.sync_all());
        match tokio::time::timeout(self.settings.max_flush, flush).await {
            Ok(Ok(Ok(()))) => FlushResult::Completed,
            Ok(Ok(Err(error))) => FlushResult::Failed(error),
            Ok(Err(join_error)) => FlushResult::Failed(std::io::Error::other(join_error)),
            // The wait is abandoned; the blocking task finishes on its own.
            Err(_) => FlushResult::TimedOut,
        }
    }

    fn outcome(
        &self,
        op: ProbeOp,
        code: ProbeCode,
        started: MonoTime,
        notes: Option<String>,
    ) -> ProbeOutcome {
        let latency_ms = self.clock.now().saturating_since(started).as_millis() as u64;
        ProbeOutcome {
            op,
            code,
            latency_ms,
            at: started,
            notes,
        }
    }
}

/// Sharing-violation class errors: somebody else holds the file and will
/// let go shortly. These skip without counting as failures.
pub fn is_lock_error(error: &std::io::Error) -> bool {
    if error.kind() == std::io::ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(windows)]
    {
        // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
        if matches!(error.raw_os_error(), Some(32) | Some(33)) {
            return true;
        }
    }
    false
}

/// Map an I/O error to an outcome code and a short classification note.
pub fn classify_failure(error: &std::io::Error) -> (ProbeCode, String) {
    if is_lock_error(error) {
        return (ProbeCode::SkipLocked, "sharing_violation".into());
    }
    if error.kind() == std::io::ErrorKind::NotFound {
        // The volume root itself disappeared underneath us.
        return (ProbeCode::Error, NOTE_DEVICE_GONE.into());
    }
    (ProbeCode::Error, format!("{:?}", error.kind()))
}
