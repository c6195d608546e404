// Structured telemetry records and the sink boundary.
//
// Human log formatting and file rotation are external concerns; the core
// hands every observable occurrence to an EventSink as a value.

use crate::drives::{ProbeCode, ProbeOp};
use crate::policy::DenyReason;
use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;

/// One probe execution, with its packing telemetry.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProbeRecord {
    /// Wall-clock timestamp, ISO-8601. Informational only; ordering and
    /// arithmetic always use `mono_ms`.
    pub ts: String,
    pub mono_ms: u64,
    pub drive: String,
    pub op: ProbeOp,
    pub code: ProbeCode,
    pub latency_ms: u64,
    pub tie_epoch: u64,
    pub tie_rank: u32,
    pub pack_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Probe(ProbeRecord),

    /// A drive's effective policy reason changed, or the global pause state
    /// flipped (`drive` absent).
    PolicyChange {
        ts: String,
        mono_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        drive: Option<String>,
        reason: DenyReason,
    },

    QuarantineEnter {
        ts: String,
        mono_ms: u64,
        drive: String,
        until_mono_ms: u64,
        failures: u32,
    },

    QuarantineExit {
        ts: String,
        mono_ms: u64,
        drive: String,
    },

    ResumeSmooth {
        ts: String,
        mono_ms: u64,
        jump_ms: u64,
        drives: u32,
    },
}

/// Sink boundary for structured events. Implementations must tolerate being
/// called from the scheduler's hot path; emit must not block on anything
/// slower than a buffered write.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Discards everything. Useful default for embedding and tests that only
/// care about snapshots.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &Event) {}
}

/// Writes one JSON object per line to the wrapped writer.
pub struct NdjsonSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl NdjsonSink {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl EventSink for NdjsonSink {
    fn emit(&self, event: &Event) {
        let mut line = match serde_json::to_vec(event) {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!(%error, "failed to serialize event");
                return;
            }
        };
        line.push(b'\n');

        let mut out = self.out.lock().unwrap();
        if let Err(error) = out.write_all(&line).and_then(|_| out.flush()) {
            tracing::warn!(%error, "failed to write event record");
        }
    }
}

/// Wall-clock stamp for event records.
pub fn wall_ts() -> String {
    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
