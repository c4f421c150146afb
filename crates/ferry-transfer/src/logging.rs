/// Transfer logging trait for structured lifecycle events.
///
/// The client driver, dispatcher and workers report what they do through a
/// `TransferLogger`, so binaries can route events to `tracing` and tests can
/// record them.
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use crate::protocol::ChunkRange;

/// Structured log entry for one transfer.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub filename: String,
    pub event: TransferEvent,
}

/// Where a transfer was when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Transferring,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Handshake => "handshake",
            Phase::Transferring => "transferring",
        })
    }
}

/// Transfer events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Dispatcher/client: DOWNLOAD answered with OK
    HandshakeAccepted { size: u64, data_port: u16 },
    /// Dispatcher/client: DOWNLOAD answered with ERR
    HandshakeRefused { reason: &'static str },
    /// Worker bound its data socket
    WorkerStarted { data_port: u16, client: String },
    /// Client: chunk request issued (once per range, not per attempt)
    ChunkRequested { range: ChunkRange },
    /// Worker: chunk sent back
    ChunkServed { range: ChunkRange },
    /// Client: chunk stored at its offset
    ChunkWritten { range: ChunkRange, bytes_done: u64, total: u64 },
    /// Worker: request outside the file, dropped without reply
    RangeRejected { range: ChunkRange, size: u64 },
    /// Exchange: one attempt went unanswered
    AttemptTimedOut { attempt: u32, timeout: Duration },
    /// A datagram that did not decode or did not match
    MalformedDatagram { from: String, reason: String },
    /// CLOSE answered with CLOSE_OK
    CloseAcknowledged,
    /// CLOSE never confirmed; content is kept
    CloseFailed { reason: String },
    /// Client: every byte received
    TransferComplete { bytes: u64, chunks: u64, sha256: String, duration_ms: u64 },
    /// Client/worker: transfer aborted
    TransferFailed { phase: Phase, message: String },
    /// Worker released its port
    WorkerStopped { data_port: u16, chunks_served: u64 },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeAccepted { size, data_port } => {
                write!(f, "handshake_accepted size={} data_port={}", size, data_port)
            }
            Self::HandshakeRefused { reason } => write!(f, "handshake_refused reason={}", reason),
            Self::WorkerStarted { data_port, client } => {
                write!(f, "worker_started data_port={} client={}", data_port, client)
            }
            Self::ChunkRequested { range } => write!(f, "chunk_requested range={}", range),
            Self::ChunkServed { range } => write!(f, "chunk_served range={}", range),
            Self::ChunkWritten { range, bytes_done, total } => {
                write!(f, "chunk_written range={} progress={}/{}", range, bytes_done, total)
            }
            Self::RangeRejected { range, size } => {
                write!(f, "range_rejected range={} size={}", range, size)
            }
            Self::AttemptTimedOut { attempt, timeout } => {
                write!(f, "attempt_timed_out attempt={} timeout_ms={}", attempt, timeout.as_millis())
            }
            Self::MalformedDatagram { from, reason } => {
                write!(f, "malformed_datagram from={} reason={}", from, reason)
            }
            Self::CloseAcknowledged => write!(f, "close_acknowledged"),
            Self::CloseFailed { reason } => write!(f, "close_failed reason={}", reason),
            Self::TransferComplete { bytes, chunks, sha256, duration_ms } => write!(
                f,
                "transfer_complete bytes={} chunks={} sha256={} duration_ms={}",
                bytes, chunks, sha256, duration_ms
            ),
            Self::TransferFailed { phase, message } => {
                write!(f, "transfer_failed phase={} error: {}", phase, message)
            }
            Self::WorkerStopped { data_port, chunks_served } => {
                write!(f, "worker_stopped data_port={} chunks_served={}", data_port, chunks_served)
            }
        }
    }
}

/// Trait for transfer logging. Implementations can write to tracing,
/// collect entries, or discard them.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // info for lifecycle, warn for failures, debug for per-chunk spam
        match &entry.event {
            TransferEvent::TransferFailed { .. }
            | TransferEvent::CloseFailed { .. }
            | TransferEvent::MalformedDatagram { .. }
            | TransferEvent::RangeRejected { .. } => {
                tracing::warn!(
                    component = entry.component,
                    file = %entry.filename,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::HandshakeAccepted { .. }
            | TransferEvent::HandshakeRefused { .. }
            | TransferEvent::WorkerStarted { .. }
            | TransferEvent::AttemptTimedOut { .. }
            | TransferEvent::CloseAcknowledged
            | TransferEvent::TransferComplete { .. }
            | TransferEvent::WorkerStopped { .. } => {
                tracing::info!(
                    component = entry.component,
                    file = %entry.filename,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::debug!(
                    component = entry.component,
                    file = %entry.filename,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}

/// Logger that keeps every entry in memory.
#[derive(Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<TransferLog>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything logged so far.
    pub fn entries(&self) -> Vec<TransferLog> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Events logged for `filename`, in order.
    pub fn events_for(&self, filename: &str) -> Vec<TransferEvent> {
        self.entries()
            .into_iter()
            .filter(|e| e.filename == filename)
            .map(|e| e.event)
            .collect()
    }
}

impl TransferLogger for MemoryLogger {
    fn log(&self, entry: TransferLog) {
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}
