/// Ferry Transfer: reliable file download over plain UDP.
///
/// Provides stop-and-wait file transfer with:
/// - Text wire protocol with a single-token base64 payload
/// - Doubling-timeout retransmission on the client (1s, 2s, 4s, 8s, 16s)
/// - One dispatcher on a well-known port, one worker task per transfer
/// - Random data ports from a leased pool
/// - SHA-256 digest of every completed download

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod ports;
pub mod protocol;
pub mod settings;
pub mod storage;
pub mod worker;

// Re-export key types for convenience.
pub use client::{Client, ClientConfig, DownloadOutcome};
pub use dispatcher::{DEFAULT_IDLE_TIMEOUT, Dispatcher, ServerConfig};
pub use error::{ProtocolError, Result, SettingError, TransferError};
pub use exchange::{Exchanger, INITIAL_TIMEOUT, MAX_ATTEMPTS, RetryPolicy};
pub use logging::{MemoryLogger, NullLogger, Phase, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use ports::{PortLease, PortPool};
pub use protocol::{
    CHUNK_SIZE, ChunkRange, DATA_PORT_MAX, DATA_PORT_MIN, ErrorCode, MAX_DATAGRAM, Message,
    chunk_count, chunk_ranges, validate_filename,
};
pub use storage::{DirStorage, Storage};
pub use worker::{DataChannel, TransferSession, TransferWorker};
