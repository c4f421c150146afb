/// Client transfer driver.
///
/// Downloads one file at a time: `DOWNLOAD` handshake on the well-known
/// port, then one `GET` per chunk on the advertised data port, then `CLOSE`.
/// Every request goes through the same `Exchanger`, so each step gets the
/// full backoff schedule.
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Result, TransferError};
use crate::exchange::{Exchanger, RetryPolicy};
use crate::logging::{Phase, TransferEvent, TransferLog, TransferLogger};
use crate::protocol::{ChunkRange, ErrorCode, Message, chunk_ranges, validate_filename};
use crate::storage::Storage;

/// Configuration for the client side.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server well-known address.
    pub server: SocketAddr,
    pub retry: RetryPolicy,
    /// Local bind address. `None` picks any port on the unspecified address.
    pub local_addr: Option<SocketAddr>,
}

impl ClientConfig {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            retry: RetryPolicy::default(),
            local_addr: None,
        }
    }
}

/// A finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub filename: String,
    pub bytes: u64,
    pub chunks: u64,
    /// Hex SHA-256 of the received content.
    pub sha256: String,
    /// False if CLOSE went unanswered. The file is complete either way.
    pub close_confirmed: bool,
}

pub struct Client {
    exchanger: Exchanger,
    server: SocketAddr,
    storage: Arc<dyn Storage>,
    logger: Arc<dyn TransferLogger>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        storage: Arc<dyn Storage>,
        logger: Arc<dyn TransferLogger>,
    ) -> Result<Self> {
        let local = config.local_addr.unwrap_or_else(|| match config.server {
            SocketAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            SocketAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        });
        let exchanger = Exchanger::bind(local, config.retry, Arc::clone(&logger))?;
        Ok(Self {
            exchanger,
            server: config.server,
            storage,
            logger,
        })
    }

    /// Download every name in order. A failed file never stops the rest.
    pub fn download_all<I, S>(&mut self, names: I) -> Vec<(String, Result<DownloadOutcome>)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|name| {
                let name = name.as_ref().to_string();
                let result = self.download(&name);
                (name, result)
            })
            .collect()
    }

    /// Download `filename` into storage under the same name.
    ///
    /// On any failure after the handshake the partial file is removed.
    /// Nothing is created when the handshake fails.
    pub fn download(&mut self, filename: &str) -> Result<DownloadOutcome> {
        validate_filename(filename)?;
        let started = Instant::now();

        let (size, port) = self.handshake(filename).inspect_err(|e| {
            self.log(
                filename,
                TransferEvent::TransferFailed {
                    phase: Phase::Handshake,
                    message: e.to_string(),
                },
            )
        })?;
        let data_addr = SocketAddr::new(self.server.ip(), port);

        let (chunks, sha256) = match self.receive(filename, size, data_addr) {
            Ok(received) => received,
            Err(e) => {
                self.discard(filename);
                self.log(
                    filename,
                    TransferEvent::TransferFailed {
                        phase: Phase::Transferring,
                        message: e.to_string(),
                    },
                );
                return Err(e);
            }
        };

        let close_confirmed = match self.close(filename, data_addr) {
            Ok(()) => {
                self.log(filename, TransferEvent::CloseAcknowledged);
                true
            }
            Err(e) => {
                self.log(filename, TransferEvent::CloseFailed { reason: e.to_string() });
                false
            }
        };

        self.log(
            filename,
            TransferEvent::TransferComplete {
                bytes: size,
                chunks,
                sha256: sha256.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
            },
        );
        Ok(DownloadOutcome {
            filename: filename.to_string(),
            bytes: size,
            chunks,
            sha256,
            close_confirmed,
        })
    }

    /// Returns the advertised size and data port.
    fn handshake(&mut self, filename: &str) -> Result<(u64, u16)> {
        let request = Message::Download {
            filename: filename.to_string(),
        };
        let (size, port) = self.request(&request, self.server, false, |msg| match msg {
            Message::DownloadOk { filename: name, size, port } if name == filename => {
                Ok((size, port))
            }
            Message::DownloadErr { filename: name, code } if name == filename => {
                Err(match code {
                    ErrorCode::NotFound => TransferError::NotFound(name),
                    ErrorCode::Invalid => TransferError::Rejected(name),
                })
            }
            other => Err(stale(format!("{} for {}", other.verb(), other.filename()))),
        })?;
        self.log(filename, TransferEvent::HandshakeAccepted { size, data_port: port });
        Ok((size, port))
    }

    /// Fetch every chunk in ascending order and store it at its offset.
    fn receive(&mut self, filename: &str, size: u64, data_addr: SocketAddr) -> Result<(u64, String)> {
        self.storage
            .create(filename, size)
            .map_err(TransferError::Storage)?;

        let mut hasher = Sha256::new();
        let mut bytes_done = 0u64;
        let mut chunks = 0u64;
        for range in chunk_ranges(size) {
            self.log(filename, TransferEvent::ChunkRequested { range });
            let payload = self.fetch_chunk(filename, range, data_addr)?;
            self.storage
                .write(filename, range.start, &payload)
                .map_err(TransferError::Storage)?;

            hasher.update(&payload);
            bytes_done += payload.len() as u64;
            chunks += 1;
            self.log(
                filename,
                TransferEvent::ChunkWritten {
                    range,
                    bytes_done,
                    total: size,
                },
            );
        }
        Ok((chunks, hex::encode(hasher.finalize())))
    }

    fn fetch_chunk(&mut self, filename: &str, range: ChunkRange, data_addr: SocketAddr) -> Result<Vec<u8>> {
        let request = Message::ChunkGet {
            filename: filename.to_string(),
            range,
        };
        self.request(&request, data_addr, true, |msg| match msg {
            Message::ChunkData { filename: name, range: got, payload }
                if name == filename && got == range =>
            {
                Ok(payload)
            }
            Message::ChunkData { range: got, .. } => Err(stale(format!("DATA for {got}, wanted {range}"))),
            other => Err(stale(format!("{} for {}", other.verb(), other.filename()))),
        })
    }

    fn close(&mut self, filename: &str, data_addr: SocketAddr) -> Result<()> {
        let request = Message::Close {
            filename: filename.to_string(),
        };
        self.request(&request, data_addr, true, |msg| match msg {
            Message::CloseOk { filename: name } if name == filename => Ok(()),
            other => Err(stale(format!("{} for {}", other.verb(), other.filename()))),
        })
    }

    /// Exchange `request` until `classify` accepts a response.
    ///
    /// A timeout from the exchanger ends the request at once. Retryable
    /// answers (stale ones, and malformed ones when `retry_malformed` is
    /// set) re-issue the request, at most `max_attempts` times.
    fn request<T>(
        &mut self,
        request: &Message,
        target: SocketAddr,
        retry_malformed: bool,
        mut classify: impl FnMut(Message) -> Result<T>,
    ) -> Result<T> {
        let rounds = self.exchanger.policy().max_attempts;
        let mut last = None;

        for _ in 0..rounds {
            let raw = self.exchanger.exchange(request, target)?;
            let outcome = match Message::decode(&raw) {
                Ok(msg) => classify(msg),
                Err(e) => {
                    self.log(
                        request.filename(),
                        TransferEvent::MalformedDatagram {
                            from: target.to_string(),
                            reason: e.to_string(),
                        },
                    );
                    Err(e.into())
                }
            };
            match outcome {
                Err(e)
                    if e.is_retryable()
                        && (retry_malformed || !matches!(e, TransferError::Malformed(_))) =>
                {
                    debug!("Re-requesting {} {}: {}", request.verb(), request.filename(), e);
                    last = Some(e);
                }
                done => return done,
            }
        }

        Err(last.unwrap_or(TransferError::Timeout { attempts: rounds }))
    }

    fn discard(&self, filename: &str) {
        if let Err(e) = self.storage.remove(filename) {
            warn!("Could not remove partial {}: {}", filename, e);
        }
    }

    fn log(&self, filename: &str, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: "client",
            filename: filename.to_string(),
            event,
        });
    }
}

/// A well-formed answer to some other request.
fn stale(what: String) -> TransferError {
    TransferError::Unexpected(what)
}
