/// Well-known-port listener for download requests.
///
/// The dispatcher answers `DOWNLOAD` handshakes and hands each accepted
/// transfer to its own worker task with a fresh data channel. It never
/// waits on a transfer; the next datagram is read as soon as the worker is
/// spawned. A retransmitted `DOWNLOAD` for a transfer that is still live gets
/// the same data port again instead of a second worker.
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::logging::{Phase, TransferEvent, TransferLog, TransferLogger};
use crate::ports::PortPool;
use crate::protocol::{DATA_PORT_MAX, DATA_PORT_MIN, ErrorCode, MAX_DATAGRAM, Message};
use crate::storage::Storage;
use crate::worker::{DataChannel, TransferSession, TransferWorker, bind_tokio_socket};

/// Default worker idle timeout. Longer than a client's whole backoff budget
/// for one request (1+2+4+8+16 seconds).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for the server side.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Well-known address; its IP is also used for data sockets.
    pub bind_addr: SocketAddr,
    pub data_ports: RangeInclusive<u16>,
    /// Worker idle timeout. `None` keeps a worker until CLOSE, which leaks its
    /// port if the client gives up.
    pub idle_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            data_ports: DATA_PORT_MIN..=DATA_PORT_MAX,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

/// What storage knows about a requested name.
enum Lookup {
    Found(u64),
    Missing,
    Refused,
}

/// Live transfers by requesting client and filename.
type Sessions = Arc<Mutex<HashMap<(SocketAddr, String), LiveSession>>>;

#[derive(Debug, Clone, Copy)]
struct LiveSession {
    size: u64,
    data_port: u16,
}

pub struct Dispatcher {
    socket: UdpSocket,
    config: ServerConfig,
    ports: Arc<PortPool>,
    sessions: Sessions,
    storage: Arc<dyn Storage>,
    logger: Arc<dyn TransferLogger>,
}

impl Dispatcher {
    /// Bind the well-known socket. Failing here is the only fatal server error.
    pub async fn bind(
        config: ServerConfig,
        storage: Arc<dyn Storage>,
        logger: Arc<dyn TransferLogger>,
    ) -> io::Result<Self> {
        let socket = bind_tokio_socket(config.bind_addr)?;
        let ports = PortPool::new(config.data_ports.clone());
        Ok(Self {
            socket,
            config,
            ports,
            sessions: Sessions::default(),
            storage,
            logger,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn ports(&self) -> &Arc<PortPool> {
        &self.ports
    }

    /// Serve forever. Per-request failures are logged, never returned.
    pub async fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        info!(
            "Dispatcher listening on {} (data ports {}-{})",
            self.config.bind_addr,
            self.config.data_ports.start(),
            self.config.data_ports.end()
        );

        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // Includes ICMP resets surfaced on the next recv (Windows).
                    debug!("Dispatcher recv error: {}", e);
                    continue;
                }
            };

            match Message::decode(&buf[..len]) {
                Ok(Message::Download { filename }) => self.handle_download(filename, from).await,
                Ok(other) => {
                    warn!("Invalid request on well-known port from {}: {}", from, other.verb());
                }
                Err(e) => self.log(
                    "",
                    TransferEvent::MalformedDatagram {
                        from: from.to_string(),
                        reason: e.to_string(),
                    },
                ),
            }
        }
    }

    async fn handle_download(&self, filename: String, client: SocketAddr) {
        let key = (client, filename);
        let live = lock(&self.sessions).get(&key).copied();
        let (client, filename) = key;
        if let Some(live) = live {
            // Our OK was lost or late; point the client at the same worker.
            debug!("Repeated DOWNLOAD {} from {}, data port {}", filename, client, live.data_port);
            self.accept(&filename, client, live.size, live.data_port).await;
            return;
        }

        let size = match self.lookup(&filename).await {
            Lookup::Found(size) => size,
            Lookup::Missing => return self.refuse(filename, client, ErrorCode::NotFound).await,
            Lookup::Refused => return self.refuse(filename, client, ErrorCode::Invalid).await,
        };

        let channel = match DataChannel::bind(self.config.bind_addr.ip(), &self.ports) {
            Ok(channel) => channel,
            Err(e) => {
                // No reply: the client retries and may find a free port later.
                self.log(
                    &filename,
                    TransferEvent::TransferFailed {
                        phase: Phase::Handshake,
                        message: e.to_string(),
                    },
                );
                return;
            }
        };
        let data_port = channel.port();

        if !self.accept(&filename, client, size, data_port).await {
            return;
        }
        lock(&self.sessions).insert((client, filename.clone()), LiveSession { size, data_port });

        let session = TransferSession {
            filename,
            file_size: size,
            client,
            data_port,
        };
        let worker = TransferWorker::new(
            session,
            channel,
            Arc::clone(&self.storage),
            Arc::clone(&self.logger),
        )
        .with_idle_timeout(self.config.idle_timeout);

        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let key = (worker.session().client, worker.session().filename.clone());
            match worker.run().await {
                Ok(chunks) => debug!("Transfer of {} finished after {} chunks", key.1, chunks),
                Err(e) => warn!("Transfer of {} aborted: {}", key.1, e),
            }
            let mut live = lock(&sessions);
            if live.get(&key).is_some_and(|s| s.data_port == data_port) {
                live.remove(&key);
            }
        });
    }

    /// Send `OK` for a transfer served on `data_port`. False if the send failed.
    async fn accept(&self, filename: &str, client: SocketAddr, size: u64, data_port: u16) -> bool {
        let reply = Message::DownloadOk {
            filename: filename.to_string(),
            size,
            port: data_port,
        };
        if let Err(e) = self.socket.send_to(&reply.encode(), client).await {
            warn!("Send OK to {} failed: {}", client, e);
            return false;
        }
        self.log(filename, TransferEvent::HandshakeAccepted { size, data_port });
        true
    }

    async fn refuse(&self, filename: String, client: SocketAddr, code: ErrorCode) {
        let reply = Message::DownloadErr {
            filename: filename.clone(),
            code,
        };
        if let Err(e) = self.socket.send_to(&reply.encode(), client).await {
            warn!("Send ERR to {} failed: {}", client, e);
            return;
        }
        self.log(
            &filename,
            TransferEvent::HandshakeRefused {
                reason: code.as_str(),
            },
        );
    }

    async fn lookup(&self, filename: &str) -> Lookup {
        let storage = Arc::clone(&self.storage);
        let name = filename.to_string();
        let looked_up = tokio::task::spawn_blocking(move || match storage.size(&name) {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Lookup::Refused,
            Ok(size) if storage.exists(&name) => Lookup::Found(size),
            _ => Lookup::Missing,
        })
        .await;
        looked_up.unwrap_or_else(|e| {
            warn!("Lookup of {} failed: {}", filename, e);
            Lookup::Missing
        })
    }

    fn log(&self, filename: &str, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: "dispatcher",
            filename: filename.to_string(),
            event,
        });
    }
}

fn lock(sessions: &Sessions) -> MutexGuard<'_, HashMap<(SocketAddr, String), LiveSession>> {
    sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
