/// Server side of one file transfer.
///
/// A worker owns a dedicated data socket for the lifetime of one transfer.
/// It answers chunk requests with base64 payloads until the client sends
/// `CLOSE`, then releases the socket and its port.
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::{Result, TransferError};
use crate::logging::{Phase, TransferEvent, TransferLog, TransferLogger};
use crate::ports::{PortLease, PortPool};
use crate::protocol::{CHUNK_SIZE, ChunkRange, MAX_DATAGRAM, Message};
use crate::storage::Storage;

/// Leases tried before giving up on binding a data socket.
const BIND_ATTEMPTS: usize = 16;

/// Everything a worker knows about its transfer. Owned by exactly one worker.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub filename: String,
    pub file_size: u64,
    pub client: SocketAddr,
    pub data_port: u16,
}

/// A bound data socket plus the port reservation backing it.
pub struct DataChannel {
    socket: UdpSocket,
    lease: PortLease,
}

impl DataChannel {
    /// Bind a socket on `ip` using a port leased from `pool`.
    ///
    /// Ports held by other processes are skipped. Must be called from
    /// within a tokio runtime.
    pub fn bind(ip: IpAddr, pool: &Arc<PortPool>) -> Result<Self> {
        for _ in 0..BIND_ATTEMPTS {
            let lease = pool.lease().ok_or(TransferError::PortsExhausted)?;
            let addr = SocketAddr::new(ip, lease.port());
            match bind_tokio_socket(addr) {
                Ok(socket) => return Ok(Self { socket, lease }),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!("Data port {} busy, drawing another", lease.port());
                }
                Err(e) => return Err(TransferError::Io(e)),
            }
        }
        Err(TransferError::PortsExhausted)
    }

    pub fn port(&self) -> u16 {
        self.lease.port()
    }
}

pub struct TransferWorker {
    session: TransferSession,
    channel: DataChannel,
    storage: Arc<dyn Storage>,
    logger: Arc<dyn TransferLogger>,
    idle_timeout: Option<Duration>,
}

impl TransferWorker {
    pub fn new(
        session: TransferSession,
        channel: DataChannel,
        storage: Arc<dyn Storage>,
        logger: Arc<dyn TransferLogger>,
    ) -> Self {
        Self {
            session,
            channel,
            storage,
            logger,
            idle_timeout: None,
        }
    }

    /// Stop after this long without any datagram. `None` waits for CLOSE forever.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    /// Serve the transfer until CLOSE, idle timeout or a storage failure.
    ///
    /// Returns the number of chunks served.
    pub async fn run(self) -> Result<u64> {
        self.log(TransferEvent::WorkerStarted {
            data_port: self.session.data_port,
            client: self.session.client.to_string(),
        });

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut served = 0u64;
        let result = self.serve(&mut buf, &mut served).await;

        if let Err(e) = &result {
            self.log(TransferEvent::TransferFailed {
                phase: Phase::Transferring,
                message: e.to_string(),
            });
        }
        self.log(TransferEvent::WorkerStopped {
            data_port: self.session.data_port,
            chunks_served: served,
        });
        // Socket and lease are released when `self` drops here.
        result.map(|()| served)
    }

    async fn serve(&self, buf: &mut [u8], served: &mut u64) -> Result<()> {
        loop {
            let (len, from) = match self.recv(buf).await {
                Some(Ok(received)) => received,
                Some(Err(e)) if is_unreachable(&e) => continue,
                Some(Err(e)) => return Err(TransferError::Io(e)),
                None => {
                    info!(
                        "Worker for {} idle for {:?}, stopping",
                        self.session.filename, self.idle_timeout
                    );
                    return Ok(());
                }
            };
            if from != self.session.client {
                debug!("Request for {} from {} (session client {})", self.session.filename, from, self.session.client);
            }

            let msg = match Message::decode(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    self.log(TransferEvent::MalformedDatagram {
                        from: from.to_string(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if msg.filename() != self.session.filename {
                debug!("Ignoring {} for {} on {}'s channel", msg.verb(), msg.filename(), self.session.filename);
                continue;
            }

            match msg {
                Message::ChunkGet { range, .. } => {
                    if self.serve_chunk(range).await? {
                        *served += 1;
                    }
                }
                Message::Close { filename } => {
                    self.reply(&Message::CloseOk { filename }).await;
                    self.log(TransferEvent::CloseAcknowledged);
                    return Ok(());
                }
                other => debug!("Ignoring {} on data channel", other.verb()),
            }
        }
    }

    /// Next datagram, or `None` once the idle timeout passes.
    async fn recv(&self, buf: &mut [u8]) -> Option<io::Result<(usize, SocketAddr)>> {
        match self.idle_timeout {
            Some(idle) => tokio::time::timeout(idle, self.channel.socket.recv_from(buf))
                .await
                .ok(),
            None => Some(self.channel.socket.recv_from(buf).await),
        }
    }

    /// Answer one GET. Out-of-range requests and spans longer than one
    /// chunk get no reply; a read failure ends the worker.
    async fn serve_chunk(&self, range: ChunkRange) -> Result<bool> {
        if range.len() > CHUNK_SIZE || range.validate(self.session.file_size).is_err() {
            self.log(TransferEvent::RangeRejected {
                range,
                size: self.session.file_size,
            });
            return Ok(false);
        }

        let storage = Arc::clone(&self.storage);
        let name = self.session.filename.clone();
        let len = range.len() as usize;
        let payload = tokio::task::spawn_blocking(move || storage.read(&name, range.start, len))
            .await
            .map_err(|e| TransferError::Storage(io::Error::other(e)))?
            .map_err(TransferError::Storage)?;

        self.reply(&Message::ChunkData {
            filename: self.session.filename.clone(),
            range,
            payload,
        })
        .await;
        self.log(TransferEvent::ChunkServed { range });
        Ok(true)
    }

    async fn reply(&self, msg: &Message) {
        if let Err(e) = self.channel.socket.send_to(&msg.encode(), self.session.client).await {
            // The client retries; a lost reply is just a dropped datagram.
            warn!("Send to {} failed: {}", self.session.client, e);
        }
    }

    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: "worker",
            filename: self.session.filename.clone(),
            event,
        });
    }
}

fn is_unreachable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

/// Bind a non-blocking UDP socket and hand it to tokio.
pub(crate) fn bind_tokio_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    let std_sock: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_sock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLogger;
    use crate::storage::DirStorage;

    async fn start_worker(
        contents: &[u8],
        pool_range: std::ops::RangeInclusive<u16>,
    ) -> (tempfile::TempDir, UdpSocket, u16, Arc<MemoryLogger>, tokio::task::JoinHandle<Result<u64>>) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("data.bin"), contents).unwrap();
        let storage: Arc<dyn Storage> = Arc::new(DirStorage::new(tmp.path()).unwrap());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let pool = PortPool::new(pool_range);
        let channel = DataChannel::bind("127.0.0.1".parse().unwrap(), &pool).unwrap();
        let port = channel.port();
        let session = TransferSession {
            filename: "data.bin".into(),
            file_size: contents.len() as u64,
            client: client.local_addr().unwrap(),
            data_port: port,
        };
        let logger = Arc::new(MemoryLogger::new());
        let worker = TransferWorker::new(session, channel, storage, logger.clone());
        let handle = tokio::spawn(worker.run());
        (tmp, client, port, logger, handle)
    }

    async fn ask(client: &UdpSocket, port: u16, request: &[u8]) -> Option<Message> {
        client.send_to(request, ("127.0.0.1", port)).await.unwrap();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match tokio::time::timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(Message::decode(&buf[..len]).unwrap()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn serves_range_then_closes() {
        let contents: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        let (_tmp, client, port, _logger, handle) = start_worker(&contents, 43100..=43199).await;

        let reply = ask(&client, port, b"FILE data.bin GET START 1000 END 1499").await;
        match reply {
            Some(Message::ChunkData { range, payload, .. }) => {
                assert_eq!(range, ChunkRange::new(1000, 1499));
                assert_eq!(payload, contents[1000..1500]);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        let reply = ask(&client, port, b"FILE data.bin CLOSE").await;
        assert_eq!(reply, Some(Message::CloseOk { filename: "data.bin".into() }));
        assert_eq!(handle.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn out_of_range_and_foreign_requests_get_no_reply() {
        let (_tmp, client, port, logger, handle) = start_worker(b"0123456789", 43200..=43299).await;

        assert!(ask(&client, port, b"FILE data.bin GET START 5 END 10").await.is_none());
        assert!(ask(&client, port, b"FILE data.bin GET START 7 END 3").await.is_none());
        assert!(ask(&client, port, b"FILE other.bin GET START 0 END 1").await.is_none());
        assert!(ask(&client, port, b"garbage").await.is_none());

        // Still serving afterwards.
        let reply = ask(&client, port, b"FILE data.bin GET START 0 END 9").await;
        assert!(matches!(reply, Some(Message::ChunkData { .. })));
        ask(&client, port, b"FILE data.bin CLOSE").await;
        handle.await.unwrap().unwrap();

        let rejected = logger
            .events_for("data.bin")
            .into_iter()
            .filter(|e| matches!(e, TransferEvent::RangeRejected { .. }))
            .count();
        assert_eq!(rejected, 2);
    }

    #[tokio::test]
    async fn spans_longer_than_a_chunk_are_dropped() {
        let contents: Vec<u8> = (0..5000u32).map(|i| (i % 13) as u8).collect();
        let (_tmp, client, port, logger, handle) = start_worker(&contents, 43050..=43099).await;

        assert!(ask(&client, port, b"FILE data.bin GET START 0 END 4999").await.is_none());
        assert!(ask(&client, port, b"FILE data.bin GET START 1000 END 2000").await.is_none());
        match ask(&client, port, b"FILE data.bin GET START 1000 END 1999").await {
            Some(Message::ChunkData { payload, .. }) => assert_eq!(payload.len(), 1000),
            other => panic!("unexpected reply {:?}", other),
        }
        ask(&client, port, b"FILE data.bin CLOSE").await;
        assert_eq!(handle.await.unwrap().unwrap(), 1);

        let rejected: Vec<_> = logger
            .events_for("data.bin")
            .into_iter()
            .filter_map(|e| match e {
                TransferEvent::RangeRejected { range, .. } => Some(range),
                _ => None,
            })
            .collect();
        assert_eq!(rejected, vec![ChunkRange::new(0, 4999), ChunkRange::new(1000, 2000)]);
    }

    #[tokio::test]
    async fn storage_failure_stops_worker() {
        let (tmp, client, port, _logger, handle) = start_worker(b"0123456789", 43300..=43399).await;
        std::fs::remove_file(tmp.path().join("data.bin")).unwrap();

        assert!(ask(&client, port, b"FILE data.bin GET START 0 END 9").await.is_none());
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(TransferError::Storage(_))));
    }

    #[tokio::test]
    async fn idle_worker_releases_port() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("idle.bin"), b"abc").unwrap();
        let storage: Arc<dyn Storage> = Arc::new(DirStorage::new(tmp.path()).unwrap());
        let pool = PortPool::new(43400..=43499);
        let channel = DataChannel::bind("127.0.0.1".parse().unwrap(), &pool).unwrap();
        let session = TransferSession {
            filename: "idle.bin".into(),
            file_size: 3,
            client: "127.0.0.1:9".parse().unwrap(),
            data_port: channel.port(),
        };
        let worker = TransferWorker::new(session, channel, storage, Arc::new(MemoryLogger::new()))
            .with_idle_timeout(Some(Duration::from_millis(50)));

        assert_eq!(pool.in_use(), 1);
        assert_eq!(worker.run().await.unwrap(), 0);
        assert_eq!(pool.in_use(), 0);
    }
}
