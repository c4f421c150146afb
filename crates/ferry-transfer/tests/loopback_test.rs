use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ferry_transfer::{
    CHUNK_SIZE, Client, ClientConfig, DirStorage, Dispatcher, Message, NullLogger, RetryPolicy,
    ServerConfig, Storage, TracingLogger, TransferError,
};
use sha2::{Digest, Sha256};

fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry_transfer=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Start a dispatcher over a temp dir holding `files`.
async fn start_server(
    data_ports: RangeInclusive<u16>,
    files: &[(&str, &Vec<u8>)],
) -> (tempfile::TempDir, SocketAddr) {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    for (name, data) in files {
        std::fs::write(tmp.path().join(name), data).unwrap();
    }

    let storage = Arc::new(DirStorage::new(tmp.path()).unwrap());
    let addr = serve_storage(data_ports, storage).await;
    (tmp, addr)
}

async fn serve_storage(data_ports: RangeInclusive<u16>, storage: Arc<dyn Storage>) -> SocketAddr {
    let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
    config.data_ports = data_ports;
    let dispatcher = Dispatcher::bind(config, storage, Arc::new(TracingLogger))
        .await
        .unwrap();
    let addr = dispatcher.local_addr().unwrap();
    tokio::spawn(dispatcher.run());
    addr
}

/// Serves one file whose reads fail past the first chunk.
struct FirstChunkOnly {
    inner: DirStorage,
    name: &'static str,
}

impl Storage for FirstChunkOnly {
    fn exists(&self, name: &str) -> bool {
        self.inner.exists(name)
    }

    fn size(&self, name: &str) -> io::Result<u64> {
        self.inner.size(name)
    }

    fn read(&self, name: &str, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        if name == self.name && offset >= CHUNK_SIZE {
            return Err(io::Error::other("disk went away"));
        }
        self.inner.read(name, offset, len)
    }

    fn create(&self, name: &str, size: u64) -> io::Result<()> {
        self.inner.create(name, size)
    }

    fn write(&self, name: &str, offset: u64, data: &[u8]) -> io::Result<()> {
        self.inner.write(name, offset, data)
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        self.inner.remove(name)
    }
}

fn new_client(server: SocketAddr, dir: &Path, retry: RetryPolicy) -> Client {
    let mut config = ClientConfig::new(server);
    config.retry = retry;
    config.local_addr = Some("127.0.0.1:0".parse().unwrap());
    let storage = Arc::new(DirStorage::new(dir).unwrap());
    Client::new(config, storage, Arc::new(NullLogger)).unwrap()
}

fn quick_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(250), 3)
}

/// Run a blocking download off the runtime threads.
async fn download(
    server: SocketAddr,
    dir: PathBuf,
    name: &'static str,
) -> ferry_transfer::Result<ferry_transfer::DownloadOutcome> {
    tokio::task::spawn_blocking(move || new_client(server, &dir, quick_retry()).download(name))
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn files_arrive_byte_for_byte() {
    let empty = content(0, 1);
    let exact = content(1000, 2);
    let tail = content(2500, 3);
    let (_srv, server) = start_server(
        44000..=44099,
        &[("empty.bin", &empty), ("exact.bin", &exact), ("tail.bin", &tail)],
    )
    .await;
    let out = tempfile::tempdir().unwrap();

    for (name, data, chunks) in [
        ("empty.bin", &empty, 0),
        ("exact.bin", &exact, 1),
        ("tail.bin", &tail, 3),
    ] {
        let outcome = download(server, out.path().to_path_buf(), name).await.unwrap();
        assert_eq!(outcome.bytes, data.len() as u64, "{name}");
        assert_eq!(outcome.chunks, chunks, "{name}");
        assert!(outcome.close_confirmed, "{name}");
        assert_eq!(outcome.sha256, hex::encode(Sha256::digest(data)), "{name}");
        assert_eq!(&std::fs::read(out.path().join(name)).unwrap(), data, "{name}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_file_leaves_no_local_file() {
    let (_srv, server) = start_server(44100..=44199, &[]).await;
    let out = tempfile::tempdir().unwrap();

    let err = download(server, out.path().to_path_buf(), "ghost.txt").await.unwrap_err();
    assert!(matches!(err, TransferError::NotFound(ref name) if name == "ghost.txt"));
    assert!(!out.path().join("ghost.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_downloads_do_not_interfere() {
    let a = content(7300, 10);
    let b = content(4100, 20);
    let (_srv, server) = start_server(44200..=44299, &[("a.bin", &a), ("b.bin", &b)]).await;
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();

    let (ra, rb) = tokio::join!(
        download(server, out_a.path().to_path_buf(), "a.bin"),
        download(server, out_b.path().to_path_buf(), "b.bin"),
    );
    assert_eq!(ra.unwrap().bytes, 7300);
    assert_eq!(rb.unwrap().bytes, 4100);
    assert_eq!(std::fs::read(out_a.path().join("a.bin")).unwrap(), a);
    assert_eq!(std::fs::read(out_b.path().join("b.bin")).unwrap(), b);
}

#[tokio::test(flavor = "multi_thread")]
async fn out_of_range_request_gets_no_answer() {
    let data = content(1500, 5);
    let (_srv, server) = start_server(44300..=44399, &[("r.bin", &data)]).await;

    let answers = tokio::task::spawn_blocking(move || {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
        let mut buf = vec![0u8; 65535];

        socket.send_to(b"DOWNLOAD r.bin", server).unwrap();
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        let port = match Message::decode(&buf[..len]).unwrap() {
            Message::DownloadOk { port, .. } => port,
            other => panic!("unexpected handshake reply {:?}", other),
        };
        let data_addr = SocketAddr::new(server.ip(), port);

        let mut ask = |request: &[u8]| {
            socket.send_to(request, data_addr).unwrap();
            socket
                .recv_from(&mut buf)
                .ok()
                .map(|(len, _)| Message::decode(&buf[..len]).unwrap())
        };
        let past_end = ask(b"FILE r.bin GET START 1000 END 1500");
        let inverted = ask(b"FILE r.bin GET START 10 END 5");
        let valid = ask(b"FILE r.bin GET START 1000 END 1499");
        let closed = ask(b"FILE r.bin CLOSE");
        (past_end, inverted, valid, closed)
    })
    .await
    .unwrap();

    assert!(answers.0.is_none());
    assert!(answers.1.is_none());
    match answers.2 {
        Some(Message::ChunkData { payload, .. }) => assert_eq!(payload, &data[1000..]),
        other => panic!("unexpected chunk reply {:?}", other),
    }
    assert_eq!(answers.3, Some(Message::CloseOk { filename: "r.bin".into() }));
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_server_exhausts_retries() {
    // Bound but never read, so nothing ever answers.
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let server = silent.local_addr().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dir = out.path().to_path_buf();

    let err = tokio::task::spawn_blocking(move || {
        new_client(server, &dir, RetryPolicy::new(Duration::from_millis(30), 3)).download("x.bin")
    })
    .await
    .unwrap()
    .unwrap_err();

    assert!(matches!(err, TransferError::Timeout { attempts: 3 }));
    assert!(!out.path().join("x.bin").exists());
    drop(silent);
}

#[tokio::test(flavor = "multi_thread")]
async fn file_list_continues_after_failure() {
    let one = content(10, 1);
    let two = content(1999, 2);
    let (_srv, server) = start_server(44400..=44499, &[("one.bin", &one), ("two.bin", &two)]).await;
    let out = tempfile::tempdir().unwrap();
    let dir = out.path().to_path_buf();

    let results = tokio::task::spawn_blocking(move || {
        new_client(server, &dir, quick_retry()).download_all(["one.bin", "absent.bin", "two.bin"])
    })
    .await
    .unwrap();

    let names: Vec<&str> = results.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["one.bin", "absent.bin", "two.bin"]);
    assert!(results[0].1.is_ok());
    assert!(matches!(results[1].1, Err(TransferError::NotFound(_))));
    assert!(results[2].1.is_ok());
    assert_eq!(std::fs::read(out.path().join("one.bin")).unwrap(), one);
    assert_eq!(std::fs::read(out.path().join("two.bin")).unwrap(), two);
    assert!(!out.path().join("absent.bin").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn file_list_continues_after_timeout() {
    init_tracing();
    let stuck = content(3000, 7);
    let fine = content(1200, 8);
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("stuck.bin"), &stuck).unwrap();
    std::fs::write(src.path().join("fine.bin"), &fine).unwrap();
    let storage = Arc::new(FirstChunkOnly {
        inner: DirStorage::new(src.path()).unwrap(),
        name: "stuck.bin",
    });
    let server = serve_storage(44500..=44599, storage).await;
    let out = tempfile::tempdir().unwrap();
    let dir = out.path().to_path_buf();

    let results = tokio::task::spawn_blocking(move || {
        new_client(server, &dir, RetryPolicy::new(Duration::from_millis(50), 3))
            .download_all(["stuck.bin", "fine.bin"])
    })
    .await
    .unwrap();

    assert!(matches!(results[0].1, Err(TransferError::Timeout { attempts: 3 })));
    assert!(!out.path().join("stuck.bin").exists());
    let outcome = results[1].1.as_ref().unwrap();
    assert_eq!(outcome.bytes, 1200);
    assert_eq!(std::fs::read(out.path().join("fine.bin")).unwrap(), fine);
}
