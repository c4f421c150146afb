mod config;

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use ferry_transfer::{Client, ClientConfig, DirStorage, TracingLogger};

use crate::config::{Settings, parse_file_list, pick_server_addr};

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry_client=info,ferry_transfer=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let (host, port, list_path) = match args.as_slice() {
        [_, host, port, list] => match port.parse::<u16>() {
            Ok(port) => (host.as_str(), port, list.as_str()),
            Err(_) => usage(&args),
        },
        _ => usage(&args),
    };

    let resolved = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve {host}"))?;
    let server: SocketAddr =
        pick_server_addr(resolved).with_context(|| format!("{host} has no address"))?;

    let names = match std::fs::read_to_string(list_path) {
        Ok(text) => parse_file_list(&text),
        Err(e) => {
            eprintln!("Cannot read file list {list_path}: {e}");
            std::process::exit(1);
        }
    };

    let settings = Settings::from_env()?;
    let storage = Arc::new(DirStorage::new(&settings.output_dir)?);
    let mut config = ClientConfig::new(server);
    config.retry = settings.retry;
    let mut client = Client::new(config, storage, Arc::new(TracingLogger))?;
    info!("Downloading {} file(s) from {}", names.len(), server);

    let mut failed = 0;
    for (name, result) in client.download_all(&names) {
        match result {
            Ok(outcome) => println!(
                "{name}: ok {} bytes in {} chunks sha256={}",
                outcome.bytes, outcome.chunks, outcome.sha256
            ),
            Err(e) => {
                failed += 1;
                println!("{name}: failed: {e}");
            }
        }
    }
    info!("{} downloaded, {} failed", names.len() - failed, failed);

    Ok(())
}

fn usage(args: &[String]) -> ! {
    let program = args.first().map_or("ferry-client", String::as_str);
    eprintln!("Usage: {program} <hostname> <port> <file-list>");
    std::process::exit(1);
}
