mod config;

use std::sync::Arc;

use tracing::info;

use ferry_transfer::{DirStorage, Dispatcher, TracingLogger};

use crate::config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry_server=info,ferry_transfer=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let port = match args.as_slice() {
        [_, port] => port.parse::<u16>().ok(),
        _ => None,
    };
    let Some(port) = port else {
        eprintln!("Usage: {} <port>", args.first().map_or("ferry-server", String::as_str));
        std::process::exit(1);
    };

    let settings = Settings::from_env(port)?;
    let storage = Arc::new(DirStorage::new(&settings.storage_dir)?);
    let dispatcher = Dispatcher::bind(settings.server, storage, Arc::new(TracingLogger)).await?;
    info!("Ferry server listening on {}", dispatcher.local_addr()?);

    tokio::select! {
        _ = dispatcher.run() => {}
        _ = shutdown_signal() => {}
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            },
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
