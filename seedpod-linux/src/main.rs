// SeedPod Linux daemon: disk store, HTTP package server and sync engine.

mod config;
mod peers;
mod server;
mod storage;
mod transport;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use seedpod_core::{SyncEngine, DEFAULT_SEGMENT_LENGTH};
use tracing_subscriber::EnvFilter;

use crate::peers::StaticPeers;
use crate::storage::{DiskStorage, PackageMeta};
use crate::transport::HttpTransport;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("seedpod-linux {}", VERSION);
        return Ok(());
    }

    init_tracing();
    let cfg = config::load()?;
    let rt = tokio::runtime::Runtime::new()?;
    match args.first().map(String::as_str) {
        Some("add") => {
            let file = args.get(1).context("usage: seedpod-linux add <file>")?;
            rt.block_on(add_file(&cfg, Path::new(file)))
        }
        Some("want") => {
            let meta = args.get(1).context("usage: seedpod-linux want <meta file>")?;
            rt.block_on(want(&cfg, Path::new(meta)))
        }
        Some(other) => anyhow::bail!("unknown command {other:?}"),
        None => rt.block_on(run(cfg)),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("SEEDPOD_LOG"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();
}

/// Import a complete file and print its package id and the meta file to hand to other nodes.
async fn add_file(cfg: &config::Config, file: &Path) -> anyhow::Result<()> {
    let store = DiskStorage::new(&cfg.data_dir);
    let meta = store
        .import_file(file, DEFAULT_SEGMENT_LENGTH)
        .await
        .with_context(|| format!("importing {}", file.display()))?;
    println!("{}", meta.id());
    println!("{}", store.meta_path(&meta.id()).display());
    Ok(())
}

/// Create a download target from a meta file copied from another node.
async fn want(cfg: &config::Config, meta_path: &Path) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(meta_path)
        .await
        .with_context(|| format!("reading {}", meta_path.display()))?;
    let meta = PackageMeta::decode(&bytes).context("decoding package meta")?;
    let store = DiskStorage::new(&cfg.data_dir);
    let id = store.add_target(meta).await?;
    println!("{id}");
    Ok(())
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let storage = Arc::new(DiskStorage::new(&cfg.data_dir));
    let transport = Arc::new(
        HttpTransport::new(cfg.request_timeout()).context("building http client")?,
    );
    let peers = StaticPeers::from_config(&cfg.peers);
    if peers.is_empty() {
        tracing::warn!("no peers configured; serving only");
    }
    let engine = SyncEngine::start(
        cfg.engine.clone(),
        transport,
        storage.clone(),
        Arc::new(peers),
    );

    for pkg in storage.load_all().await? {
        let res = match pkg.bitmap {
            None => engine.register_downloaded(pkg.id, pkg.split),
            Some(bitmap) => engine.start_download(pkg.id, pkg.split, Some(bitmap)),
        };
        if let Err(e) = res {
            tracing::warn!(package = %pkg.id.short(), error = %e, "skipping stored package");
        }
    }

    let addr = cfg.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, data_dir = %cfg.data_dir.display(), "serving packages");
    let server_task = tokio::spawn(server::serve(listener, engine.server().clone()));

    tokio::select! {
        res = server_task => match res {
            Ok(Err(e)) => tracing::error!(error = %e, "package server stopped"),
            Ok(Ok(())) => {}
            Err(e) => tracing::error!(error = %e, "package server panicked"),
        },
        res = shutdown_signal() => res?,
    }
    engine.shutdown().await;
    tracing::info!("shut down");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
