use std::env;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tokio::sync::mpsc;

use raftkv::backend::memory::MemoryBackend;
use raftkv::backend::sled_backend::SledBackend;
use raftkv::backend::Backend;
use raftkv::cluster::{ClusterState, Member};
use raftkv::lease::LeaseEngine;
use raftkv::raft::apply::ApplyPipeline;
use raftkv::raft::node::{NoopTransport, RaftNode};
use raftkv::raft::proposal::BatchProposer;
use raftkv::raft::readindex::ReadIndexEngine;
use raftkv::raft::waiter::WaiterArena;
use raftkv::watch::WatchEngine;

use raftkv_cli::config::ClusterConfig;
use raftkv_cli::trace;

#[derive(Debug, Parser, PartialEq)]
#[command(version, author, about, disable_help_flag = true)]
pub struct Args {
    #[clap(short, long, help = "debug model")]
    debug: bool,

    #[clap(long, help = "Print help information")]
    help: bool,

    /// Configuration file path, default 'config/kvdb.yaml'
    #[clap(short = 'c', long = "config", default_value = "config/kvdb.yaml")]
    config: String,

    #[clap(long, help = "This node's raft id, overrides the config file")]
    node_id: Option<u64>,

    /// Keep the process in-memory-only; skip opening a `sled` data
    /// directory. Useful for a quick local smoke test.
    #[clap(long)]
    in_memory: bool,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    setup_panic_hooks();

    eprintln!();
    eprintln!("██████╗  █████╗ ███████╗████████╗██╗  ██╗██╗   ██╗");
    eprintln!("██╔══██╗██╔══██╗██╔════╝╚══██╔══╝██║ ██╔╝██║   ██║");
    eprintln!("██████╔╝███████║█████╗     ██║   █████╔╝ ██║   ██║");
    eprintln!("██╔══██╗██╔══██║██╔══╝     ██║   ██╔═██╗ ╚██╗ ██╔╝");
    eprintln!("██║  ██║██║  ██║██║        ██║   ██║  ██╗ ╚████╔╝");
    eprintln!("╚═╝  ╚═╝╚═╝  ╚═╝╚═╝        ╚═╝   ╚═╝  ╚═╝  ╚═══╝  cluster node");
    eprintln!();

    let args = Args::parse();
    if args.debug {
        println!("{:?}", args);
    }

    let log_dir = format!(
        "{}/.raftkv",
        std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
    );
    let _guards = trace::init_logging(&log_dir, &args.log_level).await?;

    if args.help {
        eprintln!("see --help for flags");
        return Ok(());
    }

    let mut cfg = ClusterConfig::load(&args.config);
    if let Some(id) = args.node_id {
        cfg.node_id = id;
    }
    info!("raftkv starting with config: {:?}", &cfg);

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handle = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        shutdown_handle.store(true, Ordering::SeqCst);
    })
    .context("failed to install Ctrl-C handler")?;

    let backend: Arc<dyn Backend> = if args.in_memory {
        Arc::new(MemoryBackend::new())
    } else {
        let dir = cfg.get_data_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating data dir {}", dir.display()))?;
        Arc::new(SledBackend::open(&dir)?)
    };

    let lease_engine = Arc::new(LeaseEngine::new());
    let watch_engine = Arc::new(WatchEngine::new());
    let cluster = Arc::new(std::sync::Mutex::new(ClusterState::new()));
    cluster
        .lock()
        .expect("cluster state poisoned at startup")
        .apply(raftkv::cluster::ConfChange::AddVoter(Member::voter(
            cfg.node_id,
            format!("node-{}", cfg.node_id),
            Vec::new(),
        )));

    let readindex = Arc::new(ReadIndexEngine::new(cfg.is_lease_read_enabled()));
    let (committed_tx, committed_rx) = mpsc::channel(1024);

    let transport = Arc::new(NoopTransport);
    let voters = vec![cfg.node_id];
    let node = RaftNode::with_ticks(
        cfg.node_id,
        voters,
        cfg.get_election_tick(),
        cfg.get_heartbeat_tick(),
        transport,
        readindex.clone(),
        committed_tx,
    )?;

    let waiters = Arc::new(WaiterArena::new());
    ApplyPipeline::spawn(
        backend.clone(),
        lease_engine.clone(),
        watch_engine.clone(),
        cluster.clone(),
        waiters.clone(),
        committed_rx,
    );

    let _proposer = BatchProposer::spawn(node.clone(), waiters.clone());

    info!(
        "raftkv node {} listening (witness={}, single-voter bootstrap)",
        cfg.node_id,
        cfg.is_witness()
    );

    let ticker_node = node.clone();
    let ticker_shutdown = shutdown.clone();
    let ticker = tokio::spawn(async move {
        ticker_node.run(Duration::from_millis(100), ticker_shutdown).await;
    });

    let lease_backend = backend.clone();
    let lease_engine_sweeper = lease_engine.clone();
    let lease_shutdown = shutdown.clone();
    let sweeper = tokio::spawn(async move {
        while !lease_shutdown.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match lease_engine_sweeper.expired(std::time::Instant::now()) {
                Ok(ids) => {
                    for id in ids {
                        if let Err(e) = lease_backend.revoke_lease_keys(id) {
                            log::warn!("failed to revoke keys for expired lease {id}: {e}");
                            continue;
                        }
                        if let Err(e) = lease_engine_sweeper.revoke(id) {
                            log::warn!("failed to remove expired lease {id}: {e}");
                        }
                    }
                }
                Err(e) => log::warn!("lease sweep failed: {e}"),
            }
        }
    });

    while !shutdown.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    info!("shutting down");
    let _ = tokio::join!(ticker, sweeper);

    Ok(())
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();

    if env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);
            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta)
                .expect("human-panic: printing error message to console failed");
        }));
    }
}
