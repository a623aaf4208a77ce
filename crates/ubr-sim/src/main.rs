//! UBR bridge simulator
//!
//! Builds a bridge from a TOML topology, enslaves in-memory devices, runs
//! one traffic worker per port while the ageing task runs and an optional
//! churn task deletes and re-adds a port, then prints a JSON report.

mod topology;
mod traffic;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use topology::SimConfig;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use traffic::{PortTraffic, WorkerReport};
use ubr_bridge::{
    Bridge, ControlRequest, CountersSnapshot, MacAddress, MemoryDevice, MemoryRegistry,
    MemoryStack,
};

/// Runs synthetic traffic through a UBR bridge
#[derive(Parser, Debug)]
#[command(name = "ubr-sim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Simulator configuration file (TOML)
    #[arg(short = 'c', long, default_value = "ubr-sim.toml")]
    config: PathBuf,

    /// Log level; overrides RUST_LOG
    #[arg(short = 'l', long, value_enum)]
    log_level: Option<LogLevel>,

    /// Frames per port; overrides the config file
    #[arg(short = 'n', long)]
    frames: Option<u64>,

    /// Port to delete and re-add while traffic runs; overrides the config file
    #[arg(long)]
    churn: Option<String>,

    /// Print the report as a single line
    #[arg(long)]
    compact: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    elapsed_ms: u128,
    churn_cycles: u64,
    fdb_entries: usize,
    counters: CountersSnapshot,
    workers: Vec<WorkerReport>,
    device_tx: BTreeMap<String, u64>,
    local_delivered: u64,
}

fn init_logging(level: Option<LogLevel>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .compact()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set logger: {e}"))
}

fn device_mac(ordinal: usize) -> MacAddress {
    let [hi, lo] = u16::try_from(ordinal).unwrap_or(u16::MAX).to_be_bytes();
    MacAddress::new([0x02, 0xaa, 0x00, 0x00, hi, lo])
}

/// Deletes and re-adds `port` every `interval` until `stop` is set.
async fn churn(
    bridge: Arc<Bridge>,
    config: Arc<SimConfig>,
    port: String,
    interval: Duration,
    stop: Arc<AtomicBool>,
) -> u64 {
    let mut cycles = 0;
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    while !stop.load(Ordering::Relaxed) {
        ticker.tick().await;
        let mut requests = vec![
            ControlRequest::PortDel {
                device: port.clone(),
            },
            ControlRequest::PortAdd {
                device: port.clone(),
                defaults: Default::default(),
            },
        ];
        requests.extend(config.topology.port_requests(&port));
        for request in requests {
            if let Err(e) = bridge.handle(request) {
                warn!(port = %port, error = %e, "churn request failed");
            }
        }
        cycles += 1;
    }
    info!(port = %port, cycles, "churn stopped");
    cycles
}

async fn run(args: Args) -> Result<Report> {
    let mut config = SimConfig::load_or_default(&args.config)?;
    if let Some(frames) = args.frames {
        config.traffic.frames_per_port = frames;
    }
    if args.churn.is_some() {
        config.traffic.churn_port = args.churn.clone();
    }
    config.validate()?;
    let config = Arc::new(config);

    let stack = Arc::new(MemoryStack::new());
    let registry = Arc::new(MemoryRegistry::new());
    let mut devices = Vec::new();
    for (ordinal, name) in config.topology.ports.iter().enumerate() {
        let dev = Arc::new(MemoryDevice::ethernet(name.clone(), device_mac(ordinal + 1)).counting());
        registry.register(dev.clone());
        devices.push(dev);
    }

    let bridge = Arc::new(
        Bridge::new(config.bridge.clone(), stack.clone(), registry.clone())
            .context("creating bridge")?,
    );
    for request in config.topology.requests() {
        bridge
            .handle(request.clone())
            .with_context(|| format!("applying {request:?}"))?;
    }
    bridge.start_ageing()?;
    info!(
        bridge = bridge.name(),
        ports = config.topology.ports.len(),
        vlans = config.topology.vlans.len(),
        "topology applied"
    );

    let stop = Arc::new(AtomicBool::new(false));
    let started = Instant::now();

    let churn_task = config.traffic.churn_port.clone().map(|port| {
        tokio::spawn(churn(
            bridge.clone(),
            config.clone(),
            port,
            Duration::from_millis(config.traffic.churn_interval_ms),
            stop.clone(),
        ))
    });

    let peers = vec![config.traffic.stations_per_port; config.topology.ports.len()];
    let mut workers = JoinSet::new();
    for (ordinal, port) in config.topology.ports.iter().enumerate() {
        let traffic = PortTraffic {
            port: port.clone(),
            ordinal: u16::try_from(ordinal).context("too many ports")?,
            frames: config.traffic.frames_per_port,
            stations: config.traffic.stations_per_port,
            peers: peers.clone(),
            tagged_vlans: config.topology.tagged_vlans(port),
            broadcast_percent: config.traffic.broadcast_percent,
            seed: config.traffic.seed,
        };
        let bridge = bridge.clone();
        let stop = stop.clone();
        workers.spawn_blocking(move || traffic::run_port(bridge, traffic, stop));
    }

    let mut reports = Vec::new();
    loop {
        tokio::select! {
            joined = workers.join_next() => match joined {
                Some(Ok(report)) => reports.push(report),
                Some(Err(e)) => error!(error = %e, "traffic worker failed"),
                None => break,
            },
            Ok(()) = tokio::signal::ctrl_c() => {
                warn!("interrupted, stopping traffic");
                stop.store(true, Ordering::Relaxed);
            }
        }
    }
    stop.store(true, Ordering::Relaxed);
    let elapsed = started.elapsed();

    let churn_cycles = match churn_task {
        Some(task) => task.await.context("churn task")?,
        None => 0,
    };
    reports.sort_by(|a, b| a.port.cmp(&b.port));

    let fdb_entries = bridge.fdb().len();
    let counters = bridge.counters();
    bridge.shutdown().await;

    Ok(Report {
        elapsed_ms: elapsed.as_millis(),
        churn_cycles,
        fdb_entries,
        counters,
        workers: reports,
        device_tx: devices
            .iter()
            .map(|d| (ubr_bridge::NetDevice::name(d.as_ref()).to_string(), d.tx_frames()))
            .collect(),
        local_delivered: stack.count(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level)?;

    info!(config = %args.config.display(), "ubr-sim starting");
    let compact = args.compact;
    let report = run(args).await?;

    let json = if compact {
        serde_json::to_string(&report)?
    } else {
        serde_json::to_string_pretty(&report)?
    };
    println!("{json}");
    info!(
        frames = report.counters.rx_frames,
        elapsed_ms = report.elapsed_ms,
        "ubr-sim finished"
    );
    Ok(())
}
