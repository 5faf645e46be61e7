use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tower_comms::{AckPolicy, NodeConfig, NodeId, SimulatedMesh, TowerCommsConfig, TowerSession};
use tower_proto::{ConfigData, PingData};

const GCS_NODE: NodeId = 1;

#[derive(Parser, Debug)]
#[command(name = "tower-sim", version, about = "Radio telemetry tower comms tool")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run a ground station and several towers on an in-process mesh.
    Simulate {
        #[arg(long, default_value_t = 3)]
        towers: u32,
        #[arg(long, default_value_t = 3)]
        pings: u32,
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
        #[arg(long, default_value_t = 2000)]
        retry_ms: u64,
        #[arg(long, default_value_t = 3)]
        attempts: u32,
        /// Block the link from this tower to the ground station
        #[arg(long)]
        drop_tower: Option<NodeId>,
    },
    /// Run one node from a TOML config until interrupted.
    Listen {
        #[arg(long)]
        config: PathBuf,
        /// Answer configuration requests with a default configuration
        #[arg(long, default_value_t = false)]
        gcs: bool,
    },
}

#[derive(Default)]
struct AckCounts {
    acked: AtomicUsize,
    failed: AtomicUsize,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let result = match cli.command {
        Command::Simulate {
            towers,
            pings,
            interval_ms,
            retry_ms,
            attempts,
            drop_tower,
        } => {
            let policy = AckPolicy::new(Duration::from_millis(retry_ms), attempts);
            let interval = Duration::from_millis(interval_ms);
            simulate(towers, pings, interval, policy, drop_tower).await
        }
        Command::Listen { config, gcs } => listen(config, gcs).await,
    };
    if let Err(err) = result {
        eprintln!("tower-sim error: {err:#}");
        std::process::exit(1);
    }
}

fn station_config() -> ConfigData {
    ConfigData {
        gain: 56.0,
        sampling_rate: 2_500_000,
        center_frequency: 173_500_000,
        run_num: 1,
        enable_test_data: false,
        ping_width_ms: 25,
        ping_min_snr: 4,
        ping_max_len_mult: 1.5,
        ping_min_len_mult: 0.5,
        target_frequencies: vec![173_043_000, 173_965_000],
    }
}

/// Hands configuration requests to `replies`; the reply itself is sent off
/// the router thread.
fn serve_config_requests(session: &Arc<TowerSession>) {
    let (replies, mut requests) = mpsc::unbounded_channel::<NodeId>();
    session.register_request_config_handler(move |msg| {
        log::info!("gcs: config requested by node {}", msg.header.node_num());
        let _ = replies.send(msg.header.node_num());
        Ok(())
    });
    let session = session.clone();
    tokio::spawn(async move {
        let config = station_config();
        while let Some(requester) = requests.recv().await {
            let reply = session.send_config(&config, Some(requester), true).await;
            if let Err(err) = reply {
                log::warn!("gcs: config reply to node {} failed: {}", requester, err);
            }
        }
    });
}

fn counted_session(
    builder: tower_comms::TowerSessionBuilder,
    counts: &Arc<AckCounts>,
) -> anyhow::Result<TowerSession> {
    let acked = counts.clone();
    let failed = counts.clone();
    let session = builder
        .on_ack_success(move |_| {
            acked.acked.fetch_add(1, Ordering::Relaxed);
        })
        .on_ack_failure(move |id| {
            log::warn!("packet {} was never acknowledged", id);
            failed.failed.fetch_add(1, Ordering::Relaxed);
        })
        .build()?;
    Ok(session)
}

async fn simulate(
    towers: u32,
    pings: u32,
    interval: Duration,
    policy: AckPolicy,
    drop_tower: Option<NodeId>,
) -> anyhow::Result<()> {
    let mesh = SimulatedMesh::new();
    let counts = Arc::new(AckCounts::default());

    let gcs = Arc::new(counted_session(
        TowerSession::builder(NodeConfig::simulated(GCS_NODE, "gcs"))
            .simulated_mesh(mesh.clone())
            .ack_policy(policy),
        &counts,
    )?);
    serve_config_requests(&gcs);
    let heard = Arc::new(AtomicUsize::new(0));
    let counter = heard.clone();
    gcs.register_ping_handler(move |msg| {
        counter.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "gcs: ping from node {} freq={} amp={:.2} at ({:.5}, {:.5})",
            msg.header.node_num(),
            msg.payload.frequency,
            msg.payload.amplitude,
            msg.payload.latitude,
            msg.payload.longitude
        );
        Ok(())
    });
    gcs.register_error_handler(|msg| {
        log::warn!(
            "gcs: node {} reported: {}",
            msg.header.node_num(),
            msg.payload.error_message
        );
        Ok(())
    });
    gcs.start().await.context("starting ground station")?;

    let configured = Arc::new(AtomicUsize::new(0));
    let mut fleet = Vec::new();
    for id in GCS_NODE + 1..=GCS_NODE + towers {
        let session = counted_session(
            TowerSession::builder(NodeConfig::simulated(id, format!("tower-{id}")))
                .simulated_mesh(mesh.clone())
                .ack_policy(policy),
            &counts,
        )?;
        let counter = configured.clone();
        session.register_handler_once::<ConfigData, _>(move |msg| {
            log::info!(
                "tower {}: run {} at {} Hz, {} targets",
                id,
                msg.payload.run_num,
                msg.payload.center_frequency,
                msg.payload.target_frequencies.len()
            );
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        session
            .start()
            .await
            .with_context(|| format!("starting tower {id}"))?;
        fleet.push((id, session));
    }
    if let Some(id) = drop_tower {
        mesh.block_link(id, GCS_NODE);
        log::info!("link {} -> {} blocked", id, GCS_NODE);
    }

    for (_, session) in &fleet {
        session.send_request_config(Some(GCS_NODE), true).await?;
    }

    for round in 0..pings {
        tokio::time::sleep(interval).await;
        for (id, session) in &fleet {
            let ping = PingData {
                frequency: 173_043_000,
                amplitude: 0.5 + round as f32 * 0.1,
                latitude: 32.88 + f64::from(*id) * 1e-3,
                longitude: -117.23,
                altitude: 120.0,
            };
            session.send_ping(&ping, Some(GCS_NODE), true).await?;
        }
    }

    let settle = policy.retry_interval * (policy.max_attempts + 1);
    let deadline = tokio::time::Instant::now() + settle;
    while tokio::time::Instant::now() < deadline {
        let towers_pending: usize = fleet.iter().map(|(_, s)| s.pending_acks()).sum();
        let pending = towers_pending + gcs.pending_acks();
        if pending == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for (_, session) in &fleet {
        session.stop().await;
    }
    gcs.stop().await;

    println!(
        "towers configured: {}/{}  pings heard: {}  acked: {}  failed: {}",
        configured.load(Ordering::Relaxed),
        towers,
        heard.load(Ordering::Relaxed),
        counts.acked.load(Ordering::Relaxed),
        counts.failed.load(Ordering::Relaxed)
    );
    Ok(())
}

async fn listen(path: PathBuf, gcs: bool) -> anyhow::Result<()> {
    let config = TowerCommsConfig::load(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    let counts = Arc::new(AckCounts::default());
    let builder = TowerSession::builder(config.node).ack_policy(config.ack);
    let session = Arc::new(counted_session(builder, &counts)?);

    if gcs {
        serve_config_requests(&session);
    } else {
        session.register_request_config_handler(|msg| {
            log::info!("config request from node {}", msg.header.node_num());
            Ok(())
        });
    }
    session.register_config_handler(|msg| {
        log::info!(
            "config from node {}: {:?}",
            msg.header.node_num(),
            msg.payload
        );
        Ok(())
    });
    session.register_ping_handler(|msg| {
        log::info!(
            "ping from node {}: {:?}",
            msg.header.node_num(),
            msg.payload
        );
        Ok(())
    });
    session.register_error_handler(|msg| {
        log::warn!(
            "error from node {}: {}",
            msg.header.node_num(),
            msg.payload.error_message
        );
        Ok(())
    });

    session.start().await.context("starting session")?;
    log::info!(
        "listening as node {:?} ({:?}), neighbors {:?}, position {:?}",
        session.node_id(),
        session.user_id(),
        session.neighbors(),
        session.node_position()
    );

    tokio::signal::ctrl_c().await?;
    session.stop().await;
    log::info!(
        "stopped: acked {} failed {}",
        counts.acked.load(Ordering::Relaxed),
        counts.failed.load(Ordering::Relaxed)
    );
    Ok(())
}
