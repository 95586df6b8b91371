//! Host process: publishes telemetry ticks to the shared region, serves its
//! own command channel, keeps its overlays alive with heartbeats and,
//! optionally, runs the pub/sub broker.

use anyhow::{Context, Result};
use clap::Parser;
use paddock_broker::{Broker, Publisher};
use paddock_command::{Args as CommandArgs, CommandRegistry, CommandServer, PeerClient};
use paddock_config::{OverlayEntry, PaddockConfig};
use paddock_events::{CarTelemetry, Pedals, SessionInfo, TrackInfo};
use paddock_topics::{TickStatus, TopicWriter};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "receiver")]
#[command(about = "Publishes telemetry to the overlay bus")]
struct Cli {
    /// TOML config file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Ticks published per second
    #[arg(long, default_value = "60")]
    rate: u32,

    /// Stop after this many ticks
    #[arg(long)]
    max_ticks: Option<u64>,
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();
}

/// Synthetic car going round a 7 km lap.
struct Simulator {
    tick: u64,
    lap: u32,
    lap_time_s: f64,
}

impl Simulator {
    const LAP_S: f64 = 105.0;

    fn step(&mut self, dt: f64) -> CarTelemetry {
        self.tick += 1;
        self.lap_time_s += dt;
        if self.lap_time_s >= Self::LAP_S {
            self.lap += 1;
            self.lap_time_s -= Self::LAP_S;
        }
        let phase = (self.lap_time_s / Self::LAP_S * std::f64::consts::TAU).sin() as f32;
        let braking = phase < -0.6;
        CarTelemetry {
            speed_kph: 180.0 + 120.0 * phase,
            rpm: 9_000.0 + 3_000.0 * phase,
            gear: (4.0 + 3.0 * phase).round().clamp(1.0, 8.0) as i8,
            pedals: Pedals {
                throttle: if braking { 0.0 } else { 1.0 },
                brake: if braking { 0.8 } else { 0.0 },
                clutch: 0.0,
            },
            lap: self.lap,
            lap_time_s: self.lap_time_s,
            lap_distance_pct: (self.lap_time_s / Self::LAP_S) as f32,
        }
    }
}

/// Sends `__heartbeat__` to every overlay on `interval` until `stop`.
fn spawn_supervisor(
    overlays: Vec<OverlayEntry>,
    interval: Duration,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("overlay-supervisor".into())
        .spawn(move || {
            let mut peers: Vec<(String, PeerClient)> = overlays
                .into_iter()
                .map(|o| (o.name, PeerClient::for_port(o.port, interval)))
                .collect();
            while !stop.load(Ordering::Acquire) {
                for (name, peer) in &mut peers {
                    let reply = peer.heartbeat();
                    if let Some(err) = reply.get("error") {
                        debug!(overlay = %name, error = %err, "overlay not answering");
                    }
                }
                std::thread::sleep(interval);
            }
            for (name, peer) in &mut peers {
                let reply = peer.shutdown_child(CommandArgs::new());
                info!(overlay = %name, %reply, "overlay shutdown requested");
            }
        })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = PaddockConfig::load_or_default(cli.config.as_deref())?;
    init_tracing(&cfg.log_level);

    let shm = cfg.shm.to_shm_config();
    let mut writer = TopicWriter::create(&shm).context("failed to create telemetry region")?;
    info!(region = %writer.transport().region_path().display(), "telemetry region ready");

    let ticks = Arc::new(AtomicU64::new(0));
    let mut registry = CommandRegistry::new();
    let status_ticks = Arc::clone(&ticks);
    registry.register("status", move |_| {
        Ok(json!({"status": "success", "ticks": status_ticks.load(Ordering::Relaxed)}))
    })?;
    registry.on_shutdown(|args| {
        info!(?args, "shutdown requested over command channel");
        Ok(serde_json::Value::Null)
    });
    let server = CommandServer::bind(cfg.command.to_server_config(), registry)?;
    info!(endpoint = %server.endpoint(), "command channel ready");
    let server = server.spawn()?;

    let mut broker = Broker::new(cfg.broker.to_broker_config());
    let mut publisher = if cfg.broker.enabled {
        broker.start()?;
        let xsub = broker
            .xsub_endpoint()
            .context("broker has no xsub endpoint")?;
        info!(%xsub, xpub = ?broker.xpub_endpoint(), "broker running");
        Some(Publisher::connect(&xsub)?)
    } else {
        None
    };

    let supervisor_stop = Arc::new(AtomicBool::new(false));
    let supervisor = spawn_supervisor(
        cfg.overlays.clone(),
        cfg.command.heartbeat_interval(),
        Arc::clone(&supervisor_stop),
    )?;

    let track = TrackInfo {
        name: "Circuit de Spa-Francorchamps".into(),
        length_m: 7_004.0,
        country: Some("Belgium".into()),
    };
    let period = Duration::from_secs_f64(1.0 / f64::from(cli.rate.max(1)));
    let mut sim = Simulator {
        tick: 0,
        lap: 1,
        lap_time_s: 0.0,
    };
    let mut next = Instant::now();

    while !server.is_finished() && cli.max_ticks.is_none_or(|max| sim.tick < max) {
        let telemetry = sim.step(period.as_secs_f64());
        writer.add_typed(&telemetry);
        if sim.tick % u64::from(cli.rate.max(1)) == 1 {
            writer.add_typed(&track);
            let session = SessionInfo {
                session_type: "Race".into(),
                time_remaining_s: 3_600.0 - sim.tick as f64 * period.as_secs_f64(),
                laps_remaining: None,
            };
            writer.add_typed(&session);
            if let Some(publisher) = publisher.as_mut() {
                if let Err(e) = publisher.publish_json("session", &session) {
                    warn!(error = %e, "broker publish failed");
                }
            }
        }
        match writer.write()? {
            TickStatus::Published { seq, topics } => debug!(seq, topics, "tick published"),
            status => warn!(?status, "tick not published"),
        }
        ticks.fetch_add(1, Ordering::Relaxed);

        next += period;
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        } else {
            next = now;
        }
    }

    info!(ticks = sim.tick, "receiver stopping");
    writer.close();
    supervisor_stop.store(true, Ordering::Release);
    if supervisor.join().is_err() {
        warn!("overlay supervisor panicked");
    }
    broker.close();
    let exit = server.close()?;
    info!(?exit, "receiver stopped");
    Ok(())
}
