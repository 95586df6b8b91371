//! Overlay process: follows the telemetry region and answers the host's
//! commands until it is told to shut down or the host goes quiet.

use anyhow::{Context, Result};
use clap::Parser;
use paddock_command::{CommandRegistry, CommandServer, ServeExit};
use paddock_config::PaddockConfig;
use paddock_events::{CarTelemetry, SessionInfo, TrackInfo};
use paddock_topics::TopicReader;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "overlay")]
#[command(about = "Telemetry overlay child process")]
struct Cli {
    /// TOML config file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Overrides `[command] name`
    #[arg(long)]
    name: Option<String>,

    /// Overrides `[command] port` (0 = auto-assign)
    #[arg(short, long)]
    port: Option<u16>,
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

/// What the widgets would render.
#[derive(Default)]
struct Widgets {
    locked: bool,
    track: Option<String>,
    session: Option<String>,
    last_speed_kph: f32,
    frames: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = PaddockConfig::load_or_default(cli.config.as_deref())?;
    if let Some(name) = cli.name {
        cfg.command.name = name;
    }
    if let Some(port) = cli.port {
        cfg.command.port = port;
    }
    init_tracing(&cfg.log_level);

    let widgets = Arc::new(Mutex::new(Widgets::default()));

    let mut reader = TopicReader::new(cfg.shm.to_shm_config());
    let w = Arc::clone(&widgets);
    reader
        .dispatcher_mut()
        .on_typed(move |t: CarTelemetry| {
            let mut w = w.lock().map_err(|_| anyhow::anyhow!("widget state poisoned"))?;
            w.last_speed_kph = t.speed_kph;
            w.frames += 1;
            if w.frames % 600 == 0 {
                debug!(lap = t.lap, speed_kph = t.speed_kph, gear = t.gear, "telemetry");
            }
            Ok(())
        })?;
    let w = Arc::clone(&widgets);
    reader.dispatcher_mut().on_typed(move |track: TrackInfo| {
        let mut w = w.lock().map_err(|_| anyhow::anyhow!("widget state poisoned"))?;
        if w.track.as_deref() != Some(track.name.as_str()) {
            info!(track = %track.name, length_m = track.length_m, "track changed");
            w.track = Some(track.name);
        }
        Ok(())
    })?;
    let w = Arc::clone(&widgets);
    reader.dispatcher_mut().on_typed(move |session: SessionInfo| {
        let mut w = w.lock().map_err(|_| anyhow::anyhow!("widget state poisoned"))?;
        w.session = Some(session.session_type);
        Ok(())
    })?;
    let mut reader = reader.spawn().context("failed to start telemetry reader")?;

    let mut registry = CommandRegistry::new();
    let w = Arc::clone(&widgets);
    registry.register("lock_widgets", move |args| {
        let locked = args.get("locked").and_then(Value::as_bool).unwrap_or(true);
        let mut w = w.lock().map_err(|_| anyhow::anyhow!("widget state poisoned"))?;
        w.locked = locked;
        Ok(json!({"status": "success", "locked": locked}))
    })?;
    let w = Arc::clone(&widgets);
    registry.register("status", move |_| {
        let w = w.lock().map_err(|_| anyhow::anyhow!("widget state poisoned"))?;
        Ok(json!({
            "status": "success",
            "locked": w.locked,
            "track": w.track,
            "session": w.session,
            "speed_kph": w.last_speed_kph,
            "frames": w.frames,
        }))
    })?;
    let w = Arc::clone(&widgets);
    registry.on_shutdown(move |args| {
        let save = args.get("save_layout").and_then(Value::as_bool).unwrap_or(false);
        let locked = w.lock().map(|w| w.locked).unwrap_or_default();
        if save {
            info!(locked, "layout saved");
        }
        Ok(json!({"status": "success", "message": "shutting down", "layout_saved": save}))
    });
    let host_lost = Arc::new(AtomicBool::new(false));
    let lost = Arc::clone(&host_lost);
    registry.on_missed_heartbeat(move |missed| {
        warn!(missed, "host stopped sending heartbeats");
        lost.store(true, Ordering::Release);
    });

    let server = CommandServer::bind(cfg.command.to_server_config(), registry)?;
    info!(name = %cfg.command.name, endpoint = %server.endpoint(), "overlay ready");
    let server = server.spawn()?;

    while !server.is_finished() && !host_lost.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(50));
    }

    reader.close();
    let stats = reader.stats();
    let exit = server.close()?;
    match exit {
        ServeExit::Shutdown => info!("overlay shut down by host"),
        ServeExit::Terminated => warn!("overlay terminated by host"),
        ServeExit::Stopped => warn!("overlay stopping without host"),
    }
    info!(
        frames = stats.frames.load(Ordering::Relaxed),
        corrupt = stats.corrupt.load(Ordering::Relaxed),
        attaches = stats.attaches.load(Ordering::Relaxed),
        "overlay stopped"
    );
    Ok(())
}
