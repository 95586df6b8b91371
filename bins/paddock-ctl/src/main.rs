//! Operator CLI: drive a process's command channel, dump the telemetry region
//! or tail a broker topic.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use paddock_broker::Subscriber;
use paddock_command::{Args as CommandArgs, PeerClient};
use paddock_shm::{FrameReader, ShmConfig};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "paddock-ctl")]
#[command(about = "Talk to paddock processes")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Command endpoint, e.g. tcp://127.0.0.1:5601
    #[arg(short, long, conflicts_with = "port")]
    endpoint: Option<String>,

    /// Shorthand for tcp://127.0.0.1:<port>
    #[arg(short, long)]
    port: Option<u16>,

    /// Reply timeout in milliseconds
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,
}

impl Target {
    fn client(&self) -> Result<PeerClient> {
        let timeout = Duration::from_millis(self.timeout_ms);
        match (&self.endpoint, self.port) {
            (Some(endpoint), _) => Ok(PeerClient::new(endpoint, timeout)?),
            (None, Some(port)) => Ok(PeerClient::for_port(port, timeout)),
            (None, None) => bail!("either --endpoint or --port is required"),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send __ping__
    Ping(Target),
    /// Send __heartbeat__
    Heartbeat(Target),
    /// Ask the process to shut down gracefully
    Shutdown {
        #[command(flatten)]
        target: Target,
        /// Shutdown arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Stop the process's command loop immediately
    Terminate(Target),
    /// Send an application command
    Send {
        #[command(flatten)]
        target: Target,
        cmd: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Print telemetry frames from the shared region
    Dump {
        /// Region name or path
        #[arg(long, default_value = paddock_shm::DEFAULT_REGION_NAME)]
        region: String,
        /// Stop after this many frames
        #[arg(short = 'n', long, default_value = "1")]
        count: u64,
        /// Give up after this many milliseconds
        #[arg(long, default_value = "5000")]
        wait_ms: u64,
    },
    /// Print broker messages whose topic starts with PREFIX
    Tail {
        /// Broker xpub endpoint
        #[arg(short, long)]
        endpoint: String,
        #[arg(default_value = "")]
        prefix: String,
        #[arg(short = 'n', long)]
        count: Option<u64>,
    },
}

fn parse_args(raw: &str) -> Result<CommandArgs> {
    match serde_json::from_str(raw).context("--args must be JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--args must be a JSON object, got {other}"),
    }
}

fn print_reply(reply: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(reply)?);
    if reply.get("error").is_some() {
        bail!("request failed");
    }
    Ok(())
}

fn dump(region: String, count: u64, wait: Duration) -> Result<()> {
    let mut reader = FrameReader::new(ShmConfig::new(region).with_poll_interval(Duration::from_millis(5)));
    let deadline = Instant::now() + wait;
    let mut seen = 0;
    while seen < count && Instant::now() < deadline {
        let sleep = reader.tick(&mut |payload: &[u8]| {
            seen += 1;
            match std::str::from_utf8(payload) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("<{} bytes, not UTF-8>", payload.len()),
            }
        });
        std::thread::sleep(sleep);
    }
    if seen < count {
        bail!("saw {seen} of {count} frames before timing out");
    }
    Ok(())
}

fn tail(endpoint: &str, prefix: &str, count: Option<u64>) -> Result<()> {
    let mut sub = Subscriber::connect(endpoint)?;
    sub.subscribe(prefix)?;
    let mut seen = 0;
    while count.is_none_or(|n| seen < n) {
        if let Some(msg) = sub.recv(Duration::from_secs(1))? {
            seen += 1;
            println!("{} {}", msg.topic, String::from_utf8_lossy(&msg.payload));
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    match cli.command {
        Command::Ping(target) => print_reply(&target.client()?.ping()),
        Command::Heartbeat(target) => print_reply(&target.client()?.heartbeat()),
        Command::Shutdown { target, args } => {
            print_reply(&target.client()?.shutdown_child(parse_args(&args)?))
        }
        Command::Terminate(target) => print_reply(&target.client()?.terminate_child()),
        Command::Send { target, cmd, args } => {
            print_reply(&target.client()?.request(&cmd, parse_args(&args)?))
        }
        Command::Dump {
            region,
            count,
            wait_ms,
        } => dump(region, count, Duration::from_millis(wait_ms)),
        Command::Tail {
            endpoint,
            prefix,
            count,
        } => tail(&endpoint, &prefix, count),
    }
}
