//! One-shot latency report: frame writes and reads by payload size, a full
//! topic tick, and a command round trip. Prints JSON to stdout.

use anyhow::{Context, Result};
use paddock_command::{CommandRegistry, CommandServer, PeerClient, ServerConfig};
use paddock_perf::{LatencyStats, payload, sample_latency, sample_telemetry, temp_region_name};
use paddock_shm::{FrameWriter, ReadOutcome, RegionReader, ShmConfig, remove_region};
use paddock_topics::TopicWriter;
use std::time::{Duration, Instant};

const ITERS: usize = 20_000;
const WARMUP: usize = 1_000;

fn frame_results(out: &mut Vec<LatencyStats>) -> Result<()> {
    let cfg = ShmConfig::new(temp_region_name("report_frames")).with_max_msg_size(64 * 1024);
    let mut writer = FrameWriter::create(&cfg)?;
    let mut reader = RegionReader::open(&cfg.name)?;

    for size in [64usize, 1024, 16 * 1024, 64 * 1024] {
        let body = payload(size);
        let mut failed = None;
        let writes = sample_latency(ITERS, WARMUP, || {
            if let Err(e) = writer.write(&body) {
                failed.get_or_insert(e);
            }
        });
        if let Some(e) = failed {
            return Err(e).context("frame write failed");
        }
        out.extend(LatencyStats::from_samples(&format!("frame_write_{size}"), writes));

        let mut reads = Vec::with_capacity(ITERS);
        for _ in 0..ITERS {
            writer.write(&body)?;
            let start = Instant::now();
            let outcome = reader.try_read()?;
            reads.push((start.elapsed().as_nanos() as u64).max(1));
            if !matches!(outcome, ReadOutcome::Frame(_)) {
                anyhow::bail!("expected a fresh frame, got {outcome:?}");
            }
        }
        out.extend(LatencyStats::from_samples(&format!("frame_read_{size}"), reads));
    }

    drop(writer);
    let _ = remove_region(&cfg.name);
    Ok(())
}

fn topic_results(out: &mut Vec<LatencyStats>) -> Result<()> {
    let cfg = ShmConfig::new(temp_region_name("report_topics"));
    let mut writer = TopicWriter::create(&cfg)?;
    let mut tick = 0u32;
    let samples = sample_latency(ITERS, WARMUP, || {
        tick += 1;
        writer.add_typed(&sample_telemetry(tick));
        let _ = writer.write();
    });
    out.extend(LatencyStats::from_samples("topic_tick", samples));
    drop(writer);
    let _ = remove_region(&cfg.name);
    Ok(())
}

fn command_results(out: &mut Vec<LatencyStats>) -> Result<()> {
    let handle = CommandServer::bind(ServerConfig::new("perf"), CommandRegistry::new())?.spawn()?;
    let mut client = PeerClient::for_port(handle.local_addr().port(), Duration::from_secs(1));
    let samples = sample_latency(ITERS / 10, WARMUP / 10, || {
        let _ = client.ping();
    });
    out.extend(LatencyStats::from_samples("command_ping", samples));
    handle.close()?;
    Ok(())
}

fn main() -> Result<()> {
    let mut results = Vec::new();
    frame_results(&mut results)?;
    topic_results(&mut results)?;
    command_results(&mut results)?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
