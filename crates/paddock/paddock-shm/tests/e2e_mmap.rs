//! End-to-end two-process integration test for the frame region.
//!
//! # Overview
//!
//! The same test executable is spawned twice with a role in the environment:
//! a writer that publishes a numbered frame every few hundred microseconds and
//! a reader that follows the region with the managed polling loop.
//!
//! ```text
//! [Writer]  ----[create]----[write frame 0..N]----[write "done"]
//!                  |              |    |    |
//!                  v              v    v    v
//!             [region file]   (latest frame wins)
//!                  |              ^         ^
//! [Reader]  --[retry attach]---[frames...]--[done]
//! ```
//!
//! The reader is not expected to see every frame. It checks that what it sees
//! is never torn (CRC always holds), is strictly increasing, and ends with the
//! final frame.
//!
//! # Running the Test
//!
//! ```bash
//! cargo test -p paddock-shm --test e2e_mmap -- --nocapture
//! ```

use std::env;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Writes to stderr with immediate flush to bypass test output capture.
macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

const ENV_ROLE: &str = "PADDOCK_E2E_ROLE";
const ENV_PATH: &str = "PADDOCK_E2E_PATH";
const ROLE_WRITER: &str = "writer";
const ROLE_READER: &str = "reader";

const FRAME_COUNT: u64 = 20_000;
const MAX_MSG_SIZE: usize = 4096;
const WRITER_DELAY_US: u64 = 50;

fn test_path() -> String {
    let pid = std::process::id();
    env::temp_dir()
        .join(format!("paddock_e2e_region_{pid}"))
        .to_string_lossy()
        .into_owned()
}

fn config(path: &str) -> paddock_shm::ShmConfig {
    paddock_shm::ShmConfig::new(path)
        .with_max_msg_size(MAX_MSG_SIZE)
        .with_poll_interval(Duration::from_micros(200))
        .with_retry_interval(Duration::from_millis(1))
}

/// Frames are padded so each copy spans many cache lines; a torn read would
/// show up as a CRC failure.
fn frame_for(i: u64) -> Vec<u8> {
    let mut body = format!("frame:{i}:").into_bytes();
    body.resize(2048, (i % 251) as u8);
    body
}

fn run_writer(path: &str) {
    use paddock_shm::FrameWriter;

    log!("[WRITER] creating region at {path}");
    let mut writer = FrameWriter::create(&config(path)).expect("writer: failed to create region");

    let start = Instant::now();
    for i in 0..FRAME_COUNT {
        writer.write(&frame_for(i)).expect("writer: write failed");
        std::thread::sleep(Duration::from_micros(WRITER_DELAY_US));
    }
    // Keep re-publishing the final marker so a slow reader cannot miss it.
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        writer.write(b"done").expect("writer: write failed");
        std::thread::sleep(Duration::from_millis(5));
    }
    log!("[WRITER] published {FRAME_COUNT} frames in {:?}", start.elapsed());
}

fn run_reader(path: &str) {
    use paddock_shm::FrameReader;

    let mut reader = FrameReader::new(config(path));
    let stop = reader.stop_flag();
    let stats = reader.stats();

    let mut last_index: Option<u64> = None;
    let mut frames = 0u64;
    let mut saw_done = false;
    let deadline = Instant::now() + Duration::from_secs(20);

    reader.run(|payload| {
        if payload == b"done" {
            saw_done = true;
            stop.stop();
            return;
        }
        let text = String::from_utf8_lossy(&payload[..payload.len().min(32)]);
        let index: u64 = text
            .split(':')
            .nth(1)
            .and_then(|s| s.parse().ok())
            .expect("reader: malformed frame");
        assert_eq!(payload, frame_for(index).as_slice(), "reader: frame body mismatch");
        if let Some(prev) = last_index {
            assert!(index > prev, "reader: went backwards {prev} -> {index}");
        }
        last_index = Some(index);
        frames += 1;
        if Instant::now() > deadline {
            stop.stop();
        }
    });

    let corrupt = stats.corrupt.load(std::sync::atomic::Ordering::Relaxed);
    log!("[READER] frames: {frames}, corrupt: {corrupt}, last: {last_index:?}");
    assert!(saw_done, "reader never saw the final frame");
    assert!(frames > 0, "reader did not receive any frames");
    assert_eq!(corrupt, 0, "reader observed torn frames");
}

#[test]
fn e2e_two_process_frame_region() {
    if let Ok(role) = env::var(ENV_ROLE) {
        let path = env::var(ENV_PATH).expect("PADDOCK_E2E_PATH not set");
        match role.as_str() {
            ROLE_WRITER => run_writer(&path),
            ROLE_READER => run_reader(&path),
            other => panic!("Unknown role: {other}"),
        }
        return;
    }

    let path = test_path();
    let exe = env::current_exe().expect("Failed to get current executable path");

    // Reader first: it must wait for the region to appear.
    let spawn = |role: &str| {
        Command::new(&exe)
            .arg("--exact")
            .arg("e2e_two_process_frame_region")
            .env(ENV_ROLE, role)
            .env(ENV_PATH, &path)
            .stderr(Stdio::inherit())
            .spawn()
            .expect("Failed to spawn child process")
    };
    let mut reader_proc = spawn(ROLE_READER);
    std::thread::sleep(Duration::from_millis(20));
    let mut writer_proc = spawn(ROLE_WRITER);

    let writer_status = writer_proc.wait().expect("Failed to wait for writer");
    let reader_status = reader_proc.wait().expect("Failed to wait for reader");

    let _ = std::fs::remove_file(&path);

    assert!(writer_status.success(), "Writer process failed: {writer_status}");
    assert!(reader_status.success(), "Reader process failed: {reader_status}");
}
