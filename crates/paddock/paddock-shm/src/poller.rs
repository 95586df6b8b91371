//! Polling loop that follows a region across writer crashes and restarts.
//!
//! ```text
//!   Unattached ──(region found)──▶ Attached ──(stop)──▶ Stopped
//!       ▲                            │
//!       └────(region error: Lost)────┘
//! ```
//!
//! The loop only sleeps between iterations; `stop()` is observed at the next
//! iteration boundary and never interrupts a copy in flight.

use crate::config::ShmConfig;
use crate::reader::{ReadOutcome, RegionReader};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often an attached reader checks that the backing file is still the one
/// it mapped.
const IDENTITY_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Counters published by a running reader loop.
#[derive(Debug, Default)]
pub struct ReaderStats {
    pub frames: AtomicU64,
    pub corrupt: AtomicU64,
    pub attaches: AtomicU64,
}

/// Cross-thread stop signal for a reader loop.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Where the loop currently is in its state machine.
enum Link {
    Unattached,
    Attached {
        reader: RegionReader,
        next_identity_check: Instant,
    },
}

/// Follows the latest committed frame of one region.
///
/// Delivery is latest-frame-wins: frames committed between two polls are
/// skipped, only the newest is handed to the callback.
pub struct FrameReader {
    cfg: ShmConfig,
    link: Link,
    stop: StopFlag,
    stats: Arc<ReaderStats>,
}

impl FrameReader {
    pub fn new(cfg: ShmConfig) -> Self {
        Self {
            cfg,
            link: Link::Unattached,
            stop: StopFlag::new(),
            stats: Arc::new(ReaderStats::default()),
        }
    }

    /// A handle that stops this reader from any thread.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn stats(&self) -> Arc<ReaderStats> {
        Arc::clone(&self.stats)
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.link, Link::Attached { .. })
    }

    /// Runs one iteration and returns how long to sleep before the next.
    pub fn tick<F: FnMut(&[u8])>(&mut self, on_payload: &mut F) -> Duration {
        if let Link::Unattached = self.link {
            match RegionReader::open(&self.cfg.name) {
                Ok(reader) => {
                    info!(region = %self.cfg.name, max_msg_size = reader.max_msg_size(), "attached to frame region");
                    self.stats.attaches.fetch_add(1, Ordering::Relaxed);
                    self.link = Link::Attached {
                        reader,
                        next_identity_check: Instant::now() + IDENTITY_CHECK_INTERVAL,
                    };
                }
                Err(e) => {
                    debug!(region = %self.cfg.name, error = %e, "frame region not available");
                    return self.cfg.retry_interval;
                }
            }
        }

        let Link::Attached {
            reader,
            next_identity_check,
        } = &mut self.link
        else {
            return self.cfg.retry_interval;
        };

        let outcome = if Instant::now() >= *next_identity_check {
            *next_identity_check = Instant::now() + IDENTITY_CHECK_INTERVAL;
            if reader.is_replaced() {
                Err(crate::ShmError::RegionChanged)
            } else {
                reader.try_read()
            }
        } else {
            reader.try_read()
        };

        match outcome {
            Ok(ReadOutcome::Unchanged) => {}
            Ok(ReadOutcome::Frame(frame)) => {
                self.stats.frames.fetch_add(1, Ordering::Relaxed);
                on_payload(&frame.payload);
            }
            Ok(ReadOutcome::Corrupt {
                seq,
                expected_crc,
                actual_crc,
            }) => {
                self.stats.corrupt.fetch_add(1, Ordering::Relaxed);
                warn!(
                    region = %self.cfg.name,
                    seq,
                    expected_crc,
                    actual_crc,
                    "dropping frame with bad checksum"
                );
            }
            Err(e) => {
                warn!(region = %self.cfg.name, error = %e, "lost frame region, reattaching");
                self.link = Link::Unattached;
                return Duration::ZERO;
            }
        }
        self.cfg.poll_interval
    }

    /// Blocks the calling thread until [`stop`](Self::stop) is called.
    pub fn run<F: FnMut(&[u8])>(&mut self, mut on_payload: F) {
        info!(region = %self.cfg.name, "frame reader started");
        while !self.stop.is_stopped() {
            let pause = self.tick(&mut on_payload);
            if !pause.is_zero() {
                std::thread::sleep(pause);
            }
        }
        self.link = Link::Unattached;
        info!(region = %self.cfg.name, "frame reader stopped");
    }

    /// Runs the loop as a task; suspends only at its sleep points.
    pub async fn run_async<F: FnMut(&[u8])>(&mut self, mut on_payload: F) {
        info!(region = %self.cfg.name, "frame reader task started");
        while !self.stop.is_stopped() {
            let pause = self.tick(&mut on_payload);
            if pause.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(pause).await;
            }
        }
        self.link = Link::Unattached;
        info!(region = %self.cfg.name, "frame reader task stopped");
    }

    /// Moves the loop onto a dedicated OS thread.
    pub fn spawn<F>(mut self, on_payload: F) -> io::Result<ReaderHandle>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let stop = self.stop_flag();
        let stats = self.stats();
        let thread = std::thread::Builder::new()
            .name(format!("frame-reader-{}", self.cfg.name))
            .spawn(move || self.run(on_payload))?;
        Ok(ReaderHandle {
            stop,
            stats,
            thread: Some(thread),
        })
    }
}

/// Owner of a reader loop running on its own thread.
pub struct ReaderHandle {
    stop: StopFlag,
    stats: Arc<ReaderStats>,
    thread: Option<JoinHandle<()>>,
}

impl ReaderHandle {
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stats(&self) -> &ReaderStats {
        &self.stats
    }

    /// Stops the loop and waits for the thread to exit. Idempotent.
    pub fn close(&mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("frame reader thread panicked");
            }
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.close();
    }
}
