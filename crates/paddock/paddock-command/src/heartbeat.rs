//! Missed-heartbeat detection.
//!
//! The `__heartbeat__` handler and the monitor live on different threads in
//! the blocking server, so the state is all atomics.

use crate::config::HeartbeatConfig;
use crate::registry::MissedHeartbeatHandler;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest single sleep of the blocking monitor, so it notices `stop` quickly.
const STOP_POLL: Duration = Duration::from_millis(20);

/// What a monitor tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStep {
    Healthy,
    Missed(u32),
    /// The limit was reached on this tick; fire the callback and stop.
    Expired(u32),
}

#[derive(Debug)]
pub struct HeartbeatState {
    cfg: HeartbeatConfig,
    /// Reference point for `last_beat_ns`.
    epoch: Instant,
    /// Nanoseconds after `epoch` of the last heartbeat; 0 = none yet.
    last_beat_ns: AtomicU64,
    missed: AtomicU32,
    expired: AtomicBool,
}

impl HeartbeatState {
    pub fn new(cfg: HeartbeatConfig) -> Self {
        Self {
            cfg,
            epoch: Instant::now(),
            last_beat_ns: AtomicU64::new(0),
            missed: AtomicU32::new(0),
            expired: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.cfg
    }

    /// Records a heartbeat and clears the miss counter.
    pub fn beat(&self) {
        let ns = (self.epoch.elapsed().as_nanos() as u64).max(1);
        self.last_beat_ns.store(ns, Ordering::Release);
        self.missed.store(0, Ordering::Release);
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        match self.last_beat_ns.load(Ordering::Acquire) {
            0 => None,
            ns => Some(self.epoch + Duration::from_nanos(ns)),
        }
    }

    pub fn missed_count(&self) -> u32 {
        self.missed.load(Ordering::Acquire)
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    /// One monitor check at `now`.
    ///
    /// Silence is measured from the last heartbeat, or from when the state was
    /// created if none has arrived yet. Once expired, every later tick reports
    /// `Healthy` so the callback can only fire once.
    pub fn tick(&self, now: Instant) -> MonitorStep {
        if self.is_expired() {
            return MonitorStep::Healthy;
        }
        let since = self.last_heartbeat().unwrap_or(self.epoch);
        if now.saturating_duration_since(since) <= self.cfg.timeout {
            return MonitorStep::Healthy;
        }
        let missed = self.missed.fetch_add(1, Ordering::AcqRel) + 1;
        if missed >= self.cfg.max_missed
            && self
                .expired
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return MonitorStep::Expired(missed);
        }
        MonitorStep::Missed(missed)
    }

    fn report(&self, step: MonitorStep, source: &str, callback: &MissedHeartbeatHandler) -> bool {
        match step {
            MonitorStep::Healthy => true,
            MonitorStep::Missed(n) => {
                debug!(source, missed = n, max = self.cfg.max_missed, "heartbeat missed");
                true
            }
            MonitorStep::Expired(n) => {
                warn!(source, missed = n, "heartbeat lost, notifying");
                callback(n);
                false
            }
        }
    }
}

/// Runs the monitor on its own OS thread until expiry or `stop`.
pub fn spawn_monitor(
    state: Arc<HeartbeatState>,
    callback: MissedHeartbeatHandler,
    stop: Arc<AtomicBool>,
    source: String,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("heartbeat-{source}"))
        .spawn(move || {
            info!(source = %source, "heartbeat monitor started");
            let interval = state.config().interval;
            let mut next = Instant::now() + interval;
            while !stop.load(Ordering::Acquire) {
                let now = Instant::now();
                if now < next {
                    std::thread::sleep((next - now).min(STOP_POLL));
                    continue;
                }
                next += interval;
                if !state.report(state.tick(now), &source, &callback) {
                    break;
                }
            }
            info!(source = %source, "heartbeat monitor stopped");
        })
}

/// The same monitor as a task; suspends only at its interval sleeps.
pub async fn run_monitor(
    state: Arc<HeartbeatState>,
    callback: MissedHeartbeatHandler,
    stop: Arc<AtomicBool>,
    source: String,
) {
    info!(source = %source, "heartbeat monitor task started");
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + state.config().interval,
        state.config().interval,
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    while !stop.load(Ordering::Acquire) {
        ticker.tick().await;
        if stop.load(Ordering::Acquire) {
            break;
        }
        if !state.report(state.tick(Instant::now()), &source, &callback) {
            break;
        }
    }
    info!(source = %source, "heartbeat monitor task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(100),
            max_missed: 3,
        }
    }

    #[test]
    fn expires_exactly_once() {
        let state = HeartbeatState::new(cfg());
        let t0 = Instant::now();
        assert_eq!(state.tick(t0), MonitorStep::Healthy);

        let late = t0 + Duration::from_millis(500);
        assert_eq!(state.tick(late), MonitorStep::Missed(1));
        assert_eq!(state.tick(late), MonitorStep::Missed(2));
        assert_eq!(state.tick(late), MonitorStep::Expired(3));
        assert_eq!(state.tick(late), MonitorStep::Healthy);
        assert!(state.is_expired());
    }

    #[test]
    fn heartbeat_resets_miss_counter() {
        let state = HeartbeatState::new(cfg());
        let late = Instant::now() + Duration::from_millis(500);
        assert_eq!(state.tick(late), MonitorStep::Missed(1));
        assert_eq!(state.tick(late), MonitorStep::Missed(2));

        state.beat();
        assert_eq!(state.missed_count(), 0);
        assert!(state.last_heartbeat().is_some());
        assert_eq!(state.tick(Instant::now()), MonitorStep::Healthy);
    }

    #[test]
    fn blocking_monitor_fires_once_with_count() {
        let state = Arc::new(HeartbeatState::new(cfg()));
        let fired = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_monitor(
            Arc::clone(&state),
            Arc::new(move |n: u32| sink.lock().unwrap().push(n)),
            Arc::clone(&stop),
            "test".into(),
        )
        .unwrap();

        // Monitor exits on its own after expiry.
        handle.join().unwrap();
        assert_eq!(*fired.lock().unwrap(), vec![3]);
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(*fired.lock().unwrap(), vec![3]);
    }
}
