use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, error};

use crate::clock::monotonic_ms;

pub trait Watchdog {
    fn feed(&self);
}

pub fn is_starved(last_fed_ms: u64, now_ms: u64, timeout_ms: u64) -> bool {
    now_ms.saturating_sub(last_fed_ms) > timeout_ms
}

/// Fed by the top-level loop and the maintenance task.
#[derive(Clone)]
pub struct StallMonitor {
    last_fed_ms: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
}

impl StallMonitor {
    /// Aborts the process when starved.
    pub fn spawn(timeout: Duration) -> io::Result<(Self, JoinHandle<()>)> {
        Self::spawn_with(timeout, || std::process::abort())
    }

    pub fn spawn_with<F>(timeout: Duration, on_starved: F) -> io::Result<(Self, JoinHandle<()>)>
    where
        F: FnOnce() + Send + 'static,
    {
        let monitor = Self {
            last_fed_ms: Arc::new(AtomicU64::new(monotonic_ms())),
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        let watched = monitor.clone();
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let check_every = (timeout / 4).clamp(Duration::from_millis(1), Duration::from_millis(500));

        let join = thread::Builder::new()
            .name("stall-monitor".to_string())
            .spawn(move || {
                while !watched.shutdown.load(Ordering::Relaxed) {
                    thread::sleep(check_every);
                    let last = watched.last_fed_ms.load(Ordering::Relaxed);
                    if is_starved(last, monotonic_ms(), timeout_ms) {
                        error!("watchdog starved for more than {timeout_ms}ms; restarting");
                        on_starved();
                        return;
                    }
                }
                debug!("stall monitor exiting");
            })?;

        Ok((monitor, join))
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Watchdog for StallMonitor {
    fn feed(&self) {
        self.last_fed_ms.store(monotonic_ms(), Ordering::Relaxed);
    }
}
