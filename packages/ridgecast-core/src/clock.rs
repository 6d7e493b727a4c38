//! Emission metronome (Clock B).
//!
//! A dedicated thread wakes on absolute monotonic deadlines and invokes
//! registered subscribers synchronously, one tick per wake. The deadline
//! always advances by exactly one period per tick; a late wake emits a
//! single tick and the schedule is never resynced to `now()`, so there is
//! no drift accumulation and no catch-up burst.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A clock subscriber; receives the tick index.
pub type TickFn = Box<dyn FnMut(u64) + Send>;

struct ClockShared {
    subscribers: Mutex<Vec<TickFn>>,
    running: AtomicBool,
}

/// Fixed-rate tick source driving the tower's emission path.
pub struct MasterClock {
    period: Duration,
    shared: Arc<ClockShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MasterClock {
    /// Creates a stopped clock with the given tick period.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            shared: Arc::new(ClockShared {
                subscribers: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Returns the tick period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Registers a subscriber invoked on every tick, in registration order.
    ///
    /// Subscribers run synchronously on the clock thread and must stay well
    /// under one period. A panicking subscriber is logged and skipped for
    /// that tick; the clock keeps ticking.
    pub fn subscribe(&self, f: TickFn) {
        self.shared.subscribers.lock().push(f);
    }

    /// Starts the tick thread. No-op when already running.
    ///
    /// # Errors
    ///
    /// Returns an error if the clock thread fails to spawn.
    pub fn start(&self) -> std::io::Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            log::warn!("[Clock] already running");
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let period = self.period;
        let handle = match std::thread::Builder::new()
            .name("clock-b".into())
            .spawn(move || clock_loop(shared, period))
        {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.thread.lock() = Some(handle);
        log::debug!("[Clock] started, period={:?}", self.period);
        Ok(())
    }

    /// Stops the tick thread and joins it.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            // The loop checks the flag at least once per period
            let _ = handle.join();
        }
        log::debug!("[Clock] stopped");
    }

    /// Returns whether the tick thread is running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

impl Drop for MasterClock {
    fn drop(&mut self) {
        self.stop();
    }
}

fn clock_loop(shared: Arc<ClockShared>, period: Duration) {
    log::debug!("[Clock] loop started");
    let mut tick: u64 = 0;
    let mut next_deadline = Instant::now() + period;

    while shared.running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now < next_deadline {
            std::thread::sleep(next_deadline - now);
            continue;
        }

        // Reached (or passed) the deadline: emit exactly ONE tick.
        // Missed deadlines are dropped, never burst.
        {
            let mut subscribers = shared.subscribers.lock();
            for subscriber in subscribers.iter_mut() {
                let result = catch_unwind(AssertUnwindSafe(|| subscriber(tick)));
                if let Err(panic) = result {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "<non-string panic>".into());
                    log::error!("[Clock] subscriber panicked on tick {tick}: {msg}");
                }
            }
        }

        tick += 1;
        next_deadline += period;
    }

    log::debug!("[Clock] loop exited after {tick} ticks");
}
