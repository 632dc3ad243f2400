//! Fixed-cadence frame clock.
//!
//! A ticker thread fires at `start + k * interval` and hands each tick to a
//! single worker thread. Ticks never queue: one that fires while the
//! previous is still running is dropped and counted.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 30 Hz
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(33);

/// Non-blocking mutual exclusion for tick bodies.
#[derive(Debug, Default)]
pub struct TickGate {
    busy: AtomicBool,
}

/// Held while a tick runs; releases the gate on drop.
pub struct TickGuard<'a> {
    gate: &'a TickGate,
}

impl TickGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the gate, or returns `None` if a tick is already running.
    pub fn try_enter(&self) -> Option<TickGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickGuard { gate: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct ClockCounters {
    fired: AtomicU64,
    dropped: AtomicU64,
    panicked: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockStats {
    /// Ticks handed to the worker
    pub fired: u64,
    /// Ticks skipped because the worker was still busy
    pub dropped: u64,
    /// Ticks whose body panicked; the clock keeps running
    pub panicked: u64,
}

pub type TickFn = Arc<dyn Fn() + Send + Sync>;

pub struct FrameClock {
    interval: Duration,
    counters: Arc<ClockCounters>,
    stop_tx: Option<SyncSender<()>>,
    ticker: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl FrameClock {
    /// Starts ticking immediately. `on_tick` runs on the worker thread.
    pub fn start(interval: Duration, on_tick: TickFn) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let counters = Arc::new(ClockCounters::default());
        let gate = Arc::new(TickGate::new());
        let (stop_tx, stop_rx) = mpsc::sync_channel::<()>(1);
        let (tick_tx, tick_rx) = mpsc::sync_channel::<()>(1);

        let worker_gate = gate.clone();
        let worker_counters = counters.clone();
        let worker = thread::Builder::new()
            .name("keymix-clock-worker".into())
            .spawn(move || {
                let mut fps = FpsCounter::new();
                while tick_rx.recv().is_ok() {
                    if catch_unwind(AssertUnwindSafe(|| on_tick())).is_err() {
                        worker_counters.panicked.fetch_add(1, Ordering::Relaxed);
                        error!("Tick panicked; the clock keeps running");
                    }
                    worker_gate.busy.store(false, Ordering::Release);
                    if let Some(rate) = fps.update() {
                        debug!("Tick rate: {:.1} fps", rate);
                    }
                }
            });

        let ticker_counters = counters.clone();
        let ticker = thread::Builder::new()
            .name("keymix-clock".into())
            .spawn(move || {
                let start = Instant::now();
                let mut k: u32 = 1;
                loop {
                    let deadline = start + interval * k;
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }

                    // fire, unless the previous tick is still in flight
                    let acquired = gate
                        .busy
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                    if acquired {
                        match tick_tx.try_send(()) {
                            Ok(()) => {
                                ticker_counters.fired.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(TrySendError::Full(())) => {
                                gate.busy.store(false, Ordering::Release);
                                ticker_counters.dropped.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(TrySendError::Disconnected(())) => break,
                        }
                    } else {
                        ticker_counters.dropped.fetch_add(1, Ordering::Relaxed);
                    }

                    // deadlines already in the past were overlapped as well
                    let elapsed = Instant::now().saturating_duration_since(start);
                    let due = (elapsed.as_nanos() / interval.as_nanos().max(1)) as u32;
                    if due > k {
                        ticker_counters
                            .dropped
                            .fetch_add(u64::from(due - k), Ordering::Relaxed);
                        k = due;
                    }
                    k += 1;
                }
            });

        let (ticker, worker) = match (ticker, worker) {
            (Ok(t), Ok(w)) => (Some(t), Some(w)),
            (t, w) => {
                warn!("Failed to spawn frame clock threads");
                (t.ok(), w.ok())
            }
        };

        info!("Frame clock started at {:?} per tick", interval);
        Self {
            interval,
            counters,
            stop_tx: Some(stop_tx),
            ticker,
            worker,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stats(&self) -> ClockStats {
        ClockStats {
            fired: self.counters.fired.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }

    /// Stops ticking and waits for an in-flight tick to finish.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
        // ticker exit drops the tick sender, which ends the worker
        if let Some(handle) = self.ticker.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        let stats = self.stats();
        info!(
            "Frame clock stopped: {} fired, {} dropped",
            stats.fired, stats.dropped
        );
    }
}

impl Drop for FrameClock {
    fn drop(&mut self) {
        if self.ticker.is_some() || self.worker.is_some() {
            self.stop();
        }
    }
}

/// A utility for tracking frames per second.
pub struct FpsCounter {
    frame_count: u32,
    last_time: Instant,
    interval: Duration,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self {
            frame_count: 0,
            last_time: Instant::now(),
            interval: Duration::from_secs(1),
        }
    }

    /// Returns Some(fps) once per reporting interval.
    pub fn update(&mut self) -> Option<f32> {
        self.frame_count += 1;
        let elapsed = self.last_time.elapsed();

        if elapsed >= self.interval {
            let fps = self.frame_count as f32 / elapsed.as_secs_f32();
            self.frame_count = 0;
            self.last_time = Instant::now();
            Some(fps)
        } else {
            None
        }
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_gate_is_exclusive() {
        let gate = TickGate::new();
        let guard = gate.try_enter();
        assert!(guard.is_some());
        assert!(gate.try_enter().is_none());
        drop(guard);
        assert!(gate.try_enter().is_some());
    }

    #[test]
    fn test_clock_fires_ticks() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut clock = FrameClock::start(Duration::from_millis(5), Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        thread::sleep(Duration::from_millis(120));
        clock.stop();
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 5, "fired {fired}");
        assert_eq!(clock.stats().fired as usize, fired);
    }

    #[test]
    fn test_slow_ticks_are_dropped_not_queued() {
        let running = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let (r, o) = (running.clone(), overlapped.clone());
        let started = Instant::now();
        let mut clock = FrameClock::start(Duration::from_millis(10), Arc::new(move || {
            if r.fetch_add(1, Ordering::SeqCst) > 0 {
                o.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(35));
            r.fetch_sub(1, Ordering::SeqCst);
        }));
        thread::sleep(Duration::from_millis(250));
        let elapsed_ms = started.elapsed().as_millis() as i64;
        clock.stop();

        let stats = clock.stats();
        assert!(!overlapped.load(Ordering::SeqCst));
        assert!(stats.dropped > stats.fired, "{stats:?}");
        // every deadline is accounted for exactly once
        let counted = (stats.fired + stats.dropped) as i64;
        assert!((counted - elapsed_ms / 10).abs() <= 3, "{stats:?} over {elapsed_ms}ms");
        // only overlapping deadlines are skipped: a tick fires at the first
        // deadline after the previous one finished
        assert!(stats.fired as i64 <= elapsed_ms / 35 + 1, "{stats:?}");
        assert!(stats.fired as i64 >= elapsed_ms / 55 - 1, "{stats:?}");
    }

    #[test]
    fn test_panicking_tick_does_not_stop_the_clock() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut clock = FrameClock::start(Duration::from_millis(5), Arc::new(move || {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first tick fails");
            }
        }));
        thread::sleep(Duration::from_millis(150));
        clock.stop();

        let stats = clock.stats();
        assert_eq!(stats.panicked, 1);
        assert!(count.load(Ordering::SeqCst) >= 5, "{stats:?}");
        assert_eq!(stats.fired as usize, count.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_joins_threads() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let clock = FrameClock::start(Duration::from_millis(2), Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        thread::sleep(Duration::from_millis(20));
        drop(clock);
        let after = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), after);
    }
}
