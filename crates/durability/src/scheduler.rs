//! Single-thread periodic task scheduler
//!
//! Runs a fixed set of named tasks at individual periods on one background
//! thread, so no task ever overlaps another (or itself). Shutdown is
//! cooperative: a flag plus a condvar nudge, then a join.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

/// One periodic task.
pub struct PeriodicTask {
    /// Name used in logs
    pub name: &'static str,
    /// Interval between runs; the first run happens one period after start
    pub period: Duration,
    /// The work
    pub run: Box<dyn FnMut() + Send>,
}

impl PeriodicTask {
    /// Build a task.
    pub fn new(name: &'static str, period: Duration, run: impl FnMut() + Send + 'static) -> Self {
        PeriodicTask {
            name,
            period,
            run: Box::new(run),
        }
    }
}

struct SchedulerShared {
    shutdown: AtomicBool,
    sleeper: Mutex<()>,
    wake: Condvar,
}

/// Owns the scheduler thread; stops and joins on [`PeriodicScheduler::stop`]
/// or drop.
pub struct PeriodicScheduler {
    shared: Arc<SchedulerShared>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicScheduler {
    /// Spawn the scheduler thread over a set of tasks.
    pub fn start(thread_name: &str, mut tasks: Vec<PeriodicTask>) -> Self {
        let shared = Arc::new(SchedulerShared {
            shutdown: AtomicBool::new(false),
            sleeper: Mutex::new(()),
            wake: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                let mut due: Vec<Instant> =
                    tasks.iter().map(|t| Instant::now() + t.period).collect();
                loop {
                    if thread_shared.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let now = Instant::now();
                    for (task, next) in tasks.iter_mut().zip(due.iter_mut()) {
                        if *next <= now {
                            debug!(task = task.name, "periodic task running");
                            (task.run)();
                            *next = Instant::now() + task.period;
                        }
                    }
                    if thread_shared.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let pause = match due.iter().min() {
                        Some(earliest) => earliest.saturating_duration_since(Instant::now()),
                        None => Duration::from_secs(3600),
                    };
                    if !pause.is_zero() {
                        let mut sleeper = thread_shared.sleeper.lock();
                        let _ = thread_shared.wake.wait_for(&mut sleeper, pause);
                    }
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn scheduler thread: {e}"));
        PeriodicScheduler {
            shared,
            handle: Some(handle),
        }
    }

    /// Stop the thread and wait for it. Idempotent.
    pub fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PeriodicScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
