//! Deadline monitoring for loop threads and RPC workers.
//!
//! A [`WatchdogTask`] is armed with a deadline before a stretch of
//! work and disarmed afterwards. A single background thread checks all
//! registered tasks; a missed deadline logs a diagnostic naming the
//! stuck work and deactivates monitoring for that task. Debug builds
//! abort the process, release builds continue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// One monitored stretch of work.
pub struct WatchdogTask {
    state: Mutex<TaskState>,
    active: AtomicBool,
}

struct TaskState {
    deadline: Option<Instant>,
    /// Names the work currently under the deadline.
    description: String,
}

impl WatchdogTask {
    /// Create and register a task with the shared watchdog thread.
    pub fn register(enabled: bool) -> Arc<WatchdogTask> {
        let task = Arc::new(WatchdogTask {
            state: Mutex::new(TaskState {
                deadline: None,
                description: String::new(),
            }),
            active: AtomicBool::new(enabled),
        });
        watchdog().attach(&task);
        task
    }

    /// Arm with an absolute deadline.
    pub fn arm(&self, deadline: Instant) {
        self.state.lock().deadline = Some(deadline);
    }

    pub fn disarm(&self) {
        self.state.lock().deadline = None;
    }

    /// Update the description of the work currently running.
    pub fn set_current(&self, description: &str) {
        let mut state = self.state.lock();
        state.description.clear();
        state.description.push_str(description);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn check(&self, now: Instant) {
        if !self.is_active() {
            return;
        }
        let stuck = {
            let state = self.state.lock();
            match state.deadline {
                Some(deadline) if now > deadline => Some(state.description.clone()),
                _ => None,
            }
        };
        if let Some(description) = stuck {
            if description.is_empty() {
                log::error!("watchdog: got stuck without executing any task");
            } else {
                log::error!(
                    "watchdog: got stuck executing '{}', check for infinite loops",
                    description
                );
            }
            self.deactivate();
            if cfg!(debug_assertions) {
                std::process::abort();
            }
        }
    }
}

struct Watchdog {
    tasks: Mutex<Vec<Weak<WatchdogTask>>>,
}

impl Watchdog {
    fn attach(&self, task: &Arc<WatchdogTask>) {
        self.tasks.lock().push(Arc::downgrade(task));
    }

    fn run(&self) {
        loop {
            std::thread::sleep(CHECK_INTERVAL);
            let now = Instant::now();
            let mut tasks = self.tasks.lock();
            tasks.retain(|weak| match weak.upgrade() {
                Some(task) => {
                    task.check(now);
                    true
                }
                None => false,
            });
        }
    }
}

fn watchdog() -> &'static Watchdog {
    static INSTANCE: OnceLock<&'static Watchdog> = OnceLock::new();
    *INSTANCE.get_or_init(|| {
        let dog: &'static Watchdog = Box::leak(Box::new(Watchdog {
            tasks: Mutex::new(Vec::new()),
        }));
        std::thread::Builder::new()
            .name("axon-watchdog".into())
            .spawn(move || dog.run())
            .expect("failed to spawn watchdog thread");
        dog
    })
}
