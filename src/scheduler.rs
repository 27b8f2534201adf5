//! Flush queues for deferred watcher jobs, and the background flush loop.
//!
//! Two FIFO queues, deduplicated by job id: the pre-flush queue runs before
//! the post-flush queue on every [`flush_jobs`] pass, and the drain iterates
//! to a fixed point because jobs may enqueue further jobs. Enqueuing marks a
//! flush as scheduled and pokes the background loop if one is running;
//! synchronous callers (and tests) just call [`flush_jobs`] themselves.
//!
//! The background loop is event-driven with a resetting debounce: each
//! notification restarts the timer, bounded by a maximum wait so constant
//! load cannot starve processing. When idle it blocks on the channel and
//! costs nothing.

use std::cell::Cell;
use std::sync::mpsc::{self, Sender, TryRecvError};
use std::sync::{Arc, LazyLock, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use foldhash::fast::FixedState;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::errors::{call_with_error_handling, CallbackKind};

/// A queued flush job.
pub type Job = Arc<dyn Fn() + Send + Sync>;

static PRE_QUEUE: LazyLock<Mutex<IndexMap<u64, Job, FixedState>>> =
    LazyLock::new(|| Mutex::new(IndexMap::with_hasher(FixedState::default())));
static POST_QUEUE: LazyLock<Mutex<IndexMap<u64, Job, FixedState>>> =
    LazyLock::new(|| Mutex::new(IndexMap::with_hasher(FixedState::default())));

static FLUSH_NOTIFIER: OnceLock<Sender<()>> = OnceLock::new();

thread_local! {
    static FLUSH_SCHEDULED: Cell<bool> = const { Cell::new(false) };
}

/// Mark that queued jobs are waiting and wake the flush loop if one is
/// running. Repeated calls collapse into one pending flush.
pub fn schedule_flush() {
    FLUSH_SCHEDULED.with(|s| s.set(true));
    if let Some(sender) = FLUSH_NOTIFIER.get() {
        let _ = sender.send(());
    }
}

/// Whether a flush has been scheduled but not yet performed.
pub fn is_flush_scheduled() -> bool {
    FLUSH_SCHEDULED.with(Cell::get)
}

/// Enqueue a job on the pre-flush queue. A job id already queued is left in
/// its original position (FIFO, deduplicating).
pub fn queue_pre_flush(id: u64, job: Job) {
    PRE_QUEUE.lock().entry(id).or_insert(job);
    schedule_flush();
}

/// Enqueue a job on the post-flush queue, behind every pre-flush job.
pub fn queue_post_flush(id: u64, job: Job) {
    POST_QUEUE.lock().entry(id).or_insert(job);
    schedule_flush();
}

fn drain(queue: &Mutex<IndexMap<u64, Job, FixedState>>) -> Vec<Job> {
    let mut guard = queue.lock();
    guard.drain(..).map(|(_, job)| job).collect()
}

/// Run every queued job: the pre queue first, then the post queue, looping
/// until both are empty. Jobs run through the error facade, so a panicking
/// job is reported and the rest of the queue still runs. Returns the number
/// of jobs processed.
pub fn flush_jobs() -> usize {
    FLUSH_SCHEDULED.with(|s| s.set(false));
    let mut total = 0;
    loop {
        let pre = drain(&PRE_QUEUE);
        if !pre.is_empty() {
            total += pre.len();
            for job in pre {
                call_with_error_handling(CallbackKind::Scheduler, || job());
            }
            continue;
        }
        let post = drain(&POST_QUEUE);
        if post.is_empty() {
            break;
        }
        total += post.len();
        for job in post {
            call_with_error_handling(CallbackKind::Scheduler, || job());
        }
    }
    total
}

/// Default debounce delay: how long the loop waits after a notification for
/// more work to batch.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(4);

/// Default upper bound on debouncing under constant notification load.
pub const DEFAULT_MAX_DEBOUNCE: Duration = Duration::from_millis(16);

/// Builder for the background flush loop.
///
/// ```ignore
/// FlushLoop::new()
///     .debounce(Duration::from_millis(2))
///     .max_debounce(Duration::from_millis(8))
///     .spawn();
/// ```
#[allow(clippy::type_complexity)]
pub struct FlushLoop {
    debounce: Duration,
    max_debounce: Duration,
    spawn_fn: Option<Box<dyn FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send>>,
}

impl Default for FlushLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl FlushLoop {
    /// Builder with the default debounce windows and `std::thread::spawn`.
    pub fn new() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            max_debounce: DEFAULT_MAX_DEBOUNCE,
            spawn_fn: None,
        }
    }

    /// Set the resetting debounce delay.
    pub fn debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Set the maximum total debounce wait.
    pub fn max_debounce(mut self, duration: Duration) -> Self {
        self.max_debounce = duration;
        self
    }

    /// Supply a custom thread spawner (name, stack size, priority).
    pub fn spawn_fn<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send + 'static,
    {
        self.spawn_fn = Some(Box::new(f));
        self
    }

    /// Spawn the loop thread. Subsequent [`schedule_flush`] calls wake it;
    /// it debounces, drains stray notifications, and flushes.
    pub fn spawn(self) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel::<()>();
        let _ = FLUSH_NOTIFIER.set(tx);
        self.spawn_with_receiver(rx)
    }

    /// Spawn the loop over an explicit notification channel. `spawn` wires
    /// it to the process-wide notifier; tests drive their own channel so
    /// the loop can be shut down by dropping the sender.
    fn spawn_with_receiver(self, rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let debounce = self.debounce;
        let max_debounce = self.max_debounce;
        let loop_fn: Box<dyn FnOnce() + Send> = Box::new(move || {
            flush_loop(rx, debounce, max_debounce);
        });
        match self.spawn_fn {
            Some(spawn_fn) => spawn_fn(loop_fn),
            None => thread::spawn(loop_fn),
        }
    }
}

fn flush_loop(rx: mpsc::Receiver<()>, debounce: Duration, max_debounce: Duration) {
    loop {
        if rx.recv().is_err() {
            break;
        }

        // Resetting debounce, capped by the max wait.
        let started = Instant::now();
        loop {
            if started.elapsed() >= max_debounce {
                break;
            }
            let remaining = max_debounce.saturating_sub(started.elapsed());
            match rx.recv_timeout(debounce.min(remaining)) {
                Ok(()) => continue,
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => return,
            }
        }

        // Drop notifications that piled up during the debounce window.
        loop {
            match rx.try_recv() {
                Ok(()) => continue,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        flush_jobs();
    }
}

/// Spawn the background flush loop with default settings.
pub fn spawn_flush_loop() -> JoinHandle<()> {
    FlushLoop::new().spawn()
}

// The queues are process-wide; tests that enqueue and flush serialize on
// this so a concurrent flush cannot steal their jobs mid-assertion.
#[cfg(test)]
pub(crate) static FLUSH_TEST_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn queues_deduplicate_by_id() {
        let _serial = FLUSH_TEST_LOCK.lock();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        let job: Job = Arc::new(move || {
            runs2.fetch_add(1, Ordering::Relaxed);
        });
        queue_pre_flush(u64::MAX, job.clone());
        queue_pre_flush(u64::MAX, job.clone());
        queue_pre_flush(u64::MAX, job);
        flush_jobs();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn pre_jobs_run_before_post_jobs() {
        let _serial = FLUSH_TEST_LOCK.lock();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        queue_post_flush(
            u64::MAX - 1,
            Arc::new(move || {
                o1.lock().push("post");
            }),
        );
        queue_pre_flush(
            u64::MAX - 2,
            Arc::new(move || {
                o2.lock().push("pre");
            }),
        );
        flush_jobs();
        assert_eq!(&*order.lock(), &["pre", "post"]);
    }

    #[test]
    fn flush_reaches_a_fixed_point() {
        let _serial = FLUSH_TEST_LOCK.lock();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        queue_pre_flush(
            u64::MAX - 3,
            Arc::new(move || {
                let inner_runs = runs2.clone();
                queue_pre_flush(
                    u64::MAX - 4,
                    Arc::new(move || {
                        inner_runs.fetch_add(1, Ordering::Relaxed);
                    }),
                );
            }),
        );
        flush_jobs();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn scheduling_sets_and_flushing_clears_the_flag() {
        let _serial = FLUSH_TEST_LOCK.lock();
        queue_pre_flush(u64::MAX - 5, Arc::new(|| {}));
        assert!(is_flush_scheduled());
        flush_jobs();
        assert!(!is_flush_scheduled());
    }

    #[test]
    fn flush_loop_debounces_notifications_into_one_flush() {
        let _serial = FLUSH_TEST_LOCK.lock();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        let spawns = Arc::new(AtomicUsize::new(0));
        let spawns2 = spawns.clone();

        // Drive a private channel instead of the process-wide notifier so
        // the loop can be shut down without affecting other tests.
        let (tx, rx) = mpsc::channel::<()>();
        let handle = FlushLoop::new()
            .debounce(Duration::from_millis(1))
            .max_debounce(Duration::from_millis(10))
            .spawn_fn(move |f| {
                spawns2.fetch_add(1, Ordering::Relaxed);
                thread::Builder::new()
                    .name("flush-loop".into())
                    .spawn(f)
                    .expect("spawn flush loop thread")
            })
            .spawn_with_receiver(rx);
        assert_eq!(spawns.load(Ordering::Relaxed), 1);

        // queue_pre_flush also calls schedule_flush; the sends below play
        // the notifier's part for this private loop.
        queue_pre_flush(
            u64::MAX - 8,
            Arc::new(move || {
                runs2.fetch_add(1, Ordering::Relaxed);
            }),
        );
        tx.send(()).expect("loop is listening");
        tx.send(()).expect("loop is listening");

        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        // Both notifications collapsed into one flush of the queued job.
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        // Dropping the sender disconnects the channel; the loop exits.
        drop(tx);
        handle.join().expect("flush loop exits on disconnect");
    }

    #[test]
    fn max_debounce_caps_waiting_under_constant_notifications() {
        let _serial = FLUSH_TEST_LOCK.lock();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();

        let (tx, rx) = mpsc::channel::<()>();
        let handle = FlushLoop::new()
            .debounce(Duration::from_millis(50))
            .max_debounce(Duration::from_millis(5))
            .spawn_with_receiver(rx);

        queue_pre_flush(
            u64::MAX - 9,
            Arc::new(move || {
                runs2.fetch_add(1, Ordering::Relaxed);
            }),
        );

        // Notify faster than the debounce delay: the resetting timer alone
        // would never fire, the max wait forces a flush anyway.
        let mut observed_under_load = false;
        tx.send(()).expect("loop is listening");
        for _ in 0..500 {
            if runs.load(Ordering::Relaxed) > 0 {
                observed_under_load = true;
                break;
            }
            tx.send(()).expect("loop is listening");
            thread::sleep(Duration::from_millis(1));
        }
        assert!(observed_under_load, "flush must not starve under load");

        drop(tx);
        handle.join().expect("flush loop exits on disconnect");
    }

    #[test]
    fn a_panicking_job_does_not_poison_the_queue() {
        let _serial = FLUSH_TEST_LOCK.lock();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        queue_pre_flush(
            u64::MAX - 6,
            Arc::new(|| {
                panic!("job failed");
            }),
        );
        queue_pre_flush(
            u64::MAX - 7,
            Arc::new(move || {
                runs2.fetch_add(1, Ordering::Relaxed);
            }),
        );
        flush_jobs();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }
}
