//! Monotonic clock and single-threaded cooperative task runner (spec §4.A).
//!
//! Every component built on top of this crate assumes all of its work
//! happens on one logical task-runner thread: tasks run to completion and
//! none preempts another. [`TokioTaskRunner`] is the production executor;
//! [`ManualTaskRunner`] is a synchronous double for deterministic tests.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Instant as StdInstant;

use tokio::sync::Notify;
use tokio::sync::mpsc;

/// Monotonic point in time, nanoseconds since an arbitrary epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimePoint(i64);

impl TimePoint {
    #[must_use]
    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[must_use]
    pub fn as_nanos(self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn saturating_duration_since(self, earlier: TimePoint) -> Duration {
        Duration(self.0.saturating_sub(earlier.0))
    }
}

impl std::ops::Add<Duration> for TimePoint {
    type Output = TimePoint;
    fn add(self, rhs: Duration) -> TimePoint {
        TimePoint(self.0 + rhs.0)
    }
}

impl std::ops::Sub for TimePoint {
    type Output = Duration;
    fn sub(self, rhs: TimePoint) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

/// Signed nanosecond duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(i64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    #[must_use]
    pub fn from_nanos(n: i64) -> Self {
        Self(n)
    }

    #[must_use]
    pub fn from_millis(ms: i64) -> Self {
        Self(ms * 1_000_000)
    }

    #[must_use]
    pub fn from_secs(s: i64) -> Self {
        Self(s * 1_000_000_000)
    }

    #[must_use]
    pub fn as_nanos(self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn as_std(self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0.max(0) as u64)
    }

    #[must_use]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }
}

impl std::ops::Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

/// Source of monotonic time. [`SystemClock`] backs production use;
/// [`FakeClock`] backs tests that need to control elapsed time directly.
pub trait Clock: Send + Sync {
    fn now(&self) -> TimePoint;
}

/// Wall-clock-backed [`Clock`], anchored at construction time.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: StdInstant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: StdInstant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> TimePoint {
        TimePoint::from_nanos(
            i64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(i64::MAX),
        )
    }
}

/// Manually-advanced clock for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct FakeClock {
    now: Arc<Mutex<TimePoint>>,
}

impl FakeClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(TimePoint::from_nanos(0))),
        }
    }

    pub fn advance(&self, d: Duration) {
        let mut now = self.now.lock().expect("FakeClock mutex poisoned");
        *now = *now + d;
    }

    pub fn set(&self, t: TimePoint) {
        *self.now.lock().expect("FakeClock mutex poisoned") = t;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> TimePoint {
        *self.now.lock().expect("FakeClock mutex poisoned")
    }
}

/// A unit of work posted to a [`TaskRunner`]. Tasks run to completion; no
/// task preempts another (spec §4.A).
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Accepts tasks for execution on one logical thread, optionally after a
/// delay. Implemented by [`TokioTaskRunner`] in production and
/// [`ManualTaskRunner`] in tests.
pub trait TaskRunner: Send + Sync {
    /// Schedule `task` to run after any already-queued immediate tasks, in
    /// submission order.
    fn post_task(&self, task: Task);

    /// Schedule `task` to run once `delay` has elapsed.
    fn post_task_with_delay(&self, task: Task, delay: Duration);

    /// Wake the runner loop and cause it to exit on its next iteration.
    fn stop(&self);
}

struct DelayedEntry {
    deadline: TimePoint,
    seq: u64,
    task: Task,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for DelayedEntry {}

impl Ord for DelayedEntry {
    // Reversed so a `BinaryHeap` (a max-heap) pops the earliest deadline
    // first, breaking ties by submission order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// `tokio`-backed [`TaskRunner`]. Tasks run sequentially on the future
/// driving [`TokioTaskRunner::run`]; no internal locking is required beyond
/// the shared queues themselves, since only that one future ever pops them.
pub struct TokioTaskRunner {
    clock: Arc<dyn Clock>,
    immediate_tx: mpsc::UnboundedSender<Task>,
    immediate_rx: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
    delayed: Mutex<BinaryHeap<DelayedEntry>>,
    seq: AtomicU64,
    notify: Notify,
    stopped: AtomicBool,
}

impl TokioTaskRunner {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            clock,
            immediate_tx: tx,
            immediate_rx: Mutex::new(Some(rx)),
            delayed: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            stopped: AtomicBool::new(false),
        })
    }

    fn next_deadline(&self) -> Option<TimePoint> {
        self.delayed.lock().expect("poisoned").peek().map(|e| e.deadline)
    }

    fn pop_due(&self, now: TimePoint) -> Option<Task> {
        let mut heap = self.delayed.lock().expect("poisoned");
        match heap.peek() {
            Some(e) if e.deadline <= now => heap.pop().map(|e| e.task),
            _ => None,
        }
    }

    /// Drive the runner loop until [`TaskRunner::stop`] is called. Must be
    /// polled by exactly one task (spec §5: single logical thread).
    pub async fn run(self: &Arc<Self>) {
        let mut immediate_rx = self
            .immediate_rx
            .lock()
            .expect("poisoned")
            .take()
            .expect("TokioTaskRunner::run called more than once");

        loop {
            // Drain everything currently ready: immediate tasks, then any
            // delayed task whose deadline has passed.
            loop {
                let mut ran = false;
                while let Ok(task) = immediate_rx.try_recv() {
                    task();
                    ran = true;
                }
                while let Some(task) = self.pop_due(self.clock.now()) {
                    task();
                    ran = true;
                }
                if !ran {
                    break;
                }
            }

            if self.stopped.load(AtomicOrdering::Acquire) {
                tracing::info!("task runner stopping");
                break;
            }

            let sleep_for = self
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(self.clock.now()).as_std());

            tokio::select! {
                biased;
                () = self.notify.notified() => {}
                maybe_task = immediate_rx.recv() => {
                    if let Some(task) = maybe_task {
                        task();
                    }
                }
                () = async {
                    match sleep_for {
                        Some(d) => tokio::time::sleep(d).await,
                        None => std::future::pending().await,
                    }
                } => {}
            }
        }
    }
}

impl TaskRunner for TokioTaskRunner {
    fn post_task(&self, task: Task) {
        // Receiver gone only after `stop()`; dropping a late task is fine.
        let _ = self.immediate_tx.send(task);
    }

    fn post_task_with_delay(&self, task: Task, delay: Duration) {
        let deadline = self.clock.now() + delay;
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        tracing::trace!(?deadline, "task scheduled with delay");
        self.delayed
            .lock()
            .expect("poisoned")
            .push(DelayedEntry { deadline, seq, task });
        self.notify.notify_one();
    }

    fn stop(&self) {
        self.stopped.store(true, AtomicOrdering::Release);
        self.notify.notify_one();
    }
}

/// Synchronous [`TaskRunner`] double for unit tests: nothing runs until
/// [`ManualTaskRunner::run_ready`] is called, and time only moves when the
/// backing [`FakeClock`] is advanced. This lets tests exercise spec.md's
/// "drain until quiescent" algorithms (the discovery aggregator's loop,
/// the availability watch refresh) without a real async runtime.
pub struct ManualTaskRunner {
    clock: FakeClock,
    immediate: Mutex<VecDeque<Task>>,
    delayed: Mutex<BinaryHeap<DelayedEntry>>,
    seq: AtomicU64,
    stopped: AtomicBool,
}

impl ManualTaskRunner {
    #[must_use]
    pub fn new(clock: FakeClock) -> Self {
        Self {
            clock,
            immediate: Mutex::new(VecDeque::new()),
            delayed: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn clock(&self) -> &FakeClock {
        &self.clock
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(AtomicOrdering::Relaxed)
    }

    /// Run every currently-ready immediate and due-delayed task, repeating
    /// until none remain (mirrors spec.md §4.A/§4.C "drain until no further
    /// events are pending").
    pub fn run_ready(&self) {
        loop {
            let mut progressed = false;
            while let Some(task) = self.immediate.lock().expect("poisoned").pop_front() {
                task();
                progressed = true;
            }
            let now = self.clock.now();
            loop {
                let due = {
                    let mut heap = self.delayed.lock().expect("poisoned");
                    match heap.peek() {
                        Some(e) if e.deadline <= now => heap.pop(),
                        _ => None,
                    }
                };
                match due {
                    Some(entry) => {
                        (entry.task)();
                        progressed = true;
                    }
                    None => break,
                }
            }
            if !progressed {
                break;
            }
        }
    }
}

impl TaskRunner for ManualTaskRunner {
    fn post_task(&self, task: Task) {
        self.immediate.lock().expect("poisoned").push_back(task);
    }

    fn post_task_with_delay(&self, task: Task, delay: Duration) {
        let deadline = self.clock.now() + delay;
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.delayed
            .lock()
            .expect("poisoned")
            .push(DelayedEntry { deadline, seq, task });
    }

    fn stop(&self) {
        self.stopped.store(true, AtomicOrdering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn manual_runner_executes_immediate_tasks_in_submission_order() {
        let runner = ManualTaskRunner::new(FakeClock::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            runner.post_task(Box::new(move || order.lock().unwrap().push(i)));
        }
        runner.run_ready();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn manual_runner_defers_delayed_tasks_until_clock_advances() {
        let clock = FakeClock::new();
        let runner = ManualTaskRunner::new(clock.clone());
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        runner.post_task_with_delay(
            Box::new(move || ran2.store(true, AtomicOrdering::SeqCst)),
            Duration::from_secs(10),
        );
        runner.run_ready();
        assert!(!ran.load(AtomicOrdering::SeqCst), "task should not fire early");

        clock.advance(Duration::from_secs(10));
        runner.run_ready();
        assert!(ran.load(AtomicOrdering::SeqCst), "task should fire once due");
    }

    #[test]
    fn manual_runner_runs_delayed_tasks_in_deadline_order() {
        let clock = FakeClock::new();
        let runner = ManualTaskRunner::new(clock.clone());
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        runner.post_task_with_delay(Box::new(move || o1.lock().unwrap().push("b")), Duration::from_secs(2));
        let o2 = order.clone();
        runner.post_task_with_delay(Box::new(move || o2.lock().unwrap().push("a")), Duration::from_secs(1));

        clock.advance(Duration::from_secs(5));
        runner.run_ready();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn stop_flag_is_observable() {
        let runner = ManualTaskRunner::new(FakeClock::new());
        assert!(!runner.is_stopped());
        runner.stop();
        assert!(runner.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_runner_runs_delayed_task_after_real_sleep() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClockForTest::new());
        let runner = TokioTaskRunner::new(clock);
        let counter = Arc::new(AtomicU32::new(0));

        let runner_clone = runner.clone();
        let driver = tokio::spawn(async move { runner_clone.run().await });

        let counter2 = counter.clone();
        runner.post_task_with_delay(
            Box::new(move || {
                counter2.fetch_add(1, AtomicOrdering::SeqCst);
            }),
            Duration::from_millis(50),
        );

        tokio::time::advance(std::time::Duration::from_millis(60)).await;
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);

        runner.stop();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), driver).await;
    }

    // A `Clock` usable under `tokio::time::pause()`, since `SystemClock` is
    // backed by `std::time::Instant` and would not observe paused advances.
    struct SystemClockForTest {
        origin: tokio::time::Instant,
    }
    impl SystemClockForTest {
        fn new() -> Self {
            Self { origin: tokio::time::Instant::now() }
        }
    }
    impl Clock for SystemClockForTest {
        fn now(&self) -> TimePoint {
            TimePoint::from_nanos(
                i64::try_from(tokio::time::Instant::now().duration_since(self.origin).as_nanos())
                    .unwrap_or(i64::MAX),
            )
        }
    }
}
