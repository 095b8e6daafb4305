use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{Result, WheelError};

/// One-shot callback run when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelConfig {
    /// Duration of one slot.
    pub tick: Duration,
    /// Number of slots in the ring.
    pub slots: usize,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            slots: 512,
        }
    }
}

impl WheelConfig {
    fn validate(&self) -> Result<()> {
        if self.tick.is_zero() {
            return Err(WheelError::InvalidConfig("tick must be non-zero".into()));
        }
        if self.slots == 0 {
            return Err(WheelError::InvalidConfig("slots must be non-zero".into()));
        }
        Ok(())
    }

    /// Number of whole ticks covering `delay`, rounded up.
    fn ticks_for(&self, delay: Duration) -> u64 {
        let tick = self.tick.as_nanos();
        let ticks = delay.as_nanos().div_ceil(tick);
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }
}

/// Outcome of one [`TimeoutWheel::advance`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub fired: usize,
    pub panicked: usize,
}

struct TimerTask {
    id: u64,
    key: String,
    due_tick: u64,
    callback: TimerCallback,
}

#[derive(Debug, Clone, Copy)]
struct TaskRef {
    id: u64,
    due_tick: u64,
}

struct Inner {
    config: WheelConfig,
    slots: Vec<Mutex<Vec<TimerTask>>>,
    index: DashMap<String, TaskRef>,
    /// The next tick `advance` will process.
    cursor: AtomicU64,
    next_id: AtomicU64,
    advancing: Mutex<()>,
}

impl Inner {
    fn slot(&self, tick: u64) -> &Mutex<Vec<TimerTask>> {
        &self.slots[(tick % self.slots.len() as u64) as usize]
    }

    fn remove_task(&self, task: TaskRef) -> bool {
        let mut bucket = self.slot(task.due_tick).lock();
        let before = bucket.len();
        bucket.retain(|t| t.id != task.id);
        bucket.len() != before
    }

    /// Takes the tasks due on the current tick and moves the cursor past it.
    fn take_due(&self) -> (u64, Vec<TimerTask>) {
        let _advancing = self.advancing.lock();
        let tick = self.cursor.load(Ordering::Acquire);
        let mut bucket = self.slot(tick).lock();

        let (due, later): (Vec<_>, Vec<_>) =
            bucket.drain(..).partition(|task| task.due_tick <= tick);
        *bucket = later;
        // Published under the slot lock so a concurrent schedule either lands
        // before the drain or sees the new cursor.
        self.cursor.store(tick + 1, Ordering::Release);
        drop(bucket);

        for task in &due {
            self.index.remove_if(&task.key, |_, r| r.id == task.id);
        }
        (tick, due)
    }
}

struct Runner {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Hashed timing wheel keyed by caller-chosen strings.
///
/// Scheduling and cancelling only lock the slot they touch. Every fired
/// callback runs on its own task with panics caught, so one failing callback
/// never stops the wheel.
pub struct TimeoutWheel {
    inner: Arc<Inner>,
    runner: Mutex<Option<Runner>>,
}

impl TimeoutWheel {
    pub fn new(config: WheelConfig) -> Result<Self> {
        config.validate()?;
        let slots = (0..config.slots).map(|_| Mutex::new(Vec::new())).collect();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                slots,
                index: DashMap::new(),
                cursor: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                advancing: Mutex::new(()),
            }),
            runner: Mutex::new(None),
        })
    }

    pub fn config(&self) -> WheelConfig {
        self.inner.config
    }

    /// Number of ticks processed so far.
    pub fn current_tick(&self) -> u64 {
        self.inner.cursor.load(Ordering::Acquire)
    }

    /// Number of scheduled tasks that have not fired or been cancelled.
    pub fn pending(&self) -> usize {
        self.inner.index.len()
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.inner.index.contains_key(key)
    }

    /// Schedules `callback` to run once `delay` has elapsed.
    ///
    /// A task already scheduled under `key` is replaced. A zero delay fires on
    /// the next tick.
    pub fn schedule_timeout<F, Fut>(&self, key: impl Into<String>, delay: Duration, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: TimerCallback = Box::new(move || callback().boxed());
        self.schedule_boxed(key.into(), delay, callback);
    }

    pub fn schedule_boxed(&self, key: String, delay: Duration, callback: TimerCallback) {
        let inner = &self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let ticks = inner.config.ticks_for(delay);
        let mut due_tick = inner
            .cursor
            .load(Ordering::Acquire)
            .saturating_add(ticks.saturating_sub(1));
        let mut task = TimerTask {
            id,
            key: key.clone(),
            due_tick,
            callback,
        };

        let replaced = loop {
            let mut bucket = inner.slot(due_tick).lock();
            let cursor = inner.cursor.load(Ordering::Acquire);
            if due_tick >= cursor {
                task.due_tick = due_tick;
                bucket.push(task);
                break inner.index.insert(key.clone(), TaskRef { id, due_tick });
            }
            // That tick already fired; take the next one instead.
            drop(bucket);
            due_tick = cursor;
        };

        if let Some(old) = replaced {
            inner.remove_task(old);
            tracing::debug!(%key, "timer replaced");
        }
        metrics::gauge!("timeout_wheel_pending").set(inner.index.len() as f64);
    }

    /// Cancels the task scheduled under `key`. Returns `false` when nothing was pending.
    pub fn cancel(&self, key: &str) -> bool {
        let Some((_, task)) = self.inner.index.remove(key) else {
            return false;
        };
        let removed = self.inner.remove_task(task);
        metrics::gauge!("timeout_wheel_pending").set(self.inner.index.len() as f64);
        removed
    }

    /// Fires every task due on the current tick and waits for them to finish.
    pub async fn advance(&self) -> TickReport {
        advance(&self.inner).await
    }

    /// Starts the tick loop on the current tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut runner = self.runner.lock();
        if runner.is_some() {
            return Err(WheelError::AlreadyRunning);
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
            // The first tick of an interval completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        advance(&inner).await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        *runner = Some(Runner { shutdown, handle });
        tracing::info!(
            tick_ms = self.inner.config.tick.as_millis() as u64,
            slots = self.inner.config.slots,
            "timeout wheel started"
        );
        Ok(())
    }

    /// Stops the tick loop. Pending tasks stay scheduled.
    pub async fn stop(&self) -> Result<()> {
        let runner = self.runner.lock().take().ok_or(WheelError::NotRunning)?;
        // A closed channel means the loop is already gone.
        let _ = runner.shutdown.send(true);
        if let Err(err) = runner.handle.await {
            tracing::error!(error = %err, "timeout wheel loop ended abnormally");
        }
        tracing::info!(pending = self.pending(), "timeout wheel stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.runner.lock().is_some()
    }
}

async fn advance(inner: &Inner) -> TickReport {
    let (tick, due) = inner.take_due();
    let mut report = TickReport {
        tick,
        ..TickReport::default()
    };
    if due.is_empty() {
        return report;
    }

    let handles: Vec<_> = due
        .into_iter()
        .map(|task| {
            let key = task.key;
            let callback = task.callback;
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(async move { callback().await })
                    .catch_unwind()
                    .await;
                if let Err(panic) = &outcome {
                    tracing::error!(
                        %key,
                        panic = %panic_message(&**panic),
                        "timer callback panicked"
                    );
                }
                outcome.is_err()
            })
        })
        .collect();

    for handle in handles {
        report.fired += 1;
        match handle.await {
            Ok(false) => {}
            Ok(true) => report.panicked += 1,
            Err(err) => {
                tracing::error!(error = %err, "timer task failed to complete");
                report.panicked += 1;
            }
        }
    }

    metrics::counter!("timeout_wheel_fired_total").increment(report.fired as u64);
    if report.panicked > 0 {
        metrics::counter!("timeout_wheel_panicked_total").increment(report.panicked as u64);
    }
    metrics::gauge!("timeout_wheel_pending").set(inner.index.len() as f64);
    tracing::debug!(tick, fired = report.fired, panicked = report.panicked, "tick processed");
    report
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
