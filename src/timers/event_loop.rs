//! Wall-clock event loop.
//!
//! This is the scheduler in effect when no virtual clock is installed. Work
//! queued on it runs when a test (or the CLI) awaits [`EventLoop::run`],
//! which keeps turning until no referenced task and no spawned future is
//! left. Time comes from `tokio::time`, so a paused tokio clock drives it
//! without real waiting.

use super::{Callback, Scheduler, TaskHandle, TaskKind};
use futures::future::LocalBoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

struct Entry {
    handle: TaskHandle,
    callback: Callback,
    interval: Option<Duration>,
}

impl Entry {
    fn is_live(&self) -> bool {
        !self.handle.is_cancelled()
    }

    fn keeps_alive(&self) -> bool {
        self.is_live() && self.handle.has_ref()
    }
}

pub struct EventLoop {
    next_id: Cell<u64>,
    immediates: RefCell<VecDeque<Entry>>,
    /// Keyed by deadline, then id, so equal deadlines keep insertion order.
    timers: RefCell<BTreeMap<(Instant, u64), Entry>>,
    spawned: RefCell<Vec<LocalBoxFuture<'static, ()>>>,
    errors: RefCell<Vec<anyhow::Error>>,
    wake: Notify,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(0),
            immediates: RefCell::new(VecDeque::new()),
            timers: RefCell::new(BTreeMap::new()),
            spawned: RefCell::new(Vec::new()),
            errors: RefCell::new(Vec::new()),
            wake: Notify::new(),
        }
    }

    /// Run a future on this loop. It keeps the loop alive until it completes.
    pub fn spawn_local<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.spawned.borrow_mut().push(Box::pin(future));
        self.wake.notify_one();
    }

    /// Turn the loop until nothing referenced is left to do.
    pub async fn run(&self) {
        let mut running: FuturesUnordered<LocalBoxFuture<'static, ()>> = FuturesUnordered::new();

        loop {
            running.extend(self.spawned.borrow_mut().drain(..));
            self.poll();
            running.extend(self.spawned.borrow_mut().drain(..));

            if running.is_empty() && !self.has_pending_tasks() {
                break;
            }

            let deadline = self.next_timer_deadline();
            let timer = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            if running.is_empty() {
                tokio::select! {
                    _ = timer => {}
                    _ = self.wake.notified() => {}
                }
            } else {
                tokio::select! {
                    _ = running.next() => {}
                    _ = timer => {}
                    _ = self.wake.notified() => {}
                }
            }
        }
    }

    /// Run the immediates queued so far, then every timer that is due.
    /// Returns the number of callbacks invoked.
    pub fn poll(&self) -> usize {
        self.run_immediates() + self.run_timers()
    }

    /// Whether a referenced, uncancelled task is still queued.
    pub fn has_pending_tasks(&self) -> bool {
        self.immediates.borrow().iter().any(Entry::keeps_alive)
            || self.timers.borrow().values().any(Entry::keeps_alive)
    }

    /// When the loop next has something to do.
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        if self.immediates.borrow().iter().any(Entry::keeps_alive) {
            return Some(Instant::now());
        }
        self.timers
            .borrow()
            .iter()
            .find(|(_, entry)| entry.keeps_alive())
            .map(|((when, _), _)| *when)
    }

    /// Errors returned by callbacks since the last call.
    pub fn take_errors(&self) -> Vec<anyhow::Error> {
        std::mem::take(&mut *self.errors.borrow_mut())
    }

    fn run_immediates(&self) -> usize {
        let batch = std::mem::take(&mut *self.immediates.borrow_mut());
        let mut ran = 0;
        for mut entry in batch {
            if !entry.is_live() {
                continue;
            }
            self.invoke(&mut entry);
            ran += 1;
        }
        ran
    }

    fn run_timers(&self) -> usize {
        let now = Instant::now();
        let due: Vec<(Instant, u64)> = self
            .timers
            .borrow()
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();

        let mut ran = 0;
        for key in due {
            let Some(mut entry) = self.timers.borrow_mut().remove(&key) else {
                continue;
            };
            if !entry.is_live() {
                continue;
            }

            let ok = self.invoke(&mut entry);
            ran += 1;

            if let Some(interval) = entry.interval {
                if ok && entry.is_live() {
                    let when = Instant::now() + interval;
                    self.timers.borrow_mut().insert((when, key.1), entry);
                }
            }
        }
        ran
    }

    fn invoke(&self, entry: &mut Entry) -> bool {
        match (entry.callback)() {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(task = entry.handle.id(), error = %format!("{err:#}"), "uncaught error in scheduled callback");
                self.errors.borrow_mut().push(err);
                false
            }
        }
    }

    fn handle(&self, kind: TaskKind) -> TaskHandle {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        TaskHandle::new(id, kind)
    }

    fn add_timer(&self, callback: Callback, delay_ms: u64, kind: TaskKind) -> TaskHandle {
        let handle = self.handle(kind);
        let delay = Duration::from_millis(delay_ms.max(1));
        let interval = (kind == TaskKind::Repeating).then_some(delay);
        self.timers.borrow_mut().insert(
            (Instant::now() + delay, handle.id()),
            Entry {
                handle: handle.clone(),
                callback,
                interval,
            },
        );
        self.wake.notify_one();
        handle
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for EventLoop {
    fn schedule_asap(&self, callback: Callback) -> TaskHandle {
        let handle = self.handle(TaskKind::Asap);
        self.immediates.borrow_mut().push_back(Entry {
            handle: handle.clone(),
            callback,
            interval: None,
        });
        self.wake.notify_one();
        handle
    }

    fn schedule_after(&self, callback: Callback, delay_ms: u64) -> TaskHandle {
        self.add_timer(callback, delay_ms, TaskKind::After)
    }

    fn schedule_repeating(&self, callback: Callback, period_ms: u64) -> TaskHandle {
        self.add_timer(callback, period_ms, TaskKind::Repeating)
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("immediates", &self.immediates.borrow().len())
            .field("timers", &self.timers.borrow().len())
            .field("spawned", &self.spawned.borrow().len())
            .finish()
    }
}
