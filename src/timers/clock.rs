//! Virtual clock.
//!
//! A [`VirtualClock`] keeps a logical timestamp in milliseconds, a queue of
//! run-ASAP tasks and a map of timestamp to due tasks. Nothing fires until a
//! test calls [`VirtualClock::advance`], which steps the clock one
//! millisecond at a time: each step first drains the ASAP tasks queued at
//! the start of the step, then fires the tasks due at the new timestamp.

use super::{runtime, task, Callback, Scheduler, TaskHandle, TaskKind};
use crate::error::ClockError;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

struct Task {
    handle: TaskHandle,
    callback: Callback,
    /// Set for repeating tasks.
    period: Option<u64>,
}

/// Where an interrupted tick left off.
#[derive(Debug, Clone, Copy)]
enum Resume {
    /// A task in the ASAP batch failed; `then_due` is set when the tick
    /// still owes its due tasks.
    Asap { at: u64, then_due: bool },
    /// A task in the due batch for `at` failed.
    Due { at: u64 },
}

#[derive(Default)]
struct ClockState {
    now: u64,
    next_id: u64,
    asap: VecDeque<Task>,
    due: BTreeMap<u64, VecDeque<Task>>,
    resume: Option<Resume>,
}

impl ClockState {
    fn handle(&mut self, kind: TaskKind) -> TaskHandle {
        self.next_id += 1;
        TaskHandle::new(self.next_id, kind)
    }
}

/// Deterministic, manually driven scheduler.
pub struct VirtualClock {
    state: RefCell<ClockState>,
    this: Weak<VirtualClock>,
}

impl VirtualClock {
    /// Create a clock at logical time `0`. The clock is not installed.
    pub fn new() -> Rc<Self> {
        Self::starting_at(0)
    }

    /// Create a clock whose logical time starts at `timestamp`.
    pub fn starting_at(timestamp: u64) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            state: RefCell::new(ClockState {
                now: timestamp,
                ..ClockState::default()
            }),
            this: this.clone(),
        })
    }

    /// Current logical timestamp in milliseconds.
    pub fn now(&self) -> u64 {
        self.state.borrow().now
    }

    /// Number of live tasks waiting in the ASAP queue.
    pub fn pending_asap(&self) -> usize {
        live(&self.state.borrow().asap)
    }

    /// Number of live tasks due at `timestamp`.
    pub fn pending_at(&self, timestamp: u64) -> usize {
        self.state.borrow().due.get(&timestamp).map_or(0, live)
    }

    /// Number of live tasks, ASAP and due.
    pub fn pending(&self) -> usize {
        let state = self.state.borrow();
        live(&state.asap) + state.due.values().map(live).sum::<usize>()
    }

    /// Earliest timestamp that holds a live due task.
    pub fn next_due(&self) -> Option<u64> {
        let state = self.state.borrow();
        state
            .due
            .iter()
            .find(|(_, queue)| live(queue) > 0)
            .map(|(at, _)| *at)
    }

    /// Whether a tick was interrupted by a failing callback and not yet
    /// finished.
    pub fn is_interrupted(&self) -> bool {
        self.state.borrow().resume.is_some()
    }

    /// Drive the clock.
    ///
    /// `None` advances by one millisecond. `Some(0)` runs only the ASAP tasks
    /// queued at call time and leaves the timestamp alone. `Some(n)` steps
    /// `n` times: bump the timestamp, drain the ASAP snapshot, fire the tasks
    /// due at the new timestamp.
    ///
    /// If a callback fails, its unfired siblings are put back at the front of
    /// their queue, the rest of this call is abandoned and the error is
    /// returned. The interrupted tick is finished by [`recover`](Self::recover),
    /// which runs on the next turn of the real event loop or at the start of
    /// the next `advance`, whichever comes first.
    pub fn advance(&self, ms: impl Into<Option<u64>>) -> Result<&Self, ClockError> {
        self.recover()?;

        let ms = ms.into().unwrap_or(1);
        if ms == 0 {
            let at = self.now();
            self.run_asap(at, false)?;
            return Ok(self);
        }

        for _ in 0..ms {
            let at = {
                let mut state = self.state.borrow_mut();
                state.now += 1;
                state.now
            };
            self.run_asap(at, true)?;
            self.run_due(at)?;
        }
        Ok(self)
    }

    /// Finish a tick that a failing callback interrupted. A no-op otherwise.
    pub fn recover(&self) -> Result<&Self, ClockError> {
        let resume = self.state.borrow_mut().resume.take();
        match resume {
            None => {}
            Some(Resume::Asap { at, then_due }) => {
                debug!(at, "resuming interrupted immediate batch");
                self.run_asap(at, then_due)?;
                if then_due {
                    self.run_due(at)?;
                }
            }
            Some(Resume::Due { at }) => {
                debug!(at, "resuming interrupted timer batch");
                self.run_due(at)?;
            }
        }
        Ok(self)
    }

    /// Put this clock in the thread's timer slot. Idempotent.
    pub fn install(&self) -> &Self {
        if !self.is_installed() {
            if let Some(this) = self.this.upgrade() {
                super::override_timers(this);
            }
        }
        self
    }

    /// Take this clock out of the timer slot if it is installed there.
    ///
    /// The clock keeps its queues and can still be driven directly.
    pub fn uninstall(&self) -> &Self {
        if self.is_installed() {
            super::restore_timers();
        }
        self
    }

    pub fn is_installed(&self) -> bool {
        super::is_installed(self as *const Self as *const ())
    }

    fn run_asap(&self, at: u64, then_due: bool) -> Result<(), ClockError> {
        let batch = std::mem::take(&mut self.state.borrow_mut().asap);
        self.run_batch(batch, Resume::Asap { at, then_due })
    }

    fn run_due(&self, at: u64) -> Result<(), ClockError> {
        let batch = self
            .state
            .borrow_mut()
            .due
            .remove(&at)
            .unwrap_or_default();
        self.run_batch(batch, Resume::Due { at })
    }

    fn run_batch(&self, mut batch: VecDeque<Task>, origin: Resume) -> Result<(), ClockError> {
        let at = match origin {
            Resume::Asap { at, .. } | Resume::Due { at } => at,
        };

        while let Some(mut task) = batch.pop_front() {
            if task.handle.is_cancelled() {
                continue;
            }

            if let Err(source) = (task.callback)() {
                self.interrupt(batch, origin);
                warn!(at, task = task.handle.id(), error = %format!("{source:#}"), "scheduled callback failed");
                return Err(ClockError::Callback { at, source });
            }

            if let Some(period) = task.period {
                if !task.handle.is_cancelled() {
                    self.push_due(at + period, task);
                }
            }
        }
        Ok(())
    }

    /// Requeue the unfired rest of a batch ahead of anything the failing
    /// callback scheduled, and arrange for the tick to be finished.
    fn interrupt(&self, remaining: VecDeque<Task>, origin: Resume) {
        {
            let mut state = self.state.borrow_mut();
            match origin {
                Resume::Asap { .. } => {
                    let mut queue = remaining;
                    queue.append(&mut state.asap);
                    state.asap = queue;
                }
                Resume::Due { at } => {
                    let mut queue = remaining;
                    if let Some(mut later) = state.due.remove(&at) {
                        queue.append(&mut later);
                    }
                    if !queue.is_empty() {
                        state.due.insert(at, queue);
                    }
                }
            }
            state.resume = Some(origin);
        }

        let clock = self.this.clone();
        runtime().schedule_asap(task(move || match clock.upgrade() {
            Some(clock) => clock.recover().map(|_| ()),
            None => Ok(()),
        }));
    }

    fn push_due(&self, at: u64, task: Task) {
        self.state
            .borrow_mut()
            .due
            .entry(at)
            .or_default()
            .push_back(task);
    }

    fn add(&self, callback: Callback, kind: TaskKind, delay: u64) -> TaskHandle {
        let mut state = self.state.borrow_mut();
        let handle = state.handle(kind);
        let mut task = Task {
            handle: handle.clone(),
            callback,
            period: None,
        };
        match kind {
            TaskKind::Asap => state.asap.push_back(task),
            TaskKind::After | TaskKind::Repeating => {
                let delay = delay.max(1);
                if kind == TaskKind::Repeating {
                    task.period = Some(delay);
                }
                let at = state.now + delay;
                state.due.entry(at).or_default().push_back(task);
            }
        }
        handle
    }
}

fn live(queue: &VecDeque<Task>) -> usize {
    queue
        .iter()
        .filter(|task| !task.handle.is_cancelled())
        .count()
}

impl Scheduler for VirtualClock {
    fn schedule_asap(&self, callback: Callback) -> TaskHandle {
        self.add(callback, TaskKind::Asap, 0)
    }

    fn schedule_after(&self, callback: Callback, delay_ms: u64) -> TaskHandle {
        self.add(callback, TaskKind::After, delay_ms)
    }

    fn schedule_repeating(&self, callback: Callback, period_ms: u64) -> TaskHandle {
        self.add(callback, TaskKind::Repeating, period_ms)
    }
}

impl fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("VirtualClock")
            .field("now", &state.now)
            .field("asap", &state.asap.len())
            .field("due", &state.due.keys().collect::<Vec<_>>())
            .field("interrupted", &state.resume.is_some())
            .finish()
    }
}
