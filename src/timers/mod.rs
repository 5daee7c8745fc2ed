//! Scheduling primitives and the thread-wide timer slot.
//!
//! Code that wants to run something "soon" or "later" goes through the
//! functions in this module. They delegate to whichever [`Scheduler`] is
//! installed for the current thread: the real [`EventLoop`] by default, or a
//! [`VirtualClock`] after [`mock_timers`].
//!
//! ```
//! use qmock::timers;
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! let clock = timers::mock_timers();
//! let fired = Rc::new(Cell::new(false));
//! let flag = fired.clone();
//! timers::schedule_after(move || flag.set(true), 10);
//!
//! clock.advance(9).unwrap();
//! assert!(!fired.get());
//! clock.advance(1).unwrap();
//! assert!(fired.get());
//! timers::unmock_timers();
//! ```

pub mod clock;
pub mod event_loop;

pub use clock::VirtualClock;
pub use event_loop::EventLoop;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// A scheduled callback. Returning `Err` is how a callback raises.
pub type Callback = Box<dyn FnMut() -> anyhow::Result<()>>;

/// Result types a scheduled closure may return.
pub trait TaskOutcome {
    fn into_task_result(self) -> anyhow::Result<()>;
}

impl TaskOutcome for () {
    fn into_task_result(self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<E> TaskOutcome for Result<(), E>
where
    E: Into<anyhow::Error>,
{
    fn into_task_result(self) -> anyhow::Result<()> {
        self.map_err(Into::into)
    }
}

/// Box a one-shot closure as a [`Callback`].
pub fn task<F, R>(f: F) -> Callback
where
    F: FnOnce() -> R + 'static,
    R: TaskOutcome,
{
    let mut f = Some(f);
    Box::new(move || match f.take() {
        Some(f) => f().into_task_result(),
        None => Ok(()),
    })
}

/// Box a reusable closure as a [`Callback`], for repeating tasks.
pub fn repeating<F, R>(mut f: F) -> Callback
where
    F: FnMut() -> R + 'static,
    R: TaskOutcome,
{
    Box::new(move || f().into_task_result())
}

/// Which primitive created a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Asap,
    After,
    Repeating,
}

/// Handle to a scheduled task.
///
/// Cancelling is a flag-set: the driver skips a cancelled task when it gets
/// to it. Cancelling twice, or after the task fired, does nothing.
#[derive(Clone)]
pub struct TaskHandle {
    id: u64,
    kind: TaskKind,
    cancelled: Rc<Cell<bool>>,
    referenced: Rc<Cell<bool>>,
}

impl TaskHandle {
    pub(crate) fn new(id: u64, kind: TaskKind) -> Self {
        Self {
            id,
            kind,
            cancelled: Rc::new(Cell::new(false)),
            referenced: Rc::new(Cell::new(true)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Let the real event loop exit while this task is still pending.
    pub fn unref(&self) {
        self.referenced.set(false);
    }

    /// Undo [`unref`](Self::unref).
    pub fn ref_(&self) {
        self.referenced.set(true);
    }

    pub fn has_ref(&self) -> bool {
        self.referenced.get()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("cancelled", &self.cancelled.get())
            .field("referenced", &self.referenced.get())
            .finish()
    }
}

/// The scheduling surface: run-ASAP, run-after-delay, run-repeating, and
/// their cancellers.
///
/// Delays and periods of `0` are treated as `1` millisecond.
pub trait Scheduler {
    fn schedule_asap(&self, callback: Callback) -> TaskHandle;

    fn schedule_after(&self, callback: Callback, delay_ms: u64) -> TaskHandle;

    fn schedule_repeating(&self, callback: Callback, period_ms: u64) -> TaskHandle;

    fn cancel_asap(&self, handle: &TaskHandle) {
        handle.cancel();
    }

    fn cancel_after(&self, handle: &TaskHandle) {
        handle.cancel();
    }

    fn cancel_repeating(&self, handle: &TaskHandle) {
        handle.cancel();
    }
}

thread_local! {
    static INSTALLED: RefCell<Option<Rc<dyn Scheduler>>> = const { RefCell::new(None) };
    static RUNTIME: Rc<EventLoop> = Rc::new(EventLoop::new());
}

/// The real event loop of the current thread.
pub fn runtime() -> Rc<EventLoop> {
    RUNTIME.with(Rc::clone)
}

/// The scheduler currently installed for this thread.
pub fn current() -> Rc<dyn Scheduler> {
    INSTALLED
        .with(|slot| slot.borrow().clone())
        .unwrap_or_else(|| runtime() as Rc<dyn Scheduler>)
}

/// Install `scheduler` in place of the real event loop.
///
/// Replaces whatever was installed before; installations never stack.
pub fn override_timers(scheduler: Rc<dyn Scheduler>) {
    INSTALLED.with(|slot| *slot.borrow_mut() = Some(scheduler));
}

/// Restore the real event loop.
pub fn restore_timers() {
    INSTALLED.with(|slot| slot.borrow_mut().take());
}

/// Whether the scheduler at `ptr` is the installed one.
pub(crate) fn is_installed(ptr: *const ()) -> bool {
    INSTALLED.with(|slot| {
        slot.borrow()
            .as_ref()
            .is_some_and(|installed| Rc::as_ptr(installed) as *const () == ptr)
    })
}

/// Create a virtual clock and install it.
pub fn mock_timers() -> Rc<VirtualClock> {
    let clock = VirtualClock::new();
    clock.install();
    clock
}

/// Uninstall any virtual clock. Safe to call when nothing is installed.
pub fn unmock_timers() {
    restore_timers();
}

pub fn schedule_asap<F, R>(f: F) -> TaskHandle
where
    F: FnOnce() -> R + 'static,
    R: TaskOutcome,
{
    current().schedule_asap(task(f))
}

pub fn schedule_after<F, R>(f: F, delay_ms: u64) -> TaskHandle
where
    F: FnOnce() -> R + 'static,
    R: TaskOutcome,
{
    current().schedule_after(task(f), delay_ms)
}

pub fn schedule_repeating<F, R>(f: F, period_ms: u64) -> TaskHandle
where
    F: FnMut() -> R + 'static,
    R: TaskOutcome,
{
    current().schedule_repeating(repeating(f), period_ms)
}

pub fn cancel_asap(handle: &TaskHandle) {
    current().cancel_asap(handle);
}

pub fn cancel_after(handle: &TaskHandle) {
    current().cancel_after(handle);
}

pub fn cancel_repeating(handle: &TaskHandle) {
    current().cancel_repeating(handle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_and_unmock_swap_the_slot() {
        let clock = mock_timers();
        assert!(clock.is_installed());
        assert!(is_installed(Rc::as_ptr(&clock) as *const ()));

        unmock_timers();
        assert!(!clock.is_installed());
        let runtime = runtime();
        assert!(Rc::as_ptr(&current()) as *const () == Rc::as_ptr(&runtime) as *const ());

        // Not mocked: still safe.
        unmock_timers();
    }

    #[test]
    fn test_free_functions_use_installed_clock() {
        let clock = mock_timers();
        let hits = Rc::new(Cell::new(0));

        let h = hits.clone();
        schedule_asap(move || h.set(h.get() + 1));
        let h = hits.clone();
        schedule_after(move || h.set(h.get() + 10), 2);
        assert_eq!(clock.pending_asap(), 1);
        assert_eq!(clock.pending_at(2), 1);

        clock.advance(2).unwrap();
        assert_eq!(hits.get(), 11);
        unmock_timers();
    }

    #[test]
    fn test_override_replaces_instead_of_stacking() {
        let first = mock_timers();
        let second = mock_timers();
        assert!(!first.is_installed());
        assert!(second.is_installed());

        unmock_timers();
        assert!(!second.is_installed());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let clock = mock_timers();
        let handle = schedule_after(|| (), 1);
        cancel_after(&handle);
        cancel_after(&handle);
        clock.advance(1).unwrap();
        cancel_after(&handle);
        assert!(handle.is_cancelled());
        unmock_timers();
    }

    #[test]
    fn test_handle_ref_unref() {
        let handle = TaskHandle::new(7, TaskKind::After);
        assert!(handle.has_ref());
        handle.unref();
        assert!(!handle.has_ref());
        handle.ref_();
        assert!(handle.has_ref());
        assert_eq!(handle.id(), 7);
        assert_eq!(handle.kind(), TaskKind::After);
    }

    #[test]
    fn test_task_outcomes() {
        let mut ok = task(|| ());
        assert!(ok().is_ok());
        // A one-shot callback is inert after its first run.
        assert!(ok().is_ok());

        let mut failing = task(|| -> Result<(), std::io::Error> {
            Err(std::io::Error::other("nope"))
        });
        assert_eq!(failing().unwrap_err().to_string(), "nope");
    }
}
