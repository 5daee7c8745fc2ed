//! Per-request phase driver.
//!
//! A pipeline runs the global before actions, delivers the response, runs
//! the matched route's actions, runs the global after actions and finally
//! ends the response stream. Each phase hands over to the next on a fresh
//! scheduler turn. Actions may call their continuation synchronously or
//! later; a small trampoline keeps synchronous chains from recursing.

use super::action::{Action, Next};
use super::request::ClientRequest;
use super::response::IncomingMessage;
use crate::error::RequestError;
use crate::timers;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Before,
    Matched,
    After,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Before => "before",
            Phase::Matched => "matched",
            Phase::After => "after",
        })
    }
}

pub(crate) struct Pipeline {
    req: ClientRequest,
    res: IncomingMessage,
    before: Vec<Action>,
    matched: Vec<Action>,
    after: Vec<Action>,
    phase: Cell<Phase>,
    index: Cell<usize>,
    in_action: Cell<bool>,
    settled: RefCell<Option<Result<(), RequestError>>>,
}

impl Pipeline {
    pub(crate) fn new(
        req: ClientRequest,
        res: IncomingMessage,
        before: Vec<Action>,
        matched: Vec<Action>,
        after: Vec<Action>,
    ) -> Rc<Self> {
        Rc::new(Self {
            req,
            res,
            before,
            matched,
            after,
            phase: Cell::new(Phase::Before),
            index: Cell::new(0),
            in_action: Cell::new(false),
            settled: RefCell::new(None),
        })
    }

    /// Start with the before phase.
    pub(crate) fn start(self: &Rc<Self>) {
        let defers = self
            .before
            .iter()
            .chain(&self.matched)
            .chain(&self.after)
            .any(Action::defers_response);
        if defers {
            self.req.defer_response();
        }
        self.step();
    }

    fn actions(&self) -> &[Action] {
        match self.phase.get() {
            Phase::Before => &self.before,
            Phase::Matched => &self.matched,
            Phase::After => &self.after,
        }
    }

    fn step(self: &Rc<Self>) {
        loop {
            if self.stopped() {
                return;
            }
            let Some(action) = self.actions().get(self.index.get()) else {
                let this = self.clone();
                timers::schedule_asap(move || this.end_phase());
                return;
            };

            let this = self.clone();
            let next = Next::new(move |result| this.resume(result));
            self.in_action.set(true);
            action.run(&self.req, &self.res, next);
            self.in_action.set(false);

            let settled = self.settled.borrow_mut().take();
            match settled {
                Some(Ok(())) => self.index.set(self.index.get() + 1),
                Some(Err(err)) => return self.fail(err),
                None => return,
            }
        }
    }

    fn resume(self: &Rc<Self>, result: Result<(), RequestError>) {
        if self.in_action.get() {
            *self.settled.borrow_mut() = Some(result);
            return;
        }
        match result {
            Ok(()) => {
                self.index.set(self.index.get() + 1);
                self.step();
            }
            Err(err) => self.fail(err),
        }
    }

    fn end_phase(self: &Rc<Self>) {
        if self.stopped() {
            return;
        }
        let next = match self.phase.get() {
            Phase::Before => {
                self.req.respond_unless_deferred();
                Phase::Matched
            }
            Phase::Matched => Phase::After,
            Phase::After => return self.complete(None),
        };
        debug!(url = %self.req.url(), phase = %next, "pipeline phase");
        self.phase.set(next);
        self.index.set(0);
        self.step();
    }

    /// An aborted request runs no further actions; its stream is closed
    /// without another error.
    fn stopped(&self) -> bool {
        if !self.req.is_destroyed() {
            return false;
        }
        debug!(url = %self.req.url(), phase = %self.phase.get(), "request aborted, stopping pipeline");
        self.complete(None);
        true
    }

    fn fail(&self, err: RequestError) {
        if self.stopped() {
            return;
        }
        warn!(url = %self.req.url(), phase = %self.phase.get(), error = %err, "response pipeline failed");
        self.complete(Some(err));
    }

    fn complete(&self, err: Option<RequestError>) {
        self.res.finish();
        self.req.mark_complete();
        if let Some(err) = err {
            self.req.emit_error(err);
        }
    }
}
