//! Scripted response steps.

use super::network;
use super::request::ClientRequest;
use super::response::IncomingMessage;
use crate::error::RequestError;
use crate::headers::Headers;
use crate::timers;
use bytes::Bytes;
use serde_json::Value;
use std::fmt;
use std::rc::Rc;

/// A hand-written action: inspect or fill the exchange, then call `next`.
pub type ComputeFn = Rc<dyn Fn(&ClientRequest, &IncomingMessage, Next)>;

/// Continuation handed to every action.
///
/// Consuming it with [`done`](Next::done) continues the pipeline,
/// [`fail`](Next::fail) aborts it. A `Next` that is dropped without being
/// called fails the pipeline with [`RequestError::ContinuationDropped`].
#[must_use = "the pipeline only continues once `next` is called"]
pub struct Next {
    resume: Option<Box<dyn FnOnce(Result<(), RequestError>)>>,
}

impl Next {
    pub(crate) fn new(resume: impl FnOnce(Result<(), RequestError>) + 'static) -> Self {
        Self {
            resume: Some(Box::new(resume)),
        }
    }

    pub fn done(self) {
        self.resolve(Ok(()));
    }

    pub fn fail(self, err: impl Into<RequestError>) {
        self.resolve(Err(err.into()));
    }

    pub fn resolve(mut self, result: Result<(), RequestError>) {
        if let Some(resume) = self.resume.take() {
            resume(result);
        }
    }
}

impl Drop for Next {
    fn drop(&mut self) {
        if let Some(resume) = self.resume.take() {
            resume(Err(RequestError::ContinuationDropped));
        }
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("pending", &self.resume.is_some())
            .finish()
    }
}

/// Where and what to send when passing a request through to the network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Forward {
    /// Target URL, optionally `METHOD:`-annotated. Defaults to the mocked
    /// request's own URL.
    pub target: Option<String>,
    /// Replaces the recorded request body and sets `Content-Length`.
    pub body: Option<Bytes>,
    /// Merged over the mocked request's headers.
    pub headers: Headers,
}

impl Forward {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }
}

/// One step of a response pipeline.
#[derive(Clone)]
pub enum Action {
    Compute(ComputeFn),
    Delay(u64),
    Write {
        chunk: Bytes,
        then: Option<Rc<dyn Fn()>>,
    },
    WriteHead {
        status: Option<u16>,
        headers: Headers,
    },
    End {
        status: Option<u16>,
        body: Option<Bytes>,
    },
    Send {
        status: u16,
        body: Bytes,
        headers: Headers,
    },
    Emit {
        event: String,
        args: Vec<Value>,
    },
    Throw(RequestError),
    Forward(Forward),
}

impl Action {
    pub fn compute(f: impl Fn(&ClientRequest, &IncomingMessage, Next) + 'static) -> Self {
        Action::Compute(Rc::new(f))
    }

    /// Whether this action delivers the response itself.
    pub fn defers_response(&self) -> bool {
        matches!(self, Action::Forward(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Compute(_) => "compute",
            Action::Delay(_) => "delay",
            Action::Write { .. } => "write",
            Action::WriteHead { .. } => "write_head",
            Action::End { .. } => "end",
            Action::Send { .. } => "send",
            Action::Emit { .. } => "emit",
            Action::Throw(_) => "throw",
            Action::Forward(_) => "forward",
        }
    }

    /// Run against the live exchange. Every arm calls `next` exactly once,
    /// possibly later.
    pub fn run(&self, req: &ClientRequest, res: &IncomingMessage, next: Next) {
        match self {
            Action::Compute(f) => f(req, res, next),
            Action::Delay(ms) => {
                timers::schedule_after(move || next.done(), *ms);
            }
            Action::Write { chunk, then } => {
                res.push(Some(chunk.clone()));
                if let Some(then) = then {
                    then();
                }
                next.done();
            }
            Action::WriteHead { status, headers } => {
                if let Some(status) = status {
                    res.set_status_code(*status);
                }
                res.merge_headers(headers);
                next.done();
            }
            Action::End { status, body } => {
                if let Some(status) = status {
                    res.set_status_code(*status);
                }
                if let Some(body) = body {
                    res.push(Some(body.clone()));
                }
                res.push(None);
                next.done();
            }
            Action::Send {
                status,
                body,
                headers,
            } => {
                res.merge_headers(headers);
                res.set_status_code(*status);
                res.push(Some(body.clone()));
                res.push(None);
                next.done();
            }
            Action::Emit { event, args } => {
                res.emit(event, args);
                next.done();
            }
            Action::Throw(err) => next.fail(err.clone()),
            Action::Forward(forward) => network::forward(req, res, forward, next),
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Delay(ms) => write!(f, "Delay({ms})"),
            Action::Throw(err) => write!(f, "Throw({err})"),
            Action::Forward(forward) => f.debug_tuple("Forward").field(forward).finish(),
            other => f.write_str(other.name()),
        }
    }
}
