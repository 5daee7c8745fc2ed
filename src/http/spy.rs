//! Recording wrapper around a request handler.

use super::request::ClientRequest;
use super::response::IncomingMessage;
use super::RequestHandler;
use crate::headers::Headers;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use tracing::trace;

/// Calls kept when no limit is given.
pub const DEFAULT_CALL_LIMIT: usize = 100;

/// One request seen by a [`HandlerSpy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub method: String,
    pub url: String,
    pub headers: Headers,
}

struct SpyState {
    inner: Rc<dyn RequestHandler>,
    calls: RefCell<VecDeque<Call>>,
    count: Cell<usize>,
    limit: usize,
}

/// Passes every request on to the wrapped handler after recording it.
///
/// The most recent `limit` calls are kept; [`call_count`](Self::call_count)
/// counts all of them.
///
/// ```
/// use qmock::http::{self, HandlerSpy, RouteTable};
/// use qmock::timers;
///
/// let clock = timers::mock_timers();
/// let routes = RouteTable::new();
/// routes.default_route().send(204, "");
/// let spy = HandlerSpy::new(routes.handler());
/// http::mock_http_with(spy.clone());
///
/// http::client::get("http://svc.test/ping", |_| {});
/// clock.advance(5).unwrap();
///
/// spy.assert_called(1);
/// assert_eq!(spy.last_call().unwrap().url, "http://svc.test/ping");
///
/// http::unmock_http();
/// timers::unmock_timers();
/// ```
#[derive(Clone)]
pub struct HandlerSpy {
    state: Rc<SpyState>,
}

impl HandlerSpy {
    pub fn new(inner: Rc<dyn RequestHandler>) -> Self {
        Self::with_limit(inner, DEFAULT_CALL_LIMIT)
    }

    pub fn with_limit(inner: Rc<dyn RequestHandler>, limit: usize) -> Self {
        Self {
            state: Rc::new(SpyState {
                inner,
                calls: RefCell::new(VecDeque::new()),
                count: Cell::new(0),
                limit,
            }),
        }
    }

    /// Recorded calls, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.borrow().iter().cloned().collect()
    }

    pub fn call_count(&self) -> usize {
        self.state.count.get()
    }

    pub fn last_call(&self) -> Option<Call> {
        self.state.calls.borrow().back().cloned()
    }

    pub fn reset(&self) {
        self.state.calls.borrow_mut().clear();
        self.state.count.set(0);
    }

    /// Panic unless exactly `times` calls were seen.
    #[track_caller]
    pub fn assert_called(&self, times: usize) {
        let count = self.call_count();
        if count != times {
            let urls: Vec<String> = self
                .calls()
                .into_iter()
                .map(|call| format!("{} {}", call.method, call.url))
                .collect();
            panic!(
                "expected handler to be called {times} time(s), was called {count} time(s); recorded: [{}]",
                urls.join(", ")
            );
        }
    }

    fn record(&self, req: &ClientRequest) {
        let call = Call {
            method: req.method(),
            url: req.url(),
            headers: req.headers(),
        };
        trace!(method = %call.method, url = %call.url, "spy recorded call");

        self.state.count.set(self.state.count.get() + 1);
        if self.state.limit == 0 {
            return;
        }
        let mut calls = self.state.calls.borrow_mut();
        if calls.len() == self.state.limit {
            calls.pop_front();
        }
        calls.push_back(call);
    }
}

impl RequestHandler for HandlerSpy {
    fn handle(&self, req: ClientRequest, res: IncomingMessage) {
        self.record(&req);
        self.state.inner.handle(req, res);
    }
}

impl fmt::Debug for HandlerSpy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSpy")
            .field("calls", &self.call_count())
            .field("limit", &self.state.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{self, client};
    use crate::timers;

    fn counting_handler() -> (Rc<Cell<usize>>, Rc<dyn RequestHandler>) {
        let handled = Rc::new(Cell::new(0));
        let h = handled.clone();
        let handler = move |req: ClientRequest, res: IncomingMessage| {
            h.set(h.get() + 1);
            req.respond(Some(res.clone()));
            res.finish();
        };
        (handled, Rc::new(handler))
    }

    #[test]
    fn test_records_and_delegates() {
        let clock = timers::mock_timers();
        let (handled, inner) = counting_handler();
        let spy = HandlerSpy::new(inner);
        http::mock_http_with(spy.clone());

        let req = client::request(
            crate::uri::RequestOptions::from_url("POST:http://api.test/items").header("X-Id", "7"),
            |_| {},
        );
        req.end();
        clock.advance(1).unwrap();

        assert_eq!(handled.get(), 1);
        spy.assert_called(1);
        let call = spy.last_call().unwrap();
        assert_eq!(call.method, "POST");
        assert_eq!(call.url, "http://api.test/items");
        assert_eq!(call.headers.get("x-id"), Some("7"));

        http::unmock_http();
        timers::unmock_timers();
    }

    #[test]
    fn test_limit_keeps_most_recent_calls() {
        let clock = timers::mock_timers();
        let (_, inner) = counting_handler();
        let spy = HandlerSpy::with_limit(inner, 2);
        http::mock_http_with(spy.clone());

        for path in ["/a", "/b", "/c"] {
            client::get(format!("http://h.test{path}"), |_| {});
        }
        clock.advance(1).unwrap();

        assert_eq!(spy.call_count(), 3);
        let urls: Vec<String> = spy.calls().into_iter().map(|c| c.url).collect();
        assert_eq!(urls, vec!["http://h.test/b", "http://h.test/c"]);

        spy.reset();
        assert_eq!(spy.call_count(), 0);
        assert!(spy.last_call().is_none());

        http::unmock_http();
        timers::unmock_timers();
    }

    #[test]
    #[should_panic(expected = "expected handler to be called 2 time(s), was called 0 time(s)")]
    fn test_assert_called_reports_mismatch() {
        let (_, inner) = counting_handler();
        HandlerSpy::new(inner).assert_called(2);
    }
}
