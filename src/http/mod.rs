//! HTTP interception.
//!
//! Caller code issues requests through [`client::http_request`] and
//! [`client::https_request`]. Those look up the request factory installed
//! for the current thread: the real network by default, or an
//! [`InterceptedFactory`] after [`mock_http`]. Intercepted requests never
//! touch a socket; they are handed to a [`RequestHandler`], normally a
//! [`RouteTable`], on the next scheduler turn.
//!
//! ```
//! use qmock::{http, timers};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let clock = timers::mock_timers();
//! let routes = http::mock_http();
//! routes.when("http://x/y").send(200, "ok");
//!
//! let seen = Rc::new(RefCell::new(None));
//! let slot = seen.clone();
//! let req = http::client::http_request("http://x/y", move |res| {
//!     *slot.borrow_mut() = Some(res);
//! });
//! req.end();
//!
//! clock.advance(10).unwrap();
//! let res = seen.borrow_mut().take().unwrap();
//! assert_eq!(res.status_code(), Some(200));
//! assert_eq!(res.text(), "ok");
//!
//! http::unmock_http();
//! timers::unmock_timers();
//! ```

pub mod action;
pub mod network;
mod pipeline;
pub mod request;
pub mod response;
pub mod route;
pub mod spy;

pub use action::{Action, Forward, Next};
pub use network::NetworkFactory;
pub use request::{Chunk, ClientRequest, ResponseCallback};
pub use response::IncomingMessage;
pub use route::{Condition, Matcher, RouteSettings, RouteStats, RouteTable};
pub use spy::{Call, HandlerSpy};

use crate::timers;
use crate::uri::RequestOptions;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::debug;

/// Something that turns request options into a live request, the way the
/// runtime's `request` functions do.
pub trait RequestFactory {
    fn request(&self, options: RequestOptions, callback: Option<ResponseCallback>) -> ClientRequest;
}

/// Serves intercepted requests.
///
/// A handler owns the exchange: it delivers the response with
/// [`ClientRequest::respond`] when ready, fills `res`, and finishes it.
pub trait RequestHandler {
    fn handle(&self, req: ClientRequest, res: IncomingMessage);
}

impl<F> RequestHandler for F
where
    F: Fn(ClientRequest, IncomingMessage),
{
    fn handle(&self, req: ClientRequest, res: IncomingMessage) {
        self(req, res)
    }
}

/// The un-intercepted factories.
#[derive(Clone)]
pub struct Originals {
    pub http: Rc<dyn RequestFactory>,
    pub https: Rc<dyn RequestFactory>,
}

impl Originals {
    /// Factory for `protocol` (`http:` or `https:`).
    pub fn for_protocol(&self, protocol: &str) -> Rc<dyn RequestFactory> {
        if protocol.eq_ignore_ascii_case("https:") {
            self.https.clone()
        } else {
            self.http.clone()
        }
    }
}

impl Default for Originals {
    fn default() -> Self {
        Self {
            http: Rc::new(NetworkFactory::new("http:")),
            https: Rc::new(NetworkFactory::new("https:")),
        }
    }
}

impl fmt::Debug for Originals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Originals { .. }")
    }
}

thread_local! {
    static ORIGINALS: RefCell<Option<Originals>> = const { RefCell::new(None) };
    static INSTALLED: RefCell<Option<Originals>> = const { RefCell::new(None) };
}

/// The factories requests fall back to when nothing is installed.
pub fn originals() -> Originals {
    ORIGINALS.with(|slot| slot.borrow_mut().get_or_insert_with(Originals::default).clone())
}

/// Swap the fallback factories, returning the previous ones. Interceptors
/// created afterwards forward through the new ones.
pub fn replace_originals(originals: Originals) -> Originals {
    let previous = self::originals();
    ORIGINALS.with(|slot| *slot.borrow_mut() = Some(originals));
    previous
}

fn installed() -> Originals {
    INSTALLED
        .with(|slot| slot.borrow().clone())
        .unwrap_or_else(originals)
}

/// Request factory that routes every request to a handler.
pub struct InterceptedFactory {
    handler: Rc<dyn RequestHandler>,
    protocol: &'static str,
    originals: Originals,
}

impl InterceptedFactory {
    pub fn new(handler: Rc<dyn RequestHandler>, protocol: &'static str, originals: Originals) -> Self {
        Self {
            handler,
            protocol,
            originals,
        }
    }
}

impl RequestFactory for InterceptedFactory {
    fn request(&self, mut options: RequestOptions, callback: Option<ResponseCallback>) -> ClientRequest {
        if options.protocol.is_none() && options.href.is_none() {
            options.protocol = Some(self.protocol.to_string());
        }

        let req = ClientRequest::new(options, callback).with_originals(self.originals.clone());
        let res = req.response();
        debug!(method = %req.method(), url = %req.url(), "intercepted request");

        let handler = self.handler.clone();
        let exchange = req.clone();
        timers::schedule_asap(move || handler.handle(exchange, res));
        req
    }
}

/// Installation context: a handler and the factories that serve it.
///
/// Installing puts this context's factories in the thread's request slots,
/// replacing whatever was there. Uninstalling restores the originals.
pub struct Interceptor {
    handler: Rc<dyn RequestHandler>,
    factories: Originals,
}

impl Interceptor {
    pub fn new(handler: Rc<dyn RequestHandler>) -> Self {
        let originals = originals();
        let factories = Originals {
            http: Rc::new(InterceptedFactory::new(handler.clone(), "http:", originals.clone())),
            https: Rc::new(InterceptedFactory::new(handler.clone(), "https:", originals)),
        };
        Self { handler, factories }
    }

    pub fn handler(&self) -> Rc<dyn RequestHandler> {
        self.handler.clone()
    }

    /// Idempotent.
    pub fn install(&self) -> &Self {
        if !self.is_installed() {
            INSTALLED.with(|slot| *slot.borrow_mut() = Some(self.factories.clone()));
        }
        self
    }

    /// Restore the originals if this context is the one installed.
    pub fn uninstall(&self) -> &Self {
        if self.is_installed() {
            INSTALLED.with(|slot| slot.borrow_mut().take());
        }
        self
    }

    pub fn is_installed(&self) -> bool {
        INSTALLED.with(|slot| {
            slot.borrow()
                .as_ref()
                .is_some_and(|installed| Rc::ptr_eq(&installed.http, &self.factories.http))
        })
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("installed", &self.is_installed())
            .finish()
    }
}

/// Intercept requests with a fresh route table and return it for scripting.
pub fn mock_http() -> RouteTable {
    let routes = RouteTable::new();
    Interceptor::new(routes.handler()).install();
    routes
}

/// Intercept requests with a custom handler.
pub fn mock_http_with(handler: impl RequestHandler + 'static) -> Interceptor {
    let interceptor = Interceptor::new(Rc::new(handler));
    interceptor.install();
    interceptor
}

/// Restore the original factories. Safe to call when nothing is mocked.
pub fn unmock_http() {
    INSTALLED.with(|slot| slot.borrow_mut().take());
}

/// Whether any interceptor is installed on this thread.
pub fn is_mocked() -> bool {
    INSTALLED.with(|slot| slot.borrow().is_some())
}

/// Request functions caller code uses in place of a real client.
pub mod client {
    use super::*;

    /// Issue a request through the `http` slot.
    pub fn http_request(
        options: impl Into<RequestOptions>,
        callback: impl FnOnce(IncomingMessage) + 'static,
    ) -> ClientRequest {
        installed().http.request(options.into(), Some(Box::new(callback)))
    }

    /// Issue a request through the `https` slot.
    pub fn https_request(
        options: impl Into<RequestOptions>,
        callback: impl FnOnce(IncomingMessage) + 'static,
    ) -> ClientRequest {
        installed().https.request(options.into(), Some(Box::new(callback)))
    }

    /// Issue a request through the slot its protocol selects.
    pub fn request(
        options: impl Into<RequestOptions>,
        callback: impl FnOnce(IncomingMessage) + 'static,
    ) -> ClientRequest {
        let options = options.into();
        let protocol = options.protocol.clone().unwrap_or_else(|| "http:".to_string());
        installed()
            .for_protocol(&protocol)
            .request(options, Some(Box::new(callback)))
    }

    /// `GET` and end the request straight away.
    pub fn get(
        options: impl Into<RequestOptions>,
        callback: impl FnOnce(IncomingMessage) + 'static,
    ) -> ClientRequest {
        let req = request(options, callback);
        req.end();
        req
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RequestError;
    use crate::timers::VirtualClock;
    use bytes::Bytes;
    use std::cell::Cell;

    struct Outcome {
        response: RefCell<Option<IncomingMessage>>,
        errors: RefCell<Vec<RequestError>>,
        order: RefCell<Vec<String>>,
    }

    fn outcome() -> Rc<Outcome> {
        Rc::new(Outcome {
            response: RefCell::new(None),
            errors: RefCell::new(Vec::new()),
            order: RefCell::new(Vec::new()),
        })
    }

    fn fetch(url: &str, tag: &'static str, out: &Rc<Outcome>) -> ClientRequest {
        let o = out.clone();
        let req = client::request(url, move |res| {
            let done = o.clone();
            res.on_end(move || done.order.borrow_mut().push(tag.to_string()));
            *o.response.borrow_mut() = Some(res);
        });
        let o = out.clone();
        req.on_error(move |err| o.errors.borrow_mut().push(err.clone()));
        req
    }

    fn setup() -> (Rc<VirtualClock>, RouteTable) {
        (timers::mock_timers(), mock_http())
    }

    fn teardown() {
        unmock_http();
        timers::unmock_timers();
    }

    #[test]
    fn test_send_scripted_response() {
        let (clock, routes) = setup();
        routes.when("http://x/y").send(200, "ok");

        let out = outcome();
        fetch("http://x/y", "y", &out).end();
        clock.advance(10).unwrap();

        let res = out.response.borrow().clone().unwrap();
        assert_eq!(res.status_code(), Some(200));
        assert_eq!(res.text(), "ok");
        assert!(out.errors.borrow().is_empty());
        teardown();
    }

    #[test]
    fn test_shorter_delay_completes_first() {
        let (clock, routes) = setup();
        routes.when("/a").delay(50).send(200, "A");
        routes.when("/b").send(200, "B");

        let out = outcome();
        fetch("http://localhost/a", "a", &out).end();
        fetch("http://localhost/b", "b", &out).end();
        clock.advance(100).unwrap();

        assert_eq!(*out.order.borrow(), vec!["b", "a"]);
        teardown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_real_scheduler_drives_routes_without_clock() {
        let routes = mock_http();
        routes.when("/a").delay(50).send(200, "A");
        routes.when("/b").send(200, "B");

        let out = outcome();
        let started = tokio::time::Instant::now();
        fetch("http://localhost/a", "a", &out).end();
        fetch("http://localhost/b", "b", &out).end();
        timers::runtime().run().await;

        assert_eq!(*out.order.borrow(), vec!["b", "a"]);
        assert!(started.elapsed() >= std::time::Duration::from_millis(50));
        assert!(out.errors.borrow().is_empty());
        unmock_http();
    }

    #[test]
    fn test_unmatched_request_reports_no_route() {
        let (clock, routes) = setup();
        routes.when("/known").send_status(204);

        let out = outcome();
        fetch("http://localhost/unknown?q=1", "u", &out).end();
        clock.advance(10).unwrap();

        let errors = out.errors.borrow();
        assert_eq!(errors.len(), 1);
        let message = errors[0].to_string();
        assert!(message.contains("no route"));
        assert!(message.contains("http://localhost/unknown"));
        assert!(out.response.borrow().is_none());
        assert_eq!(routes.stats().unmatched, 1);
        teardown();
    }

    #[test]
    fn test_before_failure_prevents_matched_actions() {
        let (clock, routes) = setup();
        routes.compute(|_, _, next| next.fail(RequestError::msg("boom")));
        routes.when("/p").send(200, "never");

        let out = outcome();
        fetch("http://localhost/p", "p", &out).end();
        clock.advance(10).unwrap();

        assert_eq!(out.errors.borrow()[0].to_string(), "boom");
        assert!(out.response.borrow().is_none());
        teardown();
    }

    #[test]
    fn test_dispatch_waits_for_end_of_body() {
        let (clock, routes) = setup();
        let bodies = Rc::new(RefCell::new(Vec::new()));
        let b = bodies.clone();
        routes.when("POST:/echo").compute(move |req, res, next| {
            b.borrow_mut().push(req.body());
            res.push(Some(req.body()));
            next.done();
        });
        routes.end_with_status(201);

        let out = outcome();
        let req = fetch("POST:http://localhost/echo", "echo", &out);
        req.write("hello, ");
        clock.advance(20).unwrap();
        assert!(bodies.borrow().is_empty());
        assert!(out.response.borrow().is_none());

        req.end_with("world");
        clock.advance(20).unwrap();
        assert_eq!(*bodies.borrow(), vec![Bytes::from_static(b"hello, world")]);
        let res = out.response.borrow().clone().unwrap();
        assert_eq!(res.status_code(), Some(201));
        assert_eq!(res.text(), "hello, world");
        teardown();
    }

    #[test]
    fn test_callback_follows_before_and_precedes_after() {
        let (clock, routes) = setup();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        routes.before().delay(5).compute(move |_, _, next| {
            o.borrow_mut().push("before");
            next.done();
        });
        let o = order.clone();
        routes.after().compute(move |_, _, next| {
            o.borrow_mut().push("after");
            next.done();
        });
        let o = order.clone();
        routes.when("/p").compute(move |_, _, next| {
            o.borrow_mut().push("matched");
            next.done();
        });
        routes.send_status(200);

        let o = order.clone();
        client::get("http://localhost/p", move |_res| o.borrow_mut().push("callback"));
        clock.advance(50).unwrap();

        assert_eq!(*order.borrow(), vec!["before", "callback", "matched", "after"]);
        teardown();
    }

    #[test]
    fn test_once_then_falls_through() {
        let (clock, routes) = setup();
        routes.once("/flaky").send(503, "down");
        routes.default_route().send(200, "up");

        let first = outcome();
        fetch("http://localhost/flaky", "1", &first).end();
        let second = outcome();
        fetch("http://localhost/flaky", "2", &second).end();
        clock.advance(10).unwrap();

        assert_eq!(first.response.borrow().as_ref().and_then(IncomingMessage::status_code), Some(503));
        assert_eq!(second.response.borrow().as_ref().and_then(IncomingMessage::status_code), Some(200));
        teardown();
    }

    #[test]
    fn test_abort_after_dispatch_stops_delivery() {
        let (clock, routes) = setup();
        routes.when("/slow").delay(10).send(200, "late");

        let out = outcome();
        let closed = Rc::new(Cell::new(false));
        let req = fetch("http://localhost/slow", "slow", &out);
        let c = closed.clone();
        req.on_close(move || c.set(true));
        req.end();
        clock.advance(3).unwrap();

        // The response was already handed over; the delayed send never lands.
        let res = out.response.borrow().clone().unwrap();
        req.abort();
        clock.advance(30).unwrap();

        let errors = out.errors.borrow();
        assert_eq!(errors.as_slice(), &[RequestError::Aborted]);
        assert!(closed.get());
        assert_eq!(res.status_code(), None);
        assert_eq!(res.text(), "");
        assert!(res.is_complete());
        teardown();
    }

    #[test]
    fn test_custom_handler_responds_explicitly() {
        let clock = timers::mock_timers();
        let interceptor = mock_http_with(|req: ClientRequest, res: IncomingMessage| {
            res.set_status_code(418);
            req.respond(Some(res.clone()));
            res.push(Some(Bytes::from(req.url())));
            res.finish();
        });
        assert!(interceptor.is_installed());

        let out = outcome();
        fetch("http://teapot.test/brew", "t", &out).end();
        clock.advance(1).unwrap();

        let res = out.response.borrow().clone().unwrap();
        assert_eq!(res.status_code(), Some(418));
        assert_eq!(res.text(), "http://teapot.test/brew");
        teardown();
    }

    #[test]
    fn test_install_is_idempotent_and_replaces() {
        let first = Interceptor::new(RouteTable::new().handler());
        let second = Interceptor::new(RouteTable::new().handler());

        first.install().install();
        assert!(first.is_installed());
        second.install();
        assert!(!first.is_installed());
        assert!(second.is_installed());

        first.uninstall();
        assert!(second.is_installed());
        second.uninstall().uninstall();
        assert!(!is_mocked());
        unmock_http();
    }

    #[test]
    fn test_https_slot_sets_protocol() {
        let (clock, routes) = setup();
        routes.when("GET:https://secure.test/").send_status(200);

        let seen = Rc::new(Cell::new(None));
        let s = seen.clone();
        let options = RequestOptions::new().hostname("secure.test");
        client::https_request(options, move |res| s.set(res.status_code())).end();
        clock.advance(10).unwrap();

        assert_eq!(seen.get(), Some(200));
        teardown();
    }
}
