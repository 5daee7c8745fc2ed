//! Route table: ordered matchers plus global before/after actions.
//!
//! The builder methods append to whichever action list currently has focus.
//! Focus starts on the global before list, moves to a new matcher on every
//! [`when`](RouteTable::when) / [`once`](RouteTable::once) /
//! [`default_route`](RouteTable::default_route), and can be moved back with
//! [`before`](RouteTable::before) / [`after`](RouteTable::after).
//!
//! ```
//! use qmock::http::RouteTable;
//!
//! let routes = RouteTable::new();
//! routes
//!     .when("GET:http://api.test/users").send(200, r#"[{"id":1}]"#)
//!     .once("/flaky").send_status(503)
//!     .default_route().send(404, "not found");
//! assert_eq!(routes.matcher_count(), 3);
//! ```

use super::action::{Action, Forward, Next};
use super::pipeline::Pipeline;
use super::request::{decode, ClientRequest};
use super::response::IncomingMessage;
use super::RequestHandler;
use crate::error::{MockError, RequestError};
use crate::headers::Headers;
use bytes::Bytes;
use regex::Regex;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Predicate over a live exchange.
pub type PredicateFn = Rc<dyn Fn(&ClientRequest, &IncomingMessage) -> bool>;

/// What a matcher accepts.
#[derive(Clone)]
pub enum Condition {
    /// `[METHOD:]url` or `[METHOD:]/path`, compared for equality.
    Exact(String),
    /// Tested against the URL and the `METHOD:`-prefixed URL.
    Pattern(Regex),
    /// Tested against the pathname and the URL.
    Glob(globset::GlobMatcher),
    Predicate(PredicateFn),
    Any,
}

impl Condition {
    /// Compile a regular expression condition.
    pub fn regex(pattern: &str) -> Result<Self, MockError> {
        Regex::new(pattern)
            .map(Condition::Pattern)
            .map_err(MockError::invalid_matcher)
    }

    /// Compile a glob condition such as `/api/*/items`.
    pub fn glob(pattern: &str) -> Result<Self, MockError> {
        globset::Glob::new(pattern)
            .map(|glob| Condition::Glob(glob.compile_matcher()))
            .map_err(MockError::invalid_matcher)
    }

    pub fn predicate(f: impl Fn(&ClientRequest, &IncomingMessage) -> bool + 'static) -> Self {
        Condition::Predicate(Rc::new(f))
    }

    pub fn matches(&self, req: &ClientRequest, res: &IncomingMessage) -> bool {
        match self {
            Condition::Exact(target) => {
                let method = req.method();
                let url = req.url();
                let pathname = req.pathname();
                *target == url
                    || *target == pathname
                    || *target == format!("{method}:{url}")
                    || *target == format!("{method}:{pathname}")
            }
            Condition::Pattern(regex) => {
                let url = req.url();
                regex.is_match(&url) || regex.is_match(&format!("{}:{url}", req.method()))
            }
            Condition::Glob(glob) => glob.is_match(req.pathname()) || glob.is_match(req.url()),
            Condition::Predicate(f) => f(req, res),
            Condition::Any => true,
        }
    }
}

impl From<&str> for Condition {
    fn from(target: &str) -> Self {
        Condition::Exact(target.to_string())
    }
}

impl From<String> for Condition {
    fn from(target: String) -> Self {
        Condition::Exact(target)
    }
}

impl From<Regex> for Condition {
    fn from(regex: Regex) -> Self {
        Condition::Pattern(regex)
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Exact(target) => f.debug_tuple("Exact").field(target).finish(),
            Condition::Pattern(regex) => f.debug_tuple("Pattern").field(&regex.as_str()).finish(),
            Condition::Glob(glob) => f.debug_tuple("Glob").field(&glob.glob().glob()).finish(),
            Condition::Predicate(_) => f.write_str("Predicate"),
            Condition::Any => f.write_str("Any"),
        }
    }
}

/// A condition, its actions and how many more requests it may take.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub id: Option<String>,
    pub condition: Condition,
    pub actions: Vec<Action>,
    /// `None` is unlimited.
    pub remaining: Option<u32>,
}

impl Matcher {
    pub fn new(condition: Condition) -> Self {
        Self {
            id: None,
            condition,
            actions: Vec::new(),
            remaining: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    fn consume(&mut self) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
    }

    fn label(&self) -> String {
        self.id.clone().unwrap_or_else(|| format!("{:?}", self.condition))
    }
}

/// Logging switches for a route table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSettings {
    pub log_matches: bool,
    pub log_unmatched: bool,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            log_matches: false,
            log_unmatched: true,
        }
    }
}

/// Request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteStats {
    pub requests: u64,
    pub matched: u64,
    pub unmatched: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Focus {
    Before,
    After,
    Matcher(usize),
}

struct Routes {
    before: Vec<Action>,
    after: Vec<Action>,
    matchers: Vec<Matcher>,
    focus: Focus,
    settings: RouteSettings,
}

struct Shared {
    routes: RefCell<Routes>,
    stats: Cell<RouteStats>,
}

/// Ordered matchers and always-run before/after actions.
///
/// Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct RouteTable {
    shared: Rc<Shared>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::with_settings(RouteSettings::default())
    }

    pub fn with_settings(settings: RouteSettings) -> Self {
        Self {
            shared: Rc::new(Shared {
                routes: RefCell::new(Routes {
                    before: Vec::new(),
                    after: Vec::new(),
                    matchers: Vec::new(),
                    focus: Focus::Before,
                    settings,
                }),
                stats: Cell::new(RouteStats::default()),
            }),
        }
    }

    pub fn settings(&self) -> RouteSettings {
        self.shared.routes.borrow().settings
    }

    pub fn set_settings(&self, settings: RouteSettings) -> &Self {
        self.shared.routes.borrow_mut().settings = settings;
        self
    }

    pub fn stats(&self) -> RouteStats {
        self.shared.stats.get()
    }

    pub fn matcher_count(&self) -> usize {
        self.shared.routes.borrow().matchers.len()
    }

    /// Snapshot of the declared matchers, in priority order.
    pub fn matchers(&self) -> Vec<Matcher> {
        self.shared.routes.borrow().matchers.clone()
    }

    /// This table as a handler for an interceptor.
    pub fn handler(&self) -> Rc<dyn RequestHandler> {
        Rc::new(self.clone())
    }

    // Focus.

    /// Direct the following actions at the global before list.
    pub fn before(&self) -> &Self {
        self.shared.routes.borrow_mut().focus = Focus::Before;
        self
    }

    /// Direct the following actions at the global after list.
    pub fn after(&self) -> &Self {
        self.shared.routes.borrow_mut().focus = Focus::After;
        self
    }

    /// Append to the global before list without moving focus.
    pub fn add_before(&self, action: Action) -> &Self {
        self.shared.routes.borrow_mut().before.push(action);
        self
    }

    /// Append to the global after list without moving focus.
    pub fn add_after(&self, action: Action) -> &Self {
        self.shared.routes.borrow_mut().after.push(action);
        self
    }

    // Matchers.

    /// Start a matcher with unlimited uses.
    pub fn when(&self, condition: impl Into<Condition>) -> &Self {
        self.add_matcher(Matcher::new(condition.into()))
    }

    /// Alias of [`when`](Self::when).
    pub fn on(&self, condition: impl Into<Condition>) -> &Self {
        self.when(condition)
    }

    /// Start a matcher that accepts a single request.
    pub fn once(&self, condition: impl Into<Condition>) -> &Self {
        let mut matcher = Matcher::new(condition.into());
        matcher.remaining = Some(1);
        self.add_matcher(matcher)
    }

    /// Start a catch-all matcher. Declare it last.
    pub fn default_route(&self) -> &Self {
        self.add_matcher(Matcher::new(Condition::Any))
    }

    /// Limit the current matcher to `uses` requests.
    pub fn times(&self, uses: u32) -> &Self {
        self.with_current_matcher("times", |matcher| matcher.remaining = Some(uses))
    }

    /// Name the current matcher in logs.
    pub fn named(&self, id: impl Into<String>) -> &Self {
        let id = id.into();
        self.with_current_matcher("named", move |matcher| matcher.id = Some(id))
    }

    pub fn add_matcher(&self, matcher: Matcher) -> &Self {
        let mut routes = self.shared.routes.borrow_mut();
        routes.matchers.push(matcher);
        routes.focus = Focus::Matcher(routes.matchers.len() - 1);
        drop(routes);
        self
    }

    // Actions.

    /// Append `action` to the list in focus.
    pub fn action(&self, action: Action) -> &Self {
        let mut routes = self.shared.routes.borrow_mut();
        match routes.focus {
            Focus::Before => routes.before.push(action),
            Focus::After => routes.after.push(action),
            Focus::Matcher(index) => routes.matchers[index].actions.push(action),
        }
        drop(routes);
        self
    }

    /// Append a hand-written action; it must call `next` exactly once.
    pub fn compute(&self, f: impl Fn(&ClientRequest, &IncomingMessage, Next) + 'static) -> &Self {
        self.action(Action::compute(f))
    }

    /// Wait `ms` milliseconds on the installed scheduler.
    pub fn delay(&self, ms: u64) -> &Self {
        self.action(Action::Delay(ms))
    }

    /// Fail the request with `err`.
    pub fn throw(&self, err: impl Into<RequestError>) -> &Self {
        self.action(Action::Throw(err.into()))
    }

    /// Fire a named event on the response.
    pub fn emit(&self, event: impl Into<String>, args: Vec<Value>) -> &Self {
        self.action(Action::Emit {
            event: event.into(),
            args,
        })
    }

    /// Append a body chunk.
    pub fn write(&self, chunk: impl Into<Bytes>) -> &Self {
        self.action(Action::Write {
            chunk: chunk.into(),
            then: None,
        })
    }

    /// Append a body chunk given as text in `encoding`.
    pub fn write_encoded(&self, text: &str, encoding: &str) -> Result<&Self, MockError> {
        let chunk = decode(text.as_bytes(), encoding)?;
        Ok(self.write(chunk))
    }

    /// Append a body chunk, then call `then`.
    pub fn write_then(&self, chunk: impl Into<Bytes>, then: impl Fn() + 'static) -> &Self {
        self.action(Action::Write {
            chunk: chunk.into(),
            then: Some(Rc::new(then)),
        })
    }

    /// [`write_encoded`](Self::write_encoded) followed by a callback.
    pub fn write_encoded_then(
        &self,
        text: &str,
        encoding: &str,
        then: impl Fn() + 'static,
    ) -> Result<&Self, MockError> {
        let chunk = decode(text.as_bytes(), encoding)?;
        Ok(self.write_then(chunk, then))
    }

    /// Set the status (if given) and merge headers.
    pub fn write_head(&self, status: impl Into<Option<u16>>, headers: impl Into<Headers>) -> &Self {
        self.action(Action::WriteHead {
            status: status.into(),
            headers: headers.into(),
        })
    }

    /// End the response.
    pub fn end(&self) -> &Self {
        self.action(Action::End {
            status: None,
            body: None,
        })
    }

    pub fn end_with_status(&self, status: u16) -> &Self {
        self.action(Action::End {
            status: Some(status),
            body: None,
        })
    }

    pub fn end_with_body(&self, body: impl Into<Bytes>) -> &Self {
        self.action(Action::End {
            status: None,
            body: Some(body.into()),
        })
    }

    pub fn end_with(&self, status: u16, body: impl Into<Bytes>) -> &Self {
        self.action(Action::End {
            status: Some(status),
            body: Some(body.into()),
        })
    }

    /// Set the status, append `body` and end the response.
    pub fn send(&self, status: u16, body: impl Into<Bytes>) -> &Self {
        self.send_with_headers(status, body, Headers::new())
    }

    /// [`send`](Self::send) with status 200.
    pub fn send_body(&self, body: impl Into<Bytes>) -> &Self {
        self.send(200, body)
    }

    /// [`send`](Self::send) with an empty body.
    pub fn send_status(&self, status: u16) -> &Self {
        self.send(status, Bytes::new())
    }

    pub fn send_with_headers(
        &self,
        status: u16,
        body: impl Into<Bytes>,
        headers: impl Into<Headers>,
    ) -> &Self {
        self.action(Action::Send {
            status,
            body: body.into(),
            headers: headers.into(),
        })
    }

    /// A computed response; same as [`compute`](Self::compute).
    pub fn send_fn(&self, f: impl Fn(&ClientRequest, &IncomingMessage, Next) + 'static) -> &Self {
        self.compute(f)
    }

    /// Pass the request through to the real network, to its own URL.
    pub fn make_request(&self) -> &Self {
        self.make_request_with(Forward::new())
    }

    pub fn make_request_with(&self, forward: Forward) -> &Self {
        self.action(Action::Forward(forward))
    }

    fn with_current_matcher(&self, op: &str, f: impl FnOnce(&mut Matcher)) -> &Self {
        let mut routes = self.shared.routes.borrow_mut();
        match routes.focus {
            Focus::Matcher(index) => f(&mut routes.matchers[index]),
            focus => warn!(op, ?focus, "no matcher in focus, ignoring"),
        }
        drop(routes);
        self
    }

    /// Pick the first live matcher that accepts the exchange and use it up
    /// once. Returns its label and actions.
    fn select(&self, req: &ClientRequest, res: &IncomingMessage) -> Option<(String, Vec<Action>)> {
        // Predicates are user code; test them without holding the borrow.
        let candidates: Vec<(usize, Condition)> = self
            .shared
            .routes
            .borrow()
            .matchers
            .iter()
            .enumerate()
            .filter(|(_, matcher)| !matcher.is_exhausted())
            .map(|(index, matcher)| (index, matcher.condition.clone()))
            .collect();

        let index = candidates
            .into_iter()
            .find(|(_, condition)| condition.matches(req, res))
            .map(|(index, _)| index)?;

        let mut routes = self.shared.routes.borrow_mut();
        let matcher = &mut routes.matchers[index];
        matcher.consume();
        if matcher.is_exhausted() {
            debug!(route = %matcher.label(), "route used up");
        }
        Some((matcher.label(), matcher.actions.clone()))
    }

    fn count(&self, matched: bool) {
        let mut stats = self.shared.stats.get();
        stats.requests += 1;
        if matched {
            stats.matched += 1;
        } else {
            stats.unmatched += 1;
        }
        self.shared.stats.set(stats);
    }

    fn dispatch(&self, req: ClientRequest, res: IncomingMessage) {
        let settings = self.settings();

        let Some((route, actions)) = self.select(&req, &res) else {
            self.count(false);
            let url = req.url();
            if settings.log_unmatched {
                warn!(method = %req.method(), url = %url, "No route matched request");
            }
            req.mark_complete();
            req.emit_error(RequestError::NoRoute { url });
            return;
        };

        self.count(true);
        if settings.log_matches {
            info!(route = %route, method = %req.method(), url = %req.url(), "Request matched route");
        }

        let (before, after) = {
            let routes = self.shared.routes.borrow();
            (routes.before.clone(), routes.after.clone())
        };
        Pipeline::new(req, res, before, actions, after).start();
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestHandler for RouteTable {
    /// Dispatch once the caller has finished writing the request body.
    fn handle(&self, req: ClientRequest, res: IncomingMessage) {
        let table = self.clone();
        let request = req.clone();
        req.when_ended(move || table.dispatch(request, res));
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes = self.shared.routes.borrow();
        f.debug_struct("RouteTable")
            .field("before", &routes.before.len())
            .field("matchers", &routes.matchers)
            .field("after", &routes.after.len())
            .field("focus", &routes.focus)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri::RequestOptions;

    fn exchange(url: &str) -> (ClientRequest, IncomingMessage) {
        let req = ClientRequest::new(RequestOptions::from_url(url), None);
        let res = req.response();
        (req, res)
    }

    fn accepts(condition: impl Into<Condition>, url: &str) -> bool {
        let (req, res) = exchange(url);
        condition.into().matches(&req, &res)
    }

    #[test]
    fn test_exact_condition_forms() {
        let url = "POST:http://localhost:1337/test/page?a=1";
        assert!(accepts("/test/page", url));
        assert!(accepts("POST:/test/page", url));
        assert!(accepts("http://localhost:1337/test/page?a=1", url));
        assert!(accepts("POST:http://localhost:1337/test/page?a=1", url));
        assert!(!accepts("GET:/test/page", url));
        assert!(!accepts("/test", url));
    }

    #[test]
    fn test_exact_condition_on_built_url() {
        let options = RequestOptions::new().hostname("api.test").port(8080).path("/v1?x=1");
        let req = ClientRequest::new(options, None);
        let res = req.response();
        assert!(Condition::from("http://api.test:8080/v1").matches(&req, &res));
        assert!(Condition::from("GET:http://api.test:8080/v1").matches(&req, &res));
    }

    #[test]
    fn test_regex_and_glob_conditions() {
        let url = "DELETE:http://api.test/items/42";
        assert!(accepts(Condition::regex(r"/items/\d+$").unwrap(), url));
        assert!(accepts(Condition::regex(r"^DELETE:").unwrap(), url));
        assert!(!accepts(Condition::regex(r"^GET:").unwrap(), url));
        assert!(accepts(Condition::glob("/items/*").unwrap(), url));
        assert!(!accepts(Condition::glob("/users/*").unwrap(), url));
    }

    #[test]
    fn test_invalid_regex_is_rejected_at_declaration() {
        let err = Condition::regex("(unclosed").unwrap_err();
        assert!(matches!(err, MockError::InvalidMatcher { .. }));
        assert!(err.to_string().starts_with("when-condition not recognized"));
    }

    #[test]
    fn test_first_declared_match_wins() {
        let routes = RouteTable::new();
        routes.when("/a").named("first").send_body("1");
        routes.when(Condition::Any).named("second").send_body("2");

        let (req, res) = exchange("http://localhost/a");
        let (label, actions) = routes.select(&req, &res).unwrap();
        assert_eq!(label, "first");
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn test_once_and_times_exhaust() {
        let routes = RouteTable::new();
        routes.once("/x").named("once");
        routes.when("/x").named("twice").times(2);

        let (req, res) = exchange("http://localhost/x");
        let picks: Vec<Option<String>> = (0..4)
            .map(|_| routes.select(&req, &res).map(|(label, _)| label))
            .collect();
        assert_eq!(
            picks,
            vec![
                Some("once".to_string()),
                Some("twice".to_string()),
                Some("twice".to_string()),
                None
            ]
        );
        assert!(routes.matchers().iter().all(Matcher::is_exhausted));
    }

    #[test]
    fn test_builder_focus() {
        let routes = RouteTable::new();
        routes.delay(1);
        routes.when("/a").send_status(200);
        routes.add_before(Action::Delay(2));
        routes.write("still on /a");
        routes.after().end();
        routes.before().delay(3);

        let tables = routes.shared.routes.borrow();
        assert_eq!(tables.before.len(), 3);
        assert_eq!(tables.after.len(), 1);
        assert_eq!(tables.matchers[0].actions.len(), 2);
    }

    #[test]
    fn test_times_without_matcher_is_ignored() {
        let routes = RouteTable::new();
        routes.times(3).write("to before");
        assert_eq!(routes.matcher_count(), 0);
        assert_eq!(routes.shared.routes.borrow().before.len(), 1);
    }

    #[test]
    fn test_write_encoded_rejects_bad_input() {
        let routes = RouteTable::new();
        routes.when("/bin");
        assert!(routes.write_encoded("aGVsbG8=", "base64").is_ok());
        assert!(matches!(
            routes.write_encoded("%%%", "base64"),
            Err(MockError::InvalidEncoding { .. })
        ));
        assert_eq!(routes.matchers()[0].actions.len(), 1);
    }

    #[test]
    fn test_write_encoded_then_keeps_decoded_chunk_and_callback() {
        let routes = RouteTable::new();
        routes.when("/bin");
        routes.write_encoded_then("aGVsbG8=", "base64", || {}).unwrap();
        assert!(routes.write_encoded_then("zz", "hex-ish", || {}).is_err());

        let matchers = routes.matchers();
        assert_eq!(matchers[0].actions.len(), 1);
        match &matchers[0].actions[0] {
            Action::Write { chunk, then } => {
                assert_eq!(chunk.as_ref(), b"hello");
                assert!(then.is_some());
            }
            other => panic!("expected a write, got {other:?}"),
        }
    }
}
