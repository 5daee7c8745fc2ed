//! qmock
//!
//! Test doubles for event-driven code: HTTP requests answered by scripted
//! routes instead of the network, and a virtual clock that runs scheduled
//! callbacks only when a test advances it.
//!
//! # Features
//!
//! - **Route scripting**: exact, regex, glob and predicate conditions, each
//!   with an ordered list of actions (delay, write, send, emit, throw,
//!   forward to the real network)
//! - **Global hooks**: actions that run before and after every matched route
//! - **Use limits**: `once` and `times(n)` routes that fall through when used up
//! - **Virtual clock**: asap, delayed and repeating tasks on logical time,
//!   with recovery after a failing callback
//! - **Handler spy**: record the requests a handler sees
//! - **Route files**: the same scripting from YAML, with Handlebars bodies
//!
//! # Example
//!
//! ```
//! use qmock::{http, timers};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let clock = timers::mock_timers();
//! let routes = http::mock_http();
//! routes
//!     .when("GET:http://api.test/users")
//!     .delay(50)
//!     .send(200, r#"[{"id":1}]"#);
//!
//! let body = Rc::new(RefCell::new(String::new()));
//! let sink = body.clone();
//! http::client::get("http://api.test/users", move |res| {
//!     let res2 = res.clone();
//!     res.on_end(move || *sink.borrow_mut() = res2.text());
//! });
//!
//! clock.advance(49).unwrap();
//! assert!(body.borrow().is_empty());
//! clock.advance(10).unwrap();
//! assert_eq!(*body.borrow(), r#"[{"id":1}]"#);
//!
//! http::unmock_http();
//! timers::unmock_timers();
//! ```

pub mod config;
pub mod error;
pub mod headers;
pub mod http;
pub mod template;
pub mod timers;
pub mod uri;

pub use config::RouteConfig;
pub use error::{ClockError, MockError, RequestError};
pub use headers::Headers;
pub use http::{mock_http, mock_http_with, unmock_http, RouteTable};
pub use timers::{mock_timers, unmock_timers, VirtualClock};
pub use uri::RequestOptions;
