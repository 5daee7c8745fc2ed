//! Real network calls.
//!
//! [`NetworkFactory`] is what the request slots hold when nothing is
//! mocked, and what the forward action reaches through the saved originals.
//! Requests are sent with `reqwest` from a future spawned on the thread's
//! [`EventLoop`](crate::timers::EventLoop), so they make progress while that
//! loop runs.

use super::action::{Forward, Next};
use super::request::{ClientRequest, ResponseCallback};
use super::response::IncomingMessage;
use super::RequestFactory;
use crate::error::RequestError;
use crate::timers;
use crate::uri::RequestOptions;
use std::cell::{OnceCell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request factory backed by `reqwest`.
pub struct NetworkFactory {
    protocol: &'static str,
    client: OnceCell<reqwest::Client>,
}

impl NetworkFactory {
    pub fn new(protocol: &'static str) -> Self {
        Self {
            protocol,
            client: OnceCell::new(),
        }
    }

    fn client(&self) -> Result<reqwest::Client, reqwest::Error> {
        if let Some(client) = self.client.get() {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(self.client.get_or_init(|| client).clone())
    }
}

impl RequestFactory for NetworkFactory {
    fn request(&self, mut options: RequestOptions, callback: Option<ResponseCallback>) -> ClientRequest {
        if options.protocol.is_none() && options.href.is_none() {
            options.protocol = Some(self.protocol.to_string());
        }

        let req = ClientRequest::new(options, callback);
        let client = self.client();
        let exchange = req.clone();
        req.when_ended(move || {
            timers::runtime().spawn_local(async move {
                let result = match client {
                    Ok(client) => send(&client, &exchange).await,
                    Err(err) => Err(err.into()),
                };
                if let Err(err) = result {
                    exchange.emit_error(RequestError::Forward {
                        message: format!("{err:#}"),
                    });
                    exchange.response().finish();
                }
                exchange.mark_complete();
            });
        });
        req
    }
}

/// Split `user:password` credentials.
fn credentials(auth: &str) -> (&str, Option<&str>) {
    match auth.split_once(':') {
        Some((user, password)) => (user, Some(password)),
        None => (auth, None),
    }
}

async fn send(client: &reqwest::Client, req: &ClientRequest) -> anyhow::Result<()> {
    let method = reqwest::Method::from_bytes(req.method().as_bytes())?;
    let url = req.url();
    debug!(%method, %url, "sending request to network");

    let mut builder = client.request(method, &url);
    for (name, value) in req.headers().iter() {
        builder = builder.header(name, value);
    }
    if let Some(auth) = req.options().auth {
        let (user, password) = credentials(&auth);
        builder = builder.basic_auth(user, password);
    }

    let mut response = builder.body(req.body()).send().await?;

    let res = req.response();
    res.set_status_code(response.status().as_u16());
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            res.set_header(name.as_str(), value);
        }
    }
    req.respond(Some(res.clone()));

    while let Some(chunk) = response.chunk().await? {
        if req.is_destroyed() {
            debug!(%url, "request aborted, dropping response body");
            break;
        }
        res.push(Some(chunk));
    }
    res.finish();
    Ok(())
}

/// Pass a mocked request through the un-intercepted factories and relay
/// the real response onto the mocked one.
///
/// The mocked response is delivered once the real response headers arrive;
/// `next` runs when the real body ends or fails.
pub(crate) fn forward(req: &ClientRequest, res: &IncomingMessage, forward: &Forward, next: Next) {
    let Some(originals) = req.originals() else {
        return next.fail(RequestError::Forward {
            message: "request was not intercepted, nothing to forward through".to_string(),
        });
    };

    let mut options = match &forward.target {
        Some(target) => RequestOptions::from_url(target),
        None => req.options(),
    };
    if forward.target.is_none() || options.method.is_none() {
        options.method = Some(req.method());
    }
    let mut headers = req.headers();
    headers.merge(&forward.headers);
    options.headers = headers;

    let protocol = options
        .protocol
        .clone()
        .unwrap_or_else(|| req.protocol());
    debug!(url = %options.url(), "forwarding mocked request");

    let next = Rc::new(RefCell::new(Some(next)));
    let on_end = next.clone();
    let mock_req = req.clone();
    let mock_res = res.clone();
    let outbound = originals.for_protocol(&protocol).request(
        options,
        Some(Box::new(move |real: IncomingMessage| {
            if let Some(status) = real.status_code() {
                mock_res.set_status_code(status);
            }
            mock_res.merge_headers(&real.headers());
            mock_req.respond(Some(mock_res.clone()));

            let relay = mock_res.clone();
            let relay_req = mock_req.clone();
            real.on_data(move |chunk| {
                if !relay_req.is_destroyed() {
                    relay.push(Some(chunk.clone()));
                }
            });
            real.on_end(move || {
                let next = on_end.borrow_mut().take();
                if let Some(next) = next {
                    next.done();
                }
            });
        })),
    );

    let on_error = next;
    outbound.on_error(move |err| {
        let next = on_error.borrow_mut().take();
        if let Some(next) = next {
            next.fail(RequestError::Forward {
                message: err.to_string(),
            });
        }
    });

    // Closing the mocked request cancels the call it was forwarded to.
    let upstream = outbound.clone();
    req.on_close(move || upstream.abort());

    match &forward.body {
        Some(body) => {
            outbound.set_header("content-length", body.len().to_string());
            outbound.end_with(body.clone());
        }
        None => {
            for write in req.writes() {
                match write {
                    Some(chunk) => match &chunk.encoding {
                        Some(encoding) => outbound.write_with_encoding(chunk.data, encoding),
                        None => outbound.write(chunk.data),
                    },
                    None => outbound.end(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{self, client, InterceptedFactory, Originals};
    use bytes::Bytes;

    #[derive(Debug, Default, Clone)]
    struct Seen {
        method: String,
        url: String,
        body: Bytes,
        content_length: Option<String>,
        token: Option<String>,
    }

    /// Stand-in for the network: answers 201 with a fixed body.
    fn fake_network(seen: Rc<RefCell<Vec<Seen>>>, fail: bool) -> Originals {
        let handler = move |req: ClientRequest, res: IncomingMessage| {
            let seen = seen.clone();
            let request = req.clone();
            req.when_ended(move || {
                seen.borrow_mut().push(Seen {
                    method: request.method(),
                    url: request.url(),
                    body: request.body(),
                    content_length: request.get_header("content-length"),
                    token: request.get_header("x-token"),
                });
                if fail {
                    request.emit_error(RequestError::msg("connection refused"));
                    return;
                }
                res.set_status_code(201);
                res.set_header("X-Upstream", "yes");
                request.respond(Some(res.clone()));
                res.push(Some(Bytes::from_static(b"real ")));
                res.push(Some(Bytes::from_static(b"body")));
                res.finish();
            });
        };
        let handler: Rc<dyn http::RequestHandler> = Rc::new(handler);
        let stub = Originals {
            http: Rc::new(InterceptedFactory::new(handler.clone(), "http:", Originals::default())),
            https: Rc::new(InterceptedFactory::new(handler, "https:", Originals::default())),
        };
        http::replace_originals(stub)
    }

    struct Caller {
        response: Rc<RefCell<Option<IncomingMessage>>>,
        errors: Rc<RefCell<Vec<RequestError>>>,
    }

    fn call(url: &str, writes: &[&'static str]) -> Caller {
        let response = Rc::new(RefCell::new(None));
        let errors = Rc::new(RefCell::new(Vec::new()));
        let r = response.clone();
        let req = client::request(url, move |res| *r.borrow_mut() = Some(res));
        let e = errors.clone();
        req.on_error(move |err| e.borrow_mut().push(err.clone()));
        req.set_header("X-Token", "t0k");
        for chunk in writes {
            req.write(*chunk);
        }
        req.end();
        Caller { response, errors }
    }

    #[test]
    fn test_forward_replays_writes_and_relays_response() {
        let clock = timers::mock_timers();
        let seen = Rc::new(RefCell::new(Vec::new()));
        fake_network(seen.clone(), false);
        let routes = http::mock_http();
        routes.when("POST:/proxy").make_request();

        let caller = call("POST:http://origin.test/proxy", &["a=", "1"]);
        clock.advance(20).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].url, "http://origin.test/proxy");
        assert_eq!(seen[0].body, Bytes::from_static(b"a=1"));
        assert_eq!(seen[0].token.as_deref(), Some("t0k"));
        assert_eq!(seen[0].content_length, None);

        let res = caller.response.borrow().clone().unwrap();
        assert_eq!(res.status_code(), Some(201));
        assert_eq!(res.header("x-upstream").as_deref(), Some("yes"));
        assert_eq!(res.text(), "real body");
        assert!(res.is_complete());
        assert!(caller.errors.borrow().is_empty());

        http::unmock_http();
        timers::unmock_timers();
    }

    #[test]
    fn test_forward_to_explicit_target_with_body_override() {
        let clock = timers::mock_timers();
        let seen = Rc::new(RefCell::new(Vec::new()));
        fake_network(seen.clone(), false);
        let routes = http::mock_http();
        routes.default_route().make_request_with(
            Forward::new()
                .target("http://backend.test/v2")
                .body("override")
                .header("X-Token", "replaced"),
        );

        let caller = call("PUT:http://origin.test/v1", &["ignored"]);
        clock.advance(20).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen[0].method, "PUT");
        assert_eq!(seen[0].url, "http://backend.test/v2");
        assert_eq!(seen[0].body, Bytes::from_static(b"override"));
        assert_eq!(seen[0].content_length.as_deref(), Some("8"));
        assert_eq!(seen[0].token.as_deref(), Some("replaced"));
        assert_eq!(caller.response.borrow().as_ref().and_then(IncomingMessage::status_code), Some(201));

        http::unmock_http();
        timers::unmock_timers();
    }

    #[test]
    fn test_forward_failure_reaches_the_caller() {
        let clock = timers::mock_timers();
        fake_network(Rc::new(RefCell::new(Vec::new())), true);
        let routes = http::mock_http();
        routes.when("/down").make_request();

        let caller = call("http://origin.test/down", &[]);
        clock.advance(20).unwrap();

        let errors = caller.errors.borrow();
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], RequestError::Forward { message } if message == "connection refused"));
        assert!(caller.response.borrow().is_none());

        http::unmock_http();
        timers::unmock_timers();
    }

    #[test]
    fn test_abort_cancels_forwarded_call() {
        let clock = timers::mock_timers();
        let upstream: Rc<RefCell<Option<ClientRequest>>> = Rc::new(RefCell::new(None));
        let slot = upstream.clone();
        let silent = move |req: ClientRequest, _res: IncomingMessage| {
            *slot.borrow_mut() = Some(req);
        };
        let handler: Rc<dyn http::RequestHandler> = Rc::new(silent);
        http::replace_originals(Originals {
            http: Rc::new(InterceptedFactory::new(handler.clone(), "http:", Originals::default())),
            https: Rc::new(InterceptedFactory::new(handler, "https:", Originals::default())),
        });
        let routes = http::mock_http();
        routes.when("/hang").make_request();

        let errors = Rc::new(RefCell::new(Vec::new()));
        let req = client::get("http://origin.test/hang", |_| {});
        let e = errors.clone();
        req.on_error(move |err| e.borrow_mut().push(err.clone()));
        clock.advance(5).unwrap();

        let forwarded = upstream.borrow().clone().unwrap();
        assert!(!forwarded.is_destroyed());
        req.abort();
        clock.advance(5).unwrap();

        assert!(forwarded.is_destroyed());
        assert_eq!(errors.borrow().as_slice(), &[RequestError::Aborted]);

        http::unmock_http();
        timers::unmock_timers();
    }

    #[test]
    fn test_credentials_split() {
        assert_eq!(credentials("user:pw"), ("user", Some("pw")));
        assert_eq!(credentials("token"), ("token", None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_method_fails_before_sending() {
        let factory = NetworkFactory::new("http:");
        let errors = Rc::new(RefCell::new(Vec::new()));
        let options = RequestOptions::from_url("http://localhost/").method("NOT A METHOD");
        let req = factory.request(options, None);
        let e = errors.clone();
        req.on_error(move |err| e.borrow_mut().push(err.clone()));
        req.end();

        timers::runtime().run().await;
        let errors = errors.borrow();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], RequestError::Forward { .. }));
        assert!(req.response().is_complete());
    }
}
