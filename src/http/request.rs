//! The client-request side of a mocked exchange.

use super::response::IncomingMessage;
use super::Originals;
use crate::error::{MockError, RequestError};
use crate::headers::Headers;
use crate::timers::{self, TaskHandle};
use crate::uri::RequestOptions;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, warn};

/// Receives the response of a request, exactly once.
pub type ResponseCallback = Box<dyn FnOnce(IncomingMessage)>;

type ErrorListener = Rc<dyn Fn(&RequestError)>;

/// One `write` call as the caller made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
    /// Encoding the caller named, if any; `data` is still undecoded.
    pub encoding: Option<String>,
}

impl Chunk {
    /// The bytes this chunk stands for once its encoding is applied.
    pub fn decoded(&self) -> Result<Bytes, MockError> {
        match &self.encoding {
            Some(encoding) => decode(&self.data, encoding),
            None => Ok(self.data.clone()),
        }
    }
}

/// Decode `text` written with `encoding` (`utf8`, `base64`, `latin1`).
pub fn decode(text: &[u8], encoding: &str) -> Result<Bytes, MockError> {
    let invalid = |reason: String| MockError::InvalidEncoding {
        encoding: encoding.to_string(),
        reason,
    };

    match encoding.to_ascii_lowercase().as_str() {
        "utf8" | "utf-8" => Ok(Bytes::copy_from_slice(text)),
        "base64" => base64::engine::general_purpose::STANDARD
            .decode(text)
            .map(Bytes::from)
            .map_err(|e| invalid(e.to_string())),
        "latin1" | "binary" => {
            let text = std::str::from_utf8(text).map_err(|e| invalid(e.to_string()))?;
            text.chars()
                .map(|c| u8::try_from(u32::from(c)).map_err(|_| invalid(format!("{c:?} is outside latin1"))))
                .collect::<Result<Vec<u8>, _>>()
                .map(Bytes::from)
        }
        other => Err(invalid(format!("unknown encoding {other:?}"))),
    }
}

struct RequestState {
    options: RequestOptions,
    method: String,
    headers: Headers,
    /// `None` marks the end of the body.
    writes: Vec<Option<Chunk>>,
    destroyed: bool,
    completed: bool,
    deferred: bool,
    response: IncomingMessage,
    callback: Option<ResponseCallback>,
    originals: Option<Originals>,
    error_listeners: Vec<ErrorListener>,
    close_listeners: Vec<Rc<dyn Fn()>>,
    end_listeners: Vec<Box<dyn FnOnce()>>,
    timeout: Option<TaskHandle>,
}

/// Request object returned to the caller by a request factory.
///
/// Cloning yields another handle to the same request.
#[derive(Clone)]
pub struct ClientRequest {
    inner: Rc<RefCell<RequestState>>,
}

impl ClientRequest {
    /// A request that will hand `callback` its response.
    pub fn new(options: RequestOptions, callback: Option<ResponseCallback>) -> Self {
        let method = options.method_or_default();
        let headers = options.headers.clone();
        Self {
            inner: Rc::new(RefCell::new(RequestState {
                options,
                method,
                headers,
                writes: Vec::new(),
                destroyed: false,
                completed: false,
                deferred: false,
                response: IncomingMessage::new(),
                callback,
                originals: None,
                error_listeners: Vec::new(),
                close_listeners: Vec::new(),
                end_listeners: Vec::new(),
                timeout: None,
            })),
        }
    }

    pub(crate) fn with_originals(self, originals: Originals) -> Self {
        self.inner.borrow_mut().originals = Some(originals);
        self
    }

    /// The un-intercepted factories in effect when the request was made.
    pub fn originals(&self) -> Option<Originals> {
        self.inner.borrow().originals.clone()
    }

    /// Upper-case request method.
    pub fn method(&self) -> String {
        self.inner.borrow().method.clone()
    }

    /// Snapshot of the options the request was created with.
    pub fn options(&self) -> RequestOptions {
        self.inner.borrow().options.clone()
    }

    /// URL the request targets, as matching sees it.
    pub fn url(&self) -> String {
        self.inner.borrow().options.url()
    }

    pub fn pathname(&self) -> String {
        self.inner.borrow().options.pathname()
    }

    pub fn protocol(&self) -> String {
        self.inner
            .borrow()
            .options
            .protocol
            .clone()
            .unwrap_or_else(|| "http:".to_string())
    }

    pub fn set_header(&self, name: &str, value: impl Into<String>) {
        self.inner.borrow_mut().headers.set(name, value);
    }

    pub fn get_header(&self, name: &str) -> Option<String> {
        self.inner.borrow().headers.get(name).map(str::to_string)
    }

    pub fn remove_header(&self, name: &str) -> Option<String> {
        self.inner.borrow_mut().headers.remove(name)
    }

    pub fn headers(&self) -> Headers {
        self.inner.borrow().headers.clone()
    }

    /// The response this request will deliver unless a handler supplies
    /// another one.
    pub fn response(&self) -> IncomingMessage {
        self.inner.borrow().response.clone()
    }

    pub fn write(&self, data: impl Into<Bytes>) {
        self.record(Some(Chunk {
            data: data.into(),
            encoding: None,
        }));
    }

    pub fn write_with_encoding(&self, data: impl Into<Bytes>, encoding: &str) {
        self.record(Some(Chunk {
            data: data.into(),
            encoding: Some(encoding.to_string()),
        }));
    }

    /// Finish the request body.
    pub fn end(&self) {
        self.record(None);
    }

    /// Write a last chunk and finish the request body.
    pub fn end_with(&self, data: impl Into<Bytes>) {
        self.write(data);
        self.end();
    }

    /// Recorded writes, in order; `None` marks the end.
    pub fn writes(&self) -> Vec<Option<Chunk>> {
        self.inner.borrow().writes.clone()
    }

    /// Whether `end` has been called.
    pub fn is_ended(&self) -> bool {
        matches!(self.inner.borrow().writes.last(), Some(None))
    }

    /// The request body written so far, decoded. Chunks that do not decode
    /// are taken as raw bytes.
    pub fn body(&self) -> Bytes {
        let state = self.inner.borrow();
        let mut body = BytesMut::new();
        for chunk in state.writes.iter().flatten() {
            match chunk.decoded() {
                Ok(bytes) => body.extend_from_slice(&bytes),
                Err(_) => body.extend_from_slice(&chunk.data),
            }
        }
        body.freeze()
    }

    /// Cancel the request.
    ///
    /// Drops the recorded writes and, on the next scheduler turn, emits an
    /// [`RequestError::Aborted`] error followed by `close`. Later writes and
    /// response delivery are ignored. Only the first call has any effect.
    pub fn abort(&self) {
        let timeout = {
            let mut state = self.inner.borrow_mut();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.writes.clear();
            state.end_listeners.clear();
            state.timeout.take()
        };
        if let Some(timeout) = timeout {
            timeout.cancel();
        }
        debug!(url = %self.url(), "request aborted");

        let req = self.clone();
        timers::schedule_asap(move || {
            req.emit_error(RequestError::Aborted);
            req.emit_close();
        });
    }

    /// Same as [`abort`](Self::abort); the socket-level spelling.
    pub fn destroy(&self) {
        self.abort();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.borrow().destroyed
    }

    pub fn on_error(&self, listener: impl Fn(&RequestError) + 'static) {
        self.inner
            .borrow_mut()
            .error_listeners
            .push(Rc::new(listener));
    }

    pub fn on_close(&self, listener: impl Fn() + 'static) {
        self.inner
            .borrow_mut()
            .close_listeners
            .push(Rc::new(listener));
    }

    /// Deliver `err` to the error listeners.
    pub fn emit_error(&self, err: RequestError) {
        let listeners = self.inner.borrow().error_listeners.clone();
        if listeners.is_empty() {
            warn!(url = %self.url(), error = %err, "unhandled request error");
            return;
        }
        for listener in &listeners {
            listener(&err);
        }
    }

    fn emit_close(&self) {
        let listeners = self.inner.borrow().close_listeners.clone();
        for listener in &listeners {
            listener();
        }
    }

    /// Call `listener` if the response has not completed `ms` milliseconds
    /// from now, on the scheduler currently installed.
    pub fn set_timeout(&self, ms: u64, listener: impl FnOnce() + 'static) {
        let req = self.clone();
        let handle = timers::schedule_after(
            move || {
                let fire = {
                    let state = req.inner.borrow();
                    !state.completed && !state.destroyed
                };
                if fire {
                    listener();
                }
            },
            ms,
        );
        let previous = self.inner.borrow_mut().timeout.replace(handle);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Hand `res` (or the default response) to the response callback.
    ///
    /// Only the first call delivers; a destroyed request delivers nothing.
    pub fn respond(&self, res: Option<IncomingMessage>) {
        let (callback, default) = {
            let mut state = self.inner.borrow_mut();
            if state.destroyed {
                return;
            }
            (state.callback.take(), state.response.clone())
        };
        if let Some(callback) = callback {
            callback(res.unwrap_or(default));
        }
    }

    /// Stop the pipeline from delivering the response on its own; whoever
    /// deferred it calls [`respond`](Self::respond).
    pub fn defer_response(&self) {
        self.inner.borrow_mut().deferred = true;
    }

    pub(crate) fn respond_unless_deferred(&self) {
        let deferred = self.inner.borrow().deferred;
        if !deferred {
            self.respond(None);
        }
    }

    pub fn has_responded(&self) -> bool {
        self.inner.borrow().callback.is_none()
    }

    pub(crate) fn mark_complete(&self) {
        let timeout = {
            let mut state = self.inner.borrow_mut();
            state.completed = true;
            state.timeout.take()
        };
        if let Some(timeout) = timeout {
            timeout.cancel();
        }
    }

    /// Run `f` once the caller has called `end`, right away if it has.
    pub(crate) fn when_ended(&self, f: impl FnOnce() + 'static) {
        if self.is_ended() {
            f();
        } else if !self.is_destroyed() {
            self.inner.borrow_mut().end_listeners.push(Box::new(f));
        }
    }

    fn record(&self, chunk: Option<Chunk>) {
        let listeners = {
            let mut state = self.inner.borrow_mut();
            if state.destroyed {
                debug!("ignoring write on destroyed request");
                return;
            }
            if matches!(state.writes.last(), Some(None)) {
                debug!("ignoring write after end");
                return;
            }
            let ended = chunk.is_none();
            state.writes.push(chunk);
            if !ended {
                return;
            }
            std::mem::take(&mut state.end_listeners)
        };
        for listener in listeners {
            listener();
        }
    }
}

impl fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("ClientRequest")
            .field("method", &state.method)
            .field("url", &state.options.url())
            .field("writes", &state.writes.len())
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn request(url: &str) -> ClientRequest {
        ClientRequest::new(RequestOptions::from_url(url), None)
    }

    #[test]
    fn test_writes_are_recorded_with_end_sentinel() {
        let req = request("POST:http://localhost/upload");
        req.write("a");
        req.write_with_encoding("Yg==", "base64");
        req.end_with("c");
        req.write("ignored");

        let writes = req.writes();
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[1].as_ref().and_then(|c| c.encoding.as_deref()), Some("base64"));
        assert_eq!(writes[3], None);
        assert!(req.is_ended());
        assert_eq!(req.body(), Bytes::from_static(b"abc"));
        assert_eq!(req.method(), "POST");
    }

    #[test]
    fn test_headers_fold_case() {
        let options = RequestOptions::from_url("http://localhost/").header("X-Init", "1");
        let req = ClientRequest::new(options, None);
        req.set_header("x-init", "2");
        req.set_header("Accept", "*/*");
        assert_eq!(req.get_header("X-INIT").as_deref(), Some("2"));
        assert_eq!(req.remove_header("accept").as_deref(), Some("*/*"));
        assert_eq!(req.headers().len(), 1);
    }

    #[test]
    fn test_respond_delivers_exactly_once() {
        let delivered = Rc::new(Cell::new(0));
        let d = delivered.clone();
        let req = ClientRequest::new(
            RequestOptions::from_url("http://localhost/"),
            Some(Box::new(move |_res| d.set(d.get() + 1))),
        );
        req.respond(None);
        req.respond(Some(IncomingMessage::new()));
        assert_eq!(delivered.get(), 1);
        assert!(req.has_responded());
    }

    #[test]
    fn test_deferred_response_is_not_auto_delivered() {
        let delivered = Rc::new(Cell::new(false));
        let d = delivered.clone();
        let req = ClientRequest::new(
            RequestOptions::from_url("http://localhost/"),
            Some(Box::new(move |_res| d.set(true))),
        );
        req.defer_response();
        req.respond_unless_deferred();
        assert!(!delivered.get());
        req.respond(None);
        assert!(delivered.get());
    }

    #[test]
    fn test_abort_emits_reset_then_close_once() {
        let clock = timers::mock_timers();
        let req = request("http://localhost/slow");
        req.write("partial");

        let events = Rc::new(RefCell::new(Vec::new()));
        let e = events.clone();
        req.on_error(move |err| e.borrow_mut().push(format!("error:{}", err.code().unwrap_or("-"))));
        let e = events.clone();
        req.on_close(move || e.borrow_mut().push("close".to_string()));

        req.abort();
        req.destroy();
        req.write("after");
        assert!(req.writes().is_empty());
        assert!(events.borrow().is_empty());

        clock.advance(0).unwrap();
        assert_eq!(*events.borrow(), vec!["error:ECONNRESET", "close"]);
        timers::unmock_timers();
    }

    #[test]
    fn test_when_ended_waits_for_end() {
        let req = request("http://localhost/");
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        req.when_ended(move || f.set(true));
        req.write("x");
        assert!(!fired.get());
        req.end();
        assert!(fired.get());
    }

    #[test]
    fn test_timeout_fires_only_while_incomplete() {
        let clock = timers::mock_timers();
        let fired = Rc::new(Cell::new(0));

        let slow = request("http://localhost/slow");
        let f = fired.clone();
        slow.set_timeout(10, move || f.set(f.get() + 1));

        let fast = request("http://localhost/fast");
        let f = fired.clone();
        fast.set_timeout(10, move || f.set(f.get() + 100));
        fast.mark_complete();

        clock.advance(10).unwrap();
        assert_eq!(fired.get(), 1);
        timers::unmock_timers();
    }

    #[test]
    fn test_decode_encodings() {
        assert_eq!(decode(b"hi", "utf8").unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(decode(b"aGk=", "base64").unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(decode("\u{e9}".as_bytes(), "latin1").unwrap(), Bytes::from_static(&[0xe9]));
        assert!(matches!(
            decode(b"x", "utf16"),
            Err(MockError::InvalidEncoding { .. })
        ));
        assert!(decode("\u{20ac}".as_bytes(), "latin1").is_err());
    }
}
