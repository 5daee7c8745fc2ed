//! The incoming-response side of a mocked exchange.

use crate::headers::Headers;
use bytes::{Bytes, BytesMut};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use tracing::debug;

type DataListener = Rc<dyn Fn(&Bytes)>;
type EventListener = Rc<dyn Fn(&[Value])>;

#[derive(Default)]
struct ResponseState {
    status_code: Option<u16>,
    headers: Headers,
    /// Chunks pushed before anyone listened for data.
    buffered: VecDeque<Bytes>,
    received: Vec<Bytes>,
    ended: bool,
    data_listeners: Vec<DataListener>,
    end_listeners: Vec<Box<dyn FnOnce()>>,
    events: HashMap<String, Vec<EventListener>>,
}

/// Response handed to the caller's response callback.
///
/// Body chunks pushed before the first data listener is attached are held
/// back and replayed to that listener. End-of-stream is signalled once, when
/// the end sentinel is pushed; end listeners attached later run immediately.
#[derive(Clone, Default)]
pub struct IncomingMessage {
    inner: Rc<RefCell<ResponseState>>,
}

impl IncomingMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until something sets it.
    pub fn status_code(&self) -> Option<u16> {
        self.inner.borrow().status_code
    }

    pub fn set_status_code(&self, status: u16) {
        self.inner.borrow_mut().status_code = Some(status);
    }

    pub fn headers(&self) -> Headers {
        self.inner.borrow().headers.clone()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.inner.borrow().headers.get(name).map(str::to_string)
    }

    pub fn set_header(&self, name: &str, value: impl Into<String>) {
        self.inner.borrow_mut().headers.set(name, value);
    }

    /// Merge `headers` in; same-named entries are overwritten.
    pub fn merge_headers(&self, headers: &Headers) {
        self.inner.borrow_mut().headers.merge(headers);
    }

    /// Append a body chunk, or end the stream with `None`.
    ///
    /// Pushes after the end are ignored.
    pub fn push(&self, chunk: Option<Bytes>) {
        match chunk {
            Some(chunk) => self.push_chunk(chunk),
            None => self.push_end(),
        }
    }

    /// End the stream unless it already ended.
    pub fn finish(&self) {
        if !self.is_complete() {
            self.push_end();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.inner.borrow().ended
    }

    /// Every chunk pushed so far, concatenated.
    pub fn body(&self) -> Bytes {
        let state = self.inner.borrow();
        let mut body = BytesMut::new();
        for chunk in &state.received {
            body.extend_from_slice(chunk);
        }
        body.freeze()
    }

    /// [`body`](Self::body) as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body()).into_owned()
    }

    /// Listen for body chunks. The first listener receives any held-back
    /// chunks straight away.
    pub fn on_data(&self, listener: impl Fn(&Bytes) + 'static) {
        let listener: DataListener = Rc::new(listener);
        let held: Vec<Bytes> = {
            let mut state = self.inner.borrow_mut();
            state.data_listeners.push(listener.clone());
            state.buffered.drain(..).collect()
        };
        for chunk in &held {
            listener(chunk);
        }
    }

    pub fn on_end(&self, listener: impl FnOnce() + 'static) {
        let ended = self.inner.borrow().ended;
        if ended {
            listener();
        } else {
            self.inner.borrow_mut().end_listeners.push(Box::new(listener));
        }
    }

    /// Listen for a named event fired with [`emit`](Self::emit).
    pub fn on(&self, event: &str, listener: impl Fn(&[Value]) + 'static) {
        self.inner
            .borrow_mut()
            .events
            .entry(event.to_string())
            .or_default()
            .push(Rc::new(listener));
    }

    /// Fire a named event synchronously. Returns whether anyone listened.
    pub fn emit(&self, event: &str, args: &[Value]) -> bool {
        let listeners = self
            .inner
            .borrow()
            .events
            .get(event)
            .cloned()
            .unwrap_or_default();
        for listener in &listeners {
            listener(args);
        }
        !listeners.is_empty()
    }

    fn push_chunk(&self, chunk: Bytes) {
        let listeners = {
            let mut state = self.inner.borrow_mut();
            if state.ended {
                debug!(len = chunk.len(), "dropping chunk pushed after end of response");
                return;
            }
            state.received.push(chunk.clone());
            if state.data_listeners.is_empty() {
                state.buffered.push_back(chunk);
                return;
            }
            state.data_listeners.clone()
        };
        for listener in &listeners {
            listener(&chunk);
        }
    }

    fn push_end(&self) {
        let listeners = {
            let mut state = self.inner.borrow_mut();
            if state.ended {
                return;
            }
            state.ended = true;
            std::mem::take(&mut state.end_listeners)
        };
        for listener in listeners {
            listener();
        }
    }
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("IncomingMessage")
            .field("status_code", &state.status_code)
            .field("headers", &state.headers)
            .field("chunks", &state.received.len())
            .field("ended", &state.ended)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_chunks_are_held_until_first_data_listener() {
        let res = IncomingMessage::new();
        res.push(Some(Bytes::from_static(b"he")));
        res.push(Some(Bytes::from_static(b"llo")));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        res.on_data(move |chunk| s.borrow_mut().push(chunk.clone()));
        assert_eq!(seen.borrow().len(), 2);

        res.push(Some(Bytes::from_static(b"!")));
        assert_eq!(seen.borrow().len(), 3);
        assert_eq!(res.text(), "hello!");
    }

    #[test]
    fn test_end_fires_once_and_late_listeners_run_immediately() {
        let res = IncomingMessage::new();
        let ends = Rc::new(Cell::new(0));

        let e = ends.clone();
        res.on_end(move || e.set(e.get() + 1));
        res.push(None);
        res.finish();
        res.push(None);
        assert_eq!(ends.get(), 1);

        let e = ends.clone();
        res.on_end(move || e.set(e.get() + 1));
        assert_eq!(ends.get(), 2);
    }

    #[test]
    fn test_push_after_end_is_ignored() {
        let res = IncomingMessage::new();
        res.push(Some(Bytes::from_static(b"body")));
        res.finish();
        res.push(Some(Bytes::from_static(b"late")));
        assert_eq!(res.text(), "body");
        assert!(res.is_complete());
    }

    #[test]
    fn test_named_events() {
        let res = IncomingMessage::new();
        let got = Rc::new(RefCell::new(Vec::new()));
        let g = got.clone();
        res.on("progress", move |args| g.borrow_mut().extend_from_slice(args));

        assert!(res.emit("progress", &[Value::from(1), Value::from("half")]));
        assert!(!res.emit("unheard", &[]));
        assert_eq!(*got.borrow(), vec![Value::from(1), Value::from("half")]);
    }

    #[test]
    fn test_status_and_headers() {
        let res = IncomingMessage::new();
        assert_eq!(res.status_code(), None);
        res.set_status_code(204);
        res.set_header("X-One", "1");
        res.merge_headers(&Headers::from([("x-one", "uno"), ("x-two", "2")]));
        assert_eq!(res.status_code(), Some(204));
        assert_eq!(res.header("X-ONE").as_deref(), Some("uno"));
        assert_eq!(res.headers().len(), 2);
    }
}
