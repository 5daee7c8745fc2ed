//! Request options and URL helpers.
//!
//! A mocked request is described by a [`RequestOptions`] bag, the same shape
//! callers hand to an ordinary HTTP client. Route matching needs the URL the
//! real client would have used, which [`build_url`] reconstructs.

use crate::headers::Headers;
use url::Url;

/// Options describing an outbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Full URL as given by the caller; used verbatim when present.
    pub href: Option<String>,
    /// Scheme with trailing colon, e.g. `http:`.
    pub protocol: Option<String>,
    pub hostname: Option<String>,
    /// Host, possibly with a port suffix.
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Path including any query string.
    pub path: Option<String>,
    pub method: Option<String>,
    pub headers: Headers,
    /// `user:password` credentials.
    pub auth: Option<String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a URL, optionally annotated with a `METHOD:` prefix.
    ///
    /// Strings that are not absolute URLs are treated as a bare path when
    /// they start with `/`, and otherwise yield empty options.
    pub fn from_url(input: &str) -> Self {
        let (method, target) = split_method(input);
        let mut options = match Url::parse(target) {
            Ok(url) => Self::from(url),
            Err(_) if target.starts_with('/') => Self {
                path: Some(target.to_string()),
                ..Self::default()
            },
            Err(_) => Self::default(),
        };
        options.method = method.map(str::to_string);
        options
    }

    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    #[must_use]
    pub fn auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    /// Request method, defaulting to `GET`.
    pub fn method_or_default(&self) -> String {
        self.method
            .as_deref()
            .map(str::to_uppercase)
            .unwrap_or_else(|| "GET".to_string())
    }

    /// Path with the query string stripped, `/` when empty.
    pub fn pathname(&self) -> String {
        let path = self.path.as_deref().unwrap_or("");
        let end = path.find(['?', '#']).unwrap_or(path.len());
        match &path[..end] {
            "" => "/".to_string(),
            pathname => pathname.to_string(),
        }
    }

    /// Query string without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        let path = self.path.as_deref()?;
        let (_, rest) = path.split_once('?')?;
        Some(rest.split('#').next().unwrap_or(rest))
    }

    /// URL the request would be sent to; see [`build_url`].
    pub fn url(&self) -> String {
        build_url(self)
    }
}

impl From<Url> for RequestOptions {
    fn from(url: Url) -> Self {
        let hostname = url.host_str().map(str::to_string);
        let host = hostname.as_ref().map(|name| match url.port() {
            Some(port) => format!("{name}:{port}"),
            None => name.clone(),
        });
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        let auth = match (url.username(), url.password()) {
            ("", None) => None,
            (user, Some(password)) => Some(format!("{user}:{password}")),
            (user, None) => Some(user.to_string()),
        };

        Self {
            href: Some(url.as_str().to_string()),
            protocol: Some(format!("{}:", url.scheme())),
            hostname,
            host,
            port: url.port(),
            path: Some(path),
            method: None,
            headers: Headers::new(),
            auth,
        }
    }
}

impl From<&str> for RequestOptions {
    fn from(input: &str) -> Self {
        Self::from_url(input)
    }
}

impl From<String> for RequestOptions {
    fn from(input: String) -> Self {
        Self::from_url(&input)
    }
}

impl From<&String> for RequestOptions {
    fn from(input: &String) -> Self {
        Self::from_url(input)
    }
}

/// Reconstruct the externally visible URL of a request.
///
/// `href` wins when present. Otherwise the URL is
/// `protocol//hostname[:port]pathname`, with `hostname` falling back to
/// `host` and then `localhost`, and the port included only when given.
pub fn build_url(options: &RequestOptions) -> String {
    if let Some(href) = &options.href {
        return href.clone();
    }

    let protocol = options.protocol.as_deref().unwrap_or("http:");
    let hostname = options
        .hostname
        .as_deref()
        .or(options.host.as_deref())
        .unwrap_or("localhost");
    match options.port {
        Some(port) => format!("{protocol}//{hostname}:{port}{}", options.pathname()),
        None => format!("{protocol}//{hostname}{}", options.pathname()),
    }
}

/// A URL with an optional explicit method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedUri {
    pub method: Option<String>,
    pub url: Url,
}

/// Parse `METHOD:scheme://...` (or a plain URL) into its method and URL.
pub fn parse_annotated(input: &str) -> Result<AnnotatedUri, url::ParseError> {
    let (method, target) = split_method(input);
    Ok(AnnotatedUri {
        method: method.map(str::to_string),
        url: Url::parse(target)?,
    })
}

/// Split a leading `METHOD:` annotation off a URL or path.
///
/// A prefix counts as a method only when it is all uppercase letters and is
/// followed by a scheme (`x://`) or a bare path (`/x`).
fn split_method(input: &str) -> (Option<&str>, &str) {
    if let Some((prefix, rest)) = input.split_once(':') {
        let is_method = !prefix.is_empty() && prefix.bytes().all(|b| b.is_ascii_uppercase());
        let is_target = rest.contains("://") || (rest.starts_with('/') && !rest.starts_with("//"));
        if is_method && is_target {
            return (Some(prefix), rest);
        }
    }
    (None, input)
}
