use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Transport-level failure shapes an `HttpClient` implementation reports.
///
/// Implementations wrap their native errors in this type (inside the
/// `anyhow::Error` returned by [`HttpClient::execute`]) so callers can tell
/// a routine long-poll timeout from a dead connection without knowing which
/// HTTP library is in use.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The request did not complete within its timeout.
    #[error("request timed out")]
    Timeout,
    /// The server answered with something that is not a valid HTTP response,
    /// e.g. a bad status line. The sync endpoint is known to do this as a
    /// keep-alive.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    /// Connection refused, reset or otherwise lost.
    #[error("connection error: {0}")]
    Connection(String),
}

impl HttpError {
    /// Finds an `HttpError` anywhere in the chain of `err`.
    pub fn find(err: &anyhow::Error) -> Option<&HttpError> {
        err.chain().find_map(|e| e.downcast_ref::<HttpError>())
    }
}

/// A simple structure to represent an HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: String, // "GET" or "POST"
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    /// Overall deadline for this request. `None` uses the client default.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// URL path without scheme, host or query string.
    pub fn path(&self) -> &str {
        let without_scheme = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        let path = without_scheme
            .find('/')
            .map(|i| &without_scheme[i..])
            .unwrap_or("/");
        path.split(['?', '#']).next().unwrap_or(path)
    }
}

/// A simple structure for the HTTP response
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status_code: u16,
    /// Response headers in arrival order. Names may repeat (`Set-Cookie`).
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status_code)
    }

    /// Decodes the body as UTF-8, replacing invalid sequences.
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// First header value with the given (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `name=value` pairs of every `Set-Cookie` header. Attributes such as
    /// `Path` or `Expires` are dropped.
    pub fn set_cookies(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("set-cookie"))
            .filter_map(|(_, v)| {
                let pair = v.split(';').next()?.trim();
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), value.trim().to_string()))
            })
            .collect()
    }
}

/// Trait for executing HTTP requests in a runtime-agnostic way.
///
/// Implementations must not follow redirects: the login flow reads cookies
/// off the redirect response itself.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Executes a given HTTP request and returns the response.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}
