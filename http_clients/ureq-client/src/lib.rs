use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use std::time::Duration;
use ureq::Agent;
use wxcore::net::{HttpClient, HttpError, HttpRequest, HttpResponse};

/// Default overall deadline for requests that do not carry their own.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client implementation using `ureq` for synchronous HTTP requests.
/// Since `ureq` is blocking, all requests are wrapped in `tokio::task::spawn_blocking`.
///
/// Redirects are returned as-is and non-2xx statuses are not errors.
#[derive(Debug, Clone)]
pub struct UreqHttpClient {
    agent: Agent,
}

impl UreqHttpClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let agent: Agent = Agent::config_builder()
            .max_redirects(0)
            .max_redirects_will_error(false)
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self { agent }
    }
}

impl Default for UreqHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps `ureq` failures onto the transport shapes callers classify on.
fn classify(err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::Timeout(t) => {
            debug!(target: "Http/Ureq", "request timed out ({t})");
            HttpError::Timeout.into()
        }
        ureq::Error::Protocol(e) => HttpError::MalformedResponse(e.to_string()).into(),
        ureq::Error::Io(e) => HttpError::Connection(e.to_string()).into(),
        ureq::Error::ConnectionFailed => HttpError::Connection("connection failed".into()).into(),
        ureq::Error::HostNotFound => HttpError::Connection("host not found".into()).into(),
        other => anyhow::Error::new(other),
    }
}

#[async_trait]
impl HttpClient for UreqHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let agent = self.agent.clone();
        // Since ureq is blocking, we must use spawn_blocking
        tokio::task::spawn_blocking(move || {
            let response = match request.method.as_str() {
                "GET" => {
                    let mut req = agent.get(&request.url);
                    for (key, value) in &request.headers {
                        req = req.header(key, value);
                    }
                    if let Some(timeout) = request.timeout {
                        req = req.config().timeout_global(Some(timeout)).build();
                    }
                    req.call().map_err(classify)?
                }
                "POST" => {
                    let mut req = agent.post(&request.url);
                    for (key, value) in &request.headers {
                        req = req.header(key, value);
                    }
                    if let Some(timeout) = request.timeout {
                        req = req.config().timeout_global(Some(timeout)).build();
                    }
                    let body = request.body.unwrap_or_default();
                    req.send(&body[..]).map_err(classify)?
                }
                method => {
                    return Err(anyhow::anyhow!("Unsupported HTTP method: {}", method));
                }
            };

            let status_code = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();

            // Read the response body
            let mut body = response.into_body();
            let body_bytes = body.read_to_vec().map_err(classify)?;

            Ok(HttpResponse {
                status_code,
                headers,
                body: body_bytes,
            })
        })
        .await?
    }
}
