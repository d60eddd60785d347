use crate::client::Client;
use log::debug;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use wxcore::net::{HttpError, HttpRequest, HttpResponse};
use wxcore::sync::BaseResponse;

/// Failures of a single call to the web service.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("http request failed: {0}")]
    Http(#[from] anyhow::Error),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("service rejected the request (ret={ret}): {message}")]
    Rejected { ret: i64, message: String },
}

impl RequestError {
    /// The transport failure behind this error, if it was one.
    pub fn http_error(&self) -> Option<&HttpError> {
        match self {
            RequestError::Http(e) => HttpError::find(e),
            _ => None,
        }
    }
}

/// Maps a non-zero `BaseResponse.Ret` to an error.
pub(crate) fn check_base_response(base: &BaseResponse) -> Result<(), RequestError> {
    if base.ret == 0 {
        Ok(())
    } else {
        Err(RequestError::Rejected {
            ret: base.ret,
            message: base.err_msg.clone(),
        })
    }
}

impl Client {
    /// Sends `request` with the session's cookies and user agent, and stores
    /// any cookies the response sets. Redirects are not followed.
    pub(crate) async fn send_request(
        &self,
        mut request: HttpRequest,
    ) -> Result<HttpResponse, RequestError> {
        request
            .headers
            .entry("User-Agent".to_string())
            .or_insert_with(|| self.config.user_agent.clone());
        if let Some(cookie) = self.cookies.read().await.header_value() {
            request.headers.insert("Cookie".to_string(), cookie);
        }
        if request.timeout.is_none() {
            request.timeout = Some(self.config.request_timeout);
        }

        debug!(target: "Client/Http", "--> {} {}", request.method, request.path());
        let response = self.http_client.execute(request).await?;
        debug!(target: "Client/Http", "<-- {}", response.status_code);

        let cookies = response.set_cookies();
        if !cookies.is_empty() {
            self.cookies.write().await.extend(cookies);
        }
        Ok(response)
    }

    /// GET returning the body as text. Redirect statuses count as success.
    pub(crate) async fn get_text(&self, request: HttpRequest) -> Result<String, RequestError> {
        let response = self.send_request(request).await?;
        if !response.is_success() && !response.is_redirect() {
            return Err(RequestError::Status(response.status_code));
        }
        Ok(response.body_string())
    }

    /// POSTs `body` as JSON and decodes a JSON answer.
    pub(crate) async fn post_json<B, R>(&self, url: String, body: &B) -> Result<R, RequestError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = HttpRequest::post(url)
            .with_header("Content-Type", "application/json; charset=UTF-8")
            .with_body(serde_json::to_vec(body)?);
        let response = self.send_request(request).await?;
        if !response.is_success() {
            return Err(RequestError::Status(response.status_code));
        }
        Ok(serde_json::from_str(&response.body_string())?)
    }
}
