//! Scripted HTTP backend and client helpers for tests.

use crate::client::Client;
use crate::config::ClientConfig;
use crate::handlers::MessageRouter;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wxcore::login::{LoginDetail, RouteUrls};
use wxcore::net::{HttpClient, HttpError, HttpRequest, HttpResponse};
use wxcore::session::{Session, SessionBuilder};
use wxcore::sync::{SyncCursor, SyncKey, SyncKeyItem};

enum Scripted {
    Response(HttpResponse),
    Error(HttpError),
}

/// Answers requests from per-path queues. A path matches when the request
/// path ends with it. Once a queue is empty, the path's fallback response
/// is used, and without one the request fails.
#[derive(Default)]
pub struct ScriptedHttpClient {
    queues: Mutex<HashMap<String, VecDeque<Scripted>>>,
    fallbacks: Mutex<HashMap<String, HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttpClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, path: &str, item: Scripted) {
        self.queues
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(item);
    }

    pub fn push_response(&self, path: &str, response: HttpResponse) {
        self.push(path, Scripted::Response(response));
    }

    pub fn push_error(&self, path: &str, error: HttpError) {
        self.push(path, Scripted::Error(error));
    }

    pub fn set_fallback(&self, path: &str, response: HttpResponse) {
        self.fallbacks
            .lock()
            .unwrap()
            .insert(path.to_string(), response);
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path().ends_with(path))
            .count()
    }
}

#[async_trait::async_trait]
impl HttpClient for ScriptedHttpClient {
    async fn execute(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        let path = request.path().to_string();
        self.requests.lock().unwrap().push(request);

        let scripted = {
            let mut queues = self.queues.lock().unwrap();
            queues
                .iter_mut()
                .find(|(key, queue)| path.ends_with(key.as_str()) && !queue.is_empty())
                .and_then(|(_, queue)| queue.pop_front())
        };
        match scripted {
            Some(Scripted::Response(response)) => Ok(response),
            Some(Scripted::Error(error)) => Err(anyhow::Error::new(error)),
            None => {
                let fallbacks = self.fallbacks.lock().unwrap();
                fallbacks
                    .iter()
                    .find(|(key, _)| path.ends_with(key.as_str()))
                    .map(|(_, response)| response.clone())
                    .ok_or_else(|| {
                        anyhow::Error::new(HttpError::Connection(format!(
                            "no scripted response for {path}"
                        )))
                    })
            }
        }
    }
}

/// Config with short delays so loops finish quickly under test.
pub fn test_config() -> ClientConfig {
    ClientConfig::default()
        .with_retry_delay(Duration::from_millis(5))
        .with_login_poll_interval(Duration::from_millis(5))
        .with_session_save_delay(Duration::from_millis(50))
}

pub async fn create_test_client(http: Arc<ScriptedHttpClient>) -> Arc<Client> {
    create_test_client_with(test_config(), http, MessageRouter::new()).await
}

pub async fn create_test_client_with(
    config: ClientConfig,
    http: Arc<ScriptedHttpClient>,
    router: MessageRouter,
) -> Arc<Client> {
    let _ = env_logger::builder().is_test(true).try_init();
    Client::new(config, http, router)
        .await
        .expect("test client should build")
}

/// A complete session on the `wx2.qq.com` route, logged in as `@me`.
pub fn sample_session() -> Session {
    SessionBuilder::new()
        .urls(RouteUrls::from_redirect(
            "https://wx2.qq.com/cgi-bin/mmwebwx-bin/webwxnewloginpage",
        ))
        .detail(LoginDetail {
            skey: "@crypt_abc".into(),
            wxsid: "sid".into(),
            wxuin: "1234".into(),
            pass_ticket: "ticket".into(),
        })
        .device_id("e123456789012345")
        .login_time(1_700_000_000_000)
        .sync_cursor(SyncCursor::from_init(SyncKey {
            count: 1,
            list: vec![SyncKeyItem { key: 1, val: 1 }],
        }))
        .user("@me", "Me")
        .build()
        .expect("sample session is complete")
}

/// Installs [`sample_session`] without going through login.
pub async fn install_session(client: &Client) {
    *client.session.write().await = Some(sample_session());
}
