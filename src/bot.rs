use crate::client::Client;
use crate::config::ClientConfig;
use crate::handlers::{MessageHandler, MessageRouter};
use anyhow::Result;
use log::{error, info};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task;
use wechat_web_ureq_http_client::UreqHttpClient;
use wxcore::net::HttpClient;
use wxcore::types::events::{Event, EventHandler};

type EventHandlerCallback =
    Arc<dyn Fn(Event, Arc<Client>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct BotEventHandler {
    client: Arc<Client>,
    event_handler: Option<EventHandlerCallback>,
}

impl EventHandler for BotEventHandler {
    fn handle_event(&self, event: &Event) {
        if let Some(handler) = &self.event_handler {
            let handler_clone = handler.clone();
            let event_clone = event.clone();
            let client_clone = self.client.clone();

            tokio::spawn(async move {
                handler_clone(event_clone, client_clone).await;
            });
        }
    }
}

pub struct Bot {
    client: Arc<Client>,
    event_handler: Option<EventHandlerCallback>,
}

impl Bot {
    pub fn builder() -> BotBuilder {
        BotBuilder::new()
    }

    pub fn client(&self) -> Arc<Client> {
        self.client.clone()
    }

    /// Subscribes the event callback and starts logging in, resuming the
    /// saved session when possible.
    pub async fn run(&mut self) -> Result<task::JoinHandle<()>> {
        if let Some(event_handler) = self.event_handler.take() {
            let handler = Arc::new(BotEventHandler {
                client: self.client.clone(),
                event_handler: Some(event_handler),
            });
            self.client.add_event_handler(handler);
        }

        let client_for_run = self.client.clone();
        let client_handle = tokio::spawn(async move {
            match client_for_run.login_or_restore().await {
                Ok(()) => info!("Login complete, sync loop running."),
                Err(e) => error!("Login failed: {e}"),
            }
        });

        Ok(client_handle)
    }
}

#[derive(Default)]
pub struct BotBuilder {
    event_handler: Option<EventHandlerCallback>,
    config: Option<ClientConfig>,
    http_client: Option<Arc<dyn HttpClient>>,
    message_handlers: Vec<Arc<dyn MessageHandler>>,
}

impl BotBuilder {
    fn new() -> Self {
        Self::default()
    }

    pub fn on_event<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Event, Arc<Client>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.event_handler = Some(Arc::new(move |event, client| {
            Box::pin(handler(event, client))
        }));
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a specific HTTP client. Defaults to [`UreqHttpClient`].
    pub fn with_http_client(mut self, http_client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(http_client);
        self
    }

    /// Register a handler for one message kind.
    ///
    /// # Panics
    /// [`build`](Self::build) panics if two handlers claim the same kind.
    pub fn with_message_handler<H>(mut self, handler: H) -> Self
    where
        H: MessageHandler + 'static,
    {
        self.message_handlers.push(Arc::new(handler));
        self
    }

    pub async fn build(self) -> Result<Bot> {
        let config = self.config.unwrap_or_default();
        let http_client = self
            .http_client
            .unwrap_or_else(|| {
                Arc::new(UreqHttpClient::with_timeout(config.request_timeout)) as Arc<dyn HttpClient>
            });

        let mut router = MessageRouter::new();
        for handler in self.message_handlers {
            router.register(handler);
        }

        info!("Creating client...");
        let client = Client::new(config, http_client, router)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create client: {e}"))?;

        Ok(Bot {
            client,
            event_handler: self.event_handler,
        })
    }
}
