use super::traits::MessageHandler;
use crate::client::Client;
use std::collections::HashMap;
use std::sync::Arc;
use wxcore::types::{MessageKind, NormalizedMessage};

/// Dispatches normalized messages to the handler registered for their kind.
pub struct MessageRouter {
    handlers: HashMap<MessageKind, Arc<dyn MessageHandler>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for its message kind.
    ///
    /// # Panics
    /// Panics if a handler is already registered for the same kind.
    pub fn register(&mut self, handler: Arc<dyn MessageHandler>) {
        let kind = handler.kind();
        if self.handlers.insert(kind, handler).is_some() {
            panic!("Handler for message kind '{kind}' already registered");
        }
    }

    /// Returns `true` if a handler exists for the message's kind and it
    /// consumed the message.
    pub async fn dispatch(&self, client: Arc<Client>, message: &NormalizedMessage) -> bool {
        match self.handlers.get(&message.kind) {
            Some(handler) => handler.handle(client, message).await,
            None => false,
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ScriptedHttpClient, create_test_client};
    use std::sync::atomic::{AtomicBool, Ordering};
    use wxcore::types::{ChatFlags, ChatKind, ChatRef, RawMessage};

    struct MockHandler {
        kind: MessageKind,
        handled: AtomicBool,
    }

    impl MockHandler {
        fn new(kind: MessageKind) -> Self {
            Self {
                kind,
                handled: AtomicBool::new(false),
            }
        }

        fn was_handled(&self) -> bool {
            self.handled.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl MessageHandler for MockHandler {
        fn kind(&self) -> MessageKind {
            self.kind
        }

        async fn handle(&self, _client: Arc<Client>, _message: &NormalizedMessage) -> bool {
            self.handled.store(true, Ordering::SeqCst);
            true
        }
    }

    fn message(kind: MessageKind) -> NormalizedMessage {
        let chat = ChatRef {
            user_name: "@alice".into(),
            puid: Some("abcd1234".into()),
            display_name: "Alice".into(),
            kind: ChatKind::User,
            flags: ChatFlags::default(),
        };
        NormalizedMessage {
            id: "1".into(),
            kind,
            author: chat.clone(),
            chat,
            is_self: false,
            text: "hi".into(),
            file_name: None,
            url: None,
            create_time: 0,
            raw: RawMessage::default(),
        }
    }

    #[test]
    fn registration_counts_handlers() {
        let mut router = MessageRouter::new();
        router.register(Arc::new(MockHandler::new(MessageKind::Text)));
        router.register(Arc::new(MockHandler::new(MessageKind::Picture)));
        assert_eq!(router.handler_count(), 2);
    }

    #[test]
    #[should_panic(expected = "Handler for message kind 'text' already registered")]
    fn double_registration_panics() {
        let mut router = MessageRouter::new();
        router.register(Arc::new(MockHandler::new(MessageKind::Text)));
        router.register(Arc::new(MockHandler::new(MessageKind::Text)));
    }

    #[tokio::test]
    async fn dispatch_reaches_matching_handler_only() {
        let text = Arc::new(MockHandler::new(MessageKind::Text));
        let picture = Arc::new(MockHandler::new(MessageKind::Picture));
        let mut router = MessageRouter::new();
        router.register(text.clone());
        router.register(picture.clone());

        let client = create_test_client(ScriptedHttpClient::new()).await;
        assert!(router.dispatch(client.clone(), &message(MessageKind::Text)).await);
        assert!(text.was_handled());
        assert!(!picture.was_handled());

        assert!(!router.dispatch(client, &message(MessageKind::Voice)).await);
    }
}
