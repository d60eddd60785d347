use crate::client::Client;
use async_trait::async_trait;
use std::sync::Arc;
use wxcore::types::{MessageKind, NormalizedMessage};

/// Handles one coarse kind of incoming message.
///
/// Handlers see messages after identity resolution, before the batch's sync
/// cursor is committed. A slow handler therefore delays the sync loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The message kind this handler is registered for.
    fn kind(&self) -> MessageKind;

    /// Returns `true` if the message was consumed.
    async fn handle(&self, client: Arc<Client>, message: &NormalizedMessage) -> bool;
}
