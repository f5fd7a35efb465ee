//! Message delivery transport
//!
//! The executor only ever needs `send(text)`. Telegram is the concrete
//! channel; `NullTransport` backs tests and dry runs.

use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::info;

use crate::error::CompanionError;

/// Delivery seam consumed by the action executor
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), CompanionError>;
}

/// Telegram delivery via teloxide
pub struct TelegramTransport {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramTransport {
    pub fn new(token: &str, chat_id: i64) -> Self {
        Self {
            bot: Bot::new(token),
            chat_id: ChatId(chat_id),
        }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send(&self, text: &str) -> Result<(), CompanionError> {
        self.bot
            .send_message(self.chat_id, text)
            .await
            .map_err(|e| CompanionError::DeliveryFailure(e.to_string()))?;
        Ok(())
    }
}

/// Logs instead of delivering. Used when no transport is configured.
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn send(&self, text: &str) -> Result<(), CompanionError> {
        info!("(no transport) would send: {}", text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_transport_always_succeeds() {
        let transport = NullTransport;
        assert!(transport.send("hello").await.is_ok());
    }
}
