//! Message bus used when no broker is configured.

use async_trait::async_trait;
use order_store::{BusError, MessageBus, OutboxMessage};

/// Logs every outbox message as a structured event and accepts it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMessageBus;

#[async_trait]
impl MessageBus for LoggingMessageBus {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), BusError> {
        tracing::info!(
            id = %message.id,
            topic = %message.topic,
            dedup_key = %message.dedup_key,
            payload = %message.payload,
            "outbox message published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logging_bus_accepts_every_message() {
        let bus = LoggingMessageBus;
        let message = OutboxMessage::new(
            "order.created",
            "20260101-000-1",
            serde_json::json!({ "order_no": "20260101-000-1" }),
        );
        assert!(bus.publish(&message).await.is_ok());
    }
}
