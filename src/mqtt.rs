use async_trait::async_trait;

use crate::Result;

/// Seam to the host's MQTT client.
///
/// The bridge never owns a broker connection: the host implements this
/// trait over its client (for example a `rumqttc::AsyncClient`) and
/// feeds every inbound message into [`Coordinator::handle_message`].
///
/// [`Coordinator::handle_message`]: crate::Coordinator::handle_message
#[async_trait]
pub trait MqttBridge: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;
    async fn subscribe(&self, topic: &str) -> Result<()>;
    async fn unsubscribe(&self, topic: &str) -> Result<()>;
}
