use async_trait::async_trait;

use crate::error::GatewayError;

/// Outbound SMS transport.
#[async_trait]
pub trait SmsGateway: Send + Sync {
    /// Returns the provider's message id on success.
    async fn send(&self, recipient: &str, text: &str) -> Result<String, GatewayError>;
}
