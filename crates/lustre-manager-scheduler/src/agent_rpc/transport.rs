//! Delivery of envelopes to the agent transport service.
//!
//! The transport service owns the long-poll connections to agents. The
//! messenger hands it outbound envelopes; inbound envelopes arrive through
//! the gateway and are fed to [`AgentMessenger::on_message`].
//!
//! [`AgentMessenger::on_message`]: super::AgentMessenger::on_message

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::envelope::Envelope;
use crate::error::AgentError;

/// Outbound side of the agent transport.
///
/// This trait abstracts delivery, allowing a simulated agent fleet in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue an envelope for delivery to its host.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the transport service cannot accept it.
    async fn send(&self, envelope: Envelope) -> Result<(), AgentError>;
}

/// HTTP client for the agent transport service.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport client.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AgentError::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a transport client with a custom reqwest client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Base URL of the transport service.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), AgentError> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("transport request failed: {e}")))?;

        if response.status().is_success() {
            tracing::trace!(fqdn = %envelope.fqdn, kind = ?envelope.message_type, "Envelope queued");
            Ok(())
        } else {
            let status = response.status();
            let error = response
                .json::<ErrorResponse>()
                .await
                .map(|e| e.error)
                .unwrap_or_else(|_| format!("transport returned status {status}"));
            tracing::warn!(fqdn = %envelope.fqdn, status = %status, error = %error, "Envelope rejected");
            Err(AgentError::Transport(error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_rpc::envelope::MessageType;
    use lustre_manager_core::SessionId;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn posts_envelope_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(body_partial_json(serde_json::json!({
                "fqdn": "h1.example.com",
                "type": "SESSION_CREATE_RESPONSE",
                "plugin": "action_runner",
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(format!("{}/", server.uri())).unwrap();
        let envelope = Envelope::control(
            "h1.example.com",
            MessageType::SessionCreateResponse,
            Some(SessionId::generate()),
        );
        transport.send(envelope).await.unwrap();
    }

    #[tokio::test]
    async fn error_body_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(
                ResponseTemplate::new(503)
                    .set_body_json(serde_json::json!({"error": "queue full"})),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new(server.uri()).unwrap();
        let err = transport
            .send(Envelope::control("h1", MessageType::SessionTerminateAll, None))
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Transport("queue full".into()));
    }

    #[tokio::test]
    async fn unreachable_service_is_a_transport_error() {
        let transport = HttpTransport::new("http://127.0.0.1:9").unwrap();
        let err = transport
            .send(Envelope::control("h1", MessageType::SessionTerminateAll, None))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
    }
}
