//! Inbound agent messages.
//!
//! The agent transport service forwards whatever agents sent, in arrival
//! order, as batches of envelopes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use lustre_manager_scheduler::{Envelope, SchedulerRpc};

use crate::state::GatewayState;

/// A batch of envelopes from the agent transport.
#[derive(Debug, Deserialize)]
pub struct AgentMessages {
    /// Envelopes in arrival order.
    pub messages: Vec<Envelope>,
}

/// Deliver agent envelopes to the scheduler.
///
/// Envelopes are handled in order before the response is sent.
pub async fn receive<S>(
    State(state): State<Arc<GatewayState<S>>>,
    Json(batch): Json<AgentMessages>,
) -> StatusCode
where
    S: SchedulerRpc + 'static,
{
    tracing::trace!(count = batch.messages.len(), "Agent messages received");
    for envelope in batch.messages {
        state.scheduler.agent_message(envelope).await;
    }
    StatusCode::ACCEPTED
}
