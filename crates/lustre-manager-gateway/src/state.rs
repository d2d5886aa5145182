//! Gateway application state.

use std::sync::Arc;

use lustre_manager_scheduler::SchedulerRpc;

use crate::config::GatewayConfig;

/// Shared application state for the gateway.
pub struct GatewayState<S>
where
    S: SchedulerRpc,
{
    /// The scheduler facade.
    pub scheduler: Arc<S>,
    /// Gateway configuration.
    pub config: GatewayConfig,
}

impl<S> GatewayState<S>
where
    S: SchedulerRpc,
{
    /// Create a new gateway state.
    #[must_use]
    pub fn new(scheduler: Arc<S>, config: GatewayConfig) -> Self {
        Self { scheduler, config }
    }
}

impl<S> Clone for GatewayState<S>
where
    S: SchedulerRpc,
{
    fn clone(&self) -> Self {
        Self {
            scheduler: Arc::clone(&self.scheduler),
            config: self.config.clone(),
        }
    }
}
