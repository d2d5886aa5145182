//! HTTP gateway for the Lustre manager job scheduler.
//!
//! This crate exposes the scheduler to the rest of the management stack:
//!
//! - One RPC endpoint per scheduler operation, with request-id replay
//! - The inbound side of the agent transport
//! - Request size limits and timeouts
//!
//! # Architecture
//!
//! ```text
//!   API / monitoring ──▶ POST /v1/rpc/:method ─────┐
//!                                                  ▼
//!   agent transport ──▶ POST /v1/agent/messages ──▶ SchedulerRpc ──▶ JobScheduler
//!          ▲                                                            │
//!          └──────────────────── HttpTransport ◀── AgentMessenger ◀─────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lustre_manager_gateway::{create_router, GatewayConfig, GatewayState};
//! use lustre_manager_scheduler::{JobScheduler, SchedulerService};
//!
//! # async fn example(scheduler: Arc<JobScheduler>) -> Result<(), Box<dyn std::error::Error>> {
//! let service = Arc::new(SchedulerService::new(scheduler));
//! let state = GatewayState::new(service, GatewayConfig::default());
//! let app = create_router(state);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::GatewayConfig;
pub use error::ApiError;
pub use routes::create_router;
pub use state::GatewayState;
