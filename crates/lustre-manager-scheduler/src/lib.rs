//! Job scheduler for the Lustre manager.
//!
//! The scheduler turns requests against a graph of stateful objects
//! (servers, their services, targets, filesystems, clients) into ordered
//! jobs, runs each job's steps against remote agents, and commits the
//! resulting state changes. It handles:
//!
//! - Planning state changes over declared state machines and dependencies
//! - Read/write locks that serialize conflicting changes
//! - At-most-one RPC per agent session, with timeouts and cancellation
//! - Failure and cancellation propagation between jobs and commands
//! - Notifications from monitoring and the alerts derived from them
//!
//! # Architecture
//!
//! ```text
//!   gateway ──▶ SchedulerService ──▶ JobScheduler ──▶ CommandPlanner
//!                                        │                 │
//!                                        │          LockCache / ObjectCache
//!                                        ▼
//!                                   run_job ──▶ Step ──▶ AgentMessenger ──▶ Transport
//!                                        │
//!                                        ▼
//!                                    Store (RocksDB)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lustre_manager_scheduler::{
//!     AgentMessenger, HttpTransport, JobScheduler, SchedulerConfig, SchedulerContext,
//!     SchedulerService, ShellLocalActions,
//! };
//! use lustre_manager_store::RocksStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SchedulerConfig::from_env();
//! let store = Arc::new(RocksStore::open(&config.data_dir)?);
//! let transport = Arc::new(HttpTransport::new(config.http_agent_url.clone())?);
//! let messenger = Arc::new(AgentMessenger::new(transport, &config));
//! let local = Arc::new(ShellLocalActions::new(config.server_http_url.clone()));
//!
//! let ctx = SchedulerContext::new(store, config, messenger, local)?;
//! let scheduler = JobScheduler::new(ctx);
//! scheduler.start().await?;
//! let service = SchedulerService::new(scheduler);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod agent_rpc;
pub mod alerts;
pub mod classes;
pub mod command_plan;
pub mod config;
pub mod context;
pub mod create;
pub mod deps;
pub mod error;
pub mod jobs;
pub mod local;
pub mod lock_cache;
pub mod notify;
pub mod object_cache;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod steps;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use agent_rpc::{AgentMessenger, Envelope, HttpTransport, SessionEvent, Transport};
pub use command_plan::{JobRequest, StateRequest, TransitionConsequences};
pub use config::SchedulerConfig;
pub use context::SchedulerContext;
pub use create::{ConfParamUpdate, CreateClientMount, CreateCopytool, CreateFilesystem, CreateHost, MgtSpec};
pub use error::{AgentError, Result, SchedulerError, StepError};
pub use jobs::{Job, JobClass};
pub use local::{LocalActions, ShellLocalActions};
pub use notify::{Notification, NotifyOutcome};
pub use scheduler::{ConfParamsSet, JobScheduler};
pub use service::{SchedulerRpc, SchedulerService};
