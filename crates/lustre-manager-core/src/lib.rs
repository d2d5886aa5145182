//! Core types for the Lustre manager.
//!
//! This crate provides the foundational types shared by the store, the job
//! scheduler and the gateway:
//!
//! - **Identifiers**: stable 64-bit ids for entities, commands, jobs, step
//!   results and alerts; UUID ids for agent sessions and RPCs
//! - **Class tags**: the closed set of entity classes the scheduler manages
//! - **Entity references**: `(class_tag, id)` pairs used as lock and cache keys
//!
//! # Example
//!
//! ```
//! use lustre_manager_core::{ClassTag, EntityId, EntityRef};
//!
//! let host = EntityRef::new(ClassTag::Host, EntityId::new(7));
//! assert_eq!(host.to_string(), "host:7");
//!
//! let parsed: EntityRef = "host:7".parse().unwrap();
//! assert_eq!(parsed, host);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod class;
pub mod error;
pub mod ids;

pub use class::{ClassTag, EntityRef};
pub use error::{CoreError, Result};
pub use ids::{AlertId, CommandId, EntityId, IdError, JobId, RpcId, SessionId, StepResultId};
