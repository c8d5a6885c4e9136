//! Relaybox hot standby.
//!
//! Redis-based leader election so multiple dispatcher replicas can run with
//! exactly one of them actively draining the outbox.
//!
//! # Features
//!
//! - **Leader election**: renewable distributed lock with lease extension
//! - **Automatic failover**: the lease TTL bounds how long a dead leader
//!   blocks the others
//! - **Role watch**: subscribers observe Primary/Standby transitions and run
//!   their promotion work before acting on the new role
//!
//! # Example
//!
//! ```no_run
//! use rb_standby::{RedisLeaseLock, StandbyConfig, StandbyService};
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let lock = RedisLeaseLock::connect(
//!         "redis://localhost:6379",
//!         "relaybox:outbox:leader".to_string(),
//!         "instance-1".to_string(),
//!     )
//!     .await
//!     .unwrap();
//!
//!     let service = Arc::new(
//!         StandbyService::new(StandbyConfig::default(), Arc::new(lock)).unwrap(),
//!     );
//!     service.clone().start().unwrap();
//!
//!     if service.is_primary() {
//!         // Drive the pipeline
//!     }
//! }
//! ```

mod error;
mod lock;
mod service;

pub use error::{Result, StandbyError};
pub use lock::{LeaseLock, RedisLeaseLock};
pub use service::{Role, StandbyConfig, StandbyService};
