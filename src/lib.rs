//! WolfHA - High-Availability MariaDB/MySQL Client
//!
//! Keeps a logical connection alive across host failures in standalone,
//! master/replica, multi-master (Galera) and cloud read-replica (Aurora)
//! deployments.
//!
//! # Architecture
//!
//! Every operation goes through a [`FailoverConnection`]. Connection-class
//! errors (SQLSTATE `08xxx`) hand control to a listener, which re-elects a
//! master and/or replica by sweeping the candidate hosts in priority order.
//! A per-topology classifier decides the role of each host it reaches.
//!
//! # Features
//!
//! - Transparent replay of reads after a failover
//! - Writes are never replayed; the caller learns whether a new connection exists
//! - Read-only routing to replicas, with fallback when the master is gone
//! - Shared blacklist of recently failed hosts
//! - Aurora writer discovery from any replica

pub mod config;
pub mod driver;
pub mod error;
pub mod failover;
pub mod host;
pub mod protocol;
pub mod topology;

#[cfg(test)]
pub(crate) mod testing;

pub use config::FailoverConfig;
pub use driver::Driver;
pub use error::{Error, Result};
pub use failover::FailoverConnection;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{FailoverConfig, LoadBalancePolicy};
    pub use crate::driver::Driver;
    pub use crate::error::{Error, Result};
    pub use crate::failover::{FailoverConnection, ListenerStatus};
    pub use crate::host::{HostAddress, Topology};
    pub use crate::protocol::{Command, QueryResult};
    pub use crate::topology::Role;
}
