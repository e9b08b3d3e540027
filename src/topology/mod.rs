//! Topology Role Classifiers
//!
//! One classifier per topology decides whether a freshly connected host
//! acts as master or replica. The classifier is picked once from the
//! configured topology; the election loop itself is topology agnostic.

mod aurora;
mod multi_master;
mod replication;

pub use aurora::{AuroraClassifier, MASTER_LOOKUP, READ_ONLY_PROBE};
pub use multi_master::MultiMasterClassifier;
pub use replication::ReplicationClassifier;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::FailoverConfig;
use crate::error::Result;
use crate::host::{HostAddress, Topology};
use crate::protocol::HostConnection;

/// Role observed for a connected host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Replica,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Replica => write!(f, "replica"),
        }
    }
}

/// Topology specific role policy
#[async_trait]
pub trait RoleClassifier: Send + Sync {
    fn topology(&self) -> Topology;

    /// Decide the role of a connected host.
    ///
    /// Only called by the election loop and the role re-check, both of which
    /// hold the exclusive failover lock.
    async fn classify(&self, conn: &mut dyn HostConnection) -> Result<Role>;

    /// Locate the current master from a connected replica, if the topology
    /// can tell
    async fn probable_master(
        &self,
        _conn: &mut dyn HostConnection,
        _candidates: &[HostAddress],
    ) -> Result<Option<HostAddress>> {
        Ok(None)
    }

    /// Arrange the non-blacklisted candidates before a pass
    fn order(&self, hosts: Vec<HostAddress>) -> Vec<HostAddress> {
        hosts
    }
}

/// Single server: whatever answers is the master
#[derive(Debug, Default)]
pub struct StandaloneClassifier;

#[async_trait]
impl RoleClassifier for StandaloneClassifier {
    fn topology(&self) -> Topology {
        Topology::Standalone
    }

    async fn classify(&self, _conn: &mut dyn HostConnection) -> Result<Role> {
        Ok(Role::Master)
    }
}

/// Build the classifier for a configuration
pub fn classifier_for(config: &FailoverConfig) -> Arc<dyn RoleClassifier> {
    match config.topology {
        Topology::Standalone => Arc::new(StandaloneClassifier),
        Topology::Replication => Arc::new(ReplicationClassifier),
        Topology::MultiMaster => Arc::new(MultiMasterClassifier::new(config.failover.load_balance)),
        Topology::Aurora => Arc::new(AuroraClassifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier_selection() {
        for topology in [
            Topology::Standalone,
            Topology::Replication,
            Topology::MultiMaster,
            Topology::Aurora,
        ] {
            let config = FailoverConfig::new(topology, vec!["db1".into()]);
            assert_eq!(classifier_for(&config).topology(), topology);
        }
    }
}
