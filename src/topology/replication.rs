//! Master/replica replication

use async_trait::async_trait;

use super::{Role, RoleClassifier};
use crate::error::Result;
use crate::host::{HostType, Topology};
use crate::protocol::HostConnection;

/// Roles come from the host list, no round-trip needed
#[derive(Debug, Default)]
pub struct ReplicationClassifier;

#[async_trait]
impl RoleClassifier for ReplicationClassifier {
    fn topology(&self) -> Topology {
        Topology::Replication
    }

    async fn classify(&self, conn: &mut dyn HostConnection) -> Result<Role> {
        Ok(match conn.host().host_type {
            Some(HostType::Master) => Role::Master,
            _ => Role::Replica,
        })
    }
}
