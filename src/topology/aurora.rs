//! Cloud read-replica cluster (Aurora)
//!
//! Every instance may be promoted at any time, so roles are probed from the
//! server: an instance accepting writes reports `innodb_read_only = OFF`.

use async_trait::async_trait;

use super::{Role, RoleClassifier};
use crate::error::{Error, Result, SQLSTATE_CONNECTION_EXCEPTION};
use crate::host::{HostAddress, Topology};
use crate::protocol::HostConnection;

/// Probe for write availability
pub const READ_ONLY_PROBE: &str = "SHOW GLOBAL VARIABLES LIKE 'innodb_read_only'";

/// Lookup of the writer instance identifier from any cluster member
pub const MASTER_LOOKUP: &str = "SELECT server_id FROM information_schema.replica_host_status \
     WHERE session_id = 'MASTER_SESSION_ID'";

#[derive(Debug, Default)]
pub struct AuroraClassifier;

#[async_trait]
impl RoleClassifier for AuroraClassifier {
    fn topology(&self) -> Topology {
        Topology::Aurora
    }

    async fn classify(&self, conn: &mut dyn HostConnection) -> Result<Role> {
        let result = conn.query(READ_ONLY_PROBE).await.map_err(|e| Error::Query {
            code: e.code(),
            sql_state: SQLSTATE_CONNECTION_EXCEPTION.to_string(),
            message: format!(
                "could not check the 'innodb_read_only' variable status on {}: {}",
                conn.host(),
                e
            ),
        })?;

        // Variable_name | Value
        let value = result.first_value("Value").or_else(|| {
            let row = result.rows.first()?;
            row.get(1).or_else(|| row.first())?.as_deref()
        });

        Ok(match value {
            Some("OFF") => Role::Master,
            _ => Role::Replica,
        })
    }

    async fn probable_master(
        &self,
        conn: &mut dyn HostConnection,
        candidates: &[HostAddress],
    ) -> Result<Option<HostAddress>> {
        let result = conn.query(MASTER_LOOKUP).await?;
        let server_id = match result.rows.first().and_then(|row| row.first()) {
            Some(Some(id)) if !id.is_empty() => id.clone(),
            _ => return Ok(None),
        };

        Ok(search_by_start_name(&server_id, candidates))
    }
}

/// Find the candidate whose first DNS label is the instance identifier
fn search_by_start_name(server_id: &str, candidates: &[HostAddress]) -> Option<HostAddress> {
    candidates
        .iter()
        .find(|h| {
            h.host
                .split('.')
                .next()
                .map(|label| label.eq_ignore_ascii_case(server_id))
                .unwrap_or(false)
        })
        .cloned()
}
