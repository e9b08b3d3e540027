//! Driver entry point
//!
//! A [`Driver`] is built once per configuration and opens any number of
//! failover connections. All of them share one blacklist, so a host that
//! failed for one connection is tried last by the others.

use std::sync::Arc;

use crate::config::FailoverConfig;
use crate::error::Result;
use crate::failover::{Blacklist, FailoverConnection, Listener};
use crate::host::HostAddress;
use crate::protocol::{Connector, MySqlConnector};
use crate::topology::{classifier_for, RoleClassifier};

pub struct Driver {
    config: Arc<FailoverConfig>,
    hosts: Vec<HostAddress>,
    connector: Arc<dyn Connector>,
    classifier: Arc<dyn RoleClassifier>,
    blacklist: Arc<Blacklist>,
}

impl Driver {
    /// Driver connecting to MariaDB/MySQL servers
    pub fn new(config: FailoverConfig) -> Result<Self> {
        let connector = Arc::new(MySqlConnector::new(&config));
        Self::with_connector(config, connector)
    }

    /// Driver using a custom connector
    pub fn with_connector(config: FailoverConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let hosts = config.host_addresses()?;
        let classifier = classifier_for(&config);
        tracing::debug!(
            "Driver ready for {} topology with {} host(s)",
            config.topology,
            hosts.len()
        );

        Ok(Self {
            config: Arc::new(config),
            hosts,
            connector,
            classifier,
            blacklist: Arc::new(Blacklist::new()),
        })
    }

    /// Open a new failover connection
    pub async fn connect(&self) -> Result<FailoverConnection> {
        let listener = Listener::new(
            self.config.clone(),
            self.hosts.clone(),
            self.connector.clone(),
            self.classifier.clone(),
            self.blacklist.clone(),
        );
        listener.initialize_connection().await?;
        Ok(FailoverConnection::new(Arc::new(listener)))
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    pub fn hosts(&self) -> &[HostAddress] {
        &self.hosts
    }

    /// Exclusion table shared by every connection of this driver
    pub fn blacklist(&self) -> &Arc<Blacklist> {
        &self.blacklist
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Topology;
    use crate::testing::MockCluster;

    #[tokio::test]
    async fn test_connections_share_blacklist() {
        let cluster = MockCluster::new();
        let config = FailoverConfig::new(Topology::MultiMaster, vec!["g1".into(), "g2".into()]);
        let g1 = HostAddress::new("g1", 3306);
        let g2 = HostAddress::new("g2", 3306);
        cluster.add_host(&g1);
        cluster.add_host(&g2);
        cluster.set_reachable(&g1, false);

        let driver = Driver::with_connector(config, cluster.connector()).unwrap();
        let first = driver.connect().await.unwrap();
        assert_eq!(first.status().await.master.as_deref(), Some("g2:3306"));
        assert_eq!(driver.blacklist().len().await, 1);

        // The second connection goes straight to g2
        let second = driver.connect().await.unwrap();
        assert_eq!(second.status().await.master.as_deref(), Some("g2:3306"));
        assert_eq!(cluster.connect_attempts(&g1), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = FailoverConfig::new(Topology::Standalone, vec![]);
        assert!(Driver::new(config).is_err());
    }
}
