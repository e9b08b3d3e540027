//! Failover Connection Façade
//!
//! Every call on a [`FailoverConnection`] is turned into an [`Operation`]
//! and routed through [`FailoverConnection::invoke`]. Administrative
//! operations are answered from the listener state; data operations are
//! dispatched to the current handle and recovered through the listener when
//! they fail with a connection-class error.

use std::sync::Arc;

use super::listener::{Listener, ListenerStatus};
use crate::config::FailoverConfig;
use crate::error::{Error, Result};
use crate::protocol::{Command, QueryResult};

/// Closed set of operations accepted by the façade
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    IsClosed,
    IsExplicitClosed,
    IsReadOnly,
    SetReadOnly(bool),
    Close,
    Data(Command),
}

/// Reply to an [`Operation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Flag(bool),
    Done,
    Result(QueryResult),
}

/// A connection that survives host failures
#[derive(Clone)]
pub struct FailoverConnection {
    listener: Arc<Listener>,
}

impl FailoverConnection {
    pub fn new(listener: Arc<Listener>) -> Self {
        Self { listener }
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.listener
    }

    pub async fn invoke(&self, operation: Operation) -> Result<Reply> {
        match operation {
            Operation::IsClosed => Ok(Reply::Flag(self.listener.is_closed().await)),
            Operation::IsExplicitClosed => {
                Ok(Reply::Flag(self.listener.is_explicitly_closed().await))
            }
            Operation::IsReadOnly => Ok(Reply::Flag(self.listener.is_read_only().await)),
            Operation::SetReadOnly(read_only) => {
                self.listener.switch_read_only_connection(read_only).await?;
                Ok(Reply::Done)
            }
            Operation::Close => {
                self.listener.close().await;
                Ok(Reply::Done)
            }
            Operation::Data(command) => self.execute_command(command).await.map(Reply::Result),
        }
    }

    async fn execute_command(&self, command: Command) -> Result<QueryResult> {
        self.listener.pre_execute(&command).await?;

        let (handle, outcome) = self.listener.dispatch(&command).await?;
        match outcome {
            Ok(result) => {
                if let Command::SetCatalog(database) = &command {
                    self.listener.remember_catalog(database).await;
                }
                Ok(result)
            }
            Err(e) if e.is_connection_exception() => {
                tracing::debug!("{} failed on a broken connection: {}", command.name(), e);
                let recovery = self.listener.handle_failover(&handle, Some(&command)).await;
                if recovery.must_throw_error {
                    return Err(Error::Failover {
                        reconnected: recovery.is_reconnected,
                        original: Box::new(e),
                        source: recovery.cause.map(Box::new),
                    });
                }
                if let Command::SetCatalog(database) = &command {
                    self.listener.remember_catalog(database).await;
                }
                Ok(recovery.result.unwrap_or_default())
            }
            Err(e) => Err(e),
        }
    }

    async fn data(&self, command: Command) -> Result<QueryResult> {
        match self.invoke(Operation::Data(command)).await? {
            Reply::Result(result) => Ok(result),
            other => Err(Error::Internal(format!("unexpected reply {:?}", other))),
        }
    }

    async fn flag(&self, operation: Operation) -> bool {
        matches!(self.invoke(operation).await, Ok(Reply::Flag(true)))
    }

    /// Run a statement returning rows
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        self.data(Command::Query(sql.to_string())).await
    }

    /// Run a statement for its side effects
    pub async fn execute(&self, sql: &str) -> Result<QueryResult> {
        self.data(Command::Execute(sql.to_string())).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.data(Command::Ping).await.map(|_| ())
    }

    pub async fn set_catalog(&self, database: &str) -> Result<()> {
        self.data(Command::SetCatalog(database.to_string()))
            .await
            .map(|_| ())
    }

    pub async fn begin(&self) -> Result<()> {
        self.data(Command::Begin).await.map(|_| ())
    }

    pub async fn commit(&self) -> Result<()> {
        self.data(Command::Commit).await.map(|_| ())
    }

    pub async fn rollback(&self) -> Result<()> {
        self.data(Command::Rollback).await.map(|_| ())
    }

    /// Route following commands to a replica (`true`) or the master
    pub async fn set_read_only(&self, read_only: bool) -> Result<()> {
        self.invoke(Operation::SetReadOnly(read_only)).await.map(|_| ())
    }

    pub async fn is_read_only(&self) -> bool {
        self.flag(Operation::IsReadOnly).await
    }

    pub async fn is_closed(&self) -> bool {
        self.flag(Operation::IsClosed).await
    }

    pub async fn is_explicitly_closed(&self) -> bool {
        self.flag(Operation::IsExplicitClosed).await
    }

    /// Configuration this connection was opened with
    pub fn options(&self) -> &FailoverConfig {
        self.listener.config()
    }

    pub async fn close(&self) {
        let _ = self.invoke(Operation::Close).await;
    }

    /// Drop the current handles and run a fresh election
    pub async fn reconnect(&self) -> Result<()> {
        self.listener.reconnect().await
    }

    /// Send statements back to back on one handle.
    ///
    /// A batch is never relaunched after a failover: statements before the
    /// failure may already be applied.
    pub async fn execute_batch(&self, statements: &[String]) -> Result<Vec<QueryResult>> {
        let commands: Vec<Command> = statements.iter().cloned().map(Command::Execute).collect();
        let Some(first) = commands.first() else {
            return Ok(Vec::new());
        };
        let gate = commands.iter().find(|c| c.is_write()).unwrap_or(first);
        self.listener.pre_execute(gate).await?;

        let (handle, outcome) = self.listener.dispatch_batch(&commands).await?;
        match outcome {
            Ok(results) => Ok(results),
            Err(e) if e.is_connection_exception() => {
                let recovery = self.listener.handle_failover(&handle, None).await;
                Err(Error::Failover {
                    reconnected: recovery.is_reconnected,
                    original: Box::new(e),
                    source: recovery.cause.map(Box::new),
                })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn status(&self) -> ListenerStatus {
        self.listener.status().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::Blacklist;
    use crate::host::{HostAddress, Topology};
    use crate::testing::MockCluster;
    use crate::topology::{classifier_for, Role};

    async fn connect(cluster: &MockCluster, config: FailoverConfig) -> FailoverConnection {
        let hosts = config.host_addresses().unwrap();
        for host in &hosts {
            cluster.add_host(host);
        }
        let classifier = classifier_for(&config);
        let listener = Listener::new(
            Arc::new(config),
            hosts,
            cluster.connector(),
            classifier,
            Arc::new(Blacklist::new()),
        );
        listener.initialize_connection().await.unwrap();
        FailoverConnection::new(Arc::new(listener))
    }

    fn host(name: &str) -> HostAddress {
        HostAddress::new(name, 3306)
    }

    fn replication(hosts: &[&str], retries: u32) -> FailoverConfig {
        let mut config =
            FailoverConfig::new(Topology::Replication, hosts.iter().map(|h| h.to_string()).collect());
        config.failover.retries_all_down = retries;
        config
    }

    fn aurora(hosts: &[&str], retries: u32) -> FailoverConfig {
        let mut config =
            FailoverConfig::new(Topology::Aurora, hosts.iter().map(|h| h.to_string()).collect());
        config.failover.retries_all_down = retries;
        config
    }

    fn link_failure() -> Error {
        Error::Query {
            code: 2013,
            sql_state: "08S01".into(),
            message: "Lost connection to server during query".into(),
        }
    }

    fn served_by(result: &QueryResult) -> Option<&str> {
        result.first_value("host")
    }

    #[tokio::test]
    async fn test_non_connection_error_is_passed_through() {
        let cluster = MockCluster::new();
        let conn = connect(&cluster, replication(&["db1?type=master", "db2"], 3)).await;
        cluster.fail_next(
            &host("db1"),
            Error::Query {
                code: 1064,
                sql_state: "42000".into(),
                message: "You have an error in your SQL syntax".into(),
            },
        );

        let err = conn.query("SELEC 1").await.unwrap_err();
        assert_eq!(err.sql_state(), "42000");
        assert_eq!(conn.listener().failover_count(), 0);
        assert_eq!(cluster.total_connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_read_fails_over_transparently() {
        let cluster = MockCluster::new();
        let conn = connect(&cluster, aurora(&["a", "b", "c"], 2)).await;
        for h in ["b", "c"] {
            cluster.set_read_only_value(&host(h), Some("ON"));
        }
        // re-run the election now that b and c report as replicas
        conn.reconnect().await.unwrap();
        assert_eq!(conn.status().await.master.as_deref(), Some("a:3306"));

        // a dies, c is promoted
        cluster.set_reachable(&host("a"), false);
        cluster.set_read_only_value(&host("c"), Some("OFF"));

        let result = conn.query("SELECT @@hostname").await.unwrap();
        assert_eq!(served_by(&result), Some("c"));
        assert_eq!(conn.listener().failover_count(), 1);

        let status = conn.status().await;
        assert_eq!(status.master.as_deref(), Some("c:3306"));
        assert_eq!(status.current, Some(Role::Master));
        assert!(status.blacklist.iter().any(|e| e.host == "a:3306"));
    }

    #[tokio::test]
    async fn test_write_is_not_relaunched() {
        let cluster = MockCluster::new();
        let conn = connect(&cluster, aurora(&["a", "b"], 2)).await;
        cluster.set_read_only_value(&host("b"), Some("ON"));
        conn.reconnect().await.unwrap();

        cluster.set_reachable(&host("a"), false);
        cluster.set_read_only_value(&host("b"), Some("OFF"));

        let err = conn.execute("UPDATE t SET a = 1").await.unwrap_err();
        assert!(err.is_reconnected());
        assert!(err.is_connection_exception());
        // the write was sent once, to the dead master only
        assert!(!cluster
            .statements(&host("b"))
            .iter()
            .any(|s| s.starts_with("UPDATE")));

        // the caller can re-issue it on the new master
        let result = conn.execute("UPDATE t SET a = 1").await.unwrap();
        assert_eq!(served_by(&result), Some("b"));
    }

    #[tokio::test]
    async fn test_exhausted_in_transaction_names_master() {
        let cluster = MockCluster::new();
        let mut config = FailoverConfig::new(Topology::Standalone, vec!["db1".into()]);
        config.failover.retries_all_down = 1;
        let conn = connect(&cluster, config).await;

        conn.begin().await.unwrap();
        cluster.set_reachable(&host("db1"), false);

        let err = conn.execute("INSERT INTO t VALUES (1)").await.unwrap_err();
        assert!(!err.is_reconnected());
        assert!(err.is_connection_exception());
        assert_eq!(err.unavailable_role(), Some(Role::Master));
    }

    #[tokio::test]
    async fn test_read_only_switch_rejected_in_transaction() {
        let cluster = MockCluster::new();
        let conn = connect(&cluster, replication(&["db1?type=master", "db2"], 2)).await;

        conn.begin().await.unwrap();
        let err = conn.set_read_only(true).await.unwrap_err();
        assert!(matches!(err, Error::TransactionInProgress));
        assert!(!conn.is_read_only().await);

        conn.commit().await.unwrap();
        conn.set_read_only(true).await.unwrap();
        assert!(conn.is_read_only().await);
        let result = conn.query("SELECT 1").await.unwrap();
        assert_eq!(served_by(&result), Some("db2"));

        conn.set_read_only(false).await.unwrap();
        let result = conn.query("SELECT 1").await.unwrap();
        assert_eq!(served_by(&result), Some("db1"));
    }

    #[tokio::test]
    async fn test_falls_back_to_replica_for_reads() {
        let cluster = MockCluster::new();
        let conn = connect(&cluster, replication(&["db1?type=master", "db2"], 1)).await;

        cluster.set_reachable(&host("db1"), false);
        let result = conn.query("SELECT 1").await.unwrap();
        assert_eq!(served_by(&result), Some("db2"));
        assert_eq!(conn.status().await.current, Some(Role::Replica));

        // writes do not silently land on the replica
        let err = conn.execute("DELETE FROM t").await.unwrap_err();
        assert_eq!(err.unavailable_role(), Some(Role::Master));
        assert!(!cluster
            .statements(&host("db2"))
            .iter()
            .any(|s| s.starts_with("DELETE")));

        // once the master is back the next write goes there
        cluster.set_reachable(&host("db1"), true);
        let result = conn.execute("DELETE FROM t").await.unwrap();
        assert_eq!(served_by(&result), Some("db1"));
        assert_eq!(conn.status().await.current, Some(Role::Master));
    }

    #[tokio::test]
    async fn test_write_lost_to_fallback_is_not_reconnected() {
        let cluster = MockCluster::new();
        let conn = connect(&cluster, replication(&["db1?type=master", "db2"], 1)).await;

        cluster.set_reachable(&host("db1"), false);
        let err = conn.execute("DELETE FROM t").await.unwrap_err();
        assert!(!err.is_reconnected());
        assert_eq!(err.unavailable_role(), Some(Role::Master));

        // reads keep going to the replica
        let result = conn.query("SELECT 1").await.unwrap();
        assert_eq!(served_by(&result), Some("db2"));
    }

    #[tokio::test]
    async fn test_fail_on_read_only_rejects_writes() {
        let cluster = MockCluster::new();
        let mut config = replication(&["db1?type=master", "db2"], 1);
        config.failover.fail_on_read_only = true;
        let conn = connect(&cluster, config).await;

        cluster.set_reachable(&host("db1"), false);
        conn.query("SELECT 1").await.unwrap();

        let err = conn.execute("INSERT INTO t VALUES (1)").await.unwrap_err();
        assert!(matches!(err, Error::ReadOnlyFallback(ref h) if h == "db2:3306"));
    }

    #[tokio::test]
    async fn test_replica_failure_falls_back_to_master() {
        let cluster = MockCluster::new();
        let conn = connect(&cluster, replication(&["db1?type=master", "db2"], 1)).await;
        conn.set_read_only(true).await.unwrap();

        cluster.set_reachable(&host("db2"), false);
        let result = conn.query("SELECT 1").await.unwrap();
        assert_eq!(served_by(&result), Some("db1"));
        assert_eq!(conn.listener().failover_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_commands() {
        let cluster = MockCluster::new();
        let conn = connect(&cluster, replication(&["db1?type=master", "db2"], 1)).await;
        conn.close().await;

        assert!(conn.is_closed().await);
        assert!(conn.is_explicitly_closed().await);
        assert!(matches!(conn.query("SELECT 1").await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_batch_is_not_relaunched() {
        let cluster = MockCluster::new();
        let mut config = FailoverConfig::new(
            Topology::MultiMaster,
            vec!["g1".into(), "g2".into()],
        );
        config.failover.retries_all_down = 1;
        let conn = connect(&cluster, config).await;

        cluster.fail_next(&host("g1"), link_failure());
        let statements = vec!["INSERT INTO t VALUES (1)".to_string(), "SELECT 1".to_string()];
        let err = conn.execute_batch(&statements).await.unwrap_err();
        assert!(err.is_reconnected());
        assert!(cluster.statements(&host("g2")).is_empty());

        let results = conn.execute_batch(&statements).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(served_by(&results[1]), Some("g2"));
    }

    #[tokio::test]
    async fn test_concurrent_failures_run_one_election() {
        let cluster = MockCluster::new();
        let config = FailoverConfig::new(
            Topology::MultiMaster,
            vec!["g1".into(), "g2".into(), "g3".into()],
        );
        let conn = connect(&cluster, config).await;
        cluster.set_reachable(&host("g1"), false);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move { conn.query("SELECT 1").await }));
        }
        for task in tasks {
            let result = task.await.unwrap().unwrap();
            assert_eq!(served_by(&result), Some("g2"));
        }

        assert_eq!(conn.listener().failover_count(), 1);
        assert_eq!(cluster.connect_attempts(&host("g3")), 0);
    }

    #[tokio::test]
    async fn test_catalog_follows_failover() {
        let cluster = MockCluster::new();
        let config = FailoverConfig::new(Topology::MultiMaster, vec!["g1".into(), "g2".into()]);
        let conn = connect(&cluster, config).await;

        conn.set_catalog("app").await.unwrap();
        cluster.set_reachable(&host("g1"), false);
        conn.ping().await.unwrap();

        assert!(cluster.statements(&host("g2")).contains(&"USE `app`".to_string()));
    }
}
