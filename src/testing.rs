//! In-memory cluster used by unit tests
//!
//! Hosts answer the role probe and the master lookup like a cloud cluster
//! would, every other statement echoes the host name back as a single row.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Error, Result, SQLSTATE_COMMUNICATION_LINK_FAILURE};
use crate::host::HostAddress;
use crate::protocol::{Connector, HostConnection, QueryResult};
use crate::topology::{MASTER_LOOKUP, READ_ONLY_PROBE};

#[derive(Debug)]
struct MockHost {
    reachable: bool,
    read_only_value: Option<String>,
    master_session: Option<String>,
    connect_attempts: usize,
    probes: usize,
    statements: Vec<String>,
    failures: VecDeque<Error>,
    /// Statements starting with this prefix never get an answer
    stall_prefix: Option<String>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self {
            reachable: true,
            read_only_value: Some("OFF".to_string()),
            master_session: None,
            connect_attempts: 0,
            probes: 0,
            statements: Vec::new(),
            failures: VecDeque::new(),
            stall_prefix: None,
        }
    }
}

/// Shared fake cluster state
#[derive(Debug, Clone, Default)]
pub(crate) struct MockCluster {
    hosts: Arc<Mutex<HashMap<HostAddress, MockHost>>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, host: &HostAddress) {
        self.hosts.lock().unwrap().entry(host.clone()).or_default();
    }

    /// An unreachable host refuses connections and breaks open sessions
    pub fn set_reachable(&self, host: &HostAddress, reachable: bool) {
        self.with_host(host, |h| h.reachable = reachable);
    }

    /// Answer of the `innodb_read_only` probe, `None` returns no row
    pub fn set_read_only_value(&self, host: &HostAddress, value: Option<&str>) {
        self.with_host(host, |h| h.read_only_value = value.map(str::to_string));
    }

    /// Instance identifier reported by the master lookup
    pub fn set_master_session(&self, host: &HostAddress, server_id: Option<&str>) {
        self.with_host(host, |h| h.master_session = server_id.map(str::to_string));
    }

    /// Make the next statement on the host fail with this error
    pub fn fail_next(&self, host: &HostAddress, error: Error) {
        self.with_host(host, |h| h.failures.push_back(error));
    }

    /// Leave statements starting with `prefix` unanswered, `""` stalls
    /// every statement including pings
    pub fn stall(&self, host: &HostAddress, prefix: Option<&str>) {
        self.with_host(host, |h| h.stall_prefix = prefix.map(str::to_string));
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            cluster: self.clone(),
        })
    }

    pub fn connect_attempts(&self, host: &HostAddress) -> usize {
        self.with_host(host, |h| h.connect_attempts)
    }

    pub fn total_connect_attempts(&self) -> usize {
        self.hosts
            .lock()
            .unwrap()
            .values()
            .map(|h| h.connect_attempts)
            .sum()
    }

    pub fn probe_count(&self, host: &HostAddress) -> usize {
        self.with_host(host, |h| h.probes)
    }

    pub fn statements(&self, host: &HostAddress) -> Vec<String> {
        self.with_host(host, |h| h.statements.clone())
    }

    fn with_host<T>(&self, host: &HostAddress, f: impl FnOnce(&mut MockHost) -> T) -> T {
        let mut hosts = self.hosts.lock().unwrap();
        f(hosts.entry(host.clone()).or_default())
    }
}

struct MockConnector {
    cluster: MockCluster,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, host: &HostAddress) -> Result<Box<dyn HostConnection>> {
        let reachable = {
            let mut hosts = self.cluster.hosts.lock().unwrap();
            match hosts.get_mut(host) {
                Some(h) => {
                    h.connect_attempts += 1;
                    h.reachable
                }
                None => false,
            }
        };

        if !reachable {
            return Err(Error::ConnectionFailed {
                address: host.to_string(),
                reason: "Connection refused".to_string(),
            });
        }

        Ok(Box::new(MockConnection {
            host: host.clone(),
            cluster: self.cluster.clone(),
            closed: false,
        }))
    }
}

struct MockConnection {
    host: HostAddress,
    cluster: MockCluster,
    closed: bool,
}

impl MockConnection {
    async fn respond(&mut self, sql: Option<&str>) -> Result<QueryResult> {
        let stalled = self.cluster.with_host(&self.host, |h| {
            h.stall_prefix
                .as_deref()
                .is_some_and(|prefix| sql.unwrap_or("").starts_with(prefix))
        });
        if stalled {
            futures::future::pending::<()>().await;
        }
        self.run(sql)
    }

    fn run(&mut self, sql: Option<&str>) -> Result<QueryResult> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        let name = self.host.host.clone();
        self.cluster.with_host(&self.host, |h| {
            if !h.reachable {
                return Err(Error::Query {
                    code: 2013,
                    sql_state: SQLSTATE_COMMUNICATION_LINK_FAILURE.to_string(),
                    message: "Lost connection to server during query".to_string(),
                });
            }
            let Some(sql) = sql else {
                return Ok(QueryResult::default());
            };
            h.statements.push(sql.to_string());
            if let Some(err) = h.failures.pop_front() {
                return Err(err);
            }

            if sql == READ_ONLY_PROBE {
                h.probes += 1;
                let rows = match &h.read_only_value {
                    Some(v) => vec![vec![Some("innodb_read_only".to_string()), Some(v.clone())]],
                    None => Vec::new(),
                };
                return Ok(QueryResult {
                    columns: vec!["Variable_name".into(), "Value".into()],
                    rows,
                    ..Default::default()
                });
            }

            if sql == MASTER_LOOKUP {
                return Ok(QueryResult {
                    columns: vec!["server_id".into()],
                    rows: h
                        .master_session
                        .iter()
                        .map(|id| vec![Some(id.clone())])
                        .collect(),
                    ..Default::default()
                });
            }

            Ok(QueryResult {
                columns: vec!["host".into()],
                rows: vec![vec![Some(name)]],
                affected_rows: 1,
                last_insert_id: 0,
            })
        })
    }
}

#[async_trait]
impl HostConnection for MockConnection {
    fn host(&self) -> &HostAddress {
        &self.host
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        self.respond(Some(sql)).await
    }

    async fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        self.respond(Some(sql)).await
    }

    async fn ping(&mut self) -> Result<()> {
        self.respond(None).await.map(|_| ())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
