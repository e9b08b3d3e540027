//! MariaDB/MySQL Connector
//!
//! Opens single sessions with sqlx and maps its errors onto SQLSTATE
//! carrying errors. Statements run over the text protocol so every value
//! can be read back as a string.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlDatabaseError};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row};
use tokio::time::timeout;

use super::{Connector, HostConnection, QueryResult};
use crate::config::FailoverConfig;
use crate::error::{Error, Result, SQLSTATE_COMMUNICATION_LINK_FAILURE, SQLSTATE_GENERAL};
use crate::host::HostAddress;

/// Connector opening sqlx MySQL sessions
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    user: String,
    password: String,
    database: Option<String>,
    connect_timeout: Duration,
}

impl MySqlConnector {
    pub fn new(config: &FailoverConfig) -> Self {
        Self {
            user: config.user.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
            connect_timeout: config.connect_timeout(),
        }
    }

    fn options(&self, host: &HostAddress) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(&host.host)
            .port(host.port)
            .username(&self.user)
            .password(&self.password);
        if let Some(db) = &self.database {
            options = options.database(db);
        }
        options.disable_statement_logging()
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self, host: &HostAddress) -> Result<Box<dyn HostConnection>> {
        let options = self.options(host);
        let conn = match timeout(self.connect_timeout, MySqlConnection::connect_with(&options)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(match e {
                    sqlx::Error::Database(_) => map_sqlx_error(e, host),
                    other => Error::ConnectionFailed {
                        address: host.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
            Err(_) => return Err(Error::ConnectionTimeout(host.to_string())),
        };

        tracing::debug!("Opened session to {}", host);
        Ok(Box::new(MySqlHostConnection {
            host: host.clone(),
            conn: Some(conn),
            io_timeout: self.connect_timeout,
        }))
    }
}

/// One sqlx session bound to a host
pub struct MySqlHostConnection {
    host: HostAddress,
    conn: Option<MySqlConnection>,
    /// Bound used for pings
    io_timeout: Duration,
}

impl MySqlHostConnection {
    fn session(&mut self) -> Result<&mut MySqlConnection> {
        self.conn.as_mut().ok_or(Error::ConnectionClosed)
    }
}

#[async_trait]
impl HostConnection for MySqlHostConnection {
    fn host(&self) -> &HostAddress {
        &self.host
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        let host = self.host.clone();
        let conn = self.session()?;
        let rows = conn
            .fetch_all(sql)
            .await
            .map_err(|e| map_sqlx_error(e, &host))?;

        let columns = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let rows = rows
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|idx| row.try_get_unchecked::<Option<String>, _>(idx).ok().flatten())
                    .collect()
            })
            .collect();

        Ok(QueryResult {
            columns,
            rows,
            ..Default::default()
        })
    }

    async fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        let host = self.host.clone();
        let conn = self.session()?;
        let done = conn
            .execute(sql)
            .await
            .map_err(|e| map_sqlx_error(e, &host))?;
        Ok(QueryResult::affected(done.rows_affected(), done.last_insert_id()))
    }

    async fn ping(&mut self) -> Result<()> {
        let host = self.host.clone();
        let io_timeout = self.io_timeout;
        let conn = self.session()?;
        match timeout(io_timeout, conn.ping()).await {
            Ok(result) => result.map_err(|e| map_sqlx_error(e, &host)),
            Err(_) => Err(Error::ConnectionTimeout(host.to_string())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close()
                .await
                .map_err(|e| map_sqlx_error(e, &self.host))?;
        }
        Ok(())
    }
}

/// Map a sqlx error onto an error carrying a SQLSTATE
///
/// Transport level failures become communication link failures (`08S01`)
/// so they are picked up by failover.
pub(crate) fn map_sqlx_error(err: sqlx::Error, host: &HostAddress) -> Error {
    match err {
        sqlx::Error::Database(db) => {
            let code = db
                .try_downcast_ref::<MySqlDatabaseError>()
                .map(|e| e.number())
                .unwrap_or(0);
            Error::Query {
                code,
                sql_state: db
                    .code()
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|| SQLSTATE_GENERAL.to_string()),
                message: db.message().to_string(),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => Error::Query {
            code: 0,
            sql_state: SQLSTATE_COMMUNICATION_LINK_FAILURE.to_string(),
            message: format!("{}: {}", host, err),
        },
        other => Error::Query {
            code: 0,
            sql_state: SQLSTATE_GENERAL.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Topology;

    #[test]
    fn test_transport_errors_are_connection_exceptions() {
        let host = HostAddress::new("db1", 3306);
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = map_sqlx_error(sqlx::Error::Io(io), &host);
        assert_eq!(err.sql_state(), "08S01");
        assert!(err.is_connection_exception());
        assert!(err.to_string().contains("db1:3306"));

        let err = map_sqlx_error(sqlx::Error::RowNotFound, &host);
        assert!(!err.is_connection_exception());
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_fast() {
        let mut config = FailoverConfig::new(Topology::Standalone, vec!["127.0.0.1:1".into()]);
        config.failover.connect_timeout_ms = 500;
        let connector = MySqlConnector::new(&config);

        let err = match connector.connect(&HostAddress::new("127.0.0.1", 1)).await {
            Ok(_) => panic!("nothing listens on port 1"),
            Err(e) => e,
        };
        assert!(err.is_connection_exception());
    }
}
