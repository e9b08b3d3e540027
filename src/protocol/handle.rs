//! Role-classified connection handle

use std::sync::Arc;
use tokio::sync::Mutex;

use super::{transaction_effect, Command, HostConnection, QueryResult};
use crate::error::Result;
use crate::host::HostAddress;
use crate::topology::Role;

/// Handle shared between the listener and dispatching tasks
pub type SharedHandle = Arc<Mutex<Handle>>;

/// A session whose role has been verified by a classifier
pub struct Handle {
    conn: Box<dyn HostConnection>,
    role: Role,
    /// Pinned as the master connection of the listener
    must_be_master: bool,
    in_transaction: bool,
    closed: bool,
}

impl Handle {
    /// Wrap a freshly classified session
    pub fn new(conn: Box<dyn HostConnection>, role: Role) -> Self {
        Self {
            conn,
            role,
            must_be_master: role == Role::Master,
            in_transaction: false,
            closed: false,
        }
    }

    pub fn into_shared(self) -> SharedHandle {
        Arc::new(Mutex::new(self))
    }

    pub fn host(&self) -> &HostAddress {
        self.conn.host()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn must_be_master(&self) -> bool {
        self.must_be_master
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Underlying session, used by classifiers to re-probe the role
    pub fn connection_mut(&mut self) -> &mut dyn HostConnection {
        self.conn.as_mut()
    }

    /// Record a re-verified role
    pub fn set_role(&mut self, role: Role) {
        self.role = role;
        self.must_be_master = role == Role::Master;
    }

    /// Dispatch a data command, tracking transaction boundaries
    pub async fn run(&mut self, command: &Command) -> Result<QueryResult> {
        let result = match command {
            Command::Query(sql) => self.conn.query(sql).await?,
            Command::Execute(sql) => self.conn.execute(sql).await?,
            Command::Ping => {
                self.conn.ping().await?;
                QueryResult::default()
            }
            Command::SetCatalog(database) => {
                self.conn.set_catalog(database).await?;
                QueryResult::default()
            }
            Command::Begin => self.conn.execute("START TRANSACTION").await?,
            Command::Commit => self.conn.execute("COMMIT").await?,
            Command::Rollback => self.conn.execute("ROLLBACK").await?,
        };

        match command {
            Command::Begin => self.in_transaction = true,
            Command::Commit | Command::Rollback => self.in_transaction = false,
            Command::Query(sql) | Command::Execute(sql) => {
                if let Some(open) = transaction_effect(sql) {
                    self.in_transaction = open;
                }
            }
            _ => {}
        }

        Ok(result)
    }

    /// Close the session, logging instead of failing
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        // in_transaction is kept for failovers still holding this handle
        self.closed = true;
        if let Err(e) = self.conn.close().await {
            tracing::debug!("Error closing connection to {}: {}", self.conn.host(), e);
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("host", self.conn.host())
            .field("role", &self.role)
            .field("in_transaction", &self.in_transaction)
            .field("closed", &self.closed)
            .finish()
    }
}
