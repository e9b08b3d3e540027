//! Connection Protocol Module
//!
//! The seam between failover orchestration and the wire layer. A
//! [`Connector`] opens sessions to single hosts, each session is a
//! [`HostConnection`], and the listener only ever talks to sessions through
//! a role-classified [`Handle`].

mod handle;
mod mysql;

pub use handle::{Handle, SharedHandle};
pub use mysql::{MySqlConnector, MySqlHostConnection};

use async_trait::async_trait;

use crate::error::Result;
use crate::host::HostAddress;

/// Data operations that can be dispatched to a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Statement returning rows
    Query(String),
    /// Statement executed for its side effects
    Execute(String),
    /// Liveness check
    Ping,
    /// Change default database
    SetCatalog(String),
    /// START TRANSACTION
    Begin,
    Commit,
    Rollback,
}

impl Command {
    /// Whether the command can be sent again on a new host without risking
    /// a double-applied side effect
    pub fn is_relaunchable(&self) -> bool {
        match self {
            Command::Query(sql) | Command::Execute(sql) => is_read_statement(sql),
            Command::Ping | Command::SetCatalog(_) | Command::Begin => true,
            Command::Commit | Command::Rollback => false,
        }
    }

    /// Whether the command needs a writable master
    pub fn is_write(&self) -> bool {
        match self {
            Command::Query(sql) | Command::Execute(sql) => !is_read_statement(sql),
            Command::Commit => true,
            _ => false,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::Query(_) => "query",
            Command::Execute(_) => "execute",
            Command::Ping => "ping",
            Command::SetCatalog(_) => "set_catalog",
            Command::Begin => "begin",
            Command::Commit => "commit",
            Command::Rollback => "rollback",
        }
    }
}

/// Text-valued result of a command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub affected_rows: u64,
    pub last_insert_id: u64,
}

impl QueryResult {
    /// Result of a statement that only reports affected rows
    pub fn affected(affected_rows: u64, last_insert_id: u64) -> Self {
        Self {
            affected_rows,
            last_insert_id,
            ..Default::default()
        }
    }

    /// Value of a named column in the first row
    pub fn first_value(&self, column: &str) -> Option<&str> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        self.rows.first()?.get(idx)?.as_deref()
    }
}

/// A live session to one host
#[async_trait]
pub trait HostConnection: Send {
    /// Host this session is bound to
    fn host(&self) -> &HostAddress;

    /// Run a statement and collect its rows
    async fn query(&mut self, sql: &str) -> Result<QueryResult>;

    /// Run a statement for its side effects
    async fn execute(&mut self, sql: &str) -> Result<QueryResult>;

    async fn ping(&mut self) -> Result<()>;

    async fn set_catalog(&mut self, database: &str) -> Result<()> {
        let sql = format!("USE `{}`", database.replace('`', "``"));
        self.execute(&sql).await.map(|_| ())
    }

    /// Close the session; closing twice is a no-op
    async fn close(&mut self) -> Result<()>;
}

/// Opens sessions to single hosts
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &HostAddress) -> Result<Box<dyn HostConnection>>;
}

/// Check if a statement only reads data
pub fn is_read_statement(sql: &str) -> bool {
    let stripped = strip_leading_comments(sql);
    let keyword: String = stripped
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_uppercase();

    matches!(
        keyword.as_str(),
        "SELECT" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "HELP"
    ) && !stripped
        .split_whitespace()
        .any(|token| token.eq_ignore_ascii_case("INTO"))
}

/// Check if a statement opens, commits or rolls back a transaction
pub(crate) fn transaction_effect(sql: &str) -> Option<bool> {
    let upper = strip_leading_comments(sql).to_uppercase();
    if upper.starts_with("START TRANSACTION") || upper == "BEGIN" || upper.starts_with("BEGIN ") {
        Some(true)
    } else if upper.starts_with("COMMIT") || upper.starts_with("ROLLBACK") {
        // ROLLBACK TO SAVEPOINT keeps the transaction open
        Some(upper.contains(" TO "))
    } else {
        None
    }
}

/// Strip leading SQL comments from a statement
fn strip_leading_comments(sql: &str) -> &str {
    let mut s = sql.trim();
    loop {
        if s.starts_with("/*") {
            if let Some(end) = s.find("*/") {
                s = s[end + 2..].trim_start();
                continue;
            }
        }
        if s.starts_with("--") || s.starts_with('#') {
            match s.find('\n') {
                Some(end) => {
                    s = s[end + 1..].trim_start();
                    continue;
                }
                None => return "",
            }
        }
        break;
    }
    s.trim_end_matches(';').trim_end()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_statement_detection() {
        assert!(is_read_statement("SELECT 1"));
        assert!(is_read_statement("  /* app=web */ select * from users"));
        assert!(is_read_statement("-- report\nSHOW TABLES"));
        assert!(is_read_statement("explain select 1"));
        assert!(!is_read_statement("INSERT INTO t VALUES (1)"));
        assert!(!is_read_statement("SELECT * FROM t INTO OUTFILE '/tmp/x'"));
        assert!(!is_read_statement("SELECT a\nINTO @x FROM t"));
        assert!(!is_read_statement("select a\tinto\t@x"));
        assert!(!is_read_statement("update t set a = 1"));
        assert!(!is_read_statement("-- only a comment"));
    }

    #[test]
    fn test_command_classification() {
        assert!(Command::Query("SELECT 1".into()).is_relaunchable());
        assert!(!Command::Query("SELECT 1".into()).is_write());
        assert!(!Command::Execute("DELETE FROM t".into()).is_relaunchable());
        assert!(Command::Execute("DELETE FROM t".into()).is_write());
        assert!(Command::Ping.is_relaunchable());
        assert!(!Command::Commit.is_relaunchable());
        assert!(Command::Commit.is_write());
    }

    #[test]
    fn test_transaction_effect() {
        assert_eq!(transaction_effect("START TRANSACTION"), Some(true));
        assert_eq!(transaction_effect("begin"), Some(true));
        assert_eq!(transaction_effect("COMMIT;"), Some(false));
        assert_eq!(transaction_effect("ROLLBACK"), Some(false));
        assert_eq!(transaction_effect("ROLLBACK TO SAVEPOINT sp1"), Some(true));
        assert_eq!(transaction_effect("SELECT 1"), None);
    }

    #[test]
    fn test_first_value() {
        let result = QueryResult {
            columns: vec!["Variable_name".into(), "Value".into()],
            rows: vec![vec![Some("innodb_read_only".into()), Some("OFF".into())]],
            ..Default::default()
        };
        assert_eq!(result.first_value("value"), Some("OFF"));
        assert_eq!(result.first_value("missing"), None);
    }
}
