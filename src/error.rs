//! WolfHA Error Types

use thiserror::Error;

use crate::topology::Role;

/// Result type alias for WolfHA operations
pub type Result<T> = std::result::Result<T, Error>;

/// Generic connection exception
pub const SQLSTATE_CONNECTION_EXCEPTION: &str = "08000";
/// Client unable to establish connection
pub const SQLSTATE_UNABLE_TO_CONNECT: &str = "08001";
/// Communication link failure (MySQL/MariaDB specific subclass)
pub const SQLSTATE_COMMUNICATION_LINK_FAILURE: &str = "08S01";
/// General error
pub const SQLSTATE_GENERAL: &str = "HY000";
/// Invalid transaction state
pub const SQLSTATE_INVALID_TRANSACTION_STATE: &str = "25000";

/// WolfHA error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid host address '{0}'")]
    InvalidHost(String),

    // Wire layer errors
    #[error("Query failed [{code}] ({sql_state}): {message}")]
    Query {
        code: u16,
        sql_state: String,
        message: String,
    },

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Failover errors
    #[error("No active connection found for {role}")]
    NoActiveConnection {
        role: Role,
        code: u16,
        sql_state: String,
        #[source]
        source: Option<Box<Error>>,
    },

    #[error("{}", failover_message(.reconnected, .original))]
    Failover {
        reconnected: bool,
        original: Box<Error>,
        #[source]
        source: Option<Box<Error>>,
    },

    #[error("Cannot switch read-only mode while a transaction is in progress")]
    TransactionInProgress,

    #[error("Master is unavailable and the connection fell back to read-only replica {0}")]
    ReadOnlyFallback(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn failover_message(reconnected: &bool, original: &Error) -> String {
    if *reconnected {
        format!(
            "Connection was re-established after failover, the operation must be re-issued: {}",
            original
        )
    } else {
        format!("Connection lost and failover could not reconnect: {}", original)
    }
}

impl Error {
    /// SQLSTATE carried by this error
    pub fn sql_state(&self) -> &str {
        match self {
            Error::Query { sql_state, .. } => sql_state,
            Error::NoActiveConnection { sql_state, .. } => sql_state,
            Error::ConnectionFailed { .. } | Error::ConnectionTimeout(_) => {
                SQLSTATE_UNABLE_TO_CONNECT
            }
            Error::Failover { .. } | Error::ConnectionClosed => SQLSTATE_CONNECTION_EXCEPTION,
            Error::Io(_) => SQLSTATE_COMMUNICATION_LINK_FAILURE,
            Error::TransactionInProgress => SQLSTATE_INVALID_TRANSACTION_STATE,
            _ => SQLSTATE_GENERAL,
        }
    }

    /// Vendor error code (0 when none)
    pub fn code(&self) -> u16 {
        match self {
            Error::Query { code, .. } | Error::NoActiveConnection { code, .. } => *code,
            _ => 0,
        }
    }

    /// Check if this error belongs to the connection exception class (`08xxx`)
    /// and must therefore be handled by failover
    pub fn is_connection_exception(&self) -> bool {
        self.sql_state().starts_with("08")
    }

    /// Check if failover re-established a connection before this error was raised
    pub fn is_reconnected(&self) -> bool {
        matches!(self, Error::Failover { reconnected: true, .. })
    }

    /// Role that an exhausted election could not find, looking through failover wrappers
    pub fn unavailable_role(&self) -> Option<Role> {
        match self {
            Error::NoActiveConnection { role, .. } => Some(*role),
            Error::Failover {
                source: Some(source),
                ..
            } => source.unavailable_role(),
            _ => None,
        }
    }
}
