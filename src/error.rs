//! Error types for mssql-conninfo.
//!
//! Every fallible operation in the crate returns [`ConnectionError`]. Errors
//! raised by the server keep their number, severity class and state in
//! [`SqlError`] so callers can react to specific conditions.

use crate::constants::{ERROR_DATABASE_RESUMING, FATAL_SEVERITY};
use std::fmt;
use thiserror::Error;

/// An error reported by SQL Server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlError {
    /// Error number (`ERROR_NUMBER()`).
    pub number: u32,
    /// Severity class (`ERROR_SEVERITY()`).
    pub class: u8,
    /// Error state (`ERROR_STATE()`).
    pub state: u8,
    /// Message text.
    pub message: String,
    /// Procedure that raised the error, if any.
    pub procedure: String,
    /// Line number within the batch or procedure.
    pub line: u32,
}

impl SqlError {
    /// Create a server error with the given number, class and message.
    pub fn new(number: u32, class: u8, message: impl Into<String>) -> Self {
        Self {
            number,
            class,
            state: 1,
            message: message.into(),
            procedure: String::new(),
            line: 0,
        }
    }

    /// Whether the server closes the connection after raising this error.
    pub fn is_fatal(&self) -> bool {
        self.class >= FATAL_SEVERITY
    }
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Msg {}, Level {}, State {}: {}",
            self.number, self.class, self.state, self.message
        )
    }
}

/// Errors raised while configuring, connecting or executing.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A setting was changed after the connection was established.
    #[error("The connection settings cannot be changed after the connection has been established")]
    ConnectionCannotBeChanged,

    /// A setting was given a value outside its domain.
    #[error("Invalid value '{value}' for property {property}: {reason}")]
    InvalidPropertyValue {
        property: String,
        value: String,
        reason: String,
    },

    /// A setting cannot be changed because an explicit connection string was assigned.
    #[error("Property {0} is not available when a connection string has been set explicitly")]
    PropertyNotAvailable(String),

    /// A required setting has no value.
    #[error("Property {0} must be set before connecting")]
    PropertyNotSet(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Opening a session failed.
    #[error("Failed to connect to server {data_source}")]
    ConnectionFailure {
        data_source: String,
        #[source]
        source: Box<ConnectionError>,
    },

    /// Transport-level error
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Error raised by the server while executing a statement.
    #[error("{0}")]
    Sql(SqlError),

    /// A statement or batch failed.
    #[error("An exception occurred while executing a Transact-SQL statement or batch")]
    ExecutionFailure {
        #[source]
        source: Box<ConnectionError>,
    },

    /// The connection is in disconnected (offline) mode.
    #[error("Cannot perform '{0}' while the connection is in disconnected mode")]
    Disconnected(String),

    /// COMMIT or ROLLBACK without an open transaction.
    #[error("There is no open transaction on this connection")]
    NotInTransaction,

    /// Changing the login password failed.
    #[error("Failed to change the password")]
    ChangePasswordFailure {
        #[source]
        source: Box<ConnectionError>,
    },

    /// The server is older than the oldest supported version.
    #[error("Connections to server version {0} are not supported")]
    UnsupportedServerVersion(String),

    /// Statement timeout
    #[error("Statement timeout: operation exceeded {timeout_seconds} seconds")]
    Timeout { timeout_seconds: u64 },

    /// The running command was cancelled.
    #[error("The operation was cancelled by the user")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConnectionError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a connection error with a source.
    pub fn connection_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an authentication error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create an invalid property value error.
    pub fn invalid_property(
        property: impl Into<String>,
        value: impl fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidPropertyValue {
            property: property.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Wrap an error raised while opening a session.
    pub fn connection_failure(data_source: impl Into<String>, source: ConnectionError) -> Self {
        Self::ConnectionFailure {
            data_source: data_source.into(),
            source: Box::new(source),
        }
    }

    /// Wrap an error raised while executing a statement.
    pub fn execution_failure(source: ConnectionError) -> Self {
        match source {
            already @ Self::ExecutionFailure { .. } => already,
            other => Self::ExecutionFailure {
                source: Box::new(other),
            },
        }
    }

    /// Create a timeout error.
    pub fn timeout(seconds: u64) -> Self {
        Self::Timeout {
            timeout_seconds: seconds,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The server error at the root of this error, if any.
    pub fn sql_error(&self) -> Option<&SqlError> {
        match self {
            Self::Sql(e) => Some(e),
            Self::ExecutionFailure { source }
            | Self::ConnectionFailure { source, .. }
            | Self::ChangePasswordFailure { source } => source.sql_error(),
            _ => None,
        }
    }

    /// Severity of the failure on the server's 0-25 scale.
    ///
    /// Transport failures are reported as fatal because the session is gone.
    pub fn severity(&self) -> Option<u8> {
        match self {
            Self::Sql(e) => Some(e.class),
            Self::Connection { .. } | Self::Timeout { .. } | Self::Cancelled => {
                Some(FATAL_SEVERITY)
            }
            Self::ExecutionFailure { source } => source.severity(),
            _ => None,
        }
    }

    /// Check if this error is transient and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Sql(e) => is_transient_sql_error(e.number),
            Self::ConnectionFailure { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Get a user-friendly suggestion for how to fix this error.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Config(_) => Some("Check your environment variables and configuration"),
            Self::Connection { .. } | Self::ConnectionFailure { .. } => {
                Some("Check server hostname, port, and network connectivity")
            }
            Self::Authentication(_) => Some("Verify your username and password are correct"),
            Self::PropertyNotAvailable(_) => {
                Some("Change the explicit connection string instead of individual settings")
            }
            Self::ConnectionCannotBeChanged => {
                Some("Disconnect and create a new connection with the desired settings")
            }
            Self::Disconnected(_) => Some("Leave disconnected mode before executing statements"),
            Self::Timeout { .. } => Some("Try a simpler query or increase the statement timeout"),
            Self::UnsupportedServerVersion(_) => {
                Some("Connect to SQL Server 2000 (version 8) or later")
            }
            _ => None,
        }
    }
}

/// Check if a SQL Server error number indicates a transient error.
pub fn is_transient_sql_error(number: u32) -> bool {
    number == ERROR_DATABASE_RESUMING
        || matches!(
            number,
            1205    // Deadlock
            | 10053 // Connection forcibly closed
            | 10054 // Connection reset
            | 10060 // Connection timed out
            | 40197 // Azure: service error
            | 40501 // Azure: service busy
            | 40613 // Azure: database unavailable
            | 49918 // Azure: not enough resources
            | 49919 // Azure: too many requests
            | 49920 // Azure: too busy
        )
}

impl From<tiberius::error::Error> for ConnectionError {
    fn from(e: tiberius::error::Error) -> Self {
        use tiberius::error::Error;

        match e {
            Error::Server(token) => ConnectionError::Sql(SqlError {
                number: token.code(),
                class: token.class(),
                state: token.state(),
                message: token.message().to_string(),
                procedure: token.procedure().to_string(),
                line: token.line(),
            }),
            Error::Io { kind, message } => {
                ConnectionError::connection(format!("IO error ({:?}): {}", kind, message))
            }
            Error::Tls(message) => ConnectionError::connection(format!("TLS error: {}", message)),
            Error::Routing { host, port } => ConnectionError::connection(format!(
                "Server requested routing to {}:{}",
                host, port
            )),
            Error::Protocol(message) => {
                ConnectionError::connection(format!("Protocol error: {}", message))
            }
            other => ConnectionError::internal(other.to_string()),
        }
    }
}

impl From<bb8::RunError<ConnectionError>> for ConnectionError {
    fn from(e: bb8::RunError<ConnectionError>) -> Self {
        match e {
            bb8::RunError::User(inner) => inner,
            bb8::RunError::TimedOut => {
                ConnectionError::connection("Timed out waiting for a pooled connection")
            }
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut => ConnectionError::timeout(0),
            _ => ConnectionError::connection_with_source(format!("IO error: {}", e), e),
        }
    }
}
