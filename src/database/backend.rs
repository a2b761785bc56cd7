//! Seams between connection management and the database client.
//!
//! [`ConnectionManager`](crate::database::ConnectionManager) never talks to
//! the client library directly. It asks a [`Connector`] for a
//! [`SqlSession`] and runs [`SqlCommand`]s on it, which keeps the retry,
//! caching and pooling decisions testable without a server.

use crate::constants::PARAMETER_STRING_SIZE;
use crate::database::query::QueryResult;
use crate::database::settings::ConnectionSettings;
use crate::error::ConnectionError;
use async_trait::async_trait;
use std::time::Duration;

/// Value bound to a command parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterValue {
    NVarChar(String),
    BigInt(i64),
    Null,
}

impl ParameterValue {
    /// Text representation used when a value is inlined into the statement.
    pub fn as_text(&self) -> String {
        match self {
            ParameterValue::NVarChar(s) => s.clone(),
            ParameterValue::BigInt(v) => v.to_string(),
            ParameterValue::Null => String::new(),
        }
    }
}

/// A named command parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlParameter {
    /// Parameter name including the leading `@`.
    pub name: String,
    pub value: ParameterValue,
    /// Declared size for character parameters.
    pub size: usize,
}

impl SqlParameter {
    /// An `nvarchar(4000)` parameter.
    pub fn nvarchar(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: ParameterValue::NVarChar(value.into()),
            size: PARAMETER_STRING_SIZE,
        }
    }

    /// A `bigint` parameter.
    pub fn bigint(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            value: ParameterValue::BigInt(value),
            size: PARAMETER_STRING_SIZE,
        }
    }

    /// Declaration of this parameter as used by `sp_executesql`.
    pub fn declaration(&self) -> String {
        match self.value {
            ParameterValue::BigInt(_) => format!("{} bigint", self.name),
            ParameterValue::NVarChar(_) | ParameterValue::Null => {
                format!("{} nvarchar({})", self.name, self.size)
            }
        }
    }
}

/// A statement ready to be sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlCommand {
    pub text: String,
    pub parameters: Vec<SqlParameter>,
    /// Statement timeout; zero waits indefinitely.
    pub timeout: Duration,
}

impl SqlCommand {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parameters: Vec::new(),
            timeout: Duration::ZERO,
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<SqlParameter>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The timeout as an upper bound, `None` when unlimited.
    pub fn timeout_limit(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }

    /// Copy parameter values onto the parameters of the same name.
    pub fn rebind(&mut self, values: &[SqlParameter]) {
        for value in values {
            if let Some(param) = self.parameters.iter_mut().find(|p| p.name == value.name) {
                param.value = value.value.clone();
            }
        }
    }
}

/// An open session with a server.
///
/// Sessions are exclusively owned; a session that hit a transport failure
/// or a timeout reports `is_open() == false` and must be replaced.
#[async_trait]
pub trait SqlSession: Send {
    /// Execute a command and return the number of rows affected.
    async fn execute_non_query(&mut self, command: &SqlCommand) -> Result<u64, ConnectionError>;

    /// Execute a command and buffer every result set it produces.
    async fn execute_query(&mut self, command: &SqlCommand) -> Result<QueryResult, ConnectionError>;

    /// Switch the session's database context.
    async fn change_database(&mut self, database: &str) -> Result<(), ConnectionError>;

    /// Current database context.
    fn database(&self) -> &str;

    /// Server version string as reported at login (`16.0.1000.6`).
    fn server_version(&self) -> &str;

    /// Whether the session can still execute commands.
    fn is_open(&self) -> bool;

    /// Mark the session unusable after a command was interrupted mid-flight.
    fn invalidate(&mut self);

    /// Close the session, returning it to its pool when pooled.
    async fn close(self: Box<Self>) -> Result<(), ConnectionError>;
}

/// Opens sessions for a set of connection settings.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session.
    async fn open(&self, settings: &ConnectionSettings) -> Result<Box<dyn SqlSession>, ConnectionError>;

    /// Change the password of the login named by the settings.
    async fn change_password(
        &self,
        settings: &ConnectionSettings,
        new_password: &str,
    ) -> Result<(), ConnectionError>;
}
