//! Centralized constants for mssql-conninfo.
//!
//! This module contains the default values and limits used throughout
//! the codebase, making them easy to find, understand, and modify.

use std::time::Duration;

// =============================================================================
// Connection Settings Defaults
// =============================================================================

/// Server instance used when none is configured.
pub const DEFAULT_SERVER_INSTANCE: &str = "(local)";

/// Default login timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: i32 = 15;

/// Default network packet size in bytes.
pub const DEFAULT_PACKET_SIZE: i32 = 8192;

/// Default maximum number of pooled connections per connection string.
pub const DEFAULT_MAX_POOL_SIZE: i32 = 100;

/// Default minimum number of pooled connections per connection string.
pub const DEFAULT_MIN_POOL_SIZE: i32 = 0;

/// Smallest accepted maximum pool size.
pub const MIN_MAX_POOL_SIZE: i32 = 2;

/// Default TCP port for SQL Server.
pub const DEFAULT_PORT: u16 = 1433;

/// Application name reported to the server when none is configured.
pub const DEFAULT_APPLICATION_NAME: &str = "mssql-conninfo";

// =============================================================================
// Execution Defaults
// =============================================================================

/// Default statement timeout in seconds.
pub const DEFAULT_STATEMENT_TIMEOUT_SECS: u32 = 600;

/// Default batch separator.
pub const DEFAULT_BATCH_SEPARATOR: &str = "GO";

/// Database assumed when none has been selected.
pub const DEFAULT_DATABASE: &str = "master";

/// Lock timeout value meaning "use the server default".
pub const DEFAULT_LOCK_TIMEOUT: i32 = -1;

// =============================================================================
// Statement Cache Constants
// =============================================================================

/// Capacity of the per-connection command cache.
pub const COMMAND_CACHE_SIZE: usize = 128;

/// Execution count at which a cached command is considered prepared.
pub const PREPARE_THRESHOLD: u32 = 3;

/// Maximum number of parameters generated for a single command.
///
/// SQL Server accepts 2100 parameters per request; the remainder is kept
/// as headroom for parameters added by the caller.
pub const MAX_PARAMETERS: usize = 2090;

/// Declared size of generated string parameters.
pub const PARAMETER_STRING_SIZE: usize = 4000;

/// Prefix of generated parameter names.
pub const PARAMETER_PREFIX: &str = "@_msparam_";

// =============================================================================
// Server Version Constants
// =============================================================================

/// Oldest major version accepted by `connect` (SQL Server 2000).
pub const MIN_SUPPORTED_MAJOR_VERSION: i32 = 8;

/// First major version exposing `sys.dm_os_host_info` (SQL Server 2017).
pub const HOST_INFO_MIN_MAJOR_VERSION: i32 = 14;

/// First major version exposing `CONNECTIONPROPERTY` (SQL Server 2008).
pub const CONNECTION_PROPERTY_MIN_MAJOR_VERSION: i32 = 10;

/// First major version supporting contained databases (SQL Server 2012).
pub const CONTAINED_AUTH_MIN_MAJOR_VERSION: i32 = 11;

// =============================================================================
// Server Error Numbers
// =============================================================================

/// Serverless database is resuming; the login may be retried.
pub const ERROR_DATABASE_RESUMING: u32 = 42109;

/// COMMIT TRANSACTION without a matching BEGIN TRANSACTION.
pub const ERROR_NO_TRANSACTION_TO_COMMIT: u32 = 3902;

/// ROLLBACK TRANSACTION without a matching BEGIN TRANSACTION.
pub const ERROR_NO_TRANSACTION_TO_ROLLBACK: u32 = 3903;

/// `sp_MSdbuserpriv` denied for the current login.
pub const ERROR_USER_PRIVILEGE_DENIED: u32 = 15517;

/// Range of login failures reported for expired or must-change passwords.
pub const REMOTE_LOGIN_FAILED_RANGE: std::ops::RangeInclusive<u32> = 18480..=18489;

/// Severity at and above which the server closes the connection.
pub const FATAL_SEVERITY: u8 = 20;

// =============================================================================
// Pool Constants
// =============================================================================

/// How long to wait for a pooled connection before failing.
pub const DEFAULT_POOL_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Logging Constants
// =============================================================================

/// Maximum characters of SQL text written to the log per statement.
pub const LOG_SQL_MAX_LEN: usize = 200;
