//! # mssql-conninfo
//!
//! Connection management and statement execution for Microsoft SQL Server.
//!
//! This crate provides:
//! - **Settings**: Connection properties that generate and parse connection strings
//! - **Connections**: Lazily opened, pool-friendly sessions with reconnect on failure
//! - **Execution**: Batch splitting, parameterization, capture mode and command caching
//! - **Metadata**: Server version, edition, engine type and login roles
//! - **Comparison**: Collation-aware name comparison and per-database connections
//!
//! ## Example
//!
//! ```no_run
//! use mssql_conninfo::ServerConnection;
//!
//! # async fn run() -> Result<(), mssql_conninfo::ConnectionError> {
//! let mut conn = ServerConnection::with_login("localhost,1433", "sa", "secret")?;
//! let version = conn.manager_mut().server_version().await?;
//! let rows = conn.execute_non_query("update t set x = 1", Default::default(), false).await?;
//! println!("{} rows affected on {}", rows, version);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod resilience;

pub use config::Config;
pub use database::{ConnectionManager, ConnectionSettings, ServerConnection};
pub use error::{ConnectionError, SqlError};
pub use resilience::RetryConfig;
