//! Connection management, execution and server metadata.

pub mod auth;
pub mod backend;
pub mod batch;
pub mod capture;
pub mod comparer;
pub mod connection;
pub mod connection_string;
pub mod enums;
pub mod identifiers;
pub mod parameterize;
pub mod query;
pub mod server_connection;
pub mod server_info;
pub mod settings;
pub mod tds;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use auth::{RenewableToken, StaticToken};
pub use backend::{Connector, ParameterValue, SqlCommand, SqlParameter, SqlSession};
pub use capture::{CapturedSql, StatementEvent, StatementListener};
pub use comparer::{CompareOptions, ConnectionFactory, ServerComparer};
pub use connection::{CancelHandle, ConnectionManager};
pub use connection_string::{ConnectionStringBuilder, DataSource};
pub use enums::{
    ApplicationIntent, AuthenticationMethod, AutoDisconnectMode, DatabaseEngineEdition,
    DatabaseEngineType, DeferredUseMode, EncryptOption, ExecutionTypes, FixedServerRoles,
    NetworkProtocol, QueryParameterizationMode, ServerType, ServerUserProfiles, SqlExecutionModes,
};
pub use query::{ColumnInfo, QueryResult, ResultRow, ResultSet};
pub use server_connection::{DatabaseConnection, ExecutionOptions, ServerConnection};
pub use server_info::{ProductVersion, ServerInformation, ServerVersion};
pub use settings::ConnectionSettings;
pub use tds::{clear_pools, pool_status, PoolStatus, TdsConnector};
pub use types::SqlValue;
