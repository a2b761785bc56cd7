//! Integration tests for mssql-conninfo.
//!
//! These tests support two modes:
//! 1. **Testcontainers** (default): Automatically spins up SQL Server containers
//! 2. **External server**: Connect to existing server via MSSQL_HOST env var
//!
//! ## Running with testcontainers (requires Docker):
//! ```bash
//! cargo test --test integration_tests -- --ignored --test-threads=1
//! ```
//!
//! ## Running against external server:
//! ```bash
//! MSSQL_HOST=localhost MSSQL_PORT=1433 MSSQL_PASSWORD='yourPass' \
//!   cargo test --test integration_tests -- --ignored --test-threads=1
//! ```
//!
//! ## Testing against a specific SQL Server version:
//! ```bash
//! MSSQL_TEST_VERSION=2022-latest cargo test --test integration_tests -- --ignored
//! ```
//!
//! Note: SQL Server container requires ~2GB RAM and takes 30-60 seconds to start.

use mssql_conninfo::database::enums::{
    DatabaseEngineType, DeferredUseMode, ExecutionTypes, FixedServerRoles,
    QueryParameterizationMode, SqlExecutionModes,
};
use mssql_conninfo::database::{DatabaseConnection, ExecutionOptions, SqlValue};
use mssql_conninfo::{ConnectionError, ServerConnection};
use serial_test::serial;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::mssql_server::MssqlServer;

/// Default SA password for testcontainers.
const DEFAULT_SA_PASSWORD: &str = "yourStrong(!)Password";

/// SQL Server versions supported for testing.
#[allow(dead_code)]
pub mod versions {
    pub const SQL_SERVER_2022: &str = "2022-latest";
    pub const SQL_SERVER_2019: &str = "2019-latest";

    /// Default version for tests
    pub const DEFAULT: &str = SQL_SERVER_2022;
}

fn get_test_version() -> String {
    std::env::var("MSSQL_TEST_VERSION").unwrap_or_else(|_| versions::DEFAULT.to_string())
}

fn use_external_server() -> bool {
    std::env::var("MSSQL_HOST").is_ok()
}

#[allow(dead_code)] // Variants held for lifetime management (Drop trait)
enum TestDatabaseSource {
    External,
    Container(Box<ContainerAsync<MssqlServer>>),
}

/// Test server, either external or container-managed.
struct TestDatabase {
    #[allow(dead_code)] // Held for lifetime management (Drop trait on Container)
    source: TestDatabaseSource,
    host: String,
    port: u16,
    password: String,
}

impl TestDatabase {
    async fn new() -> Self {
        if use_external_server() {
            Self::from_external()
        } else {
            Self::from_testcontainer(&get_test_version()).await
        }
    }

    fn from_external() -> Self {
        let host = std::env::var("MSSQL_HOST").expect("MSSQL_HOST must be set");
        let port = std::env::var("MSSQL_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(1433);
        let password =
            std::env::var("MSSQL_PASSWORD").unwrap_or_else(|_| DEFAULT_SA_PASSWORD.to_string());

        eprintln!("Using external SQL Server at {}:{}", host, port);

        Self {
            source: TestDatabaseSource::External,
            host,
            port,
            password,
        }
    }

    async fn from_testcontainer(version: &str) -> Self {
        eprintln!(
            "Starting SQL Server {} container via testcontainers...",
            version
        );

        let container = MssqlServer::default()
            .with_accept_eula()
            .with_tag(version)
            .start()
            .await
            .unwrap_or_else(|e| panic!("Failed to start SQL Server {} container: {}", version, e));

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(1433)
            .await
            .expect("Failed to get port");

        // Wait a bit for SQL Server to fully initialize
        tokio::time::sleep(Duration::from_secs(5)).await;

        Self {
            source: TestDatabaseSource::Container(Box::new(container)),
            host: host.to_string(),
            port,
            password: DEFAULT_SA_PASSWORD.to_string(),
        }
    }

    fn server_instance(&self) -> String {
        format!("{},{}", self.host, self.port)
    }

    /// A disconnected `sa` connection to the test server.
    fn connection(&self) -> ServerConnection {
        let mut conn = ServerConnection::with_login(&self.server_instance(), "sa", &self.password)
            .expect("Failed to build connection");
        conn.settings_mut()
            .set_trust_server_certificate(true)
            .expect("Failed to trust certificate");
        conn
    }

    async fn connect(&self) -> ServerConnection {
        let mut conn = self.connection();
        conn.connect().await.expect("Failed to connect to SQL Server");
        conn
    }
}

fn is_cancelled(error: &ConnectionError) -> bool {
    match error {
        ConnectionError::Cancelled => true,
        ConnectionError::ExecutionFailure { source } => is_cancelled(source),
        _ => false,
    }
}

// =============================================================================
// Connection Tests
// =============================================================================

mod connection_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_connect_and_discover_server() {
        let db = TestDatabase::new().await;
        let mut conn = db.connect().await;

        let manager = conn.manager_mut();
        let version = manager.server_version().await.unwrap();
        assert!(version.major >= 14, "unexpected version {}", version);
        assert_eq!(
            manager.database_engine_type().await.unwrap(),
            DatabaseEngineType::Standalone
        );
        assert_eq!(manager.host_platform().await.unwrap(), "Linux");
        assert!(!manager.is_contained_authentication().await.unwrap());

        assert_eq!(conn.true_login().await.unwrap(), "sa");
        assert!(!conn.true_name().await.unwrap().is_empty());
        assert!(conn.process_id().await.unwrap() > 0);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_sa_is_sysadmin() {
        let db = TestDatabase::new().await;
        let mut conn = db.connect().await;

        let roles = conn.fixed_server_roles().await.unwrap();
        assert!(roles.contains(FixedServerRoles::SYS_ADMIN));
        assert!(conn
            .is_in_fixed_server_role(FixedServerRoles::SYS_ADMIN)
            .await
            .unwrap());
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_wrong_password_fails_login() {
        let db = TestDatabase::new().await;
        let mut conn = ServerConnection::with_login(&db.server_instance(), "sa", "not-the-password")
            .unwrap();
        conn.settings_mut().set_trust_server_certificate(true).unwrap();

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectionFailure { .. }));
        assert_eq!(err.sql_error().map(|e| e.number), Some(18456));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_pooled_connection_closes_after_each_statement() {
        let db = TestDatabase::new().await;
        let mut conn = db.connection();

        conn.execute_non_query("select 1", ExecutionTypes::DEFAULT, true)
            .await
            .unwrap();
        assert!(!conn.is_open());
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_pooled_checkout_restores_home_database() {
        let db = TestDatabase::new().await;
        let mut conn = db.connection();

        conn.execute_non_query("USE tempdb", ExecutionTypes::DEFAULT, true)
            .await
            .unwrap();
        assert!(!conn.is_open());

        let name = conn.execute_scalar("select db_name()").await.unwrap();
        assert_eq!(name, Some(SqlValue::from("master")));
    }
}

// =============================================================================
// Execution Tests
// =============================================================================

mod execution_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_batches_and_rows_affected() {
        let db = TestDatabase::new().await;
        let mut conn = db.connect().await;

        let script = "create table #items (id int)\nGO\ninsert #items values (1)\nGO 3\nupdate #items set id = 2";
        let rows = conn
            .execute_non_query(script, ExecutionTypes::DEFAULT, true)
            .await
            .unwrap();
        assert_eq!(rows, 6);

        let count = conn.execute_scalar("select count(*) from #items").await.unwrap();
        assert_eq!(count, Some(SqlValue::I32(3)));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_execute_with_results() {
        let db = TestDatabase::new().await;
        let mut conn = db.connect().await;

        let result = conn
            .execute_with_results("select 1 as num, N'hello' as text; select 2", true)
            .await
            .unwrap()
            .expect("results");

        assert_eq!(result.result_sets.len(), 2);
        let first = &result.result_sets[0];
        assert_eq!(first.value(0, "num"), Some(&SqlValue::I32(1)));
        assert_eq!(first.value(0, "text"), Some(&SqlValue::from("hello")));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_literal_parameterization() {
        let db = TestDatabase::new().await;
        let mut conn = db.connect().await;
        conn.set_execution_options(ExecutionOptions {
            parameterization: QueryParameterizationMode::ParameterizeLiterals,
            ..ExecutionOptions::default()
        });

        let value = conn
            .execute_scalar("select N'it''s' + 'x' where 1 = 1")
            .await
            .unwrap();
        assert_eq!(value, Some(SqlValue::from("it'sx")));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_capture_mode_does_not_execute() {
        let db = TestDatabase::new().await;
        let mut conn = db.connect().await;

        conn.set_execution_modes(SqlExecutionModes::CAPTURE_SQL);
        conn.execute_non_query("create table dbo.never_created (id int)", ExecutionTypes::DEFAULT, true)
            .await
            .unwrap();
        assert_eq!(conn.manager().captured_sql().len(), 1);

        conn.set_execution_modes(SqlExecutionModes::EXECUTE_SQL);
        let exists = conn
            .execute_scalar("select object_id('dbo.never_created')")
            .await
            .unwrap();
        assert_eq!(exists, Some(SqlValue::Null));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_statement_timeout_and_cancel() {
        let db = TestDatabase::new().await;
        let mut conn = db.connect().await;

        conn.set_statement_timeout(1);
        let err = conn
            .execute_non_query("waitfor delay '00:00:05'", ExecutionTypes::DEFAULT, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("execut") || matches!(err, ConnectionError::Timeout { .. }));

        conn.set_statement_timeout(0);
        let handle = conn.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            handle.cancel();
        });
        let err = conn
            .execute_non_query("waitfor delay '00:00:10'", ExecutionTypes::DEFAULT, false)
            .await
            .unwrap_err();
        assert!(is_cancelled(&err), "unexpected error {:?}", err);
    }
}

// =============================================================================
// Transaction Tests
// =============================================================================

mod transaction_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_transaction_keeps_session_open() {
        let db = TestDatabase::new().await;
        let mut conn = db.connection();

        conn.begin_transaction().await.unwrap();
        assert!(conn.is_open());
        assert_eq!(conn.transaction_depth().await.unwrap(), 1);

        conn.rollback_transaction().await.unwrap();
        assert_eq!(conn.transaction_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_commit_without_transaction_is_guarded() {
        let db = TestDatabase::new().await;
        let mut conn = db.connect().await;

        conn.commit_transaction().await.unwrap();
        assert_eq!(conn.transaction_depth().await.unwrap(), 0);
    }
}

// =============================================================================
// Database Tests
// =============================================================================

mod database_tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_default_collation_is_case_insensitive() {
        let db = TestDatabase::new().await;
        let mut conn = db.connect().await;

        let comparer = conn.server_comparer().await.unwrap();
        assert!(comparer.equals("MASTER", "master"));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_database_connection_targets_database() {
        let db = TestDatabase::new().await;
        let mut conn = db.connect().await;

        match conn.database_connection("MASTER", true).await.unwrap() {
            DatabaseConnection::Current(_) => {}
            _ => panic!("expected the current connection"),
        }

        let other = conn.database_connection("tempdb", false).await.unwrap();
        let DatabaseConnection::Dedicated(mut tempdb) = other else {
            panic!("expected a dedicated connection");
        };
        let name = tempdb.execute_scalar("select db_name()").await.unwrap();
        assert_eq!(name, Some(SqlValue::from("tempdb")));
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    #[serial]
    async fn test_redundant_use_is_skipped() {
        let db = TestDatabase::new().await;
        let mut conn = db.connect().await;
        conn.set_execution_options(ExecutionOptions {
            deferred_use: DeferredUseMode::CollapseRedundant,
            ..ExecutionOptions::default()
        });

        conn.execute_non_query("use [master]", ExecutionTypes::DEFAULT, true)
            .await
            .unwrap();
        conn.execute_non_query("use tempdb", ExecutionTypes::DEFAULT, true)
            .await
            .unwrap();
        assert_eq!(conn.manager().current_database(), "tempdb");
    }
}
