//! `mssql-conninfo` command-line entry point.
//!
//! Connects using the `MSSQL_*` environment variables, prints what it learns
//! about the server and the login, and optionally runs a script.
//!
//! Usage:
//!   mssql-conninfo              print server information
//!   mssql-conninfo "<sql>"      also run the given script
//!   mssql-conninfo -            also run a script read from stdin
//!
//! Ctrl-C cancels a running statement.

use anyhow::{Context, Result};
use mssql_conninfo::database::enums::FixedServerRoles;
use mssql_conninfo::{Config, ServerConnection};
use std::io::Read;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries results
    init_logging();

    let config = Config::from_env().context("Failed to load configuration")?;
    let script = read_script()?;

    let mut conn = config.server_connection().await?;
    conn.connect()
        .await
        .with_context(|| format!("Failed to connect to {}", conn.settings().server_instance()))?;
    info!("Connected to {}", conn.settings().server_instance());

    print_server_info(&mut conn).await?;

    if let Some(script) = script {
        let cancel = conn.cancel_handle();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling");
                cancel.cancel();
            }
        });

        let outcome = conn.execute_with_results(&script, true).await;
        watcher.abort();

        match outcome? {
            Some(result) if !result.result_sets.is_empty() => {
                println!();
                println!("{}", result.to_markdown_table());
            }
            _ => println!("\nCommands completed successfully."),
        }
    }

    conn.disconnect().await;
    Ok(())
}

async fn print_server_info(conn: &mut ServerConnection) -> Result<()> {
    let manager = conn.manager_mut();
    let version = manager.server_version().await?;
    let product_version = manager.product_version().await?;
    let engine_type = manager.database_engine_type().await?;
    let edition = manager.database_engine_edition().await?;
    let platform = manager.host_platform().await?;
    let protocol = manager.connection_protocol().await?;
    let database = manager.current_database();

    println!("Server version:   {}", version);
    println!("Product version:  {}", product_version);
    println!("Engine type:      {}", engine_type);
    println!("Engine edition:   {}", edition);
    println!("Host platform:    {}", platform);
    println!("Protocol:         {}", protocol);
    println!("Database:         {}", database);

    println!("Server name:      {}", conn.true_name().await?);
    println!("Login:            {}", conn.true_login().await?);

    let roles = conn.fixed_server_roles().await?;
    let names: Vec<&str> = FixedServerRoles::NAMED
        .iter()
        .filter(|(_, role)| roles.contains(*role))
        .map(|(name, _)| *name)
        .collect();
    println!(
        "Server roles:     {}",
        if names.is_empty() {
            "(none)".to_string()
        } else {
            names.join(", ")
        }
    );
    Ok(())
}

fn read_script() -> Result<Option<String>> {
    match std::env::args().nth(1).as_deref() {
        None => Ok(None),
        Some("-") => {
            let mut script = String::new();
            std::io::stdin()
                .read_to_string(&mut script)
                .context("Failed to read script from stdin")?;
            Ok(Some(script))
        }
        Some(sql) => Ok(Some(sql.to_string())),
    }
}

/// Initialize tracing subscriber with stderr output.
fn init_logging() {
    let filter = std::env::var("RUST_LOG")
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new("warn,mssql_conninfo=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
