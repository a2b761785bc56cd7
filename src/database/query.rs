//! Query results and result-stream processing.

use crate::database::types::{SqlValue, TypeMapper};
use crate::error::ConnectionError;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tiberius::QueryStream;

/// Information about a result column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name (empty for unnamed expressions).
    pub name: String,

    /// SQL type name.
    pub sql_type: String,

    /// Whether the column is nullable.
    pub nullable: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: true,
        }
    }
}

/// A single row of query results, in column order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultRow {
    pub values: Vec<SqlValue>,
}

impl ResultRow {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    /// Get a value by ordinal.
    pub fn get(&self, idx: usize) -> Option<&SqlValue> {
        self.values.get(idx)
    }
}

/// One result set: column metadata plus rows.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<ResultRow>,
}

impl ResultSet {
    pub fn new(columns: Vec<ColumnInfo>, rows: Vec<ResultRow>) -> Self {
        Self { columns, rows }
    }

    /// Ordinal of a column, compared case-insensitively.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Value of a named column in the given row.
    pub fn value(&self, row: usize, column: &str) -> Option<&SqlValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)
    }

    /// Format the result set as a markdown table.
    pub fn to_markdown_table(&self) -> String {
        let mut output = String::new();

        // Header row
        let headers: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        output.push_str("| ");
        output.push_str(&headers.join(" | "));
        output.push_str(" |\n");

        // Separator row
        output.push_str("| ");
        output.push_str(
            &headers
                .iter()
                .map(|h| "-".repeat(h.len().max(3)))
                .collect::<Vec<_>>()
                .join(" | "),
        );
        output.push_str(" |\n");

        // Data rows
        for row in &self.rows {
            output.push_str("| ");
            let values: Vec<String> = (0..self.columns.len())
                .map(|idx| {
                    row.get(idx)
                        .map(|v| v.to_display_string())
                        .unwrap_or_else(|| "NULL".to_string())
                })
                .collect();
            output.push_str(&values.join(" | "));
            output.push_str(" |\n");
        }

        output.push_str(&format!("\n_{} row(s)_", self.rows.len()));
        output
    }

    /// Format the result set as CSV.
    pub fn to_csv(&self) -> String {
        if self.columns.is_empty() {
            return String::new();
        }

        let mut output = String::new();

        let headers: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        output.push_str(&headers.join(","));
        output.push('\n');

        for row in &self.rows {
            let values: Vec<String> = (0..self.columns.len())
                .map(|idx| {
                    let value = row.get(idx).map(|v| v.to_display_string()).unwrap_or_default();
                    // Escape CSV values
                    if value.contains(',') || value.contains('"') || value.contains('\n') {
                        format!("\"{}\"", value.replace('"', "\"\""))
                    } else {
                        value
                    }
                })
                .collect();
            output.push_str(&values.join(","));
            output.push('\n');
        }

        output
    }
}

/// Result of executing a batch: every result set it produced.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// Result sets in the order the server returned them.
    pub result_sets: Vec<ResultSet>,

    /// Number of rows affected (for INSERT/UPDATE/DELETE).
    pub rows_affected: u64,

    /// Execution time in milliseconds.
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Create an empty query result.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A result holding a single unnamed value.
    pub fn single_value(value: SqlValue) -> Self {
        Self::from_set(ResultSet::new(
            vec![ColumnInfo::new("", "UNKNOWN")],
            vec![ResultRow::new(vec![value])],
        ))
    }

    /// A result holding one result set.
    pub fn from_set(set: ResultSet) -> Self {
        Self {
            result_sets: vec![set],
            ..Self::default()
        }
    }

    /// First result set, if any.
    pub fn first(&self) -> Option<&ResultSet> {
        self.result_sets.first()
    }

    /// First column of the first row of the first result set.
    pub fn scalar(&self) -> Option<&SqlValue> {
        self.first()?.rows.first()?.get(0)
    }

    /// Format every result set as markdown tables.
    pub fn to_markdown_table(&self) -> String {
        if self.result_sets.is_empty() {
            if self.rows_affected > 0 {
                return format!(
                    "Query executed successfully. {} row(s) affected.",
                    self.rows_affected
                );
            }
            return "Query executed successfully. No results returned.".to_string();
        }

        let mut output = self
            .result_sets
            .iter()
            .map(ResultSet::to_markdown_table)
            .collect::<Vec<_>>()
            .join("\n\n");
        output.push_str(&format!(" _({} ms)_", self.execution_time_ms));
        output
    }
}

/// Drain a query stream into a [`QueryResult`], one result set per metadata token.
pub async fn collect_results(
    mut stream: QueryStream<'_>,
    start: Instant,
) -> Result<QueryResult, ConnectionError> {
    use futures_util::stream::TryStreamExt;

    let mut result_sets: Vec<ResultSet> = Vec::new();

    while let Some(item) = stream.try_next().await? {
        match item {
            tiberius::QueryItem::Metadata(meta) => {
                let columns = meta
                    .columns()
                    .iter()
                    .map(|col| ColumnInfo {
                        name: col.name().to_string(),
                        sql_type: TypeMapper::sql_type_name(col).to_string(),
                        // Tiberius doesn't expose nullable info at the column type level
                        nullable: true,
                    })
                    .collect();
                result_sets.push(ResultSet::new(columns, Vec::new()));
            }
            tiberius::QueryItem::Row(row) => {
                let width = row.columns().len();
                let values = (0..width)
                    .map(|idx| TypeMapper::extract_column(&row, idx))
                    .collect();
                match result_sets.last_mut() {
                    Some(set) => set.rows.push(ResultRow::new(values)),
                    None => return Err(ConnectionError::internal("Row received before metadata")),
                }
            }
        }
    }

    Ok(QueryResult {
        result_sets,
        rows_affected: 0,
        execution_time_ms: start.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> ResultSet {
        ResultSet::new(
            vec![ColumnInfo::new("id", "INT"), ColumnInfo::new("name", "VARCHAR")],
            vec![
                ResultRow::new(vec![SqlValue::I32(1), SqlValue::from("Alice")]),
                ResultRow::new(vec![SqlValue::I32(2), SqlValue::from("value, with comma")]),
            ],
        )
    }

    #[test]
    fn test_value_lookup() {
        let set = people();
        assert_eq!(set.value(0, "NAME"), Some(&SqlValue::from("Alice")));
        assert_eq!(set.value(5, "name"), None);
        assert_eq!(set.column_index("missing"), None);
    }

    #[test]
    fn test_query_result_empty() {
        let result = QueryResult::empty();
        assert!(result.result_sets.is_empty());
        assert!(result.scalar().is_none());
        assert_eq!(result.rows_affected, 0);
    }

    #[test]
    fn test_scalar() {
        let result = QueryResult::single_value(SqlValue::I32(42));
        assert_eq!(result.scalar(), Some(&SqlValue::I32(42)));
    }

    #[test]
    fn test_markdown_table() {
        let mut result = QueryResult::from_set(people());
        result.execution_time_ms = 5;

        let md = result.to_markdown_table();
        assert!(md.contains("| id | name |"));
        assert!(md.contains("| 1 | Alice |"));
        assert!(md.contains("2 row(s)"));
        assert!(md.contains("(5 ms)"));
    }

    #[test]
    fn test_markdown_without_results() {
        let mut result = QueryResult::empty();
        result.rows_affected = 3;
        assert_eq!(
            result.to_markdown_table(),
            "Query executed successfully. 3 row(s) affected."
        );
    }

    #[test]
    fn test_csv_output() {
        let csv = people().to_csv();
        assert!(csv.starts_with("id,name\n"));
        assert!(csv.contains("\"value, with comma\"")); // Should be quoted
    }
}
