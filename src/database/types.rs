//! SQL Server type mapping to Rust types.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tiberius::{ColumnType, Row};
use uuid::Uuid;

/// A SQL value that can be serialized to JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    U8(u8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Decimal(Decimal),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
}

impl SqlValue {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Integer value, widening smaller integer types and whole decimals.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::U8(v) => Some(i64::from(*v)),
            SqlValue::I16(v) => Some(i64::from(*v)),
            SqlValue::I32(v) => Some(i64::from(*v)),
            SqlValue::I64(v) => Some(*v),
            SqlValue::Bool(v) => Some(i64::from(*v)),
            SqlValue::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().and_then(|v| i32::try_from(v).ok())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(v) => Some(*v),
            other => other.as_i64().map(|v| v != 0),
        }
    }

    /// Convert to a display string.
    pub fn to_display_string(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(v) => v.to_string(),
            SqlValue::U8(v) => v.to_string(),
            SqlValue::I16(v) => v.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F32(v) => v.to_string(),
            SqlValue::F64(v) => v.to_string(),
            SqlValue::String(v) => v.clone(),
            SqlValue::Bytes(v) => format!("0x{}", hex::encode(v)),
            SqlValue::Decimal(v) => v.to_string(),
            SqlValue::Uuid(v) => v.to_string(),
            SqlValue::Date(v) => v.to_string(),
            SqlValue::Time(v) => v.to_string(),
            SqlValue::DateTime(v) => v.to_string(),
            SqlValue::DateTimeOffset(v) => v.to_rfc3339(),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::String(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::String(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::I32(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::I64(value)
    }
}

/// Type mapper for converting SQL Server types to Rust types.
pub struct TypeMapper;

impl TypeMapper {
    /// Extract a value from a Tiberius row column.
    pub fn extract_column(row: &Row, idx: usize) -> SqlValue {
        let Some(col) = row.columns().get(idx) else {
            return SqlValue::Null;
        };

        let typed = match col.column_type() {
            ColumnType::Bit | ColumnType::Bitn => get(row, idx).map(SqlValue::Bool),
            ColumnType::Int1 => get(row, idx).map(SqlValue::U8),
            ColumnType::Int2 => get(row, idx).map(SqlValue::I16),
            ColumnType::Int4 => get(row, idx).map(SqlValue::I32),
            ColumnType::Int8 => get(row, idx).map(SqlValue::I64),
            ColumnType::Float4 => get(row, idx).map(SqlValue::F32),
            ColumnType::Float8 => get(row, idx).map(SqlValue::F64),
            ColumnType::Guid => get(row, idx).map(SqlValue::Uuid),
            ColumnType::Daten => get(row, idx).map(SqlValue::Date),
            ColumnType::Timen => get(row, idx).map(SqlValue::Time),
            ColumnType::DatetimeOffsetn => get(row, idx).map(SqlValue::DateTimeOffset),
            ColumnType::Datetime
            | ColumnType::Datetime4
            | ColumnType::Datetimen
            | ColumnType::Datetime2 => get(row, idx).map(SqlValue::DateTime),
            ColumnType::BigVarChar
            | ColumnType::BigChar
            | ColumnType::NVarchar
            | ColumnType::NChar
            | ColumnType::Text
            | ColumnType::NText => row
                .try_get::<&str, _>(idx)
                .ok()
                .flatten()
                .map(|s| SqlValue::String(s.to_string())),
            ColumnType::BigVarBin | ColumnType::BigBinary | ColumnType::Image => row
                .try_get::<&[u8], _>(idx)
                .ok()
                .flatten()
                .map(|b| SqlValue::Bytes(b.to_vec())),
            _ => None,
        };

        typed.unwrap_or_else(|| Self::extract_any(row, idx))
    }

    /// Try each supported type in order of likelihood.
    fn extract_any(row: &Row, idx: usize) -> SqlValue {
        // Strings (most common)
        if let Some(v) = row.try_get::<&str, _>(idx).ok().flatten() {
            return SqlValue::String(v.to_string());
        }

        // Integers
        if let Some(v) = get::<i32>(row, idx) {
            return SqlValue::I32(v);
        }
        if let Some(v) = get::<i64>(row, idx) {
            return SqlValue::I64(v);
        }
        if let Some(v) = get::<i16>(row, idx) {
            return SqlValue::I16(v);
        }
        if let Some(v) = get::<u8>(row, idx) {
            return SqlValue::U8(v);
        }

        // Decimal before floating point so NUMERIC keeps its precision
        if let Some(v) = get::<Decimal>(row, idx) {
            return SqlValue::Decimal(v);
        }
        if let Some(v) = get::<f64>(row, idx) {
            return SqlValue::F64(v);
        }
        if let Some(v) = get::<f32>(row, idx) {
            return SqlValue::F32(v);
        }

        // Boolean
        if let Some(v) = get::<bool>(row, idx) {
            return SqlValue::Bool(v);
        }

        // UUID
        if let Some(v) = get::<Uuid>(row, idx) {
            return SqlValue::Uuid(v);
        }

        // Date/Time types
        if let Some(v) = get::<NaiveDateTime>(row, idx) {
            return SqlValue::DateTime(v);
        }
        if let Some(v) = get::<NaiveDate>(row, idx) {
            return SqlValue::Date(v);
        }
        if let Some(v) = get::<NaiveTime>(row, idx) {
            return SqlValue::Time(v);
        }
        if let Some(v) = get::<DateTime<FixedOffset>>(row, idx) {
            return SqlValue::DateTimeOffset(v);
        }

        // Binary
        if let Some(v) = row.try_get::<&[u8], _>(idx).ok().flatten() {
            return SqlValue::Bytes(v.to_vec());
        }

        // Fall back to NULL for unsupported types
        SqlValue::Null
    }

    /// Get the SQL type name for a column.
    pub fn sql_type_name(col: &tiberius::Column) -> &'static str {
        match col.column_type() {
            ColumnType::Null => "NULL",
            ColumnType::Int1 => "TINYINT",
            ColumnType::Int2 => "SMALLINT",
            ColumnType::Int4 => "INT",
            ColumnType::Int8 => "BIGINT",
            ColumnType::Float4 => "REAL",
            ColumnType::Float8 => "FLOAT",
            ColumnType::Money => "MONEY",
            ColumnType::Money4 => "SMALLMONEY",
            ColumnType::Datetime => "DATETIME",
            ColumnType::Datetime4 => "SMALLDATETIME",
            ColumnType::Bit => "BIT",
            ColumnType::Guid => "UNIQUEIDENTIFIER",
            ColumnType::Decimaln => "DECIMAL",
            ColumnType::Numericn => "NUMERIC",
            ColumnType::Bitn => "BIT",
            ColumnType::Intn => "INT",
            ColumnType::Floatn => "FLOAT",
            ColumnType::Datetimen => "DATETIME",
            ColumnType::Daten => "DATE",
            ColumnType::Timen => "TIME",
            ColumnType::Datetime2 => "DATETIME2",
            ColumnType::DatetimeOffsetn => "DATETIMEOFFSET",
            ColumnType::BigVarBin => "VARBINARY",
            ColumnType::BigVarChar => "VARCHAR",
            ColumnType::BigBinary => "BINARY",
            ColumnType::BigChar => "CHAR",
            ColumnType::NVarchar => "NVARCHAR",
            ColumnType::NChar => "NCHAR",
            ColumnType::Xml => "XML",
            ColumnType::Text => "TEXT",
            ColumnType::Image => "IMAGE",
            ColumnType::NText => "NTEXT",
            ColumnType::SSVariant => "SQL_VARIANT",
            _ => "UNKNOWN",
        }
    }
}

fn get<'a, T>(row: &'a Row, idx: usize) -> Option<T>
where
    T: tiberius::FromSql<'a>,
{
    row.try_get::<T, _>(idx).ok().flatten()
}

/// Hex encoding helper.
pub(crate) mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02X}", b)).collect()
    }
}
