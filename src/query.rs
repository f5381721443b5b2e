//! Statement execution, parameter binding and row conversion

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::mysql::{MySqlArguments, MySqlColumn, MySqlRow};
use sqlx::query::Query;
use sqlx::types::chrono;
use sqlx::{Column, MySql, MySqlConnection, Row, TypeInfo, ValueRef};
use tracing::{debug, error};

use crate::{PoolError, Result};

/// Keywords whose statements produce a result set
const ROW_RETURNING_KEYWORDS: [&str; 6] = ["SELECT", "SHOW", "DESCRIBE", "DESC", "EXPLAIN", "WITH"];

/// MySQL error numbers for rejected credentials or database access
const ACCESS_DENIED_CODES: [&str; 2] = ["1044", "1045"];

/// Column metadata information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// MySQL data type
    pub data_type: String,
}

/// Outcome of a single statement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryOutcome {
    Rows {
        columns: Vec<ColumnInfo>,
        rows: Vec<Vec<Value>>,
    },
    Modified {
        insert_id: u64,
        affected_rows: u64,
    },
}

impl QueryOutcome {
    pub fn rows(&self) -> Option<&[Vec<Value>]> {
        match self {
            QueryOutcome::Rows { rows, .. } => Some(rows),
            QueryOutcome::Modified { .. } => None,
        }
    }

    pub fn affected_rows(&self) -> Option<u64> {
        match self {
            QueryOutcome::Rows { .. } => None,
            QueryOutcome::Modified { affected_rows, .. } => Some(*affected_rows),
        }
    }
}

/// Whether the statement yields rows rather than a modification count
pub fn returns_rows(sql: &str) -> bool {
    let first = sql
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_uppercase();
    ROW_RETURNING_KEYWORDS.contains(&first.as_str())
}

/// Bind JSON parameters in order
pub fn bind_params<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: &[Value],
) -> Query<'q, MySql, MySqlArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else if let Some(u) = n.as_u64() {
                    query.bind(u)
                } else {
                    query.bind(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => query.bind(s.clone()),
            Value::Array(_) | Value::Object(_) => query.bind(param.to_string()),
        };
    }
    query
}

/// Map a driver error to the crate taxonomy
pub fn classify_sql_error(environment: &str, sql: &str, err: sqlx::Error) -> PoolError {
    match &err {
        sqlx::Error::Database(_) => {
            let code = PoolError::extract_mysql_error_code(&err);
            if code.as_deref().map_or(false, |c| ACCESS_DENIED_CODES.contains(&c)) {
                PoolError::authentication_error(environment, err.to_string())
            } else {
                PoolError::query_error(sql, err)
            }
        }
        sqlx::Error::PoolTimedOut => PoolError::acquire_timeout(environment, 0),
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            PoolError::transport_error(environment, err.to_string())
        }
        _ => PoolError::query_error(sql, err),
    }
}

/// Execute one statement on a connection
pub async fn execute_statement(
    environment: &str,
    connection: &mut MySqlConnection,
    sql: &str,
    params: &[Value],
) -> Result<QueryOutcome> {
    if sql.trim().is_empty() {
        return Err(PoolError::configuration_error("sql", "SQL statement cannot be empty"));
    }
    debug!("Executing statement on environment '{}': {}", environment, sql);

    let query = bind_params(sqlx::query(sql), params);

    if returns_rows(sql) {
        let rows = query
            .fetch_all(&mut *connection)
            .await
            .map_err(|e| classify_sql_error(environment, sql, e))?;
        convert_rows(&rows).map_err(|e| classify_sql_error(environment, sql, e))
    } else {
        let result = query
            .execute(&mut *connection)
            .await
            .map_err(|e| classify_sql_error(environment, sql, e))?;
        debug!("Statement affected {} rows", result.rows_affected());
        Ok(QueryOutcome::Modified {
            insert_id: result.last_insert_id(),
            affected_rows: result.rows_affected(),
        })
    }
}

fn convert_rows(rows: &[MySqlRow]) -> sqlx::Result<QueryOutcome> {
    let columns = rows
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|col| ColumnInfo {
                    name: col.name().to_string(),
                    data_type: col.type_info().name().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    let mut converted = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = Vec::with_capacity(row.columns().len());
        for (index, column) in row.columns().iter().enumerate() {
            values.push(convert_value(row, index, column)?);
        }
        converted.push(values);
    }

    Ok(QueryOutcome::Rows {
        columns,
        rows: converted,
    })
}

fn float_value(val: f64) -> Value {
    serde_json::Number::from_f64(val)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(val.to_string()))
}

/// Convert a MySQL value to JSON according to its column type
fn convert_value(row: &MySqlRow, index: usize, column: &MySqlColumn) -> sqlx::Result<Value> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(Value::Null);
    }

    let type_name = column.type_info().name();
    let value = match type_name {
        "TINYINT" => Value::from(row.try_get::<i8, _>(index)?),
        "SMALLINT" => Value::from(row.try_get::<i16, _>(index)?),
        "MEDIUMINT" | "INT" => Value::from(row.try_get::<i32, _>(index)?),
        "BIGINT" => Value::from(row.try_get::<i64, _>(index)?),
        "TINYINT UNSIGNED" => Value::from(row.try_get::<u8, _>(index)?),
        "SMALLINT UNSIGNED" => Value::from(row.try_get::<u16, _>(index)?),
        "MEDIUMINT UNSIGNED" | "INT UNSIGNED" => Value::from(row.try_get::<u32, _>(index)?),
        "BIGINT UNSIGNED" => {
            let val: u64 = row.try_get(index)?;
            // Beyond i64 the value is kept exact as text
            if val > i64::MAX as u64 {
                Value::String(val.to_string())
            } else {
                Value::from(val)
            }
        }
        "FLOAT" => float_value(row.try_get::<f32, _>(index)? as f64),
        "DOUBLE" => float_value(row.try_get::<f64, _>(index)?),
        "DECIMAL" | "NUMERIC" => match row.try_get::<String, _>(index) {
            Ok(val) => Value::String(val),
            Err(_) => float_value(row.try_get::<f64, _>(index)?),
        },
        "BOOLEAN" | "BOOL" => Value::Bool(row.try_get(index)?),
        "CHAR" | "VARCHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM" | "SET" => {
            Value::String(row.try_get(index)?)
        }
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
            use base64::{engine::general_purpose, Engine as _};
            let val: Vec<u8> = row.try_get(index)?;
            Value::String(general_purpose::STANDARD.encode(val))
        }
        "DATE" => Value::String(row.try_get::<chrono::NaiveDate, _>(index)?.to_string()),
        "TIME" => Value::String(row.try_get::<chrono::NaiveTime, _>(index)?.to_string()),
        "DATETIME" => Value::String(row.try_get::<chrono::NaiveDateTime, _>(index)?.to_string()),
        "TIMESTAMP" => Value::String(row.try_get::<chrono::DateTime<chrono::Utc>, _>(index)?.to_rfc3339()),
        "JSON" => row.try_get::<Value, _>(index)?,
        _ => match row.try_get::<String, _>(index) {
            Ok(val) => Value::String(val),
            Err(e) => {
                error!("Failed to convert MySQL type '{}' to JSON: {}", type_name, e);
                Value::Null
            }
        },
    };
    Ok(value)
}
