//! Database capabilities: schema lookup, value lookup and query execution.

use serde_json::{Value, json};

use crate::capability::{Capability, string_arg};
use crate::db::{SqlDatabase, quote_ident};
use crate::error::SchemaError;

pub const LIST_TABLES: &str = "list_tables";
pub const TABLE_SCHEMA: &str = "table_schema";
pub const SEARCH_VALUES: &str = "search_values";
pub const RUN_QUERY: &str = "run_query";

const SAMPLE_ROWS: usize = 3;
const DEFAULT_SEARCH_LIMIT: u32 = 20;
const MAX_SEARCH_LIMIT: u32 = 100;

/// All database capabilities over one shared pool.
pub fn sql_capabilities(db: &SqlDatabase, max_rows: usize) -> Result<Vec<Capability>, SchemaError> {
    Ok(vec![
        list_tables(db.clone())?,
        table_schema(db.clone())?,
        search_values(db.clone())?,
        run_query(db.clone(), max_rows)?,
    ])
}

pub fn list_tables(db: SqlDatabase) -> Result<Capability, SchemaError> {
    Ok(Capability::new(
        LIST_TABLES,
        "List the names of all tables in the database.",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {},
        "required": [],
        "additionalProperties": false
    }))?
    .with_handler(move |_args, _ctx| {
        let db = db.clone();
        async move {
            let tables = db.list_tables().await?;
            Ok(if tables.is_empty() {
                "The database has no tables.".to_string()
            } else {
                tables.join(", ")
            })
        }
    }))
}

pub fn table_schema(db: SqlDatabase) -> Result<Capability, SchemaError> {
    Ok(Capability::new(
        TABLE_SCHEMA,
        "Show the columns of a table with their types and key constraints, plus a few sample rows.",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "table": {"type": "string", "description": "Exact table name."}
        },
        "required": ["table"],
        "additionalProperties": false
    }))?
    .with_handler(move |args, _ctx| {
        let db = db.clone();
        async move {
            let table = string_arg(TABLE_SCHEMA, &args, "table")?;
            let columns = db.columns(table).await?;

            let mut lines = vec![format!("Table {table}:")];
            for column in &columns {
                let mut line = format!("  {} {}", column.name, column.declared_type);
                if column.primary_key {
                    line.push_str(" PRIMARY KEY");
                }
                if column.not_null {
                    line.push_str(" NOT NULL");
                }
                lines.push(line.trim_end().to_string());
            }

            let sample = db
                .query(&format!(
                    "SELECT * FROM {} LIMIT {SAMPLE_ROWS}",
                    quote_ident(table)
                ))
                .await?;
            lines.push("Sample rows:".to_string());
            lines.push(sample.render(SAMPLE_ROWS));

            Ok(lines.join("\n"))
        }
    }))
}

pub fn search_values(db: SqlDatabase) -> Result<Capability, SchemaError> {
    Ok(Capability::new(
        SEARCH_VALUES,
        "Find distinct values of a column that contain a substring (case-insensitive). \
         Use it to confirm codes, labels and spellings before filtering on them.",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "table": {"type": "string"},
            "column": {"type": "string"},
            "substring": {"type": "string"},
            "limit": {"type": "integer", "description": "Maximum values to return (default 20, at most 100)."}
        },
        "required": ["table", "column", "substring"],
        "additionalProperties": false
    }))?
    .with_handler(move |args, _ctx| {
        let db = db.clone();
        async move {
            let table = string_arg(SEARCH_VALUES, &args, "table")?;
            let column = string_arg(SEARCH_VALUES, &args, "column")?;
            let substring = string_arg(SEARCH_VALUES, &args, "substring")?;
            let limit = args
                .get("limit")
                .and_then(Value::as_u64)
                .map(|limit| limit.clamp(1, u64::from(MAX_SEARCH_LIMIT)) as u32)
                .unwrap_or(DEFAULT_SEARCH_LIMIT);

            let values = db.search_values(table, column, substring, limit).await?;
            Ok(if values.is_empty() {
                format!("No values of {table}.{column} contain '{substring}'.")
            } else {
                format!(
                    "Values of {table}.{column} containing '{substring}': {}",
                    values.join(", ")
                )
            })
        }
    }))
}

pub fn run_query(db: SqlDatabase, max_rows: usize) -> Result<Capability, SchemaError> {
    Ok(Capability::new(
        RUN_QUERY,
        "Execute a single read-only SQL statement (SELECT or WITH) and return its rows.",
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "sql": {"type": "string"}
        },
        "required": ["sql"],
        "additionalProperties": false
    }))?
    .with_handler(move |args, _ctx| {
        let db = db.clone();
        async move {
            let sql = string_arg(RUN_QUERY, &args, "sql")?;
            let result = db.query(sql).await?;
            Ok(result.render(max_rows))
        }
    }))
}
