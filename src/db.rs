//! SQLite access shared by the SQL capabilities and the execution scorer.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, ValueRef};
use tracing::debug;

use crate::error::DbError;

const READ_ONLY_KEYWORDS: [&str; 4] = ["select", "with", "explain", "pragma"];

/// Column names plus rendered cells of a result set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl QueryResult {
    /// Renders a header line and at most `max_rows` rows.
    pub fn render(&self, max_rows: usize) -> String {
        if self.rows.is_empty() {
            return "(no rows)".to_string();
        }

        let mut lines = Vec::with_capacity(self.rows.len().min(max_rows) + 2);
        lines.push(self.columns.join(" | "));
        lines.extend(self.rows.iter().take(max_rows).map(|row| row.join(" | ")));
        if self.rows.len() > max_rows {
            lines.push(format!("... {} more rows", self.rows.len() - max_rows));
        }
        lines.join("\n")
    }

    /// Rows as an order-insensitive multiset, for result comparison.
    pub fn sorted_rows(&self) -> Vec<Vec<String>> {
        let mut rows = self.rows.clone();
        rows.sort();
        rows
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

#[derive(Clone, Debug)]
pub struct SqlDatabase {
    pool: SqlitePool,
}

impl SqlDatabase {
    /// Opens a database file read-only, e.g. `sqlite://data/mimic_iv.sqlite`.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str(url)?.read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// A private in-memory database on a single long-lived connection.
    pub async fn in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn list_tables(&self) -> Result<Vec<String>, DbError> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(DbError::from))
            .collect()
    }

    pub async fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>, DbError> {
        self.ensure_table(table).await?;

        let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<ColumnInfo, DbError> {
                Ok(ColumnInfo {
                    name: row.try_get("name")?,
                    declared_type: row.try_get("type")?,
                    not_null: row.try_get::<i64, _>("notnull")? != 0,
                    primary_key: row.try_get::<i64, _>("pk")? != 0,
                })
            })
            .collect()
    }

    /// Distinct values of `table.column` containing `needle`, case-insensitive.
    pub async fn search_values(
        &self,
        table: &str,
        column: &str,
        needle: &str,
        limit: u32,
    ) -> Result<Vec<String>, DbError> {
        let columns = self.columns(table).await?;
        if !columns.iter().any(|info| info.name.eq_ignore_ascii_case(column)) {
            return Err(DbError::UnknownColumn {
                table: table.to_string(),
                column: column.to_string(),
            });
        }

        let column = quote_ident(column);
        let sql = format!(
            "SELECT DISTINCT CAST({column} AS TEXT) AS value FROM {table} \
             WHERE {column} IS NOT NULL AND LOWER(CAST({column} AS TEXT)) LIKE ? ESCAPE '\\' \
             ORDER BY value LIMIT ?",
            table = quote_ident(table),
        );
        let pattern = format!("%{}%", escape_like(&needle.to_lowercase()));

        let rows = sqlx::query(&sql)
            .bind(pattern)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("value").map_err(DbError::from))
            .collect()
    }

    /// Runs one read-only statement and renders every cell as text.
    pub async fn query(&self, sql: &str) -> Result<QueryResult, DbError> {
        let statement = read_only_statement(sql)?;
        debug!(sql = statement, "executing query");

        let rows = sqlx::query(statement).fetch_all(&self.pool).await?;

        let columns = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|column| column.name().to_string())
                    .collect()
            })
            .unwrap_or_default();

        let rows = rows
            .iter()
            .map(|row| (0..row.len()).map(|index| render_cell(row, index)).collect())
            .collect();

        Ok(QueryResult { columns, rows })
    }

    async fn ensure_table(&self, table: &str) -> Result<(), DbError> {
        let tables = self.list_tables().await?;
        if tables.iter().any(|name| name.eq_ignore_ascii_case(table)) {
            Ok(())
        } else {
            Err(DbError::UnknownTable(table.to_string()))
        }
    }
}

/// Strips trailing semicolons and rejects anything but one read statement.
fn read_only_statement(sql: &str) -> Result<&str, DbError> {
    let (statement, rest) = sql.split_at(statement_end(sql));
    if !rest.chars().all(|c| c == ';' || c.is_whitespace()) {
        return Err(DbError::NotReadOnly);
    }
    let statement = statement.trim();

    let keyword = statement
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if READ_ONLY_KEYWORDS.contains(&keyword.as_str()) {
        Ok(statement)
    } else {
        Err(DbError::NotReadOnly)
    }
}

/// Byte offset of the first `;` outside literals, quoted identifiers and
/// comments, or the length of `sql` when there is none.
fn statement_end(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b';' => return index,
            quote @ (b'\'' | b'"' | b'`') => {
                index += 1;
                while index < bytes.len() && bytes[index] != quote {
                    index += 1;
                }
            }
            b'[' => {
                while index < bytes.len() && bytes[index] != b']' {
                    index += 1;
                }
            }
            b'-' if bytes.get(index + 1) == Some(&b'-') => {
                while index < bytes.len() && bytes[index] != b'\n' {
                    index += 1;
                }
            }
            b'/' if bytes.get(index + 1) == Some(&b'*') => {
                index += 2;
                while index + 1 < bytes.len() && !(bytes[index] == b'*' && bytes[index + 1] == b'/') {
                    index += 1;
                }
                index += 1;
            }
            _ => {}
        }
        index += 1;
    }
    bytes.len()
}

fn render_cell(row: &SqliteRow, index: usize) -> String {
    match row.try_get_raw(index) {
        Ok(value) if value.is_null() => return "NULL".to_string(),
        Ok(_) => {}
        Err(_) => return "?".to_string(),
    }

    if let Ok(value) = row.try_get::<i64, _>(index) {
        return value.to_string();
    }
    if let Ok(value) = row.try_get::<f64, _>(index) {
        return value.to_string();
    }
    if let Ok(value) = row.try_get::<String, _>(index) {
        return value;
    }
    if let Ok(value) = row.try_get::<Vec<u8>, _>(index) {
        return format!("<{} bytes>", value.len());
    }
    "?".to_string()
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) async fn seeded() -> SqlDatabase {
        let db = SqlDatabase::in_memory().await.expect("in-memory db");
        sqlx::raw_sql(
            "CREATE TABLE patients (subject_id INTEGER PRIMARY KEY, gender TEXT NOT NULL, anchor_age INTEGER);
             CREATE TABLE labevents (subject_id INTEGER, label TEXT, valuenum REAL);
             INSERT INTO patients VALUES (1, 'F', 52), (2, 'M', 67), (3, 'F', NULL);
             INSERT INTO labevents VALUES (1, 'Hemoglobin', 11.5), (2, 'Hemoglobin A1c', 6.1), (2, 'Glucose', 140.0), (3, '50%_Dextrose', 1.0);",
        )
        .execute(db.pool())
        .await
        .expect("seed");
        db
    }

    #[tokio::test]
    async fn lists_tables_and_columns() {
        let db = seeded().await;

        assert_eq!(
            db.list_tables().await.expect("tables"),
            vec!["labevents".to_string(), "patients".to_string()]
        );

        let columns = db.columns("patients").await.expect("columns");
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0].name, "subject_id");
        assert!(columns[0].primary_key);
        assert!(columns[1].not_null);
        assert_eq!(columns[2].declared_type, "INTEGER");

        assert!(matches!(
            db.columns("admissions").await,
            Err(DbError::UnknownTable(name)) if name == "admissions"
        ));
    }

    #[tokio::test]
    async fn value_search_is_case_insensitive_and_escapes_wildcards() {
        let db = seeded().await;

        let values = db
            .search_values("labevents", "label", "HEMO", 10)
            .await
            .expect("search");
        assert_eq!(values, vec!["Hemoglobin", "Hemoglobin A1c"]);

        let values = db
            .search_values("labevents", "label", "%_", 10)
            .await
            .expect("search");
        assert_eq!(values, vec!["50%_Dextrose"]);

        assert!(matches!(
            db.search_values("labevents", "unit", "mg", 10).await,
            Err(DbError::UnknownColumn { .. })
        ));
    }

    #[tokio::test]
    async fn query_renders_cells_and_truncates() {
        let db = seeded().await;

        let result = db
            .query("SELECT subject_id, gender, anchor_age FROM patients ORDER BY subject_id;")
            .await
            .expect("query");
        assert_eq!(result.columns, vec!["subject_id", "gender", "anchor_age"]);
        assert_eq!(result.rows[2], vec!["3", "F", "NULL"]);

        let rendered = result.render(2);
        assert_eq!(
            rendered,
            "subject_id | gender | anchor_age\n1 | F | 52\n2 | M | 67\n... 1 more rows"
        );

        let real = db
            .query("SELECT valuenum FROM labevents WHERE label = 'Hemoglobin'")
            .await
            .expect("query");
        assert_eq!(real.rows, vec![vec!["11.5".to_string()]]);

        let empty = db
            .query("SELECT * FROM patients WHERE subject_id = 99")
            .await
            .expect("query");
        assert_eq!(empty.render(10), "(no rows)");
    }

    #[tokio::test]
    async fn writes_and_multiple_statements_are_rejected() {
        let db = seeded().await;

        assert!(matches!(
            db.query("DELETE FROM patients").await,
            Err(DbError::NotReadOnly)
        ));
        assert!(matches!(
            db.query("SELECT 1; DROP TABLE patients").await,
            Err(DbError::NotReadOnly)
        ));
        assert!(matches!(
            db.query("SELECT 'a;b'; DELETE FROM patients").await,
            Err(DbError::NotReadOnly)
        ));
        assert_eq!(db.list_tables().await.expect("tables").len(), 2);
    }

    #[tokio::test]
    async fn semicolons_inside_literals_and_comments_are_not_separators() {
        let db = seeded().await;

        let result = db
            .query("SELECT label FROM labevents WHERE label <> 'a;b' ORDER BY label;;")
            .await
            .expect("single statement");
        assert_eq!(result.rows.len(), 4);

        let result = db
            .query("SELECT \"subject_id\" /* ids; only */ FROM patients -- trailing; note\n")
            .await
            .expect("single statement");
        assert_eq!(result.rows.len(), 3);

        assert_eq!(statement_end("SELECT 'it''s;' ; SELECT 2"), 16);
        assert_eq!(statement_end("SELECT [a;b] FROM t"), 19);
    }

    #[tokio::test]
    async fn table_names_match_case_insensitively() {
        let db = seeded().await;

        let columns = db.columns("Patients").await.expect("columns");
        assert_eq!(columns.len(), 3);

        let values = db
            .search_values("LABEVENTS", "LABEL", "gluc", 5)
            .await
            .expect("search");
        assert_eq!(values, vec!["Glucose"]);
    }
}
