//! PostgreSQL [`reporter::ports::DatasourceConnection`] adapter, built on
//! `sqlx`. One [`PostgresConnection`] is constructed per configured
//! relational datasource; `connect` opens (or reopens, after a heal) the
//! pool behind a lock so `query`/`probe` always see a consistent handle.

use async_trait::async_trait;
use reporter::datasource::DatasourceConfig;
use reporter::ports::{DatasourceConnection, Row, SchemaInfo};
use reporter::ReportError;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, Row as SqlxRow, TypeInfo};
use std::collections::HashMap;
use tokio::sync::RwLock;

pub struct PostgresConnection {
    config: DatasourceConfig,
    pool: RwLock<Option<sqlx::PgPool>>,
}

impl PostgresConnection {
    pub fn new(config: DatasourceConfig) -> Self {
        Self { config, pool: RwLock::new(None) }
    }

    async fn pool(&self) -> Result<sqlx::PgPool, ReportError> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| ReportError::unknown_msg("postgres connection not yet established"))
    }
}

/// Double-quote a SQL identifier, escaping embedded quotes. Table/field
/// names come from trusted template/query config, not end-user input, but
/// this still avoids building malformed SQL on names containing spaces.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn pg_row_to_map(row: &PgRow, fields: &[String]) -> Row {
    let mut out = HashMap::with_capacity(fields.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let name = fields.get(idx).cloned().unwrap_or_else(|| column.name().to_string());
        let value = pg_value_to_json(row, idx, column.type_info().name());
        out.insert(name, value);
    }
    out
}

fn pg_value_to_json(row: &PgRow, idx: usize, type_name: &str) -> Value {
    match type_name {
        "INT2" | "INT4" => row.try_get::<i32, _>(idx).map(Value::from).unwrap_or(Value::Null),
        "INT8" => row.try_get::<i64, _>(idx).map(Value::from).unwrap_or(Value::Null),
        "FLOAT4" | "FLOAT8" | "NUMERIC" => row.try_get::<f64, _>(idx).map(Value::from).unwrap_or(Value::Null),
        "BOOL" => row.try_get::<bool, _>(idx).map(Value::from).unwrap_or(Value::Null),
        "JSON" | "JSONB" => row.try_get::<Value, _>(idx).unwrap_or(Value::Null),
        _ => row
            .try_get::<String, _>(idx)
            .map(Value::from)
            .unwrap_or(Value::Null),
    }
}

#[async_trait]
impl DatasourceConnection for PostgresConnection {
    async fn connect(&self) -> Result<(), ReportError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&self.config.connection_string())
            .await
            .map_err(|e| {
                tracing::error!(name = %self.config.name, dsn = %self.config.redacted_connection_string(), error = %e, "postgres connect failed");
                ReportError::unknown(e)
            })?;
        *self.pool.write().await = Some(pool);
        Ok(())
    }

    async fn probe(&self) -> Result<(), ReportError> {
        let pool = self.pool().await?;
        sqlx::query("SELECT 1").fetch_one(&pool).await.map_err(ReportError::unknown)?;
        Ok(())
    }

    async fn query(&self, table: &str, fields: &[String]) -> Result<Vec<Row>, ReportError> {
        let pool = self.pool().await?;
        let projection = if fields.is_empty() {
            "*".to_string()
        } else {
            fields.iter().map(|f| quote_ident(f)).collect::<Vec<_>>().join(", ")
        };
        let sql = format!("SELECT {projection} FROM {}", quote_ident(table));
        let rows = sqlx::query(&sql).fetch_all(&pool).await.map_err(ReportError::unknown)?;
        Ok(rows.iter().map(|r| pg_row_to_map(r, fields)).collect())
    }

    async fn discover_schema(&self) -> Result<SchemaInfo, ReportError> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            "SELECT table_name, column_name FROM information_schema.columns \
             WHERE table_schema = ANY($1) ORDER BY table_name, ordinal_position",
        )
        .bind(if self.config.schemas.is_empty() { vec!["public".to_string()] } else { self.config.schemas.clone() })
        .fetch_all(&pool)
        .await
        .map_err(ReportError::unknown)?;

        let mut tables: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            let table: String = row.try_get("table_name").map_err(ReportError::unknown)?;
            let column: String = row.try_get("column_name").map_err(ReportError::unknown)?;
            tables.entry(table).or_default().push(column);
        }
        Ok(SchemaInfo { tables })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }
}
