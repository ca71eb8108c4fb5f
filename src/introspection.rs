//! Schema Introspection Module
//!
//! Describes a restored database's structure (schema snapshot) and size
//! (metrics snapshot), and extracts both from a live catalog.

use crate::error::AppResult;
use chrono::{DateTime, SubsecRound, Utc};
use deadpool_postgres::Pool;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Format tag written into every schema snapshot
pub const SCHEMA_FORMAT_VERSION: &str = "1";

/// Structural description of a database at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub version: String,
    #[serde(with = "rfc3339_micros")]
    pub timestamp: DateTime<Utc>,
    pub tables: Vec<Table>,
}

impl SchemaSnapshot {
    /// Build a snapshot; tables are ordered by (namespace, name)
    pub fn new(mut tables: Vec<Table>) -> Self {
        tables.sort_by(|a, b| (&a.schema, &a.name).cmp(&(&b.schema, &b.name)));
        Self {
            version: SCHEMA_FORMAT_VERSION.to_string(),
            timestamp: now(),
            tables,
        }
    }

    /// Fully qualified table names (`schema.table`)
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(Table::qualified_name).collect()
    }
}

/// Table representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub schema: String,
    pub column_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<Column>,
}

impl Table {
    pub fn new(schema: impl Into<String>, name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            schema: schema.into(),
            column_count: columns.len(),
            columns,
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Column representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Quantitative description of a restored database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(with = "rfc3339_micros")]
    pub timestamp: DateTime<Utc>,
    /// Wall clock time of the successful restore attempt
    pub restore_duration_ns: u64,
    pub db_size_bytes: i64,
    pub table_metrics: Vec<TableMetrics>,
}

impl MetricsSnapshot {
    pub fn restore_duration(&self) -> Duration {
        Duration::from_nanos(self.restore_duration_ns)
    }

    pub fn total_rows(&self) -> i64 {
        self.table_metrics.iter().map(|t| t.row_count).sum()
    }
}

/// Row count for one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetrics {
    pub name: String,
    pub schema: String,
    pub row_count: i64,
}

impl TableMetrics {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// (namespace, name) pair identifying a user table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

/// Current time truncated to the precision timestamps are serialized with
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Timestamps as RFC 3339 UTC with exactly microsecond precision.
///
/// The signed report bytes depend on this format being fixed.
pub mod rfc3339_micros {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Read access to a restored database's catalog
#[allow(async_fn_in_trait)]
pub trait CatalogSource {
    /// User tables (system namespaces excluded), ordered by namespace then name
    async fn user_tables(&self) -> AppResult<Vec<TableRef>>;

    /// Columns of one table in ordinal order
    async fn table_columns(&self, table: &TableRef) -> AppResult<Vec<Column>>;

    /// Total storage size of the database in bytes
    async fn database_size(&self) -> AppResult<i64>;

    /// Row counts from the live statistics view
    async fn live_row_counts(&self) -> AppResult<Vec<TableMetrics>>;

    /// Exact `COUNT(*)` for one table
    async fn exact_row_count(&self, table: &TableRef) -> AppResult<i64>;
}

/// Extract a deterministic schema snapshot
pub async fn extract_schema<C: CatalogSource>(catalog: &C) -> AppResult<SchemaSnapshot> {
    let refs = catalog.user_tables().await?;

    let mut tables = Vec::with_capacity(refs.len());
    for table in &refs {
        let columns = catalog.table_columns(table).await?;
        tables.push(Table::new(table.schema.clone(), table.name.clone(), columns));
    }

    let snapshot = SchemaSnapshot::new(tables);
    debug!("Extracted schema with {} tables", snapshot.tables.len());
    Ok(snapshot)
}

/// Extract size and row-count metrics
pub async fn extract_metrics<C: CatalogSource>(
    catalog: &C,
    restore_duration: Duration,
) -> AppResult<MetricsSnapshot> {
    let db_size_bytes = catalog.database_size().await?;
    let table_metrics = collect_row_counts(catalog).await?;

    Ok(MetricsSnapshot {
        timestamp: now(),
        restore_duration_ns: restore_duration.as_nanos().min(u64::MAX as u128) as u64,
        db_size_bytes,
        table_metrics,
    })
}

/// Live statistics first; exact counts when they are empty or all zero.
///
/// Statistics are not refreshed right after a bulk load, so an all-zero
/// view would otherwise report a populated database as empty.
async fn collect_row_counts<C: CatalogSource>(catalog: &C) -> AppResult<Vec<TableMetrics>> {
    let live = catalog.live_row_counts().await?;
    if !live.is_empty() && live.iter().any(|t| t.row_count > 0) {
        return Ok(live);
    }

    warn!(
        "Live statistics report no rows for {} tables, falling back to exact counts",
        live.len()
    );

    let mut exact = Vec::new();
    for table in catalog.user_tables().await? {
        let row_count = catalog.exact_row_count(&table).await?;
        exact.push(TableMetrics {
            name: table.name,
            schema: table.schema,
            row_count,
        });
    }
    Ok(exact)
}

/// Quote an identifier for interpolation into SQL
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Catalog queries against a PostgreSQL instance
pub struct PostgresCatalog {
    pool: Pool,
}

impl PostgresCatalog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl CatalogSource for PostgresCatalog {
    async fn user_tables(&self) -> AppResult<Vec<TableRef>> {
        let client = self.pool.get().await?;

        let query = r#"
            SELECT
                t.table_schema::text AS table_schema,
                t.table_name::text AS table_name
            FROM information_schema.tables t
            WHERE t.table_schema NOT IN ('pg_catalog', 'information_schema')
              AND t.table_type = 'BASE TABLE'
            ORDER BY t.table_schema, t.table_name
        "#;

        let rows = client.query(query, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| TableRef {
                schema: row.get("table_schema"),
                name: row.get("table_name"),
            })
            .collect())
    }

    async fn table_columns(&self, table: &TableRef) -> AppResult<Vec<Column>> {
        let client = self.pool.get().await?;

        let query = r#"
            SELECT
                c.column_name::text AS column_name,
                c.data_type::text AS data_type,
                c.is_nullable::text AS is_nullable
            FROM information_schema.columns c
            WHERE c.table_schema = $1 AND c.table_name = $2
            ORDER BY c.ordinal_position
        "#;

        let rows = client.query(query, &[&table.schema, &table.name]).await?;
        Ok(rows
            .iter()
            .map(|row| Column {
                name: row.get("column_name"),
                data_type: row.get("data_type"),
                nullable: row.get::<_, String>("is_nullable") == "YES",
            })
            .collect())
    }

    async fn database_size(&self) -> AppResult<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one("SELECT pg_database_size(current_database())", &[])
            .await?;
        Ok(row.get(0))
    }

    async fn live_row_counts(&self) -> AppResult<Vec<TableMetrics>> {
        let client = self.pool.get().await?;

        let query = r#"
            SELECT schemaname::text AS schemaname, relname::text AS relname, n_live_tup
            FROM pg_stat_user_tables
            ORDER BY schemaname, relname
        "#;

        let rows = client.query(query, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| TableMetrics {
                schema: row.get("schemaname"),
                name: row.get("relname"),
                row_count: row.get("n_live_tup"),
            })
            .collect())
    }

    async fn exact_row_count(&self, table: &TableRef) -> AppResult<i64> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT COUNT(*) FROM {}.{}",
            quote_ident(&table.schema),
            quote_ident(&table.name)
        );
        let row = client.query_one(query.as_str(), &[]).await?;
        Ok(row.get(0))
    }
}
