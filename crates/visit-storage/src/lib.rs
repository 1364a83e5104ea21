//! Persistence for visit records: pool acquisition, table management, wildcard duplicate
//! checks and batch inserts.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use thiserror::Error;
use tracing::{debug, info};
use visit_core::{ColumnValue, VisitColumn, VisitRecord, VISITS_TABLE};

mod memory;

pub use memory::{MemoryVisitSession, MemoryVisitStore};

/// Postgres accepts at most `u16::MAX` bind parameters per statement.
pub const MAX_ROWS_PER_STATEMENT: usize = u16::MAX as usize / VisitColumn::ALL.len();

static COUNT_SQL: OnceLock<String> = OnceLock::new();
static EXISTS_SQL: OnceLock<String> = OnceLock::new();

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unable to connect to the database: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("error creating 'customer_visits' table: {0}")]
    CreateTable(#[source] sqlx::Error),
    #[error("error executing {operation}: {source}")]
    Query {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

impl StorageError {
    fn query(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Query { operation, source }
    }
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub database_url: Option<String>,
    pub name: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub pool_min: u32,
    pub pool_max: u32,
    pub acquire_timeout_secs: u64,
    /// Never open a connection; callers get no handle.
    pub mock: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            name: None,
            user: None,
            password: None,
            host: "localhost".to_string(),
            port: 5432,
            pool_min: 1,
            pool_max: 10,
            acquire_timeout_secs: 10,
            mock: false,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("pool_min", &self.pool_min)
            .field("pool_max", &self.pool_max)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .field("mock", &self.mock)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let pool_min = lookup("DB_POOL_MIN")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.pool_min)
            .max(1);
        let pool_max = lookup("DB_POOL_MAX")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.pool_max)
            .max(pool_min);

        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.is_empty()),
            name: lookup("POSTGRES_DB"),
            user: lookup("POSTGRES_USER"),
            password: lookup("POSTGRES_PASSWORD"),
            host: lookup("DB_HOST").unwrap_or(defaults.host),
            port: lookup("DB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            pool_min,
            pool_max,
            acquire_timeout_secs: lookup("DB_ACQUIRE_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.acquire_timeout_secs),
            mock: lookup("TEST_ENVIRONMENT")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions, StorageError> {
        if let Some(url) = &self.database_url {
            return url.parse().map_err(StorageError::Connection);
        }

        let mut options = PgConnectOptions::new().host(&self.host).port(self.port);
        if let Some(user) = &self.user {
            options = options.username(user);
        }
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        if let Some(name) = &self.name {
            options = options.database(name);
        }
        Ok(options)
    }
}

/// Build the bounded connection pool, or `None` in mock mode.
pub async fn connect(config: &DatabaseConfig) -> Result<Option<PgPool>, StorageError> {
    if config.mock {
        debug!("mock database mode; no connection opened");
        return Ok(None);
    }

    let pool = PgPoolOptions::new()
        .min_connections(config.pool_min)
        .max_connections(config.pool_max)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect_with(config.connect_options()?)
        .await
        .map_err(StorageError::Connection)?;
    info!(host = %config.host, port = config.port, "connected to database");
    Ok(Some(pool))
}

/// Backend that owns the visits table.
#[async_trait]
pub trait VisitStore: Send + Sync {
    type Session: VisitSession;

    /// Create the table if it is absent. Safe to call on every run.
    async fn ensure_table(&self) -> Result<(), StorageError>;

    /// Open a session. Writes are discarded unless the session is committed.
    async fn begin(&self) -> Result<Self::Session, StorageError>;
}

#[async_trait]
pub trait VisitSession: Send {
    /// Whether a stored row matches `record` under the wildcard-null rule.
    async fn exists(&mut self, record: &VisitRecord) -> Result<bool, StorageError>;

    async fn row_count(&mut self) -> Result<i64, StorageError>;

    async fn insert_rows(&mut self, records: &[VisitRecord]) -> Result<(), StorageError>;

    async fn commit(self) -> Result<(), StorageError>;
}

/// Insert `records` and return how many rows the table actually gained.
pub async fn insert_batch<S>(session: &mut S, records: &[VisitRecord]) -> Result<u64, StorageError>
where
    S: VisitSession + ?Sized,
{
    if records.is_empty() {
        return Ok(0);
    }

    let before = session.row_count().await?;
    session.insert_rows(records).await?;
    let after = session.row_count().await?;

    for record in records {
        debug!(?record, "inserted record");
    }

    let inserted = u64::try_from(after - before).unwrap_or(0);
    info!(inserted, submitted = records.len(), "rows inserted");
    Ok(inserted)
}

pub fn create_table_sql() -> String {
    let columns = VisitColumn::ALL
        .iter()
        .map(|c| format!("    {} {}", c.name(), c.sql_type()))
        .collect::<Vec<_>>()
        .join(",\n");
    format!("CREATE TABLE IF NOT EXISTS {VISITS_TABLE} (\n{columns}\n)")
}

/// `(column = $n OR column IS NULL)`: a stored null matches any candidate value.
pub fn wildcard_clause(column: &str, placeholder: usize) -> String {
    format!("({column} = ${placeholder} OR {column} IS NULL)")
}

pub fn count_sql() -> &'static str {
    COUNT_SQL.get_or_init(|| format!("SELECT COUNT(*) FROM {VISITS_TABLE}"))
}

/// The duplicate-check query, built once per process.
pub fn exists_sql() -> &'static str {
    EXISTS_SQL.get_or_init(build_exists_sql)
}

fn build_exists_sql() -> String {
    let predicate = VisitColumn::ALL
        .iter()
        .enumerate()
        .map(|(idx, c)| wildcard_clause(c.name(), idx + 1))
        .collect::<Vec<_>>()
        .join("\n   AND ");
    format!("SELECT EXISTS (\n  SELECT 1 FROM {VISITS_TABLE}\n WHERE {predicate}\n)")
}

/// One multi-row `INSERT` for `records`.
pub fn insert_statement(records: &[VisitRecord]) -> QueryBuilder<'_, Postgres> {
    let columns = VisitColumn::ALL.map(VisitColumn::name).join(", ");
    let mut builder = QueryBuilder::new(format!("INSERT INTO {VISITS_TABLE} ({columns}) "));
    builder.push_values(records, |mut row, record| {
        for column in VisitColumn::ALL {
            match record.value(column) {
                ColumnValue::Text(value) => row.push_bind(value),
                ColumnValue::Integer(value) => row.push_bind(value),
            };
        }
    });
    builder
}

#[derive(Debug, Clone)]
pub struct PgVisitStore {
    pool: PgPool,
}

impl PgVisitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl VisitStore for PgVisitStore {
    type Session = PgVisitSession;

    async fn ensure_table(&self) -> Result<(), StorageError> {
        sqlx::query(&create_table_sql())
            .execute(&self.pool)
            .await
            .map_err(StorageError::CreateTable)?;
        Ok(())
    }

    async fn begin(&self) -> Result<Self::Session, StorageError> {
        let tx = self.pool.begin().await.map_err(StorageError::Connection)?;
        Ok(PgVisitSession { tx })
    }
}

/// One transaction on a pooled connection. Dropping it rolls back and releases the
/// connection to the pool.
pub struct PgVisitSession {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl VisitSession for PgVisitSession {
    async fn exists(&mut self, record: &VisitRecord) -> Result<bool, StorageError> {
        let mut query = sqlx::query_scalar::<_, bool>(exists_sql());
        for column in VisitColumn::ALL {
            query = match record.value(column) {
                ColumnValue::Text(value) => query.bind(value),
                ColumnValue::Integer(value) => query.bind(value),
            };
        }
        query
            .fetch_one(&mut *self.tx)
            .await
            .map_err(StorageError::query("duplicate check"))
    }

    async fn row_count(&mut self) -> Result<i64, StorageError> {
        sqlx::query_scalar::<_, i64>(count_sql())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(StorageError::query("row count"))
    }

    async fn insert_rows(&mut self, records: &[VisitRecord]) -> Result<(), StorageError> {
        for chunk in records.chunks(MAX_ROWS_PER_STATEMENT) {
            insert_statement(chunk)
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(StorageError::query("batch insert"))?;
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await.map_err(StorageError::query("commit"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record(bucket: &str, creative: Option<i64>) -> VisitRecord {
        VisitRecord {
            ad_bucket: Some(bucket.to_string()),
            ad_creative: creative,
            ..VisitRecord::default()
        }
    }

    #[test]
    fn create_table_has_fixed_schema() {
        let sql = create_table_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS customer_visits ("));
        for text in ["ad_bucket", "ad_type", "ad_source", "ad_keyword"] {
            assert!(sql.contains(&format!("{text} VARCHAR(255)")), "{sql}");
        }
        for int in ["schema_version", "ad_campaign_id", "ad_group_id", "ad_creative"] {
            assert!(sql.contains(&format!("{int} BIGINT")), "{sql}");
        }
        assert!(!sql.contains("NOT NULL"));
    }

    #[test]
    fn exists_query_has_one_wildcard_clause_per_column() {
        let sql = exists_sql();
        assert!(sql.starts_with("SELECT EXISTS ("));
        for (idx, column) in VisitColumn::ALL.iter().enumerate() {
            let clause = format!("({0} = ${1} OR {0} IS NULL)", column.name(), idx + 1);
            assert!(sql.contains(&clause), "missing {clause} in {sql}");
        }
        assert_eq!(sql.matches(" AND ").count(), VisitColumn::ALL.len() - 1);
        assert!(!sql.contains("IS NOT DISTINCT FROM"));
    }

    #[test]
    fn statement_text_is_built_once() {
        assert!(std::ptr::eq(exists_sql(), exists_sql()));
        assert_eq!(count_sql(), format!("SELECT COUNT(*) FROM {VISITS_TABLE}"));
    }

    #[test]
    fn insert_statement_binds_every_column_of_every_row() {
        let records = vec![record("a", Some(1)), record("b", None), record("c", Some(3))];
        let builder = insert_statement(&records);
        let sql = builder.sql();
        assert!(sql.starts_with(
            "INSERT INTO customer_visits (ad_bucket, ad_type, ad_source, schema_version, \
             ad_campaign_id, ad_keyword, ad_group_id, ad_creative) VALUES "
        ));
        assert!(sql.contains("$24"));
        assert!(!sql.contains("$25"));
        assert_eq!(sql.matches('(').count(), 1 + records.len());
    }

    #[test]
    fn statement_row_limit_respects_bind_parameter_cap() {
        assert!(MAX_ROWS_PER_STATEMENT * VisitColumn::ALL.len() <= u16::MAX as usize);
        assert!(MAX_ROWS_PER_STATEMENT > 1000);
    }

    #[test]
    fn config_reads_environment_keys() {
        let env = HashMap::from([
            ("POSTGRES_DB", "visits"),
            ("POSTGRES_USER", "etl"),
            ("POSTGRES_PASSWORD", "hunter2"),
            ("DB_HOST", "db.internal"),
            ("DB_PORT", "6543"),
            ("DB_POOL_MAX", "4"),
        ]);
        let config = DatabaseConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.name.as_deref(), Some("visits"));
        assert_eq!(config.user.as_deref(), Some("etl"));
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 6543);
        assert_eq!(config.pool_min, 1);
        assert_eq!(config.pool_max, 4);
        assert!(!config.mock);

        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn pool_bounds_are_clamped() {
        let env = HashMap::from([("DB_POOL_MIN", "0"), ("DB_POOL_MAX", "0")]);
        let config = DatabaseConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.pool_min, 1);
        assert_eq!(config.pool_max, 1);
    }

    #[test]
    fn test_environment_flag_selects_mock_mode() {
        for value in ["1", "true", "TRUE", "True"] {
            let config = DatabaseConfig::from_lookup(|key| {
                (key == "TEST_ENVIRONMENT").then(|| value.to_string())
            });
            assert!(config.mock, "{value}");
        }
        let config =
            DatabaseConfig::from_lookup(|key| (key == "TEST_ENVIRONMENT").then(|| "False".into()));
        assert!(!config.mock);
    }

    #[tokio::test]
    async fn mock_mode_yields_no_handle() {
        let config = DatabaseConfig {
            mock: true,
            host: "unreachable.invalid".into(),
            ..DatabaseConfig::default()
        };
        assert!(connect(&config).await.unwrap().is_none());
    }

    #[test]
    fn database_url_takes_precedence() {
        let config = DatabaseConfig {
            database_url: Some("postgres://etl:pw@db.example:5433/visits".into()),
            host: "ignored".into(),
            ..DatabaseConfig::default()
        };
        let options = config.connect_options().unwrap();
        assert_eq!(options.get_host(), "db.example");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_database(), Some("visits"));
    }

    #[tokio::test]
    async fn insert_batch_reports_row_delta() {
        let store = MemoryVisitStore::default();
        store.seed(vec![record("old", None)]).await;

        let mut session = store.begin().await.unwrap();
        let inserted = insert_batch(&mut session, &[record("a", Some(1)), record("b", Some(2))])
            .await
            .unwrap();
        assert_eq!(inserted, 2);
        session.commit().await.unwrap();
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn insert_batch_of_one_into_empty_table_is_one() {
        let store = MemoryVisitStore::default();
        store.ensure_table().await.unwrap();
        let mut session = store.begin().await.unwrap();
        assert_eq!(insert_batch(&mut session, &[record("a", None)]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_batch_does_not_touch_the_session() {
        let store = MemoryVisitStore::default().with_failing_queries();
        let mut session = store.begin().await.unwrap();
        assert_eq!(insert_batch(&mut session, &[]).await.unwrap(), 0);
    }
}
