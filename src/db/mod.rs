//! Database module for tributary.
//!
//! This module wraps an sqlx connection pool and applies the embedded
//! migrations. Exactly one backend is compiled in: `postgres` when that
//! feature is enabled, otherwise `sqlite`.

mod schema;

pub use schema::MIGRATIONS;

#[cfg(feature = "postgres")]
use sqlx::postgres::PgPoolOptions;
#[cfg(all(feature = "sqlite", not(feature = "postgres")))]
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::{Result, TributaryError};

/// Database backend selected at compile time.
#[cfg(feature = "postgres")]
pub type DbBackend = sqlx::Postgres;
/// Database backend selected at compile time.
#[cfg(all(feature = "sqlite", not(feature = "postgres")))]
pub type DbBackend = sqlx::Sqlite;

/// Connection pool for the selected backend.
pub type DbPool = sqlx::Pool<DbBackend>;

/// Owned transaction on the selected backend.
pub type DbTransaction = sqlx::Transaction<'static, DbBackend>;

/// Name of the compiled-in backend.
#[cfg(feature = "postgres")]
pub const BACKEND_NAME: &str = "postgres";
/// Name of the compiled-in backend.
#[cfg(all(feature = "sqlite", not(feature = "postgres")))]
pub const BACKEND_NAME: &str = "sqlite";

/// Database wrapper owning the connection pool.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Connect using the given configuration and apply pending migrations.
    #[cfg(all(feature = "sqlite", not(feature = "postgres")))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        use std::str::FromStr;

        info!("Opening database at {}", config.url);
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| TributaryError::Config(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("busy_timeout", "5000");

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| TributaryError::Database(e.to_string()))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Connect using the given configuration and apply pending migrations.
    #[cfg(feature = "postgres")]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to PostgreSQL database");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| TributaryError::Database(e.to_string()))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Open an in-memory database for testing.
    ///
    /// The pool holds a single connection that never expires, so every
    /// caller sees the same in-memory database.
    #[cfg(all(feature = "sqlite", not(feature = "postgres")))]
    pub async fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory database");
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| TributaryError::Database(e.to_string()))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Wrap an existing pool. Migrations are not applied.
    pub fn from_pool(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Get the current schema version.
    pub async fn schema_version(&self) -> Result<i64> {
        if !self.table_exists("schema_version").await? {
            return Ok(0);
        }

        let version: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| TributaryError::Database(e.to_string()))?;

        Ok(version)
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        let current_version = self.schema_version().await?;

        if current_version as usize >= MIGRATIONS.len() {
            debug!("Database is up to date (version {})", current_version);
            return Ok(());
        }

        info!(
            "Migrating database from version {} to {}",
            current_version,
            MIGRATIONS.len()
        );

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version     BIGINT PRIMARY KEY,
                applied_at  BIGINT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| TributaryError::Database(e.to_string()))?;

        for (i, migration) in MIGRATIONS.iter().enumerate().skip(current_version as usize) {
            let version = (i + 1) as i64;
            info!("Applying migration v{}", version);

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| TributaryError::Database(e.to_string()))?;

            sqlx::raw_sql(migration)
                .execute(&mut *tx)
                .await
                .map_err(|e| TributaryError::Database(format!("migration v{version}: {e}")))?;

            sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES ($1, $2)")
                .bind(version)
                .bind(chrono::Utc::now().timestamp_millis())
                .execute(&mut *tx)
                .await
                .map_err(|e| TributaryError::Database(e.to_string()))?;

            tx.commit()
                .await
                .map_err(|e| TributaryError::Database(e.to_string()))?;
            debug!("Migration v{} applied successfully", version);
        }

        info!(
            "Database migration complete (now at version {})",
            MIGRATIONS.len()
        );
        Ok(())
    }

    /// Check if a table exists.
    pub async fn table_exists(&self, table_name: &str) -> Result<bool> {
        #[cfg(all(feature = "sqlite", not(feature = "postgres")))]
        let sql = "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = $1";
        #[cfg(feature = "postgres")]
        let sql = "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = $1";

        let count: i64 = sqlx::query_scalar(sql)
            .bind(table_name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| TributaryError::Database(e.to_string()))?;
        Ok(count > 0)
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("backend", &BACKEND_NAME)
            .finish()
    }
}
