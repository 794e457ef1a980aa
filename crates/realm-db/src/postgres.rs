//! `PostgreSQL` connection pool.
//!
//! Villages, buildings, garrisons, battles and the read-only bonus inputs
//! (technologies, alliances, world events) live in `PostgreSQL`. Queries
//! are built at runtime with [`sqlx`] so the workspace compiles without a
//! live database; every value is bound as a parameter.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use crate::error::DbError;

/// Pool sizing and timeouts.
///
/// A query that cannot get a connection within `acquire_timeout` fails with
/// a pool timeout, which the store maps to a transient error so the tick
/// scheduler retries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Upper bound on open connections.
    pub max_connections: u32,
    /// Connections kept open even when idle.
    pub min_connections: u32,
    /// Wait for a free connection.
    pub acquire_timeout: Duration,
    /// Idle connections above `min_connections` are closed after this.
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Handle to the `PostgreSQL` pool.
///
/// Cheap to clone. Implements [`GameStore`](realm_core::store::GameStore)
/// in [`crate::game_store`].
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// Open a pool against `url`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL does not parse and
    /// [`DbError::Postgres`] if no connection can be established.
    pub async fn connect(url: &str, settings: PoolSettings) -> Result<Self, DbError> {
        let options: PgConnectOptions = url
            .parse()
            .map_err(|e: sqlx::Error| DbError::Config(format!("Invalid database URL: {e}")))?;

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections.min(settings.max_connections))
            .acquire_timeout(settings.acquire_timeout)
            .idle_timeout(settings.idle_timeout)
            .connect_with(options)
            .await?;

        tracing::info!(
            max_connections = settings.max_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    /// [`connect`](Self::connect) with [`PoolSettings::default`].
    ///
    /// # Errors
    ///
    /// See [`connect`](Self::connect).
    pub async fn connect_url(url: &str) -> Result<Self, DbError> {
        Self::connect(url, PoolSettings::default()).await
    }

    /// Apply pending migrations from `migrations/`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Migration`] if a migration fails.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Round-trip a trivial query.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the database is unreachable.
    pub async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// The underlying [`PgPool`].
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close every connection, waiting for checked-out ones to return.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_keep_a_warm_connection() {
        let settings = PoolSettings::default();
        assert_eq!(settings.max_connections, 10);
        assert_eq!(settings.min_connections, 1);
        assert_eq!(settings.acquire_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn malformed_url_is_a_config_error() {
        let result = PostgresPool::connect("not a url", PoolSettings::default()).await;
        assert!(matches!(result, Err(DbError::Config(_))));
    }
}
