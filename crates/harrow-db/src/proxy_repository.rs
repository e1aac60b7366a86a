use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};

use harrow_core::error::AppError;
use harrow_core::models::{NewProxy, Proxy, ProxyKey, ProxyScheme, ProxyStats, SelectionPolicy};
use harrow_core::traits::ProxyStore;

/// PostgreSQL proxy store. LRU selection claims its pick with
/// `FOR UPDATE SKIP LOCKED` so concurrent workers rotate instead of
/// converging on one proxy.
#[derive(Clone)]
pub struct ProxyRepository {
    pool: Pool<Postgres>,
}

impl ProxyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ProxyRow {
    endpoint: String,
    scheme: String,
    ping_ms: Option<i32>,
    is_frozen: bool,
    is_deleted: bool,
    source: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProxyRow> for Proxy {
    fn from(row: ProxyRow) -> Self {
        Proxy {
            endpoint: row.endpoint,
            scheme: row.scheme.parse().unwrap_or(ProxyScheme::Http),
            ping_ms: row.ping_ms.and_then(|p| u32::try_from(p).ok()),
            is_frozen: row.is_frozen,
            is_deleted: row.is_deleted,
            created_at: row.created_at,
            updated_at: row.updated_at,
            source: row.source,
        }
    }
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

impl ProxyStore for ProxyRepository {
    async fn insert_many(&self, candidates: &[NewProxy]) -> Result<u64, AppError> {
        let endpoints: Vec<String> = candidates.iter().map(|c| c.endpoint.clone()).collect();
        let schemes: Vec<String> = candidates.iter().map(|c| c.scheme.to_string()).collect();
        let sources: Vec<String> = candidates.iter().map(|c| c.source.clone()).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO proxies (endpoint, scheme, source)
            SELECT * FROM UNNEST($1::varchar[], $2::varchar[], $3::varchar[])
            ON CONFLICT (endpoint, scheme) DO NOTHING
            "#,
        )
        .bind(&endpoints)
        .bind(&schemes)
        .bind(&sources)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn select(&self, policy: SelectionPolicy) -> Result<Option<Proxy>, AppError> {
        let sql = match policy {
            SelectionPolicy::Lru => {
                r#"
                UPDATE proxies SET updated_at = NOW()
                WHERE (endpoint, scheme) IN (
                    SELECT endpoint, scheme FROM proxies
                    WHERE NOT is_frozen AND NOT is_deleted
                    ORDER BY updated_at ASC, ping_ms ASC NULLS LAST
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1
                )
                RETURNING *
                "#
            }
            SelectionPolicy::Random => {
                r#"
                SELECT * FROM proxies
                WHERE NOT is_frozen AND NOT is_deleted
                ORDER BY RANDOM()
                LIMIT 1
                "#
            }
        };

        let row = sqlx::query_as::<_, ProxyRow>(sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(Into::into))
    }

    async fn get(&self, key: &ProxyKey) -> Result<Option<Proxy>, AppError> {
        let row = sqlx::query_as::<_, ProxyRow>(
            "SELECT * FROM proxies WHERE endpoint = $1 AND scheme = $2",
        )
        .bind(&key.endpoint)
        .bind(key.scheme.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(Into::into))
    }

    async fn freeze(&self, key: &ProxyKey) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE proxies SET is_frozen = TRUE, updated_at = NOW()
            WHERE endpoint = $1 AND scheme = $2
            "#,
        )
        .bind(&key.endpoint)
        .bind(key.scheme.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn record_verified(&self, key: &ProxyKey, ping_ms: u32) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE proxies SET ping_ms = $3, updated_at = NOW()
            WHERE endpoint = $1 AND scheme = $2 AND NOT is_deleted
            "#,
        )
        .bind(&key.endpoint)
        .bind(key.scheme.as_str())
        .bind(i32::try_from(ping_ms).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn mark_deleted(&self, key: &ProxyKey) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE proxies SET is_deleted = TRUE, updated_at = NOW()
            WHERE endpoint = $1 AND scheme = $2
            "#,
        )
        .bind(&key.endpoint)
        .bind(key.scheme.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn unfreeze_all(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE proxies SET is_frozen = FALSE, updated_at = NOW() WHERE is_frozen",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn list_verifiable(&self) -> Result<Vec<Proxy>, AppError> {
        let rows = sqlx::query_as::<_, ProxyRow>(
            "SELECT * FROM proxies WHERE NOT is_deleted ORDER BY created_at, updated_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn stats(&self) -> Result<ProxyStats, AppError> {
        let (total, eligible, frozen, deleted): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE NOT is_frozen AND NOT is_deleted),
                COUNT(*) FILTER (WHERE is_frozen AND NOT is_deleted),
                COUNT(*) FILTER (WHERE is_deleted)
            FROM proxies
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(ProxyStats {
            total: total as u64,
            eligible: eligible as u64,
            frozen: frozen as u64,
            deleted: deleted as u64,
        })
    }
}
