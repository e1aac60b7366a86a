use std::collections::BTreeMap;

use sqlx::{PgPool, Pool, Postgres};

use harrow_core::error::AppError;
use harrow_core::models::{ExtractedRecord, UpsertOutcome, WorkUnit};
use harrow_core::traits::Sink;

/// PostgreSQL record sink with page completion tracking.
#[derive(Clone)]
pub struct RecordRepository {
    pool: Pool<Postgres>,
}

impl RecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, natural_key: &str) -> Result<Option<ExtractedRecord>, AppError> {
        let row = sqlx::query_as::<_, RecordRow>(
            "SELECT natural_key, page_ref, fields, completed FROM records WHERE natural_key = $1",
        )
        .bind(natural_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(TryInto::try_into).transpose()
    }

    pub async fn count(&self) -> Result<u64, AppError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count as u64)
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    natural_key: String,
    page_ref: i64,
    fields: serde_json::Value,
    completed: bool,
}

impl TryFrom<RecordRow> for ExtractedRecord {
    type Error = AppError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let fields: BTreeMap<String, String> = serde_json::from_value(row.fields)?;
        Ok(ExtractedRecord {
            natural_key: row.natural_key,
            page_ref: row.page_ref as u64,
            fields,
            completed: row.completed,
        })
    }
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

fn page_param(page_ref: u64) -> Result<i64, AppError> {
    i64::try_from(page_ref)
        .map_err(|_| AppError::DatabaseError(format!("Page {page_ref} out of range")))
}

impl Sink for RecordRepository {
    async fn upsert(&self, record: &ExtractedRecord) -> Result<UpsertOutcome, AppError> {
        let fields = serde_json::to_value(&record.fields)?;

        // No row back means the conflict branch's WHERE filtered the update.
        let row: Option<(bool,)> = sqlx::query_as(
            r#"
            INSERT INTO records (natural_key, page_ref, fields, fields_hash, completed)
            VALUES ($1, $2, $3, $4, TRUE)
            ON CONFLICT (natural_key) DO UPDATE
            SET page_ref = EXCLUDED.page_ref,
                fields = EXCLUDED.fields,
                fields_hash = EXCLUDED.fields_hash,
                completed = TRUE,
                updated_at = NOW()
            WHERE records.fields_hash <> EXCLUDED.fields_hash
               OR records.page_ref <> EXCLUDED.page_ref
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&record.natural_key)
        .bind(page_param(record.page_ref)?)
        .bind(&fields)
        .bind(record.fields_hash())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(match row {
            Some((true,)) => UpsertOutcome::Inserted,
            Some((false,)) => UpsertOutcome::Updated,
            None => UpsertOutcome::Unchanged,
        })
    }

    async fn is_page_done(&self, page_ref: u64) -> Result<bool, AppError> {
        let (done,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM pages WHERE page_ref = $1 AND is_done)",
        )
        .bind(page_param(page_ref)?)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(done)
    }

    async fn mark_page_done(&self, page_ref: u64, page_size: u32) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO pages (page_ref, page_size, is_done)
            VALUES ($1, $2, TRUE)
            ON CONFLICT (page_ref) DO UPDATE
            SET is_done = TRUE, page_size = EXCLUDED.page_size, updated_at = NOW()
            "#,
        )
        .bind(page_param(page_ref)?)
        .bind(i32::try_from(page_size).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn list_pending(&self, unit: &WorkUnit) -> Result<Vec<u64>, AppError> {
        if unit.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT s.page_ref
            FROM generate_series($1::bigint, $2::bigint - 1) AS s(page_ref)
            WHERE NOT EXISTS (
                SELECT 1 FROM pages p WHERE p.page_ref = s.page_ref AND p.is_done
            )
            ORDER BY s.page_ref
            "#,
        )
        .bind(page_param(unit.range_start)?)
        .bind(page_param(unit.range_end)?)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(|(page,)| page as u64).collect())
    }
}
