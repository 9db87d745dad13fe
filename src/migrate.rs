use anyhow::Result;
use sqlx::sqlite::SqlitePool;

/// Idempotent schema setup; safe to run on every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS dogs (
            dog_id          TEXT PRIMARY KEY,
            attributes_json TEXT NOT NULL,
            narrative_json  TEXT NOT NULL,
            provenance_json TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'available',
            revision        INTEGER NOT NULL DEFAULT 0,
            embedding       BLOB,
            embedding_hash  TEXT,
            last_match_at   INTEGER,
            updated_at      INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_dogs_status ON dogs(status)")
        .execute(pool)
        .await?;

    Ok(())
}
