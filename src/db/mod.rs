use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Pool, Postgres, postgres::PgPoolOptions};

pub type Db = Pool<Postgres>;

pub async fn connect(url: &str, max: Option<u32>) -> Result<Db> {
    let pool = PgPoolOptions::new()
        .max_connections(max.unwrap_or(10))
        .connect(url)
        .await?;
    Ok(pool)
}

/// Idempotentny DDL dla RaidGuarda (schemat `tss`).
pub async fn ensure_tables(db: &Db) -> Result<()> {
    sqlx::query(r#"CREATE SCHEMA IF NOT EXISTS tss"#)
        .execute(db)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tss.raid_config (
          guild_id   BIGINT PRIMARY KEY,
          cfg        JSONB NOT NULL DEFAULT '{}'::jsonb,
          updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(db)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tss.raid_incidents (
          id               BIGSERIAL PRIMARY KEY,
          guild_id         BIGINT      NOT NULL,
          user_id          BIGINT      NOT NULL,
          score            INTEGER     NOT NULL,
          mute_threshold   INTEGER     NOT NULL,
          sensitivity      SMALLINT    NOT NULL,
          duration_minutes INTEGER     NOT NULL,
          deleted_count    INTEGER     NOT NULL,
          created_at       TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(db)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_raid_incidents_gid_created
          ON tss.raid_incidents (guild_id, created_at DESC)
        "#,
    )
    .execute(db)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tss.raid_history (
          id           BIGSERIAL PRIMARY KEY,
          guild_id     BIGINT      NOT NULL,
          activated_at TIMESTAMPTZ NOT NULL,
          expires_at   TIMESTAMPTZ NOT NULL,
          action       TEXT        NOT NULL,
          triggered_by TEXT        NOT NULL,
          status       TEXT        NOT NULL DEFAULT 'active',
          ended_at     TIMESTAMPTZ
        )
        "#,
    )
    .execute(db)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_raid_history_gid_status
          ON tss.raid_history (guild_id, status)
        "#,
    )
    .execute(db)
    .await?;

    Ok(())
}

pub async fn load_raid_config(db: &Db, guild_id: u64) -> Result<Option<Value>, sqlx::Error> {
    let row: Option<(Value,)> = sqlx::query_as("SELECT cfg FROM tss.raid_config WHERE guild_id = $1")
        .bind(guild_id as i64)
        .fetch_optional(db)
        .await?;
    Ok(row.map(|(v,)| v))
}

pub async fn save_raid_config(db: &Db, guild_id: u64, cfg: &Value) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO tss.raid_config (guild_id, cfg, updated_at)
        VALUES ($1, $2, now())
        ON CONFLICT (guild_id) DO UPDATE SET cfg = EXCLUDED.cfg, updated_at = now()
        "#,
    )
    .bind(guild_id as i64)
    .bind(cfg)
    .execute(db)
    .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_raid_incident(
    db: &Db,
    guild_id: u64,
    user_id: u64,
    score: u32,
    mute_threshold: u32,
    sensitivity: u8,
    duration_minutes: u32,
    deleted_count: usize,
    created_at: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    let rec: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO tss.raid_incidents
          (guild_id, user_id, score, mute_threshold, sensitivity, duration_minutes, deleted_count, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id
        "#,
    )
    .bind(guild_id as i64)
    .bind(user_id as i64)
    .bind(i32::try_from(score).unwrap_or(i32::MAX))
    .bind(i32::try_from(mute_threshold).unwrap_or(i32::MAX))
    .bind(i16::from(sensitivity))
    .bind(i32::try_from(duration_minutes).unwrap_or(i32::MAX))
    .bind(i32::try_from(deleted_count).unwrap_or(i32::MAX))
    .bind(created_at)
    .fetch_one(db)
    .await?;
    Ok(rec.0)
}

/// Ostatnie incydenty serwera: (user_id, score, duration_minutes, created_at).
pub async fn recent_raid_incidents(
    db: &Db,
    guild_id: u64,
    limit: i64,
) -> Result<Vec<(i64, i32, i32, DateTime<Utc>)>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT user_id, score, duration_minutes, created_at
        FROM tss.raid_incidents
        WHERE guild_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(guild_id as i64)
    .bind(limit)
    .fetch_all(db)
    .await
}

pub async fn insert_raid_mode(
    db: &Db,
    guild_id: u64,
    activated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    action: &str,
    triggered_by: &str,
) -> Result<i64, sqlx::Error> {
    let rec: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO tss.raid_history (guild_id, activated_at, expires_at, action, triggered_by)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(guild_id as i64)
    .bind(activated_at)
    .bind(expires_at)
    .bind(action)
    .bind(triggered_by)
    .fetch_one(db)
    .await?;
    Ok(rec.0)
}

/// Zamyka aktywne wpisy trybu raid; zwraca liczbę zmienionych wierszy.
pub async fn close_raid_mode(db: &Db, guild_id: u64, status: &str, ended_at: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let res = sqlx::query(
        r#"
        UPDATE tss.raid_history
        SET status = $2, ended_at = $3
        WHERE guild_id = $1 AND status = 'active'
        "#,
    )
    .bind(guild_id as i64)
    .bind(status)
    .bind(ended_at)
    .execute(db)
    .await?;
    Ok(res.rows_affected())
}
