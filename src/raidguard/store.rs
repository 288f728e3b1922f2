//! Konfiguracja serwerów i historia incydentów: Postgres + cache moka.

use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serenity::async_trait;

use super::error::StoreError;
use super::model::{RaidIncident, RaidModeEnd, RaidModeState, ServerRaidConfig};
use crate::db::{self, Db};

/// Skrót incydentu do `/antiraid-status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncidentSummary {
    pub user_id: u64,
    pub score: u32,
    pub duration_minutes: u32,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Brak wpisu = serwer wyłączony.
    async fn get(&self, guild_id: u64) -> Result<ServerRaidConfig, StoreError>;
    async fn put(&self, cfg: &ServerRaidConfig) -> Result<(), StoreError>;

    async fn record_incident(&self, _incident: &RaidIncident) -> Result<(), StoreError> {
        Ok(())
    }

    async fn recent_incidents(&self, _guild_id: u64, _limit: i64) -> Result<Vec<IncidentSummary>, StoreError> {
        Ok(Vec::new())
    }

    /// Historia trybu raid: nowy aktywny wpis.
    async fn record_raid_mode(&self, _guild_id: u64, _mode: &RaidModeState) -> Result<(), StoreError> {
        Ok(())
    }

    /// Zamyka aktywne wpisy serwera.
    async fn close_raid_mode(&self, _guild_id: u64, _end: RaidModeEnd, _at: DateTime<Utc>) -> Result<(), StoreError> {
        Ok(())
    }
}

pub struct PgConfigStore {
    db: Db,
    cache: Cache<u64, ServerRaidConfig>,
}

impl PgConfigStore {
    pub fn new(db: Db, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        Self { db, cache }
    }

    async fn load(&self, guild_id: u64) -> Result<ServerRaidConfig, StoreError> {
        let Some(raw) = db::load_raid_config(&self.db, guild_id).await? else {
            return Ok(ServerRaidConfig::disabled(guild_id));
        };
        let mut cfg: ServerRaidConfig = serde_json::from_value(raw)?;
        cfg.guild_id = guild_id;
        Ok(cfg)
    }
}

#[async_trait]
impl ConfigStore for PgConfigStore {
    async fn get(&self, guild_id: u64) -> Result<ServerRaidConfig, StoreError> {
        if let Some(hit) = self.cache.get(&guild_id).await {
            return Ok(hit);
        }
        let cfg = self.load(guild_id).await?;
        self.cache.insert(guild_id, cfg.clone()).await;
        Ok(cfg)
    }

    async fn put(&self, cfg: &ServerRaidConfig) -> Result<(), StoreError> {
        let value = serde_json::to_value(cfg)?;
        db::save_raid_config(&self.db, cfg.guild_id, &value).await?;
        self.cache.insert(cfg.guild_id, cfg.clone()).await;
        tracing::info!(gid = cfg.guild_id, sensitivity = cfg.sensitivity.level(), "raid config saved");
        Ok(())
    }

    async fn record_incident(&self, i: &RaidIncident) -> Result<(), StoreError> {
        let id = db::insert_raid_incident(
            &self.db,
            i.guild_id,
            i.user_id,
            i.score,
            i.mute_threshold,
            i.sensitivity.level(),
            i.duration_minutes,
            i.deleted_count,
            i.created_at,
        )
        .await?;
        tracing::debug!(gid = i.guild_id, uid = i.user_id, incident_id = id, "raid incident stored");
        Ok(())
    }

    async fn recent_incidents(&self, guild_id: u64, limit: i64) -> Result<Vec<IncidentSummary>, StoreError> {
        let rows = db::recent_raid_incidents(&self.db, guild_id, limit).await?;
        Ok(rows
            .into_iter()
            .map(|(uid, score, minutes, at)| IncidentSummary {
                user_id: uid as u64,
                score: u32::try_from(score).unwrap_or(0),
                duration_minutes: u32::try_from(minutes).unwrap_or(0),
                created_at: at,
            })
            .collect())
    }

    async fn record_raid_mode(&self, guild_id: u64, mode: &RaidModeState) -> Result<(), StoreError> {
        let id = db::insert_raid_mode(
            &self.db,
            guild_id,
            mode.activated_at,
            mode.expires_at,
            mode.action.as_str(),
            mode.trigger.as_str(),
        )
        .await?;
        tracing::debug!(gid = guild_id, history_id = id, "raid mode stored");
        Ok(())
    }

    async fn close_raid_mode(&self, guild_id: u64, end: RaidModeEnd, at: DateTime<Utc>) -> Result<(), StoreError> {
        let rows = db::close_raid_mode(&self.db, guild_id, end.as_status(), at).await?;
        tracing::debug!(gid = guild_id, rows, status = end.as_status(), "raid mode closed");
        Ok(())
    }
}
