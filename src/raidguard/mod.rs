//! RaidGuard – wykrywanie raidów/spamu na podstawie zachowania użytkownika.
//!
//! Przepływ dla jednej wiadomości:
//! filtr (bot/owner/timeout/wyłączony serwer/cooldown) → zapis aktywności →
//! punktacja → (opcjonalnie) weryfikacja intencji → reakcja (mute + sprzątanie).
//! Dołączenia członków idą osobną ścieżką (`raidmode`).
//! Cały stan jest lokalny dla procesu; restart go zeruje.

pub mod alerts;
pub mod commands;
pub mod coordinator;
pub mod error;
pub mod janitor;
pub mod model;
pub mod platform;
pub mod raidmode;
pub mod score;
pub mod store;
pub mod tracker;
pub mod verifier;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serenity::all::Message;

use crate::config::RaidGuardConfig;

use alerts::AlertPublisher;
use coordinator::{MuteOutcome, ResponseCoordinator, ResponseRequest};
use error::RaidError;
use model::{
    ActivityRecord, MemberFlags, MessageEvent, MuteRecord, RaidModeAction, RaidModeState,
    RaidScoreState, ServerRaidConfig, UserSlot, RATE_WINDOW_SECS,
};
use platform::ModerationApi;
use score::ScoreEngine;
use store::ConfigStore;
use tracker::ActivityTracker;
use verifier::{IntentClassifier, IntentVerifier, VerifyOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Bot,
    ServerOwner,
    AlreadyTimedOut,
    ConfigUnavailable,
    Disabled,
    Cooldown,
    Responding,
}

/// Co silnik zrobił z wiadomością.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Ignored(IgnoreReason),
    Scored {
        added: u32,
        ai_bonus: u32,
        score: u32,
    },
    Muted(MuteOutcome),
    /// Nowy członek pisał w trakcie trybu raid.
    RaidMode { action: RaidModeAction, applied: bool },
}

pub struct RaidGuard {
    tracker: ActivityTracker,
    slots: DashMap<u64, Arc<UserSlot>>,
    mutes: DashMap<u64, MuteRecord>,
    /// Znaczniki dołączeń per serwer (ostatnie 5 minut).
    joins: DashMap<u64, VecDeque<DateTime<Utc>>>,
    raid_modes: DashMap<u64, RaidModeState>,
    store: Arc<dyn ConfigStore>,
    api: Arc<dyn ModerationApi>,
    alerts: AlertPublisher,
    verifier: IntentVerifier,
    coordinator: ResponseCoordinator,
}

impl RaidGuard {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        api: Arc<dyn ModerationApi>,
        classifier: Arc<dyn IntentClassifier>,
        cfg: &RaidGuardConfig,
    ) -> Arc<Self> {
        let alerts = AlertPublisher::new(api.clone(), Duration::from_secs(cfg.notice_ttl_secs));
        Arc::new(Self {
            tracker: ActivityTracker::new(),
            slots: DashMap::new(),
            mutes: DashMap::new(),
            joins: DashMap::new(),
            raid_modes: DashMap::new(),
            verifier: IntentVerifier::new(classifier, Duration::from_millis(cfg.classifier.timeout_ms)),
            coordinator: ResponseCoordinator::new(api.clone(), store.clone(), alerts.clone()),
            alerts,
            store,
            api,
        })
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    fn slot(&self, user_id: u64) -> Arc<UserSlot> {
        self.slots.entry(user_id).or_default().clone()
    }

    /// Główna ścieżka. `Err` tylko gdy nie udało się nałożyć timeoutu.
    pub async fn on_message(&self, ev: &MessageEvent) -> Result<Disposition, RaidError> {
        if let Some(reason) = member_exemption(ev.member) {
            return Ok(Disposition::Ignored(reason));
        }

        let cfg = match self.store.get(ev.guild_id).await {
            Ok(c) => c,
            Err(e) => {
                RaidError::from(e).report();
                return Ok(Disposition::Ignored(IgnoreReason::ConfigUnavailable));
            }
        };
        let Some(th) = cfg.sensitivity.thresholds() else {
            return Ok(Disposition::Ignored(IgnoreReason::Disabled));
        };

        let now = ev.timestamp;
        let uid = ev.author_id;
        let slot = self.slot(uid);

        if ev.is_newcomer() {
            if let Some(mode) = self.raid_mode(ev.guild_id, now) {
                return Ok(self.raid_mode_message(ev, &slot, mode).await);
            }
        }

        if slot.state.lock().await.in_cooldown(now) {
            tracing::debug!(gid = ev.guild_id, uid, "raid cooldown active, message skipped");
            return Ok(Disposition::Ignored(IgnoreReason::Cooldown));
        }
        if slot.is_responding() {
            return Ok(Disposition::Ignored(IgnoreReason::Responding));
        }

        self.tracker.record(ActivityRecord::from(ev));
        let recent = self.tracker.window(uid, RATE_WINDOW_SECS, now);
        let added = ScoreEngine::compute(ev, cfg.sensitivity.into(), &recent);

        let (mut score, generation) = {
            let mut st = slot.state.lock().await;
            st.score = st.score.saturating_add(added);
            (st.score, st.reset_generation)
        };

        let mut ai_bonus = 0;
        if score >= th.ai && score < th.mute {
            let outcome = self.verifier.check(&slot, &cfg, &ev.content).await;
            if let VerifyOutcome::Checked { bonus, .. } = outcome {
                let mut st = slot.state.lock().await;
                if st.reset_generation != generation {
                    // inna wiadomość w międzyczasie wyciszyła i wyzerowała wynik
                    tracing::debug!(gid = ev.guild_id, uid, bonus, "stale intent bonus dropped after reset");
                } else if bonus > 0 {
                    ai_bonus = bonus;
                    st.score = st.score.saturating_add(bonus);
                }
                score = st.score;
            }
        }

        tracing::debug!(gid = ev.guild_id, uid, added, ai_bonus, score, "raid score updated");

        if score < th.mute {
            return Ok(Disposition::Scored { added, ai_bonus, score });
        }

        let Some(_responding) = slot.try_begin_response() else {
            return Ok(Disposition::Ignored(IgnoreReason::Responding));
        };
        // Pod flagą: równoległa reakcja mogła się właśnie skończyć.
        let score = {
            let st = slot.state.lock().await;
            if st.in_cooldown(now) {
                return Ok(Disposition::Ignored(IgnoreReason::Cooldown));
            }
            st.score
        };
        if score < th.mute {
            return Ok(Disposition::Scored { added, ai_bonus, score });
        }
        let outcome = self
            .coordinator
            .respond(ResponseRequest {
                ev,
                cfg: &cfg,
                slot: &slot,
                tracker: &self.tracker,
                mutes: &self.mutes,
                score,
                mute_threshold: th.mute,
                now,
            })
            .await?;
        Ok(Disposition::Muted(outcome))
    }

    pub async fn score_of(&self, user_id: u64) -> Option<RaidScoreState> {
        let slot = self.slots.get(&user_id).map(|s| s.clone())?;
        let st = slot.snapshot().await;
        Some(st)
    }

    pub fn mute_of(&self, user_id: u64) -> Option<MuteRecord> {
        self.mutes.get(&user_id).map(|m| m.clone())
    }

    pub fn tracker(&self) -> &ActivityTracker {
        &self.tracker
    }

    /// Ręczne zdjęcie wyciszenia: czyści timeout w `guild_id` oraz we wszystkich
    /// serwerach z rekordu, a rekord usuwa. Zwraca liczbę nieudanych serwerów.
    pub async fn unmute(&self, user_id: u64, guild_id: u64, reason: &str) -> usize {
        let mut guilds = self
            .mutes
            .remove(&user_id)
            .map(|(_, m)| m.guild_ids)
            .unwrap_or_default();
        guilds.insert(guild_id);
        self.clear_timeouts(user_id, guilds.into_iter(), reason).await
    }

    async fn clear_timeouts(&self, user_id: u64, guilds: impl Iterator<Item = u64>, reason: &str) -> usize {
        let mut failed = 0;
        for gid in guilds {
            if let Err(e) = self.api.clear_timeout(gid, user_id, reason).await {
                failed += 1;
                tracing::warn!(gid, uid = user_id, error = %e, "clear_timeout failed");
            }
        }
        failed
    }

    /// Konfiguracja serwera; błąd magazynu = serwer traktowany jako wyłączony.
    pub async fn config_for(&self, guild_id: u64) -> ServerRaidConfig {
        match self.store.get(guild_id).await {
            Ok(c) => c,
            Err(e) => {
                RaidError::from(e).report();
                ServerRaidConfig::disabled(guild_id)
            }
        }
    }
}

fn member_exemption(m: MemberFlags) -> Option<IgnoreReason> {
    if m.is_bot {
        Some(IgnoreReason::Bot)
    } else if m.is_server_owner {
        Some(IgnoreReason::ServerOwner)
    } else if m.is_timed_out {
        Some(IgnoreReason::AlreadyTimedOut)
    } else {
        None
    }
}

impl MessageEvent {
    /// Buduje zdarzenie z wiadomości gildii; `None` dla DM.
    /// `timed_out_until` i `joined_at` to unix ts z pełnego `Member` (cache), jeśli jest.
    /// Znacznik czasu to moment odbioru, nie `msg.timestamp`.
    pub fn from_serenity(
        msg: &Message,
        owner_id: Option<u64>,
        timed_out_until: Option<i64>,
        joined_at: Option<i64>,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let guild_id = msg.guild_id?.get();
        let author_id = msg.author.id.get();

        Some(Self {
            guild_id,
            channel_id: msg.channel_id.get(),
            message_id: msg.id.get(),
            author_id,
            content: msg.content.clone(),
            mentions: msg.mentions.iter().map(|u| u.id.get()).collect(),
            role_mentions: msg.mention_roles.iter().map(|r| r.get()).collect(),
            broadcast_mention: msg.mention_everyone,
            timestamp: now,
            member: MemberFlags {
                is_bot: msg.author.bot,
                is_server_owner: owner_id == Some(author_id),
                is_timed_out: timed_out_until.is_some_and(|t| t > now.timestamp()),
            },
            joined_at: joined_at.and_then(|t| DateTime::from_timestamp(t, 0)),
        })
    }
}
