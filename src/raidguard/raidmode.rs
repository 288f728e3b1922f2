//! Tryb raid: wykrywanie fali wejść i akcja wobec nowych członków.
//!
//! `N` dołączeń w oknie czułości włącza tryb (jeśli `auto_raid_mode`) na 10 minut.
//! W tym czasie każdy nowy członek dostaje akcję serwera (mute 1h / kick / ban),
//! a wiadomości członków dołączonych < 5 min temu są usuwane tak samo.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;

use super::alerts::RaidModeAlert;
use super::coordinator::always_pinged;
use super::error::RaidError;
use super::model::{
    JoinEvent, MessageEvent, RaidModeAction, RaidModeEnd, RaidModeState, RaidModeTrigger,
    ServerRaidConfig, UserSlot, JOIN_RETENTION_SECS, RAID_MODE_BAN_DELETE_DAYS, RAID_MODE_SECS,
    RAID_MODE_TIMEOUT_MINUTES,
};
use super::{Disposition, IgnoreReason, RaidGuard};

const RAID_MODE_REASON: &str = "RaidGuard: tryb raid";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDisposition {
    Ignored(IgnoreReason),
    /// Zwykłe wejście; `recent` = dołączenia w oknie czułości.
    Recorded { recent: usize },
    /// Ten join przekroczył próg fali.
    RaidDetected {
        joins: usize,
        raid_mode_activated: bool,
        action_applied: bool,
    },
    /// Tryb raid był już aktywny.
    RaidModeAction { action: RaidModeAction, applied: bool },
}

impl RaidGuard {
    pub async fn on_member_join(&self, ev: &JoinEvent) -> JoinDisposition {
        if ev.is_bot {
            return JoinDisposition::Ignored(IgnoreReason::Bot);
        }
        let cfg = match self.store.get(ev.guild_id).await {
            Ok(c) => c,
            Err(e) => {
                RaidError::from(e).report();
                return JoinDisposition::Ignored(IgnoreReason::ConfigUnavailable);
            }
        };
        let Some(jt) = cfg.sensitivity.join_threshold() else {
            return JoinDisposition::Ignored(IgnoreReason::Disabled);
        };

        if let Some(mode) = self.raid_mode(ev.guild_id, ev.at) {
            let applied = self.apply_raid_action(ev.guild_id, ev.user_id, mode.action).await;
            return JoinDisposition::RaidModeAction { action: mode.action, applied };
        }

        let recent = self.record_join(ev.guild_id, ev.at, jt.window_secs);
        if recent < jt.joins {
            return JoinDisposition::Recorded { recent };
        }

        tracing::warn!(gid = ev.guild_id, joins = recent, window = jt.window_secs, "join spike detected");
        let activated = if cfg.auto_raid_mode {
            self.activate_raid_mode(&cfg, RaidModeTrigger::Auto, ev.at).await
        } else {
            None
        };

        // równoległy join mógł już włączyć tryb i wysłać alert
        if !cfg.auto_raid_mode || activated.is_some() {
            let alert = RaidModeAlert::JoinSpike {
                guild_id: ev.guild_id,
                joins: recent,
                window_secs: jt.window_secs,
                action: cfg.raid_mode_action,
                raid_mode_until: activated.map(|m| m.expires_at),
                pings: always_pinged(&cfg).into_iter().map(|r| format!("<@&{r}>")).collect(),
            };
            self.alerts.publish_raid_mode(&alert, cfg.alert_channel_id).await;
        }

        let action_applied = self
            .apply_raid_action(ev.guild_id, ev.user_id, cfg.raid_mode_action)
            .await;
        JoinDisposition::RaidDetected {
            joins: recent,
            raid_mode_activated: activated.is_some(),
            action_applied,
        }
    }

    /// Aktywny (niewygasły) tryb raid serwera.
    pub fn raid_mode(&self, guild_id: u64, now: DateTime<Utc>) -> Option<RaidModeState> {
        self.raid_modes
            .get(&guild_id)
            .map(|m| *m)
            .filter(|m| m.is_active(now))
    }

    /// Włącza tryb na 10 minut. `None`, gdy już jest aktywny.
    pub async fn activate_raid_mode(
        &self,
        cfg: &ServerRaidConfig,
        trigger: RaidModeTrigger,
        now: DateTime<Utc>,
    ) -> Option<RaidModeState> {
        let mode = RaidModeState {
            activated_at: now,
            expires_at: now + Duration::seconds(RAID_MODE_SECS),
            action: cfg.raid_mode_action,
            trigger,
        };
        let fresh = match self.raid_modes.entry(cfg.guild_id) {
            Entry::Occupied(mut o) => {
                if o.get().is_active(now) {
                    false
                } else {
                    o.insert(mode);
                    true
                }
            }
            Entry::Vacant(v) => {
                v.insert(mode);
                true
            }
        };
        if !fresh {
            return None;
        }

        tracing::warn!(
            gid = cfg.guild_id,
            action = mode.action.as_str(),
            trigger = trigger.as_str(),
            until = %mode.expires_at,
            "raid mode activated"
        );
        if let Err(e) = self.store.record_raid_mode(cfg.guild_id, &mode).await {
            RaidError::from(e).report();
        }
        Some(mode)
    }

    /// Ręczne wyłączenie. `false`, gdy tryb nie był aktywny.
    pub async fn end_raid_mode(&self, guild_id: u64, now: DateTime<Utc>) -> bool {
        let Some((_, mode)) = self.raid_modes.remove(&guild_id) else {
            return false;
        };
        let was_active = mode.is_active(now);
        let end = if was_active { RaidModeEnd::Manual } else { RaidModeEnd::Expired };
        self.finish_raid_mode(guild_id, end, now).await;
        was_active
    }

    /// Janitor: zdejmuje wygasłe tryby. Zwraca ich liczbę.
    pub(crate) async fn expire_raid_modes(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<u64> = self
            .raid_modes
            .iter()
            .filter(|m| !m.is_active(now))
            .map(|m| *m.key())
            .collect();

        let mut expired = 0;
        for gid in due {
            // mógł zostać w międzyczasie włączony ponownie
            if self.raid_modes.remove_if(&gid, |_, m| !m.is_active(now)).is_none() {
                continue;
            }
            expired += 1;
            self.finish_raid_mode(gid, RaidModeEnd::Expired, now).await;
        }
        expired
    }

    pub(crate) fn prune_joins(&self, now: DateTime<Utc>) -> usize {
        let horizon = now - Duration::seconds(JOIN_RETENTION_SECS);
        let mut pruned = 0;
        self.joins.retain(|_, q| {
            let before = q.len();
            q.retain(|t| *t > horizon);
            pruned += before - q.len();
            !q.is_empty()
        });
        pruned
    }

    /// Wiadomość nowego członka w trakcie trybu raid: usunięcie i akcja serwera.
    pub(crate) async fn raid_mode_message(
        &self,
        ev: &MessageEvent,
        slot: &UserSlot,
        mode: RaidModeState,
    ) -> Disposition {
        let Some(_responding) = slot.try_begin_response() else {
            return Disposition::Ignored(IgnoreReason::Responding);
        };
        if let Err(e) = self.api.delete_message(ev.channel_id, ev.message_id).await {
            RaidError::api("delete_raid_mode_message", e).report();
        }
        let applied = self.apply_raid_action(ev.guild_id, ev.author_id, mode.action).await;
        Disposition::RaidMode { action: mode.action, applied }
    }

    fn record_join(&self, guild_id: u64, at: DateTime<Utc>, window_secs: i64) -> usize {
        let mut q = self.joins.entry(guild_id).or_insert_with(VecDeque::new);
        q.push_back(at);
        let horizon = at - Duration::seconds(JOIN_RETENTION_SECS);
        while q.front().is_some_and(|t| *t <= horizon) {
            q.pop_front();
        }
        let since = at - Duration::seconds(window_secs);
        q.iter().filter(|t| **t > since).count()
    }

    async fn finish_raid_mode(&self, guild_id: u64, end: RaidModeEnd, now: DateTime<Utc>) {
        tracing::info!(gid = guild_id, status = end.as_status(), "raid mode deactivated");
        if let Err(e) = self.store.close_raid_mode(guild_id, end, now).await {
            RaidError::from(e).report();
        }
        let cfg = self.config_for(guild_id).await;
        self.alerts
            .publish_raid_mode(&RaidModeAlert::Ended { guild_id, reason: end }, cfg.alert_channel_id)
            .await;
    }

    async fn apply_raid_action(&self, guild_id: u64, user_id: u64, action: RaidModeAction) -> bool {
        let (op, res) = match action {
            RaidModeAction::Mute => (
                "raid_mode_timeout",
                self.api
                    .apply_timeout(guild_id, user_id, RAID_MODE_TIMEOUT_MINUTES, RAID_MODE_REASON)
                    .await,
            ),
            RaidModeAction::Kick => ("raid_mode_kick", self.api.kick_member(guild_id, user_id, RAID_MODE_REASON).await),
            RaidModeAction::Ban => (
                "raid_mode_ban",
                self.api
                    .ban_member(guild_id, user_id, RAID_MODE_BAN_DELETE_DAYS, RAID_MODE_REASON)
                    .await,
            ),
        };
        match res {
            Ok(()) => {
                tracing::info!(gid = guild_id, uid = user_id, action = action.as_str(), "raid mode action applied");
                true
            }
            Err(e) => {
                RaidError::api(op, e).report();
                false
            }
        }
    }
}
