//! Reakcja po przekroczeniu progu mute: sprzątanie wiadomości, timeout,
//! powiadomienia, zapis incydentu i reset wyniku.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use super::alerts::{dedup_samples, AlertDelivery, AlertPublisher, RaidReport};
use super::error::RaidError;
use super::model::{
    jump_link, DeletedMessageEvidence, MessageEvent, MuteRecord, RaidIncident, Sensitivity,
    ServerRaidConfig, UserSlot, CLEANUP_LOOKBACK_SECS, HISTORY_SCAN_LIMIT, MAX_DELETES_PER_CHANNEL,
};
use super::platform::ModerationApi;
use super::store::ConfigStore;
use super::tracker::ActivityTracker;

const TIMEOUT_REASON: &str = "RaidGuard: automatyczne wykrycie raidu/spamu";

/* ==============================
   Czyste obliczenia
   ============================== */

/// `min(1, (score - mute) / mute)`; 0 poniżej progu.
pub fn severity(score: u32, mute_threshold: u32) -> f64 {
    if mute_threshold == 0 {
        return 1.0;
    }
    let over = f64::from(score.saturating_sub(mute_threshold));
    (over / f64::from(mute_threshold)).min(1.0)
}

/// Czas wyciszenia w minutach, zawsze w `[base, max]` danej czułości.
pub fn timeout_minutes(sensitivity: Sensitivity, severity: f64) -> u32 {
    let Some(tier) = sensitivity.duration_tier() else {
        return 0;
    };
    let raw = if severity < 0.3 {
        tier.base
    } else if severity < 0.6 {
        tier.base * 2
    } else {
        let span = f64::from(tier.max - tier.base);
        tier.base + (severity.clamp(0.0, 1.0) * span) as u32
    };
    raw.clamp(tier.base, tier.max)
}

/// Role do oznaczenia. Moderatorzy i staff zawsze; managerowie zależnie od czułości:
/// High zawsze, Medium przy wydłużonym timeoucie, Low tylko przy severity > 0.7.
pub fn ping_targets(cfg: &ServerRaidConfig, severity: f64, duration_minutes: u32) -> Vec<String> {
    let mut roles = always_pinged(cfg);

    let extended = cfg
        .sensitivity
        .duration_tier()
        .is_some_and(|t| duration_minutes > t.base);
    let page_managers = match cfg.sensitivity {
        Sensitivity::High => true,
        Sensitivity::Medium => extended,
        Sensitivity::Low => severity > 0.7,
        Sensitivity::Off => false,
    };
    if page_managers {
        if let Some(r) = cfg.manager_role_id {
            if !roles.contains(&r) {
                roles.push(r);
            }
        }
    }

    roles.into_iter().map(|r| format!("<@&{r}>")).collect()
}

/// Moderatorzy, potem staff; bez duplikatów.
pub fn always_pinged(cfg: &ServerRaidConfig) -> Vec<u64> {
    let mut roles: Vec<u64> = Vec::with_capacity(3);
    for r in [cfg.mod_role_id, cfg.staff_role_id].into_iter().flatten() {
        if !roles.contains(&r) {
            roles.push(r);
        }
    }
    roles
}

/* ==============================
   Koordynator
   ============================== */

/// Wszystko, czego potrzebuje jedna reakcja.
pub struct ResponseRequest<'a> {
    pub ev: &'a MessageEvent,
    pub cfg: &'a ServerRaidConfig,
    pub slot: &'a UserSlot,
    pub tracker: &'a ActivityTracker,
    pub mutes: &'a DashMap<u64, MuteRecord>,
    pub score: u32,
    pub mute_threshold: u32,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MuteOutcome {
    pub duration_minutes: u32,
    pub severity: f64,
    pub deleted_count: usize,
    pub delivery: AlertDelivery,
}

pub struct ResponseCoordinator {
    api: Arc<dyn ModerationApi>,
    store: Arc<dyn ConfigStore>,
    alerts: AlertPublisher,
}

impl ResponseCoordinator {
    pub fn new(api: Arc<dyn ModerationApi>, store: Arc<dyn ConfigStore>, alerts: AlertPublisher) -> Self {
        Self { api, store, alerts }
    }

    /// Wołający trzyma flagę `responding` przez cały czas trwania.
    /// Błąd = timeout nie został nałożony; wynik zostaje bez zmian.
    pub async fn respond(&self, req: ResponseRequest<'_>) -> Result<MuteOutcome, RaidError> {
        let ev = req.ev;
        let sev = severity(req.score, req.mute_threshold);
        let minutes = timeout_minutes(req.cfg.sensitivity, sev);

        tracing::info!(
            gid = ev.guild_id,
            uid = ev.author_id,
            score = req.score,
            threshold = req.mute_threshold,
            severity = sev,
            minutes,
            "raid threshold crossed, responding"
        );

        let mut evidence = Vec::new();
        match self.api.delete_message(ev.channel_id, ev.message_id).await {
            Ok(()) => evidence.push(DeletedMessageEvidence {
                content: ev.content.clone(),
                channel_id: ev.channel_id,
                message_id: ev.message_id,
                at: ev.timestamp,
                jump_link: ev.jump_link(),
            }),
            Err(e) => RaidError::api("delete_trigger", e).report(),
        }

        let mut channels: BTreeSet<u64> = req
            .tracker
            .channels_since(ev.author_id, req.now - Duration::seconds(CLEANUP_LOOKBACK_SECS));
        channels.insert(ev.channel_id);
        for ch in channels {
            self.sweep_channel(ev, ch, &mut evidence).await;
        }
        let deleted_count = evidence.len();

        if let Err(source) = self
            .api
            .apply_timeout(ev.guild_id, ev.author_id, minutes, TIMEOUT_REASON)
            .await
        {
            return Err(RaidError::TimeoutNotApplied {
                guild_id: ev.guild_id,
                user_id: ev.author_id,
                source,
            });
        }

        {
            let mut st = req.slot.state.lock().await;
            st.last_alert_at = st.last_alert_at.max(Some(req.now));
        }

        let unmute_at = req.now + Duration::minutes(i64::from(minutes));
        req.mutes
            .entry(ev.author_id)
            .and_modify(|m| {
                m.unmute_at = m.unmute_at.max(unmute_at);
                m.guild_ids.insert(ev.guild_id);
            })
            .or_insert_with(|| MuteRecord {
                user_id: ev.author_id,
                unmute_at,
                guild_ids: BTreeSet::from([ev.guild_id]),
            });

        let report = RaidReport {
            guild_id: ev.guild_id,
            user_id: ev.author_id,
            channel_id: ev.channel_id,
            score: req.score,
            mute_threshold: req.mute_threshold,
            sensitivity: req.cfg.sensitivity,
            duration_minutes: minutes,
            deleted_count,
            at: req.now,
            samples: dedup_samples(&evidence),
            pings: ping_targets(req.cfg, sev, minutes),
        };
        let delivery = self.alerts.publish(&report, req.cfg.alert_channel_id).await;

        let incident = RaidIncident {
            guild_id: ev.guild_id,
            user_id: ev.author_id,
            score: req.score,
            mute_threshold: req.mute_threshold,
            sensitivity: req.cfg.sensitivity,
            duration_minutes: minutes,
            deleted_count,
            created_at: req.now,
        };
        if let Err(e) = self.store.record_incident(&incident).await {
            RaidError::from(e).report();
        }

        {
            let mut st = req.slot.state.lock().await;
            st.score = 0;
            st.ai_checks_performed = 0;
            st.reset_generation = st.reset_generation.wrapping_add(1);
        }

        tracing::info!(gid = ev.guild_id, uid = ev.author_id, minutes, deleted_count, "raider muted");
        Ok(MuteOutcome {
            duration_minutes: minutes,
            severity: sev,
            deleted_count,
            delivery,
        })
    }

    /// Jedna strona historii; max 50 wiadomości autora. Wiadomość wyzwalająca jest pomijana.
    async fn sweep_channel(&self, ev: &MessageEvent, channel_id: u64, evidence: &mut Vec<DeletedMessageEvidence>) {
        let history = match self.api.recent_messages(channel_id, HISTORY_SCAN_LIMIT).await {
            Ok(h) => h,
            Err(e) => {
                RaidError::api("recent_messages", e).report();
                return;
            }
        };

        let own = history
            .into_iter()
            .filter(|m| m.author_id == ev.author_id && m.id != ev.message_id)
            .take(MAX_DELETES_PER_CHANNEL);

        for m in own {
            match self.api.delete_message(channel_id, m.id).await {
                Ok(()) => evidence.push(DeletedMessageEvidence {
                    jump_link: jump_link(ev.guild_id, channel_id, m.id),
                    content: m.content,
                    channel_id,
                    message_id: m.id,
                    at: m.at,
                }),
                Err(e) => RaidError::api("delete_message", e).report(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cfg(s: Sensitivity) -> ServerRaidConfig {
        ServerRaidConfig {
            guild_id: 1,
            sensitivity: s,
            mod_role_id: Some(100),
            manager_role_id: Some(200),
            ..Default::default()
        }
    }

    #[test]
    fn severity_is_capped() {
        assert_eq!(severity(20, 20), 0.0);
        assert_eq!(severity(25, 20), 0.25);
        assert_eq!(severity(100, 20), 1.0);
    }

    #[test]
    fn duration_tiers() {
        assert_eq!(timeout_minutes(Sensitivity::Low, 0.25), 5);
        assert_eq!(timeout_minutes(Sensitivity::Low, 0.3), 10);
        assert_eq!(timeout_minutes(Sensitivity::Medium, 13.0 / 15.0), 105);
        assert_eq!(timeout_minutes(Sensitivity::High, 1.0), 480);
        assert_eq!(timeout_minutes(Sensitivity::High, 0.59), 60);
        // 2*base mieści się w max dla każdej czułości
        assert_eq!(timeout_minutes(Sensitivity::Medium, 0.45), 20);
    }

    #[test]
    fn moderators_always_pinged() {
        assert_eq!(ping_targets(&cfg(Sensitivity::Low), 0.1, 5), vec!["<@&100>"]);
    }

    #[test]
    fn manager_ping_depends_on_sensitivity() {
        assert_eq!(ping_targets(&cfg(Sensitivity::High), 0.0, 30).len(), 2);
        assert_eq!(ping_targets(&cfg(Sensitivity::Medium), 0.1, 10).len(), 1);
        assert_eq!(ping_targets(&cfg(Sensitivity::Medium), 0.4, 20).len(), 2);
        assert_eq!(ping_targets(&cfg(Sensitivity::Low), 0.7, 26).len(), 1);
        assert_eq!(ping_targets(&cfg(Sensitivity::Low), 0.71, 26), vec!["<@&100>", "<@&200>"]);
    }

    #[test]
    fn same_role_is_pinged_once() {
        let mut c = cfg(Sensitivity::High);
        c.manager_role_id = c.mod_role_id;
        assert_eq!(ping_targets(&c, 1.0, 480), vec!["<@&100>"]);
    }

    #[test]
    fn staff_role_pinged_after_moderators() {
        let mut c = cfg(Sensitivity::Low);
        c.staff_role_id = Some(300);
        assert_eq!(ping_targets(&c, 0.1, 5), vec!["<@&100>", "<@&300>"]);

        c.sensitivity = Sensitivity::High;
        assert_eq!(ping_targets(&c, 1.0, 480), vec!["<@&100>", "<@&300>", "<@&200>"]);

        c.staff_role_id = Some(100);
        assert_eq!(ping_targets(&c, 0.1, 30), vec!["<@&100>", "<@&200>"]);
    }

    proptest! {
        #[test]
        fn duration_stays_in_tier(level in 1u8..=3, score in 0u32..10_000, mute in 1u32..100) {
            let s = Sensitivity::try_from(level).unwrap();
            let tier = s.duration_tier().unwrap();
            let d = timeout_minutes(s, severity(score, mute));
            prop_assert!(d >= tier.base && d <= tier.max);
        }
    }
}
