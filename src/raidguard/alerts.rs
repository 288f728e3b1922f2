//! Powiadomienia po wyciszeniu: krótki komunikat na kanale zdarzenia
//! (auto-usuwany) i szczegółowy raport na kanał alertów serwera.
//! Żaden błąd dostarczenia nie psuje samej reakcji.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::error::RaidError;
use super::model::{DeletedMessageEvidence, RaidModeAction, RaidModeEnd, Sensitivity, EVIDENCE_SAMPLES};
use super::platform::{ChannelRef, ModerationApi};

/// Szczegółowy raport incydentu.
#[derive(Debug, Clone, PartialEq)]
pub struct RaidReport {
    pub guild_id: u64,
    pub user_id: u64,
    pub channel_id: u64,
    pub score: u32,
    pub mute_threshold: u32,
    pub sensitivity: Sensitivity,
    pub duration_minutes: u32,
    pub deleted_count: usize,
    pub at: DateTime<Utc>,
    /// Max 3 zdeduplikowane próbki.
    pub samples: Vec<DeletedMessageEvidence>,
    /// Gotowe wzmianki ról, np. `<@&123>`.
    pub pings: Vec<String>,
}

/// Alert trybu raid (fala wejść albo koniec trybu).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaidModeAlert {
    JoinSpike {
        guild_id: u64,
        joins: usize,
        window_secs: i64,
        action: RaidModeAction,
        /// `None` gdy automatyczny tryb raid jest wyłączony.
        raid_mode_until: Option<DateTime<Utc>>,
        pings: Vec<String>,
    },
    Ended {
        guild_id: u64,
        reason: RaidModeEnd,
    },
}

impl RaidModeAlert {
    pub fn guild_id(&self) -> u64 {
        match self {
            RaidModeAlert::JoinSpike { guild_id, .. } | RaidModeAlert::Ended { guild_id, .. } => *guild_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertDelivery {
    pub notice_sent: bool,
    pub report_channel: Option<u64>,
}

#[derive(Clone)]
pub struct AlertPublisher {
    api: Arc<dyn ModerationApi>,
    notice_ttl: Duration,
}

impl AlertPublisher {
    pub fn new(api: Arc<dyn ModerationApi>, notice_ttl: Duration) -> Self {
        Self { api, notice_ttl }
    }

    pub async fn publish(&self, report: &RaidReport, alert_channel_id: Option<u64>) -> AlertDelivery {
        let mut delivery = AlertDelivery::default();

        let notice = notice_text(report.user_id, report.duration_minutes, report.deleted_count, &report.pings);
        match self
            .api
            .send_notice(report.channel_id, &notice, Some(self.notice_ttl))
            .await
        {
            Ok(()) => delivery.notice_sent = true,
            Err(e) => RaidError::api("send_notice", e).report(),
        }

        let Some(wanted) = alert_channel_id else {
            return delivery;
        };
        let Some(dest) = self.resolve_destination(report.guild_id, wanted).await else {
            tracing::warn!(gid = report.guild_id, alert_channel = wanted, "raid alert destination not found, report skipped");
            return delivery;
        };
        match self.api.send_report(dest, report).await {
            Ok(()) => delivery.report_channel = Some(dest),
            Err(e) => RaidError::api("send_report", e).report(),
        }
        delivery
    }

    /// Alert trybu raid na kanał alertów; zwraca kanał, na który poszedł.
    pub async fn publish_raid_mode(&self, alert: &RaidModeAlert, alert_channel_id: Option<u64>) -> Option<u64> {
        let wanted = alert_channel_id?;
        let Some(dest) = self.resolve_destination(alert.guild_id(), wanted).await else {
            tracing::warn!(gid = alert.guild_id(), alert_channel = wanted, "raid mode alert destination not found, skipped");
            return None;
        };
        match self.api.send_raid_mode_alert(dest, alert).await {
            Ok(()) => Some(dest),
            Err(e) => {
                RaidError::api("send_raid_mode_alert", e).report();
                None
            }
        }
    }

    /// Kanał tekstowy o danym ID, a jeśli go nie ma – wątek o tym ID w dowolnym kanale.
    /// Aktywne wątki pobieramy raz na serwer, zarchiwizowane per kanał.
    pub async fn resolve_destination(&self, guild_id: u64, wanted: u64) -> Option<u64> {
        let channels = match self.api.list_text_channels(guild_id).await {
            Ok(c) => c,
            Err(e) => {
                RaidError::api("list_text_channels", e).report();
                return None;
            }
        };
        if channels.iter().any(|c| c.id == wanted) {
            return Some(wanted);
        }

        let nested = |t: &ChannelRef| t.id == wanted && t.parent_id.is_some_and(|p| channels.iter().any(|c| c.id == p));
        match self.api.list_active_threads(guild_id).await {
            Ok(active) if active.iter().any(nested) => return Some(wanted),
            Ok(_) => {}
            Err(e) => RaidError::api("list_active_threads", e).report(),
        }

        for ch in &channels {
            match self.api.list_archived_threads(ch.id).await {
                Ok(archived) if archived.iter().any(|t| t.id == wanted) => return Some(wanted),
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, channel_id = ch.id, "archived threads lookup failed"),
            }
        }
        None
    }
}

pub fn raid_mode_text(alert: &RaidModeAlert) -> String {
    match alert {
        RaidModeAlert::JoinSpike { joins, window_secs, action, raid_mode_until, .. } => {
            let mut s = format!(
                "Wykryto możliwy raid: **{joins}** dołączeń w ciągu **{window_secs} s**.\n**Akcja dla nowych członków:** {}",
                action.as_str()
            );
            match raid_mode_until {
                Some(t) => s.push_str(&format!("\n**Tryb raid aktywny do:** <t:{}:R>", t.timestamp())),
                None => s.push_str("\n**Tryb raid:** automatyczne włączanie wyłączone"),
            }
            s
        }
        RaidModeAlert::Ended { reason: RaidModeEnd::Expired, .. } => {
            "🛡️ Tryb raid został automatycznie wyłączony.".into()
        }
        RaidModeAlert::Ended { reason: RaidModeEnd::Manual, .. } => "🛡️ Tryb raid został wyłączony ręcznie.".into(),
    }
}

pub fn notice_text(user_id: u64, minutes: u32, deleted: usize, pings: &[String]) -> String {
    let mut s = format!(
        "🚨 <@{user_id}> został wyciszony na **{minutes} min** przez RaidGuard (podejrzenie raidu/spamu). Usunięte wiadomości: **{deleted}**."
    );
    if !pings.is_empty() {
        s.push('\n');
        s.push_str(&pings.join(" "));
    }
    s
}

/// Pierwsze 3 wiadomości o różnych kluczach deduplikacji, w kolejności zebrania.
pub fn dedup_samples(evidence: &[DeletedMessageEvidence]) -> Vec<DeletedMessageEvidence> {
    let mut seen = HashSet::new();
    evidence
        .iter()
        .filter(|e| !e.content.trim().is_empty())
        .filter(|e| seen.insert(e.dedup_key()))
        .take(EVIDENCE_SAMPLES)
        .cloned()
        .collect()
}
