//! Typy domenowe RaidGuarda: konfiguracja serwera, zdarzenie wiadomości,
//! stan punktowy użytkownika, rekord wyciszenia i dowody usuniętych wiadomości.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/* ==============================
   Stałe
   ============================== */

/// Aktywność starsza niż 10 minut jest usuwana przez janitora.
pub const ACTIVITY_RETENTION_SECS: i64 = 600;
pub const RATE_WINDOW_SECS: i64 = 60;
pub const REPEAT_WINDOW_SECS: i64 = 30;
/// Kanały, na których user pisał w ostatnich 5 minutach, są czyszczone przy mute.
pub const CLEANUP_LOOKBACK_SECS: i64 = 300;
pub const ALERT_COOLDOWN_SECS: i64 = 30;
pub const MAX_DELETES_PER_CHANNEL: usize = 50;
/// Jedna strona historii kanału przeglądana podczas sprzątania.
pub const HISTORY_SCAN_LIMIT: u8 = 100;
pub const MAX_AI_CHECKS: u8 = 2;
pub const MIN_AI_CONTENT_CHARS: usize = 20;
pub const AI_CONFIDENCE_FLOOR: f32 = 0.7;
pub const AI_BONUS_PER_LEVEL: u32 = 8;
pub const EVIDENCE_SAMPLES: usize = 3;
pub const EVIDENCE_KEY_CHARS: usize = 50;
/// Wejścia starsze niż 5 minut nie są już potrzebne do wykrywania fali.
pub const JOIN_RETENTION_SECS: i64 = 300;
pub const RAID_MODE_SECS: i64 = 600;
/// W trybie raid wiadomości członków dołączonych < 5 min temu są traktowane jak raid.
pub const NEWCOMER_SECS: i64 = 300;
pub const RAID_MODE_TIMEOUT_MINUTES: u32 = 60;
pub const RAID_MODE_BAN_DELETE_DAYS: u8 = 1;

/* ==============================
   Czułość i progi
   ============================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum Sensitivity {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub ai: u32,
    pub mute: u32,
}

/// Fala wejść: `joins` dołączeń w ciągu `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinThreshold {
    pub joins: usize,
    pub window_secs: i64,
}

/// Widełki czasu wyciszenia w minutach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationTier {
    pub base: u32,
    pub max: u32,
}

impl Sensitivity {
    /// 0 = Off, 1..=3 = Low..High.
    pub fn level(self) -> u8 {
        match self {
            Sensitivity::Off => 0,
            Sensitivity::Low => 1,
            Sensitivity::Medium => 2,
            Sensitivity::High => 3,
        }
    }

    /// Mnożnik wag w dziesiątych częściach (0.6 / 0.8 / 1.0), żeby obcinanie było dokładne.
    pub fn multiplier_tenths(self) -> u32 {
        match self {
            Sensitivity::Off => 0,
            Sensitivity::Low => 6,
            Sensitivity::Medium => 8,
            Sensitivity::High => 10,
        }
    }

    pub fn thresholds(self) -> Option<Thresholds> {
        match self {
            Sensitivity::Off => None,
            Sensitivity::Low => Some(Thresholds { ai: 15, mute: 20 }),
            Sensitivity::Medium => Some(Thresholds { ai: 10, mute: 15 }),
            Sensitivity::High => Some(Thresholds { ai: 8, mute: 12 }),
        }
    }

    pub fn duration_tier(self) -> Option<DurationTier> {
        match self {
            Sensitivity::Off => None,
            Sensitivity::Low => Some(DurationTier { base: 5, max: 30 }),
            Sensitivity::Medium => Some(DurationTier { base: 10, max: 120 }),
            Sensitivity::High => Some(DurationTier { base: 30, max: 480 }),
        }
    }

    pub fn join_threshold(self) -> Option<JoinThreshold> {
        match self {
            Sensitivity::Off => None,
            Sensitivity::Low => Some(JoinThreshold { joins: 5, window_secs: 20 }),
            Sensitivity::Medium => Some(JoinThreshold { joins: 4, window_secs: 30 }),
            Sensitivity::High => Some(JoinThreshold { joins: 3, window_secs: 30 }),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Sensitivity::Off => "Off",
            Sensitivity::Low => "Low",
            Sensitivity::Medium => "Medium",
            Sensitivity::High => "High",
        }
    }
}

impl TryFrom<u8> for Sensitivity {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Sensitivity::Off),
            1 => Ok(Sensitivity::Low),
            2 => Ok(Sensitivity::Medium),
            3 => Ok(Sensitivity::High),
            other => Err(format!("sensitivity must be 0..=3, got {other}")),
        }
    }
}

impl From<Sensitivity> for u8 {
    fn from(s: Sensitivity) -> u8 {
        s.level()
    }
}

/* ==============================
   Konfiguracja serwera
   ============================== */

/// Co tryb raid robi z nowymi członkami.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RaidModeAction {
    /// Timeout na 1 godzinę.
    #[default]
    Mute,
    Kick,
    /// Ban z usunięciem wiadomości z ostatniego dnia.
    Ban,
}

impl RaidModeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RaidModeAction::Mute => "mute",
            RaidModeAction::Kick => "kick",
            RaidModeAction::Ban => "ban",
        }
    }
}

impl TryFrom<&str> for RaidModeAction {
    type Error = String;

    fn try_from(v: &str) -> Result<Self, Self::Error> {
        match v {
            "mute" => Ok(RaidModeAction::Mute),
            "kick" => Ok(RaidModeAction::Kick),
            "ban" => Ok(RaidModeAction::Ban),
            other => Err(format!("unknown raid mode action {other:?}")),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Konfiguracja anty-raid jednego serwera. `enabled()` wynika z czułości,
/// więc nie da się zapisać stanu „włączony, ale Off”.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRaidConfig {
    pub guild_id: u64,
    #[serde(default)]
    pub sensitivity: Sensitivity,
    #[serde(default)]
    pub mod_role_id: Option<u64>,
    #[serde(default)]
    pub manager_role_id: Option<u64>,
    /// Pingowana przy każdym alercie, zaraz po moderatorach.
    #[serde(default)]
    pub staff_role_id: Option<u64>,
    #[serde(default)]
    pub alert_channel_id: Option<u64>,
    /// Fala wejść sama włącza tryb raid.
    #[serde(default = "default_true")]
    pub auto_raid_mode: bool,
    #[serde(default)]
    pub raid_mode_action: RaidModeAction,
}

impl Default for ServerRaidConfig {
    fn default() -> Self {
        Self {
            guild_id: 0,
            sensitivity: Sensitivity::Off,
            mod_role_id: None,
            manager_role_id: None,
            staff_role_id: None,
            alert_channel_id: None,
            auto_raid_mode: true,
            raid_mode_action: RaidModeAction::Mute,
        }
    }
}

impl ServerRaidConfig {
    pub fn disabled(guild_id: u64) -> Self {
        Self {
            guild_id,
            ..Default::default()
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.sensitivity != Sensitivity::Off
    }
}

/* ==============================
   Zdarzenie wejściowe
   ============================== */

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberFlags {
    pub is_bot: bool,
    pub is_server_owner: bool,
    pub is_timed_out: bool,
}

/// Wiadomość z gildii w postaci niezależnej od serenity.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub author_id: u64,
    pub content: String,
    pub mentions: Vec<u64>,
    pub role_mentions: Vec<u64>,
    pub broadcast_mention: bool,
    pub timestamp: DateTime<Utc>,
    pub member: MemberFlags,
    /// Kiedy autor dołączył do serwera, jeśli wiadomo.
    pub joined_at: Option<DateTime<Utc>>,
}

impl MessageEvent {
    pub fn mention_count(&self) -> usize {
        self.mentions.len() + self.role_mentions.len()
    }

    pub fn jump_link(&self) -> String {
        jump_link(self.guild_id, self.channel_id, self.message_id)
    }

    pub fn is_newcomer(&self) -> bool {
        self.joined_at
            .is_some_and(|j| (self.timestamp - j).num_seconds() < NEWCOMER_SECS)
    }
}

/// Dołączenie członka do serwera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinEvent {
    pub guild_id: u64,
    pub user_id: u64,
    pub is_bot: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidModeTrigger {
    Auto,
    Manual,
}

impl RaidModeTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            RaidModeTrigger::Auto => "auto",
            RaidModeTrigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidModeEnd {
    Expired,
    Manual,
}

impl RaidModeEnd {
    /// Status wiersza w `tss.raid_history`.
    pub fn as_status(self) -> &'static str {
        match self {
            RaidModeEnd::Expired => "expired",
            RaidModeEnd::Manual => "ended",
        }
    }
}

/// Aktywny tryb raid jednego serwera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaidModeState {
    pub activated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub action: RaidModeAction,
    pub trigger: RaidModeTrigger,
}

impl RaidModeState {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

pub fn jump_link(guild_id: u64, channel_id: u64, message_id: u64) -> String {
    format!("https://discord.com/channels/{guild_id}/{channel_id}/{message_id}")
}

/* ==============================
   Aktywność, stan, mute, dowody
   ============================== */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRecord {
    pub user_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl From<&MessageEvent> for ActivityRecord {
    fn from(ev: &MessageEvent) -> Self {
        Self {
            user_id: ev.author_id,
            channel_id: ev.channel_id,
            message_id: ev.message_id,
            content: ev.content.clone(),
            at: ev.timestamp,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaidScoreState {
    pub score: u32,
    pub last_alert_at: Option<DateTime<Utc>>,
    pub ai_checks_performed: u8,
    /// Rośnie przy każdym resecie po wyciszeniu. Bonus AI policzony
    /// dla starszej generacji jest odrzucany.
    pub reset_generation: u64,
}

impl RaidScoreState {
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.last_alert_at
            .is_some_and(|t| (now - t).num_milliseconds() < ALERT_COOLDOWN_SECS * 1000)
    }
}

/// Stan użytkownika współdzielony między równoległymi wiadomościami.
/// Flagi in-flight są brane przez CAS; liczby siedzą za mutexem,
/// którego nie trzymamy w trakcie wywołań sieciowych.
#[derive(Debug, Default)]
pub struct UserSlot {
    pub(crate) state: Mutex<RaidScoreState>,
    verifying: AtomicBool,
    responding: AtomicBool,
}

impl UserSlot {
    pub fn try_begin_verify(&self) -> Option<FlagGuard<'_>> {
        FlagGuard::acquire(&self.verifying)
    }

    pub fn try_begin_response(&self) -> Option<FlagGuard<'_>> {
        FlagGuard::acquire(&self.responding)
    }

    pub fn is_verifying(&self) -> bool {
        self.verifying.load(Ordering::Acquire)
    }

    pub fn is_responding(&self) -> bool {
        self.responding.load(Ordering::Acquire)
    }

    pub async fn snapshot(&self) -> RaidScoreState {
        self.state.lock().await.clone()
    }
}

/// Zwalnia flagę przy dropie – także przy błędzie i panice.
#[derive(Debug)]
pub struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlagGuard(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuteRecord {
    pub user_id: u64,
    pub unmute_at: DateTime<Utc>,
    pub guild_ids: BTreeSet<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedMessageEvidence {
    pub content: String,
    pub channel_id: u64,
    pub message_id: u64,
    pub at: DateTime<Utc>,
    pub jump_link: String,
}

impl DeletedMessageEvidence {
    /// Klucz deduplikacji: lowercase, trim, pierwsze 50 znaków.
    pub fn dedup_key(&self) -> String {
        self.content
            .trim()
            .to_lowercase()
            .chars()
            .take(EVIDENCE_KEY_CHARS)
            .collect()
    }
}

/// Zapis incydentu (tss.raid_incidents).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaidIncident {
    pub guild_id: u64,
    pub user_id: u64,
    pub score: u32,
    pub mute_threshold: u32,
    pub sensitivity: Sensitivity,
    pub duration_minutes: u32,
    pub deleted_count: usize,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn enabled_follows_sensitivity() {
        let mut cfg = ServerRaidConfig::disabled(1);
        assert!(!cfg.enabled());
        cfg.sensitivity = Sensitivity::Medium;
        assert!(cfg.enabled());
    }

    #[test]
    fn sensitivity_serializes_as_level() {
        let cfg = ServerRaidConfig {
            guild_id: 7,
            sensitivity: Sensitivity::High,
            mod_role_id: Some(11),
            raid_mode_action: RaidModeAction::Ban,
            ..Default::default()
        };
        let v = serde_json::to_value(&cfg).unwrap();
        assert_eq!(v["sensitivity"], 3);
        assert_eq!(v["raid_mode_action"], "ban");

        let bad = serde_json::json!({ "guild_id": 7, "sensitivity": 9 });
        assert!(serde_json::from_value::<ServerRaidConfig>(bad).is_err());
    }

    #[test]
    fn stored_config_without_new_fields_keeps_auto_raid_mode() {
        let old = serde_json::json!({ "guild_id": 7, "sensitivity": 2, "mod_role_id": 11 });
        let cfg: ServerRaidConfig = serde_json::from_value(old).unwrap();
        assert!(cfg.auto_raid_mode);
        assert_eq!(cfg.raid_mode_action, RaidModeAction::Mute);
        assert_eq!(cfg.staff_role_id, None);
        assert!(ServerRaidConfig::disabled(7).auto_raid_mode);
    }

    #[test]
    fn join_thresholds_per_sensitivity() {
        assert!(Sensitivity::Off.join_threshold().is_none());
        assert_eq!(Sensitivity::Low.join_threshold(), Some(JoinThreshold { joins: 5, window_secs: 20 }));
        assert_eq!(Sensitivity::High.join_threshold(), Some(JoinThreshold { joins: 3, window_secs: 30 }));
        assert_eq!(RaidModeAction::try_from("kick"), Ok(RaidModeAction::Kick));
        assert!(RaidModeAction::try_from("warn").is_err());
    }

    #[test]
    fn newcomer_means_joined_under_five_minutes_ago() {
        let now = Utc::now();
        let mut ev = MessageEvent {
            guild_id: 1,
            channel_id: 2,
            message_id: 3,
            author_id: 4,
            content: String::new(),
            mentions: vec![],
            role_mentions: vec![],
            broadcast_mention: false,
            timestamp: now,
            member: MemberFlags::default(),
            joined_at: None,
        };
        assert!(!ev.is_newcomer());
        ev.joined_at = Some(now - Duration::seconds(299));
        assert!(ev.is_newcomer());
        ev.joined_at = Some(now - Duration::seconds(300));
        assert!(!ev.is_newcomer());
    }

    #[test]
    fn off_has_no_thresholds() {
        assert!(Sensitivity::Off.thresholds().is_none());
        assert_eq!(Sensitivity::Medium.thresholds(), Some(Thresholds { ai: 10, mute: 15 }));
        assert_eq!(Sensitivity::High.duration_tier(), Some(DurationTier { base: 30, max: 480 }));
    }

    #[test]
    fn cooldown_is_thirty_seconds() {
        let now = Utc::now();
        let st = RaidScoreState {
            last_alert_at: Some(now - Duration::seconds(29)),
            ..Default::default()
        };
        assert!(st.in_cooldown(now));
        let st = RaidScoreState {
            last_alert_at: Some(now - Duration::seconds(30)),
            ..Default::default()
        };
        assert!(!st.in_cooldown(now));
        assert!(!RaidScoreState::default().in_cooldown(now));
        // alert z późniejszym znacznikiem niż bieżąca wiadomość
        let st = RaidScoreState {
            last_alert_at: Some(now + Duration::seconds(1)),
            ..Default::default()
        };
        assert!(st.in_cooldown(now));
    }

    #[test]
    fn flag_guard_is_exclusive_and_released_on_drop() {
        let slot = UserSlot::default();
        let g = slot.try_begin_verify().expect("first acquire");
        assert!(slot.is_verifying());
        assert!(slot.try_begin_verify().is_none());
        drop(g);
        assert!(!slot.is_verifying());
        assert!(slot.try_begin_verify().is_some());
    }

    #[test]
    fn dedup_key_normalizes_prefix() {
        let ev = |c: &str| DeletedMessageEvidence {
            content: c.into(),
            channel_id: 1,
            message_id: 1,
            at: Utc::now(),
            jump_link: String::new(),
        };
        assert_eq!(ev("  JOIN NOW ").dedup_key(), ev("join now").dedup_key());
        let long = "x".repeat(80);
        assert_eq!(ev(&long).dedup_key().chars().count(), 50);
    }
}
