//! Heurystyczny scoring pojedynczej wiadomości.
//!
//! `ScoreEngine::compute` jest czystą funkcją (wiadomość, mnożnik, snapshot aktywności):
//! te same wejścia zawsze dają ten sam wynik. Snapshot zawiera też ocenianą wiadomość,
//! bo tracker zapisuje ją przed scoringiem.

use std::collections::{BTreeSet, HashMap};

use chrono::Duration;
use once_cell::sync::Lazy;
use regex::Regex;

use super::model::{ActivityRecord, MessageEvent, Sensitivity, REPEAT_WINDOW_SECS};

static RE_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)https?://[^\s<>()]+"#).unwrap());

/// Mnożnik czułości trzymany w dziesiątych (Low=6, Medium=8, High=10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Multiplier(u32);

impl Multiplier {
    pub fn tenths(self) -> u32 {
        self.0
    }
}

impl From<Sensitivity> for Multiplier {
    fn from(s: Sensitivity) -> Self {
        Multiplier(s.multiplier_tenths())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    VeryLong,
    Long,
    AllCaps,
    RepeatedChar,
    Links,
    MassMentions,
    Mentions,
    Broadcast,
    VeryHighRate,
    HighRate,
    CrossChannel,
    DuplicateContent,
}

/// Wkład jednego sygnału przed mnożnikiem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreSignal {
    pub kind: SignalKind,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreBreakdown {
    pub signals: Vec<ScoreSignal>,
    pub raw: u32,
    pub total: u32,
}

pub struct ScoreEngine;

impl ScoreEngine {
    /// Wynik po mnożniku, obcięty do liczby całkowitej.
    pub fn compute(msg: &MessageEvent, multiplier: Multiplier, recent: &[ActivityRecord]) -> u32 {
        Self::breakdown(msg, multiplier, recent).total
    }

    pub fn breakdown(
        msg: &MessageEvent,
        multiplier: Multiplier,
        recent: &[ActivityRecord],
    ) -> ScoreBreakdown {
        let mut signals = content_signals(&msg.content);
        signals.extend(mention_signals(msg));
        signals.extend(behavior_signals(msg, recent));

        let raw: u32 = signals.iter().map(|s| s.weight).sum();
        let total = raw.saturating_mul(multiplier.tenths()) / 10;
        ScoreBreakdown { signals, raw, total }
    }
}

/* ==============================
   Sygnały treści
   ============================== */

fn content_signals(content: &str) -> Vec<ScoreSignal> {
    let mut out = Vec::new();
    let len = content.chars().count();

    if len > 500 {
        out.push(sig(SignalKind::VeryLong, 2));
    } else if len > 200 {
        out.push(sig(SignalKind::Long, 1));
    }

    if len > 15 && is_all_caps(content) {
        out.push(sig(SignalKind::AllCaps, 2));
    }

    if has_char_repeated_over(content, 10) {
        out.push(sig(SignalKind::RepeatedChar, 1));
    }

    let links = count_links(content);
    if links > 0 {
        out.push(sig(SignalKind::Links, (links * 2).min(6)));
    }

    out
}

fn mention_signals(msg: &MessageEvent) -> Vec<ScoreSignal> {
    let mut out = Vec::new();
    let mentions = msg.mention_count() as u32;
    if mentions > 5 {
        out.push(sig(SignalKind::MassMentions, 3));
    } else if mentions > 0 {
        out.push(sig(SignalKind::Mentions, mentions));
    }
    if msg.broadcast_mention {
        out.push(sig(SignalKind::Broadcast, 5));
    }
    out
}

/* ==============================
   Sygnały zachowania (okno 60s / 30s)
   ============================== */

fn behavior_signals(msg: &MessageEvent, recent: &[ActivityRecord]) -> Vec<ScoreSignal> {
    let mut out = Vec::new();
    let now = msg.timestamp;

    let rate = recent.len();
    if rate > 10 {
        out.push(sig(SignalKind::VeryHighRate, 5));
    } else if rate > 5 {
        out.push(sig(SignalKind::HighRate, 3));
    }

    let channels: BTreeSet<u64> = recent.iter().map(|r| r.channel_id).collect();
    if channels.len() > 3 {
        out.push(sig(SignalKind::CrossChannel, 4));
    }

    let cutoff = now - Duration::seconds(REPEAT_WINDOW_SECS);
    let mut counts: HashMap<&str, u32> = HashMap::new();
    for r in recent.iter().filter(|r| r.at > cutoff) {
        *counts.entry(r.content.as_str()).or_default() += 1;
    }
    let top = counts.values().copied().max().unwrap_or(0);
    if top > 2 {
        out.push(sig(SignalKind::DuplicateContent, top));
    }

    out
}

/* ==============================
   Pomocnicze
   ============================== */

#[inline]
fn sig(kind: SignalKind, weight: u32) -> ScoreSignal {
    ScoreSignal { kind, weight }
}

/// Są litery z wielkością i żadna nie jest mała.
fn is_all_caps(s: &str) -> bool {
    let mut cased = false;
    for c in s.chars() {
        if c.is_lowercase() {
            return false;
        }
        if c.is_uppercase() {
            cased = true;
        }
    }
    cased
}

fn has_char_repeated_over(s: &str, limit: usize) -> bool {
    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        let n = counts.entry(c).or_default();
        *n += 1;
        if *n > limit {
            return true;
        }
    }
    false
}

pub fn count_links(s: &str) -> u32 {
    RE_LINK.find_iter(s).count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raidguard::model::MemberFlags;
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;

    fn msg(content: &str, at: DateTime<Utc>) -> MessageEvent {
        MessageEvent {
            guild_id: 1,
            channel_id: 10,
            message_id: 100,
            author_id: 5,
            content: content.into(),
            mentions: vec![],
            role_mentions: vec![],
            broadcast_mention: false,
            timestamp: at,
            member: MemberFlags::default(),
            joined_at: None,
        }
    }

    fn rec(channel_id: u64, content: &str, at: DateTime<Utc>) -> ActivityRecord {
        ActivityRecord { user_id: 5, channel_id, message_id: 1, content: content.into(), at }
    }

    fn kinds(b: &ScoreBreakdown) -> Vec<SignalKind> {
        b.signals.iter().map(|s| s.kind).collect()
    }

    const FULL: Multiplier = Multiplier(10);

    #[test]
    fn plain_message_scores_zero() {
        let now = Utc::now();
        let m = msg("cześć wszystkim, co słychać?", now);
        assert_eq!(ScoreEngine::compute(&m, FULL, &[rec(10, &m.content, now)]), 0);
    }

    #[test]
    fn length_tiers() {
        let now = Utc::now();
        let b = ScoreEngine::breakdown(&msg(&"ab ".repeat(70), now), FULL, &[]);
        assert!(kinds(&b).contains(&SignalKind::Long));
        assert!(!kinds(&b).contains(&SignalKind::VeryLong));
        let b = ScoreEngine::breakdown(&msg(&"ab ".repeat(200), now), FULL, &[]);
        assert!(kinds(&b).contains(&SignalKind::VeryLong));
        assert!(!kinds(&b).contains(&SignalKind::Long));
        let b = ScoreEngine::breakdown(&msg(&"a".repeat(200), now), FULL, &[]);
        assert_eq!(kinds(&b), vec![SignalKind::RepeatedChar]);
    }

    #[test]
    fn caps_needs_more_than_fifteen_chars() {
        let now = Utc::now();
        assert_eq!(ScoreEngine::compute(&msg("THIS IS A RAID!!", now), FULL, &[]), 2);
        assert_eq!(ScoreEngine::compute(&msg("SHORT RAID!", now), FULL, &[]), 0);
        assert_eq!(ScoreEngine::compute(&msg("1234567890 123456", now), FULL, &[]), 0);
    }

    #[test]
    fn repeated_char_counts_once() {
        let now = Utc::now();
        let b = ScoreEngine::breakdown(&msg("aaaaaaaaaaabbbbbbbbbbbb", now), FULL, &[]);
        assert_eq!(kinds(&b), vec![SignalKind::RepeatedChar]);
        assert_eq!(b.total, 1);
    }

    #[test]
    fn links_are_capped_at_six() {
        let now = Utc::now();
        assert_eq!(ScoreEngine::compute(&msg("see https://a.example", now), FULL, &[]), 2);
        let many = "http://a.io http://b.io https://c.io https://d.io";
        assert_eq!(ScoreEngine::compute(&msg(many, now), FULL, &[]), 6);
    }

    #[test]
    fn mentions_and_broadcast() {
        let now = Utc::now();
        let mut m = msg("hej", now);
        m.mentions = vec![1, 2];
        m.role_mentions = vec![3];
        assert_eq!(ScoreEngine::compute(&m, FULL, &[]), 3);
        m.mentions = vec![1, 2, 3, 4, 5];
        assert_eq!(ScoreEngine::compute(&m, FULL, &[]), 3);
        m.broadcast_mention = true;
        assert_eq!(ScoreEngine::compute(&m, FULL, &[]), 8);
    }

    #[test]
    fn rate_and_cross_channel() {
        let now = Utc::now();
        let m = msg("hej", now);
        let six: Vec<_> = (0..6).map(|i| rec(10, &format!("m{i}"), now)).collect();
        assert_eq!(ScoreEngine::compute(&m, FULL, &six), 3);
        let eleven: Vec<_> = (0..11).map(|i| rec(10 + i % 4, &format!("m{i}"), now)).collect();
        // 5 (rate) + 4 (4 kanały)
        assert_eq!(ScoreEngine::compute(&m, FULL, &eleven), 9);
    }

    #[test]
    fn duplicates_only_count_inside_thirty_seconds() {
        let now = Utc::now();
        let m = msg("kup teraz", now);
        let old = now - Duration::seconds(45);
        let recent = vec![
            rec(10, "kup teraz", old),
            rec(10, "kup teraz", old),
            rec(10, "kup teraz", now - Duration::seconds(5)),
            rec(10, "kup teraz", now),
        ];
        assert_eq!(ScoreEngine::compute(&m, FULL, &recent), 0);
        let mut recent = recent;
        recent.push(rec(10, "kup teraz", now));
        assert_eq!(ScoreEngine::compute(&m, FULL, &recent), 3);
    }

    #[test]
    fn multiplier_truncates_total() {
        let now = Utc::now();
        // raw 2+5 = 7 -> Low 4.2 -> 4, Medium 5.6 -> 5, High 7
        let mut m = msg("https://x.example", now);
        m.broadcast_mention = true;
        assert_eq!(ScoreEngine::compute(&m, Sensitivity::Low.into(), &[]), 4);
        assert_eq!(ScoreEngine::compute(&m, Sensitivity::Medium.into(), &[]), 5);
        assert_eq!(ScoreEngine::compute(&m, Sensitivity::High.into(), &[]), 7);
    }

    proptest! {
        #[test]
        fn compute_is_deterministic(
            content in ".{0,600}",
            mentions in 0usize..9,
            broadcast in any::<bool>(),
            history in proptest::collection::vec((0u64..6, 0i64..90, "[ab]{1,2}"), 0..14),
            level in 1u8..=3,
        ) {
            let now = Utc::now();
            let mut m = msg(&content, now);
            m.mentions = (0..mentions as u64).collect();
            m.broadcast_mention = broadcast;
            let recent: Vec<_> = history
                .iter()
                .map(|(ch, ago, c)| rec(*ch, c, now - Duration::seconds(*ago)))
                .collect();
            let mult = Multiplier::from(Sensitivity::try_from(level).unwrap());
            let a = ScoreEngine::compute(&m, mult, &recent);
            let b = ScoreEngine::compute(&m.clone(), mult, &recent.clone());
            prop_assert_eq!(a, b);
            let full = ScoreEngine::compute(&m, FULL, &recent);
            prop_assert!(a <= full);
        }
    }
}
