//! Okno aktywności per użytkownik (ostatnie wiadomości: czas, treść, kanał).
//! Tracker tylko dopisuje; przycinaniem zajmuje się janitor.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use super::model::ActivityRecord;

#[derive(Debug, Default)]
pub struct ActivityTracker {
    by_user: DashMap<u64, VecDeque<ActivityRecord>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, rec: ActivityRecord) {
        self.by_user
            .entry(rec.user_id)
            .or_insert_with(|| VecDeque::with_capacity(32))
            .push_back(rec);
    }

    /// Rekordy ściśle nowsze niż `now - seconds`.
    pub fn window(&self, user_id: u64, seconds: i64, now: DateTime<Utc>) -> Vec<ActivityRecord> {
        let cutoff = now - Duration::seconds(seconds);
        self.by_user
            .get(&user_id)
            .map(|q| q.iter().filter(|r| r.at > cutoff).cloned().collect())
            .unwrap_or_default()
    }

    /// Kanały, na których user pisał po `since`.
    pub fn channels_since(&self, user_id: u64, since: DateTime<Utc>) -> BTreeSet<u64> {
        self.by_user
            .get(&user_id)
            .map(|q| q.iter().filter(|r| r.at > since).map(|r| r.channel_id).collect())
            .unwrap_or_default()
    }

    /// Zostawia tylko rekordy z `at > now - max_age`; puste wpisy znikają.
    /// Zwraca liczbę usuniętych rekordów.
    pub fn prune(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let cutoff = now - max_age;
        let mut removed = 0usize;
        self.by_user.retain(|_, q| {
            let before = q.len();
            q.retain(|r| r.at > cutoff);
            removed += before - q.len();
            !q.is_empty()
        });
        removed
    }

    pub fn is_tracked(&self, user_id: u64) -> bool {
        self.by_user.contains_key(&user_id)
    }

    pub fn len_for(&self, user_id: u64) -> usize {
        self.by_user.get(&user_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn tracked_users(&self) -> usize {
        self.by_user.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(user_id: u64, channel_id: u64, at: DateTime<Utc>) -> ActivityRecord {
        ActivityRecord {
            user_id,
            channel_id,
            message_id: at.timestamp_millis() as u64,
            content: "hej".into(),
            at,
        }
    }

    #[test]
    fn window_excludes_boundary_record() {
        let t = ActivityTracker::new();
        let now = Utc::now();
        t.record(rec(1, 10, now - Duration::seconds(60)));
        t.record(rec(1, 10, now - Duration::seconds(59)));
        t.record(rec(1, 11, now));
        t.record(rec(2, 10, now));

        let w = t.window(1, 60, now);
        assert_eq!(w.len(), 2);
        assert!(w.iter().all(|r| r.user_id == 1));
        assert!(t.window(3, 60, now).is_empty());
    }

    #[test]
    fn channels_since_is_distinct() {
        let t = ActivityTracker::new();
        let now = Utc::now();
        t.record(rec(1, 10, now - Duration::seconds(400)));
        t.record(rec(1, 11, now - Duration::seconds(100)));
        t.record(rec(1, 11, now - Duration::seconds(50)));
        t.record(rec(1, 12, now));

        let ch = t.channels_since(1, now - Duration::seconds(300));
        assert_eq!(ch.into_iter().collect::<Vec<_>>(), vec![11, 12]);
    }

    #[test]
    fn record_does_not_prune() {
        let t = ActivityTracker::new();
        let now = Utc::now();
        t.record(rec(1, 10, now - Duration::hours(5)));
        t.record(rec(1, 10, now));
        assert_eq!(t.len_for(1), 2);
    }

    #[test]
    fn prune_drops_exact_boundary_and_empty_users() {
        let t = ActivityTracker::new();
        let now = Utc::now();
        let ten = Duration::minutes(10);
        t.record(rec(1, 10, now - ten));
        t.record(rec(1, 10, now - ten + Duration::milliseconds(1)));
        t.record(rec(2, 10, now - ten - Duration::seconds(1)));

        let removed = t.prune(now, ten);
        assert_eq!(removed, 2);
        assert_eq!(t.len_for(1), 1);
        assert!(!t.is_tracked(2));
        assert_eq!(t.tracked_users(), 1);
    }
}
