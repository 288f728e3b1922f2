//! Sprzątanie w tle: prune aktywności i dołączeń, wygasanie wyciszeń i trybu raid.
//! Pętla trzyma tylko `Weak` do silnika i kończy się, gdy silnik zniknie.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::model::ACTIVITY_RETENTION_SECS;
use super::RaidGuard;

const EXPIRED_REASON: &str = "RaidGuard: czas wyciszenia minął";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JanitorReport {
    pub pruned_records: usize,
    pub expired_mutes: usize,
    pub unmute_failures: usize,
    pub pruned_joins: usize,
    pub expired_raid_modes: usize,
}

impl RaidGuard {
    /// Jeden obrót janitora. Wynik punktowy (`RaidScoreState`) nie jest tu ruszany.
    pub async fn janitor_tick(&self, now: DateTime<Utc>) -> JanitorReport {
        let mut report = JanitorReport {
            pruned_records: self
                .tracker
                .prune(now, chrono::Duration::seconds(ACTIVITY_RETENTION_SECS)),
            pruned_joins: self.prune_joins(now),
            ..Default::default()
        };

        let due: Vec<u64> = self
            .mutes
            .iter()
            .filter(|m| m.unmute_at <= now)
            .map(|m| *m.key())
            .collect();

        for uid in due {
            // rekord mógł zostać w międzyczasie przedłużony albo zdjęty ręcznie
            let Some((_, rec)) = self.mutes.remove_if(&uid, |_, m| m.unmute_at <= now) else {
                continue;
            };
            report.expired_mutes += 1;
            report.unmute_failures += self
                .clear_timeouts(uid, rec.guild_ids.into_iter(), EXPIRED_REASON)
                .await;
        }

        report.expired_raid_modes = self.expire_raid_modes(now).await;

        if report != JanitorReport::default() {
            tracing::debug!(
                pruned = report.pruned_records,
                expired = report.expired_mutes,
                failures = report.unmute_failures,
                joins = report.pruned_joins,
                raid_modes = report.expired_raid_modes,
                "raidguard janitor tick"
            );
        }
        report
    }
}

pub fn spawn(engine: &Arc<RaidGuard>, every: Duration) -> JoinHandle<()> {
    let weak: Weak<RaidGuard> = Arc::downgrade(engine);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(strong) = weak.upgrade() else {
                tracing::debug!("raidguard dropped, janitor stops");
                break;
            };
            strong.janitor_tick(Utc::now()).await;
        }
    })
}
