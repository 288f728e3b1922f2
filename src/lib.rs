// src/lib.rs

pub mod config;
pub mod db;
pub mod discord;
pub mod logging;
pub mod raidguard;

use anyhow::Result;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;

use config::Settings;
use db::Db;
use raidguard::platform::SerenityModerationApi;
use raidguard::store::PgConfigStore;
use raidguard::verifier::GeminiClassifier;
use raidguard::RaidGuard;

use serenity::all::{GatewayIntents, Http};

/// Globalny kontekst aplikacji: konfiguracja, pula DB i silnik RaidGuard.
/// Silnik powstaje dopiero w `ready`, bo potrzebuje `Http` z klienta.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Settings,
    pub db: Db,
    raidguard: OnceCell<Arc<RaidGuard>>,
}

impl AppContext {
    /// Bootstrap: logi → DB → tabele.
    pub async fn bootstrap(settings: Settings) -> Result<Arc<Self>> {
        logging::init(&settings);

        let db = db::connect(&settings.database.url, settings.database.max_connections).await?;
        db::ensure_tables(&db).await?;

        Ok(Arc::new(Self {
            settings,
            db,
            raidguard: OnceCell::new(),
        }))
    }

    pub fn raidguard(&self) -> Option<Arc<RaidGuard>> {
        self.raidguard.get().cloned()
    }

    /// Buduje silnik przy pierwszym wywołaniu (i startuje janitora); kolejne
    /// wywołania (np. po reconnect) zwracają ten sam egzemplarz.
    pub fn init_raidguard(&self, http: Arc<Http>) -> Result<Arc<RaidGuard>> {
        let rg = self.raidguard.get_or_try_init(|| -> Result<Arc<RaidGuard>> {
            let cfg = &self.settings.raidguard;
            let classifier = GeminiClassifier::from_config(&cfg.classifier)?;
            if !classifier.is_enabled() {
                tracing::warn!("GEMINI_API_KEY not set, intent verification disabled");
            }
            let store = PgConfigStore::new(self.db.clone(), Duration::from_secs(cfg.config_cache_ttl_secs));
            let engine = RaidGuard::new(
                Arc::new(store),
                Arc::new(SerenityModerationApi::new(http)),
                Arc::new(classifier),
                cfg,
            );
            raidguard::janitor::spawn(&engine, Duration::from_secs(cfg.janitor_interval_secs.max(1)));
            tracing::info!(janitor_secs = cfg.janitor_interval_secs, "raidguard engine ready");
            Ok(engine)
        })?;
        Ok(rg.clone())
    }
}

/// Intents potrzebne RaidGuardowi:
/// GUILDS, GUILD_MESSAGES, MESSAGE_CONTENT (treść do punktacji),
/// GUILD_MEMBERS (stan timeoutu autora).
pub fn default_gateway_intents() -> GatewayIntents {
    GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MEMBERS
}

/// Start klienta Discorda (Gateway + slash commands).
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    discord::run_bot(ctx).await
}
