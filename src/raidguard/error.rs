use thiserror::Error;

/// Błąd wywołania platformy (Discord).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("discord: {0}")]
    Discord(#[from] serenity::Error),
    #[error("{0}")]
    Other(String),
}

/// Błąd klasyfikatora intencji; zawsze degraduje do „nie złośliwe”.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier disabled (no api key)")]
    Disabled,
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("classifier returned status {0}")]
    Status(u16),
    #[error("classifier timed out after {0} ms")]
    Timeout(u64),
    #[error("unparseable classifier response: {0:?}")]
    Unparseable(String),
}

/// Błąd magazynu konfiguracji / incydentów.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("db: {0}")]
    Db(#[from] sqlx::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Jak poważny jest błąd dla bieżącej wiadomości.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Pojedyncza operacja (delete/send/lookup/odczyt configu) nie wyszła; lecimy dalej.
    Recoverable,
    /// Klasyfikator niedostępny; traktujemy jak „nie złośliwe”.
    Degraded,
    /// Nie udało się nałożyć timeoutu; przerywamy tylko tę reakcję.
    FatalToTrigger,
}

#[derive(Debug, Error)]
pub enum RaidError {
    #[error("{op} failed: {source}")]
    Api {
        op: &'static str,
        #[source]
        source: ApiError,
    },
    #[error("config store failed: {0}")]
    Store(#[from] StoreError),
    #[error("intent check degraded: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("timeout for user {user_id} in guild {guild_id} not applied: {source}")]
    TimeoutNotApplied {
        guild_id: u64,
        user_id: u64,
        #[source]
        source: ApiError,
    },
}

impl RaidError {
    pub fn api(op: &'static str, source: ApiError) -> Self {
        RaidError::Api { op, source }
    }

    pub fn tier(&self) -> Tier {
        match self {
            RaidError::Api { .. } | RaidError::Store(_) => Tier::Recoverable,
            RaidError::Classifier(_) => Tier::Degraded,
            RaidError::TimeoutNotApplied { .. } => Tier::FatalToTrigger,
        }
    }

    /// Loguje błąd na poziomie odpowiadającym jego warstwie.
    pub fn report(&self) {
        match self.tier() {
            Tier::Recoverable => tracing::warn!(target: "tigris_raidguard::raidguard", error = %self, "recoverable failure, continuing"),
            Tier::Degraded => tracing::warn!(target: "tigris_raidguard::raidguard", error = %self, "intent check degraded to not-malicious"),
            Tier::FatalToTrigger => tracing::error!(target: "tigris_raidguard::raidguard", error = %self, "response aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_match_taxonomy() {
        assert_eq!(RaidError::api("delete", ApiError::Other("x".into())).tier(), Tier::Recoverable);
        assert_eq!(RaidError::from(ClassifierError::Timeout(10)).tier(), Tier::Degraded);
        let fatal = RaidError::TimeoutNotApplied {
            guild_id: 1,
            user_id: 2,
            source: ApiError::Other("Unknown Member".into()),
        };
        assert_eq!(fatal.tier(), Tier::FatalToTrigger);
        assert!(fatal.to_string().contains("user 2"));
    }
}
