//! Weryfikacja intencji przez zewnętrzny model (Gemini). Wołana tylko w paśmie
//! `ai <= score < mute`, max 2 razy na użytkownika, nigdy równolegle.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use serenity::async_trait;

use super::error::{ClassifierError, RaidError};
use super::model::{
    ServerRaidConfig, Sensitivity, UserSlot, AI_BONUS_PER_LEVEL, AI_CONFIDENCE_FLOOR,
    MAX_AI_CHECKS, MIN_AI_CONTENT_CHARS,
};
use crate::config::ClassifierConfig;

static RE_CONFIDENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+\.\d+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntentVerdict {
    pub is_malicious: bool,
    pub confidence: f32,
}

impl IntentVerdict {
    pub const BENIGN: IntentVerdict = IntentVerdict { is_malicious: false, confidence: 0.0 };

    /// `8 * poziom` gdy model jest pewny (> 0.7), inaczej 0.
    pub fn bonus(self, sensitivity: Sensitivity) -> u32 {
        if self.is_malicious && self.confidence > AI_CONFIDENCE_FLOOR {
            AI_BONUS_PER_LEVEL * u32::from(sensitivity.level())
        } else {
            0
        }
    }
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn check_intent(&self, text: &str) -> Result<IntentVerdict, ClassifierError>;
}

/* ==============================
   Gemini
   ============================== */

pub struct GeminiClassifier {
    http: Client,
    endpoint: String,
    api_key: String,
}

impl GeminiClassifier {
    pub fn from_config(cfg: &ClassifierConfig) -> Result<Self, ClassifierError> {
        let http = Client::builder()
            .user_agent("Tigris-RaidGuard/1.0")
            .connect_timeout(Duration::from_millis(1500))
            .build()?;
        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
            api_key: cfg.api_key.trim().to_string(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        !self.api_key.is_empty()
    }
}

fn prompt(text: &str) -> String {
    format!(
        "Analyze this message and determine if it has malicious intent (raid, spam, troll, harassment, etc). \
         Reply with ONLY \"YES\" or \"NO\" followed by a confidence score from 0.0 to 1.0 \
         (e.g., \"YES 0.85\" or \"NO 0.3\"): \"{text}\""
    )
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl GenerateResponse {
    fn first_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .find_map(|p| p.text)
    }
}

#[async_trait]
impl IntentClassifier for GeminiClassifier {
    async fn check_intent(&self, text: &str) -> Result<IntentVerdict, ClassifierError> {
        if !self.is_enabled() {
            return Err(ClassifierError::Disabled);
        }

        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt(text) }] }],
            "generationConfig": { "temperature": 0.0, "maxOutputTokens": 16 }
        });

        let resp = self
            .http
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ClassifierError::Status(status.as_u16()));
        }

        let parsed: GenerateResponse = resp.json().await?;
        let answer = parsed
            .first_text()
            .ok_or_else(|| ClassifierError::Unparseable("no candidates".into()))?;
        parse_verdict(&answer)
    }
}

/// `YES 0.85` → złośliwe (brak liczby → 0.8); `NO …` → niezłośliwe (brak liczby → 0.5).
pub fn parse_verdict(raw: &str) -> Result<IntentVerdict, ClassifierError> {
    let answer = raw.trim().to_uppercase();
    let (is_malicious, default) = if answer.starts_with("YES") {
        (true, 0.8)
    } else if answer.starts_with("NO") {
        (false, 0.5)
    } else {
        return Err(ClassifierError::Unparseable(raw.chars().take(80).collect()));
    };

    let confidence = RE_CONFIDENCE
        .find(&answer)
        .and_then(|m| m.as_str().parse::<f32>().ok())
        .unwrap_or(default)
        .clamp(0.0, 1.0);

    Ok(IntentVerdict { is_malicious, confidence })
}

/* ==============================
   Weryfikator
   ============================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    ShortContent,
    LimitReached,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerifyOutcome {
    Skipped(SkipReason),
    Checked { verdict: IntentVerdict, bonus: u32 },
}

impl VerifyOutcome {
    pub fn bonus(self) -> u32 {
        match self {
            VerifyOutcome::Checked { bonus, .. } => bonus,
            VerifyOutcome::Skipped(_) => 0,
        }
    }
}

pub struct IntentVerifier {
    classifier: Arc<dyn IntentClassifier>,
    timeout: Duration,
}

impl IntentVerifier {
    pub fn new(classifier: Arc<dyn IntentClassifier>, timeout: Duration) -> Self {
        Self { classifier, timeout }
    }

    /// Nie zmienia wyniku; zwraca bonus do doliczenia przez wołającego.
    /// Licznik `ai_checks_performed` rośnie przed wywołaniem modelu.
    pub async fn check(&self, slot: &UserSlot, cfg: &ServerRaidConfig, content: &str) -> VerifyOutcome {
        if !cfg.enabled() {
            return VerifyOutcome::Skipped(SkipReason::Disabled);
        }
        if content.chars().count() < MIN_AI_CONTENT_CHARS {
            return VerifyOutcome::Skipped(SkipReason::ShortContent);
        }
        let Some(_verifying) = slot.try_begin_verify() else {
            return VerifyOutcome::Skipped(SkipReason::InFlight);
        };
        {
            let mut st = slot.state.lock().await;
            if st.ai_checks_performed >= MAX_AI_CHECKS {
                return VerifyOutcome::Skipped(SkipReason::LimitReached);
            }
            st.ai_checks_performed += 1;
        }

        let verdict = match tokio::time::timeout(self.timeout, self.classifier.check_intent(content)).await {
            Ok(Ok(v)) => v,
            Ok(Err(ClassifierError::Disabled)) => {
                tracing::debug!(gid = cfg.guild_id, "intent classifier disabled, treating as benign");
                IntentVerdict::BENIGN
            }
            Ok(Err(e)) => {
                RaidError::from(e).report();
                IntentVerdict::BENIGN
            }
            Err(_) => {
                let ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                RaidError::from(ClassifierError::Timeout(ms)).report();
                IntentVerdict::BENIGN
            }
        };

        let bonus = verdict.bonus(cfg.sensitivity);
        tracing::debug!(
            gid = cfg.guild_id,
            malicious = verdict.is_malicious,
            confidence = verdict.confidence,
            bonus,
            "intent check done"
        );
        VerifyOutcome::Checked { verdict, bonus }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct Scripted {
        calls: AtomicUsize,
        verdict: Result<IntentVerdict, ()>,
        hold: Option<Arc<Notify>>,
        delay: Option<Duration>,
    }

    impl Scripted {
        fn answering(v: IntentVerdict) -> Self {
            Self { calls: AtomicUsize::new(0), verdict: Ok(v), hold: None, delay: None }
        }
    }

    #[async_trait]
    impl IntentClassifier for Scripted {
        async fn check_intent(&self, _text: &str) -> Result<IntentVerdict, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(n) = &self.hold {
                n.notified().await;
            }
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            self.verdict.map_err(|_| ClassifierError::Status(503))
        }
    }

    fn cfg(s: Sensitivity) -> ServerRaidConfig {
        ServerRaidConfig { guild_id: 1, sensitivity: s, ..Default::default() }
    }

    const LONG: &str = "join my server now free nitro for everyone";

    #[test]
    fn parses_yes_and_no_answers() {
        assert_eq!(parse_verdict("YES 0.85").unwrap(), IntentVerdict { is_malicious: true, confidence: 0.85 });
        assert_eq!(parse_verdict(" yes").unwrap().confidence, 0.8);
        assert_eq!(parse_verdict("NO 0.3").unwrap(), IntentVerdict { is_malicious: false, confidence: 0.3 });
        assert_eq!(parse_verdict("NO").unwrap().confidence, 0.5);
        assert!(matches!(parse_verdict("maybe?"), Err(ClassifierError::Unparseable(_))));
    }

    #[test]
    fn bonus_needs_confidence_above_floor() {
        let sure = IntentVerdict { is_malicious: true, confidence: 0.85 };
        assert_eq!(sure.bonus(Sensitivity::Low), 8);
        assert_eq!(sure.bonus(Sensitivity::Medium), 16);
        assert_eq!(sure.bonus(Sensitivity::High), 24);
        let edge = IntentVerdict { is_malicious: true, confidence: 0.7 };
        assert_eq!(edge.bonus(Sensitivity::High), 0);
        assert_eq!(IntentVerdict::BENIGN.bonus(Sensitivity::High), 0);
    }

    #[tokio::test]
    async fn at_most_two_checks_per_user() {
        let cls = Arc::new(Scripted::answering(IntentVerdict { is_malicious: false, confidence: 0.4 }));
        let v = IntentVerifier::new(cls.clone(), Duration::from_secs(1));
        let slot = UserSlot::default();
        let c = cfg(Sensitivity::Medium);

        assert!(matches!(v.check(&slot, &c, LONG).await, VerifyOutcome::Checked { bonus: 0, .. }));
        assert!(matches!(v.check(&slot, &c, LONG).await, VerifyOutcome::Checked { .. }));
        assert_eq!(v.check(&slot, &c, LONG).await, VerifyOutcome::Skipped(SkipReason::LimitReached));
        assert_eq!(cls.calls.load(Ordering::SeqCst), 2);
        assert_eq!(slot.snapshot().await.ai_checks_performed, 2);
    }

    #[tokio::test]
    async fn skips_short_content_and_disabled_server() {
        let cls = Arc::new(Scripted::answering(IntentVerdict { is_malicious: true, confidence: 0.9 }));
        let v = IntentVerifier::new(cls.clone(), Duration::from_secs(1));
        let slot = UserSlot::default();

        assert_eq!(
            v.check(&slot, &cfg(Sensitivity::High), "krótko").await,
            VerifyOutcome::Skipped(SkipReason::ShortContent)
        );
        assert_eq!(
            v.check(&slot, &cfg(Sensitivity::Off), LONG).await,
            VerifyOutcome::Skipped(SkipReason::Disabled)
        );
        assert_eq!(cls.calls.load(Ordering::SeqCst), 0);
        assert_eq!(slot.snapshot().await.ai_checks_performed, 0);
    }

    #[tokio::test]
    async fn concurrent_check_for_same_user_is_skipped() {
        let gate = Arc::new(Notify::new());
        let cls = Arc::new(Scripted {
            hold: Some(gate.clone()),
            ..Scripted::answering(IntentVerdict { is_malicious: true, confidence: 0.9 })
        });
        let v = Arc::new(IntentVerifier::new(cls.clone(), Duration::from_secs(5)));
        let slot = Arc::new(UserSlot::default());
        let c = cfg(Sensitivity::Low);

        let first = {
            let (v, slot, c) = (v.clone(), slot.clone(), c.clone());
            tokio::spawn(async move { v.check(&slot, &c, LONG).await })
        };
        while !slot.is_verifying() {
            tokio::task::yield_now().await;
        }

        assert_eq!(v.check(&slot, &c, LONG).await, VerifyOutcome::Skipped(SkipReason::InFlight));
        gate.notify_one();

        let out = first.await.unwrap();
        assert_eq!(out.bonus(), 8);
        assert!(!slot.is_verifying());
        assert_eq!(cls.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_and_timeouts_degrade_to_benign() {
        let failing = Arc::new(Scripted {
            verdict: Err(()),
            ..Scripted::answering(IntentVerdict::BENIGN)
        });
        let v = IntentVerifier::new(failing, Duration::from_secs(1));
        let slot = UserSlot::default();
        let out = v.check(&slot, &cfg(Sensitivity::High), LONG).await;
        assert_eq!(out, VerifyOutcome::Checked { verdict: IntentVerdict::BENIGN, bonus: 0 });

        let slow = Arc::new(Scripted {
            delay: Some(Duration::from_secs(10)),
            ..Scripted::answering(IntentVerdict { is_malicious: true, confidence: 0.99 })
        });
        let v = IntentVerifier::new(slow, Duration::from_millis(20));
        let slot = UserSlot::default();
        let out = v.check(&slot, &cfg(Sensitivity::High), LONG).await;
        assert_eq!(out.bonus(), 0);
        assert_eq!(slot.snapshot().await.ai_checks_performed, 1);
        assert!(!slot.is_verifying());
    }

    #[tokio::test]
    async fn empty_key_reports_disabled() {
        let g = GeminiClassifier::from_config(&ClassifierConfig::default()).unwrap();
        assert!(!g.is_enabled());
        assert!(matches!(g.check_intent(LONG).await, Err(ClassifierError::Disabled)));
    }
}
