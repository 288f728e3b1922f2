//! Granica z platformą czatu. Silnik zna tylko `ModerationApi`;
//! implementacja produkcyjna to cienka warstwa nad `serenity::http::Http`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serenity::all::{
    ChannelId, ChannelType, Colour, CreateAllowedMentions, CreateEmbed, CreateEmbedFooter,
    CreateMessage, EditMember, GetMessages, GuildChannel, GuildId, Http, MessageId, Timestamp, UserId,
};
use serenity::async_trait;

use super::alerts::{raid_mode_text, RaidModeAlert, RaidReport};
use super::error::ApiError;

const SYSTEM_NAME: &str = "Tigris Security System™ • RaidGuard";

/// Wiadomość z historii kanału (tylko to, czego potrzebuje sprzątanie).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub id: u64,
    pub channel_id: u64,
    pub author_id: u64,
    pub content: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRef {
    pub id: u64,
    pub name: String,
    /// Kanał nadrzędny, dla wątków.
    pub parent_id: Option<u64>,
}

#[async_trait]
pub trait ModerationApi: Send + Sync {
    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<(), ApiError>;
    /// Najnowsze wiadomości kanału (jedna strona, max `limit`).
    async fn recent_messages(&self, channel_id: u64, limit: u8) -> Result<Vec<ChannelMessage>, ApiError>;
    async fn apply_timeout(&self, guild_id: u64, user_id: u64, minutes: u32, reason: &str) -> Result<(), ApiError>;
    async fn clear_timeout(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<(), ApiError>;
    /// Krótki komunikat; `delete_after` = auto-usunięcie.
    async fn send_notice(&self, channel_id: u64, content: &str, delete_after: Option<Duration>) -> Result<(), ApiError>;
    async fn send_report(&self, channel_id: u64, report: &RaidReport) -> Result<(), ApiError>;
    async fn send_raid_mode_alert(&self, channel_id: u64, alert: &RaidModeAlert) -> Result<(), ApiError>;
    async fn kick_member(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<(), ApiError>;
    async fn ban_member(&self, guild_id: u64, user_id: u64, delete_message_days: u8, reason: &str) -> Result<(), ApiError>;
    async fn list_text_channels(&self, guild_id: u64) -> Result<Vec<ChannelRef>, ApiError>;
    /// Wszystkie aktywne wątki serwera, jednym zapytaniem.
    async fn list_active_threads(&self, guild_id: u64) -> Result<Vec<ChannelRef>, ApiError>;
    /// Zarchiwizowane publiczne wątki jednego kanału.
    async fn list_archived_threads(&self, channel_id: u64) -> Result<Vec<ChannelRef>, ApiError>;
}

/* =========================================
   Implementacja serenity
   ========================================= */

pub struct SerenityModerationApi {
    http: Arc<Http>,
}

impl SerenityModerationApi {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

fn to_chrono(ts: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.unix_timestamp(), 0).unwrap_or_else(Utc::now)
}

#[async_trait]
impl ModerationApi for SerenityModerationApi {
    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<(), ApiError> {
        ChannelId::new(channel_id)
            .delete_message(&self.http, MessageId::new(message_id))
            .await?;
        Ok(())
    }

    async fn recent_messages(&self, channel_id: u64, limit: u8) -> Result<Vec<ChannelMessage>, ApiError> {
        let msgs = ChannelId::new(channel_id)
            .messages(&self.http, GetMessages::new().limit(limit))
            .await?;
        Ok(msgs
            .into_iter()
            .map(|m| ChannelMessage {
                id: m.id.get(),
                channel_id,
                author_id: m.author.id.get(),
                at: to_chrono(m.timestamp),
                content: m.content,
            })
            .collect())
    }

    async fn apply_timeout(&self, guild_id: u64, user_id: u64, minutes: u32, reason: &str) -> Result<(), ApiError> {
        let until = Utc::now() + chrono::Duration::minutes(i64::from(minutes));
        let ts = Timestamp::from_unix_timestamp(until.timestamp())
            .map_err(|e| ApiError::Other(format!("bad timeout timestamp: {e}")))?;
        GuildId::new(guild_id)
            .edit_member(
                &self.http,
                UserId::new(user_id),
                EditMember::new()
                    .disable_communication_until_datetime(ts)
                    .audit_log_reason(reason),
            )
            .await?;
        Ok(())
    }

    async fn clear_timeout(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<(), ApiError> {
        GuildId::new(guild_id)
            .edit_member(
                &self.http,
                UserId::new(user_id),
                EditMember::new().enable_communication().audit_log_reason(reason),
            )
            .await?;
        Ok(())
    }

    async fn send_notice(&self, channel_id: u64, content: &str, delete_after: Option<Duration>) -> Result<(), ApiError> {
        let msg = ChannelId::new(channel_id)
            .send_message(
                &self.http,
                CreateMessage::new()
                    .content(content)
                    .allowed_mentions(CreateAllowedMentions::new().all_users(true).all_roles(true)),
            )
            .await?;

        if let Some(ttl) = delete_after {
            let http = self.http.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Err(e) = msg.delete(&http).await {
                    tracing::debug!(error=?e, "auto-delete of raid notice failed");
                }
            });
        }
        Ok(())
    }

    async fn send_report(&self, channel_id: u64, report: &RaidReport) -> Result<(), ApiError> {
        let mut builder = CreateMessage::new().embed(report_embed(report));
        if !report.pings.is_empty() {
            builder = builder
                .content(report.pings.join(" "))
                .allowed_mentions(CreateAllowedMentions::new().all_roles(true));
        }
        ChannelId::new(channel_id).send_message(&self.http, builder).await?;
        Ok(())
    }

    async fn send_raid_mode_alert(&self, channel_id: u64, alert: &RaidModeAlert) -> Result<(), ApiError> {
        let builder = match alert {
            RaidModeAlert::JoinSpike { pings, .. } => {
                let mut b = CreateMessage::new().embed(
                    CreateEmbed::new()
                        .title("🚨 RaidGuard – fala wejść")
                        .description(raid_mode_text(alert))
                        .colour(Colour::new(0xE67E22))
                        .footer(CreateEmbedFooter::new(SYSTEM_NAME)),
                );
                if !pings.is_empty() {
                    b = b
                        .content(pings.join(" "))
                        .allowed_mentions(CreateAllowedMentions::new().all_roles(true));
                }
                b
            }
            RaidModeAlert::Ended { .. } => CreateMessage::new().content(raid_mode_text(alert)),
        };
        ChannelId::new(channel_id).send_message(&self.http, builder).await?;
        Ok(())
    }

    async fn kick_member(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<(), ApiError> {
        GuildId::new(guild_id)
            .kick_with_reason(&self.http, UserId::new(user_id), reason)
            .await?;
        Ok(())
    }

    async fn ban_member(&self, guild_id: u64, user_id: u64, delete_message_days: u8, reason: &str) -> Result<(), ApiError> {
        GuildId::new(guild_id)
            .ban_with_reason(&self.http, UserId::new(user_id), delete_message_days, reason)
            .await?;
        Ok(())
    }

    async fn list_text_channels(&self, guild_id: u64) -> Result<Vec<ChannelRef>, ApiError> {
        let map = GuildId::new(guild_id).channels(&self.http).await?;
        Ok(map
            .into_values()
            .filter(|c| matches!(c.kind, ChannelType::Text | ChannelType::News))
            .map(|c| ChannelRef { id: c.id.get(), name: c.name, parent_id: None })
            .collect())
    }

    async fn list_active_threads(&self, guild_id: u64) -> Result<Vec<ChannelRef>, ApiError> {
        let active = GuildId::new(guild_id).get_active_threads(&self.http).await?;
        Ok(active.threads.into_iter().map(thread_ref).collect())
    }

    async fn list_archived_threads(&self, channel_id: u64) -> Result<Vec<ChannelRef>, ApiError> {
        let archived = ChannelId::new(channel_id)
            .get_archived_public_threads(&self.http, None, Some(50))
            .await?;
        Ok(archived.threads.into_iter().map(thread_ref).collect())
    }
}

fn thread_ref(t: GuildChannel) -> ChannelRef {
    ChannelRef {
        id: t.id.get(),
        parent_id: t.parent_id.map(|p| p.get()),
        name: t.name,
    }
}

/* =========================================
   Embed raportu
   ========================================= */

fn report_embed(r: &RaidReport) -> CreateEmbed {
    let ts = r.at.timestamp();
    let mut e = CreateEmbed::new()
        .title("🚨 RaidGuard – automatyczne wyciszenie")
        .colour(Colour::new(0xE74C3C))
        .field("Użytkownik", format!("<@{}> (`{}`)", r.user_id, r.user_id), true)
        .field("Wynik", format!("{}/{}", r.score, r.mute_threshold), true)
        .field("Czułość", r.sensitivity.label(), true)
        .field("Czas", format!("{} min", r.duration_minutes), true)
        .field("Kanał", format!("<#{}>", r.channel_id), true)
        .field("Usunięte wiadomości", r.deleted_count.to_string(), true)
        .field("Kiedy", format!("<t:{ts}:F> • <t:{ts}:R>"), false)
        .footer(CreateEmbedFooter::new(SYSTEM_NAME));

    for (i, s) in r.samples.iter().enumerate() {
        e = e.field(
            format!("Próbka #{}", i + 1),
            format!("```{}```[przejdź]({})", truncate(&s.content, 300), s.jump_link),
            false,
        );
    }
    e
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut t: String = s.chars().take(max.saturating_sub(1)).collect();
        t.push('…');
        t
    }
}
