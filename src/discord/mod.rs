// src/discord/mod.rs
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures_util::FutureExt;
use serenity::all::*;
use serenity::async_trait;

use crate::raidguard::commands::RaidCommands;
use crate::raidguard::model::{JoinEvent, MessageEvent};
use crate::raidguard::raidmode::JoinDisposition;
use crate::raidguard::Disposition;
use crate::AppContext;

pub struct Handler {
    pub app: Arc<AppContext>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!("Logged in as {}", ready.user.name);

        if let Err(e) = self.app.init_raidguard(ctx.http.clone()) {
            tracing::error!(error=?e, "raidguard init failed, anti-raid inactive");
        }

        for g in ready.guilds {
            if let Err(e) = RaidCommands::register_commands(&ctx, g.id).await {
                tracing::warn!(error=?e, gid=%g.id.get(), "register antiraid commands failed");
            }
        }
    }

    async fn guild_create(&self, ctx: Context, guild: Guild, is_new: Option<bool>) {
        if is_new == Some(true) {
            if let Err(e) = RaidCommands::register_commands(&ctx, guild.id).await {
                tracing::warn!(error=?e, gid=%guild.id.get(), "register antiraid commands failed");
            }
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let fut = RaidCommands::on_interaction(&ctx, &self.app, interaction);
        if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
            tracing::error!("panic in antiraid interaction handler");
        }
    }

    async fn message(&self, ctx: Context, msg: Message) {
        let Some(gid) = msg.guild_id else {
            return;
        };
        let Some(rg) = self.app.raidguard() else {
            return;
        };

        // Referencje do cache nie mogą przeżyć `.await`.
        let (owner_id, timed_out_until, joined_at) = {
            let owner = ctx.cache.guild(gid).map(|g| g.owner_id.get());
            let member = ctx.cache.member(gid, msg.author.id);
            let until = member
                .as_ref()
                .and_then(|m| m.communication_disabled_until)
                .map(|t| t.unix_timestamp());
            let joined = member
                .as_ref()
                .and_then(|m| m.joined_at)
                .or_else(|| msg.member.as_ref().and_then(|m| m.joined_at))
                .map(|t| t.unix_timestamp());
            (owner, until, joined)
        };

        let Some(ev) = MessageEvent::from_serenity(&msg, owner_id, timed_out_until, joined_at, Utc::now()) else {
            return;
        };

        let fut = async { rg.on_message(&ev).await };
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(Disposition::Muted(out))) => {
                tracing::info!(
                    gid = gid.get(),
                    uid = ev.author_id,
                    minutes = out.duration_minutes,
                    deleted = out.deleted_count,
                    "raid response completed"
                );
            }
            Ok(Ok(Disposition::RaidMode { action, applied })) => {
                tracing::info!(gid = gid.get(), uid = ev.author_id, action = action.as_str(), applied, "newcomer message during raid mode");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => e.report(),
            Err(_) => tracing::error!(gid = gid.get(), uid = ev.author_id, "panic in raidguard pipeline"),
        }
    }

    async fn guild_member_addition(&self, _ctx: Context, new_member: Member) {
        let Some(rg) = self.app.raidguard() else {
            return;
        };
        let ev = JoinEvent {
            guild_id: new_member.guild_id.get(),
            user_id: new_member.user.id.get(),
            is_bot: new_member.user.bot,
            at: Utc::now(),
        };

        let fut = async { rg.on_member_join(&ev).await };
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(JoinDisposition::RaidDetected { joins, raid_mode_activated, .. }) => {
                tracing::warn!(gid = ev.guild_id, joins, raid_mode_activated, "join spike handled");
            }
            Ok(_) => {}
            Err(_) => tracing::error!(gid = ev.guild_id, uid = ev.user_id, "panic in raidguard join handler"),
        }
    }
}

fn intents_from_settings(names: &[String]) -> GatewayIntents {
    let mut i = GatewayIntents::empty();
    for n in names {
        match n.as_str() {
            "GUILDS" => i |= GatewayIntents::GUILDS,
            "GUILD_MEMBERS" => i |= GatewayIntents::GUILD_MEMBERS,
            "GUILD_MESSAGES" => i |= GatewayIntents::GUILD_MESSAGES,
            "MESSAGE_CONTENT" => i |= GatewayIntents::MESSAGE_CONTENT,
            other => tracing::warn!(intent = other, "unknown or unused gateway intent in config"),
        }
    }
    if i.is_empty() {
        crate::default_gateway_intents()
    } else {
        i
    }
}

pub async fn run_bot(ctx: Arc<AppContext>) -> Result<()> {
    let token = &ctx.settings.discord.token;
    if token.is_empty() {
        anyhow::bail!("Brak tokenu Discord (TSS_DISCORD_TOKEN). Uzupełnij w .env.");
    }

    let intents = intents_from_settings(&ctx.settings.discord.intents);
    let handler = Handler { app: ctx.clone() };

    let mut client = serenity::Client::builder(token, intents)
        .event_handler(handler)
        .await?;

    tracing::info!("Discord client starting…");
    client.start().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_intent_list_falls_back_to_defaults() {
        assert_eq!(intents_from_settings(&[]), crate::default_gateway_intents());
        let only = intents_from_settings(&["GUILDS".into(), "MESSAGE_CONTENT".into()]);
        assert!(only.contains(GatewayIntents::MESSAGE_CONTENT));
        assert!(!only.contains(GatewayIntents::GUILD_MEMBERS));
    }
}
