// src/raidguard/commands.rs

use anyhow::Result;
use chrono::{DateTime, Utc};
use serenity::all::*;

use super::model::{
    MuteRecord, RaidModeAction, RaidModeState, RaidModeTrigger, RaidScoreState, Sensitivity,
    ServerRaidConfig,
};
use super::store::{ConfigStore, IncidentSummary};
use crate::AppContext;

const TARGET: &str = "tigris_raidguard::commands";

pub struct RaidCommands;

impl RaidCommands {
    pub async fn register_commands(ctx: &Context, gid: GuildId) -> Result<()> {
        // /antiraid-setup
        gid.create_command(&ctx.http,
            CreateCommand::new("antiraid-setup")
                .description("Konfiguracja RaidGuarda (czułość, role, kanał alertów).")
                .default_member_permissions(Permissions::ADMINISTRATOR)
                .add_option(CreateCommandOption::new(
                        CommandOptionType::Integer, "sensitivity", "0=off, 1=niska, 2=średnia, 3=wysoka"
                    ).required(true).min_int_value(0).max_int_value(3))
                .add_option(CreateCommandOption::new(
                        CommandOptionType::Role, "mod_role", "Rola moderatorów (ping przy każdym alercie)"
                    ))
                .add_option(CreateCommandOption::new(
                        CommandOptionType::Role, "manager_role", "Rola managerów (ping przy poważnych alertach)"
                    ))
                .add_option(CreateCommandOption::new(
                        CommandOptionType::Role, "staff_role", "Rola staffu (ping przy każdym alercie, opcjonalnie)"
                    ))
                .add_option(CreateCommandOption::new(
                        CommandOptionType::Channel, "alert_channel", "Kanał lub wątek na raporty"
                    ))
                .add_option(CreateCommandOption::new(
                        CommandOptionType::String, "raid_action", "Akcja trybu raid wobec nowych członków"
                    ).add_string_choice("mute (1h)", "mute")
                     .add_string_choice("kick", "kick")
                     .add_string_choice("ban", "ban"))
                .add_option(CreateCommandOption::new(
                        CommandOptionType::Boolean, "auto_raid_mode", "Fala wejść automatycznie włącza tryb raid"
                    ))
        ).await?;

        // /antiraid-mode
        gid.create_command(&ctx.http,
            CreateCommand::new("antiraid-mode")
                .description("Ręczne włączenie/wyłączenie trybu raid (10 minut).")
                .default_member_permissions(Permissions::MANAGE_GUILD)
                .add_option(CreateCommandOption::new(
                        CommandOptionType::String, "state", "on / off"
                    ).required(true)
                     .add_string_choice("on", "on")
                     .add_string_choice("off", "off"))
        ).await?;

        // /antiraid-status
        gid.create_command(&ctx.http,
            CreateCommand::new("antiraid-status")
                .description("Stan RaidGuarda na serwerze lub dla użytkownika.")
                .default_member_permissions(Permissions::MODERATE_MEMBERS)
                .add_option(CreateCommandOption::new(
                        CommandOptionType::User, "user", "Użytkownik (opcjonalnie)"
                    ))
        ).await?;

        // /antiraid-unmute
        gid.create_command(&ctx.http,
            CreateCommand::new("antiraid-unmute")
                .description("Zdejmij wyciszenie nałożone przez RaidGuarda.")
                .default_member_permissions(Permissions::MODERATE_MEMBERS)
                .add_option(CreateCommandOption::new(
                        CommandOptionType::User, "user", "Kogo odciszyć"
                    ).required(true))
        ).await?;

        Ok(())
    }

    pub async fn on_interaction(ctx: &Context, app: &AppContext, interaction: Interaction) {
        let Some(cmd) = interaction.command() else { return; };
        let res = match cmd.data.name.as_str() {
            "antiraid-setup"  => handle_setup(ctx, app, &cmd).await,
            "antiraid-status" => handle_status(ctx, app, &cmd).await,
            "antiraid-unmute" => handle_unmute(ctx, app, &cmd).await,
            "antiraid-mode"   => handle_mode(ctx, app, &cmd).await,
            _ => return,
        };
        if let Err(e) = res {
            tracing::warn!(target: TARGET, ?e, cmd = %cmd.data.name, "antiraid command failed");
        }
    }
}

/* ========================= Handlers ========================= */

async fn handle_setup(ctx: &Context, app: &AppContext, cmd: &CommandInteraction) -> Result<()> {
    defer(ctx, cmd).await?;
    let Some(gid) = cmd.guild_id else { return edit(ctx, cmd, "Użyj na serwerze.").await; };
    if !caller_has(cmd, Permissions::ADMINISTRATOR) {
        return edit(ctx, cmd, "⛔ Brak uprawnień.").await;
    }
    let Some(rg) = app.raidguard() else { return edit(ctx, cmd, "RaidGuard jeszcze startuje, spróbuj za chwilę.").await; };

    let mut args = SetupArgs::default();
    for o in &cmd.data.options {
        match (&o.name[..], &o.value) {
            ("sensitivity",    CommandDataOptionValue::Integer(v)) => args.level = *v,
            ("mod_role",       CommandDataOptionValue::Role(r))    => args.mod_role = Some(r.get()),
            ("manager_role",   CommandDataOptionValue::Role(r))    => args.manager_role = Some(r.get()),
            ("staff_role",     CommandDataOptionValue::Role(r))    => args.staff_role = Some(r.get()),
            ("alert_channel",  CommandDataOptionValue::Channel(c)) => args.alert_channel = Some(c.get()),
            ("raid_action",    CommandDataOptionValue::String(v))  => args.raid_action = RaidModeAction::try_from(v.as_str()).ok(),
            ("auto_raid_mode", CommandDataOptionValue::Boolean(b)) => args.auto_raid_mode = Some(*b),
            _ => {}
        }
    }

    // błąd odczytu nie może nadpisać zapisanej konfiguracji
    let cfg = match run_setup(rg.store().as_ref(), gid.get(), &args).await {
        Ok(SetupOutcome::Saved(c)) => c,
        Ok(SetupOutcome::Rejected(msg)) => return edit(ctx, cmd, &msg).await,
        Err(e) => {
            tracing::warn!(target: TARGET, error = ?e, gid = gid.get(), "antiraid setup aborted");
            return edit(ctx, cmd, "⚠️ Nie udało się odczytać obecnej konfiguracji, nic nie zapisano. Spróbuj ponownie.").await;
        }
    };

    tracing::info!(target: TARGET, gid = gid.get(), by = cmd.user.id.get(), level = cfg.sensitivity.level(), "antiraid configured");
    edit(ctx, cmd, &format!("✅ Zapisano.\n{}", config_text(&cfg))).await
}

async fn handle_mode(ctx: &Context, app: &AppContext, cmd: &CommandInteraction) -> Result<()> {
    defer(ctx, cmd).await?;
    let Some(gid) = cmd.guild_id else { return edit(ctx, cmd, "Użyj na serwerze.").await; };
    if !caller_has(cmd, Permissions::MANAGE_GUILD) {
        return edit(ctx, cmd, "⛔ Brak uprawnień.").await;
    }
    let Some(rg) = app.raidguard() else { return edit(ctx, cmd, "RaidGuard jeszcze startuje, spróbuj za chwilę.").await; };

    let on = cmd.data.options.iter().any(|o| matches!((&o.name[..], &o.value), ("state", CommandDataOptionValue::String(v)) if v == "on"));
    let now = Utc::now();

    let txt = if on {
        let cfg = rg.store().get(gid.get()).await?;
        if !cfg.enabled() {
            "RaidGuard jest wyłączony na tym serwerze. Najpierw użyj /antiraid-setup.".to_string()
        } else {
            match rg.activate_raid_mode(&cfg, RaidModeTrigger::Manual, now).await {
                Some(mode) => format!("🚨 {}", raid_mode_line(&mode)),
                None => "Tryb raid jest już aktywny.".to_string(),
            }
        }
    } else if rg.end_raid_mode(gid.get(), now).await {
        "✅ Tryb raid wyłączony.".to_string()
    } else {
        "Tryb raid nie był aktywny.".to_string()
    };

    tracing::info!(target: TARGET, gid = gid.get(), by = cmd.user.id.get(), on, "antiraid raid mode toggled");
    edit(ctx, cmd, &txt).await
}

async fn handle_status(ctx: &Context, app: &AppContext, cmd: &CommandInteraction) -> Result<()> {
    defer(ctx, cmd).await?;
    let Some(gid) = cmd.guild_id else { return edit(ctx, cmd, "Użyj na serwerze.").await; };
    let Some(rg) = app.raidguard() else { return edit(ctx, cmd, "RaidGuard jeszcze startuje, spróbuj za chwilę.").await; };

    let user = cmd.data.options.iter().find_map(|o| match (&o.name[..], &o.value) {
        ("user", CommandDataOptionValue::User(u)) => Some(u.get()),
        _ => None,
    });

    let cfg = rg.config_for(gid.get()).await;
    let mut out = config_text(&cfg);
    if let Some(mode) = rg.raid_mode(gid.get(), Utc::now()) {
        out.push('\n');
        out.push_str(&raid_mode_line(&mode));
    }

    if let Some(uid) = user {
        let state = rg.score_of(uid).await.unwrap_or_default();
        out.push_str("\n\n");
        out.push_str(&user_text(uid, &state, rg.mute_of(uid).as_ref(), &cfg, Utc::now()));
    } else {
        match rg.store().recent_incidents(gid.get(), 5).await {
            Ok(list) => {
                out.push_str("\n\n");
                out.push_str(&incidents_text(&list));
            }
            Err(e) => tracing::warn!(target: TARGET, error = %e, "recent incidents lookup failed"),
        }
    }
    edit(ctx, cmd, &out).await
}

async fn handle_unmute(ctx: &Context, app: &AppContext, cmd: &CommandInteraction) -> Result<()> {
    defer(ctx, cmd).await?;
    let Some(gid) = cmd.guild_id else { return edit(ctx, cmd, "Użyj na serwerze.").await; };
    if !caller_has(cmd, Permissions::MODERATE_MEMBERS) {
        return edit(ctx, cmd, "⛔ Brak uprawnień.").await;
    }
    let Some(rg) = app.raidguard() else { return edit(ctx, cmd, "RaidGuard jeszcze startuje, spróbuj za chwilę.").await; };

    let Some(uid) = cmd.data.options.iter().find_map(|o| match (&o.name[..], &o.value) {
        ("user", CommandDataOptionValue::User(u)) => Some(u.get()),
        _ => None,
    }) else {
        return edit(ctx, cmd, "Musisz wskazać użytkownika.").await;
    };

    let reason = format!("RaidGuard: ręczne odciszenie przez {}", cmd.user.id.get());
    let failed = rg.unmute(uid, gid.get(), &reason).await;
    tracing::info!(target: TARGET, gid = gid.get(), uid, by = cmd.user.id.get(), failed, "antiraid manual unmute");

    let txt = if failed == 0 {
        format!("✅ Odciszono <@{uid}>.")
    } else {
        format!("⚠️ Odciszono <@{uid}>, ale na {failed} serwerze/serwerach nie udało się zdjąć timeoutu.")
    };
    edit(ctx, cmd, &txt).await
}

/* ========================= Helpers ========================= */

fn caller_has(cmd: &CommandInteraction, perm: Permissions) -> bool {
    cmd.member
        .as_ref()
        .and_then(|m| m.permissions)
        .is_some_and(|p| p.administrator() || p.contains(perm))
}

/// Opcje `/antiraid-setup`. `None` = bez zmian.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupArgs {
    pub level: i64,
    pub mod_role: Option<u64>,
    pub manager_role: Option<u64>,
    pub staff_role: Option<u64>,
    pub alert_channel: Option<u64>,
    pub raid_action: Option<RaidModeAction>,
    pub auto_raid_mode: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupOutcome {
    Saved(ServerRaidConfig),
    /// Odrzucone opcje; komunikat dla użytkownika.
    Rejected(String),
}

/// Odczyt → scalenie → zapis. Błąd odczytu przerywa bez zapisu.
pub async fn run_setup(store: &dyn ConfigStore, guild_id: u64, args: &SetupArgs) -> Result<SetupOutcome> {
    let current = store.get(guild_id).await?;
    match apply_setup(current, args) {
        Ok(cfg) => {
            store.put(&cfg).await?;
            Ok(SetupOutcome::Saved(cfg))
        }
        Err(msg) => Ok(SetupOutcome::Rejected(msg)),
    }
}

/// Nowa konfiguracja z opcji komendy. Włączenie wymaga roli moderatorów
/// (podanej teraz albo już zapisanej).
pub fn apply_setup(mut cfg: ServerRaidConfig, args: &SetupArgs) -> Result<ServerRaidConfig, String> {
    let level = u8::try_from(args.level).map_err(|_| "Czułość musi być w zakresie 0–3.".to_string())?;
    cfg.sensitivity = Sensitivity::try_from(level).map_err(|_| "Czułość musi być w zakresie 0–3.".to_string())?;
    if args.mod_role.is_some() {
        cfg.mod_role_id = args.mod_role;
    }
    if args.manager_role.is_some() {
        cfg.manager_role_id = args.manager_role;
    }
    if args.staff_role.is_some() {
        cfg.staff_role_id = args.staff_role;
    }
    if args.alert_channel.is_some() {
        cfg.alert_channel_id = args.alert_channel;
    }
    if let Some(a) = args.raid_action {
        cfg.raid_mode_action = a;
    }
    if let Some(auto) = args.auto_raid_mode {
        cfg.auto_raid_mode = auto;
    }
    if cfg.enabled() && cfg.mod_role_id.is_none() {
        return Err("Aby włączyć RaidGuarda, podaj rolę moderatorów (mod_role).".into());
    }
    Ok(cfg)
}

pub fn config_text(cfg: &ServerRaidConfig) -> String {
    let role = |r: Option<u64>| r.map(|id| format!("<@&{id}>")).unwrap_or_else(|| "—".into());
    let mut s = format!(
        "**RaidGuard:** {}\n**Czułość:** {} ({})",
        if cfg.enabled() { "włączony" } else { "wyłączony" },
        cfg.sensitivity.label(),
        cfg.sensitivity.level(),
    );
    if let Some(th) = cfg.sensitivity.thresholds() {
        s.push_str(&format!("\n**Progi:** AI {} • mute {}", th.ai, th.mute));
    }
    s.push_str(&format!(
        "\n**Moderatorzy:** {}\n**Staff:** {}\n**Managerowie:** {}\n**Alerty:** {}",
        role(cfg.mod_role_id),
        role(cfg.staff_role_id),
        role(cfg.manager_role_id),
        cfg.alert_channel_id.map(|c| format!("<#{c}>")).unwrap_or_else(|| "—".into()),
    ));
    s.push_str(&format!(
        "\n**Tryb raid:** {} • akcja: {}",
        if cfg.auto_raid_mode { "automatyczny" } else { "tylko ręczny" },
        cfg.raid_mode_action.as_str(),
    ));
    s
}

fn raid_mode_line(mode: &RaidModeState) -> String {
    format!(
        "**Tryb raid aktywny** do <t:{}:R> • akcja: {}",
        mode.expires_at.timestamp(),
        mode.action.as_str()
    )
}

pub fn user_text(
    uid: u64,
    state: &RaidScoreState,
    mute: Option<&MuteRecord>,
    cfg: &ServerRaidConfig,
    now: DateTime<Utc>,
) -> String {
    let threshold = cfg
        .sensitivity
        .thresholds()
        .map(|t| t.mute.to_string())
        .unwrap_or_else(|| "—".into());
    let mut s = format!(
        "**Użytkownik:** <@{uid}>\n**Wynik:** {}/{}\n**Sprawdzenia AI:** {}",
        state.score, threshold, state.ai_checks_performed
    );
    if state.in_cooldown(now) {
        s.push_str("\n**Cooldown:** aktywny");
    }
    if let Some(m) = mute {
        s.push_str(&format!("\n**Odciszenie:** <t:{}:R>", m.unmute_at.timestamp()));
    }
    s
}

fn incidents_text(list: &[IncidentSummary]) -> String {
    if list.is_empty() {
        return "Brak incydentów.".into();
    }
    let mut s = String::from("**Ostatnie incydenty:**");
    for i in list {
        s.push_str(&format!(
            "\n• <@{}> – wynik {}, {} min, <t:{}:R>",
            i.user_id,
            i.score,
            i.duration_minutes,
            i.created_at.timestamp()
        ));
    }
    s
}

async fn defer(ctx: &Context, cmd: &CommandInteraction) -> Result<()> {
    cmd.create_response(
        &ctx.http,
        CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new().ephemeral(true))
    ).await?;
    Ok(())
}

async fn edit(ctx: &Context, cmd: &CommandInteraction, msg: &str) -> Result<()> {
    cmd.edit_response(&ctx.http, EditInteractionResponse::new().content(msg)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raidguard::error::StoreError;
    use serenity::async_trait;
    use std::sync::Mutex;

    /// Magazyn, którego odczyt może zawodzić; zapisy są liczone.
    #[derive(Default)]
    struct FlakyStore {
        fail_get: bool,
        current: Option<ServerRaidConfig>,
        puts: Mutex<Vec<ServerRaidConfig>>,
    }

    #[async_trait]
    impl ConfigStore for FlakyStore {
        async fn get(&self, guild_id: u64) -> Result<ServerRaidConfig, StoreError> {
            if self.fail_get {
                let bad = serde_json::from_str::<ServerRaidConfig>("{").unwrap_err();
                return Err(StoreError::Json(bad));
            }
            Ok(self.current.clone().unwrap_or_else(|| ServerRaidConfig::disabled(guild_id)))
        }

        async fn put(&self, cfg: &ServerRaidConfig) -> Result<(), StoreError> {
            self.puts.lock().unwrap().push(cfg.clone());
            Ok(())
        }
    }

    fn args(level: i64) -> SetupArgs {
        SetupArgs { level, ..Default::default() }
    }

    fn configured() -> ServerRaidConfig {
        ServerRaidConfig {
            guild_id: 1,
            sensitivity: Sensitivity::Low,
            mod_role_id: Some(10),
            manager_role_id: Some(20),
            alert_channel_id: Some(30),
            ..Default::default()
        }
    }

    #[test]
    fn setup_rejects_out_of_range_level() {
        let base = ServerRaidConfig::disabled(1);
        assert!(apply_setup(base.clone(), &args(4)).is_err());
        assert!(apply_setup(base, &args(-1)).is_err());
    }

    #[test]
    fn setup_keeps_unspecified_fields() {
        let a = SetupArgs { level: 3, manager_role: Some(21), ..Default::default() };
        let cfg = apply_setup(configured(), &a).unwrap();
        assert_eq!(cfg.sensitivity, Sensitivity::High);
        assert_eq!(cfg.mod_role_id, Some(10));
        assert_eq!(cfg.manager_role_id, Some(21));
        assert_eq!(cfg.alert_channel_id, Some(30));
        assert!(cfg.auto_raid_mode);

        let off = apply_setup(cfg, &args(0)).unwrap();
        assert!(!off.enabled());
    }

    #[test]
    fn enabling_requires_moderator_role() {
        let fresh = ServerRaidConfig::disabled(1);
        assert!(apply_setup(fresh.clone(), &args(2)).is_err());
        // wyłączenie bez roli jest OK
        assert!(apply_setup(fresh.clone(), &args(0)).is_ok());

        let a = SetupArgs { level: 2, mod_role: Some(10), staff_role: Some(40), ..Default::default() };
        let cfg = apply_setup(fresh, &a).unwrap();
        assert_eq!(cfg.staff_role_id, Some(40));
        // rola zapisana wcześniej wystarcza
        assert!(apply_setup(cfg, &args(3)).is_ok());
    }

    #[test]
    fn setup_sets_raid_mode_options() {
        let a = SetupArgs {
            level: 1,
            raid_action: Some(RaidModeAction::Ban),
            auto_raid_mode: Some(false),
            ..Default::default()
        };
        let cfg = apply_setup(configured(), &a).unwrap();
        assert_eq!(cfg.raid_mode_action, RaidModeAction::Ban);
        assert!(!cfg.auto_raid_mode);
        assert!(config_text(&cfg).contains("tylko ręczny • akcja: ban"));
    }

    #[tokio::test]
    async fn setup_does_not_overwrite_config_when_read_fails() {
        let store = FlakyStore { fail_get: true, ..Default::default() };
        let a = SetupArgs { level: 2, mod_role: Some(10), ..Default::default() };
        assert!(run_setup(&store, 1, &a).await.is_err());
        assert!(store.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn setup_merges_with_stored_config() {
        let store = FlakyStore { current: Some(configured()), ..Default::default() };
        let out = run_setup(&store, 1, &args(2)).await.unwrap();
        let SetupOutcome::Saved(cfg) = out else { panic!("expected save, got {out:?}") };
        assert_eq!(cfg.mod_role_id, Some(10));
        assert_eq!(cfg.alert_channel_id, Some(30));
        assert_eq!(*store.puts.lock().unwrap(), vec![cfg]);

        let store = FlakyStore::default();
        let out = run_setup(&store, 1, &args(1)).await.unwrap();
        assert!(matches!(out, SetupOutcome::Rejected(_)));
        assert!(store.puts.lock().unwrap().is_empty());
    }

    #[test]
    fn status_text_shows_thresholds_and_mute() {
        let cfg = ServerRaidConfig {
            guild_id: 1,
            sensitivity: Sensitivity::Medium,
            staff_role_id: Some(44),
            ..Default::default()
        };
        let txt = config_text(&cfg);
        assert!(txt.contains("AI 10 • mute 15"));
        assert!(txt.contains("**Staff:** <@&44>"));

        let now = Utc::now();
        let st = RaidScoreState { score: 7, last_alert_at: Some(now), ai_checks_performed: 1, reset_generation: 0 };
        let mute = MuteRecord { user_id: 5, unmute_at: now, guild_ids: [1].into() };
        let u = user_text(5, &st, Some(&mute), &cfg, now);
        assert!(u.contains("7/15"));
        assert!(u.contains("Cooldown"));
        assert!(u.contains("Odciszenie"));
    }
}
