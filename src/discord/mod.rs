// src/discord/mod.rs
//! Adapter bramki Discord: zdarzenia gateway → `Pipeline`.
//! Gildia = czat, użytkownik Discorda = użytkownik silnika.

mod platform;

pub use platform::DiscordPlatform;

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serenity::all::*;
use serenity::async_trait;

use crate::AppContext;
use crate::model::{JoinEvent, MessageEntity, MessageEvent, UserInfo};
use crate::pipeline::Pipeline;

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)\bhttps?://[^\s<>"']+"#).unwrap());

pub struct Handler {
    pub pipeline: Arc<Pipeline>,
    pub platform: Arc<DiscordPlatform>,
}

/// Discord nie ma encji jak Telegram: linki wyciągamy z treści, wzmianki z `mentions`.
fn entities_of(msg: &Message) -> Vec<MessageEntity> {
    let mut out: Vec<MessageEntity> = URL_RE
        .find_iter(&msg.content)
        .map(|m| MessageEntity::Url(m.as_str().to_string()))
        .collect();
    for e in &msg.embeds {
        if let Some(u) = &e.url {
            out.push(MessageEntity::TextLink(u.clone()));
        }
    }
    out.extend(
        msg.mentions
            .iter()
            .map(|u| MessageEntity::Mention(format!("@{}", u.name))),
    );
    out
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!("Logged in as {}", ready.user.name);

        // każda gildia, w której jest bot, to co najmniej grupa `known`
        let now = Utc::now();
        for g in ready.guilds {
            if let Err(e) = self
                .pipeline
                .groups
                .ensure_group(g.id.get() as i64, None, now)
                .await
            {
                tracing::warn!(error=?e, gid=%g.id.get(), "ensure_group on ready failed");
            }
        }
    }

    async fn guild_create(&self, _ctx: Context, guild: Guild, _is_new: Option<bool>) {
        if let Err(e) = self
            .pipeline
            .groups
            .ensure_group(guild.id.get() as i64, Some(&guild.name), Utc::now())
            .await
        {
            tracing::warn!(error=?e, gid=%guild.id.get(), "ensure_group on guild_create failed");
        }
    }

    async fn guild_member_addition(&self, _ctx: Context, member: Member) {
        let user = &member.user;
        let ev = JoinEvent {
            user_id: user.id.get(),
            chat_id: member.guild_id.get() as i64,
            chat_title: None,
            user_info: UserInfo {
                username: Some(user.name.clone()),
                first_name: user.global_name.clone(),
                last_name: None,
                is_bot: user.bot,
                has_profile_photo: Some(user.avatar.is_some()),
                // wiek konta liczony ze snowflake w silnika ryzyka
                account_created_at: None,
            },
            source: "discord_gateway".into(),
            timestamp: Utc::now(),
        };
        self.pipeline.on_join(ev).await;
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        let Some(gid) = msg.guild_id else { return };
        if msg.author.bot {
            return;
        }

        let message_id = msg.id.get() as i64;
        self.platform.remember_message(message_id, msg.channel_id.get());

        let ev = MessageEvent {
            user_id: msg.author.id.get(),
            chat_id: gid.get() as i64,
            chat_title: None,
            message_id,
            text: Some(msg.content.clone()).filter(|t| !t.is_empty()),
            caption: None,
            entities: entities_of(&msg),
            is_forwarded: false,
            is_reply: msg.referenced_message.is_some(),
            reply_to_user_id: msg.referenced_message.as_ref().map(|m| m.author.id.get()),
            timestamp: Utc::now(),
        };
        self.pipeline.on_message(ev).await;
    }
}

pub fn intents_from_settings(names: &[String]) -> GatewayIntents {
    let mut i = GatewayIntents::empty();
    for n in names {
        match n.as_str() {
            "GUILDS" => i |= GatewayIntents::GUILDS,
            "GUILD_MEMBERS" => i |= GatewayIntents::GUILD_MEMBERS,
            "GUILD_MESSAGES" => i |= GatewayIntents::GUILD_MESSAGES,
            "MESSAGE_CONTENT" => i |= GatewayIntents::MESSAGE_CONTENT,
            "GUILD_MODERATION" => i |= GatewayIntents::GUILD_MODERATION,
            other => tracing::warn!(intent = other, "unknown intent ignored"),
        }
    }
    i
}

pub async fn run_bot(ctx: Arc<AppContext>, platform: Arc<DiscordPlatform>) -> Result<()> {
    let token = &ctx.settings.discord.token;
    if token.is_empty() {
        anyhow::bail!("Brak tokenu Discord (TSS_DISCORD_TOKEN). Uzupełnij w .env.");
    }

    let intents = intents_from_settings(&ctx.settings.discord.intents);

    let handler = Handler {
        pipeline: ctx.pipeline.clone(),
        platform,
    };

    let mut client = serenity::Client::builder(token, intents)
        .event_handler(handler)
        .await?;

    tracing::info!("Discord client starting…");
    client.start().await?;
    Ok(())
}
