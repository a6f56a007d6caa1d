// src/discord/platform.rs
//! `Platform` na Discordzie: czat = gildia, restrict = timeout członka,
//! ban globalny = ban w każdej zarządzanej gildii.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use moka::sync::Cache;
use serenity::all::{ChannelId, EditMember, GuildId, Http, MessageId, Permissions, RoleId, UserId as DUserId};
use tracing::{debug, warn};

use crate::db::Store;
use crate::error::PlatformError;
use crate::model::{ChatId, UserId};
use crate::platform::{AdminLookup, GlobalBanOutcome, Platform};

/// Discord ogranicza timeout do 28 dni.
const MAX_TIMEOUT: Duration = Duration::from_secs(28 * 24 * 3600);

pub struct DiscordPlatform {
    http: Arc<Http>,
    store: Arc<dyn Store>,
    /// message_id → channel_id (Discord usuwa wiadomości per kanał)
    channels: Cache<i64, u64>,
}

fn api(e: serenity::Error) -> PlatformError {
    PlatformError::classify(&e.to_string())
}

fn guild(chat_id: ChatId) -> GuildId {
    GuildId::new(chat_id as u64)
}

impl DiscordPlatform {
    pub fn new(http: Arc<Http>, store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            http,
            store,
            channels: Cache::builder()
                .time_to_live(Duration::from_secs(24 * 3600))
                .max_capacity(200_000)
                .build(),
        })
    }

    pub fn remember_message(&self, message_id: i64, channel_id: u64) {
        self.channels.insert(message_id, channel_id);
    }

    async fn managed_guilds(&self) -> Result<Vec<ChatId>, PlatformError> {
        self.store
            .managed_group_ids()
            .await
            .map_err(|e| PlatformError::Api(format!("store: {e}")))
    }

    async fn admin_roles(&self, chat_id: ChatId) -> Result<(DUserId, HashSet<RoleId>), PlatformError> {
        let pg = guild(chat_id)
            .to_partial_guild(&*self.http)
            .await
            .map_err(api)?;
        let roles = pg
            .roles
            .values()
            .filter(|r| {
                r.permissions.contains(Permissions::ADMINISTRATOR)
                    || r.permissions.contains(Permissions::BAN_MEMBERS)
            })
            .map(|r| r.id)
            .collect();
        Ok((pg.owner_id, roles))
    }
}

#[async_trait]
impl Platform for DiscordPlatform {
    async fn delete_message(&self, _chat_id: ChatId, message_id: i64) -> Result<(), PlatformError> {
        let Some(channel) = self.channels.get(&message_id) else {
            return Err(PlatformError::Api(format!("unknown channel for message {message_id}")));
        };
        ChannelId::new(channel)
            .delete_message(&*self.http, MessageId::new(message_id as u64))
            .await
            .map_err(api)
    }

    async fn restrict_user(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        duration: Duration,
    ) -> Result<(), PlatformError> {
        let d = chrono::Duration::from_std(duration.min(MAX_TIMEOUT))
            .map_err(|e| PlatformError::Api(e.to_string()))?;
        let until = (Utc::now() + d).to_rfc3339();
        guild(chat_id)
            .edit_member(
                &*self.http,
                DUserId::new(user_id),
                EditMember::new().disable_communication_until(until),
            )
            .await
            .map(|_| ())
            .map_err(api)
    }

    async fn ban_user(&self, chat_id: ChatId, user_id: UserId) -> Result<(), PlatformError> {
        guild(chat_id)
            .ban_with_reason(&*self.http, DUserId::new(user_id), 0, "tigris-sentinel")
            .await
            .map_err(api)
    }

    async fn ban_user_globally(
        &self,
        user_id: UserId,
        reason: &str,
    ) -> Result<GlobalBanOutcome, PlatformError> {
        let guilds = self.managed_guilds().await?;
        if guilds.is_empty() {
            return Ok(GlobalBanOutcome {
                skipped: true,
                skip_reason: Some("no_managed_groups".into()),
                ..Default::default()
            });
        }

        let mut ok = 0u32;
        let mut last_err = None;
        for chat in guilds {
            match guild(chat)
                .ban_with_reason(&*self.http, DUserId::new(user_id), 0, reason)
                .await
            {
                Ok(()) => ok += 1,
                Err(e) => {
                    let e = api(e);
                    if e.is_flood_wait() {
                        return Err(e);
                    }
                    warn!(chat_id = chat, user_id, error = %e, "ban in guild failed");
                    last_err = Some(e);
                }
            }
        }

        match (ok, last_err) {
            (0, Some(e)) => Err(e),
            (groups, _) => Ok(GlobalBanOutcome {
                success: true,
                groups,
                ..Default::default()
            }),
        }
    }

    async fn unrestrict_user_in_all_groups(
        &self,
        user_id: UserId,
        reason: &str,
    ) -> Result<u32, PlatformError> {
        let mut n = 0;
        for chat in self.managed_guilds().await? {
            let res = guild(chat)
                .edit_member(
                    &*self.http,
                    DUserId::new(user_id),
                    EditMember::new().enable_communication().audit_log_reason(reason),
                )
                .await;
            match res {
                Ok(_) => n += 1,
                Err(e) => {
                    let e = api(e);
                    if e.is_flood_wait() {
                        return Err(e);
                    }
                    // zwykle: użytkownika nie ma w tej gildii
                    debug!(chat_id = chat, user_id, error = %e, "unrestrict skipped");
                }
            }
        }
        Ok(n)
    }

    async fn is_user_admin_or_creator_in_group(&self, chat_id: ChatId, user_id: UserId) -> AdminLookup {
        let (owner, roles) = match self.admin_roles(chat_id).await {
            Ok(v) => v,
            Err(e) => {
                return AdminLookup {
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };
        if owner.get() == user_id {
            return AdminLookup {
                is_admin: true,
                status: Some("creator".into()),
                error: None,
            };
        }
        match guild(chat_id).member(&*self.http, DUserId::new(user_id)).await {
            Ok(m) => {
                let is_admin = m.roles.iter().any(|r| roles.contains(r));
                AdminLookup {
                    is_admin,
                    status: Some(if is_admin { "administrator" } else { "member" }.into()),
                    error: None,
                }
            }
            Err(e) => AdminLookup {
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }

    async fn get_chat_administrators(&self, chat_id: ChatId) -> Result<Vec<UserId>, PlatformError> {
        let (owner, roles) = self.admin_roles(chat_id).await?;
        let members = guild(chat_id)
            .members(&*self.http, Some(1000), None)
            .await
            .map_err(api)?;
        let mut out: Vec<UserId> = members
            .iter()
            .filter(|m| m.roles.iter().any(|r| roles.contains(r)))
            .map(|m| m.user.id.get())
            .collect();
        if !out.contains(&owner.get()) {
            out.push(owner.get());
        }
        Ok(out)
    }
}
