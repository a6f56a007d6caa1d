// tests/common/mod.rs
//! Wspólny harness: MemoryStore + platforma nagrywająca wywołania.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tigris_sentinel::AppContext;
use tigris_sentinel::config::Settings;
use tigris_sentinel::db::{MemoryStore, Store};
use tigris_sentinel::error::PlatformError;
use tigris_sentinel::model::{
    ChatId, GroupStatus, JoinEvent, MessageEntity, MessageEvent, UserId, UserInfo,
};
use tigris_sentinel::platform::{AdminLookup, GlobalBanOutcome, Platform};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Delete(ChatId, i64),
    Restrict(ChatId, UserId),
    Ban(ChatId, UserId),
    GlobalBan(UserId),
    Unrestrict(UserId),
}

#[derive(Default)]
pub struct FakePlatform {
    calls: Mutex<Vec<Call>>,
    admins: Mutex<HashSet<(ChatId, UserId)>>,
    flood_wait: Mutex<Option<Duration>>,
}

impl FakePlatform {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn make_admin(&self, chat_id: ChatId, user_id: UserId) {
        self.admins.lock().unwrap().insert((chat_id, user_id));
    }

    /// Następne wywołanie odpowie flood-wait.
    pub fn flood_next(&self, retry_after: Duration) {
        *self.flood_wait.lock().unwrap() = Some(retry_after);
    }

    fn record(&self, call: Call) -> Result<(), PlatformError> {
        if let Some(retry_after) = self.flood_wait.lock().unwrap().take() {
            return Err(PlatformError::FloodWait { retry_after });
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn delete_message(&self, chat_id: ChatId, message_id: i64) -> Result<(), PlatformError> {
        self.record(Call::Delete(chat_id, message_id))
    }

    async fn restrict_user(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        _duration: Duration,
    ) -> Result<(), PlatformError> {
        self.record(Call::Restrict(chat_id, user_id))
    }

    async fn ban_user(&self, chat_id: ChatId, user_id: UserId) -> Result<(), PlatformError> {
        self.record(Call::Ban(chat_id, user_id))
    }

    async fn ban_user_globally(
        &self,
        user_id: UserId,
        _reason: &str,
    ) -> Result<GlobalBanOutcome, PlatformError> {
        self.record(Call::GlobalBan(user_id))?;
        Ok(GlobalBanOutcome {
            success: true,
            groups: 1,
            ..Default::default()
        })
    }

    async fn unrestrict_user_in_all_groups(
        &self,
        user_id: UserId,
        _reason: &str,
    ) -> Result<u32, PlatformError> {
        self.record(Call::Unrestrict(user_id))?;
        Ok(1)
    }

    async fn is_user_admin_or_creator_in_group(&self, chat_id: ChatId, user_id: UserId) -> AdminLookup {
        let is_admin = self.admins.lock().unwrap().contains(&(chat_id, user_id));
        AdminLookup {
            is_admin,
            status: Some(if is_admin { "administrator" } else { "member" }.into()),
            error: None,
        }
    }

    async fn get_chat_administrators(&self, chat_id: ChatId) -> Result<Vec<UserId>, PlatformError> {
        Ok(self
            .admins
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == chat_id)
            .map(|(_, u)| *u)
            .collect())
    }
}

pub struct Harness {
    pub ctx: Arc<AppContext>,
    pub store: Arc<MemoryStore>,
    pub platform: Arc<FakePlatform>,
}

pub fn settings() -> Settings {
    let mut s = Settings::default();
    s.database.url = "memory://".into();
    s
}

pub fn harness(settings: Settings) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let platform = Arc::new(FakePlatform::default());
    let ctx = AppContext::assemble(settings.sanitize(), store.clone(), platform.clone());
    Harness {
        ctx,
        store,
        platform,
    }
}

impl Harness {
    pub async fn manage(&self, chats: impl IntoIterator<Item = ChatId>) {
        for chat in chats {
            self.store
                .upsert_group_seen(chat, Some("test group"), Utc::now())
                .await
                .unwrap();
            self.store
                .set_group_status(chat, GroupStatus::Managed)
                .await
                .unwrap();
        }
    }
}

/// Konto "zwykłe": nazwa i zdjęcie są, wiek ze snowflake (stare).
pub fn regular_user() -> UserInfo {
    UserInfo {
        username: Some("someone".into()),
        first_name: Some("Some".into()),
        last_name: None,
        is_bot: false,
        has_profile_photo: Some(true),
        account_created_at: None,
    }
}

/// Świeże konto bez nazwy i zdjęcia: 20 + 10 + 10 przy pierwszym joinie.
pub fn fresh_user(now: DateTime<Utc>) -> UserInfo {
    UserInfo {
        username: None,
        first_name: Some("X".into()),
        last_name: None,
        is_bot: false,
        has_profile_photo: Some(false),
        account_created_at: Some(now - chrono::Duration::days(1)),
    }
}

pub fn join(user_id: UserId, chat_id: ChatId, info: UserInfo, at: DateTime<Utc>) -> JoinEvent {
    JoinEvent {
        user_id,
        chat_id,
        chat_title: None,
        user_info: info,
        source: "test".into(),
        timestamp: at,
    }
}

pub fn message(user_id: UserId, chat_id: ChatId, message_id: i64, text: &str, at: DateTime<Utc>) -> MessageEvent {
    MessageEvent {
        user_id,
        chat_id,
        chat_title: None,
        message_id,
        text: Some(text.to_string()),
        caption: None,
        entities: Vec::<MessageEntity>::new(),
        is_forwarded: false,
        is_reply: false,
        reply_to_user_id: None,
        timestamp: at,
    }
}
