// src/platform.rs
//! Granica z klientem platformy komunikacyjnej. Rdzeń wysyła tylko te żądania;
//! implementacja (np. [`crate::discord::DiscordPlatform`]) decyduje, jak je wykonać.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::PlatformError;
use crate::model::{ChatId, UserId};

/// Wynik globalnego bana (po wszystkich zarządzanych grupach).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalBanOutcome {
    pub success: bool,
    pub groups: u32,
    pub skipped: bool,
    pub skip_reason: Option<String>,
}

/// Wynik sprawdzenia uprawnień w grupie. Błąd lookupu nie daje ochrony.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminLookup {
    pub is_admin: bool,
    pub status: Option<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait Platform: Send + Sync {
    async fn delete_message(&self, chat_id: ChatId, message_id: i64) -> Result<(), PlatformError>;

    async fn restrict_user(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        duration: Duration,
    ) -> Result<(), PlatformError>;

    async fn ban_user(&self, chat_id: ChatId, user_id: UserId) -> Result<(), PlatformError>;

    async fn ban_user_globally(
        &self,
        user_id: UserId,
        reason: &str,
    ) -> Result<GlobalBanOutcome, PlatformError>;

    /// Zwraca liczbę grup, w których zdjęto ograniczenie.
    async fn unrestrict_user_in_all_groups(
        &self,
        user_id: UserId,
        reason: &str,
    ) -> Result<u32, PlatformError>;

    async fn is_user_admin_or_creator_in_group(&self, chat_id: ChatId, user_id: UserId)
    -> AdminLookup;

    async fn get_chat_administrators(&self, chat_id: ChatId) -> Result<Vec<UserId>, PlatformError>;
}

/// Każde wywołanie wychodzące ma twardy limit czasu; timeout to zwykły błąd (nie flood-wait).
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, PlatformError>
where
    F: Future<Output = Result<T, PlatformError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(PlatformError::Timeout(limit)),
    }
}
