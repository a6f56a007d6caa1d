// src/model.rs
//! Encje współdzielone przez cały pipeline (user, group, join, blacklist, cluster)
//! oraz zdarzenia przychodzące z platformy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = u64;
pub type ChatId = i64;

/* ==============================
   User
   ============================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[default]
    Ok,
    Restricted,
    Banned,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Ok => "ok",
            UserStatus::Restricted => "restricted",
            UserStatus::Banned => "banned",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "restricted" => UserStatus::Restricted,
            "banned" => UserStatus::Banned,
            _ => UserStatus::Ok,
        }
    }
}

/// Poziom ryzyka – tylko eskaluje (CLEAN → LOW → MEDIUM → HIGH).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    #[default]
    Clean,
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_i16(&self) -> i16 {
        match self {
            RiskLevel::Clean => 0,
            RiskLevel::Low => 1,
            RiskLevel::Medium => 2,
            RiskLevel::High => 3,
        }
    }

    pub fn from_i16(v: i16) -> Self {
        match v {
            i16::MIN..=0 => RiskLevel::Clean,
            1 => RiskLevel::Low,
            2 => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub risk_score: i32,
    pub status: UserStatus,
    pub account_created_at: Option<DateTime<Utc>>,
    pub has_username: bool,
    pub has_profile_photo: bool,
    /// One-time factors (account age, username, photo) already scored.
    pub profile_captured: bool,
    pub is_observed: bool,
    pub risk_level: RiskLevel,
    pub last_decay_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn new(id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            risk_score: 0,
            status: UserStatus::Ok,
            account_created_at: None,
            has_username: false,
            has_profile_photo: false,
            profile_captured: false,
            is_observed: false,
            risk_level: RiskLevel::Clean,
            last_decay_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/* ==============================
   Group
   ============================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    #[default]
    Known,
    Managed,
    Disabled,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Known => "known",
            GroupStatus::Managed => "managed",
            GroupStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "managed" => GroupStatus::Managed,
            "disabled" => GroupStatus::Disabled,
            _ => GroupStatus::Known,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub id: ChatId,
    pub title: Option<String>,
    pub status: GroupStatus,
    pub silent_mode: bool,
    pub brand: Option<String>,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GroupRecord {
    pub fn is_managed(&self) -> bool {
        self.status == GroupStatus::Managed
    }
}

/* ==============================
   Join / Blacklist / Cluster
   ============================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRow {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub joined_at: DateTime<Utc>,
}

impl JoinRow {
    pub fn minute_bucket(&self) -> i64 {
        minute_bucket(self.joined_at)
    }
}

pub fn minute_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub user_id: UserId,
    /// None = automat.
    pub banned_by: Option<UserId>,
    pub banned_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClusterLevel {
    Observe = 1,
    Network = 2,
    Ban = 3,
}

impl ClusterLevel {
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }

    pub fn from_i16(v: i16) -> Self {
        match v {
            i16::MIN..=1 => ClusterLevel::Observe,
            2 => ClusterLevel::Network,
            _ => ClusterLevel::Ban,
        }
    }

    pub fn risk_level(&self) -> RiskLevel {
        match self {
            ClusterLevel::Observe => RiskLevel::Low,
            ClusterLevel::Network => RiskLevel::Medium,
            ClusterLevel::Ban => RiskLevel::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterSource {
    Batch,
    Realtime,
}

impl ClusterSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterSource::Batch => "batch",
            ClusterSource::Realtime => "realtime",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCluster {
    pub level: ClusterLevel,
    pub user_ids: Vec<UserId>,
    pub group_ids: Vec<ChatId>,
    pub banned: bool,
    pub reason: String,
    pub source: ClusterSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRecord {
    pub id: i64,
    pub level: ClusterLevel,
    pub created_at: DateTime<Utc>,
    pub user_ids: Vec<UserId>,
    pub group_ids: Vec<ChatId>,
    pub banned: bool,
    pub reason: String,
    pub source: ClusterSource,
}

/* ==============================
   Audit log (tabela actions)
   ============================== */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionLogEntry {
    pub at: DateTime<Utc>,
    pub chat_id: Option<ChatId>,
    pub user_id: UserId,
    pub action: String,
    pub severity: Option<String>,
    /// "success" | "skipped" | "failed"
    pub outcome: String,
    pub reason: Option<String>,
    pub detail: Option<String>,
    pub dry_run: bool,
}

/* ==============================
   Zdarzenia przychodzące
   ============================== */

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_bot: bool,
    /// None = platforma nie podała (traktujemy jak brak zdjęcia).
    pub has_profile_photo: Option<bool>,
    pub account_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinEvent {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub chat_title: Option<String>,
    pub user_info: UserInfo,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEntity {
    Url(String),
    TextLink(String),
    Mention(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub chat_title: Option<String>,
    pub message_id: i64,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub entities: Vec<MessageEntity>,
    pub is_forwarded: bool,
    pub is_reply: bool,
    pub reply_to_user_id: Option<UserId>,
    pub timestamp: DateTime<Utc>,
}

impl MessageEvent {
    /// Tekst albo podpis mediów.
    pub fn body(&self) -> &str {
        self.text
            .as_deref()
            .or(self.caption.as_deref())
            .unwrap_or("")
    }

    pub fn urls(&self) -> Vec<String> {
        self.entities
            .iter()
            .filter_map(|e| match e {
                MessageEntity::Url(u) | MessageEntity::TextLink(u) => Some(u.clone()),
                MessageEntity::Mention(_) => None,
            })
            .collect()
    }

    pub fn mentions(&self) -> Vec<String> {
        self.entities
            .iter()
            .filter_map(|e| match e {
                MessageEntity::Mention(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn minute_bucket_floors_to_minute() {
        let a = Utc.timestamp_opt(120, 0).unwrap();
        let b = Utc.timestamp_opt(179, 0).unwrap();
        let c = Utc.timestamp_opt(180, 0).unwrap();
        assert_eq!(minute_bucket(a), 2);
        assert_eq!(minute_bucket(a), minute_bucket(b));
        assert_eq!(minute_bucket(c), 3);
    }

    #[test]
    fn risk_level_orders_and_roundtrips() {
        assert!(RiskLevel::High > RiskLevel::Medium);
        assert!(RiskLevel::Low > RiskLevel::Clean);
        for l in [RiskLevel::Clean, RiskLevel::Low, RiskLevel::Medium, RiskLevel::High] {
            assert_eq!(RiskLevel::from_i16(l.as_i16()), l);
        }
    }

    #[test]
    fn message_body_prefers_text_over_caption() {
        let ev = MessageEvent {
            user_id: 1,
            chat_id: -1,
            chat_title: None,
            message_id: 5,
            text: None,
            caption: Some("photo caption".into()),
            entities: vec![
                MessageEntity::Url("https://a.example".into()),
                MessageEntity::Mention("@someone".into()),
            ],
            is_forwarded: false,
            is_reply: false,
            reply_to_user_id: None,
            timestamp: Utc::now(),
        };
        assert_eq!(ev.body(), "photo caption");
        assert_eq!(ev.urls(), vec!["https://a.example".to_string()]);
        assert_eq!(ev.mentions(), vec!["@someone".to_string()]);
    }
}
