// src/permissions.rs
//! Rejestr zaufanych aktorów: globalni admini + członkowie zespołu.
//! Każdy komponent pytający "czy wolno tego użytkownika ruszyć" idzie przez [`Trust`].

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::TrustConfig;
use crate::model::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    Owner,
    Operator,
    Moderator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub user_id: UserId,
    pub role: TeamRole,
    #[serde(default)]
    pub name: Option<String>,
}

/// Dlaczego użytkownik jest wyłączony z oceny i akcji.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exemption {
    GlobalAdmin,
    Team(TeamRole),
}

impl Exemption {
    pub fn reason(&self) -> &'static str {
        match self {
            Exemption::GlobalAdmin => "global_admin",
            Exemption::Team(_) => "team_member",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Trust {
    admins: HashSet<UserId>,
    team: HashMap<UserId, TeamMember>,
}

impl Trust {
    pub fn new(admins: impl IntoIterator<Item = UserId>, team: Vec<TeamMember>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
            team: team.into_iter().map(|m| (m.user_id, m)).collect(),
        }
    }

    pub fn from_config(cfg: &TrustConfig) -> Self {
        Self::new(cfg.admin_ids.iter().copied(), cfg.team.clone())
    }

    pub fn is_global_admin(&self, user_id: UserId) -> bool {
        self.admins.contains(&user_id)
    }

    pub fn team_member(&self, user_id: UserId) -> Option<&TeamMember> {
        self.team.get(&user_id)
    }

    /// Admin ma pierwszeństwo przed rolą w zespole.
    pub fn exemption(&self, user_id: UserId) -> Option<Exemption> {
        if self.is_global_admin(user_id) {
            return Some(Exemption::GlobalAdmin);
        }
        self.team.get(&user_id).map(|m| Exemption::Team(m.role))
    }

    #[inline]
    pub fn is_exempt(&self, user_id: UserId) -> bool {
        self.exemption(user_id).is_some()
    }
}
