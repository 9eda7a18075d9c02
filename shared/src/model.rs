use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A crawler credential bound to exactly one upstream account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub uid: String,
    pub access_key: String,
    #[serde(default)]
    pub viewer_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arena_group: i32,
    #[serde(default)]
    pub grand_arena_group: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub note: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Which arena-group column an [`Account`] is queried by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Arena,
    GrandArena,
}

impl Account {
    pub fn group_for(&self, kind: GroupKind) -> i32 {
        match kind {
            GroupKind::Arena => self.arena_group,
            GroupKind::GrandArena => self.grand_arena_group,
        }
    }
}

/// One row per (clan_id, collected_at). Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClanSnapshot {
    pub clan_id: i64,
    pub collected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clan_name: String,
    #[serde(default)]
    pub leader_viewer_id: i64,
    #[serde(default)]
    pub leader_name: String,
    #[serde(default)]
    pub join_condition: i32,
    #[serde(default)]
    pub activity: i32,
    #[serde(default)]
    pub battle_mode: i32,
    #[serde(default)]
    pub member_num: i32,
    #[serde(default)]
    pub current_period_ranking: i32,
    #[serde(default)]
    pub grade_rank: i32,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub exist: bool,
}

impl Default for ClanSnapshot {
    /// The OQ-1 "disbanded" stub: every payload field defaulted, `exist` forced false.
    fn default() -> Self {
        Self {
            clan_id: 0,
            collected_at: None,
            clan_name: String::new(),
            leader_viewer_id: 0,
            leader_name: String::new(),
            join_condition: 0,
            activity: 0,
            battle_mode: 0,
            member_num: 0,
            current_period_ranking: 0,
            grade_rank: 0,
            description: String::new(),
            exist: false,
        }
    }
}

/// One row per (viewer_id, collected_at): a member as seen from inside a clan roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerClanSnapshot {
    pub viewer_id: i64,
    pub collected_at: Option<DateTime<Utc>>,
    pub name: String,
    pub level: i32,
    pub role: i32,
    pub total_power: i64,
    pub join_clan_id: i64,
    pub join_clan_name: String,
    pub last_login_time: DateTime<Utc>,
}

/// The five elemental talent-quest clear stages, one index per attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalentQuestClear(pub [i32; 5]);

/// One row per (viewer_id, collected_at): a richer per-player profile snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProfileSnapshot {
    pub viewer_id: i64,
    pub collected_at: Option<DateTime<Utc>>,
    pub user_name: String,
    pub team_level: i32,
    pub unit_num: i32,
    pub total_power: i64,
    pub arena_rank: i32,
    pub arena_group: i32,
    pub grand_arena_rank: i32,
    pub grand_arena_group: i32,
    pub favorite_unit: i32,
    pub user_comment: String,
    pub princess_knight_exp: i64,
    pub talent_quest_clear: TalentQuestClear,
    #[serde(default)]
    pub join_clan_id: Option<i64>,
    #[serde(default)]
    pub join_clan_name: Option<String>,
}

/// One row per (viewer_id, collected_at): team-mode ranked-arena page scrape result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrandArenaSnapshot {
    pub viewer_id: i64,
    pub collected_at: Option<DateTime<Utc>>,
    pub user_name: String,
    pub team_level: i32,
    pub grand_arena_rank: i32,
    pub grand_arena_group: i32,
    pub winning_number: i32,
    pub favorite_unit: i32,
}

/// One deck slot of a captured defensive lineup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeckUnit {
    pub id: i32,
    pub rarity: i32,
    pub level: i32,
    pub power: i64,
}

/// One row per (viewer_id, collected_at): solo-mode ranked-arena snapshot with defense deck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaDeckSnapshot {
    pub viewer_id: i64,
    pub collected_at: Option<DateTime<Utc>>,
    pub user_name: String,
    pub team_level: i32,
    pub arena_group: i32,
    pub arena_rank: i32,
    pub arena_deck: Vec<DeckUnit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }
}

/// One row per pipeline invocation: start/finish accounting for the scheduler and CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub status: TaskStatus,
    pub records_expected: i64,
    pub records_fetched: i64,
    pub records_saved: i64,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_for_selects_the_matching_column() {
        let account = Account {
            id: 1,
            uid: "u".into(),
            access_key: "k".into(),
            viewer_id: None,
            name: None,
            arena_group: 3,
            grand_arena_group: 7,
            is_active: true,
            note: None,
        };
        assert_eq!(account.group_for(GroupKind::Arena), 3);
        assert_eq!(account.group_for(GroupKind::GrandArena), 7);
    }

    #[test]
    fn task_status_renders_lowercase_strings() {
        assert_eq!(TaskStatus::Success.as_str(), "success");
        assert_eq!(TaskStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn clan_snapshot_default_is_a_disbanded_stub() {
        let snapshot = ClanSnapshot::default();
        assert!(!snapshot.exist);
        assert_eq!(snapshot.clan_id, 0);
    }
}
