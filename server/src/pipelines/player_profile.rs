use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clanwatch_shared::{PlayerProfileSnapshot, TalentQuestClear};

use crate::client::RpcClient;
use crate::config;
use crate::db_sqlx::{PgPool, query_as};
use crate::error::Result;
use crate::queue::{ProcessOutcome, QueryMode, WorkQueue};
use crate::registry::AccountRegistry;
use crate::store::SnapshotStore;
use crate::task_log::TaskRun;
use crate::version_store::VersionStore;

/// The two player-profile scrape shapes (§4.5.2): a small daily sweep of top-clan rosters,
/// or a monthly sweep of every active high-power player regardless of clan standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileMode {
    TopClans,
    ActiveAll,
}

impl ProfileMode {
    fn task_name(self) -> &'static str {
        match self {
            ProfileMode::TopClans => "player_profile_sync",
            ProfileMode::ActiveAll => "player_profile_sync_monthly",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemberInfo {
    join_clan_id: Option<i64>,
    join_clan_name: Option<String>,
}

/// Top-N clans by current-period ranking, falling back to grade rank 1-3 when the league
/// hasn't produced a ranking yet, both scoped to the latest snapshot day within 30 days.
async fn top_clan_ids(pool: &PgPool, rank_limit: i32) -> Result<Vec<i64>> {
    let by_ranking: Vec<(i64,)> = query_as(
        "WITH latest_date AS (
            SELECT DATE(MAX(collected_at)) AS max_date FROM clan_snapshots
            WHERE collected_at > NOW() - INTERVAL '30 days'
         )
         SELECT DISTINCT clan_id FROM clan_snapshots
         WHERE current_period_ranking > 0 AND current_period_ranking <= $1
           AND exist = TRUE AND DATE(collected_at) = (SELECT max_date FROM latest_date)
         ORDER BY clan_id",
    )
    .bind(rank_limit)
    .fetch_all(pool)
    .await?;
    if !by_ranking.is_empty() {
        return Ok(by_ranking.into_iter().map(|(id,)| id).collect());
    }

    let by_grade: Vec<(i64,)> = query_as(
        "WITH latest_date AS (
            SELECT DATE(MAX(collected_at)) AS max_date FROM clan_snapshots
            WHERE collected_at > NOW() - INTERVAL '30 days'
         )
         SELECT DISTINCT clan_id FROM clan_snapshots
         WHERE grade_rank > 0 AND grade_rank <= 3
           AND exist = TRUE AND DATE(collected_at) = (SELECT max_date FROM latest_date)
         ORDER BY clan_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(by_grade.into_iter().map(|(id,)| id).collect())
}

async fn members_of_clans(pool: &PgPool, clan_ids: &[i64]) -> Result<(Vec<i64>, HashMap<i64, MemberInfo>)> {
    if clan_ids.is_empty() {
        return Ok((Vec::new(), HashMap::new()));
    }
    let rows: Vec<(i64, i64, String)> = query_as(
        "SELECT DISTINCT ON (viewer_id) viewer_id, join_clan_id, join_clan_name
         FROM player_clan_snapshots
         WHERE join_clan_id = ANY($1) AND collected_at > NOW() - INTERVAL '30 days'
         ORDER BY viewer_id, collected_at DESC",
    )
    .bind(clan_ids)
    .fetch_all(pool)
    .await?;

    let mut viewer_ids = Vec::with_capacity(rows.len());
    let mut member_info = HashMap::with_capacity(rows.len());
    for (viewer_id, join_clan_id, join_clan_name) in rows {
        viewer_ids.push(viewer_id);
        member_info.insert(
            viewer_id,
            MemberInfo { join_clan_id: Some(join_clan_id), join_clan_name: Some(join_clan_name) },
        );
    }
    Ok((viewer_ids, member_info))
}

async fn active_high_power_players(pool: &PgPool) -> Result<(Vec<i64>, HashMap<i64, MemberInfo>)> {
    let rows: Vec<(i64, Option<i64>, Option<String>)> = query_as(
        "SELECT DISTINCT ON (viewer_id) viewer_id, join_clan_id, join_clan_name
         FROM player_clan_snapshots
         WHERE total_power > $1 AND last_login_time > NOW() - INTERVAL '30 days'
         ORDER BY viewer_id, collected_at DESC",
    )
    .bind(config::ACTIVE_TOTAL_POWER_FLOOR)
    .fetch_all(pool)
    .await?;

    let mut viewer_ids = Vec::with_capacity(rows.len());
    let mut member_info = HashMap::with_capacity(rows.len());
    for (viewer_id, join_clan_id, join_clan_name) in rows {
        viewer_ids.push(viewer_id);
        member_info.insert(viewer_id, MemberInfo { join_clan_id, join_clan_name });
    }
    Ok((viewer_ids, member_info))
}

async fn target_players(pool: &PgPool, mode: ProfileMode, rank_limit: i32) -> Result<(Vec<i64>, HashMap<i64, MemberInfo>)> {
    match mode {
        ProfileMode::TopClans => {
            let clan_ids = top_clan_ids(pool, rank_limit).await?;
            if clan_ids.is_empty() {
                Ok((Vec::new(), HashMap::new()))
            } else {
                members_of_clans(pool, &clan_ids).await
            }
        }
        ProfileMode::ActiveAll => active_high_power_players(pool).await,
    }
}

/// Extracted `get_profile` fields, keyed by `viewer_id` so the batch inserter can join in
/// clan-membership bookkeeping gathered at the seeding stage.
struct ProfileItem {
    viewer_id: i64,
    user_name: String,
    team_level: i32,
    unit_num: i32,
    total_power: i64,
    arena_rank: i32,
    arena_group: i32,
    grand_arena_rank: i32,
    grand_arena_group: i32,
    favorite_unit: i32,
    user_comment: String,
    princess_knight_exp: i64,
    talent_quest_clear: [i32; 5],
}

fn process_profile_response(response: serde_json::Value) -> ProcessOutcome<ProfileItem> {
    let Some(user) = response.get("user_info") else {
        return ProcessOutcome::Drop;
    };
    let Some(viewer_id) = user.get("viewer_id").and_then(|v| v.as_i64()) else {
        return ProcessOutcome::Drop;
    };

    let mut talent_quest_clear = [0i32; 5];
    if let Some(entries) = response
        .get("quest_info")
        .and_then(|q| q.get("talent_quest"))
        .and_then(|v| v.as_array())
    {
        for (idx, slot) in entries.iter().take(5).enumerate() {
            talent_quest_clear[idx] = slot.get("clear_count").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
        }
    }

    let favorite_unit = response
        .get("favorite_unit")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0) as i32;

    ProcessOutcome::Saved(ProfileItem {
        viewer_id,
        user_name: user.get("user_name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        team_level: user.get("team_level").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
        unit_num: user.get("unit_num").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
        total_power: user.get("total_power").and_then(|v| v.as_i64()).unwrap_or(0),
        arena_rank: user.get("arena_rank").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
        arena_group: user.get("arena_group").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
        grand_arena_rank: user.get("grand_arena_rank").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
        grand_arena_group: user.get("grand_arena_group").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
        favorite_unit,
        user_comment: user.get("user_comment").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        princess_knight_exp: user.get("princess_knight_rank_total_exp").and_then(|v| v.as_i64()).unwrap_or(0),
        talent_quest_clear,
    })
}

fn into_snapshot(item: ProfileItem, member_info: &HashMap<i64, MemberInfo>, collected_at: DateTime<Utc>) -> PlayerProfileSnapshot {
    let info = member_info.get(&item.viewer_id).cloned().unwrap_or_default();
    PlayerProfileSnapshot {
        viewer_id: item.viewer_id,
        collected_at: Some(collected_at),
        user_name: item.user_name,
        team_level: item.team_level,
        unit_num: item.unit_num,
        total_power: item.total_power,
        arena_rank: item.arena_rank,
        arena_group: item.arena_group,
        grand_arena_rank: item.grand_arena_rank,
        grand_arena_group: item.grand_arena_group,
        favorite_unit: item.favorite_unit,
        user_comment: item.user_comment,
        princess_knight_exp: item.princess_knight_exp,
        talent_quest_clear: TalentQuestClear(item.talent_quest_clear),
        join_clan_id: info.join_clan_id,
        join_clan_name: info.join_clan_name,
    }
}

pub async fn run(
    pool: &PgPool,
    base_url: String,
    version_store: Arc<VersionStore>,
    mode: ProfileMode,
    rank_limit: i32,
) -> Result<()> {
    let (viewer_ids, member_info) = target_players(pool, mode, rank_limit).await?;
    let records_expected = viewer_ids.len() as i64;

    let task = TaskRun::start(
        pool,
        mode.task_name(),
        records_expected,
        serde_json::json!({"mode": mode.task_name(), "rank_limit": rank_limit}),
    )
    .await?;

    if viewer_ids.is_empty() {
        task.finish_success(0).await?;
        return Ok(());
    }

    let accounts = AccountRegistry::new(pool).list_active().await?;
    if accounts.is_empty() {
        task.finish_success(0).await?;
        return Ok(());
    }

    let queue = WorkQueue::<ProfileItem>::new(viewer_ids, accounts, base_url, version_store);
    let fetch_counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let counter_for_process = fetch_counter.clone();
    let pool_owned = pool.clone();
    let member_info = Arc::new(member_info);

    queue
        .run(
            move |mut client, viewer_id, mode| {
                debug_assert_eq!(mode, QueryMode::Profile);
                async move {
                    let response = client.get_profile(viewer_id).await;
                    (client, process_profile_response(response))
                }
            },
            move |batch, stamp| {
                let pool = pool_owned.clone();
                let counter = counter_for_process.clone();
                let member_info = member_info.clone();
                async move {
                    let rows: Vec<PlayerProfileSnapshot> =
                        batch.into_iter().map(|item| into_snapshot(item, &member_info, stamp)).collect();
                    let store = SnapshotStore::new(&pool);
                    let saved = rows.len();
                    match store.insert_player_profile_snapshots(&rows).await {
                        Ok(()) => {
                            counter.fetch_add(saved as u64, std::sync::atomic::Ordering::Relaxed);
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to insert player profile batch"),
                    }
                }
            },
        )
        .await;

    task.finish_success(fetch_counter.load(std::sync::atomic::Ordering::Relaxed) as i64).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_names_distinguish_the_daily_and_monthly_modes() {
        assert_eq!(ProfileMode::TopClans.task_name(), "player_profile_sync");
        assert_eq!(ProfileMode::ActiveAll.task_name(), "player_profile_sync_monthly");
    }

    #[test]
    fn missing_user_info_is_dropped() {
        assert!(matches!(process_profile_response(serde_json::json!({})), ProcessOutcome::Drop));
    }

    #[test]
    fn talent_quest_slots_default_to_zero_when_fewer_than_five_are_present() {
        let response = serde_json::json!({
            "user_info": {"viewer_id": 1, "user_name": "a"},
            "quest_info": {"talent_quest": [{"clear_count": 3}, {"clear_count": 1}]},
            "favorite_unit": {"id": 1101}
        });
        match process_profile_response(response) {
            ProcessOutcome::Saved(item) => {
                assert_eq!(item.talent_quest_clear, [3, 1, 0, 0, 0]);
                assert_eq!(item.favorite_unit, 1101);
            }
            _ => panic!("expected a saved profile"),
        }
    }
}
