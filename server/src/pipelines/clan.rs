use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use clanwatch_shared::{ClanSnapshot, PlayerClanSnapshot};

use crate::client::RpcClient;
use crate::config;
use crate::db_sqlx::{PgPool, query_as};
use crate::error::Result;
use crate::queue::{ProcessOutcome, QueryMode, WorkQueue};
use crate::registry::AccountRegistry;
use crate::store::SnapshotStore;
use crate::task_log::TaskRun;
use crate::version_store::VersionStore;

/// A clan definitely has activity within the window if some member's last login outran the
/// clan's own most recent snapshot by less than 30 days.
async fn active_clan_ids(pool: &PgPool) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = query_as(
        "SELECT join_clan_id FROM player_clan_snapshots
         WHERE join_clan_id IS NOT NULL
         GROUP BY join_clan_id
         HAVING MAX(last_login_time) > MAX(collected_at) - INTERVAL '30 days'
         ORDER BY join_clan_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

fn is_full_scan_month(month: u32) -> bool {
    month == 1 || month == 7
}

/// Builds the clan-id scan list (§4.5.1): active clans in most months, a full `1..=max+500`
/// sweep in January and July, and a `1..=5000` cold-start range when there's no history yet.
/// The production-database fallback the original used for empty dev databases is dropped —
/// it named a specific external environment with no place in a general-purpose crawler.
pub async fn build_query_list(pool: &PgPool, new_clan_add: i64) -> Result<Vec<i64>> {
    let mut active_clans = active_clan_ids(pool).await?;
    if active_clans.is_empty() {
        return Ok((1..=5000).collect());
    }
    active_clans.sort_unstable();
    let max_id = *active_clans.last().unwrap();

    if is_full_scan_month(Utc::now().month()) {
        Ok((1..=(max_id + config::FULL_SCAN_CLAN_PROBE)).collect())
    } else {
        let mut final_list = active_clans;
        final_list.extend((max_id + 1)..=(max_id + new_clan_add));
        final_list.sort_unstable();
        final_list.dedup();
        Ok(final_list)
    }
}

pub struct ClanPipelineItem {
    clan: ClanSnapshot,
    members: Vec<PlayerClanSnapshot>,
}

/// Interprets one `clan/others_info` response (§4.5.1, OQ-1). Unlike the original, the
/// requested clan id is threaded in directly rather than recovered from the response body,
/// so a disbanded clan can still be recorded as such.
fn process_clan_response(clan_id: i64, response: serde_json::Value) -> ProcessOutcome<ClanPipelineItem> {
    if let Some(clan) = response.get("clan") {
        let Some(detail) = clan.get("detail") else {
            return ProcessOutcome::Drop;
        };
        let clan_snapshot = ClanSnapshot {
            clan_id: detail.get("clan_id").and_then(|v| v.as_i64()).unwrap_or(clan_id),
            collected_at: None,
            clan_name: detail.get("clan_name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            leader_viewer_id: detail.get("leader_viewer_id").and_then(|v| v.as_i64()).unwrap_or(0),
            leader_name: detail.get("leader_name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            join_condition: detail.get("join_condition").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
            activity: detail.get("activity").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
            battle_mode: detail.get("clan_battle_mode").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
            member_num: detail.get("member_num").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
            current_period_ranking: detail.get("current_period_ranking").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
            grade_rank: detail.get("grade_rank").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
            description: detail.get("description").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            exist: true,
        };

        let members = clan
            .get("members")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|m| {
                let last_login = m.get("last_login_time").and_then(|v| v.as_i64()).unwrap_or(0);
                PlayerClanSnapshot {
                    viewer_id: m.get("viewer_id").and_then(|v| v.as_i64()).unwrap_or(0),
                    collected_at: None,
                    name: m.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    level: m.get("level").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
                    role: m.get("role").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
                    total_power: m.get("total_power").and_then(|v| v.as_i64()).unwrap_or(0),
                    join_clan_id: clan_snapshot.clan_id,
                    join_clan_name: clan_snapshot.clan_name.clone(),
                    last_login_time: DateTime::from_timestamp(last_login, 0).unwrap_or_else(Utc::now),
                }
            })
            .collect();

        return ProcessOutcome::Saved(ClanPipelineItem { clan: clan_snapshot, members });
    }

    if let Some(server_error) = response.get("server_error") {
        let message = server_error.get("message").and_then(|v| v.as_str()).unwrap_or_default();
        if message.contains("此行会已解散") {
            return ProcessOutcome::Saved(ClanPipelineItem {
                clan: ClanSnapshot { clan_id, ..Default::default() },
                members: Vec::new(),
            });
        }
        if message.contains("连接中断") {
            return ProcessOutcome::Retry;
        }
    }

    ProcessOutcome::Drop
}

async fn insert_batch(store: &SnapshotStore<'_>, items: Vec<ClanPipelineItem>, collected_at: DateTime<Utc>) -> Result<usize> {
    let mut clans = Vec::with_capacity(items.len());
    let mut members = Vec::new();
    for item in items {
        clans.push(ClanSnapshot { collected_at: Some(collected_at), ..item.clan });
        members.extend(
            item.members
                .into_iter()
                .map(|m| PlayerClanSnapshot { collected_at: Some(collected_at), ..m }),
        );
    }
    let saved = clans.len() + members.len();
    store.insert_clan_snapshots(&clans).await?;
    store.insert_player_clan_snapshots(&members).await?;
    Ok(saved)
}

pub async fn run(pool: &PgPool, base_url: String, version_store: Arc<VersionStore>, new_clan_add: i64) -> Result<()> {
    let query_list = build_query_list(pool, new_clan_add).await?;
    let query_count = query_list.len() as i64;
    let records_expected = query_count * 31;

    let task = TaskRun::start(
        pool,
        "clan_sync",
        records_expected,
        serde_json::json!({"new_clan_add": new_clan_add, "query_count": query_count}),
    )
    .await?;

    let accounts = AccountRegistry::new(pool).list_active().await?;
    if accounts.is_empty() || query_list.is_empty() {
        task.finish_success(0).await?;
        return Ok(());
    }

    let queue = WorkQueue::<ClanPipelineItem>::new(query_list, accounts, base_url, version_store);

    let fetch_counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let counter_for_process = fetch_counter.clone();
    let pool_owned = pool.clone();
    let (_processed, collected_at) = queue
        .run(
            move |mut client, clan_id, mode| {
                debug_assert_eq!(mode, QueryMode::Clan);
                async move {
                    let response = client.clan_others_info(clan_id).await;
                    (client, process_clan_response(clan_id, response))
                }
            },
            move |batch, stamp| {
                let pool = pool_owned.clone();
                let counter = counter_for_process.clone();
                async move {
                    let store = SnapshotStore::new(&pool);
                    match insert_batch(&store, batch, stamp).await {
                        Ok(saved) => {
                            counter.fetch_add(saved as u64, std::sync::atomic::Ordering::Relaxed);
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to insert clan batch"),
                    }
                }
            },
        )
        .await;
    let _ = collected_at;

    task.finish_success(fetch_counter.load(std::sync::atomic::Ordering::Relaxed) as i64).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_scan_months_are_january_and_july() {
        assert!(is_full_scan_month(1));
        assert!(is_full_scan_month(7));
        assert!(!is_full_scan_month(6));
    }

    #[test]
    fn disbanded_clan_is_saved_as_a_nonexistent_stub() {
        let response = serde_json::json!({"server_error": {"message": "此行会已解散了"}});
        let outcome = process_clan_response(42, response);
        match outcome {
            ProcessOutcome::Saved(item) => {
                assert_eq!(item.clan.clan_id, 42);
                assert!(!item.clan.exist);
                assert!(item.members.is_empty());
            }
            _ => panic!("expected a saved stub"),
        }
    }

    #[test]
    fn connection_interrupted_requests_a_retry() {
        let response = serde_json::json!({"server_error": {"message": "连接中断，请重试"}});
        assert!(matches!(process_clan_response(1, response), ProcessOutcome::Retry));
    }

    #[test]
    fn unrecognized_shapes_are_dropped() {
        assert!(matches!(process_clan_response(1, serde_json::json!({})), ProcessOutcome::Drop));
    }

    #[test]
    fn a_successful_response_carries_members_with_the_clans_join_id() {
        let response = serde_json::json!({
            "clan": {
                "detail": {
                    "clan_id": 7,
                    "clan_name": "Wolves",
                    "leader_viewer_id": 100,
                    "leader_name": "Leader",
                    "join_condition": 0,
                    "activity": 1,
                    "clan_battle_mode": 1,
                    "member_num": 1,
                    "current_period_ranking": 3,
                    "grade_rank": 2,
                    "description": "hi"
                },
                "members": [
                    {"viewer_id": 100, "name": "Leader", "level": 200, "role": 1, "total_power": 5_000_000, "last_login_time": 1_700_000_000}
                ]
            }
        });
        match process_clan_response(7, response) {
            ProcessOutcome::Saved(item) => {
                assert_eq!(item.clan.clan_name, "Wolves");
                assert_eq!(item.members.len(), 1);
                assert_eq!(item.members[0].join_clan_id, 7);
                assert_eq!(item.members[0].join_clan_name, "Wolves");
            }
            _ => panic!("expected a saved clan"),
        }
    }
}
