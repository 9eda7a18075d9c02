use std::sync::Arc;

use chrono::Utc;
use clanwatch_shared::{GrandArenaSnapshot, GroupKind};

use crate::client::RpcClient;
use crate::config;
use crate::db_sqlx::PgPool;
use crate::error::Result;
use crate::registry::AccountRegistry;
use crate::store::SnapshotStore;
use crate::task_log::TaskRun;
use crate::version_store::VersionStore;

fn parse_page(response: &serde_json::Value, group: i32) -> Vec<GrandArenaSnapshot> {
    response
        .get("ranking")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|user| {
            let viewer_id = user.get("viewer_id").and_then(|v| v.as_i64())?;
            let favorite_unit = user
                .get("favorite_unit")
                .and_then(|v| v.get("id").and_then(|id| id.as_i64()).or_else(|| v.as_i64()))
                .unwrap_or(0) as i32;
            Some(GrandArenaSnapshot {
                viewer_id,
                collected_at: None,
                user_name: user.get("user_name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                team_level: user.get("team_level").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
                grand_arena_rank: user.get("rank").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
                grand_arena_group: group,
                winning_number: user.get("winning_number").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
                favorite_unit,
            })
        })
        .collect()
}

/// One account's full page sweep for its assigned group (§4.5.3). A page that errors is
/// logged and skipped; it never aborts the rest of the group's pages.
async fn scrape_group(client: &mut RpcClient, group: i32) -> Vec<GrandArenaSnapshot> {
    let mut rows = Vec::new();
    for page in 1..=config::GRAND_ARENA_PAGES {
        let response = client.grand_arena_ranking(group, page).await;
        if response.get("server_error").is_some() {
            tracing::warn!(group, page, "grand arena ranking page failed, skipping");
            continue;
        }
        rows.extend(parse_page(&response, group));
    }
    rows
}

pub async fn run(pool: &PgPool, base_url: String, version_store: Arc<VersionStore>) -> Result<()> {
    let accounts = AccountRegistry::new(pool).by_group(GroupKind::GrandArena).await?;
    let records_expected = accounts.len() as i64 * config::GRAND_ARENA_PAGES as i64 * config::GRAND_ARENA_PAGE_SIZE as i64;

    let task = TaskRun::start(
        pool,
        "grand_sync",
        records_expected,
        serde_json::json!({"groups": accounts.iter().map(|a| a.grand_arena_group).collect::<Vec<_>>()}),
    )
    .await?;

    if accounts.is_empty() {
        task.finish_success(0).await?;
        return Ok(());
    }

    let collected_at = Utc::now();
    let mut handles = Vec::with_capacity(accounts.len());
    for account in accounts {
        let base_url = base_url.clone();
        let version_store = version_store.clone();
        handles.push(tokio::spawn(async move {
            let Some(viewer_id) = account.viewer_id else {
                tracing::warn!(uid = %account.uid, "grand arena account has no bound viewer_id");
                return Vec::new();
            };
            let mut client = RpcClient::new(base_url, viewer_id, version_store);
            if client.login(&account.uid, &account.access_key).await.is_err() {
                tracing::warn!(uid = %account.uid, "grand arena account failed to log in");
                return Vec::new();
            }
            scrape_group(&mut client, account.grand_arena_group).await
        }));
    }

    let mut all_rows = Vec::new();
    for handle in futures::future::join_all(handles).await {
        if let Ok(mut rows) = handle {
            all_rows.append(&mut rows);
        }
    }
    for row in &mut all_rows {
        row.collected_at = Some(collected_at);
    }

    let store = SnapshotStore::new(pool);
    let saved = all_rows.len();
    store.insert_grand_arena_snapshots(&all_rows).await?;

    task.finish_success(saved as i64).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ranking_entries_tagging_them_with_the_requested_group() {
        let response = serde_json::json!({
            "ranking": [
                {"viewer_id": 5, "user_name": "a", "team_level": 200, "rank": 1, "winning_number": 30, "favorite_unit": {"id": 1101}}
            ]
        });
        let rows = parse_page(&response, 3);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].grand_arena_group, 3);
        assert_eq!(rows[0].favorite_unit, 1101);
    }

    #[test]
    fn entries_without_a_viewer_id_are_skipped() {
        let response = serde_json::json!({"ranking": [{"user_name": "no id"}]});
        assert!(parse_page(&response, 1).is_empty());
    }
}
