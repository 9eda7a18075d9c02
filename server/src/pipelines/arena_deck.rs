use std::sync::Arc;

use chrono::Utc;
use clanwatch_shared::{ArenaDeckSnapshot, DeckUnit, GroupKind};

use crate::client::RpcClient;
use crate::config;
use crate::db_sqlx::PgPool;
use crate::error::Result;
use crate::registry::AccountRegistry;
use crate::store::SnapshotStore;
use crate::task_log::TaskRun;
use crate::version_store::VersionStore;

/// Upstream ranking entries carry the defensive lineup under one of a few differently-named
/// keys depending on API version; try each in turn rather than assuming one shape.
fn extract_deck(user: &serde_json::Value) -> Vec<DeckUnit> {
    for key in ["arena_deck", "defence_unit_list", "unit_list"] {
        if let Some(units) = user.get(key).and_then(|v| v.as_array()) {
            return units
                .iter()
                .map(|u| DeckUnit {
                    id: u.get("id").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
                    rarity: u.get("rarity").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
                    level: u.get("level").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
                    power: u.get("power").and_then(|v| v.as_i64()).unwrap_or(0),
                })
                .collect();
        }
    }
    Vec::new()
}

fn parse_page(response: &serde_json::Value, group: i32) -> Vec<ArenaDeckSnapshot> {
    response
        .get("ranking")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|user| {
            let viewer_id = user.get("viewer_id").and_then(|v| v.as_i64())?;
            if viewer_id <= config::NPC_VIEWER_ID_FLOOR {
                return None;
            }
            Some(ArenaDeckSnapshot {
                viewer_id,
                collected_at: None,
                user_name: user.get("user_name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                team_level: user.get("team_level").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
                arena_group: group,
                arena_rank: user.get("rank").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
                arena_deck: extract_deck(&user),
            })
        })
        .collect()
}

async fn scrape_group(client: &mut RpcClient, group: i32) -> Vec<ArenaDeckSnapshot> {
    let mut rows = Vec::new();
    for page in 1..=config::ARENA_DECK_PAGES {
        let response = client.arena_ranking(group, page).await;
        if response.get("server_error").is_some() {
            tracing::warn!(group, page, "arena ranking page failed, skipping");
            continue;
        }
        rows.extend(parse_page(&response, group));
    }
    rows
}

pub async fn run(pool: &PgPool, base_url: String, version_store: Arc<VersionStore>) -> Result<()> {
    let accounts = AccountRegistry::new(pool).by_group(GroupKind::Arena).await?;
    let records_expected = accounts.len() as i64 * config::ARENA_DECK_PAGES as i64 * config::GRAND_ARENA_PAGE_SIZE as i64;

    let task = TaskRun::start(
        pool,
        "arena_deck_sync",
        records_expected,
        serde_json::json!({"groups": accounts.iter().map(|a| a.arena_group).collect::<Vec<_>>()}),
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
                tracing::warn!(uid = %account.uid, "arena deck account has no bound viewer_id");
                return Vec::new();
            };
            let mut client = RpcClient::new(base_url, viewer_id, version_store);
            if client.login(&account.uid, &account.access_key).await.is_err() {
                tracing::warn!(uid = %account.uid, "arena deck account failed to log in");
                return Vec::new();
            }
            scrape_group(&mut client, account.arena_group).await
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
    store.insert_arena_deck_snapshots(&all_rows).await?;

    task.finish_success(saved as i64).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn npc_entries_at_or_below_the_floor_are_filtered_out() {
        let response = serde_json::json!({
            "ranking": [
                {"viewer_id": 500, "user_name": "npc"},
                {"viewer_id": 2_000_000_000_i64, "user_name": "player"}
            ]
        });
        let rows = parse_page(&response, 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_name, "player");
    }

    #[test]
    fn deck_units_are_extracted_from_the_first_matching_key() {
        let user = serde_json::json!({"unit_list": [{"id": 1101, "rarity": 6, "level": 150, "power": 90000}]});
        let deck = extract_deck(&user);
        assert_eq!(deck.len(), 1);
        assert_eq!(deck[0].id, 1101);
    }

    #[test]
    fn missing_deck_keys_yield_an_empty_deck() {
        assert!(extract_deck(&serde_json::json!({})).is_empty());
    }
}
