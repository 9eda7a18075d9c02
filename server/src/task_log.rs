use chrono::{DateTime, Utc};
use clanwatch_shared::TaskStatus;

use crate::db_sqlx::{PgPool, query};
use crate::error::Result;
use crate::store::SnapshotStore;

/// The tables each task name touches, used to compute `records_saved` as a before/after
/// row-count delta rather than having every pipeline track its own insert count.
fn tables_for(task_name: &str) -> &'static [&'static str] {
    match task_name {
        "clan_sync" => &["clan_snapshots", "player_clan_snapshots"],
        "player_profile_sync" | "player_profile_sync_monthly" => &["player_profile_snapshots"],
        "grand_sync" => &["grand_arena_snapshots"],
        "arena_deck_sync" => &["arena_deck_snapshots"],
        _ => &[],
    }
}

/// Wraps one scheduler or CLI invocation with a start/finish lifecycle, recording the
/// wall-clock duration and the row-count delta across the task's tables.
pub struct TaskRun<'a> {
    pool: &'a PgPool,
    task_name: String,
    started_at: DateTime<Utc>,
    records_expected: i64,
    details: serde_json::Value,
    initial_counts: Vec<(&'static str, i64)>,
}

impl<'a> TaskRun<'a> {
    pub async fn start(pool: &'a PgPool, task_name: impl Into<String>, records_expected: i64, details: serde_json::Value) -> Result<Self> {
        let task_name = task_name.into();
        let store = SnapshotStore::new(pool);
        let mut initial_counts = Vec::new();
        for table in tables_for(&task_name) {
            let count = store.row_count(table).await.unwrap_or(0);
            initial_counts.push((*table, count));
        }
        Ok(Self {
            pool,
            task_name,
            started_at: Utc::now(),
            records_expected,
            details,
            initial_counts,
        })
    }

    async fn records_saved(&self) -> i64 {
        let store = SnapshotStore::new(self.pool);
        let mut total = 0;
        for (table, initial) in &self.initial_counts {
            let current = store.row_count(table).await.unwrap_or(*initial);
            let delta = current - initial;
            if delta > 0 {
                total += delta;
            }
        }
        total
    }

    pub async fn finish_success(self, records_fetched: i64) -> Result<()> {
        let saved = self.records_saved().await;
        self.save(TaskStatus::Success, records_fetched, saved, None).await
    }

    pub async fn finish_failed(self, error_message: impl Into<String>, records_fetched: i64) -> Result<()> {
        let saved = self.records_saved().await;
        self.save(TaskStatus::Failed, records_fetched, saved, Some(error_message.into())).await
    }

    async fn save(self, status: TaskStatus, records_fetched: i64, records_saved: i64, error_message: Option<String>) -> Result<()> {
        let finished_at = Utc::now();
        let duration_seconds = (finished_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        query(
            "INSERT INTO task_logs
             (task_name, started_at, finished_at, duration_seconds, status, records_expected,
              records_fetched, records_saved, error_message, details)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(self.task_name)
        .bind(self.started_at)
        .bind(finished_at)
        .bind(duration_seconds)
        .bind(status.as_str())
        .bind(self.records_expected)
        .bind(records_fetched)
        .bind(records_saved)
        .bind(error_message)
        .bind(self.details)
        .execute(self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_for_known_tasks_matches_the_original_mapping() {
        assert_eq!(tables_for("clan_sync"), &["clan_snapshots", "player_clan_snapshots"]);
        assert_eq!(tables_for("player_profile_sync_monthly"), &["player_profile_snapshots"]);
        assert_eq!(tables_for("unknown_task"), &[] as &[&str]);
    }
}
