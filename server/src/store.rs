use chrono::{DateTime, Utc};
use clanwatch_shared::{ArenaDeckSnapshot, ClanSnapshot, GrandArenaSnapshot, PlayerClanSnapshot, PlayerProfileSnapshot};

use crate::db_sqlx::{PgPool, Postgres, QueryBuilder, query_as, query_scalar};
use crate::error::Result;

/// Append-only writes and the analytical reads the out-of-scope query API relies on (§4.6).
/// Every write here is idempotent under the entity's `(natural_id, collected_at)` primary
/// key; nothing in this module ever issues an `UPDATE` or `DELETE`.
pub struct SnapshotStore<'a> {
    pool: &'a PgPool,
}

impl<'a> SnapshotStore<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    pub async fn row_count(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {table}");
        let count: i64 = query_scalar(&sql).fetch_one(self.pool).await?;
        Ok(count)
    }

    pub async fn insert_clan_snapshots(&self, rows: &[ClanSnapshot]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO clan_snapshots (clan_id, collected_at, clan_name, leader_viewer_id, \
             leader_name, join_condition, activity, battle_mode, member_num, \
             current_period_ranking, grade_rank, description, exist) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.clan_id)
                .push_bind(row.collected_at)
                .push_bind(&row.clan_name)
                .push_bind(row.leader_viewer_id)
                .push_bind(&row.leader_name)
                .push_bind(row.join_condition)
                .push_bind(row.activity)
                .push_bind(row.battle_mode)
                .push_bind(row.member_num)
                .push_bind(row.current_period_ranking)
                .push_bind(row.grade_rank)
                .push_bind(&row.description)
                .push_bind(row.exist);
        });
        builder.push(" ON CONFLICT (clan_id, collected_at) DO NOTHING");
        builder.build().execute(self.pool).await?;
        Ok(())
    }

    pub async fn insert_player_clan_snapshots(&self, rows: &[PlayerClanSnapshot]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO player_clan_snapshots (viewer_id, collected_at, name, level, role, \
             total_power, join_clan_id, join_clan_name, last_login_time) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.viewer_id)
                .push_bind(row.collected_at)
                .push_bind(&row.name)
                .push_bind(row.level)
                .push_bind(row.role)
                .push_bind(row.total_power)
                .push_bind(row.join_clan_id)
                .push_bind(&row.join_clan_name)
                .push_bind(row.last_login_time);
        });
        builder.push(" ON CONFLICT (viewer_id, collected_at) DO NOTHING");
        builder.build().execute(self.pool).await?;
        Ok(())
    }

    pub async fn insert_player_profile_snapshots(&self, rows: &[PlayerProfileSnapshot]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO player_profile_snapshots (viewer_id, collected_at, user_name, team_level, \
             unit_num, total_power, arena_rank, arena_group, grand_arena_rank, grand_arena_group, \
             favorite_unit, user_comment, princess_knight_exp, talent_quest_clear, join_clan_id, \
             join_clan_name) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.viewer_id)
                .push_bind(row.collected_at)
                .push_bind(&row.user_name)
                .push_bind(row.team_level)
                .push_bind(row.unit_num)
                .push_bind(row.total_power)
                .push_bind(row.arena_rank)
                .push_bind(row.arena_group)
                .push_bind(row.grand_arena_rank)
                .push_bind(row.grand_arena_group)
                .push_bind(row.favorite_unit)
                .push_bind(&row.user_comment)
                .push_bind(row.princess_knight_exp)
                .push_bind(serde_json::to_value(row.talent_quest_clear.0).unwrap_or_default())
                .push_bind(row.join_clan_id)
                .push_bind(&row.join_clan_name);
        });
        builder.push(" ON CONFLICT (viewer_id, collected_at) DO NOTHING");
        builder.build().execute(self.pool).await?;
        Ok(())
    }

    pub async fn insert_grand_arena_snapshots(&self, rows: &[GrandArenaSnapshot]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO grand_arena_snapshots (viewer_id, collected_at, user_name, team_level, \
             grand_arena_rank, grand_arena_group, winning_number, favorite_unit) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.viewer_id)
                .push_bind(row.collected_at)
                .push_bind(&row.user_name)
                .push_bind(row.team_level)
                .push_bind(row.grand_arena_rank)
                .push_bind(row.grand_arena_group)
                .push_bind(row.winning_number)
                .push_bind(row.favorite_unit);
        });
        builder.push(" ON CONFLICT (viewer_id, collected_at) DO NOTHING");
        builder.build().execute(self.pool).await?;
        Ok(())
    }

    pub async fn insert_arena_deck_snapshots(&self, rows: &[ArenaDeckSnapshot]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO arena_deck_snapshots (viewer_id, collected_at, user_name, team_level, \
             arena_group, arena_rank, arena_deck) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.viewer_id)
                .push_bind(row.collected_at)
                .push_bind(&row.user_name)
                .push_bind(row.team_level)
                .push_bind(row.arena_group)
                .push_bind(row.arena_rank)
                .push_bind(serde_json::to_value(&row.arena_deck).unwrap_or_default());
        });
        builder.push(" ON CONFLICT (viewer_id, collected_at) DO NOTHING");
        builder.build().execute(self.pool).await?;
        Ok(())
    }

    /// Every clan snapshot for one clan, grouped into ~monthly periods (a gap of 20+ days
    /// starts a new period), each period's ranking taken from the *next* period's
    /// `grade_rank` (the latest period is marked an estimate and uses its own
    /// `current_period_ranking`). Newest period first.
    pub async fn clan_history(&self, clan_id: i64) -> Result<Vec<ClanHistoryPeriod>> {
        let rows: Vec<(DateTime<Utc>, i32, i32, i32, String, String, i64)> = query_as(
            "SELECT collected_at, current_period_ranking, grade_rank, member_num, clan_name, \
             leader_name, leader_viewer_id
             FROM clan_snapshots WHERE clan_id = $1 AND exist = TRUE ORDER BY collected_at ASC",
        )
        .bind(clan_id)
        .fetch_all(self.pool)
        .await?;

        let mut periods: Vec<ClanHistoryPeriod> = Vec::new();
        let mut last_date: Option<DateTime<Utc>> = None;
        for (collected_at, current_period_ranking, grade_rank, member_num, clan_name, leader_name, leader_viewer_id) in rows {
            let starts_new_period = match last_date {
                None => true,
                Some(last) => (collected_at - last).num_days() >= 20,
            };
            if starts_new_period {
                periods.push(ClanHistoryPeriod {
                    collected_at,
                    current_period_ranking,
                    grade_rank,
                    member_num,
                    clan_name,
                    leader_name,
                    leader_viewer_id,
                    ranking: 0,
                    is_estimate: false,
                });
                last_date = Some(collected_at);
            }
        }

        let len = periods.len();
        for i in 0..len {
            if i + 1 < len {
                periods[i].ranking = periods[i + 1].grade_rank;
                periods[i].is_estimate = false;
            } else {
                periods[i].ranking = periods[i].current_period_ranking;
                periods[i].is_estimate = true;
            }
        }
        periods.reverse();
        Ok(periods)
    }

    /// One row per month the player's clan membership changed, annotated with that clan's
    /// next-available `grade_rank` (falling back to its latest `current_period_ranking`).
    pub async fn player_clan_history(&self, viewer_id: i64) -> Result<Vec<PlayerClanHistoryEntry>> {
        let rows: Vec<(String, i64, String, i32, i64, DateTime<Utc>, String)> = query_as(
            "SELECT DISTINCT ON (to_char(collected_at, 'YYYY-MM'))
                to_char(collected_at, 'YYYY-MM'), join_clan_id, join_clan_name, level, total_power, collected_at, name
             FROM player_clan_snapshots
             WHERE viewer_id = $1 AND join_clan_id IS NOT NULL
             ORDER BY to_char(collected_at, 'YYYY-MM') ASC, collected_at DESC",
        )
        .bind(viewer_id)
        .fetch_all(self.pool)
        .await?;

        let mut history = Vec::with_capacity(rows.len());
        for (period, clan_id, clan_name, level, total_power, collected_at, player_name) in rows {
            let next_grade_rank: Option<(Option<i32>,)> = query_as(
                "SELECT grade_rank FROM clan_snapshots WHERE clan_id = $1 AND collected_at > $2
                 ORDER BY collected_at ASC LIMIT 1",
            )
            .bind(clan_id)
            .bind(collected_at)
            .fetch_optional(self.pool)
            .await?;

            let clan_ranking = match next_grade_rank.and_then(|(rank,)| rank) {
                Some(rank) if rank > 0 => Some(rank),
                _ => {
                    let latest: Option<(i32,)> = query_as(
                        "SELECT current_period_ranking FROM clan_snapshots WHERE clan_id = $1
                         ORDER BY collected_at DESC LIMIT 1",
                    )
                    .bind(clan_id)
                    .fetch_optional(self.pool)
                    .await?;
                    latest.map(|(rank,)| rank)
                }
            };

            history.push(PlayerClanHistoryEntry {
                period,
                clan_id,
                clan_name,
                clan_ranking,
                level,
                total_power,
                player_name,
            });
        }
        history.reverse();
        Ok(history)
    }

    /// Latest per-clan average total-power over the trailing 7 days, clans with fewer than
    /// 10 recently-seen members excluded.
    pub async fn clan_power_ranking(&self, limit: i64) -> Result<Vec<ClanPowerRankingEntry>> {
        let rows: Vec<(i64, String, i64, i64)> = query_as(
            "WITH latest_data AS (
                SELECT DISTINCT ON (viewer_id) join_clan_id, join_clan_name, total_power
                FROM player_clan_snapshots
                WHERE collected_at > NOW() - INTERVAL '7 days'
                  AND join_clan_id IS NOT NULL AND total_power > 0
                ORDER BY viewer_id, collected_at DESC
             )
             SELECT join_clan_id, join_clan_name, ROUND(AVG(total_power))::BIGINT AS avg_power, COUNT(*)
             FROM latest_data
             GROUP BY join_clan_id, join_clan_name
             HAVING COUNT(*) >= 10
             ORDER BY avg_power DESC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, (clan_id, clan_name, avg_power, member_count))| ClanPowerRankingEntry {
                rank: i as i64 + 1,
                clan_id,
                clan_name,
                avg_power,
                member_count,
            })
            .collect())
    }

    /// Latest-per-entity winning-number ranking for one grand-arena group, or all groups
    /// when `group` is `0`. Display names prefer `player_profile_snapshots`, then fall back
    /// to the clan-roster-observed name.
    pub async fn grand_arena_winning_ranking(&self, group: i32, limit: i64) -> Result<Vec<GrandArenaRankingEntry>> {
        let rows: Vec<(i64, Option<String>, i32, i32, i32)> = if group == 0 {
            query_as(
                "WITH latest_per_group AS (
                    SELECT grand_arena_group, MAX(collected_at) AS max_time
                    FROM grand_arena_snapshots GROUP BY grand_arena_group
                 ),
                 latest_grand AS (
                    SELECT DISTINCT ON (viewer_id) viewer_id, winning_number, grand_arena_rank, t.grand_arena_group
                    FROM grand_arena_snapshots t
                    JOIN latest_per_group l ON t.grand_arena_group = l.grand_arena_group AND t.collected_at = l.max_time
                    ORDER BY viewer_id, collected_at DESC
                 ),
                 player_names AS (
                    SELECT DISTINCT ON (viewer_id) viewer_id, user_name FROM player_profile_snapshots
                    ORDER BY viewer_id, collected_at DESC
                 ),
                 clan_names AS (
                    SELECT DISTINCT ON (viewer_id) viewer_id, name AS user_name FROM player_clan_snapshots
                    ORDER BY viewer_id, collected_at DESC
                 )
                 SELECT g.viewer_id, COALESCE(p.user_name, c.user_name), g.winning_number, g.grand_arena_rank, g.grand_arena_group
                 FROM latest_grand g
                 LEFT JOIN player_names p ON g.viewer_id = p.viewer_id
                 LEFT JOIN clan_names c ON g.viewer_id = c.viewer_id
                 ORDER BY g.winning_number DESC, g.grand_arena_rank ASC
                 LIMIT $1",
            )
            .bind(limit)
            .fetch_all(self.pool)
            .await?
        } else {
            query_as(
                "WITH latest_time AS (
                    SELECT MAX(collected_at) AS max_time FROM grand_arena_snapshots WHERE grand_arena_group = $1
                 ),
                 latest_grand AS (
                    SELECT DISTINCT ON (viewer_id) viewer_id, winning_number, grand_arena_rank, grand_arena_group
                    FROM grand_arena_snapshots, latest_time
                    WHERE grand_arena_group = $1 AND collected_at = latest_time.max_time
                    ORDER BY viewer_id, collected_at DESC
                 ),
                 player_names AS (
                    SELECT DISTINCT ON (viewer_id) viewer_id, user_name FROM player_profile_snapshots
                    ORDER BY viewer_id, collected_at DESC
                 ),
                 clan_names AS (
                    SELECT DISTINCT ON (viewer_id) viewer_id, name AS user_name FROM player_clan_snapshots
                    ORDER BY viewer_id, collected_at DESC
                 )
                 SELECT g.viewer_id, COALESCE(p.user_name, c.user_name), g.winning_number, g.grand_arena_rank, g.grand_arena_group
                 FROM latest_grand g
                 LEFT JOIN player_names p ON g.viewer_id = p.viewer_id
                 LEFT JOIN clan_names c ON g.viewer_id = c.viewer_id
                 ORDER BY g.winning_number DESC, g.grand_arena_rank ASC
                 LIMIT $2",
            )
            .bind(group)
            .bind(limit)
            .fetch_all(self.pool)
            .await?
        };

        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, (viewer_id, user_name, winning_number, grand_arena_rank, grand_arena_group))| GrandArenaRankingEntry {
                rank: i as i64 + 1,
                viewer_id,
                user_name: user_name.unwrap_or_else(|| "Unknown".to_string()),
                winning_number,
                grand_arena_rank,
                grand_arena_group,
            })
            .collect())
    }

    /// Aggregate talent-quest-clear counts over the latest `player_profile_snapshots` row
    /// per viewer within the trailing `window_days`.
    pub async fn talent_quest_stats(&self, window_days: i64) -> Result<Vec<(i64, serde_json::Value)>> {
        let rows: Vec<(i64, serde_json::Value)> = query_as(
            "SELECT DISTINCT ON (viewer_id) viewer_id, talent_quest_clear
             FROM player_profile_snapshots
             WHERE collected_at > NOW() - ($1 || ' days')::INTERVAL
             ORDER BY viewer_id, collected_at DESC",
        )
        .bind(window_days)
        .fetch_all(self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Debug, Clone)]
pub struct ClanHistoryPeriod {
    pub collected_at: DateTime<Utc>,
    pub current_period_ranking: i32,
    pub grade_rank: i32,
    pub member_num: i32,
    pub clan_name: String,
    pub leader_name: String,
    pub leader_viewer_id: i64,
    pub ranking: i32,
    pub is_estimate: bool,
}

#[derive(Debug, Clone)]
pub struct PlayerClanHistoryEntry {
    pub period: String,
    pub clan_id: i64,
    pub clan_name: String,
    pub clan_ranking: Option<i32>,
    pub level: i32,
    pub total_power: i64,
    pub player_name: String,
}

#[derive(Debug, Clone)]
pub struct ClanPowerRankingEntry {
    pub rank: i64,
    pub clan_id: i64,
    pub clan_name: String,
    pub avg_power: i64,
    pub member_count: i64,
}

#[derive(Debug, Clone)]
pub struct GrandArenaRankingEntry {
    pub rank: i64,
    pub viewer_id: i64,
    pub user_name: String,
    pub winning_number: i32,
    pub grand_arena_rank: i32,
    pub grand_arena_group: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn period(collected_at: DateTime<Utc>, grade_rank: i32, current_period_ranking: i32) -> ClanHistoryPeriod {
        ClanHistoryPeriod {
            collected_at,
            current_period_ranking,
            grade_rank,
            member_num: 0,
            clan_name: String::new(),
            leader_name: String::new(),
            leader_viewer_id: 0,
            ranking: 0,
            is_estimate: false,
        }
    }

    #[test]
    fn ranking_uses_the_next_periods_grade_rank_except_for_the_latest() {
        let mut periods = vec![
            period(Utc::now() - chrono::Duration::days(60), 5, 9),
            period(Utc::now() - chrono::Duration::days(30), 3, 7),
            period(Utc::now(), 0, 2),
        ];
        let len = periods.len();
        for i in 0..len {
            if i + 1 < len {
                periods[i].ranking = periods[i + 1].grade_rank;
                periods[i].is_estimate = false;
            } else {
                periods[i].ranking = periods[i].current_period_ranking;
                periods[i].is_estimate = true;
            }
        }
        assert_eq!(periods[0].ranking, 3);
        assert!(!periods[0].is_estimate);
        assert_eq!(periods[2].ranking, 2);
        assert!(periods[2].is_estimate);
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[tokio::test]
    async fn idempotent_batch_insert_is_a_no_op_on_replay() {
        let Ok(database_url) = std::env::var("DATABASE_URL") else {
            println!("skipping integration test: DATABASE_URL not set");
            return;
        };
        let pool = crate::db_sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&database_url)
            .await
            .expect("connect");
        crate::db_migrations::run(&pool).await.expect("migrate");

        let store = SnapshotStore::new(&pool);
        let before = store.row_count("clan_snapshots").await.expect("count");

        let snapshot = ClanSnapshot {
            clan_id: 999_999_001,
            collected_at: Some(Utc::now()),
            exist: true,
            ..Default::default()
        };
        store.insert_clan_snapshots(&[snapshot.clone()]).await.expect("insert");
        store.insert_clan_snapshots(&[snapshot]).await.expect("replay insert");

        let after = store.row_count("clan_snapshots").await.expect("count");
        assert_eq!(after - before, 1);
    }

    #[tokio::test]
    async fn clan_power_ranking_averages_the_latest_member_snapshots() {
        let Ok(database_url) = std::env::var("DATABASE_URL") else {
            println!("skipping integration test: DATABASE_URL not set");
            return;
        };
        let pool = crate::db_sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&database_url)
            .await
            .expect("connect");
        crate::db_migrations::run(&pool).await.expect("migrate");

        let store = SnapshotStore::new(&pool);
        let clan_id = 999_999_100;
        let now = Utc::now();
        let members: Vec<PlayerClanSnapshot> = (0..10)
            .map(|i| PlayerClanSnapshot {
                viewer_id: 999_999_200 + i,
                collected_at: Some(now),
                name: format!("member-{i}"),
                level: 50,
                role: 0,
                total_power: 100_000 + i * 1_000,
                join_clan_id: clan_id,
                join_clan_name: "ranked clan".to_string(),
                last_login_time: now,
            })
            .collect();
        store.insert_player_clan_snapshots(&members).await.expect("insert members");

        let ranking = store.clan_power_ranking(50).await.expect("ranking");
        let entry = ranking.iter().find(|r| r.clan_id == clan_id).expect("clan present in ranking");
        assert_eq!(entry.member_count, 10);
        assert!(entry.avg_power >= 100_000);
    }

    #[tokio::test]
    async fn grand_arena_winning_ranking_orders_by_winning_number_descending() {
        let Ok(database_url) = std::env::var("DATABASE_URL") else {
            println!("skipping integration test: DATABASE_URL not set");
            return;
        };
        let pool = crate::db_sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&database_url)
            .await
            .expect("connect");
        crate::db_migrations::run(&pool).await.expect("migrate");

        let store = SnapshotStore::new(&pool);
        let now = Utc::now();
        let group = 42;
        let rows = vec![
            GrandArenaSnapshot {
                viewer_id: 999_999_301,
                collected_at: Some(now),
                user_name: "low".to_string(),
                team_level: 100,
                grand_arena_rank: 2,
                grand_arena_group: group,
                winning_number: 5,
                favorite_unit: 0,
            },
            GrandArenaSnapshot {
                viewer_id: 999_999_302,
                collected_at: Some(now),
                user_name: "high".to_string(),
                team_level: 100,
                grand_arena_rank: 1,
                grand_arena_group: group,
                winning_number: 50,
                favorite_unit: 0,
            },
        ];
        store.insert_grand_arena_snapshots(&rows).await.expect("insert");

        let ranking = store.grand_arena_winning_ranking(group, 10).await.expect("ranking");
        assert_eq!(ranking.first().expect("has entries").viewer_id, 999_999_302);
    }

    #[tokio::test]
    async fn player_clan_history_tracks_membership_by_month() {
        let Ok(database_url) = std::env::var("DATABASE_URL") else {
            println!("skipping integration test: DATABASE_URL not set");
            return;
        };
        let pool = crate::db_sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&database_url)
            .await
            .expect("connect");
        crate::db_migrations::run(&pool).await.expect("migrate");

        let store = SnapshotStore::new(&pool);
        let viewer_id = 999_999_401;
        let clan_id = 999_999_402;
        let now = Utc::now();
        store
            .insert_player_clan_snapshots(&[PlayerClanSnapshot {
                viewer_id,
                collected_at: Some(now),
                name: "history-player".to_string(),
                level: 80,
                role: 1,
                total_power: 200_000,
                join_clan_id: clan_id,
                join_clan_name: "history clan".to_string(),
                last_login_time: now,
            }])
            .await
            .expect("insert member");

        let history = store.player_clan_history(viewer_id).await.expect("history");
        assert!(history.iter().any(|entry| entry.clan_id == clan_id));
    }
}
