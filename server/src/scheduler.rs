use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Timelike, Utc};
use serde::Deserialize;

use crate::config;
use crate::db_sqlx::PgPool;
use crate::pipelines::{arena_deck, clan, grand_arena, player_profile};
use crate::version_store::VersionStore;

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub tasks: HashMap<String, TaskConfig>,
}

pub fn load_schedule_config(path: &str) -> Option<ScheduleConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| tracing::error!(path, error = %e, "schedule config not found"))
        .ok()?;
    serde_yaml::from_str(&contents)
        .map_err(|e| tracing::error!(path, error = %e, "schedule config is not valid yaml"))
        .ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DayOfMonth {
    Any,
    Exact(Vec<u32>),
    LastMinusN(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedCron {
    minute: u32,
    hour: u32,
    day_of_month: DayOfMonth,
}

/// Mirrors the original scheduler's three supported shapes: daily (`* * *`), a fixed set of
/// days-of-month (`D * *`, commas or an `L`/`L-N` suffix allowed), and nothing else — any
/// other combination (a day-of-week filter, a month filter) is logged and skipped at
/// load time rather than at dispatch time.
fn parse_cron(expr: &str) -> Option<ParsedCron> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() != 5 {
        tracing::error!(expr, "cron expression must have 5 fields");
        return None;
    }
    let [minute, hour, day_of_month, month, day_of_week] = [parts[0], parts[1], parts[2], parts[3], parts[4]];
    let minute: u32 = minute.parse().ok()?;
    let hour: u32 = hour.parse().ok()?;

    if day_of_week != "*" {
        tracing::warn!(expr, "unsupported cron expression (day-of-week filters are not supported), skipping");
        return None;
    }

    if day_of_month == "*" && month == "*" {
        return Some(ParsedCron { minute, hour, day_of_month: DayOfMonth::Any });
    }

    if day_of_month != "*" && month == "*" {
        let day_of_month = parse_days_of_month(day_of_month)?;
        return Some(ParsedCron { minute, hour, day_of_month });
    }

    tracing::warn!(expr, "unsupported cron expression, skipping");
    None
}

fn parse_days_of_month(expr: &str) -> Option<DayOfMonth> {
    if let Some(rest) = expr.strip_prefix('L') {
        let offset = if let Some(n) = rest.strip_prefix('-') { n.parse().ok()? } else { 0 };
        return Some(DayOfMonth::LastMinusN(offset));
    }
    let days: Option<Vec<u32>> = expr.split(',').map(|d| d.trim().parse().ok()).collect();
    days.map(DayOfMonth::Exact)
}

fn last_day_offset(year: i32, month: u32, offset: u32) -> u32 {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("month is always in 1..=12");
    let last_day = first_of_next.pred_opt().expect("first-of-month always has a predecessor").day();
    last_day.saturating_sub(offset)
}

fn day_matches(day_of_month: &DayOfMonth, year: i32, month: u32, day: u32) -> bool {
    match day_of_month {
        DayOfMonth::Any => true,
        DayOfMonth::Exact(days) => days.contains(&day),
        DayOfMonth::LastMinusN(offset) => day == last_day_offset(year, month, *offset),
    }
}

async fn dispatch(pool: &PgPool, base_url: String, version_store: Arc<VersionStore>, task_name: &str, task_config: &TaskConfig) {
    tracing::info!(task_name, "running scheduled task");
    let result = match task_name {
        "clan_sync" => clan::run(pool, base_url, version_store, config::DEFAULT_NEW_CLAN_ADD).await,
        "player_profile_sync" => {
            let rank_limit = task_config
                .params
                .get("rank_limit")
                .and_then(|v| v.as_i64())
                .map(|v| v as i32)
                .unwrap_or(config::DEFAULT_RANK_LIMIT);
            player_profile::run(pool, base_url, version_store, player_profile::ProfileMode::TopClans, rank_limit).await
        }
        "player_profile_sync_monthly" => {
            player_profile::run(pool, base_url, version_store, player_profile::ProfileMode::ActiveAll, config::DEFAULT_RANK_LIMIT).await
        }
        "grand_sync" => grand_arena::run(pool, base_url, version_store).await,
        "arena_deck_sync" => arena_deck::run(pool, base_url, version_store).await,
        _ => {
            tracing::warn!(task_name, "unknown task in schedule config");
            return;
        }
    };
    if let Err(e) = result {
        tracing::error!(task_name, error = %e, "scheduled task failed");
    }
}

/// Ticks once a minute (matching the original's `time.sleep(60)` loop), running every
/// configured task whose cron expression matches the current minute. Tasks run inline: a
/// long-running task blocks the next tick rather than overlapping itself (§9 OQ-2).
pub async fn run(pool: PgPool, base_url: String, version_store: Arc<VersionStore>, config: ScheduleConfig) {
    let mut parsed: Vec<(String, TaskConfig, ParsedCron)> = Vec::new();
    for (task_name, task_config) in config.tasks {
        if !task_config.enabled {
            tracing::info!(task_name, "task is disabled, skipping");
            continue;
        }
        if task_config.schedule.is_empty() {
            tracing::warn!(task_name, "task has no schedule configured, skipping");
            continue;
        }
        match parse_cron(&task_config.schedule) {
            Some(cron) => {
                tracing::info!(task_name, schedule = %task_config.schedule, description = %task_config.description, "scheduled task");
                parsed.push((task_name, task_config, cron));
            }
            None => tracing::error!(task_name, schedule = %task_config.schedule, "failed to parse cron expression for task"),
        }
    }

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        interval.tick().await;
        let now = Utc::now();
        for (task_name, task_config, cron) in &parsed {
            if cron.minute == now.minute() && cron.hour == now.hour() && day_matches(&cron.day_of_month, now.year(), now.month(), now.day()) {
                dispatch(&pool, base_url.clone(), version_store.clone(), task_name, task_config).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_cron_parses_with_an_any_day_of_month() {
        let cron = parse_cron("30 3 * * *").expect("should parse");
        assert_eq!(cron, ParsedCron { minute: 30, hour: 3, day_of_month: DayOfMonth::Any });
    }

    #[test]
    fn comma_separated_days_parse_as_an_exact_set() {
        let cron = parse_cron("0 3 1,11,21 * *").expect("should parse");
        assert_eq!(cron.day_of_month, DayOfMonth::Exact(vec![1, 11, 21]));
    }

    #[test]
    fn bare_l_means_the_last_day_of_the_month() {
        let cron = parse_cron("0 3 L * *").expect("should parse");
        assert_eq!(cron.day_of_month, DayOfMonth::LastMinusN(0));
    }

    #[test]
    fn l_minus_n_subtracts_directly_from_the_last_day() {
        assert_eq!(last_day_offset(2026, 1, 3), 28);
    }

    #[test]
    fn day_of_week_filters_are_unsupported() {
        assert!(parse_cron("0 3 * * 1").is_none());
    }

    #[test]
    fn a_day_and_month_filter_together_is_unsupported() {
        assert!(parse_cron("0 3 15 6 *").is_none());
    }

    #[test]
    fn last_minus_three_on_a_thirty_one_day_month_fires_on_day_twenty_eight() {
        assert_eq!(last_day_offset(2026, 1, 3), 28);
        assert!(day_matches(&DayOfMonth::LastMinusN(3), 2026, 1, 28));
        assert!(!day_matches(&DayOfMonth::LastMinusN(3), 2026, 1, 29));
    }
}
