pub const DEFAULT_SYNC_NUM: usize = 10;
pub const DEFAULT_BATCH_SIZE: usize = 30;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_VERSION_FILE: &str = "./version.txt";
pub const DEFAULT_SCHEDULE_FILE: &str = "./schedule.yaml";
pub const DEFAULT_BASE_URL: &str = "https://api-pcr.example.com";

pub const DEFAULT_NEW_CLAN_ADD: i64 = 100;
pub const FULL_SCAN_CLAN_PROBE: i64 = 500;
pub const DEFAULT_RANK_LIMIT: i32 = 30;
pub const ACTIVE_WINDOW_DAYS: i64 = 30;
pub const ACTIVE_TOTAL_POWER_FLOOR: i64 = 1_000_000;

pub const VIEWER_ID_THRESHOLD: i64 = 1_000_000_000_000;
pub const NPC_VIEWER_ID_FLOOR: i64 = 1_000_000_000;

pub const WORKER_STAGGER_MS: u64 = 500;
pub const RETRY_ATTEMPTS: u32 = 4;
pub const RETRY_SLEEP_SECS: u64 = 2;
pub const MONITOR_TICK_MS: u64 = 200;
pub const PROGRESS_BAR_WIDTH: usize = 30;
pub const RPC_TIMEOUT_SECS: u64 = 600;
pub const MAINTENANCE_FALLBACK_SLEEP_SECS: u64 = 60;

pub const GRAND_ARENA_PAGES: u32 = 10;
pub const GRAND_ARENA_PAGE_SIZE: u32 = 20;
pub const ARENA_DECK_PAGES: u32 = 5;

pub fn database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok()
}

pub fn db_max_connections() -> u32 {
    std::env::var("DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
}

pub fn sync_num() -> usize {
    std::env::var("SYNC_NUM")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_SYNC_NUM)
}

pub fn batch_size() -> usize {
    std::env::var("BATCH_SIZE")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_BATCH_SIZE)
}

pub fn access_key_hint() -> Option<String> {
    std::env::var("PCR_ACCESS_KEY").ok()
}

pub fn base_url() -> String {
    std::env::var("PCR_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

pub fn version_file_path() -> String {
    std::env::var("PCR_VERSION_FILE").unwrap_or_else(|_| DEFAULT_VERSION_FILE.to_string())
}

pub fn schedule_file_path() -> String {
    std::env::var("PCR_SCHEDULE_FILE").unwrap_or_else(|_| DEFAULT_SCHEDULE_FILE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_num_falls_back_to_default_when_unset_or_invalid() {
        temp_env::with_var_unset("SYNC_NUM", || {
            assert_eq!(sync_num(), DEFAULT_SYNC_NUM);
        });
        temp_env::with_var("SYNC_NUM", Some("0"), || {
            assert_eq!(sync_num(), DEFAULT_SYNC_NUM);
        });
        temp_env::with_var("SYNC_NUM", Some("4"), || {
            assert_eq!(sync_num(), 4);
        });
    }

    #[test]
    fn batch_size_rejects_non_numeric_values() {
        temp_env::with_var("BATCH_SIZE", Some("not-a-number"), || {
            assert_eq!(batch_size(), DEFAULT_BATCH_SIZE);
        });
    }
}
