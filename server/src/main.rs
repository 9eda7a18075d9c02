mod client;
mod codec;
mod config;
mod db_migrations;
mod db_sqlx;
mod error;
mod pipelines;
mod queue;
mod registry;
mod scheduler;
mod store;
mod task_log;
mod version_store;

extern crate self as sqlx;
pub use crate::db_sqlx::{PgPool, Postgres, QueryBuilder, postgres, query, query_as, query_scalar};

use std::sync::Arc;

use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use crate::pipelines::{arena_deck, clan, grand_arena, player_profile};
use crate::version_store::VersionStore;

#[derive(Parser)]
#[command(author, version, about = "Regional-server collection core for clan, player and arena snapshots")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one pipeline to completion and exit.
    Task {
        /// clan_sync | player_profile_sync | player_profile_sync_monthly | grand_sync | arena_deck_sync
        name: String,
        /// key=value pairs, e.g. rank_limit=50 or new_clan_add=200
        #[arg(long = "args", value_delimiter = ',')]
        args: Vec<String>,
    },
    /// Run the long-lived scheduler daemon.
    Schedule,
}

fn parse_task_args(raw: &[String]) -> std::collections::HashMap<String, i64> {
    raw.iter()
        .filter_map(|kv| {
            let (key, value) = kv.split_once('=')?;
            value.trim().parse::<i64>().ok().map(|v| (key.trim().to_string(), v))
        })
        .collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let database_url = match config::database_url() {
        Some(value) => value,
        None => {
            tracing::error!("DATABASE_URL is required to run the collection core");
            std::process::exit(1);
        }
    };
    let db = match PgPoolOptions::new()
        .max_connections(config::db_max_connections())
        .connect(&database_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to PostgreSQL");
            std::process::exit(1);
        }
    };
    if let Err(e) = db_migrations::run(&db).await {
        tracing::error!(error = %e, "failed to run migrations");
        std::process::exit(1);
    }
    tracing::info!("database connected and migrations applied");

    let base_url = config::base_url();
    let version_store = Arc::new(VersionStore::new(config::version_file_path()));

    match cli.command {
        Command::Task { name, args } => {
            let args = parse_task_args(&args);
            let result = match name.as_str() {
                "clan_sync" => {
                    let new_clan_add = args.get("new_clan_add").copied().unwrap_or(config::DEFAULT_NEW_CLAN_ADD);
                    clan::run(&db, base_url, version_store, new_clan_add).await
                }
                "player_profile_sync" => {
                    let rank_limit = args.get("rank_limit").copied().unwrap_or(config::DEFAULT_RANK_LIMIT as i64) as i32;
                    player_profile::run(&db, base_url, version_store, player_profile::ProfileMode::TopClans, rank_limit).await
                }
                "player_profile_sync_monthly" => {
                    player_profile::run(&db, base_url, version_store, player_profile::ProfileMode::ActiveAll, config::DEFAULT_RANK_LIMIT).await
                }
                "grand_sync" => grand_arena::run(&db, base_url, version_store).await,
                "arena_deck_sync" => arena_deck::run(&db, base_url, version_store).await,
                other => {
                    tracing::error!(
                        task = other,
                        "unknown task name; expected one of clan_sync, player_profile_sync, \
                         player_profile_sync_monthly, grand_sync, arena_deck_sync"
                    );
                    std::process::exit(1);
                }
            };
            if let Err(e) = result {
                tracing::error!(task = %name, error = %e, "task failed");
                std::process::exit(1);
            }
        }
        Command::Schedule => {
            let path = config::schedule_file_path();
            let Some(schedule_config) = scheduler::load_schedule_config(&path) else {
                tracing::error!(path, "could not load schedule config, exiting");
                std::process::exit(1);
            };
            tracing::info!("scheduler ready, ticking every minute");
            scheduler::run(db, base_url, version_store, schedule_config).await;
        }
    }
}
