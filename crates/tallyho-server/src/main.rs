use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use tallyho_core::poll::{self, CreatePoll};
use tallyho_core::{duration, leaderboard, observability, sweeper, vote, AppState};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

use cli::Command;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let mut config = config::Config::load(&args.config)?;
    if let Some(url) = args.database_url {
        config.database.url = url;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    ensure_data_dir(&config.database.url);
    let db = tallyho_db::create_pool(&config.database.url, config.database.max_connections)
        .await
        .with_context(|| format!("opening database {}", config.database.url))?;
    tallyho_db::run_migrations(&db).await?;

    let state = AppState::new(db, config.engine());

    match args.command {
        Command::Run => run(state, &config).await,
        Command::CreatePoll {
            guild,
            category,
            question,
            description,
            creator,
            options,
            max_selections,
            duration: duration_text,
            show_votes,
        } => {
            let request = CreatePoll {
                guild_id: guild,
                category,
                question,
                description,
                creator_id: creator,
                options,
                max_selections,
                duration: duration::parse_duration(&duration_text)?,
                show_votes_while_active: show_votes,
            };
            print_json(&poll::create_poll(&state, request).await?)
        }
        Command::Close { poll: poll_id } => print_json(&poll::close_poll(&state, poll_id).await?),
        Command::Reveal {
            poll: poll_id,
            correct,
            close,
        } => {
            let outcome = if close {
                poll::close_and_reveal_poll(&state, poll_id, &correct).await?
            } else {
                poll::reveal_poll(&state, poll_id, &correct).await?
            };
            print_json(&outcome)
        }
        Command::SetEnd {
            poll: poll_id,
            end_time,
        } => {
            let end_time: DateTime<Utc> = end_time
                .parse()
                .with_context(|| format!("invalid end time '{end_time}', expected RFC 3339"))?;
            print_json(&poll::set_end_time(&state, poll_id, end_time).await?)
        }
        Command::Toggle {
            poll: poll_id,
            participant,
            option,
        } => print_json(&vote::toggle_selection(&state, poll_id, participant, option).await?),
        Command::Vote {
            poll: poll_id,
            participant,
            options,
        } => print_json(&vote::replace_selections(&state, poll_id, participant, &options).await?),
        Command::Results { poll: poll_id } => {
            #[derive(Serialize)]
            struct PollWithResults {
                poll: tallyho_models::Poll,
                results: tallyho_models::PollResults,
            }
            print_json(&PollWithResults {
                poll: poll::get_poll(&state, poll_id).await?,
                results: poll::poll_results(&state, poll_id).await?,
            })
        }
        Command::Leaderboard {
            guild,
            category,
            limit,
        } => print_json(&leaderboard::get_leaderboard(&state, guild, &category, limit).await?),
        Command::Stats {
            guild,
            category,
            participant,
        } => print_json(&leaderboard::participant_stats(&state, guild, &category, participant).await?),
        Command::Refresh { guild, category } => {
            print_json(&leaderboard::force_full_refresh(&state, guild, &category).await?)
        }
        Command::Sweep => print_json(&sweeper::sweep(&state, Utc::now()).await?),
    }
}

async fn run(state: AppState, config: &config::Config) -> Result<()> {
    let interval = config.sweep_interval();
    tracing::info!(
        database = %config.database.url,
        interval_secs = interval.as_secs(),
        "tallyho running"
    );

    let shutdown = Arc::new(Notify::new());
    let sweeper_task = tokio::spawn(sweeper::run(state, interval, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    shutdown.notify_one();
    sweeper_task.await?;

    let metrics = observability::engine_metrics_snapshot();
    tracing::info!(
        polls_closed_by_sweeper = metrics.polls_closed_by_sweeper,
        sweep_failures = metrics.sweep_failures,
        storage_retries = metrics.storage_retries.iter().map(|(_, n)| n).sum::<u64>(),
        "sweeper stopped"
    );
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Create the parent directory of a file-backed SQLite database.
fn ensure_data_dir(database_url: &str) {
    if let Some(db_path) = database_url
        .strip_prefix("sqlite://")
        .and_then(|s| s.split('?').next())
    {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    tracing::warn!("Could not create directory '{}': {}", parent.display(), e);
                }
            }
        }
    }
}
