use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, Utc};
use clap::Parser;
use tracing::info;

use flowgate::config::AppConfig;
use flowgate::db::Db;
use flowgate::repo::Repository;

/// Dialect-aware database gateway for tunnel management backends
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long = "config", default_value = "flowgate.toml")]
    config: PathBuf,

    /// Only open the database, ping it and exit
    #[arg(long = "check")]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    let db = Db::open(&config.database)
        .await
        .context("opening database")?;
    db.ping().await.context("pinging database")?;

    let dialect = config.database.dialect()?;
    info!(%dialect, "database reachable");

    let repo = Repository::new(db);
    if !cli.check {
        run_maintenance_sweep(&repo).await?;
    }
    repo.close();
    Ok(())
}

/// One pass of the periodic housekeeping the scheduler would otherwise run:
/// reset monthly counters on the matching day, expire users and user tunnels
/// (pausing their forwards first), and record the hourly traffic snapshot.
async fn run_maintenance_sweep(repo: &Repository) -> Result<()> {
    let now = Utc::now();
    let now_ms = now.timestamp_millis();

    let today = i64::from(now.day());
    let last_day = i64::from(last_day_of_month(now.year(), now.month()));
    let users_reset = repo.reset_user_monthly_flow(today, last_day).await?;
    let tunnels_reset = repo.reset_user_tunnel_monthly_flow(today, last_day).await?;

    let users_expired = repo.disable_expired_users(now_ms).await?;
    let tunnels_expired = repo.disable_expired_user_tunnels(now_ms).await?;

    repo.record_hourly_flow_snapshot(now).await?;

    info!(
        users_reset,
        tunnels_reset,
        users_expired,
        tunnels_expired,
        "maintenance sweep complete"
    );
    Ok(())
}

/// Day number of the last day of the month: the first of the next month,
/// stepped back one day.
fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map_or(28, |d| d.day())
}
