//! Tradegate
//!
//! Permission-level risk gating and decision validation for an AI-driven
//! crypto trading loop.

mod api;
mod config;
mod db;
mod debate;
mod exchange;
mod executor;
mod metrics;
mod models;
mod orchestrator;
mod permission;
mod reload;
mod risk;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{DecisionClient, LlmClient};
use crate::config::AppConfig;
use crate::db::Database;
use crate::debate::{
    CounterStore, DebateConfigManager, DebateRateLimiter, DebateSettingsStore, LlmDebateReviewer,
    DEBATE_KEYS,
};
use crate::exchange::PaperExchange;
use crate::models::{Decision, PermissionLevel, TradeAction};
use crate::orchestrator::AppState;
use crate::permission::{Evaluation, LevelTable, PermissionManager, PermissionStore};
use crate::reload::ReloadBus;
use crate::risk::{AccountSnapshot, RiskEventSink, RiskManager, TradeHistory};

/// Tradegate CLI.
#[derive(Parser)]
#[command(name = "tradegate")]
#[command(about = "Risk gating and permission levels for an AI trading loop", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./tradegate.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Account to operate on (defaults to ACCOUNT_ID)
    #[arg(short, long)]
    account: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the permission level table
    Levels,

    /// Change limits of one permission level
    LevelSet {
        /// Level to change (L0-L5)
        level: PermissionLevel,

        /// Maximum position value as a fraction of balance
        #[arg(long)]
        max_position_pct: Option<Decimal>,

        #[arg(long)]
        max_leverage: Option<u32>,

        /// Minimum decision confidence
        #[arg(long)]
        confidence: Option<Decimal>,

        #[arg(long)]
        max_daily_trades: Option<u32>,

        /// Make this the level new accounts start at
        #[arg(long)]
        default: bool,
    },

    /// Show the account's level, limits and debate usage
    Status,

    /// List every known account and its level
    Accounts,

    /// Re-evaluate the account's permission level
    Evaluate {
        /// Current account balance
        #[arg(short, long)]
        balance: Decimal,
    },

    /// Clear protection mode back to the default level
    ResetProtection {
        /// Operator performing the reset
        #[arg(long)]
        by: String,

        /// New drawdown baseline
        #[arg(long)]
        rebase_balance: Option<Decimal>,
    },

    /// Override the account's level
    SetLevel {
        level: PermissionLevel,

        /// Operator performing the change
        #[arg(long)]
        by: String,
    },

    /// List risk events
    Events {
        /// Only unresolved events
        #[arg(long)]
        unresolved: bool,

        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Mark a risk event resolved
    Resolve {
        id: i64,

        /// Operator resolving the event
        #[arg(long)]
        by: String,
    },

    /// Show the permission transition log
    Transitions {
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Validate a hypothetical decision against the account's limits
    Validate {
        /// BUY, SELL or HOLD
        #[arg(long)]
        action: String,

        #[arg(long)]
        size: Decimal,

        #[arg(long)]
        price: Decimal,

        #[arg(long)]
        confidence: Decimal,

        #[arg(long)]
        balance: Decimal,

        /// Current net position in base units
        #[arg(long, default_value = "0")]
        position: Decimal,

        #[arg(long)]
        leverage: Option<u32>,
    },

    /// Debate settings and usage
    Debate {
        #[command(subcommand)]
        command: DebateCommands,
    },

    /// Start the trading loop against the paper exchange
    Run {
        /// Paper account starting balance
        #[arg(long, default_value = "10000")]
        paper_balance: Decimal,

        /// Paper market price of the traded symbol
        #[arg(long, default_value = "65000")]
        paper_price: Decimal,

        /// Start with trading switched off; SIGUSR1 toggles it
        #[arg(long)]
        paused: bool,
    },
}

#[derive(Subcommand)]
enum DebateCommands {
    /// Show debate settings and current counters
    Status,

    /// Clear the current daily and hourly counters
    Reset,

    /// Change one debate setting
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = AppConfig::from_env();
    if let Some(account) = cli.account.clone() {
        config.account_id = account;
    }
    let account_id = config.account_id.clone();

    // Initialize database
    let db = Arc::new(Database::new(&cli.database).await?);

    match cli.command {
        Commands::Levels => {
            let table = db.load_level_table().await?;
            print_levels(&table);
        }

        Commands::LevelSet {
            level,
            max_position_pct,
            max_leverage,
            confidence,
            max_daily_trades,
            default,
        } => {
            let mut rows = db.load_level_table().await?.rows().to_vec();
            if default {
                for row in rows.iter_mut() {
                    row.is_default = row.level == level;
                }
            }
            if let Some(row) = rows.iter_mut().find(|r| r.level == level) {
                if let Some(v) = max_position_pct {
                    row.max_position_pct = v;
                }
                if let Some(v) = max_leverage {
                    row.max_leverage = v;
                }
                if let Some(v) = confidence {
                    row.confidence_threshold = v;
                }
                if let Some(v) = max_daily_trades {
                    row.max_daily_trades = v;
                }
            }

            let table = LevelTable::new(rows).context("Rejected level table change")?;
            db.save_level_table(&table).await?;
            print_levels(&table);
            println!("\nSaved. Send SIGHUP to a running `tradegate run` to apply.");
        }

        Commands::Status => {
            let permissions = permission_manager(&db, &config).await?;
            let state = permissions.ensure_account(&account_id, None).await?;
            let snapshot = permissions.snapshot(&account_id).await?;
            let unresolved = db.get_risk_events(&account_id, true, 1000).await?;
            let usage = debate_limiter(&db, &config).await?.usage().await?;

            println!("\n=== Account {} ===", account_id);
            println!("Level:            {}", state.level);
            println!("Since:            {}", state.entered_at);
            println!("Days at level:    {}", state.days_at_level(chrono::Utc::now()));
            println!(
                "Initial balance:  {}",
                state
                    .initial_balance
                    .map(|b| format!("${:.2}", b))
                    .unwrap_or_else(|| "not set".to_string())
            );
            println!("Loss streak:      {}", state.consecutive_losses);
            if let Some(reason) = &state.protection_reason {
                println!("PROTECTION MODE:  {}", reason);
            }

            println!("\n=== Limits ===");
            println!("Max position:     {}%", snapshot.max_position_pct * dec!(100));
            println!("Max leverage:     {}x", snapshot.max_leverage);
            println!("Min confidence:   {}", snapshot.confidence_threshold);
            println!("Trades per day:   {}", snapshot.max_daily_trades);

            println!("\n=== Risk ===");
            println!("Unresolved events: {}", unresolved.len());

            println!("\n=== Debate ===");
            println!("Today:            {}/{}", usage.daily_count, usage.daily_limit);
            println!("This hour:        {}/{}", usage.hourly_count, usage.hourly_limit);
        }

        Commands::Accounts => {
            let accounts = db.list_accounts().await?;
            if accounts.is_empty() {
                println!("No accounts yet.");
            }
            for state in accounts {
                println!(
                    "{:<20} {:<4} since {} {}",
                    state.account_id,
                    state.level.as_str(),
                    state.entered_at.format("%Y-%m-%d %H:%M"),
                    state.protection_reason.as_deref().unwrap_or("")
                );
            }
        }

        Commands::Evaluate { balance } => {
            let permissions = permission_manager(&db, &config).await?;
            match permissions.evaluate(&account_id, balance).await? {
                Evaluation::NoChange { level, reason } => {
                    println!("No change: {} ({})", level, reason);
                }
                Evaluation::Transition(t) => {
                    println!(
                        "{} -> {} [{}]{}: {}",
                        t.from_level,
                        t.to_level,
                        t.kind,
                        if t.applied { "" } else { " (not applied)" },
                        t.reason
                    );
                }
            }
        }

        Commands::ResetProtection { by, rebase_balance } => {
            let permissions = permission_manager(&db, &config).await?;
            let t = permissions
                .reset_protection(&account_id, &by, rebase_balance)
                .await?;
            println!("{}: {} -> {}", account_id, t.from_level, t.to_level);
        }

        Commands::SetLevel { level, by } => {
            let permissions = permission_manager(&db, &config).await?;
            let t = permissions.set_level(&account_id, level, &by).await?;
            println!("{}: {} -> {}", account_id, t.from_level, t.to_level);
        }

        Commands::Events { unresolved, limit } => {
            let events = db.get_risk_events(&account_id, unresolved, limit).await?;
            if events.is_empty() {
                println!("No risk events.");
                return Ok(());
            }

            println!(
                "\n{:>6} {:<20} {:<22} {:<9} {:<20} {}",
                "ID", "TIME", "TYPE", "SEVERITY", "ACTION", "DESCRIPTION"
            );
            println!("{}", "-".repeat(110));
            for e in events {
                println!(
                    "{:>6} {:<20} {:<22} {:<9} {:<20} {}{}",
                    e.id,
                    e.created_at.format("%Y-%m-%d %H:%M:%S"),
                    e.event_type,
                    e.severity,
                    e.action_taken,
                    truncate(&e.description, 60),
                    if e.resolved { " (resolved)" } else { "" }
                );
            }
        }

        Commands::Resolve { id, by } => {
            if db.resolve_risk_event(id, &by).await? {
                println!("Risk event {} resolved by {}", id, by);
            } else {
                println!("Risk event {} not found or already resolved", id);
            }
        }

        Commands::Transitions { limit } => {
            let log = db.get_transitions(&account_id, limit).await?;
            if log.is_empty() {
                println!("No transitions.");
                return Ok(());
            }

            for t in log {
                println!(
                    "{}  {} -> {}  {:<18} {}{}",
                    t.created_at.format("%Y-%m-%d %H:%M:%S"),
                    t.from_level,
                    t.to_level,
                    t.kind,
                    t.reason,
                    if t.applied { "" } else { " (not applied)" }
                );
            }
        }

        Commands::Validate {
            action,
            size,
            price,
            confidence,
            balance,
            position,
            leverage,
        } => {
            let Some(action) = TradeAction::parse(&action) else {
                bail!("Invalid action '{}', expected BUY, SELL or HOLD", action);
            };
            let mut decision = Decision::new(action, size, confidence);
            if let Some(leverage) = leverage {
                decision = decision.with_leverage(leverage);
            }

            let permissions = permission_manager(&db, &config).await?;
            permissions.ensure_account(&account_id, Some(balance)).await?;
            let snapshot = permissions.snapshot(&account_id).await?;

            let history: Arc<dyn TradeHistory> = db.clone();
            let sink: Arc<dyn RiskEventSink> = db.clone();
            let risk = RiskManager::new(config.risk.clone(), history, sink);
            let account = AccountSnapshot {
                balance,
                current_price: price,
                position_size: position,
            };

            let verdict = risk.validate_decision(&decision, &snapshot, &account).await;
            match verdict.rejection() {
                None => println!("ACCEPTED at {}", snapshot.level),
                Some(r) => println!(
                    "REJECTED [{} / {} / {}]: {}",
                    r.kind.event_type(),
                    r.severity(),
                    r.action(),
                    r.reason
                ),
            }
        }

        Commands::Debate { command } => {
            let limiter = debate_limiter(&db, &config).await?;
            match command {
                DebateCommands::Status => {
                    let settings: Arc<dyn DebateSettingsStore> = db.clone();
                    let current = DebateConfigManager::load(settings, None).await?.current().await;
                    for (key, value) in current.to_pairs() {
                        println!("{:<22} {}", key, value);
                    }
                    let usage = limiter.usage().await?;
                    println!("\nToday:     {}/{}", usage.daily_count, usage.daily_limit);
                    println!("This hour: {}/{}", usage.hourly_count, usage.hourly_limit);
                }
                DebateCommands::Reset => {
                    limiter.reset().await?;
                    println!("Debate counters cleared.");
                }
                DebateCommands::Set { key, value } => {
                    if !DEBATE_KEYS.contains(&key.as_str()) {
                        bail!(
                            "Unknown debate setting '{}', expected one of: {}",
                            key,
                            DEBATE_KEYS.join(", ")
                        );
                    }
                    let settings: Arc<dyn DebateSettingsStore> = db.clone();
                    let manager = DebateConfigManager::load(settings, None).await?;
                    manager.set(&key, &value).await?;
                    println!("{} = {}", key, value.trim());
                    println!("Send SIGHUP to a running `tradegate run` to apply.");
                }
            }
        }

        Commands::Run {
            paper_balance,
            paper_price,
            paused,
        } => {
            info!(
                account = %account_id,
                symbol = %config.symbol,
                paper_balance = %paper_balance,
                "Starting tradegate"
            );

            let exchange = Arc::new(
                PaperExchange::new(paper_balance).with_price(&config.symbol, paper_price),
            );
            let llm = LlmClient::new(config.llm.clone())?;
            let decisions = Arc::new(DecisionClient::new(llm.clone()));
            let reviewer = Arc::new(LlmDebateReviewer::new(llm));

            let state = Arc::new(
                AppState::new(config, db.clone(), exchange, decisions, reviewer, ReloadBus::new())
                    .await?,
            );
            if paused {
                state.set_trading_enabled(false);
            }

            println!("\n=== Tradegate ===");
            println!("Account:  {}", account_id);
            println!("Symbol:   {}", state.config.symbol);
            println!("Interval: {}s", state.config.trading_interval_secs);
            println!("Mode:     PAPER (balance ${}, price ${})", paper_balance, paper_price);
            println!(
                "Trading:  {}",
                if state.trading_enabled() { "ON" } else { "OFF (send SIGUSR1 to enable)" }
            );
            println!("\nPress Ctrl+C to stop.\n");

            orchestrator::run(state.clone()).await?;

            let snapshot = state.permissions.snapshot(&account_id).await?;
            let trades = db.get_trades(&account_id, 1000).await?;
            println!("\n=== Session End ===");
            println!("Level:  {}", snapshot.level);
            println!("Trades: {}", trades.len());
        }
    }

    Ok(())
}

async fn permission_manager(db: &Arc<Database>, config: &AppConfig) -> Result<PermissionManager> {
    let table = db.load_level_table().await?;
    let store: Arc<dyn PermissionStore> = db.clone();
    let history: Arc<dyn TradeHistory> = db.clone();
    Ok(PermissionManager::new(
        Arc::new(RwLock::new(table)),
        store,
        history,
        config.permission.clone(),
    ))
}

async fn debate_limiter(db: &Arc<Database>, config: &AppConfig) -> Result<DebateRateLimiter> {
    let settings: Arc<dyn DebateSettingsStore> = db.clone();
    let counters: Arc<dyn CounterStore> = db.clone();
    let manager = Arc::new(DebateConfigManager::load(settings, None).await?);
    Ok(DebateRateLimiter::new(
        counters,
        manager,
        config.debate_fail_policy,
        config.debate_fail_open_max_streak,
    ))
}

fn print_levels(table: &LevelTable) {
    println!(
        "\n{:<5} {:<12} {:>7} {:>5} {:>6} {:>7} {:>8} {:>8} {:>7} {:>6} {:>8}",
        "LEVEL", "NAME", "MAXPOS", "LEV", "CONF", "TRADES", "UP WR30", "UP MIN", "DN DD", "DN L", "DEFAULT"
    );
    println!("{}", "-".repeat(92));

    let opt = |v: Option<f64>| v.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".to_string());
    let opt_n = |v: Option<u32>| v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());

    for row in table.iter() {
        println!(
            "{:<5} {:<12} {:>6}% {:>4}x {:>6} {:>7} {:>8} {:>8} {:>7} {:>6} {:>8}",
            row.level.as_str(),
            truncate(&row.name, 12),
            (row.max_position_pct * dec!(100)).normalize(),
            row.max_leverage,
            row.confidence_threshold,
            row.max_daily_trades,
            opt(row.upgrade.win_rate_30d),
            opt_n(row.upgrade.min_trades),
            opt(row.downgrade.max_drawdown),
            opt_n(row.downgrade.consecutive_losses),
            if row.is_default { "*" } else { "" }
        );
    }
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
