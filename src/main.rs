//! Brokerage Autotrader
//!
//! Trades a watchlist from indicator signals with ATR-based exits, a fixed
//! budget and an automatically refreshed broker session.

mod api;
mod bot;
mod db;
mod error;
mod metrics;
mod models;
mod session;
mod trading;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{HttpBroker, MarketApiClient, OrderModification, RetryPolicy};
use crate::bot::{ControlHandle, TradingCycleController};
use crate::db::{open_store, PersistedConfig, StateStore, DEFAULT_STATE_URL};
use crate::metrics::MetricsCalculator;
use crate::models::{AssetClass, Budget, Instrument};
use crate::session::{
    Credentials, EnvSecondFactor, SecondFactorProvider, SessionConfig, SessionManager,
    StdinSecondFactor,
};
use crate::trading::{CompoundingSettings, HttpSignalProvider, PositionStore, StrategyProfile, TradingConfig};

/// Brokerage trading bot CLI.
#[derive(Parser)]
#[command(name = "autotrader")]
#[command(about = "Trade a watchlist from indicator signals with ATR-based exits", long_about = None)]
struct Cli {
    /// State location: a sqlite: URL or a directory for JSON files
    #[arg(short, long, env = "AUTOTRADER_STATE", default_value = DEFAULT_STATE_URL)]
    state: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the trading loop
    Run {
        /// Budget in account currency
        #[arg(short, long, value_parser = positive_amount)]
        budget: Decimal,

        /// Account currency
        #[arg(long, default_value = "EUR")]
        currency: String,

        /// Seconds between cycles while a market is open
        #[arg(short, long, default_value = "60")]
        interval: u64,

        /// Exit profile
        #[arg(long, value_enum, default_value_t = StrategyProfile::Balanced)]
        strategy: StrategyProfile,

        /// Simulate fills at the quote instead of sending orders
        #[arg(long)]
        dry_run: bool,

        /// Enabled asset classes
        #[arg(short, long = "asset-class", value_delimiter = ',', default_value = "equity,fund")]
        asset_classes: Vec<AssetClass>,

        /// JSON file with the instruments to scan
        #[arg(short, long)]
        watchlist: PathBuf,

        /// JSON file with sizing, filter and fee settings
        #[arg(long)]
        trading_config: Option<PathBuf>,

        /// Share of each cycle's profit added to the budget (0-1)
        #[arg(long, requires = "max_budget", value_parser = unit_fraction)]
        compounding_rate: Option<Decimal>,

        /// Upper bound for a compounded budget
        #[arg(long, value_parser = positive_amount)]
        max_budget: Option<Decimal>,

        /// Skip compounding after a losing cycle
        #[arg(long)]
        pause_after_loss: bool,

        /// Allow short entries on asset classes that support them
        #[arg(long)]
        allow_short: bool,

        /// Key for the persisted state
        #[arg(long, default_value = "default")]
        session_id: String,

        /// Indicator service base URL
        #[arg(long, env = "INDICATOR_URL", default_value = "http://localhost:8000")]
        signals_url: String,
    },

    /// Log in once to check credentials and the second factor
    Login,

    /// Show budget and open positions of a saved session
    Status {
        #[arg(long, default_value = "default")]
        session_id: String,

        /// Also log in and show broker cash and market status
        #[arg(long)]
        live: bool,
    },

    /// Show closed trades and performance of a saved session
    History {
        #[arg(long, default_value = "default")]
        session_id: String,

        /// Number of most recent trades to list
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show the configuration a session runs with (defaults without a session)
    Config {
        #[arg(long)]
        session_id: Option<String>,
    },

    /// Search the broker's instruments by name or ISIN
    Search {
        query: String,

        /// Only this asset class
        #[arg(short, long = "asset-class")]
        asset_class: Option<AssetClass>,
    },

    /// Show quote and top of book for an instrument
    Quote { isin: String },

    /// Inspect or change a working order
    Order {
        #[command(subcommand)]
        action: OrderAction,
    },
}

#[derive(Subcommand)]
enum OrderAction {
    /// Show the broker's status for an order
    Show { order_id: String },

    /// Cancel a working order
    Cancel { order_id: String },

    /// Change quantity or limit price of a working order
    Modify {
        order_id: String,

        #[arg(long, value_parser = positive_amount)]
        quantity: Option<Decimal>,

        #[arg(long, value_parser = positive_amount)]
        limit_price: Option<Decimal>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let store: Arc<dyn StateStore> = Arc::from(open_store(&cli.state).await?);

    match cli.command {
        Commands::Run {
            budget,
            currency,
            interval,
            strategy,
            dry_run,
            asset_classes,
            watchlist,
            trading_config,
            compounding_rate,
            max_budget,
            pause_after_loss,
            allow_short,
            session_id,
            signals_url,
        } => {
            let watchlist = load_watchlist(&watchlist)?;
            let mut trading = match trading_config {
                Some(path) => load_json::<TradingConfig>(&path)?,
                None => TradingConfig::default(),
            };
            trading.profile = strategy;
            trading.allow_short |= allow_short;

            let compounding = CompoundingSettings {
                rate: compounding_rate,
                max_budget,
                pause_after_loss,
            };
            let config = PersistedConfig {
                strategy,
                interval_secs: interval,
                dry_run,
                asset_classes,
                watchlist,
                compounding,
                trading,
            };

            let positions = match store.load(&session_id).await? {
                Some(document) => {
                    info!(
                        session = %session_id,
                        open = document.positions.len(),
                        trades = document.history.len(),
                        remaining = %document.budget.remaining,
                        "Resuming saved session"
                    );
                    if budget != document.budget.initial {
                        warn!(
                            saved = %document.budget.initial,
                            "Keeping the saved budget, --budget is ignored for an existing session"
                        );
                    }
                    PositionStore::restore(document.budget, document.positions, document.history)
                        .context("Saved state is inconsistent")?
                }
                None => {
                    let mut initial = Budget::new(budget, currency);
                    if let Some(max) = config.compounding.max_budget {
                        initial = initial.with_max_budget(max);
                    }
                    PositionStore::new(initial)
                }
            };

            let broker = Arc::new(HttpBroker::from_env()?);
            let session = SessionManager::new(broker.clone(), Credentials::from_env()?, SessionConfig::default());
            let metadata = session.login(second_factor().as_ref()).await?;
            info!(expires_at = %metadata.expires_at, "Logged in");

            let api = MarketApiClient::new(broker, session.clone(), RetryPolicy::default());
            let signals = Arc::new(HttpSignalProvider::new(signals_url, RetryPolicy::default())?);

            println!("\n=== Brokerage Autotrader ===");
            println!("Session:          {}", session_id);
            println!("Budget:           {} {}", positions.budget().cap, positions.budget().currency);
            println!("Strategy:         {}", strategy);
            println!("Interval:         {}s", interval);
            println!("Asset classes:    {}", join(&config.asset_classes));
            println!("Watchlist:        {} instruments", config.watchlist.len());
            println!("Mode:             {}", if dry_run { "DRY RUN (no real orders)" } else { "LIVE TRADING" });
            println!("State:            {}", store.describe());
            println!("\nPress Ctrl+C or type 'stop' to stop. 'close <ISIN|position id>' closes a position.\n");

            let mut controller =
                TradingCycleController::new(&session_id, config, api, signals, store.clone(), positions);
            spawn_console(controller.handle());
            let result = controller.run().await;
            session.logout().await;

            let history = controller.positions().history();
            let metrics = MetricsCalculator::calculate(history);
            println!("\n=== Session Summary ===");
            println!("Closed trades:    {}", metrics.total_trades);
            println!("Net P&L:          {}", metrics.total_pnl);
            println!("Open positions:   {}", controller.positions().active_count());
            println!("Unrealized P&L:   {}", controller.positions().unrealized_pnl().round_dp(2));
            println!("Budget remaining: {}", controller.positions().budget().remaining);

            result?;
        }

        Commands::Login => {
            let broker = Arc::new(HttpBroker::from_env()?);
            let session = SessionManager::new(broker, Credentials::from_env()?, SessionConfig::default());
            let metadata = session.login(second_factor().as_ref()).await?;

            println!("\nLogin successful");
            println!("Authenticated at: {}", metadata.authenticated_at);
            println!("Expires at:       {}", metadata.expires_at);
            session.logout().await;
        }

        Commands::Status { session_id, live } => {
            let Some(document) = store.load(&session_id).await? else {
                println!("No saved session '{}'. Run 'autotrader run' to start one.", session_id);
                let known = store.session_ids().await?;
                if !known.is_empty() {
                    println!("Known sessions: {}", known.join(", "));
                }
                return Ok(());
            };

            let budget = &document.budget;
            println!("\n=== Session {} ===", document.session_id);
            println!("Updated:          {}", document.updated_at);
            if let Some(session) = &document.session {
                println!("Authenticated:    {}", session.authenticated_at);
            }
            println!("Strategy:         {}", document.config.strategy);
            println!("Dry run:          {}", document.config.dry_run);

            println!("\n=== Budget ===");
            println!("Initial:          {} {}", budget.initial, budget.currency);
            println!("Cap:              {}", budget.cap);
            println!("Remaining:        {}", budget.remaining);
            println!("Banked profit:    {}", budget.banked_profit);
            if budget.uncovered_loss > Decimal::ZERO {
                println!("Uncovered loss:   {}", budget.uncovered_loss);
            }

            if !document.positions.is_empty() {
                println!("\n=== Positions ===");
                for pos in &document.positions {
                    let pnl_sign = if pos.unrealized_pnl >= Decimal::ZERO { "+" } else { "" };
                    println!(
                        "  {:<14} {:<20} {:>12} {:?} {} @ {} -> {} ({}{}) SL {} TP {}",
                        pos.instrument_id,
                        truncate(&pos.name, 20),
                        pos.state.to_string(),
                        pos.side,
                        pos.size,
                        pos.entry_price,
                        pos.current_price,
                        pnl_sign,
                        pos.unrealized_pnl.round_dp(2),
                        pos.dynamic_stop_loss.round_dp(2),
                        pos.dynamic_take_profit.round_dp(2),
                    );
                }
            }

            if live {
                let (session, api) = connect().await?;

                let cash = api.get_cash_balance().await?;
                println!("\n=== Broker ===");
                println!("Cash available:   {} {}", cash.available, cash.currency);
                for class in &document.config.asset_classes {
                    let status = api.get_market_status(*class).await?;
                    let next = status
                        .next_open
                        .map(|t| format!(" (opens {})", t))
                        .unwrap_or_default();
                    println!(
                        "  {:<12} {}{}",
                        class.to_string(),
                        if status.open { "open" } else { "closed" },
                        next
                    );
                }
                session.logout().await;
            }
        }

        Commands::History { session_id, limit } => {
            let Some(document) = store.load(&session_id).await? else {
                println!("No saved session '{}'.", session_id);
                return Ok(());
            };

            let metrics = MetricsCalculator::calculate(&document.history);
            println!("\n=== Performance ===");
            println!("Trades:           {}", metrics.total_trades);
            println!("Win rate:         {:.1}%", metrics.win_rate * 100.0);
            println!("Net P&L:          {}", metrics.total_pnl);
            println!("Fees:             {}", metrics.total_fees);
            println!("Avg win / loss:   {} / {}", metrics.avg_win.round_dp(2), metrics.avg_loss.round_dp(2));
            println!("Profit factor:    {:.2}", metrics.profit_factor);
            println!("Expectancy:       {}", metrics.expectancy.round_dp(2));
            println!("Max drawdown:     {:.2}%", metrics.max_drawdown * 100.0);
            println!("Sharpe (per trade): {:.2}", metrics.sharpe_ratio);
            if let Some(kelly) = metrics.kelly_fraction(document.config.trading.kelly_min_trades) {
                println!("Kelly fraction:   {:.3}", kelly);
            }

            if !document.history.is_empty() {
                println!("\n{:<20} {:<14} {:>10} {:>10} {:>10} {:<14}", "CLOSED", "INSTRUMENT", "ENTRY", "EXIT", "P&L", "REASON");
                println!("{}", "-".repeat(82));
                for trade in document.history.iter().rev().take(limit) {
                    println!(
                        "{:<20} {:<14} {:>10} {:>10} {:>10} {:<14}",
                        trade.exit_time.format("%Y-%m-%d %H:%M"),
                        trade.instrument_id,
                        trade.entry_price.round_dp(2),
                        trade.exit_price.round_dp(2),
                        trade.realized_pnl.round_dp(2),
                        trade.exit_reason.to_string(),
                    );
                }
            }
        }

        Commands::Config { session_id } => {
            let config = match session_id {
                Some(id) => match store.load(&id).await? {
                    Some(document) => document.config.trading,
                    None => bail!("No saved session '{}'", id),
                },
                None => TradingConfig::default(),
            };
            let multipliers = config.profile.multipliers();

            println!("\n=== Trading Configuration ===\n");
            println!("Exit Profile:         {}", config.profile);
            println!("  Take Profit:        {} x ATR", multipliers.take_profit);
            println!("  Stop Loss:          {} x ATR", multipliers.stop_loss);
            println!("  Trailing After:     {} x ATR", multipliers.trailing_activation);
            println!("  Trailing Distance:  {} x ATR", multipliers.trailing_distance);

            println!("\nPosition Sizing:");
            println!("  Base Fraction:      {}", config.base_fraction);
            println!("  Target Volatility:  {}", config.target_volatility);
            println!("  Volatility Scale:   {} - {}", config.min_volatility_scale, config.max_volatility_scale);
            println!("  Fallback Fraction:  {}", config.fallback_fraction);
            println!("  Max Position:       {}", config.max_position_fraction);
            println!("  Min Order:          {}", config.min_order_notional);
            println!("  Kelly:              {:?} x {} (after {} trades)", config.kelly_mode, config.kelly_multiplier, config.kelly_min_trades);

            println!("\nEntry Filters:");
            println!("  Min Profit After Fees: {}", config.min_profit_after_fees);
            println!("  Max Spread:         {}", config.max_spread_pct);
            println!("  Max Positions:      {}", config.max_concurrent_positions);
            println!("  Allow Short:        {}", config.allow_short);
            println!("  Neutral Below:      {}", config.neutrality_threshold);

            println!("\nFees:");
            println!("  Fixed:              {}", config.fee_fixed);
            println!("  Percentage:         {}", config.fee_pct);

            println!("\nOrders:");
            println!("  Entry Timeout:      {}s", config.pending_entry_timeout_secs);
        }

        Commands::Search { query, asset_class } => {
            let (session, api) = connect().await?;
            let results = api.search_instruments(&query, asset_class).await;
            session.logout().await;
            let results = results?;

            if results.is_empty() {
                println!("No instruments match '{}'", query);
                return Ok(());
            }
            println!("\n{:<14} {:<40} {:<12} {}", "ISIN", "NAME", "CLASS", "TRADABLE");
            println!("{}", "-".repeat(76));
            for info in &results {
                println!(
                    "{:<14} {:<40} {:<12} {}",
                    info.isin,
                    truncate(&info.name, 40),
                    info.asset_class.to_string(),
                    if info.tradable { "yes" } else { "no" }
                );
            }
        }

        Commands::Quote { isin } => {
            let (session, api) = connect().await?;
            let quote = api.get_price(&isin).await;
            let book = api.get_order_book(&isin).await;
            session.logout().await;
            let quote = quote?;

            println!("\n=== {} ===", quote.isin);
            println!("Bid / Ask:        {} / {}", quote.bid, quote.ask);
            if let Some(spread) = quote.spread_pct() {
                println!("Spread:           {:.3}%", spread * Decimal::ONE_HUNDRED);
            }
            if let Some(last) = quote.last {
                println!("Last:             {}", last);
            }
            println!("Quoted at:        {}", quote.timestamp);
            match book {
                Ok(book) => {
                    let level = |price: Option<Decimal>| price.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
                    println!("Book:             {} bids, {} asks", book.bids.len(), book.asks.len());
                    println!("Best bid / ask:   {} / {}", level(book.best_bid()), level(book.best_ask()));
                }
                Err(e) => warn!(error = %e, "Order book unavailable"),
            }
        }

        Commands::Order { action } => {
            let (session, api) = connect().await?;
            let status = match action {
                OrderAction::Show { order_id } => api.get_order(&order_id).await,
                OrderAction::Cancel { order_id } => api.cancel_order(&order_id).await,
                OrderAction::Modify {
                    order_id,
                    quantity,
                    limit_price,
                } => {
                    let change = OrderModification { quantity, limit_price };
                    api.modify_order(&order_id, &change).await
                }
            };
            session.logout().await;
            let status = status?;

            println!("\n=== Order {} ===", status.order_id);
            println!("Client id:        {}", status.client_order_id);
            println!("Instrument:       {}", status.isin);
            println!("Side:             {:?}", status.side);
            println!("State:            {:?}", status.state);
            println!("Filled:           {}", status.filled_quantity);
            if let Some(price) = status.average_fill_price {
                println!("Average price:    {}", price);
            }
            if let Some(fee) = status.fee {
                println!("Fee:              {}", fee);
            }
            if let Some(reason) = &status.reason {
                println!("Reason:           {}", reason);
            }
        }
    }

    Ok(())
}

/// Log in with credentials from the environment and build a client.
async fn connect() -> Result<(SessionManager, MarketApiClient)> {
    let broker = Arc::new(HttpBroker::from_env()?);
    let session = SessionManager::new(broker.clone(), Credentials::from_env()?, SessionConfig::default());
    session.login(second_factor().as_ref()).await?;
    let api = MarketApiClient::new(broker, session.clone(), RetryPolicy::default());
    Ok((session, api))
}

/// Commands typed on stdin while the loop runs.
#[derive(Debug, PartialEq)]
enum ConsoleCommand {
    Close(String),
    Stop,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("stop" | "quit"), None, _) => Ok(ConsoleCommand::Stop),
            (Some("close"), Some(target), None) => Ok(ConsoleCommand::Close(target.to_string())),
            _ => Err(format!("unknown command '{}', expected 'close <ISIN|position id>' or 'stop'", line.trim())),
        }
    }
}

/// Read console commands on a plain thread so a pending read never holds up
/// runtime shutdown.
fn spawn_console(handle: ControlHandle) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<ConsoleCommand>() {
                Ok(ConsoleCommand::Close(target)) => {
                    if !handle.request_close(target.clone()) {
                        break;
                    }
                    info!(requested = %target, "Close queued for the next cycle");
                }
                Ok(ConsoleCommand::Stop) => {
                    info!("Stop requested from console");
                    handle.stop();
                    break;
                }
                Err(e) => warn!("{}", e),
            }
        }
    });
}

fn positive_amount(s: &str) -> Result<Decimal, String> {
    let amount = Decimal::from_str(s.trim()).map_err(|e| format!("not a number: {}", e))?;
    if amount <= Decimal::ZERO {
        return Err(format!("must be greater than zero, got {}", amount));
    }
    Ok(amount)
}

fn unit_fraction(s: &str) -> Result<Decimal, String> {
    let value = positive_amount(s)?;
    if value > Decimal::ONE {
        return Err(format!("must be at most 1, got {}", value));
    }
    Ok(value)
}

/// Code from `BROKER_SECOND_FACTOR` when set, otherwise a prompt.
fn second_factor() -> Box<dyn SecondFactorProvider> {
    if std::env::var("BROKER_SECOND_FACTOR").is_ok() {
        Box::new(EnvSecondFactor)
    } else {
        Box::new(StdinSecondFactor)
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

fn load_watchlist(path: &Path) -> Result<Vec<Instrument>> {
    let watchlist: Vec<Instrument> = load_json(path)?;
    if watchlist.is_empty() {
        bail!("Watchlist {} is empty", path.display());
    }
    Ok(watchlist)
}

fn join(classes: &[AssetClass]) -> String {
    classes.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(", ")
}

/// Truncate a string to max length with ellipsis.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
