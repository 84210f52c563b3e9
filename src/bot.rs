//! Trading cycle controller: the single loop that owns positions and budget.
//!
//! One cycle, in order:
//! 1. Ensure the broker session is usable
//! 2. Skip to scheduling when every enabled market is closed
//! 3. Refresh cash and portfolio, reconcile orders left working
//! 4. Update exit levels and submit exits
//! 5. Compound realized gains into the budget
//! 6. Scan the watchlist and submit entries
//! 7. Persist state
//! 8. Sleep until the next cycle
//!
//! A stop request is observed between steps and during the sleep, never
//! while an order is being submitted.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::api::{MarketApiClient, OrderRequest, OrderSide, OrderStatus, Quote};
use crate::db::{PersistedConfig, StateDocument, StateStore};
use crate::error::{AuthenticationError, ErrorCategory, InvariantViolation, TradingError, TransportError};
use crate::metrics::MetricsCalculator;
use crate::models::{AssetClass, ExitReason, Instrument, Position, PositionSide, PositionState, TradeRecord};
use crate::trading::{
    CategoryWeights, CompoundingPolicy, MarketCalendar, PositionSizer, PositionStore,
    SignalAggregator, SignalDirection, SignalProvider, Strategy, TradingConfig,
};

/// Stop and manual-close requests for a running controller.
#[derive(Clone)]
pub struct ControlHandle {
    stop: Arc<watch::Sender<bool>>,
    close: mpsc::UnboundedSender<String>,
}

impl ControlHandle {
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Close the position for an instrument (or with a position id) on the
    /// next cycle.
    pub fn request_close(&self, target: impl Into<String>) -> bool {
        self.close.send(target.into()).is_ok()
    }
}

/// A failure recorded during a cycle.
#[derive(Debug, Clone)]
pub struct CycleError {
    pub step: &'static str,
    pub category: ErrorCategory,
    pub message: String,
}

/// What one cycle did and what went wrong.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub markets_open: bool,
    pub scanned: usize,
    pub entries: usize,
    pub exits: usize,
    pub realized_pnl: Decimal,
    pub compounded: Decimal,
    pub budget_remaining: Decimal,
    pub open_positions: usize,
    pub errors: Vec<CycleError>,
    /// Authentication failure that requires a new login
    pub fatal: Option<AuthenticationError>,
    /// A stop request cut the cycle short
    pub interrupted: bool,
    pub persisted: bool,
    pub sleep: Duration,
    pub next_wake: DateTime<Utc>,
}

impl CycleReport {
    fn new(cycle: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle,
            started_at,
            markets_open: false,
            scanned: 0,
            entries: 0,
            exits: 0,
            realized_pnl: Decimal::ZERO,
            compounded: Decimal::ZERO,
            budget_remaining: Decimal::ZERO,
            open_positions: 0,
            errors: Vec::new(),
            fatal: None,
            interrupted: false,
            persisted: false,
            sleep: Duration::ZERO,
            next_wake: started_at,
        }
    }

    /// Every intended action ran without error.
    pub fn completed(&self) -> bool {
        self.errors.is_empty() && !self.interrupted && self.persisted
    }

    /// Authentication and invariant failures stop new entries for the rest
    /// of the cycle.
    pub fn halts_entries(&self) -> bool {
        self.errors.iter().any(|e| {
            matches!(
                e.category,
                ErrorCategory::Authentication | ErrorCategory::InvariantViolation
            )
        })
    }

    fn record(&mut self, step: &'static str, error: TradingError) {
        if let TradingError::Authentication(auth) = &error {
            if auth.is_fatal() && self.fatal.is_none() {
                self.fatal = Some(auth.clone());
            }
        }
        warn!(step, category = %error.category(), error = %error, "Cycle step failed");
        self.errors.push(CycleError {
            step,
            category: error.category(),
            message: error.to_string(),
        });
    }

    fn record_close(&mut self, trade: &TradeRecord) {
        self.exits += 1;
        self.realized_pnl += trade.realized_pnl;
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Cycle {} ({}) ===", self.cycle, self.started_at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f, "Markets open:     {}", self.markets_open)?;
        writeln!(f, "Scanned:          {}", self.scanned)?;
        writeln!(f, "Entries:          {}", self.entries)?;
        writeln!(f, "Exits:            {}", self.exits)?;
        writeln!(f, "Realized P&L:     {}", self.realized_pnl)?;
        writeln!(f, "Compounded:       {}", self.compounded)?;
        writeln!(f, "Budget remaining: {}", self.budget_remaining)?;
        writeln!(f, "Open positions:   {}", self.open_positions)?;
        writeln!(f, "Completed:        {}", self.completed())?;
        for e in &self.errors {
            writeln!(f, "  [{}] {}: {}", e.category, e.step, e.message)?;
        }
        write!(f, "Next wake:        {} (in {:?})", self.next_wake.format("%Y-%m-%d %H:%M:%S"), self.sleep)
    }
}

/// Drives trading cycles for one session.
pub struct TradingCycleController {
    session_id: String,
    config: PersistedConfig,
    trading: TradingConfig,
    api: MarketApiClient,
    signals: Arc<dyn SignalProvider>,
    store: Arc<dyn StateStore>,
    positions: PositionStore,
    aggregator: SignalAggregator,
    sizer: PositionSizer,
    strategy: Strategy,
    calendar: MarketCalendar,
    compounding: Box<dyn CompoundingPolicy>,
    handle: ControlHandle,
    stop_rx: watch::Receiver<bool>,
    close_rx: mpsc::UnboundedReceiver<String>,
    cycles: u64,
}

impl TradingCycleController {
    pub fn new(
        session_id: impl Into<String>,
        config: PersistedConfig,
        api: MarketApiClient,
        signals: Arc<dyn SignalProvider>,
        store: Arc<dyn StateStore>,
        positions: PositionStore,
    ) -> Self {
        let mut trading = config.trading.clone();
        trading.profile = config.strategy;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (close_tx, close_rx) = mpsc::unbounded_channel();

        Self {
            session_id: session_id.into(),
            aggregator: SignalAggregator::new(CategoryWeights::default(), trading.neutrality_threshold),
            sizer: PositionSizer::new(trading.clone()),
            strategy: Strategy::new(&trading),
            calendar: MarketCalendar::default(),
            compounding: config.compounding.policy(),
            trading,
            config,
            api,
            signals,
            store,
            positions,
            handle: ControlHandle {
                stop: Arc::new(stop_tx),
                close: close_tx,
            },
            stop_rx,
            close_rx,
            cycles: 0,
        }
    }

    pub fn handle(&self) -> ControlHandle {
        self.handle.clone()
    }

    pub fn positions(&self) -> &PositionStore {
        &self.positions
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Run until Ctrl+C or a fatal authentication error.
    pub async fn run(&mut self) -> Result<u64, TradingError> {
        let handle = self.handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                handle.stop();
            }
        });

        self.run_cycles(None).await
    }

    /// Run at most `max_cycles` cycles (unbounded with `None`). Returns the
    /// number of cycles run.
    pub async fn run_cycles(&mut self, max_cycles: Option<u64>) -> Result<u64, TradingError> {
        info!(
            session = %self.session_id,
            dry_run = self.config.dry_run,
            strategy = %self.config.strategy,
            interval_secs = self.config.interval_secs,
            "Starting trading loop"
        );

        let mut completed = 0;
        while !self.stop_requested() {
            let report = self.run_cycle().await;
            completed += 1;

            if report.completed() {
                info!(
                    cycle = report.cycle,
                    entries = report.entries,
                    exits = report.exits,
                    realized = %report.realized_pnl,
                    "Cycle completed"
                );
            } else {
                warn!(cycle = report.cycle, errors = report.errors.len(), "Cycle incomplete");
            }
            debug!("\n{}", report);

            if let Some(auth) = report.fatal {
                error!(error = %auth, "Authentication lost, stopping until the next login");
                return Err(auth.into());
            }
            if max_cycles.is_some_and(|max| completed >= max) {
                break;
            }
            if !self.sleep(report.sleep).await {
                break;
            }
        }

        info!(cycles = completed, "Trading loop stopped");
        Ok(completed)
    }

    /// Sleep unless a stop arrives first. Returns false when stopped.
    async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.stop_rx.changed() => !self.stop_requested(),
        }
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// One full cycle evaluated at `now`.
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>) -> CycleReport {
        self.cycles += 1;
        let mut report = CycleReport::new(self.cycles, now);

        // 1. Session
        let session_ok = match self.api.session().ensure_valid_session().await {
            Ok(()) => true,
            Err(e) => {
                report.record("session", e.into());
                false
            }
        };

        // 2. Market hours
        report.markets_open =
            self.config.crypto_enabled() || self.calendar.any_open(&self.config.asset_classes, now);
        if !report.markets_open {
            info!("All enabled markets closed, skipping scan");
        } else if session_ok {
            self.trade(now, &mut report).await;
        }

        // 7. Persist
        match self.persist(now).await {
            Ok(()) => report.persisted = true,
            Err(e) => report.record("persist", TradingError::Storage(format!("{:#}", e))),
        }

        // 8. Schedule
        report.sleep = self.next_sleep(now);
        report.next_wake = now + chrono::Duration::from_std(report.sleep).unwrap_or_else(|_| chrono::Duration::zero());
        report.budget_remaining = self.positions.budget().remaining;
        report.open_positions = self.positions.active_count();
        report
    }

    /// Steps 3 to 6.
    async fn trade(&mut self, now: DateTime<Utc>, report: &mut CycleReport) {
        let cash = self.refresh_account(report).await;
        self.reconcile_pending(now, report).await;
        if self.stop_requested() {
            report.interrupted = true;
            return;
        }

        self.manage_exits(now, report).await;
        if self.stop_requested() {
            report.interrupted = true;
            return;
        }

        match self
            .positions
            .apply_compounding(self.compounding.as_ref(), report.realized_pnl)
        {
            Ok(moved) => report.compounded = moved,
            Err(e) => report.record("compounding", e.into()),
        }

        if report.halts_entries() {
            warn!("New entries halted for this cycle");
            return;
        }
        if self.positions.budget().remaining <= Decimal::ZERO {
            debug!("No budget remaining, skipping scan");
            return;
        }
        self.scan_for_entries(now, cash, report).await;
    }

    // ==================== Account ====================

    /// Cash available at the broker, when it could be read.
    async fn refresh_account(&mut self, report: &mut CycleReport) -> Option<Decimal> {
        let cash = match self.api.get_cash_balance().await {
            Ok(balance) => Some(balance.available),
            Err(e) => {
                report.record("cash", e);
                None
            }
        };

        match self.api.get_portfolio().await {
            Ok(holdings) if !self.config.dry_run => {
                for position in self.positions.positions() {
                    let held = position.state.is_held() && position.side == PositionSide::Long;
                    if held && !holdings.iter().any(|h| h.isin == position.instrument_id) {
                        warn!(
                            position_id = %position.id,
                            instrument = %position.instrument_id,
                            "Position not reported in broker portfolio"
                        );
                    }
                }
            }
            Ok(_) => {}
            Err(e) => report.record("portfolio", e),
        }

        cash
    }

    /// Resolve orders that were still working at the end of an earlier cycle.
    async fn reconcile_pending(&mut self, now: DateTime<Utc>, report: &mut CycleReport) {
        let pending = self.positions.ids_in_state(|s| {
            matches!(s, PositionState::PendingEntry | PositionState::PendingExit)
        });

        for id in pending {
            let Some(position) = self.positions.position(&id) else {
                continue;
            };
            let state = position.state;
            let order_id = match state {
                PositionState::PendingEntry => position.entry_order_id.clone(),
                _ => match position.exit_order_id.clone() {
                    Some(order_id) => order_id,
                    None => {
                        if let Err(e) = self.positions.abandon_exit(&id, now) {
                            report.record("reconcile", e.into());
                        }
                        continue;
                    }
                },
            };

            let status = match self.api.get_order(&order_id).await {
                Ok(status) => status,
                Err(TradingError::Remote(TransportError::Client { status: 404, .. })) => {
                    warn!(position_id = %id, order_id = %order_id, "Order unknown to broker, dropping it");
                    let result = if state == PositionState::PendingEntry {
                        self.positions.cancel_entry(&id).map(|_| ())
                    } else {
                        self.positions.abandon_exit(&id, now)
                    };
                    if let Err(e) = result {
                        report.record("reconcile", e.into());
                    }
                    continue;
                }
                Err(e) => {
                    report.record("reconcile", e);
                    continue;
                }
            };

            let result = if state == PositionState::PendingEntry {
                let status = self.expire_stale_entry(&id, &order_id, status, now).await;
                self.apply_entry_status(&id, &status, now).map(|_| ())
            } else {
                self.apply_exit_status(&id, &status, now).map(|closed| {
                    if let Some(trade) = closed {
                        report.record_close(&trade);
                    }
                })
            };
            if let Err(e) = result {
                report.record("reconcile", e);
            }
        }
    }

    /// Cancel an entry order still working past the configured timeout and
    /// return the status the cancel produced. Any other status is returned
    /// unchanged.
    async fn expire_stale_entry(
        &self,
        id: &str,
        order_id: &str,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> OrderStatus {
        let timeout = chrono::Duration::seconds(self.trading.pending_entry_timeout_secs as i64);
        let expired = self
            .positions
            .position(id)
            .is_some_and(|p| now - p.entry_time >= timeout);
        if status.state.is_final() || !expired {
            return status;
        }

        info!(position_id = %id, order_id = %order_id, "Entry order still working after timeout, cancelling");
        match self.api.cancel_order(order_id).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!(position_id = %id, error = %e, "Cancel failed, retrying next cycle");
                status
            }
        }
    }

    // ==================== Exits ====================

    async fn manage_exits(&mut self, now: DateTime<Utc>, report: &mut CycleReport) {
        let mut manual = HashSet::new();
        while let Ok(target) = self.close_rx.try_recv() {
            manual.insert(target);
        }
        for target in &manual {
            let held = self
                .positions
                .positions()
                .into_iter()
                .any(|p| p.state.is_held() && (&p.id == target || &p.instrument_id == target));
            if !held {
                warn!(requested = %target, "Close requested for a position that is not held, ignoring");
            }
        }

        for id in self.positions.ids_in_state(|s| s.is_held()) {
            if self.stop_requested() {
                report.interrupted = true;
                return;
            }
            match self.evaluate_exit(&id, &manual, now).await {
                Ok(Some(trade)) => report.record_close(&trade),
                Ok(None) => {}
                Err(e) => report.record("exit", e),
            }
        }
    }

    async fn evaluate_exit(
        &mut self,
        id: &str,
        manual: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<TradeRecord>, TradingError> {
        let instrument = {
            let position = self
                .positions
                .position(id)
                .ok_or_else(|| InvariantViolation::UnknownPosition(id.to_string()))?;
            Instrument::new(position.instrument_id.clone(), position.name.clone(), position.asset_class)
        };

        let quote = self.api.get_price(&instrument.isin).await?;
        let atr = match self.signals.signal_inputs(&instrument).await {
            Ok(inputs) => inputs.atr,
            Err(e) => {
                debug!(instrument = %instrument.isin, error = %e, "No fresh ATR, keeping previous");
                Decimal::ZERO
            }
        };

        let position = self
            .positions
            .position_mut(id)
            .ok_or_else(|| InvariantViolation::UnknownPosition(id.to_string()))?;
        let price = exit_price(position.side, &quote);
        self.strategy.update_levels(position, price, atr, now);

        let reason = if manual.contains(id) || manual.contains(&position.instrument_id) {
            info!(position_id = %id, "Manual close requested");
            Some(ExitReason::Manual)
        } else {
            self.strategy.check_exit(position, price).map(|signal| {
                info!(
                    position_id = %id,
                    instrument = %instrument.isin,
                    reason = %signal.reason,
                    trigger = %signal.trigger,
                    price = %signal.price,
                    "Exit triggered"
                );
                signal.reason
            })
        };

        match reason {
            Some(reason) => self.submit_exit(id, reason, price, now).await,
            None => Ok(None),
        }
    }

    async fn submit_exit(
        &mut self,
        id: &str,
        reason: ExitReason,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<TradeRecord>, TradingError> {
        let (isin, side, size) = {
            let position = self
                .positions
                .position(id)
                .ok_or_else(|| InvariantViolation::UnknownPosition(id.to_string()))?;
            (position.instrument_id.clone(), position.side, position.size)
        };

        let order = OrderRequest::market(isin, exit_order_side(side), size);
        self.positions
            .begin_exit(id, reason, order.client_order_id.clone(), now)?;

        if self.config.dry_run {
            let fee = self.strategy.fees().fee(size * price);
            info!(position_id = %id, price = %price, "[DRY RUN] Exit filled at quote");
            return Ok(Some(self.positions.close(id, price, fee, now)?));
        }

        match self.api.place_order(&order).await {
            Ok(status) => self.apply_exit_status(id, &status, now),
            Err(e @ TradingError::AmbiguousOrder(_)) => {
                warn!(position_id = %id, "Exit outcome unknown, reconciling next cycle");
                Err(e)
            }
            Err(e) => {
                self.positions.abandon_exit(id, now)?;
                Err(e)
            }
        }
    }

    fn apply_exit_status(
        &mut self,
        id: &str,
        status: &OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<TradeRecord>, TradingError> {
        let (size, fallback_price) = {
            let position = self
                .positions
                .position(id)
                .ok_or_else(|| InvariantViolation::UnknownPosition(id.to_string()))?;
            (position.size, position.current_price)
        };

        if !status.state.is_final() {
            debug!(position_id = %id, state = ?status.state, "Exit order still working");
            return Ok(None);
        }

        let filled = status.filled_quantity;
        if filled <= Decimal::ZERO {
            info!(position_id = %id, state = ?status.state, "Exit order ended unfilled");
            self.positions.abandon_exit(id, now)?;
            return Ok(None);
        }

        let price = status.average_fill_price.unwrap_or(fallback_price);
        let fee = status
            .fee
            .unwrap_or_else(|| self.strategy.fees().fee(price * filled.min(size)));
        if filled < size {
            warn!(
                position_id = %id,
                filled = %filled,
                size = %size,
                "Exit only partially filled, rest stays open"
            );
            return Ok(Some(self.positions.close_partial(id, filled, price, fee, now)?));
        }
        Ok(Some(self.positions.close(id, price, fee, now)?))
    }

    // ==================== Entries ====================

    async fn scan_for_entries(&mut self, now: DateTime<Utc>, cash: Option<Decimal>, report: &mut CycleReport) {
        let kelly = MetricsCalculator::calculate(self.positions.history())
            .kelly_fraction(self.trading.kelly_min_trades);
        let mut cash = cash.filter(|_| !self.config.dry_run);
        let mut broker_open = HashMap::new();

        for instrument in self.config.watchlist.clone() {
            if self.stop_requested() {
                report.interrupted = true;
                return;
            }
            if self.positions.active_count() >= self.trading.max_concurrent_positions {
                debug!(max = self.trading.max_concurrent_positions, "Position limit reached");
                return;
            }
            if !self.config.asset_classes.contains(&instrument.asset_class)
                || !self.calendar.is_open(instrument.asset_class, now)
                || self.positions.has_active(&instrument.isin)
            {
                continue;
            }
            if !self
                .broker_market_open(instrument.asset_class, &mut broker_open, report)
                .await
            {
                continue;
            }

            let available = self.available_for_entry(cash);
            if available <= Decimal::ZERO {
                debug!("No budget left for entries");
                return;
            }

            report.scanned += 1;
            match self.evaluate_entry(&instrument, available, kelly, now).await {
                Ok(Some(committed)) => {
                    report.entries += 1;
                    if let Some(cash) = cash.as_mut() {
                        *cash -= committed;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    report.record("entry", e);
                    if report.halts_entries() {
                        warn!("New entries halted for this cycle");
                        return;
                    }
                }
            }
        }
    }

    /// Whether the broker reports `asset_class` as trading, asked once per
    /// cycle. Exchange holidays only show up here; when the status cannot be
    /// read the local calendar decides.
    async fn broker_market_open(
        &self,
        asset_class: AssetClass,
        cache: &mut HashMap<AssetClass, bool>,
        report: &mut CycleReport,
    ) -> bool {
        if let Some(open) = cache.get(&asset_class) {
            return *open;
        }

        let open = match self.api.get_market_status(asset_class).await {
            Ok(status) => {
                if !status.open {
                    info!(
                        asset_class = %asset_class,
                        next_open = ?status.next_open,
                        "Broker reports market closed"
                    );
                }
                status.open
            }
            Err(e) => {
                report.record("market_status", e);
                true
            }
        };
        cache.insert(asset_class, open);
        open
    }

    /// Largest notional whose entry fee still fits the budget and, when
    /// trading live, the broker cash balance.
    fn available_for_entry(&self, cash: Option<Decimal>) -> Decimal {
        let mut available = self.positions.budget().remaining;
        if let Some(cash) = cash {
            available = available.min(cash);
        }
        let fees = self.strategy.fees();
        ((available - fees.fixed) / (Decimal::ONE + fees.pct)).max(Decimal::ZERO)
    }

    /// Returns the committed notional when an entry was submitted.
    async fn evaluate_entry(
        &mut self,
        instrument: &Instrument,
        available: Decimal,
        kelly: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Option<Decimal>, TradingError> {
        let inputs = self.signals.signal_inputs(instrument).await?;
        if inputs.signals.is_empty() {
            debug!(instrument = %instrument.isin, "No indicator scores");
            return Ok(None);
        }
        let signal = self.aggregator.aggregate(&inputs.signals);

        let side = match signal.direction {
            SignalDirection::Long => PositionSide::Long,
            SignalDirection::Short
                if self.trading.allow_short && instrument.asset_class.supports_short() =>
            {
                PositionSide::Short
            }
            direction => {
                debug!(instrument = %instrument.isin, direction = %direction, score = signal.score, "No entry");
                return Ok(None);
            }
        };

        let quote = self.api.get_price(&instrument.isin).await?;
        let price = entry_price(side, &quote);
        let sized = self
            .sizer
            .size(signal.confidence, inputs.atr, price, available, kelly)?;
        if sized.is_zero() {
            debug!(instrument = %instrument.isin, "Position size below minimum");
            return Ok(None);
        }

        let quantity = round_quantity(sized / price, instrument.asset_class);
        if quantity <= Decimal::ZERO {
            debug!(instrument = %instrument.isin, sized = %sized, price = %price, "Less than one unit");
            return Ok(None);
        }
        let notional = quantity * price;

        let validation = self.strategy.validate_entry(side, &quote, notional, inputs.atr);
        if !validation.allowed {
            info!(instrument = %instrument.isin, reason = %validation.reason, "Entry rejected by strategy");
            return Ok(None);
        }

        let committed = notional + self.strategy.fees().fee(notional);
        let order = OrderRequest::market(instrument.isin.clone(), entry_order_side(side), quantity);
        let position = Position::pending_entry(
            instrument,
            side,
            quantity,
            price,
            inputs.atr,
            signal.confidence,
            committed,
            order.client_order_id.clone(),
            now,
        );
        let id = position.id.clone();
        self.positions.reserve_entry(position)?;

        info!(
            instrument = %instrument.isin,
            name = instrument.display_name(),
            side = ?side,
            quantity = %quantity,
            price = %price,
            confidence = format!("{:.2}", signal.confidence),
            committed = %committed,
            "Submitting entry"
        );

        self.submit_entry(&id, &order, price, now).await?;
        Ok(Some(committed))
    }

    async fn submit_entry(
        &mut self,
        id: &str,
        order: &OrderRequest,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), TradingError> {
        if self.config.dry_run {
            let fee = self.strategy.fees().fee(order.quantity * price);
            info!(position_id = %id, price = %price, "[DRY RUN] Entry filled at quote");
            return self.confirm_entry(id, price, order.quantity, fee, now);
        }

        match self.api.place_order(order).await {
            Ok(status) => self.apply_entry_status(id, &status, now).map(|_| ()),
            Err(e @ TradingError::AmbiguousOrder(_)) => {
                warn!(position_id = %id, "Entry outcome unknown, reconciling next cycle");
                Err(e)
            }
            Err(e) => {
                self.positions.cancel_entry(id)?;
                Err(e)
            }
        }
    }

    /// Returns whether the position is now open.
    fn apply_entry_status(
        &mut self,
        id: &str,
        status: &OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, TradingError> {
        let reserved_price = self
            .positions
            .position(id)
            .ok_or_else(|| InvariantViolation::UnknownPosition(id.to_string()))?
            .entry_price;

        let filled = status.filled_quantity > Decimal::ZERO;
        if !status.state.is_final() || !filled {
            if status.state.is_final() {
                info!(position_id = %id, state = ?status.state, "Entry order ended unfilled");
                self.positions.cancel_entry(id)?;
            } else {
                debug!(position_id = %id, state = ?status.state, "Entry order still working");
            }
            return Ok(false);
        }

        let price = status.average_fill_price.unwrap_or(reserved_price);
        let quantity = status.filled_quantity;
        let fee = status
            .fee
            .unwrap_or_else(|| self.strategy.fees().fee(price * quantity));
        self.confirm_entry(id, price, quantity, fee, now)?;
        Ok(true)
    }

    fn confirm_entry(
        &mut self,
        id: &str,
        price: Decimal,
        quantity: Decimal,
        fee: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), TradingError> {
        self.positions.confirm_entry(id, price, quantity, fee, now)?;

        let position = self
            .positions
            .position_mut(id)
            .ok_or_else(|| InvariantViolation::UnknownPosition(id.to_string()))?;
        let atr = position.entry_atr;
        self.strategy.update_levels(position, price, atr, now);

        info!(
            position_id = %id,
            instrument = %position.instrument_id,
            price = %price,
            size = %quantity,
            stop_loss = %position.dynamic_stop_loss,
            take_profit = %position.dynamic_take_profit,
            "Position opened"
        );
        Ok(())
    }

    // ==================== Persistence & Scheduling ====================

    async fn persist(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let (positions, history) = self.positions.snapshot();
        let mut document = StateDocument::new(
            self.session_id.clone(),
            self.positions.budget().clone(),
            self.config.clone(),
        );
        document.session = self.api.session().session_metadata().await;
        document.positions = positions;
        document.history = history;
        document.updated_at = now;

        self.store
            .save(&document)
            .await
            .with_context(|| format!("Failed to persist state to {}", self.store.describe()))
    }

    /// The configured interval while a relevant market is open, otherwise
    /// the time until the next open.
    fn next_sleep(&self, now: DateTime<Utc>) -> Duration {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        let classes = &self.config.asset_classes;
        if self.config.crypto_enabled() || self.calendar.any_open(classes, now) {
            return interval;
        }

        match self.calendar.next_open_any(classes, now) {
            Some(open) if open > now => (open - now).to_std().unwrap_or(interval),
            _ => interval,
        }
    }
}

fn entry_price(side: PositionSide, quote: &Quote) -> Decimal {
    match side {
        PositionSide::Long => quote.ask,
        PositionSide::Short => quote.bid,
    }
}

fn exit_price(side: PositionSide, quote: &Quote) -> Decimal {
    match side {
        PositionSide::Long => quote.bid,
        PositionSide::Short => quote.ask,
    }
}

fn entry_order_side(side: PositionSide) -> OrderSide {
    match side {
        PositionSide::Long => OrderSide::Buy,
        PositionSide::Short => OrderSide::Sell,
    }
}

fn exit_order_side(side: PositionSide) -> OrderSide {
    match side {
        PositionSide::Long => OrderSide::Sell,
        PositionSide::Short => OrderSide::Buy,
    }
}

/// Whole units, except crypto which trades in fractions.
fn round_quantity(quantity: Decimal, asset_class: AssetClass) -> Decimal {
    let dp = match asset_class {
        AssetClass::Crypto => 6,
        _ => 0,
    };
    quantity.round_dp_with_strategy(dp, RoundingStrategy::ToZero)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::api::testing::{authenticated_session, test_retry_policy, MockBroker, StaticAuth};
    use crate::api::OrderState;
    use crate::models::{Budget, SignalCategory, SignalInputs, SignalSet};
    use crate::session::{Credentials, SessionConfig, SessionManager};
    use crate::trading::{CompoundingSettings, StaticSignals, StrategyProfile};

    const SAP: &str = "DE0007164600";

    #[derive(Default)]
    struct MemoryStore {
        documents: Mutex<HashMap<String, StateDocument>>,
    }

    impl MemoryStore {
        fn get(&self, session_id: &str) -> Option<StateDocument> {
            self.documents.lock().unwrap().get(session_id).cloned()
        }
    }

    #[async_trait]
    impl StateStore for MemoryStore {
        async fn load(&self, session_id: &str) -> anyhow::Result<Option<StateDocument>> {
            Ok(self.get(session_id))
        }

        async fn save(&self, document: &StateDocument) -> anyhow::Result<()> {
            self.documents
                .lock()
                .unwrap()
                .insert(document.session_id.clone(), document.clone());
            Ok(())
        }

        async fn session_ids(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.documents.lock().unwrap().keys().cloned().collect())
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }
    }

    struct Harness {
        broker: Arc<MockBroker>,
        signals: Arc<StaticSignals>,
        store: Arc<MemoryStore>,
        controller: TradingCycleController,
    }

    fn wednesday_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap()
    }

    fn config(dry_run: bool) -> PersistedConfig {
        PersistedConfig {
            strategy: StrategyProfile::Aggressive,
            interval_secs: 60,
            dry_run,
            asset_classes: vec![AssetClass::Equity],
            watchlist: vec![Instrument::new(SAP, "SAP", AssetClass::Equity)],
            compounding: CompoundingSettings {
                rate: Some(dec!(0.5)),
                max_budget: Some(dec!(20000)),
                pause_after_loss: false,
            },
            trading: TradingConfig::default(),
        }
    }

    fn bullish() -> SignalInputs {
        SignalInputs {
            signals: SignalSet::new()
                .with(SignalCategory::Momentum, 2.0)
                .with(SignalCategory::Trend, 1.0),
            atr: dec!(2),
        }
    }

    fn neutral() -> SignalInputs {
        SignalInputs {
            signals: SignalSet::new(),
            atr: dec!(2),
        }
    }

    async fn harness(config: PersistedConfig, session: SessionManager) -> Harness {
        let broker = Arc::new(MockBroker::new());
        broker.set_quote(SAP, dec!(100), dec!(100));
        let signals = Arc::new(StaticSignals::default());
        signals.set(SAP, bullish());
        let store = Arc::new(MemoryStore::default());

        let api = MarketApiClient::new(broker.clone(), session, test_retry_policy());
        let controller = TradingCycleController::new(
            "test",
            config,
            api,
            signals.clone(),
            store.clone(),
            PositionStore::new(Budget::new(dec!(10000), "EUR")),
        );

        Harness {
            broker,
            signals,
            store,
            controller,
        }
    }

    #[tokio::test]
    async fn test_entry_then_take_profit_exit() {
        let mut h = harness(config(false), authenticated_session().await).await;

        // score 0.8 / 0.55, confidence ~0.485 -> ~485 of 9999 -> 4 shares at 100
        let report = h.controller.run_cycle_at(wednesday_noon()).await;
        assert!(report.completed(), "{}", report);
        assert_eq!(report.entries, 1);

        let position = h.controller.positions().positions()[0].clone();
        assert_eq!(position.state, PositionState::Open);
        assert_eq!(position.size, dec!(4));
        assert_eq!(position.dynamic_take_profit, dec!(105));
        assert_eq!(position.dynamic_stop_loss, dec!(97));
        assert_eq!(h.controller.positions().budget().remaining, dec!(9599));

        h.signals.set(SAP, neutral());
        h.broker.set_quote(SAP, dec!(106), dec!(106));
        let report = h
            .controller
            .run_cycle_at(wednesday_noon() + chrono::Duration::minutes(1))
            .await;
        assert!(report.completed(), "{}", report);
        assert_eq!(report.exits, 1);
        assert_eq!(report.entries, 0);
        // (106 - 100) * 4 - 2 fees
        assert_eq!(report.realized_pnl, dec!(22));
        assert_eq!(report.compounded, dec!(11));

        let trade = &h.controller.positions().history()[0];
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
        let budget = h.controller.positions().budget();
        assert_eq!(budget.cap, dec!(10011));
        assert_eq!(budget.remaining, dec!(10011));
        assert_eq!(budget.banked_profit, dec!(11));

        let submitted = h.broker.submitted();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[1].side, OrderSide::Sell);

        let saved = h.store.get("test").unwrap();
        assert_eq!(saved.history.len(), 1);
        assert!(saved.positions.is_empty());
        assert!(saved.session.is_some());
    }

    #[tokio::test]
    async fn test_dry_run_sends_no_orders() {
        let mut h = harness(config(true), authenticated_session().await).await;

        let report = h.controller.run_cycle_at(wednesday_noon()).await;
        assert_eq!(report.entries, 1);
        assert!(h.broker.submitted().is_empty());

        let position = h.controller.positions().positions()[0];
        assert_eq!(position.state, PositionState::Open);
        assert_eq!(position.entry_fee, dec!(1));
    }

    #[tokio::test]
    async fn test_closed_markets_skip_scan_until_next_open() {
        let mut h = harness(config(false), authenticated_session().await).await;
        let saturday = Utc.with_ymd_and_hms(2024, 3, 9, 10, 0, 0).unwrap();

        let report = h.controller.run_cycle_at(saturday).await;
        assert!(!report.markets_open);
        assert_eq!(report.scanned, 0);
        assert_eq!(h.signals.request_count(), 0);
        assert_eq!(h.broker.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(report.persisted);
        assert_eq!(report.sleep, Duration::from_secs(45 * 3600));
        assert_eq!(report.next_wake, Utc.with_ymd_and_hms(2024, 3, 11, 7, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_crypto_keeps_the_loop_on_interval() {
        let mut config = config(true);
        config.asset_classes.push(AssetClass::Crypto);
        let mut h = harness(config, authenticated_session().await).await;
        let saturday = Utc.with_ymd_and_hms(2024, 3, 9, 10, 0, 0).unwrap();

        let report = h.controller.run_cycle_at(saturday).await;
        assert!(report.markets_open);
        assert_eq!(report.sleep, Duration::from_secs(60));
        // SAP trades on the exchange calendar, so it is not scanned
        assert_eq!(report.scanned, 0);
    }

    #[tokio::test]
    async fn test_working_entry_is_reconciled_next_cycle() {
        let mut h = harness(config(false), authenticated_session().await).await;
        h.broker.hold_fills(true);

        h.controller.run_cycle_at(wednesday_noon()).await;
        let position = h.controller.positions().positions()[0].clone();
        assert_eq!(position.state, PositionState::PendingEntry);
        assert_eq!(h.controller.positions().budget().remaining, dec!(9599));

        h.broker.fill(&position.entry_order_id, dec!(99.5));
        let report = h
            .controller
            .run_cycle_at(wednesday_noon() + chrono::Duration::minutes(1))
            .await;
        assert!(report.completed(), "{}", report);

        let position = h.controller.positions().position(&position.id).unwrap();
        assert_eq!(position.state, PositionState::Open);
        assert_eq!(position.entry_price, dec!(99.5));
        // 4 * 99.5 + 1 fee, the rest of the reservation returned
        assert_eq!(h.controller.positions().budget().remaining, dec!(9601));
        assert_eq!(h.broker.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_entry_rolls_back_reservation() {
        let mut h = harness(config(false), authenticated_session().await).await;
        h.broker.reject_next_order("insufficient margin");

        let report = h.controller.run_cycle_at(wednesday_noon()).await;
        assert_eq!(report.entries, 0);
        assert!(report
            .errors
            .iter()
            .any(|e| e.step == "entry" && e.category == ErrorCategory::OrderRejected));
        assert_eq!(h.controller.positions().active_count(), 0);
        assert_eq!(h.controller.positions().budget().remaining, dec!(10000));
        assert!(h.broker.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_lost_order_response_is_reconciled_next_cycle() {
        let mut h = harness(config(false), authenticated_session().await).await;
        h.broker.lose_next_order_response();

        let report = h.controller.run_cycle_at(wednesday_noon()).await;
        assert!(report
            .errors
            .iter()
            .any(|e| e.step == "entry" && e.category == ErrorCategory::TransientNetwork));
        let position = h.controller.positions().positions()[0].clone();
        assert_eq!(position.state, PositionState::PendingEntry);
        assert_eq!(h.controller.positions().budget().remaining, dec!(9599));

        // The broker did take the order and filled it at the ask
        h.signals.set(SAP, neutral());
        let report = h
            .controller
            .run_cycle_at(wednesday_noon() + chrono::Duration::minutes(1))
            .await;
        assert!(report.completed(), "{}", report);
        let position = h.controller.positions().position(&position.id).unwrap();
        assert_eq!(position.state, PositionState::Open);
        assert_eq!(position.size, dec!(4));
        assert_eq!(h.controller.positions().budget().remaining, dec!(9599));
        assert_eq!(h.broker.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_entry_unknown_to_broker_is_cancelled() {
        let mut h = harness(config(false), authenticated_session().await).await;
        h.broker.hold_fills(true);
        h.controller.run_cycle_at(wednesday_noon()).await;
        let position = h.controller.positions().positions()[0].clone();
        h.broker.forget_order(&position.entry_order_id);

        h.signals.set(SAP, neutral());
        let report = h
            .controller
            .run_cycle_at(wednesday_noon() + chrono::Duration::minutes(1))
            .await;
        assert!(report.completed(), "{}", report);
        assert!(h.controller.positions().position(&position.id).is_none());
        assert_eq!(h.controller.positions().active_count(), 0);
        assert_eq!(h.controller.positions().budget().remaining, dec!(10000));
    }

    #[tokio::test]
    async fn test_stale_entry_order_is_cancelled() {
        let mut h = harness(config(false), authenticated_session().await).await;
        h.broker.hold_fills(true);
        h.controller.run_cycle_at(wednesday_noon()).await;
        let position = h.controller.positions().positions()[0].clone();
        h.signals.set(SAP, neutral());

        // Still inside the 300s window
        h.controller
            .run_cycle_at(wednesday_noon() + chrono::Duration::minutes(1))
            .await;
        assert_eq!(
            h.controller.positions().position(&position.id).unwrap().state,
            PositionState::PendingEntry
        );
        assert_eq!(h.broker.order_state(&position.entry_order_id), Some(OrderState::Open));

        let report = h
            .controller
            .run_cycle_at(wednesday_noon() + chrono::Duration::minutes(6))
            .await;
        assert!(report.completed(), "{}", report);
        assert!(h.controller.positions().position(&position.id).is_none());
        assert_eq!(h.controller.positions().budget().remaining, dec!(10000));
        assert_eq!(h.broker.order_state(&position.entry_order_id), Some(OrderState::Cancelled));
    }

    #[tokio::test]
    async fn test_stop_loss_exit() {
        let mut h = harness(config(false), authenticated_session().await).await;
        h.controller.run_cycle_at(wednesday_noon()).await;

        h.signals.set(SAP, neutral());
        h.broker.set_quote(SAP, dec!(96), dec!(96));
        let report = h
            .controller
            .run_cycle_at(wednesday_noon() + chrono::Duration::minutes(1))
            .await;
        assert!(report.completed(), "{}", report);
        assert_eq!(report.exits, 1);
        // (96 - 100) * 4 - 2 fees
        assert_eq!(report.realized_pnl, dec!(-18));
        assert_eq!(report.compounded, Decimal::ZERO);

        let trade = &h.controller.positions().history()[0];
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert_eq!(trade.exit_price, dec!(96));
        assert_eq!(h.controller.positions().active_count(), 0);
        assert_eq!(h.controller.positions().budget().remaining, dec!(9982));
    }

    #[tokio::test]
    async fn test_partial_exit_fill_books_sold_share() {
        let mut h = harness(config(false), authenticated_session().await).await;
        h.controller.run_cycle_at(wednesday_noon()).await;

        h.broker.hold_fills(true);
        h.signals.set(SAP, neutral());
        h.broker.set_quote(SAP, dec!(106), dec!(106));
        h.controller
            .run_cycle_at(wednesday_noon() + chrono::Duration::minutes(1))
            .await;
        let position = h.controller.positions().positions()[0].clone();
        assert_eq!(position.state, PositionState::PendingExit);
        let exit_order_id = position.exit_order_id.clone().unwrap();

        h.broker.fill_partially(&exit_order_id, dec!(3), dec!(106));
        // Between the trailing stop (102) and the take-profit (105)
        h.broker.set_quote(SAP, dec!(103), dec!(103));
        let report = h
            .controller
            .run_cycle_at(wednesday_noon() + chrono::Duration::minutes(2))
            .await;
        assert!(report.completed(), "{}", report);
        assert_eq!(report.exits, 1);
        // (106 - 100) * 3 - 0.75 entry fee share - 1 exit fee
        assert_eq!(report.realized_pnl, dec!(16.25));

        let trade = &h.controller.positions().history()[0];
        assert!(trade.partial);
        assert_eq!(trade.size, dec!(3));
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);

        let rest = h.controller.positions().position(&position.id).unwrap();
        assert!(rest.state.is_held());
        assert_eq!(rest.size, dec!(1));
        assert_eq!(rest.committed_notional, dec!(100.25));

        // 300.75 returned, 16.25 banked, half of it compounded
        let budget = h.controller.positions().budget();
        assert_eq!(report.compounded, dec!(8.125));
        assert_eq!(budget.cap, dec!(10008.125));
        assert_eq!(budget.remaining, dec!(9907.875));
    }

    #[tokio::test]
    async fn test_broker_reported_closure_skips_entries() {
        let mut h = harness(config(false), authenticated_session().await).await;
        // Exchange holiday on a weekday
        h.broker.close_market(AssetClass::Equity);

        let report = h.controller.run_cycle_at(wednesday_noon()).await;
        assert!(report.completed(), "{}", report);
        assert_eq!(report.scanned, 0);
        assert_eq!(report.entries, 0);
        assert_eq!(h.signals.request_count(), 0);
        assert!(h.broker.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_close_request_for_unknown_target_is_ignored() {
        let mut h = harness(config(true), authenticated_session().await).await;
        h.controller.run_cycle_at(wednesday_noon()).await;

        h.signals.set(SAP, neutral());
        assert!(h.controller.handle().request_close("US0378331005"));
        let report = h
            .controller
            .run_cycle_at(wednesday_noon() + chrono::Duration::minutes(1))
            .await;
        assert!(report.completed(), "{}", report);
        assert_eq!(report.exits, 0);
        assert_eq!(h.controller.positions().active_count(), 1);
    }

    #[tokio::test]
    async fn test_manual_close_request() {
        let mut h = harness(config(true), authenticated_session().await).await;
        h.controller.run_cycle_at(wednesday_noon()).await;

        h.signals.set(SAP, neutral());
        assert!(h.controller.handle().request_close(SAP));
        let report = h
            .controller
            .run_cycle_at(wednesday_noon() + chrono::Duration::minutes(1))
            .await;

        assert_eq!(report.exits, 1);
        assert_eq!(report.realized_pnl, dec!(-2));
        assert_eq!(report.compounded, Decimal::ZERO);
        assert_eq!(h.controller.positions().history()[0].exit_reason, ExitReason::Manual);
        assert_eq!(h.controller.positions().budget().remaining, dec!(9998));
    }

    #[tokio::test]
    async fn test_short_signal_needs_allow_short() {
        let mut h = harness(config(true), authenticated_session().await).await;
        h.signals.set(
            SAP,
            SignalInputs {
                signals: SignalSet::new().with(SignalCategory::Trend, -2.5),
                atr: dec!(2),
            },
        );

        let report = h.controller.run_cycle_at(wednesday_noon()).await;
        assert_eq!(report.scanned, 1);
        assert_eq!(report.entries, 0);
        assert_eq!(h.controller.positions().active_count(), 0);
    }

    #[tokio::test]
    async fn test_position_limit_stops_scan() {
        let mut config = config(true);
        config.trading.max_concurrent_positions = 0;
        let mut h = harness(config, authenticated_session().await).await;

        let report = h.controller.run_cycle_at(wednesday_noon()).await;
        assert_eq!(report.scanned, 0);
        assert_eq!(h.signals.request_count(), 0);
    }

    #[tokio::test]
    async fn test_fatal_auth_error_stops_loop() {
        let session = SessionManager::new(
            Arc::new(StaticAuth),
            Credentials::new("user", "pin"),
            SessionConfig::default(),
        );
        let mut h = harness(config(false), session).await;

        let result = h.controller.run_cycles(Some(5)).await;
        assert!(matches!(
            result,
            Err(TradingError::Authentication(AuthenticationError::NotAuthenticated))
        ));
        assert_eq!(h.broker.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(h.store.get("test").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_request_ends_sleep() {
        let mut config = config(true);
        config.asset_classes = vec![AssetClass::Crypto];
        config.watchlist.clear();
        let h = harness(config, authenticated_session().await).await;

        let handle = h.controller.handle();
        let mut controller = h.controller;
        let task = tokio::spawn(async move { controller.run_cycles(None).await });

        // Cycles at t=0 and t=60, stop while sleeping towards t=120
        tokio::time::sleep(Duration::from_secs(90)).await;
        handle.stop();

        assert_eq!(task.await.unwrap().unwrap(), 2);
    }
}
