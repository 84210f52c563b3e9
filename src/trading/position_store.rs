//! Active positions, closed-trade history and the budget they draw on.
//!
//! Every mutation either succeeds and leaves `remaining + committed <= cap`
//! with `remaining >= 0`, or fails before anything changes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use super::compounding::CompoundingPolicy;
use crate::error::InvariantViolation;
use crate::models::{Budget, ExitReason, Position, PositionState, TradeRecord};

#[derive(Debug, Clone)]
pub struct PositionStore {
    positions: HashMap<String, Position>,
    history: Vec<TradeRecord>,
    budget: Budget,
}

impl PositionStore {
    pub fn new(budget: Budget) -> Self {
        Self {
            positions: HashMap::new(),
            history: Vec::new(),
            budget,
        }
    }

    /// Rebuild from persisted state, refusing state that breaks the invariants.
    pub fn restore(
        budget: Budget,
        positions: Vec<Position>,
        history: Vec<TradeRecord>,
    ) -> Result<Self, InvariantViolation> {
        let store = Self {
            positions: positions.into_iter().map(|p| (p.id.clone(), p)).collect(),
            history,
            budget,
        };
        store.check_invariants()?;
        Ok(store)
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    pub fn history(&self) -> &[TradeRecord] {
        &self.history
    }

    pub fn position(&self, id: &str) -> Option<&Position> {
        self.positions.get(id)
    }

    /// Mutable access for marking and level updates. State transitions go
    /// through the store's own methods.
    pub fn position_mut(&mut self, id: &str) -> Option<&mut Position> {
        self.positions.get_mut(id)
    }

    /// Positions sorted by entry time.
    pub fn positions(&self) -> Vec<&Position> {
        let mut positions: Vec<_> = self.positions.values().collect();
        positions.sort_by_key(|p| p.entry_time);
        positions
    }

    pub fn ids_in_state(&self, predicate: impl Fn(PositionState) -> bool) -> Vec<String> {
        self.positions()
            .into_iter()
            .filter(|p| predicate(p.state))
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.positions.len()
    }

    pub fn has_active(&self, instrument_id: &str) -> bool {
        self.positions.values().any(|p| p.instrument_id == instrument_id)
    }

    pub fn committed_notional(&self) -> Decimal {
        self.positions.values().map(|p| p.committed_notional).sum()
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.positions
            .values()
            .filter(|p| p.state.is_held())
            .map(|p| p.unrealized_pnl)
            .sum()
    }

    /// Reserve budget for a submitted entry order and track the position.
    pub fn reserve_entry(&mut self, position: Position) -> Result<(), InvariantViolation> {
        if position.state != PositionState::PendingEntry {
            return Err(InvariantViolation::InvalidTransition {
                id: position.id.clone(),
                actual: position.state.to_string(),
                expected: "pending_entry",
            });
        }
        if self.has_active(&position.instrument_id) || self.positions.contains_key(&position.id) {
            return Err(InvariantViolation::DuplicatePosition(position.instrument_id.clone()));
        }

        self.budget.reserve(position.committed_notional)?;
        self.positions.insert(position.id.clone(), position);
        self.check_invariants()
    }

    /// Record an entry fill. Reservation slack is returned; a fill costlier
    /// than reserved takes the difference from `remaining` when available.
    pub fn confirm_entry(
        &mut self,
        id: &str,
        fill_price: Decimal,
        filled_size: Decimal,
        fee: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), InvariantViolation> {
        if fill_price <= Decimal::ZERO || filled_size <= Decimal::ZERO {
            return Err(InvariantViolation::OutOfRange(format!(
                "fill {} @ {} for position {}",
                filled_size, fill_price, id
            )));
        }

        let position = self
            .positions
            .get_mut(id)
            .ok_or_else(|| InvariantViolation::UnknownPosition(id.to_string()))?;
        position.confirm_entry(fill_price, filled_size, fee, now)?;

        let actual = fill_price * filled_size + fee;
        let reserved = position.committed_notional;
        if actual < reserved {
            self.budget.cancel_reservation(reserved - actual);
            position.committed_notional = actual;
        } else if actual > reserved {
            let extra = (actual - reserved).min(self.budget.remaining);
            if extra < actual - reserved {
                warn!(position_id = %id, reserved = %reserved, actual = %actual, "Fill exceeded reservation");
            }
            if extra > Decimal::ZERO {
                self.budget.reserve(extra)?;
            }
            position.committed_notional = reserved + extra;
        }

        self.check_invariants()
    }

    /// Drop an entry that was never filled and return its reservation.
    pub fn cancel_entry(&mut self, id: &str) -> Result<Position, InvariantViolation> {
        let position = self
            .positions
            .get(id)
            .ok_or_else(|| InvariantViolation::UnknownPosition(id.to_string()))?;
        if position.state != PositionState::PendingEntry {
            return Err(InvariantViolation::InvalidTransition {
                id: id.to_string(),
                actual: position.state.to_string(),
                expected: "pending_entry",
            });
        }

        let position = self
            .positions
            .remove(id)
            .ok_or_else(|| InvariantViolation::UnknownPosition(id.to_string()))?;
        self.budget.cancel_reservation(position.committed_notional);
        self.check_invariants()?;
        Ok(position)
    }

    pub fn begin_exit(
        &mut self,
        id: &str,
        reason: ExitReason,
        exit_order_id: String,
        now: DateTime<Utc>,
    ) -> Result<(), InvariantViolation> {
        self.positions
            .get_mut(id)
            .ok_or_else(|| InvariantViolation::UnknownPosition(id.to_string()))?
            .begin_exit(reason, exit_order_id, now)
    }

    pub fn abandon_exit(&mut self, id: &str, now: DateTime<Utc>) -> Result<(), InvariantViolation> {
        self.positions
            .get_mut(id)
            .ok_or_else(|| InvariantViolation::UnknownPosition(id.to_string()))?
            .abandon_exit(now)
    }

    /// Close a position after its exit fill: move it to history and release
    /// its budget with the realized P&L.
    pub fn close(
        &mut self,
        id: &str,
        exit_price: Decimal,
        exit_fee: Decimal,
        now: DateTime<Utc>,
    ) -> Result<TradeRecord, InvariantViolation> {
        let position = self
            .positions
            .get(id)
            .ok_or_else(|| InvariantViolation::UnknownPosition(id.to_string()))?;
        if position.state != PositionState::PendingExit {
            return Err(InvariantViolation::InvalidTransition {
                id: id.to_string(),
                actual: position.state.to_string(),
                expected: "pending_exit",
            });
        }
        if exit_price <= Decimal::ZERO {
            return Err(InvariantViolation::OutOfRange(format!("exit price {}", exit_price)));
        }

        let mut position = self
            .positions
            .remove(id)
            .ok_or_else(|| InvariantViolation::UnknownPosition(id.to_string()))?;
        let reason = position.exit_reason.unwrap_or(ExitReason::Manual);
        position.mark_price(exit_price, now);
        position.state = PositionState::Closed;

        let record = TradeRecord::from_exit(&position, exit_price, exit_fee, reason, now);
        let committed_after = self.committed_notional();
        let release = self
            .budget
            .release(position.committed_notional, record.realized_pnl, committed_after);

        info!(
            position_id = %id,
            instrument = %record.instrument_id,
            reason = %reason,
            pnl = %record.realized_pnl,
            banked = %release.banked,
            "Position closed"
        );

        self.history.push(record.clone());
        self.check_invariants()?;
        Ok(record)
    }

    /// Book the filled part of an exit that ended with only `filled_size`
    /// sold. The sold part goes to history and releases its share of the
    /// budget; the rest returns to its held state.
    pub fn close_partial(
        &mut self,
        id: &str,
        filled_size: Decimal,
        exit_price: Decimal,
        exit_fee: Decimal,
        now: DateTime<Utc>,
    ) -> Result<TradeRecord, InvariantViolation> {
        if exit_price <= Decimal::ZERO {
            return Err(InvariantViolation::OutOfRange(format!("exit price {}", exit_price)));
        }
        let position = self
            .positions
            .get_mut(id)
            .ok_or_else(|| InvariantViolation::UnknownPosition(id.to_string()))?;
        let reason = position.exit_reason.unwrap_or(ExitReason::Manual);
        let mut sold = position.split_exit_fill(filled_size, now)?;
        let left = position.size;

        sold.mark_price(exit_price, now);
        sold.state = PositionState::Closed;
        let mut record = TradeRecord::from_exit(&sold, exit_price, exit_fee, reason, now);
        record.partial = true;

        let committed_after = self.committed_notional();
        let release = self
            .budget
            .release(sold.committed_notional, record.realized_pnl, committed_after);

        info!(
            position_id = %id,
            instrument = %record.instrument_id,
            sold = %filled_size,
            left = %left,
            pnl = %record.realized_pnl,
            banked = %release.banked,
            "Position partly closed"
        );

        self.history.push(record.clone());
        self.check_invariants()?;
        Ok(record)
    }

    pub fn apply_compounding(
        &mut self,
        policy: &dyn CompoundingPolicy,
        realized_this_cycle: Decimal,
    ) -> Result<Decimal, InvariantViolation> {
        let before = self.budget.clone();
        let moved = policy.apply(&mut self.budget, realized_this_cycle);
        if let Err(e) = self.check_invariants() {
            self.budget = before;
            return Err(e);
        }
        Ok(moved)
    }

    /// Budget bounds, one active position per instrument, and no position
    /// both active and in history.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        self.budget.check(self.committed_notional())?;

        let mut instruments = std::collections::HashSet::new();
        for position in self.positions.values() {
            if !instruments.insert(position.instrument_id.as_str()) {
                return Err(InvariantViolation::DuplicatePosition(position.instrument_id.clone()));
            }
            if position.state == PositionState::Closed
                || self
                    .history
                    .iter()
                    .any(|r| r.position_id == position.id && !r.partial)
            {
                return Err(InvariantViolation::InvalidTransition {
                    id: position.id.clone(),
                    actual: "closed".to_string(),
                    expected: "active",
                });
            }
        }
        Ok(())
    }

    /// Positions and history for persistence.
    pub fn snapshot(&self) -> (Vec<Position>, Vec<TradeRecord>) {
        (
            self.positions().into_iter().cloned().collect(),
            self.history.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetClass, Instrument, PositionSide};
    use rust_decimal_macros::dec;

    fn pending(isin: &str, committed: Decimal) -> Position {
        let instrument = Instrument::new(isin, "", AssetClass::Equity);
        Position::pending_entry(
            &instrument,
            PositionSide::Long,
            dec!(10),
            dec!(100),
            dec!(2),
            0.6,
            committed,
            uuid::Uuid::new_v4().to_string(),
            Utc::now(),
        )
    }

    #[test]
    fn test_entry_lifecycle_and_release() {
        let mut store = PositionStore::new(Budget::new(dec!(5000), "EUR"));
        let pos = pending("DE0007164600", dec!(1001));
        let id = pos.id.clone();

        store.reserve_entry(pos).unwrap();
        assert_eq!(store.budget().remaining, dec!(3999));

        // Filled cheaper than reserved: slack returns to the budget.
        store.confirm_entry(&id, dec!(99.5), dec!(10), dec!(1), Utc::now()).unwrap();
        assert_eq!(store.committed_notional(), dec!(996));
        assert_eq!(store.budget().remaining, dec!(4004));

        store.begin_exit(&id, ExitReason::TakeProfit, "exit-1".into(), Utc::now()).unwrap();
        let record = store.close(&id, dec!(104), dec!(1), Utc::now()).unwrap();

        assert_eq!(record.realized_pnl, dec!(43));
        assert_eq!(store.active_count(), 0);
        assert_eq!(store.history().len(), 1);
        assert_eq!(store.budget().remaining, dec!(5000));
        assert_eq!(store.budget().banked_profit, dec!(43));
    }

    #[test]
    fn test_duplicate_instrument_rejected_before_mutation() {
        let mut store = PositionStore::new(Budget::new(dec!(5000), "EUR"));
        store.reserve_entry(pending("DE0007164600", dec!(1000))).unwrap();

        let err = store.reserve_entry(pending("DE0007164600", dec!(1000))).unwrap_err();
        assert!(matches!(err, InvariantViolation::DuplicatePosition(_)));
        assert_eq!(store.budget().remaining, dec!(4000));
        assert_eq!(store.active_count(), 1);
    }

    #[test]
    fn test_overdraw_rejected() {
        let mut store = PositionStore::new(Budget::new(dec!(500), "EUR"));
        let err = store.reserve_entry(pending("DE0007164600", dec!(600))).unwrap_err();
        assert!(matches!(err, InvariantViolation::InsufficientBudget { .. }));
        assert_eq!(store.active_count(), 0);
    }

    #[test]
    fn test_cancel_entry_returns_reservation() {
        let mut store = PositionStore::new(Budget::new(dec!(2000), "EUR"));
        let pos = pending("DE0007164600", dec!(700));
        let id = pos.id.clone();
        store.reserve_entry(pos).unwrap();

        store.cancel_entry(&id).unwrap();
        assert_eq!(store.budget().remaining, dec!(2000));
        assert!(store.close(&id, dec!(100), Decimal::ZERO, Utc::now()).is_err());
    }

    #[test]
    fn test_close_requires_pending_exit() {
        let mut store = PositionStore::new(Budget::new(dec!(2000), "EUR"));
        let pos = pending("DE0007164600", dec!(1000));
        let id = pos.id.clone();
        store.reserve_entry(pos).unwrap();
        store.confirm_entry(&id, dec!(100), dec!(10), Decimal::ZERO, Utc::now()).unwrap();

        let err = store.close(&id, dec!(101), Decimal::ZERO, Utc::now()).unwrap_err();
        assert!(matches!(err, InvariantViolation::InvalidTransition { .. }));
        assert_eq!(store.active_count(), 1);
    }

    #[test]
    fn test_partial_exit_books_sold_share() {
        let mut store = PositionStore::new(Budget::new(dec!(2000), "EUR"));
        let pos = pending("DE0007164600", dec!(1001));
        let id = pos.id.clone();
        store.reserve_entry(pos).unwrap();
        store.confirm_entry(&id, dec!(100), dec!(10), dec!(1), Utc::now()).unwrap();
        store.begin_exit(&id, ExitReason::TakeProfit, "exit-1".into(), Utc::now()).unwrap();

        let record = store.close_partial(&id, dec!(4), dec!(105), dec!(1), Utc::now()).unwrap();

        // 4 * 5 gross, 0.4 entry fee share + 1 exit fee
        assert_eq!(record.realized_pnl, dec!(18.6));
        assert!(record.partial);
        let rest = store.position(&id).unwrap();
        assert_eq!(rest.state, PositionState::Open);
        assert_eq!(rest.size, dec!(6));
        assert_eq!(rest.committed_notional, dec!(600.6));
        // The profit does not fit under the uncompounded cap
        assert_eq!(store.budget().remaining, dec!(1399.4));
        assert_eq!(store.budget().banked_profit, dec!(18.6));
        store.check_invariants().unwrap();

        store.begin_exit(&id, ExitReason::TakeProfit, "exit-2".into(), Utc::now()).unwrap();
        store.close(&id, dec!(105), dec!(1), Utc::now()).unwrap();
        assert_eq!(store.history().len(), 2);
        assert_eq!(store.active_count(), 0);
    }

    /// Drives a long pseudo-random sequence of entries, fills, cancels and
    /// exits and checks the budget bounds after every step.
    #[test]
    fn test_budget_invariant_under_random_sequences() {
        let mut seed: u64 = 0x5eed_1234;
        let mut next = move |bound: u64| {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) % bound
        };

        let mut store = PositionStore::new(Budget::new(dec!(10000), "EUR"));
        for step in 0..2000 {
            let ids_pending = store.ids_in_state(|s| s == PositionState::PendingEntry);
            let ids_held = store.ids_in_state(|s| s.is_held());
            let ids_exiting = store.ids_in_state(|s| s == PositionState::PendingExit);

            match next(5) {
                0 => {
                    let isin = format!("XS{:010}", next(12));
                    let committed = Decimal::from(next(4000) + 1);
                    // Rejections are fine; the invariant must still hold.
                    let _ = store.reserve_entry(pending(&isin, committed));
                }
                1 if !ids_pending.is_empty() => {
                    let id = &ids_pending[next(ids_pending.len() as u64) as usize];
                    let committed = store.position(id).unwrap().committed_notional;
                    let price = Decimal::from(next(200) + 1);
                    let size = (committed / price).round_dp(2).max(dec!(0.01));
                    let _ = store.confirm_entry(id, price, size, Decimal::ONE, Utc::now());
                }
                2 if !ids_pending.is_empty() => {
                    let id = &ids_pending[next(ids_pending.len() as u64) as usize];
                    store.cancel_entry(id).unwrap();
                }
                3 if !ids_held.is_empty() => {
                    let id = &ids_held[next(ids_held.len() as u64) as usize];
                    store.begin_exit(id, ExitReason::StopLoss, "x".into(), Utc::now()).unwrap();
                }
                4 if !ids_exiting.is_empty() => {
                    let id = &ids_exiting[next(ids_exiting.len() as u64) as usize];
                    let entry = store.position(id).unwrap().entry_price;
                    // Exit anywhere between -60% and +60% of entry.
                    let factor = Decimal::from(next(121) + 40) / dec!(100);
                    store.close(id, (entry * factor).max(dec!(0.01)), Decimal::ONE, Utc::now()).unwrap();
                }
                _ => {}
            }

            store
                .check_invariants()
                .unwrap_or_else(|e| panic!("step {}: {}", step, e));
            assert!(store.budget().remaining >= Decimal::ZERO);
        }
    }
}
