//! In-memory broker for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use super::broker::BrokerApi;
use super::retry::{BackoffKind, RetryPolicy};
use super::types::*;
use crate::error::TransportError;
use crate::models::AssetClass;
use crate::session::{
    AuthApi, Credentials, LoginChallenge, Session, SessionConfig, SessionManager, TokenGrant,
};

pub(crate) fn test_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        attempt_timeout: Duration::from_secs(2),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(100),
        multiplier: 2.0,
        kind: BackoffKind::Fixed,
    }
}

fn grant() -> TokenGrant {
    TokenGrant {
        token: "test-token".into(),
        refresh_token: "test-refresh".into(),
        expires_in: 3600,
    }
}

/// Grants every request.
pub(crate) struct StaticAuth;

#[async_trait]
impl AuthApi for StaticAuth {
    async fn login(&self, _credentials: &Credentials) -> Result<LoginChallenge, TransportError> {
        Ok(LoginChallenge::Authenticated(grant()))
    }

    async fn complete_second_factor(&self, _process_id: &str, _code: &str) -> Result<TokenGrant, TransportError> {
        Ok(grant())
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, TransportError> {
        Ok(grant())
    }

    async fn logout(&self, _token: &str) -> Result<(), TransportError> {
        Ok(())
    }
}

pub(crate) async fn authenticated_session() -> SessionManager {
    let config = SessionConfig {
        retry: test_retry_policy(),
        ..Default::default()
    };
    let manager = SessionManager::new(Arc::new(StaticAuth), Credentials::new("user", "pin"), config);
    manager.install_session(Session::from_grant(grant(), Utc::now())).await;
    manager
}

/// Scripted outcome for the next order submission.
enum OrderScript {
    Reject(String),
    /// Accept the order, then lose the response
    LoseResponse,
}

/// Broker that fills market orders at the quote and can be scripted to fail.
pub(crate) struct MockBroker {
    pub calls: AtomicU32,
    quotes: Mutex<HashMap<String, Quote>>,
    cash: Mutex<Decimal>,
    failures: Mutex<VecDeque<TransportError>>,
    orders: Mutex<Vec<OrderRequest>>,
    statuses: Mutex<HashMap<String, OrderStatus>>,
    closed: Mutex<HashSet<AssetClass>>,
    hold_fills: AtomicBool,
    order_script: Mutex<VecDeque<OrderScript>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            quotes: Mutex::new(HashMap::new()),
            cash: Mutex::new(Decimal::from(100_000)),
            failures: Mutex::new(VecDeque::new()),
            orders: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
            closed: Mutex::new(HashSet::new()),
            hold_fills: AtomicBool::new(false),
            order_script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_quote(&self, isin: &str, bid: Decimal, ask: Decimal) {
        self.quotes.lock().unwrap().insert(
            isin.to_string(),
            Quote {
                isin: isin.to_string(),
                bid,
                ask,
                last: None,
                timestamp: Utc::now(),
            },
        );
    }

    /// Make the next call fail with `error`.
    pub fn fail_next(&self, error: TransportError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn close_market(&self, asset_class: AssetClass) {
        self.closed.lock().unwrap().insert(asset_class);
    }

    /// Leave new orders open instead of filling them.
    pub fn hold_fills(&self, hold: bool) {
        self.hold_fills.store(hold, Ordering::SeqCst);
    }

    /// Fill a held order at `price`.
    pub fn fill(&self, client_order_id: &str, price: Decimal) {
        if let Some(status) = self.statuses.lock().unwrap().get_mut(client_order_id) {
            status.state = OrderState::Filled;
            status.average_fill_price = Some(price);
            status.filled_quantity = self
                .orders
                .lock()
                .unwrap()
                .iter()
                .find(|o| o.client_order_id == client_order_id)
                .map(|o| o.quantity)
                .unwrap_or_default();
        }
    }

    /// End a held order with only `quantity` filled and the rest cancelled.
    pub fn fill_partially(&self, client_order_id: &str, quantity: Decimal, price: Decimal) {
        if let Some(status) = self.statuses.lock().unwrap().get_mut(client_order_id) {
            status.state = OrderState::Cancelled;
            status.average_fill_price = Some(price);
            status.filled_quantity = quantity;
        }
    }

    pub fn order_state(&self, client_order_id: &str) -> Option<OrderState> {
        self.statuses.lock().unwrap().get(client_order_id).map(|s| s.state)
    }

    /// Answer the next order with a broker-side rejection.
    pub fn reject_next_order(&self, reason: &str) {
        self.order_script
            .lock()
            .unwrap()
            .push_back(OrderScript::Reject(reason.to_string()));
    }

    /// Accept the next order but time out before the response arrives.
    pub fn lose_next_order_response(&self) {
        self.order_script.lock().unwrap().push_back(OrderScript::LoseResponse);
    }

    /// Drop an order from the broker's books, as after an expiry purge.
    pub fn forget_order(&self, client_order_id: &str) {
        self.statuses.lock().unwrap().remove(client_order_id);
    }

    pub fn submitted(&self) -> Vec<OrderRequest> {
        self.orders.lock().unwrap().clone()
    }

    fn begin_call(&self) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failures.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn quote(&self, isin: &str) -> Result<Quote, TransportError> {
        self.quotes
            .lock()
            .unwrap()
            .get(isin)
            .cloned()
            .ok_or_else(|| TransportError::Client {
                status: 404,
                body: format!("unknown instrument {}", isin),
            })
    }

    fn status_for(&self, order_id: &str) -> Result<OrderStatus, TransportError> {
        let statuses = self.statuses.lock().unwrap();
        statuses
            .get(order_id)
            .or_else(|| statuses.values().find(|s| s.order_id == order_id))
            .cloned()
            .ok_or_else(|| TransportError::Client {
                status: 404,
                body: format!("unknown order {}", order_id),
            })
    }
}

#[async_trait]
impl BrokerApi for MockBroker {
    async fn get_quote(&self, _token: &str, isin: &str) -> Result<Quote, TransportError> {
        self.begin_call()?;
        self.quote(isin)
    }

    async fn get_order_book(&self, _token: &str, isin: &str) -> Result<OrderBook, TransportError> {
        self.begin_call()?;
        let quote = self.quote(isin)?;
        Ok(OrderBook {
            isin: isin.to_string(),
            bids: vec![BookLevel { price: quote.bid, size: Decimal::from(100) }],
            asks: vec![BookLevel { price: quote.ask, size: Decimal::from(100) }],
        })
    }

    async fn get_portfolio(&self, _token: &str) -> Result<Vec<PortfolioPosition>, TransportError> {
        self.begin_call()?;
        Ok(Vec::new())
    }

    async fn get_cash_balance(&self, _token: &str) -> Result<CashBalance, TransportError> {
        self.begin_call()?;
        Ok(CashBalance {
            available: *self.cash.lock().unwrap(),
            currency: "EUR".into(),
        })
    }

    async fn place_order(&self, _token: &str, order: &OrderRequest) -> Result<OrderStatus, TransportError> {
        self.begin_call()?;
        let quote = self.quote(&order.isin)?;
        let price = order.limit_price.unwrap_or(match order.side {
            OrderSide::Buy => quote.ask,
            OrderSide::Sell => quote.bid,
        });

        let script = self.order_script.lock().unwrap().pop_front();
        let held = self.hold_fills.load(Ordering::SeqCst);
        let mut status = OrderStatus {
            order_id: format!("broker-{}", self.orders.lock().unwrap().len() + 1),
            client_order_id: order.client_order_id.clone(),
            isin: order.isin.clone(),
            side: order.side,
            state: if held { OrderState::Open } else { OrderState::Filled },
            filled_quantity: if held { Decimal::ZERO } else { order.quantity },
            average_fill_price: (!held).then_some(price),
            fee: None,
            reason: None,
        };
        if let Some(OrderScript::Reject(reason)) = &script {
            status.state = OrderState::Rejected;
            status.filled_quantity = Decimal::ZERO;
            status.average_fill_price = None;
            status.reason = Some(reason.clone());
            return Ok(status);
        }

        self.orders.lock().unwrap().push(order.clone());
        self.statuses
            .lock()
            .unwrap()
            .insert(order.client_order_id.clone(), status.clone());
        if let Some(OrderScript::LoseResponse) = script {
            return Err(TransportError::Timeout(Duration::from_secs(2)));
        }
        Ok(status)
    }

    async fn modify_order(
        &self,
        _token: &str,
        order_id: &str,
        change: &OrderModification,
    ) -> Result<OrderStatus, TransportError> {
        self.begin_call()?;
        let status = self.status_for(order_id)?;
        if status.state.is_final() {
            return Err(TransportError::Client {
                status: 409,
                body: format!("order {} is {:?}", order_id, status.state),
            });
        }
        if let Some(quantity) = change.quantity {
            if quantity < status.filled_quantity {
                return Err(TransportError::Client {
                    status: 422,
                    body: "quantity below filled quantity".to_string(),
                });
            }
        }
        Ok(status)
    }

    async fn cancel_order(&self, _token: &str, order_id: &str) -> Result<OrderStatus, TransportError> {
        self.begin_call()?;
        let mut status = self.status_for(order_id)?;
        if !status.state.is_final() {
            status.state = OrderState::Cancelled;
            self.statuses
                .lock()
                .unwrap()
                .insert(status.client_order_id.clone(), status.clone());
        }
        Ok(status)
    }

    async fn get_order(&self, _token: &str, order_id: &str) -> Result<OrderStatus, TransportError> {
        self.begin_call()?;
        self.status_for(order_id)
    }

    async fn get_market_status(&self, _token: &str, asset_class: AssetClass) -> Result<MarketStatus, TransportError> {
        self.begin_call()?;
        Ok(MarketStatus {
            asset_class,
            open: !self.closed.lock().unwrap().contains(&asset_class),
            next_open: None,
        })
    }

    async fn search_instruments(
        &self,
        _token: &str,
        query: &str,
        asset_class: Option<AssetClass>,
    ) -> Result<Vec<InstrumentInfo>, TransportError> {
        self.begin_call()?;
        Ok(self
            .quotes
            .lock()
            .unwrap()
            .keys()
            .filter(|isin| isin.contains(query))
            .map(|isin| InstrumentInfo {
                isin: isin.clone(),
                name: String::new(),
                asset_class: asset_class.unwrap_or(AssetClass::Equity),
                tradable: true,
            })
            .collect())
    }
}
