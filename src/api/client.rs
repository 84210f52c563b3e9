//! Typed access to the broker for the trading loop.
//!
//! Every call checks the session first and fails without I/O when there is
//! no usable session. Reads retry transient failures. Orders are retried only
//! when the broker cannot have seen them; anything else after sending is
//! surfaced as an ambiguous outcome for reconciliation.

use std::sync::Arc;

use tracing::{debug, warn};

use super::broker::BrokerApi;
use super::retry::{RetryFailure, RetryPolicy};
use super::types::*;
use crate::error::{AuthenticationError, TradingError, TransportError};
use crate::models::AssetClass;
use crate::session::SessionManager;

pub struct MarketApiClient {
    broker: Arc<dyn BrokerApi>,
    session: SessionManager,
    retry: RetryPolicy,
}

impl MarketApiClient {
    pub fn new(broker: Arc<dyn BrokerApi>, session: SessionManager, retry: RetryPolicy) -> Self {
        Self { broker, session, retry }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub async fn get_price(&self, isin: &str) -> Result<Quote, TradingError> {
        self.read("get_price", |token| async move {
            self.broker.get_quote(&token, isin).await
        })
        .await
    }

    pub async fn get_order_book(&self, isin: &str) -> Result<OrderBook, TradingError> {
        self.read("get_order_book", |token| async move {
            self.broker.get_order_book(&token, isin).await
        })
        .await
    }

    pub async fn get_portfolio(&self) -> Result<Vec<PortfolioPosition>, TradingError> {
        self.read("get_portfolio", |token| async move {
            self.broker.get_portfolio(&token).await
        })
        .await
    }

    pub async fn get_cash_balance(&self) -> Result<CashBalance, TradingError> {
        self.read("get_cash_balance", |token| async move {
            self.broker.get_cash_balance(&token).await
        })
        .await
    }

    pub async fn get_order(&self, order_id: &str) -> Result<OrderStatus, TradingError> {
        self.read("get_order", |token| async move {
            self.broker.get_order(&token, order_id).await
        })
        .await
    }

    pub async fn get_market_status(&self, asset_class: AssetClass) -> Result<MarketStatus, TradingError> {
        self.read("get_market_status", |token| async move {
            self.broker.get_market_status(&token, asset_class).await
        })
        .await
    }

    pub async fn search_instruments(
        &self,
        query: &str,
        asset_class: Option<AssetClass>,
    ) -> Result<Vec<InstrumentInfo>, TradingError> {
        self.read("search_instruments", |token| async move {
            self.broker.search_instruments(&token, query, asset_class).await
        })
        .await
    }

    /// Submit an order. The client order id makes a resubmission after a
    /// pre-send failure safe.
    pub async fn place_order(&self, order: &OrderRequest) -> Result<OrderStatus, TradingError> {
        let status = self
            .write("place_order", &order.client_order_id, |token| async move {
                self.broker.place_order(&token, order).await
            })
            .await?;

        if status.state == OrderState::Rejected {
            let reason = status.reason.unwrap_or_else(|| "no reason given".to_string());
            warn!(client_order_id = %order.client_order_id, reason = %reason, "Order rejected by broker");
            return Err(TradingError::OrderRejected(reason));
        }
        Ok(status)
    }

    pub async fn modify_order(
        &self,
        order_id: &str,
        change: &OrderModification,
    ) -> Result<OrderStatus, TradingError> {
        if change.is_empty() {
            return Err(TradingError::OrderRejected("modification changes nothing".to_string()));
        }
        self.write("modify_order", order_id, |token| async move {
            self.broker.modify_order(&token, order_id, change).await
        })
        .await
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<OrderStatus, TradingError> {
        self.write("cancel_order", order_id, |token| async move {
            self.broker.cancel_order(&token, order_id).await
        })
        .await
    }

    async fn read<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, TradingError>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<T, TransportError>>,
    {
        let token = self.session.bearer().await?;

        match self
            .retry
            .run(operation, TransportError::is_transient, |_| call(token.clone()))
            .await
        {
            Ok(value) => Ok(value),
            Err(failure) => Err(self.read_error(failure).await),
        }
    }

    async fn write<T, F, Fut>(&self, operation: &str, order_id: &str, mut call: F) -> Result<T, TradingError>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<T, TransportError>>,
    {
        let token = self.session.bearer().await?;

        match self
            .retry
            .run(operation, TransportError::is_pre_send, |_| call(token.clone()))
            .await
        {
            Ok(value) => Ok(value),
            Err(failure) => {
                let err = self.write_error(failure).await;
                warn!(operation, order_id, error = %err, "Order operation failed");
                Err(err)
            }
        }
    }

    async fn read_error(&self, failure: RetryFailure) -> TradingError {
        match failure.last_error {
            TransportError::Unauthorized(reason) => self.invalidated(reason).await,
            error if failure.exhausted => TradingError::TransientNetwork {
                attempts: failure.attempts,
                source: error,
            },
            error => TradingError::Remote(error),
        }
    }

    async fn write_error(&self, failure: RetryFailure) -> TradingError {
        match failure.last_error {
            TransportError::Client { body, .. } => TradingError::OrderRejected(body),
            TransportError::Unauthorized(reason) => self.invalidated(reason).await,
            // Never reached the broker, so there is nothing to reconcile.
            error if error.is_pre_send() => TradingError::TransientNetwork {
                attempts: failure.attempts,
                source: error,
            },
            error => TradingError::AmbiguousOrder(error),
        }
    }

    async fn invalidated(&self, reason: String) -> TradingError {
        debug!(reason = %reason, "Broker rejected the session token");
        self.session.invalidate().await;
        AuthenticationError::SessionInvalidated(reason).into()
    }
}
