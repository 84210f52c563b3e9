//! Raw broker endpoints. Every call takes the bearer token and reports
//! failures as a classified `TransportError`; retry and session handling
//! live in `MarketApiClient`.

use async_trait::async_trait;

use super::types::*;
use crate::error::TransportError;
use crate::models::AssetClass;

#[async_trait]
pub trait BrokerApi: Send + Sync {
    async fn get_quote(&self, token: &str, isin: &str) -> Result<Quote, TransportError>;

    async fn get_order_book(&self, token: &str, isin: &str) -> Result<OrderBook, TransportError>;

    async fn get_portfolio(&self, token: &str) -> Result<Vec<PortfolioPosition>, TransportError>;

    async fn get_cash_balance(&self, token: &str) -> Result<CashBalance, TransportError>;

    async fn place_order(&self, token: &str, order: &OrderRequest) -> Result<OrderStatus, TransportError>;

    async fn modify_order(
        &self,
        token: &str,
        order_id: &str,
        change: &OrderModification,
    ) -> Result<OrderStatus, TransportError>;

    async fn cancel_order(&self, token: &str, order_id: &str) -> Result<OrderStatus, TransportError>;

    /// Look an order up by broker order id or client order id.
    async fn get_order(&self, token: &str, order_id: &str) -> Result<OrderStatus, TransportError>;

    async fn get_market_status(
        &self,
        token: &str,
        asset_class: AssetClass,
    ) -> Result<MarketStatus, TransportError>;

    async fn search_instruments(
        &self,
        token: &str,
        query: &str,
        asset_class: Option<AssetClass>,
    ) -> Result<Vec<InstrumentInfo>, TransportError>;
}
