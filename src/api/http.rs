//! reqwest implementation of the broker REST API.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::broker::BrokerApi;
use super::types::*;
use crate::error::TransportError;
use crate::models::AssetClass;
use crate::session::{AuthApi, Credentials, LoginChallenge, TokenGrant};

pub const DEFAULT_BASE_URL: &str = "https://api.broker.example/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the broker's REST API.
pub struct HttpBroker {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    identifier: &'a str,
    secret: &'a str,
}

#[derive(Serialize)]
struct SecondFactorRequest<'a> {
    code: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LoginResponse {
    Granted(TokenGrant),
    #[serde(rename_all = "camelCase")]
    SecondFactor { process_id: String },
}

impl HttpBroker {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Create from `BROKER_API_URL`, falling back to the default endpoint.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("BROKER_API_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(base_url)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, TransportError> {
        let response = Self::checked(request).await?;
        response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn checked(request: RequestBuilder) -> Result<reqwest::Response, TransportError> {
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.message)
                .unwrap_or(body);
            return Err(TransportError::from_status(status.as_u16(), message));
        }
        Ok(response)
    }
}

#[async_trait]
impl AuthApi for HttpBroker {
    async fn login(&self, credentials: &Credentials) -> Result<LoginChallenge, TransportError> {
        debug!("Sending login request");
        let body = LoginRequest {
            identifier: &credentials.identifier,
            secret: credentials.secret(),
        };
        let response: LoginResponse = self
            .send(self.client.post(self.url("/auth/login")).json(&body))
            .await?;

        Ok(match response {
            LoginResponse::Granted(grant) => LoginChallenge::Authenticated(grant),
            LoginResponse::SecondFactor { process_id } => LoginChallenge::SecondFactor { process_id },
        })
    }

    async fn complete_second_factor(&self, process_id: &str, code: &str) -> Result<TokenGrant, TransportError> {
        let url = self.url(&format!("/auth/login/{}/second-factor", process_id));
        self.send(self.client.post(url).json(&SecondFactorRequest { code }))
            .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TransportError> {
        self.send(
            self.client
                .post(self.url("/auth/refresh"))
                .json(&RefreshRequest { refresh_token }),
        )
        .await
    }

    async fn logout(&self, token: &str) -> Result<(), TransportError> {
        Self::checked(self.client.post(self.url("/auth/logout")).bearer_auth(token)).await?;
        Ok(())
    }
}

#[async_trait]
impl BrokerApi for HttpBroker {
    async fn get_quote(&self, token: &str, isin: &str) -> Result<Quote, TransportError> {
        let url = self.url(&format!("/instruments/{}/quote", isin));
        debug!(url = %url, "Fetching quote");
        self.send(self.client.get(url).bearer_auth(token)).await
    }

    async fn get_order_book(&self, token: &str, isin: &str) -> Result<OrderBook, TransportError> {
        let url = self.url(&format!("/instruments/{}/orderbook", isin));
        debug!(url = %url, "Fetching order book");
        self.send(self.client.get(url).bearer_auth(token)).await
    }

    async fn get_portfolio(&self, token: &str) -> Result<Vec<PortfolioPosition>, TransportError> {
        self.send(self.client.get(self.url("/portfolio")).bearer_auth(token))
            .await
    }

    async fn get_cash_balance(&self, token: &str) -> Result<CashBalance, TransportError> {
        self.send(self.client.get(self.url("/portfolio/cash")).bearer_auth(token))
            .await
    }

    async fn place_order(&self, token: &str, order: &OrderRequest) -> Result<OrderStatus, TransportError> {
        debug!(
            client_order_id = %order.client_order_id,
            isin = %order.isin,
            side = ?order.side,
            quantity = %order.quantity,
            "Submitting order"
        );
        self.send(self.client.post(self.url("/orders")).bearer_auth(token).json(order))
            .await
    }

    async fn modify_order(
        &self,
        token: &str,
        order_id: &str,
        change: &OrderModification,
    ) -> Result<OrderStatus, TransportError> {
        let url = self.url(&format!("/orders/{}", order_id));
        self.send(self.client.patch(url).bearer_auth(token).json(change))
            .await
    }

    async fn cancel_order(&self, token: &str, order_id: &str) -> Result<OrderStatus, TransportError> {
        let url = self.url(&format!("/orders/{}", order_id));
        self.send(self.client.delete(url).bearer_auth(token)).await
    }

    async fn get_order(&self, token: &str, order_id: &str) -> Result<OrderStatus, TransportError> {
        let url = self.url(&format!("/orders/{}", order_id));
        self.send(self.client.get(url).bearer_auth(token)).await
    }

    async fn get_market_status(
        &self,
        token: &str,
        asset_class: AssetClass,
    ) -> Result<MarketStatus, TransportError> {
        let url = self.url(&format!("/markets/{}/status", asset_class));
        self.send(self.client.get(url).bearer_auth(token)).await
    }

    async fn search_instruments(
        &self,
        token: &str,
        query: &str,
        asset_class: Option<AssetClass>,
    ) -> Result<Vec<InstrumentInfo>, TransportError> {
        let mut params = vec![("query", query.to_string())];
        if let Some(class) = asset_class {
            params.push(("type", class.to_string()));
        }

        self.send(
            self.client
                .get(self.url("/instruments"))
                .bearer_auth(token)
                .query(&params),
        )
        .await
    }
}
