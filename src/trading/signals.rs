//! Source of indicator scores and ATR per instrument.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::api::RetryPolicy;
use crate::error::{TradingError, TransportError};
use crate::models::{Instrument, SignalInputs};

/// Indicator computation is external; this is all the trading loop needs from it.
#[async_trait]
pub trait SignalProvider: Send + Sync {
    async fn signal_inputs(&self, instrument: &Instrument) -> Result<SignalInputs, TradingError>;
}

/// Fetches `GET {base_url}/signals/{isin}`.
pub struct HttpSignalProvider {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpSignalProvider {
    pub fn new(base_url: impl Into<String>, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        })
    }

    async fn fetch(&self, url: &str) -> Result<SignalInputs, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status, body));
        }

        response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[async_trait]
impl SignalProvider for HttpSignalProvider {
    async fn signal_inputs(&self, instrument: &Instrument) -> Result<SignalInputs, TradingError> {
        let url = format!("{}/signals/{}", self.base_url, instrument.isin);
        debug!(url = %url, "Fetching signals");

        self.retry
            .run("signal_inputs", TransportError::is_transient, |_| self.fetch(&url))
            .await
            .map_err(|f| {
                TradingError::Signal(format!(
                    "{} after {} attempt(s): {}",
                    instrument.isin, f.attempts, f.last_error
                ))
            })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Serves fixed inputs per ISIN and counts requests.
    #[derive(Default)]
    pub(crate) struct StaticSignals {
        inputs: Mutex<HashMap<String, SignalInputs>>,
        pub requests: Mutex<Vec<String>>,
    }

    impl StaticSignals {
        pub fn set(&self, isin: &str, inputs: SignalInputs) {
            self.inputs.lock().unwrap().insert(isin.to_string(), inputs);
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SignalProvider for StaticSignals {
        async fn signal_inputs(&self, instrument: &Instrument) -> Result<SignalInputs, TradingError> {
            self.requests.lock().unwrap().push(instrument.isin.clone());
            self.inputs
                .lock()
                .unwrap()
                .get(&instrument.isin)
                .cloned()
                .ok_or_else(|| TradingError::Signal(format!("no signals for {}", instrument.isin)))
        }
    }
}
