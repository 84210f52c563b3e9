//! Remote authentication contract and second-factor code sources.

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use super::Credentials;
use crate::error::TransportError;

/// Token pair issued by the broker.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    #[serde(alias = "sessionToken")]
    pub token: String,
    pub refresh_token: String,
    /// Lifetime of `token` in seconds
    pub expires_in: u64,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// Outcome of the first login step.
#[derive(Debug, Clone)]
pub enum LoginChallenge {
    Authenticated(TokenGrant),
    /// The broker wants a second-factor code for this login process.
    SecondFactor { process_id: String },
}

/// Authentication endpoints of the broker.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<LoginChallenge, TransportError>;

    async fn complete_second_factor(
        &self,
        process_id: &str,
        code: &str,
    ) -> Result<TokenGrant, TransportError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TransportError>;

    async fn logout(&self, token: &str) -> Result<(), TransportError>;
}

/// Source of second-factor codes.
#[async_trait]
pub trait SecondFactorProvider: Send + Sync {
    /// Code for `process_id`, or `None` if none can be obtained.
    async fn code(&self, process_id: &str) -> Option<String>;
}

/// Reads the code from `BROKER_SECOND_FACTOR`.
pub struct EnvSecondFactor;

#[async_trait]
impl SecondFactorProvider for EnvSecondFactor {
    async fn code(&self, _process_id: &str) -> Option<String> {
        std::env::var("BROKER_SECOND_FACTOR")
            .ok()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
    }
}

/// Prompts on the terminal.
pub struct StdinSecondFactor;

#[async_trait]
impl SecondFactorProvider for StdinSecondFactor {
    async fn code(&self, _process_id: &str) -> Option<String> {
        eprint!("Enter the second-factor code from your broker app: ");

        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        match reader.read_line(&mut line).await {
            Ok(0) => None,
            Ok(_) => Some(line.trim().to_string()).filter(|c| !c.is_empty()),
            Err(e) => {
                warn!(error = %e, "Failed to read second-factor code");
                None
            }
        }
    }
}
