//! Broker session: credentials, the token pair and the manager that keeps it alive.

mod auth;
mod manager;

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use auth::{AuthApi, EnvSecondFactor, LoginChallenge, SecondFactorProvider, StdinSecondFactor, TokenGrant};
pub use manager::{SessionConfig, SessionManager};

/// Login identity. Read from the environment, never logged and never persisted.
#[derive(Clone)]
pub struct Credentials {
    pub identifier: String,
    secret: String,
}

impl Credentials {
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            secret: secret.into(),
        }
    }

    /// Create from environment variables:
    /// - BROKER_IDENTIFIER
    /// - BROKER_SECRET
    pub fn from_env() -> Result<Self> {
        let identifier = std::env::var("BROKER_IDENTIFIER").context("BROKER_IDENTIFIER not set")?;
        let secret = std::env::var("BROKER_SECRET").context("BROKER_SECRET not set")?;
        Ok(Self::new(identifier, secret))
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// An authenticated session. Only the session manager holds one.
#[derive(Clone)]
pub struct Session {
    token: String,
    refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub authenticated_at: DateTime<Utc>,
}

impl Session {
    pub fn from_grant(grant: TokenGrant, now: DateTime<Utc>) -> Self {
        let lifetime = chrono::Duration::seconds(grant.expires_in as i64);
        Self {
            token: grant.token,
            refresh_token: grant.refresh_token,
            expires_at: now + lifetime,
            authenticated_at: now,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    /// Whether the session expires within `buffer` of `now`.
    pub fn needs_refresh(&self, buffer: Duration, now: DateTime<Utc>) -> bool {
        let buffer = chrono::Duration::from_std(buffer).unwrap_or_else(|_| chrono::Duration::weeks(52));
        self.expires_at - now <= buffer
    }

    pub fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            authenticated_at: self.authenticated_at,
            expires_at: self.expires_at,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("authenticated_at", &self.authenticated_at)
            .finish()
    }
}

/// The part of a session that may be persisted and reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub authenticated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
