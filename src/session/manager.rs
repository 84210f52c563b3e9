//! Session lifecycle: login, second factor, single-flight refresh and logout.
//!
//! At most one refresh runs per manager. It runs on its own task and every
//! caller that finds the session inside the refresh buffer awaits the same
//! shared outcome. The task clears the in-flight slot before it resolves, so
//! a later expiry always starts a fresh refresh, and a cancelled caller never
//! leaves the slot occupied.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::auth::{AuthApi, LoginChallenge, SecondFactorProvider};
use super::{Credentials, Session, SessionMetadata};
use crate::api::{RetryFailure, RetryPolicy};
use crate::error::{AuthenticationError, TransportError};

type RefreshOutcome = Result<(), AuthenticationError>;
type PendingRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Refresh once the session expires within this window
    pub refresh_buffer: Duration,

    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

enum Validity {
    Missing,
    Valid,
    Expiring,
}

struct Inner {
    auth: Arc<dyn AuthApi>,
    credentials: Credentials,
    config: SessionConfig,
    session: RwLock<Option<Session>>,
    pending: Mutex<Option<PendingRefresh>>,
}

/// Owns the broker session and keeps it valid.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(auth: Arc<dyn AuthApi>, credentials: Credentials, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                auth,
                credentials,
                config,
                session: RwLock::new(None),
                pending: Mutex::new(None),
            }),
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.session.read().await.is_some()
    }

    /// Timestamps of the current session, without its tokens.
    pub async fn session_metadata(&self) -> Option<SessionMetadata> {
        self.inner.session.read().await.as_ref().map(Session::metadata)
    }

    /// Make sure the session is usable for the next request.
    ///
    /// Returns immediately while the session is outside the refresh buffer.
    /// Inside the buffer, starts a refresh or joins the one in flight.
    pub async fn ensure_valid_session(&self) -> Result<(), AuthenticationError> {
        match self.inner.validity().await {
            Validity::Missing => return Err(AuthenticationError::NotAuthenticated),
            Validity::Valid => return Ok(()),
            Validity::Expiring => {}
        }

        let pending = {
            let mut slot = self.inner.pending.lock().await;
            match slot.as_ref() {
                Some(pending) => {
                    debug!("Joining in-flight session refresh");
                    pending.clone()
                }
                None => {
                    // A refresh may have completed while we waited for the slot.
                    match self.inner.validity().await {
                        Validity::Missing => return Err(AuthenticationError::NotAuthenticated),
                        Validity::Valid => return Ok(()),
                        Validity::Expiring => {}
                    }
                    let pending = Self::spawn_refresh(self.inner.clone());
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    /// Access token for a request, refreshing first if needed.
    pub async fn bearer(&self) -> Result<String, AuthenticationError> {
        self.ensure_valid_session().await?;
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.token().to_string())
            .ok_or(AuthenticationError::NotAuthenticated)
    }

    /// Log in, completing a second factor if the broker asks for one.
    /// Does nothing when a usable session already exists.
    pub async fn login(
        &self,
        second_factor: &dyn SecondFactorProvider,
    ) -> Result<SessionMetadata, AuthenticationError> {
        if self.is_authenticated().await && self.ensure_valid_session().await.is_ok() {
            if let Some(metadata) = self.session_metadata().await {
                debug!("Already authenticated");
                return Ok(metadata);
            }
        }

        info!("Logging in to broker");
        let retry = &self.inner.config.retry;

        let challenge = retry
            .run("login", TransportError::is_transient, |_| {
                let auth = self.inner.auth.clone();
                let credentials = self.inner.credentials.clone();
                async move { auth.login(&credentials).await }
            })
            .await
            .map_err(|f| login_error(f, AuthenticationError::CredentialsRejected))?;

        let grant = match challenge {
            LoginChallenge::Authenticated(grant) => grant,
            LoginChallenge::SecondFactor { process_id } => {
                info!("Broker requested a second factor");
                let code = second_factor
                    .code(&process_id)
                    .await
                    .ok_or(AuthenticationError::SecondFactorRequired)?;

                // A code is single use, so only retry when it cannot have arrived.
                retry
                    .run("second_factor", TransportError::is_pre_send, |_| {
                        let auth = self.inner.auth.clone();
                        let process_id = process_id.clone();
                        let code = code.clone();
                        async move { auth.complete_second_factor(&process_id, &code).await }
                    })
                    .await
                    .map_err(|f| login_error(f, AuthenticationError::SecondFactorRejected))?
            }
        };

        let session = Session::from_grant(grant, Utc::now());
        let metadata = session.metadata();
        *self.inner.session.write().await = Some(session);

        info!(expires_at = %metadata.expires_at, "Logged in");
        Ok(metadata)
    }

    /// Drop the session. The remote logout is best effort.
    pub async fn logout(&self) {
        let Some(session) = self.inner.session.write().await.take() else {
            return;
        };

        let timeout = self.inner.config.retry.attempt_timeout;
        match tokio::time::timeout(timeout, self.inner.auth.logout(session.token())).await {
            Ok(Ok(())) => info!("Logged out"),
            Ok(Err(e)) => warn!(error = %e, "Remote logout failed, local session dropped"),
            Err(_) => warn!("Remote logout timed out, local session dropped"),
        }
    }

    /// Drop the session locally after the broker rejected its token.
    pub async fn invalidate(&self) {
        if self.inner.session.write().await.take().is_some() {
            warn!("Session invalidated, login required");
        }
    }

    fn spawn_refresh(inner: Arc<Inner>) -> PendingRefresh {
        let task = tokio::spawn(async move {
            let outcome = inner.refresh().await;
            inner.pending.lock().await.take();
            outcome
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(AuthenticationError::RefreshFailed {
                    attempts: 0,
                    last_error: TransportError::Interrupted(format!("refresh task ended: {}", e)),
                })
            })
        }
        .boxed()
        .shared()
    }

    #[cfg(test)]
    pub(crate) async fn install_session(&self, session: Session) {
        *self.inner.session.write().await = Some(session);
    }
}

impl Inner {
    async fn validity(&self) -> Validity {
        match self.session.read().await.as_ref() {
            None => Validity::Missing,
            Some(s) if s.needs_refresh(self.config.refresh_buffer, Utc::now()) => Validity::Expiring,
            Some(_) => Validity::Valid,
        }
    }

    async fn refresh(&self) -> RefreshOutcome {
        let refresh_token = match self.session.read().await.as_ref() {
            Some(s) => s.refresh_token().to_string(),
            None => return Err(AuthenticationError::NotAuthenticated),
        };

        debug!("Refreshing broker session");
        let result = self
            .config
            .retry
            .run("session_refresh", TransportError::is_transient, |attempt| {
                let auth = self.auth.clone();
                let refresh_token = refresh_token.clone();
                async move {
                    debug!(attempt, "Session refresh attempt");
                    auth.refresh(&refresh_token).await
                }
            })
            .await;

        match result {
            Ok(grant) => {
                let session = Session::from_grant(grant, Utc::now());
                info!(expires_at = %session.expires_at, "Session refreshed");
                *self.session.write().await = Some(session);
                Ok(())
            }
            Err(failure) if is_rejection(&failure) => {
                warn!(error = %failure.last_error, "Refresh token rejected, dropping session");
                self.session.write().await.take();
                Err(AuthenticationError::SessionInvalidated(failure.last_error.to_string()))
            }
            Err(failure) => {
                warn!(
                    attempts = failure.attempts,
                    error = %failure.last_error,
                    "Session refresh failed, keeping session for the next cycle"
                );
                Err(AuthenticationError::RefreshFailed {
                    attempts: failure.attempts,
                    last_error: failure.last_error,
                })
            }
        }
    }
}

/// The broker answered and said no.
fn is_rejection(failure: &RetryFailure) -> bool {
    !failure.exhausted
        && matches!(
            failure.last_error,
            TransportError::Unauthorized(_) | TransportError::Client { .. }
        )
}

fn login_error(failure: RetryFailure, rejected: fn(String) -> AuthenticationError) -> AuthenticationError {
    if is_rejection(&failure) {
        rejected(failure.last_error.to_string())
    } else {
        AuthenticationError::LoginFailed {
            attempts: failure.attempts,
            last_error: failure.last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::BackoffKind;
    use crate::session::TokenGrant;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockAuth {
        refreshes: AtomicU32,
        logins: AtomicU32,
        refresh_delay: Duration,
        refresh_error: Option<TransportError>,
        second_factor: bool,
    }

    impl MockAuth {
        fn new() -> Self {
            Self {
                refreshes: AtomicU32::new(0),
                logins: AtomicU32::new(0),
                refresh_delay: Duration::from_millis(50),
                refresh_error: None,
                second_factor: false,
            }
        }

        fn failing(error: TransportError) -> Self {
            Self {
                refresh_error: Some(error),
                ..Self::new()
            }
        }
    }

    fn grant(expires_in: u64) -> TokenGrant {
        TokenGrant {
            token: "token".into(),
            refresh_token: "refresh".into(),
            expires_in,
        }
    }

    #[async_trait]
    impl AuthApi for MockAuth {
        async fn login(&self, _credentials: &Credentials) -> Result<LoginChallenge, TransportError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if self.second_factor {
                Ok(LoginChallenge::SecondFactor { process_id: "proc-1".into() })
            } else {
                Ok(LoginChallenge::Authenticated(grant(3600)))
            }
        }

        async fn complete_second_factor(
            &self,
            process_id: &str,
            code: &str,
        ) -> Result<TokenGrant, TransportError> {
            if process_id == "proc-1" && code == "123456" {
                Ok(grant(3600))
            } else {
                Err(TransportError::Client { status: 400, body: "wrong code".into() })
            }
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, TransportError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.refresh_delay).await;
            match &self.refresh_error {
                Some(e) => Err(e.clone()),
                None => Ok(grant(3600)),
            }
        }

        async fn logout(&self, _token: &str) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct FixedCode(Option<&'static str>);

    #[async_trait]
    impl SecondFactorProvider for FixedCode {
        async fn code(&self, _process_id: &str) -> Option<String> {
            self.0.map(String::from)
        }
    }

    fn manager(auth: Arc<MockAuth>) -> SessionManager {
        let config = SessionConfig {
            refresh_buffer: Duration::from_secs(60),
            retry: RetryPolicy {
                max_attempts: 2,
                attempt_timeout: Duration::from_secs(5),
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(1),
                multiplier: 2.0,
                kind: BackoffKind::Fixed,
            },
        };
        SessionManager::new(auth, Credentials::new("user", "pin"), config)
    }

    async fn expiring(manager: &SessionManager) {
        manager.install_session(Session::from_grant(grant(10), Utc::now())).await;
    }

    async fn concurrent_ensure(manager: &SessionManager, callers: usize) -> Vec<RefreshOutcome> {
        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.ensure_valid_session().await })
            })
            .collect();

        futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_refresh() {
        let auth = Arc::new(MockAuth::new());
        let manager = manager(auth.clone());
        expiring(&manager).await;

        let outcomes = concurrent_ensure(&manager, 16).await;
        assert!(outcomes.iter().all(|o| o.is_ok()));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);

        // Fresh session: no further I/O.
        manager.ensure_valid_session().await.unwrap();
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);

        // A later expiry starts exactly one new refresh.
        expiring(&manager).await;
        let outcomes = concurrent_ensure(&manager, 4).await;
        assert!(outcomes.iter().all(|o| o.is_ok()));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_reaches_every_waiter() {
        let auth = Arc::new(MockAuth::failing(TransportError::Server {
            status: 503,
            body: "maintenance".into(),
        }));
        let manager = manager(auth.clone());
        expiring(&manager).await;

        let outcomes = concurrent_ensure(&manager, 5).await;
        let expected = Err(AuthenticationError::RefreshFailed {
            attempts: 2,
            last_error: TransportError::Server { status: 503, body: "maintenance".into() },
        });
        assert!(outcomes.iter().all(|o| *o == expected));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 2);

        // Transient failure keeps the session and frees the slot.
        assert!(manager.is_authenticated().await);
        assert!(manager.ensure_valid_session().await.is_err());
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_refresh_token_invalidates_session() {
        let auth = Arc::new(MockAuth::failing(TransportError::Unauthorized("revoked".into())));
        let manager = manager(auth.clone());
        expiring(&manager).await;

        let err = manager.ensure_valid_session().await.unwrap_err();
        assert!(matches!(err, AuthenticationError::SessionInvalidated(_)));
        assert!(err.is_fatal());
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);

        assert_eq!(
            manager.ensure_valid_session().await,
            Err(AuthenticationError::NotAuthenticated)
        );
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unauthenticated_fails_without_io() {
        let auth = Arc::new(MockAuth::new());
        let manager = manager(auth.clone());

        assert_eq!(manager.bearer().await, Err(AuthenticationError::NotAuthenticated));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_strand_refresh() {
        let auth = Arc::new(MockAuth::new());
        let manager = manager(auth.clone());
        expiring(&manager).await;

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure_valid_session().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();

        manager.ensure_valid_session().await.unwrap();
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
        assert!(manager.inner.pending.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_login_with_second_factor() {
        let auth = Arc::new(MockAuth {
            second_factor: true,
            ..MockAuth::new()
        });
        let manager = manager(auth.clone());

        assert_eq!(
            manager.login(&FixedCode(None)).await,
            Err(AuthenticationError::SecondFactorRequired)
        );
        assert!(matches!(
            manager.login(&FixedCode(Some("000000"))).await,
            Err(AuthenticationError::SecondFactorRejected(_))
        ));

        manager.login(&FixedCode(Some("123456"))).await.unwrap();
        assert_eq!(manager.bearer().await.unwrap(), "token");
    }

    #[tokio::test]
    async fn test_login_is_idempotent() {
        let auth = Arc::new(MockAuth::new());
        let manager = manager(auth.clone());

        manager.login(&FixedCode(None)).await.unwrap();
        manager.login(&FixedCode(None)).await.unwrap();
        assert_eq!(auth.logins.load(Ordering::SeqCst), 1);

        manager.logout().await;
        assert!(!manager.is_authenticated().await);
    }
}
