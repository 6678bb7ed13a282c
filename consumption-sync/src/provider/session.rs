use std::sync::Arc;

use tokio::sync::Mutex;

use super::{Credentials, ProviderClient, ProviderError};

enum SessionState<S> {
    LoggedOut,
    Active(Arc<S>),
    /// The portal refused the credentials; no further login until they change.
    Rejected(String),
}

struct Inner<S> {
    credentials: Credentials,
    state: SessionState<S>,
}

/// Owns the one portal session shared by every installation of an account.
///
/// Logins happen lazily and one at a time: callers that arrive while a login
/// is in progress wait for it and reuse its session.
pub struct SessionManager<P: ProviderClient> {
    provider: Arc<P>,
    inner: Mutex<Inner<P::Session>>,
}

impl<P: ProviderClient> SessionManager<P> {
    pub fn new(provider: Arc<P>, credentials: Credentials) -> Self {
        Self {
            provider,
            inner: Mutex::new(Inner {
                credentials,
                state: SessionState::LoggedOut,
            }),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Current session, logging in first if there is none.
    pub async fn session(&self) -> Result<Arc<P::Session>, ProviderError> {
        // Held across the login so concurrent callers never log in twice.
        let mut inner = self.inner.lock().await;
        match &inner.state {
            SessionState::Active(session) => return Ok(session.clone()),
            SessionState::Rejected(reason) => {
                return Err(ProviderError::Authentication(format!(
                    "credentials previously rejected, re-enter them to resume: {reason}"
                )))
            }
            SessionState::LoggedOut => {}
        }

        tracing::info!(provider = self.provider.name(), "logging in to provider portal");
        match self.provider.authenticate(&inner.credentials).await {
            Ok(session) => {
                metrics::counter!("provider_logins_total", "result" => "ok").increment(1);
                let session = Arc::new(session);
                inner.state = SessionState::Active(session.clone());
                Ok(session)
            }
            Err(ProviderError::Authentication(reason)) => {
                metrics::counter!("provider_logins_total", "result" => "rejected").increment(1);
                tracing::error!(provider = self.provider.name(), %reason, "provider login rejected");
                inner.state = SessionState::Rejected(reason.clone());
                Err(ProviderError::Authentication(reason))
            }
            Err(e) => {
                metrics::counter!("provider_logins_total", "result" => "error").increment(1);
                tracing::warn!(provider = self.provider.name(), error = %e, "provider login failed");
                Err(e)
            }
        }
    }

    /// Drop `stale` after the portal refused it. A session that was already
    /// replaced by another caller is left alone.
    pub async fn invalidate(&self, stale: &Arc<P::Session>) {
        let mut inner = self.inner.lock().await;
        if let SessionState::Active(current) = &inner.state {
            if Arc::ptr_eq(current, stale) {
                tracing::info!(provider = self.provider.name(), "provider session invalidated");
                inner.state = SessionState::LoggedOut;
            }
        }
    }

    /// Replace the credentials and clear any rejection.
    pub async fn update_credentials(&self, credentials: Credentials) {
        let mut inner = self.inner.lock().await;
        inner.credentials = credentials;
        inner.state = SessionState::LoggedOut;
    }

    pub async fn is_rejected(&self) -> bool {
        matches!(self.inner.lock().await.state, SessionState::Rejected(_))
    }
}
