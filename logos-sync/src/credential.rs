//! Access credential source and expiry inspection.
//!
//! Token storage belongs to the application; the connection manager only
//! needs the current token, a way to refresh it, and the `exp` claim of a
//! JWT-shaped token to decide when to refresh proactively.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::AuthError;

/// Supplies the shared credential for every sub-channel.
pub trait CredentialSource: Send + Sync + 'static {
    /// Current token, if the user is signed in.
    fn current(&self) -> Option<String>;

    /// Obtain a fresh token. The returned token becomes `current()`.
    fn refresh(&self) -> BoxFuture<'static, Result<String, AuthError>>;
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<u64>,
}

/// Expiry of a JWT-shaped token as seconds since the Unix epoch.
///
/// Returns `None` for opaque tokens or tokens without an `exp` claim; such
/// tokens are never refreshed proactively.
pub fn expires_at(token: &str) -> Option<u64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    claims.exp
}

/// Time left before `token` expires; zero when already expired.
pub fn time_to_expiry(token: &str) -> Option<Duration> {
    let exp = expires_at(token)?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    Some(Duration::from_secs(exp.saturating_sub(now)))
}

/// Whether `token` should be refreshed given the refresh `threshold`.
pub fn needs_refresh(token: &str, threshold: Duration) -> bool {
    time_to_expiry(token).is_some_and(|left| left <= threshold)
}

/// In-memory credential with no refresh endpoint.
///
/// Useful for anonymous sessions and tests; `refresh` fails unless a
/// replacement has been staged with [`StaticCredential::stage_refresh`].
#[derive(Clone, Default)]
pub struct StaticCredential {
    inner: Arc<RwLock<StaticInner>>,
}

#[derive(Default)]
struct StaticInner {
    token: Option<String>,
    staged: Option<String>,
    refreshes: u32,
}

impl StaticCredential {
    pub fn new(token: Option<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StaticInner {
                token,
                staged: None,
                refreshes: 0,
            })),
        }
    }

    /// Token handed out by the next successful `refresh()`.
    pub fn stage_refresh(&self, token: impl Into<String>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.staged = Some(token.into());
        }
    }

    /// Number of refresh calls observed.
    pub fn refresh_count(&self) -> u32 {
        self.inner.read().map(|i| i.refreshes).unwrap_or(0)
    }
}

impl CredentialSource for StaticCredential {
    fn current(&self) -> Option<String> {
        self.inner.read().ok().and_then(|i| i.token.clone())
    }

    fn refresh(&self) -> BoxFuture<'static, Result<String, AuthError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut inner = inner
                .write()
                .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;
            inner.refreshes += 1;
            match inner.staged.take() {
                Some(token) => {
                    inner.token = Some(token.clone());
                    Ok(token)
                }
                None => Err(AuthError::RefreshFailed("no refresh endpoint".into())),
            }
        })
    }
}
