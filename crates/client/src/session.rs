//! Anonymous session lifecycle
//!
//! A session token is acquired from the project id, held in memory only, and
//! renewed shortly before it expires. Exactly one renewal is pending per live
//! token; acquiring again cancels the previous one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinHandle;

use fleety_shared::{ProjectId, WidgetResult};

use crate::api::ApiClient;
use crate::timer::Timer;

/// Anonymous bearer credential for the chat endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub token: String,
    pub expires_at: OffsetDateTime,
    pub project_id: ProjectId,
}

impl SessionToken {
    pub fn bearer(&self) -> &str {
        &self.token
    }

    pub fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc() >= self.expires_at
    }

    /// Lifetime left before the backend stops accepting the token
    pub fn remaining(&self) -> Duration {
        let left = self.expires_at - OffsetDateTime::now_utc();
        Duration::try_from(left).unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("project_id", &self.project_id)
            .finish()
    }
}

struct SessionInner {
    api: ApiClient,
    project_id: ProjectId,
    renew_after: Duration,
    timer: Arc<dyn Timer>,
    token: RwLock<Option<SessionToken>>,
    /// Pending renewal tagged with the id of the acquisition that scheduled it
    renewal: Mutex<Option<(u64, JoinHandle<()>)>>,
    next_renewal_id: AtomicU64,
    /// Serializes acquisitions so concurrent callers share one round trip
    acquire_lock: tokio::sync::Mutex<()>,
}

/// Owns the current session token and its renewal timer
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(
        api: ApiClient,
        project_id: ProjectId,
        renew_after: Duration,
        timer: Arc<dyn Timer>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                api,
                project_id,
                renew_after,
                timer,
                token: RwLock::new(None),
                renewal: Mutex::new(None),
                next_renewal_id: AtomicU64::new(0),
                acquire_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.inner.project_id
    }

    /// Current token, if one is held and has not expired
    pub fn token(&self) -> Option<SessionToken> {
        self.inner
            .token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|t| !t.is_expired())
            .cloned()
    }

    /// Request a fresh token and schedule its renewal.
    ///
    /// On failure the held token is cleared and no renewal is pending.
    pub async fn acquire(&self) -> WidgetResult<SessionToken> {
        let _guard = self.inner.acquire_lock.lock().await;
        self.acquire_locked().await
    }

    /// Return the held token, acquiring one first if there is none
    pub async fn ensure_token(&self) -> WidgetResult<SessionToken> {
        if let Some(token) = self.token() {
            return Ok(token);
        }
        let _guard = self.inner.acquire_lock.lock().await;
        // Another caller may have finished acquiring while we waited
        if let Some(token) = self.token() {
            return Ok(token);
        }
        self.acquire_locked().await
    }

    /// Drop the held token after the backend rejected it
    pub fn invalidate(&self) {
        *self.write_token() = None;
        tracing::debug!(project_id = %self.inner.project_id, "Session token invalidated");
    }

    pub fn has_pending_renewal(&self) -> bool {
        self.lock_renewal()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Cancel the pending renewal and forget the token
    pub fn shutdown(&self) {
        if let Some((_, handle)) = self.lock_renewal().take() {
            handle.abort();
        }
        *self.write_token() = None;
    }

    fn write_token(&self) -> std::sync::RwLockWriteGuard<'_, Option<SessionToken>> {
        self.inner
            .token
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_renewal(&self) -> MutexGuard<'_, Option<(u64, JoinHandle<()>)>> {
        self.inner
            .renewal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire_locked(&self) -> WidgetResult<SessionToken> {
        tracing::info!(project_id = %self.inner.project_id, "Initializing chat session");

        match self.inner.api.init_session(&self.inner.project_id).await {
            Ok(response) => {
                let token = SessionToken {
                    token: response.token,
                    expires_at: response.expires_at,
                    project_id: response.project_id,
                };
                *self.write_token() = Some(token.clone());
                let delay = self.schedule_renewal(&token);

                tracing::info!(
                    project_id = %token.project_id,
                    expires_at = %token.expires_at,
                    renew_in_secs = delay.as_secs(),
                    "Chat session initialized"
                );
                Ok(token)
            }
            Err(e) => {
                *self.write_token() = None;
                if let Some((_, handle)) = self.lock_renewal().take() {
                    handle.abort();
                }
                tracing::error!(
                    project_id = %self.inner.project_id,
                    error = %e,
                    "Failed to initialize chat session"
                );
                Err(e)
            }
        }
    }

    /// Replace any pending renewal with one for `token`
    fn schedule_renewal(&self, token: &SessionToken) -> Duration {
        // Never wait past 80% of the remaining lifetime
        let delay = self.inner.renew_after.min(token.remaining().mul_f64(0.8));
        let id = self.inner.next_renewal_id.fetch_add(1, Ordering::Relaxed) + 1;
        let weak = Arc::downgrade(&self.inner);
        let timer = Arc::clone(&self.inner.timer);

        let handle = tokio::spawn(async move {
            timer.sleep(delay).await;
            renew(weak, id).await;
        });

        if let Some((_, previous)) = self.lock_renewal().replace((id, handle)) {
            previous.abort();
        }
        delay
    }
}

async fn renew(inner: Weak<SessionInner>, id: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let manager = SessionManager { inner };

    // Leave the slot empty so the next acquisition does not abort this task.
    // A newer acquisition owns the slot otherwise, and this renewal is stale.
    {
        let mut slot = manager.lock_renewal();
        match slot.as_ref() {
            Some((current, _)) if *current == id => {
                slot.take();
            }
            _ => return,
        }
    }

    tracing::info!(project_id = %manager.inner.project_id, "Token expiring soon, renewing");
    // Failures are logged by acquire and leave the session empty
    let _ = manager.acquire().await;
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let slot = self.renewal.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, handle)) = slot.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use time::format_description::well_known::Rfc3339;

    #[test]
    fn test_debug_redacts_token() {
        let token = SessionToken {
            token: "secret-token".to_string(),
            expires_at: OffsetDateTime::now_utc(),
            project_id: ProjectId::from("proj_1"),
        };
        let debug = format!("{:?}", token);
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_remaining_is_zero_after_expiry() {
        let token = SessionToken {
            token: "t".to_string(),
            expires_at: OffsetDateTime::parse("2020-01-01T00:00:00Z", &Rfc3339).unwrap(),
            project_id: ProjectId::from("proj_1"),
        };
        assert!(token.is_expired());
        assert_eq!(token.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_remaining_tracks_expiry() {
        let token = SessionToken {
            token: "t".to_string(),
            expires_at: OffsetDateTime::now_utc() + time::Duration::minutes(5),
            project_id: ProjectId::from("proj_1"),
        };
        assert!(!token.is_expired());
        assert!(token.remaining() > Duration::from_secs(290));
        assert!(token.remaining() <= Duration::from_secs(300));
    }
}
