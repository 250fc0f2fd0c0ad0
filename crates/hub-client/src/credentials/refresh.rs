//! Single-flight credential renewal.
//!
//! However many callers discover an expired access credential at the same
//! moment, at most one renewal call is in flight. Every caller that arrives
//! while it runs awaits the same shared outcome.
//!
//! ```text
//! Idle ──ensure_fresh──▶ Renewing ──ok──▶ Idle
//!                           │
//!                           └──err──▶ Failed (session destroyed)
//! ```
//!
//! `Failed` is terminal for the session that produced it. A later login starts a
//! new session generation and the coordinator behaves as `Idle` again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::session::SessionManager;
use crate::error::{ClientError, Result};
use crate::http::api::AuthApi;

/// Outcome shared by every caller of one renewal. Errors are carried as strings
/// so the outcome stays `Clone`.
type Flight = Shared<BoxFuture<'static, std::result::Result<String, String>>>;

enum RefreshState {
    Idle,
    /// Renewal in flight for session `generation`.
    Renewing { flight: Flight, generation: u64 },
    /// Renewal failed; `generation` is the one the forced logout produced.
    Failed { generation: u64, reason: String },
}

/// Observable phase of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Renewing,
    Failed,
}

enum Decision {
    Join(Flight),
    UseCurrent,
    Fail(String),
}

struct Inner {
    session: Arc<SessionManager>,
    api: AuthApi,
    timeout: Duration,
    state: Mutex<RefreshState>,
    /// Incremented after every successful renewal.
    epoch: AtomicU64,
    /// Renewal calls actually issued.
    renewals: AtomicU64,
}

/// Performs credential renewal with a single-flight guarantee.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(session: Arc<SessionManager>, api: AuthApi, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                api,
                timeout,
                state: Mutex::new(RefreshState::Idle),
                epoch: AtomicU64::new(0),
                renewals: AtomicU64::new(0),
            }),
        }
    }

    /// Renew the access credential, or join the renewal already in flight.
    ///
    /// Resolves to the new access credential. On failure the session has been
    /// destroyed and forced-logout listeners have fired.
    #[instrument(skip(self))]
    pub async fn ensure_fresh(&self) -> Result<String> {
        if self.inner.session.refresh_credential().await.is_none()
            && self.phase() == RefreshPhase::Idle
        {
            return Err(ClientError::NotAuthenticated);
        }
        self.resolve(None).await
    }

    /// Renew unless a renewal already completed since `observed_epoch`.
    ///
    /// Callers that were rejected with a credential that has since been replaced
    /// pick up the current one instead of starting a second renewal.
    pub(crate) async fn renew_after(&self, observed_epoch: u64) -> Result<String> {
        self.resolve(Some(observed_epoch)).await
    }

    /// Epoch to pass to [`renew_after`](Self::renew_after).
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> RefreshPhase {
        match &*self.inner.state.lock() {
            RefreshState::Idle => RefreshPhase::Idle,
            RefreshState::Renewing { .. } => RefreshPhase::Renewing,
            RefreshState::Failed { generation, .. }
                if *generation == self.inner.session.generation() =>
            {
                RefreshPhase::Failed
            }
            RefreshState::Failed { .. } => RefreshPhase::Idle,
        }
    }

    /// Number of renewal calls issued so far.
    pub fn renewal_count(&self) -> u64 {
        self.inner.renewals.load(Ordering::SeqCst)
    }

    async fn resolve(&self, observed_epoch: Option<u64>) -> Result<String> {
        match self.decide(observed_epoch) {
            Decision::Join(flight) => flight.await.map_err(ClientError::RenewalFailed),
            Decision::Fail(reason) => Err(ClientError::RenewalFailed(reason)),
            Decision::UseCurrent => self
                .inner
                .session
                .current_access_credential()
                .await
                .ok_or(ClientError::NotAuthenticated),
        }
    }

    /// Inspect the state and start a renewal if needed. Never awaits.
    fn decide(&self, observed_epoch: Option<u64>) -> Decision {
        let mut state = self.inner.state.lock();
        let current = self.inner.session.generation();

        match &*state {
            RefreshState::Renewing { flight, generation } if *generation == current => {
                debug!("Joining renewal in flight");
                return Decision::Join(flight.clone());
            }
            RefreshState::Renewing { .. } => {
                debug!("Renewal in flight belongs to an ended session; starting another");
            }
            RefreshState::Failed { generation, reason } if *generation == current => {
                return Decision::Fail(reason.clone());
            }
            _ => {}
        }

        if let Some(epoch) = observed_epoch
            && epoch != self.inner.epoch.load(Ordering::SeqCst)
        {
            debug!("Credential renewed since the call was issued");
            return Decision::UseCurrent;
        }

        self.inner.renewals.fetch_add(1, Ordering::SeqCst);

        let task = tokio::spawn(run_renewal(Arc::clone(&self.inner), current));
        let flight = async move {
            task.await
                .unwrap_or_else(|e| Err(format!("renewal task failed: {e}")))
        }
        .boxed()
        .shared();

        *state = RefreshState::Renewing {
            flight: flight.clone(),
            generation: current,
        };
        Decision::Join(flight)
    }
}

enum RenewalOutcome {
    Renewed(String),
    /// The session changed while renewing; the result belongs to nobody.
    Superseded,
    Rejected(String),
}

async fn run_renewal(inner: Arc<Inner>, generation: u64) -> std::result::Result<String, String> {
    info!("Renewing access credential");

    let outcome = match inner.session.refresh_credential().await {
        None => RenewalOutcome::Rejected("no refresh credential stored".to_string()),
        Some(refresh) => match tokio::time::timeout(inner.timeout, inner.api.renew(&refresh)).await
        {
            Err(_) => RenewalOutcome::Rejected(ClientError::Timeout.to_string()),
            Ok(Err(e)) => RenewalOutcome::Rejected(e.to_string()),
            Ok(Ok(renewed)) => match inner
                .session
                .commit_renewal(generation, &renewed.access, renewed.refresh.as_deref())
                .await
            {
                Ok(true) => RenewalOutcome::Renewed(renewed.access),
                Ok(false) => RenewalOutcome::Superseded,
                Err(e) => RenewalOutcome::Rejected(e.to_string()),
            },
        },
    };

    match outcome {
        RenewalOutcome::Renewed(access) => {
            inner.epoch.fetch_add(1, Ordering::SeqCst);
            settle(&inner, generation, RefreshState::Idle);
            info!("Access credential renewed");
            Ok(access)
        }
        RenewalOutcome::Superseded => {
            settle(&inner, generation, RefreshState::Idle);
            Err("session changed during renewal".to_string())
        }
        RenewalOutcome::Rejected(reason) => {
            warn!(%reason, "Credential renewal failed");
            let next = match inner.session.force_logout(generation, &reason).await {
                Some(ended) => RefreshState::Failed {
                    generation: ended,
                    reason: reason.clone(),
                },
                None => {
                    debug!("Session changed during renewal; failure discarded");
                    RefreshState::Idle
                }
            };
            settle(&inner, generation, next);
            Err(reason)
        }
    }
}

/// Leave the renewal state, unless a flight for a newer session replaced it.
fn settle(inner: &Inner, generation: u64, next: RefreshState) {
    let mut state = inner.state.lock();
    if matches!(&*state, RefreshState::Renewing { generation: g, .. } if *g == generation) {
        *state = next;
    }
}
