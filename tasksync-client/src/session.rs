//! Remote identity lifecycle.
//!
//! `Idle -> Authenticating -> {Authenticated, Unauthenticated}`, plus a `RemoteDisabled`
//! side state reached after `auth_failure_threshold` consecutive failures. At most one
//! authentication attempt runs at a time: callers arriving while one is in flight
//! subscribe to its outcome instead of starting another.

use crate::{
    config::ClientConfig, database::ClientDatabase, events::EventDispatcher,
    transport::RecordTransport,
};
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tasksync_core::{errors::RemoteError, SyncResult};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Copy of the authenticator's state at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub authenticated: bool,
    pub in_progress: bool,
    pub consecutive_failures: u32,
    pub remote_disabled: bool,
    pub identity: Option<String>,
    pub waiting: usize,
}

struct SessionState {
    authenticated: bool,
    in_progress: bool,
    consecutive_failures: u32,
    remote_disabled: bool,
    identity: Option<String>,
    /// Outcome channel of the attempt in flight.
    waiters: Option<broadcast::Sender<bool>>,
    /// Task running the attempt in flight, until it has a result.
    attempt: Option<JoinHandle<()>>,
    /// Bumped per attempt and per reset; results of older attempts are dropped.
    generation: u64,
    reset_backoff: ExponentialBackoff,
}

pub struct SessionAuthenticator {
    state: Mutex<SessionState>,
    transport: Arc<dyn RecordTransport>,
    db: Arc<ClientDatabase>,
    events: Arc<EventDispatcher>,
    failure_threshold: u32,
    auth_timeout: Duration,
    reset_delay: Duration,
    max_reset_delay: Duration,
    me: Weak<SessionAuthenticator>,
}

impl SessionAuthenticator {
    /// Build the authenticator, restoring the last known identity from the local store.
    pub async fn new(
        transport: Arc<dyn RecordTransport>,
        db: Arc<ClientDatabase>,
        events: Arc<EventDispatcher>,
        config: &ClientConfig,
    ) -> SyncResult<Arc<Self>> {
        let identity = db.current_identity().await?;
        tracing::info!(
            "SESSION: Starting with stored identity {:?}",
            identity.as_deref()
        );

        let reset_delay = config.reset_delay;
        let max_reset_delay = config.max_reset_delay.max(reset_delay);
        Ok(Arc::new_cyclic(|me| Self {
            state: Mutex::new(SessionState {
                authenticated: false,
                in_progress: false,
                consecutive_failures: 0,
                remote_disabled: false,
                identity,
                waiters: None,
                attempt: None,
                generation: 0,
                reset_backoff: reset_backoff(reset_delay, max_reset_delay),
            }),
            transport,
            db,
            events,
            failure_threshold: config.auth_failure_threshold.max(1),
            auth_timeout: config.request_timeout,
            reset_delay,
            max_reset_delay,
            me: me.clone(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Resolve to whether the remote is usable.
    ///
    /// Returns at once when already authenticated or when the remote is disabled;
    /// otherwise waits for the attempt in flight, starting one if there is none.
    pub async fn ensure_authenticated(&self) -> bool {
        {
            let state = self.lock();
            if state.remote_disabled {
                return false;
            }
            if state.authenticated && !state.in_progress {
                return true;
            }
        }
        self.perform_authentication().await
    }

    /// Run (or join) an authentication attempt and wait for its outcome.
    ///
    /// Does not contact the remote while it is disabled.
    pub async fn perform_authentication(&self) -> bool {
        let mut outcome = {
            let mut state = self.lock();
            if state.remote_disabled {
                tracing::debug!("SESSION: Remote disabled, skipping authentication");
                return false;
            }
            let (outcome, started) = join_or_start(&mut state);
            if let Some(generation) = started {
                self.spawn_attempt(&mut state, generation);
            }
            outcome
        };

        outcome.recv().await.unwrap_or(false)
    }

    /// Drop the current session and authenticate again.
    pub async fn refresh_authentication(&self) -> bool {
        tracing::info!("SESSION: Refreshing authentication");
        self.lock().authenticated = false;
        self.perform_authentication().await
    }

    /// Forget everything, including the stored identity, and try again after a delay.
    ///
    /// An attempt in flight is cancelled and its callers resolve to `false`. The delay
    /// grows exponentially across resets until an authentication succeeds.
    pub async fn force_reset(&self) -> SyncResult<()> {
        let delay = {
            let mut state = self.lock();
            end_session(&mut state);
            state.reset_backoff.next().unwrap_or(self.max_reset_delay)
        };

        self.db.clear_current_identity().await?;
        tracing::warn!(
            "SESSION: Session reset, re-authenticating in {:?}",
            delay
        );

        if let Some(this) = self.me.upgrade() {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let ok = this.perform_authentication().await;
                tracing::info!("SESSION: Delayed re-authentication finished (ok: {})", ok);
            });
        }
        Ok(())
    }

    /// End the session and forget the stored identity, as on logout.
    ///
    /// Nothing is retried; the next remote call authenticates from scratch.
    pub async fn sign_out(&self) -> SyncResult<()> {
        {
            let mut state = self.lock();
            end_session(&mut state);
            state.reset_backoff = reset_backoff(self.reset_delay, self.max_reset_delay);
        }
        self.db.clear_current_identity().await?;
        tracing::info!("SESSION: Signed out");
        Ok(())
    }

    /// Clear the failure count and re-enable the remote.
    pub fn clear_failures(&self) {
        let mut state = self.lock();
        if state.remote_disabled {
            tracing::info!("SESSION: Re-enabling remote");
        }
        state.consecutive_failures = 0;
        state.remote_disabled = false;
    }

    pub fn current_identity(&self) -> Option<String> {
        self.lock().identity.clone()
    }

    pub fn is_remote_disabled(&self) -> bool {
        self.lock().remote_disabled
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock();
        SessionSnapshot {
            authenticated: state.authenticated,
            in_progress: state.in_progress,
            consecutive_failures: state.consecutive_failures,
            remote_disabled: state.remote_disabled,
            identity: state.identity.clone(),
            waiting: state
                .waiters
                .as_ref()
                .map_or(0, |waiters| waiters.receiver_count()),
        }
    }

    fn spawn_attempt(&self, state: &mut SessionState, generation: u64) {
        match self.me.upgrade() {
            Some(this) => {
                state.attempt = Some(tokio::spawn(async move {
                    this.run_attempt(generation).await
                }));
            }
            None => {
                // Shutting down; dropping the sender resolves waiters to false.
                state.in_progress = false;
                state.waiters = None;
            }
        }
    }

    async fn run_attempt(&self, generation: u64) {
        tracing::info!("SESSION: Authenticating with remote");

        let attempt = tokio::time::timeout(self.auth_timeout, self.transport.authenticate());
        let result = match attempt.await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::NetworkUnavailable(
                "authentication timed out".to_string(),
            )),
        };

        let (waiters, outcome, changed) = {
            let mut state = self.lock();
            if state.generation != generation || !state.in_progress {
                tracing::debug!("SESSION: Dropping result of a superseded attempt");
                return;
            }
            state.in_progress = false;
            state.attempt = None;
            let waiters = state.waiters.take();

            match result {
                Ok(identity) => {
                    state.authenticated = true;
                    state.consecutive_failures = 0;
                    state.reset_backoff =
                        reset_backoff(self.reset_delay, self.max_reset_delay);

                    let previous = state.identity.replace(identity.clone());
                    let persist = previous.as_deref() != Some(identity.as_str());
                    let switched = matches!(&previous, Some(prev) if *prev != identity);
                    tracing::info!("SESSION: Authenticated as {}", identity);

                    (
                        waiters,
                        !switched,
                        persist.then(|| (identity, switched)),
                    )
                }
                Err(err) => {
                    state.authenticated = false;
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= self.failure_threshold {
                        state.remote_disabled = true;
                        tracing::error!(
                            "SESSION: {} consecutive authentication failures, disabling remote: {}",
                            state.consecutive_failures,
                            err
                        );
                    } else {
                        tracing::warn!(
                            "SESSION: Authentication failed ({} consecutive): {}",
                            state.consecutive_failures,
                            err
                        );
                    }
                    (waiters, false, None)
                }
            }
        };

        if let Some((identity, _)) = &changed {
            if let Err(e) = self.db.set_current_identity(identity).await {
                tracing::error!("SESSION: Failed to persist identity {}: {}", identity, e);
            }
        }

        if let Some(waiters) = waiters {
            let _ = waiters.send(outcome);
        }

        if let Some((identity, true)) = changed {
            tracing::info!("SESSION: Account changed to {}", identity);
            self.events.emit_account_changed(&identity);
        }
    }
}

fn join_or_start(state: &mut SessionState) -> (broadcast::Receiver<bool>, Option<u64>) {
    if state.in_progress {
        if let Some(waiters) = &state.waiters {
            return (waiters.subscribe(), None);
        }
    }

    let (tx, rx) = broadcast::channel(1);
    state.waiters = Some(tx);
    state.in_progress = true;
    state.generation += 1;
    (rx, Some(state.generation))
}

/// Drop the session and cancel the attempt in flight, if any. Its waiters see `false`.
fn end_session(state: &mut SessionState) {
    state.generation += 1;
    if let Some(attempt) = state.attempt.take() {
        attempt.abort();
    }
    state.authenticated = false;
    state.in_progress = false;
    state.consecutive_failures = 0;
    state.remote_disabled = false;
    state.identity = None;
    if let Some(waiters) = state.waiters.take() {
        let _ = waiters.send(false);
    }
}

fn reset_backoff(min: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBuilder::default()
        .with_min_delay(min)
        .with_max_delay(max)
        .with_factor(2.0)
        .with_max_times(16)
        .build()
}
