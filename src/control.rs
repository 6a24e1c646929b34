//! Controller-facing tracing session
//!
//! `ControlSurface` is the `Idle`/`Active` state machine a controller drives.
//! Every operation detects a backend afresh from the attachment, sends the
//! request and returns without waiting; state changes happen when the
//! backend confirms. The cached stats view is always readable.
//!
//! The session lock is never held while calling into a backend, since a
//! backend may complete on the calling thread.

use crate::backend::{detect, Attachment, Backend, BackendError, BackendPreference};
use crate::config::TracerConfig;
use crate::identity::FunctionId;
use crate::pending::{pending, Completion, Pending};
use crate::protocol::{parse_stats_payload, Reply};
use crate::registry::StatsMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct SessionState {
    active: bool,
    traced: BTreeSet<FunctionId>,
    stats: StatsMap,
}

type SharedState = Arc<Mutex<SessionState>>;

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fold a confirmed reply's payload into the cached stats
fn absorb(session: &mut SessionState, reply: &Reply) {
    session.stats = parse_stats_payload(&reply.results, &session.stats);
}

/// The watch set the traced process confirmed, else what was asked for
fn confirmed_watch_set(reply: &Reply, requested: BTreeSet<FunctionId>) -> BTreeSet<FunctionId> {
    reply.watched_functions().unwrap_or(requested)
}

/// One tracing session against whatever is currently attached
pub struct ControlSurface {
    attachment: Arc<dyn Attachment>,
    preference: BackendPreference,
    request_timeout: Duration,
    state: SharedState,
}

impl std::fmt::Debug for ControlSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSurface")
            .field("preference", &self.preference)
            .field("state", &*lock(&self.state))
            .finish()
    }
}

impl ControlSurface {
    pub fn new(attachment: Arc<dyn Attachment>, preference: BackendPreference) -> Self {
        Self::with_config(
            attachment,
            &TracerConfig {
                backend: preference,
                ..TracerConfig::default()
            },
        )
    }

    pub fn with_config(attachment: Arc<dyn Attachment>, config: &TracerConfig) -> Self {
        Self {
            attachment,
            preference: config.backend,
            request_timeout: config.request_timeout(),
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    fn backend(&self) -> Option<Box<dyn Backend>> {
        detect(self.attachment.as_ref(), self.preference)
    }

    /// Begin tracing `functions`
    ///
    /// Returns true if a backend accepted the request. While already active
    /// this behaves as `update_traced_functions`; stats for functions seen
    /// before are kept either way.
    pub fn start_tracing<I, S>(&self, functions: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<FunctionId>,
    {
        let functions: Vec<FunctionId> = functions.into_iter().map(Into::into).collect();

        if self.is_tracing_active() {
            tracing::debug!("tracing already active, updating watch set");
            return self.update_traced_functions(functions);
        }

        let Some(backend) = self.backend() else {
            tracing::warn!("cannot start tracing: no backend available");
            return false;
        };

        let state = Arc::clone(&self.state);
        let requested: BTreeSet<FunctionId> = functions.iter().cloned().collect();
        let (rejected, done) = self.watch_completion(move |reply| {
            let mut session = lock(&state);
            session.active = true;
            session.traced = confirmed_watch_set(&reply, requested);
            absorb(&mut session, &reply);
            tracing::info!(functions = session.traced.len(), "tracing started");
        });

        tracing::debug!(kind = %backend.kind(), count = functions.len(), "sending start");
        backend.start(&functions, done);
        !rejected.load(Ordering::Acquire)
    }

    /// Replace the watch set of an active session
    ///
    /// Returns false without touching any state when tracing is not active.
    pub fn update_traced_functions<I, S>(&self, functions: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<FunctionId>,
    {
        if !self.is_tracing_active() {
            tracing::warn!("cannot update traced functions: tracing is not active");
            return false;
        }

        let functions: Vec<FunctionId> = functions.into_iter().map(Into::into).collect();
        let Some(backend) = self.backend() else {
            tracing::warn!("cannot update traced functions: no backend available");
            return false;
        };

        let state = Arc::clone(&self.state);
        let requested: BTreeSet<FunctionId> = functions.iter().cloned().collect();
        let (rejected, done) = self.watch_completion(move |reply| {
            let mut session = lock(&state);
            session.traced = confirmed_watch_set(&reply, requested);
            absorb(&mut session, &reply);
        });

        backend.update(&functions, done);
        !rejected.load(Ordering::Acquire)
    }

    /// Stop tracing and fetch the final stats
    ///
    /// While idle the handle resolves at once with the cached stats. The
    /// session is idle as soon as the backend confirms, even if the reply
    /// turns out to be unreadable; the cached stats are returned then.
    pub fn stop_tracing(&self) -> Pending<StatsMap> {
        if !self.is_tracing_active() {
            return Pending::ready(self.function_stats());
        }

        let Some(backend) = self.backend() else {
            tracing::warn!("cannot stop tracing: no backend available");
            return Pending::failed(BackendError::Unavailable);
        };

        let (resolve, handle) = pending();
        let state = Arc::clone(&self.state);
        let done = Completion::new(move |result: Result<Reply, BackendError>| match result {
            Ok(reply) => {
                let stats = {
                    let mut session = lock(&state);
                    session.active = false;
                    session.traced.clear();
                    absorb(&mut session, &reply);
                    session.stats.clone()
                };
                tracing::info!(functions = stats.len(), "tracing stopped");
                resolve.succeed(stats);
            }
            Err(BackendError::Malformed(reason)) => {
                let stats = {
                    let mut session = lock(&state);
                    session.active = false;
                    session.traced.clear();
                    session.stats.clone()
                };
                tracing::warn!(%reason, "stop reply unreadable, keeping cached stats");
                resolve.succeed(stats);
            }
            Err(error) => {
                tracing::warn!(%error, "stop request failed");
                resolve.fail(error);
            }
        });

        backend.stop(done);
        handle
    }

    /// `stop_tracing`, blocking up to the configured request timeout
    pub fn stop_tracing_wait(&self) -> Result<StatsMap, BackendError> {
        self.stop_tracing().wait_timeout(self.request_timeout)
    }

    /// Ask for a stats flush without stopping
    ///
    /// Does nothing while idle. New stats show up in `function_stats`
    /// once the reply arrives.
    pub fn refresh_results(&self) {
        if !self.is_tracing_active() {
            return;
        }
        let Some(backend) = self.backend() else {
            tracing::debug!("skipping refresh: no backend available");
            return;
        };

        let state = Arc::clone(&self.state);
        backend.get_results(Completion::from_callbacks(
            move |reply: Reply| absorb(&mut lock(&state), &reply),
            |error| tracing::warn!(%error, "results refresh failed"),
        ));
    }

    /// Drop cached stats, and the traced process's too when reachable
    ///
    /// Refused while tracing is active.
    pub fn clear_results(&self) -> bool {
        {
            let mut session = lock(&self.state);
            if session.active {
                tracing::warn!("cannot clear results while tracing");
                return false;
            }
            session.stats.clear();
        }

        if let Some(backend) = self.backend() {
            let state = Arc::clone(&self.state);
            backend.clear(Completion::from_callbacks(
                move |reply: Reply| absorb(&mut lock(&state), &reply),
                |error| tracing::warn!(%error, "remote clear failed"),
            ));
        }
        true
    }

    /// The cached stats view
    pub fn function_stats(&self) -> StatsMap {
        lock(&self.state).stats.clone()
    }

    pub fn traced_functions(&self) -> BTreeSet<FunctionId> {
        lock(&self.state).traced.clone()
    }

    pub fn is_tracing_active(&self) -> bool {
        lock(&self.state).active
    }

    /// Completion running `on_success`, plus a flag set if the request fails
    ///
    /// A failure that fires before the backend call returns is reported to
    /// the controller as `false`.
    fn watch_completion(
        &self,
        on_success: impl FnOnce(Reply) + Send + 'static,
    ) -> (Arc<AtomicBool>, Completion<Reply>) {
        let rejected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&rejected);
        let done = Completion::from_callbacks(on_success, move |error| {
            tracing::warn!(%error, "tracer request failed");
            flag.store(true, Ordering::Release);
        });
        (rejected, done)
    }
}
