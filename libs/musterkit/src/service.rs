//! Service state machine.
//!
//! A [`Service`] walks `New → Starting → Running → Stopping → Terminated`.
//! `Starting`, `Running` and `Stopping` may end in `Failed` instead; both
//! `Terminated` and `Failed` are absorbing.
//!
//! The behaviour of each phase is supplied by a [`Lifecycle`] implementation.
//! Once started, the phases run on their own Tokio task: callers only ever
//! wait on state changes, they never drive the phases themselves.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a [`Service`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Terminated | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::New => "New",
            State::Starting => "Starting",
            State::Running => "Running",
            State::Stopping => "Stopping",
            State::Terminated => "Terminated",
            State::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Why a service ended up `Failed`.
///
/// `StopProcess` is the cooperative "the whole process should end" request. It
/// is recorded like a failure so the manager tears everything down, but it is
/// never reported as a fault.
#[derive(Clone, Debug)]
pub enum FailureCause {
    StopProcess,
    Error(Arc<anyhow::Error>),
}

impl FailureCause {
    pub fn error(err: impl Into<anyhow::Error>) -> Self {
        FailureCause::Error(Arc::new(err.into()))
    }

    pub fn is_stop_process(&self) -> bool {
        matches!(self, FailureCause::StopProcess)
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::StopProcess => f.write_str("stop process requested"),
            FailureCause::Error(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for FailureCause {}

impl From<anyhow::Error> for FailureCause {
    fn from(err: anyhow::Error) -> Self {
        FailureCause::Error(Arc::new(err))
    }
}

impl From<ServiceError> for FailureCause {
    fn from(err: ServiceError) -> Self {
        FailureCause::error(err)
    }
}

/// Outcome of a lifecycle phase: `Ok(())` completed, `Err(StopProcess)`
/// requested a process stop, `Err(Error(_))` failed.
pub type ServiceResult = Result<(), FailureCause>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid service state: {actual}, expected: {expected}")]
    InvalidState { expected: State, actual: State },
    #[error("service is {state}, expected Running")]
    NotRunning { state: State },
    #[error("service failed: {cause}")]
    Failed { cause: FailureCause },
    #[error("wait cancelled")]
    Cancelled,
    #[error("failed to start '{module}', because it depends on module '{dependency}', which has failed")]
    DependencyFailed {
        module: String,
        dependency: String,
        #[source]
        source: Box<ServiceError>,
    },
    #[error("duplicate service '{0}' passed to the service manager")]
    DuplicateService(ServiceId),
    #[error("not all services can reach Running: {stopped} already stopped")]
    Unhealthy { stopped: usize },
}

/// Phase hooks of a service.
///
/// Every hook receives or observes the service's own cancellation token, which
/// fires when [`Service::stop_async`] is called.
#[async_trait]
pub trait Lifecycle: Send + Sync + 'static {
    /// Runs in `Starting`. An error moves the service straight to `Failed`.
    async fn starting(&self, _cancel: CancellationToken) -> ServiceResult {
        Ok(())
    }

    /// Runs in `Running` until it returns. Returning `Ok(())` is a clean end.
    async fn running(&self, cancel: CancellationToken) -> ServiceResult {
        cancel.cancelled().await;
        Ok(())
    }

    /// Runs in `Stopping`, with the failure from `running` if there was one.
    async fn stopping(&self, _failure: Option<&FailureCause>) -> ServiceResult {
        Ok(())
    }
}

/// Lifecycle that does nothing but wait to be stopped.
struct Idle;

impl Lifecycle for Idle {}

/// Process-unique identity of a [`Service`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(u64);

impl ServiceId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ServiceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service#{}", self.0)
    }
}

struct Inner {
    id: ServiceId,
    name: Option<String>,
    lifecycle: Arc<dyn Lifecycle>,
    state: watch::Sender<State>,
    failure: Mutex<Option<FailureCause>>,
    cancel: CancellationToken,
}

/// Cloneable handle to one service state machine.
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    pub fn new(lifecycle: impl Lifecycle) -> Self {
        Self::build(None, Arc::new(lifecycle))
    }

    /// A service that carries a name for listener and log attribution.
    pub fn named(name: impl Into<String>, lifecycle: impl Lifecycle) -> Self {
        Self::build(Some(name.into()), Arc::new(lifecycle))
    }

    /// A service with no behaviour of its own: it runs until stopped.
    pub fn idle() -> Self {
        Self::new(Idle)
    }

    fn build(name: Option<String>, lifecycle: Arc<dyn Lifecycle>) -> Self {
        let (state, _) = watch::channel(State::New);
        Self {
            inner: Arc::new(Inner {
                id: ServiceId::next(),
                name,
                lifecycle,
                state,
                failure: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> ServiceId {
        self.inner.id
    }

    pub fn downgrade(&self) -> WeakService {
        WeakService {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn state(&self) -> State {
        *self.inner.state.borrow()
    }

    /// The terminal failure cause; `None` unless the service is `Failed`.
    pub fn failure_cause(&self) -> Option<FailureCause> {
        self.inner.failure.lock().clone()
    }

    /// Receiver for state changes. Rapid transitions may be coalesced, terminal
    /// states never are since they are absorbing.
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.inner.state.subscribe()
    }

    /// Begin starting the service. Only valid from `New`.
    pub fn start_async(&self) -> Result<(), ServiceError> {
        self.transition(State::New, State::Starting)?;
        tracing::trace!(service = %self, "service starting");
        let svc = self.clone();
        tokio::spawn(async move { svc.drive().await });
        Ok(())
    }

    /// Request the service to stop. Idempotent.
    ///
    /// A service that was never started terminates immediately; otherwise its
    /// cancellation token fires and the phases wind down on their own task.
    pub fn stop_async(&self) {
        let never_started = self.inner.state.send_if_modified(|s| {
            if *s == State::New {
                *s = State::Terminated;
                true
            } else {
                false
            }
        });
        if never_started {
            tracing::trace!(service = %self, "service terminated before start");
        }
        self.inner.cancel.cancel();
    }

    /// Wait until the service is `Running`.
    ///
    /// Fails once the service can no longer reach `Running`, or when `cancel`
    /// fires first.
    pub async fn await_running(&self, cancel: &CancellationToken) -> Result<(), ServiceError> {
        let mut rx = self.subscribe();
        let settled = async {
            rx.wait_for(|s| !matches!(s, State::New | State::Starting))
                .await
                .map(|s| *s)
                .unwrap_or_else(|_| self.state())
        };
        let state = tokio::select! {
            biased;
            state = settled => state,
            _ = cancel.cancelled() => return Err(ServiceError::Cancelled),
        };

        match state {
            State::Running => Ok(()),
            State::Failed => Err(self
                .failure_cause()
                .map(|cause| ServiceError::Failed { cause })
                .unwrap_or(ServiceError::NotRunning { state })),
            state => Err(ServiceError::NotRunning { state }),
        }
    }

    /// Wait until the service reaches `Terminated` or `Failed`.
    ///
    /// Returns the state observed when the wait ended. That is the terminal
    /// state unless `cancel` fired first; callers inspect
    /// [`Service::failure_cause`] for the outcome.
    pub async fn await_terminated(&self, cancel: &CancellationToken) -> State {
        let mut rx = self.subscribe();
        let terminal = async {
            rx.wait_for(|s| s.is_terminal())
                .await
                .map(|s| *s)
                .unwrap_or_else(|_| self.state())
        };
        tokio::select! {
            biased;
            state = terminal => state,
            _ = cancel.cancelled() => self.state(),
        }
    }

    /// Stop the service and wait for it to terminate, whatever the caller does.
    pub async fn stop_and_await_terminated(&self) -> Option<FailureCause> {
        self.stop_async();
        // never cancelled
        self.await_terminated(&CancellationToken::new()).await;
        self.failure_cause()
    }

    fn transition(&self, from: State, to: State) -> Result<(), ServiceError> {
        let mut result = Ok(());
        self.inner.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                result = Err(ServiceError::InvalidState {
                    expected: from,
                    actual: *s,
                });
                false
            }
        });
        result
    }

    fn set_state(&self, to: State) {
        self.inner.state.send_replace(to);
        tracing::trace!(service = %self, state = %to, "service state changed");
    }

    fn fail(&self, cause: FailureCause) {
        // cause first, so anyone woken by the state change can read it
        *self.inner.failure.lock() = Some(cause);
        self.set_state(State::Failed);
    }

    async fn drive(self) {
        let lifecycle = Arc::clone(&self.inner.lifecycle);
        let cancel = self.inner.cancel.clone();

        let starting = {
            let (lc, cancel) = (Arc::clone(&lifecycle), cancel.clone());
            guarded(async move { lc.starting(cancel).await }).await
        };
        if let Err(cause) = starting {
            self.fail(cause);
            return;
        }

        self.set_state(State::Running);
        let failure = {
            let lc = Arc::clone(&lifecycle);
            guarded(async move { lc.running(cancel).await }).await.err()
        };

        self.set_state(State::Stopping);
        let stopping = {
            let (lc, failure) = (Arc::clone(&lifecycle), failure.clone());
            guarded(async move { lc.stopping(failure.as_ref()).await }).await
        };

        match failure.or(stopping.err()) {
            Some(cause) => self.fail(cause),
            None => self.set_state(State::Terminated),
        }
    }
}

/// Non-owning handle to a [`Service`].
#[derive(Clone)]
pub struct WeakService {
    inner: Weak<Inner>,
}

impl WeakService {
    pub fn upgrade(&self) -> Option<Service> {
        self.inner.upgrade().map(|inner| Service { inner })
    }
}

/// Run one phase on its own task so a panicking hook fails the service
/// instead of leaving it stuck mid-transition.
async fn guarded<F>(phase: F) -> ServiceResult
where
    F: Future<Output = ServiceResult> + Send + 'static,
{
    match tokio::spawn(phase).await {
        Ok(result) => result,
        Err(join) => Err(FailureCause::error(anyhow::anyhow!(
            "service phase aborted: {join}"
        ))),
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Service {}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.inner.id),
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}
