//! Service manager.
//!
//! Owns the services of one run, starts and stops them as a unit and reports
//! aggregate transitions to registered listeners. Any service reaching
//! `Failed` stops every other service: the modules of a run are treated as
//! mutually essential.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::service::{FailureCause, Service, ServiceError, ServiceId, State};

/// Callbacks for aggregate transitions of a [`ServiceManager`].
///
/// Callbacks run on a dispatcher task owned by the listener, never on the
/// task that observed the transition. A listener only sees transitions that
/// happen after it was added; earlier ones are not replayed.
pub trait ManagerListener: Send + Sync + 'static {
    /// All services were `Running` at the same time. Fires at most once.
    fn healthy(&self) {}

    /// All services reached a terminal state and none failed. Fires at most
    /// once.
    fn stopped(&self) {}

    /// `service` reached `Failed`. Fires once per failed service.
    fn failure(&self, _service: &Service) {}
}

#[derive(Clone)]
enum Event {
    Healthy,
    Stopped,
    Failure(Service),
}

#[derive(Clone, Copy, Debug, Default)]
struct Progress {
    /// Sticky once every service was observed `Running` together.
    healthy: bool,
    terminal: usize,
}

#[derive(Default)]
struct Tracker {
    states: HashMap<ServiceId, State>,
    healthy_fired: bool,
    stopped_fired: bool,
    listeners: Vec<mpsc::UnboundedSender<Event>>,
}

struct Shared {
    services: Vec<Service>,
    tracker: Mutex<Tracker>,
    progress: watch::Sender<Progress>,
}

/// Cloneable handle to the services of one run.
#[derive(Clone)]
pub struct ServiceManager {
    shared: Arc<Shared>,
}

impl ServiceManager {
    /// Take ownership of `services`, which must all be `New` and distinct.
    ///
    /// Spawns one watcher task per service, so it must be called from within a
    /// Tokio runtime.
    pub fn new(services: Vec<Service>) -> Result<Self, ServiceError> {
        let mut seen = HashSet::new();
        for svc in &services {
            if !seen.insert(svc.id()) {
                return Err(ServiceError::DuplicateService(svc.id()));
            }
            let state = svc.state();
            if state != State::New {
                return Err(ServiceError::InvalidState {
                    expected: State::New,
                    actual: state,
                });
            }
        }

        let states = services.iter().map(|s| (s.id(), State::New)).collect();
        let (progress, _) = watch::channel(Progress {
            healthy: services.is_empty(),
            terminal: 0,
        });
        let shared = Arc::new(Shared {
            services,
            tracker: Mutex::new(Tracker {
                states,
                ..Tracker::default()
            }),
            progress,
        });

        for svc in &shared.services {
            let shared = Arc::clone(&shared);
            let mut rx = svc.subscribe();
            let svc = svc.clone();
            tokio::spawn(async move {
                loop {
                    let state = *rx.borrow_and_update();
                    shared.observe(&svc, state);
                    if state.is_terminal() || rx.changed().await.is_err() {
                        break;
                    }
                }
            });
        }

        Ok(Self { shared })
    }

    pub fn services(&self) -> &[Service] {
        &self.shared.services
    }

    /// Register a listener. See [`ManagerListener`] for delivery rules.
    pub fn add_listener(&self, listener: impl ManagerListener) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.shared.tracker.lock().listeners.push(tx);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    Event::Healthy => listener.healthy(),
                    Event::Stopped => listener.stopped(),
                    Event::Failure(svc) => listener.failure(&svc),
                }
            }
        });
    }

    /// Start every service. Each one drives its own dependency waits, so they
    /// are all started at once. Returns the first start error, after trying
    /// all of them.
    pub fn start_async(&self) -> Result<(), ServiceError> {
        let mut first = Ok(());
        for svc in &self.shared.services {
            if let Err(e) = svc.start_async() {
                tracing::error!(service = %svc, error = %e, "failed to start service");
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }

    pub fn stop_async(&self) {
        self.shared.stop_all();
    }

    /// Point-in-time check that every service is `Running`.
    pub fn is_healthy(&self) -> bool {
        self.shared
            .services
            .iter()
            .all(|s| s.state() == State::Running)
    }

    /// Point-in-time snapshot of the services grouped by state.
    pub fn services_by_state(&self) -> BTreeMap<State, Vec<Service>> {
        let mut by_state: BTreeMap<State, Vec<Service>> = BTreeMap::new();
        for svc in &self.shared.services {
            by_state.entry(svc.state()).or_default().push(svc.clone());
        }
        by_state
    }

    /// Failed services whose cause is a real fault rather than a stop request.
    pub fn faults(&self) -> Vec<(Service, FailureCause)> {
        self.shared
            .services
            .iter()
            .filter_map(|s| match s.failure_cause() {
                Some(cause) if !cause.is_stop_process() => Some((s.clone(), cause)),
                _ => None,
            })
            .collect()
    }

    /// Wait until all services have been `Running` together.
    ///
    /// Fails as soon as any service is terminal before that, since `Running`
    /// can then never be reached by all of them.
    pub async fn await_healthy(&self, cancel: &CancellationToken) -> Result<(), ServiceError> {
        let mut rx = self.shared.progress.subscribe();
        let settled = async {
            rx.wait_for(|p| p.healthy || p.terminal > 0)
                .await
                .map(|p| *p)
                .unwrap_or_default()
        };
        let progress = tokio::select! {
            biased;
            p = settled => p,
            _ = cancel.cancelled() => return Err(ServiceError::Cancelled),
        };
        if progress.healthy {
            Ok(())
        } else {
            Err(ServiceError::Unhealthy {
                stopped: progress.terminal,
            })
        }
    }

    /// Wait until every service is terminal.
    pub async fn await_stopped(&self, cancel: &CancellationToken) -> Result<(), ServiceError> {
        let total = self.shared.services.len();
        let mut rx = self.shared.progress.subscribe();
        let stopped = async {
            // the sender lives in `self`, so the channel cannot close here
            let _ = rx.wait_for(|p| p.terminal >= total).await;
        };
        tokio::select! {
            biased;
            _ = stopped => Ok(()),
            _ = cancel.cancelled() => Err(ServiceError::Cancelled),
        }
    }
}

impl Shared {
    fn observe(&self, svc: &Service, state: State) {
        let mut failed = false;
        {
            let mut t = self.tracker.lock();
            if t.states.insert(svc.id(), state) == Some(state) {
                return;
            }

            let mut events = Vec::new();
            if state == State::Failed {
                failed = true;
                events.push(Event::Failure(svc.clone()));
            }
            if !t.healthy_fired && t.states.values().all(|s| *s == State::Running) {
                t.healthy_fired = true;
                events.push(Event::Healthy);
            }
            let terminal = t.states.values().filter(|s| s.is_terminal()).count();
            if !t.stopped_fired && terminal == t.states.len() {
                t.stopped_fired = true;
                if t.states.values().all(|s| *s != State::Failed) {
                    events.push(Event::Stopped);
                }
            }

            // Sent under the lock so every listener sees one global order.
            for event in events {
                t.listeners.retain(|tx| tx.send(event.clone()).is_ok());
            }

            let healthy = t.healthy_fired;
            self.progress.send_modify(|p| {
                p.healthy = healthy;
                p.terminal = terminal;
            });
        }

        if failed {
            tracing::debug!(service = %svc, "service failed, stopping all services");
            self.stop_all();
        }
    }

    fn stop_all(&self) {
        for svc in &self.services {
            svc.stop_async();
        }
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("services", &self.shared.services)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Lifecycle, ServiceResult};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ManagerListener for Arc<Recorder> {
        fn healthy(&self) {
            self.events.lock().push("healthy".into());
        }
        fn stopped(&self) {
            self.events.lock().push("stopped".into());
        }
        fn failure(&self, service: &Service) {
            self.events.lock().push(format!("failure {service}"));
        }
    }

    struct Crash;

    #[async_trait]
    impl Lifecycle for Crash {
        async fn running(&self, _cancel: CancellationToken) -> ServiceResult {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(anyhow::anyhow!("disk gone").into())
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn healthy_then_stopped_fire_once() {
        let recorder = Arc::new(Recorder::default());
        let m = ServiceManager::new(vec![Service::idle(), Service::idle()]).unwrap();
        m.add_listener(Arc::clone(&recorder));

        m.start_async().unwrap();
        timeout(WAIT, m.await_healthy(&CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
        assert!(m.is_healthy());

        m.stop_async();
        timeout(WAIT, m.await_stopped(&CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
        settle().await;

        assert_eq!(*recorder.events.lock(), vec!["healthy", "stopped"]);
        assert_eq!(m.services_by_state()[&State::Terminated].len(), 2);
    }

    #[tokio::test]
    async fn late_listener_misses_earlier_events() {
        let early = Arc::new(Recorder::default());
        let late = Arc::new(Recorder::default());
        let m = ServiceManager::new(vec![Service::idle()]).unwrap();
        m.add_listener(Arc::clone(&early));

        m.start_async().unwrap();
        timeout(WAIT, m.await_healthy(&CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
        settle().await;
        assert_eq!(*early.events.lock(), vec!["healthy"]);

        m.add_listener(Arc::clone(&late));
        settle().await;
        assert!(late.events.lock().is_empty());

        m.stop_async();
        timeout(WAIT, m.await_stopped(&CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
        settle().await;

        assert_eq!(*early.events.lock(), vec!["healthy", "stopped"]);
        assert_eq!(*late.events.lock(), vec!["stopped"]);
    }

    #[tokio::test]
    async fn failure_stops_everything() {
        let recorder = Arc::new(Recorder::default());
        let bystander = Service::idle();
        let m = ServiceManager::new(vec![bystander.clone(), Service::named("crash", Crash)]).unwrap();
        m.add_listener(Arc::clone(&recorder));

        m.start_async().unwrap();
        timeout(WAIT, m.await_stopped(&CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
        settle().await;

        assert_eq!(bystander.state(), State::Terminated);
        let events = recorder.events.lock().clone();
        assert!(events.contains(&"failure crash".to_string()), "{events:?}");
        assert!(!events.contains(&"stopped".to_string()), "{events:?}");
        assert!(!m.is_healthy());

        let faults = m.faults();
        assert_eq!(faults.len(), 1);
        assert!(faults[0].1.to_string().contains("disk gone"));
    }

    #[tokio::test]
    async fn stop_process_is_reported_as_failure_to_the_manager() {
        struct Quit;
        #[async_trait]
        impl Lifecycle for Quit {
            async fn running(&self, _cancel: CancellationToken) -> ServiceResult {
                Err(FailureCause::StopProcess)
            }
        }

        let other = Service::idle();
        let m = ServiceManager::new(vec![Service::new(Quit), other.clone()]).unwrap();
        m.start_async().unwrap();
        timeout(WAIT, m.await_stopped(&CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(other.state(), State::Terminated);
        assert!(m.faults().is_empty());
    }

    #[tokio::test]
    async fn await_healthy_fails_once_a_service_is_terminal() {
        struct Refuse;
        #[async_trait]
        impl Lifecycle for Refuse {
            async fn starting(&self, _cancel: CancellationToken) -> ServiceResult {
                Err(anyhow::anyhow!("nope").into())
            }
        }

        let m = ServiceManager::new(vec![Service::new(Refuse), Service::idle()]).unwrap();
        m.start_async().unwrap();
        let err = timeout(WAIT, m.await_healthy(&CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unhealthy { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn cancelled_await_stopped() {
        let m = ServiceManager::new(vec![Service::idle()]).unwrap();
        m.start_async().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            m.await_stopped(&cancel).await,
            Err(ServiceError::Cancelled)
        ));
        m.stop_async();
    }

    #[tokio::test]
    async fn rejects_duplicates_and_started_services() {
        let svc = Service::idle();
        assert!(matches!(
            ServiceManager::new(vec![svc.clone(), svc.clone()]),
            Err(ServiceError::DuplicateService(_))
        ));

        svc.start_async().unwrap();
        assert!(matches!(
            ServiceManager::new(vec![svc.clone()]),
            Err(ServiceError::InvalidState { .. })
        ));
        svc.stop_and_await_terminated().await;
    }

    #[tokio::test]
    async fn start_error_is_returned() {
        let m = ServiceManager::new(vec![Service::idle()]).unwrap();
        m.start_async().unwrap();
        assert!(m.start_async().is_err());
        m.stop_async();
    }
}
