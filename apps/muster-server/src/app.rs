//! Orchestration of one run: instantiate the selected modules, start them,
//! wait for a signal or a failure, stop them, and report the outcome.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use edge_server::{EdgeServer, ServiceLookup};
use musterkit::{
    CancellationToken, ClientHub, ManagerListener, Service, ServiceId, ServiceManager, WeakService,
};
use musterkit_bootstrap::{AppConfig, SignalHandler, SignalReceiver};
use parking_lot::Mutex;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;

use crate::probes;
use crate::registered_modules::{build_registry, check_run};

/// A fully instantiated run that has not started yet.
pub struct Runtime {
    hub: Arc<ClientHub>,
    manager: ServiceManager,
    names: Arc<HashMap<ServiceId, String>>,
    shutdown_requested: Arc<AtomicBool>,
    health: Option<HealthReporter>,
    shutdown_delay: Duration,
}

impl Runtime {
    /// Resolve the configured targets and run every module factory.
    ///
    /// Setup errors (unknown targets, failing factories, bind failures) are
    /// returned before any service starts.
    pub async fn build(config: &AppConfig) -> Result<Self> {
        let server_waits_for: Arc<OnceLock<Vec<WeakService>>> = Arc::default();
        let lookup: ServiceLookup = {
            let others = Arc::clone(&server_waits_for);
            Arc::new(move || {
                others
                    .get()
                    .map(|weak| weak.iter().filter_map(WeakService::upgrade).collect())
                    .unwrap_or_default()
            })
        };

        let registry = build_registry(config, lookup)?;
        check_run(config, &registry.resolve(&config.runtime.target)?)?;
        let hub = Arc::new(ClientHub::new());
        let services = registry.init_module_services(&config.runtime.target, Arc::clone(&hub))?;

        let _ = server_waits_for.set(
            services
                .iter()
                .filter(|(name, _)| name.as_str() != edge_server::MODULE_NAME)
                .map(|(_, svc)| svc.downgrade())
                .collect(),
        );

        let names: HashMap<ServiceId, String> = services
            .iter()
            .map(|(name, svc)| (svc.id(), name.clone()))
            .collect();
        let manager = ServiceManager::new(services.into_values().collect())?;
        let shutdown_requested = Arc::new(AtomicBool::new(false));

        let health = match hub.get::<EdgeServer>() {
            Some(server) => {
                server.merge_router(probes::routes(
                    manager.clone(),
                    Arc::clone(&shutdown_requested),
                ))?;
                let (reporter, installer) = probes::grpc_health().await;
                server.add_grpc_service(installer)?;
                server.add_grpc_service(probes::grpc_reflection()?)?;
                Some(reporter)
            }
            None => None,
        };

        Ok(Self {
            hub,
            manager,
            names: Arc::new(names),
            shutdown_requested,
            health,
            shutdown_delay: config.runtime.shutdown_delay,
        })
    }

    pub fn client_hub(&self) -> &Arc<ClientHub> {
        &self.hub
    }

    pub fn manager(&self) -> &ServiceManager {
        &self.manager
    }

    /// Start everything, block until the run ends, and fail if any module
    /// ended with a fault.
    pub async fn run(self) -> Result<()> {
        if self.manager.services().is_empty() {
            tracing::warn!("no modules selected, nothing to run");
            return Ok(());
        }

        self.manager.add_listener(RunListener {
            names: Arc::clone(&self.names),
            health: self.health.clone(),
            started: Instant::now(),
            healthy_at: Mutex::new(None),
        });

        let coordinator = Arc::new(
            SignalHandler::new(vec![Arc::new(ShutdownFlag(Arc::clone(&self.shutdown_requested)))
                as Arc<dyn SignalReceiver>])
            .with_diagnostics({
                let manager = self.manager.clone();
                let names = Arc::clone(&self.names);
                move || state_breakdown(&manager, &names)
            }),
        );

        self.manager.start_async()?;
        tracing::info!(modules = self.manager.services().len(), "starting modules");

        let finished = CancellationToken::new();
        let signals = {
            let coordinator = Arc::clone(&coordinator);
            let manager = self.manager.clone();
            let finished = finished.clone();
            let delay = self.shutdown_delay;
            tokio::spawn(async move {
                if let Err(e) = coordinator.run().await {
                    tracing::error!(error = %e, "signal handling failed, stopping");
                }
                if finished.is_cancelled() {
                    return;
                }
                if !delay.is_zero() {
                    tracing::info!(?delay, "waiting before stopping modules");
                    tokio::time::sleep(delay).await;
                }
                manager.stop_async();
            })
        };

        self.manager.await_stopped(&CancellationToken::new()).await?;
        // the run may have ended without a signal
        finished.cancel();
        coordinator.stop();
        if let Err(e) = signals.await {
            tracing::warn!(error = %e, "signal task ended abnormally");
        }

        let faults = self.manager.faults();
        if faults.is_empty() {
            return Ok(());
        }
        let failed: Vec<&str> = faults
            .iter()
            .map(|(svc, _)| module_name(&self.names, svc))
            .collect();
        anyhow::bail!("modules failed: {}", failed.join(", "))
    }
}

/// Marks the run as shutting down as soon as a termination signal arrives.
struct ShutdownFlag(Arc<AtomicBool>);

impl SignalReceiver for ShutdownFlag {
    fn stop(&self) -> Result<()> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct RunListener {
    names: Arc<HashMap<ServiceId, String>>,
    health: Option<HealthReporter>,
    started: Instant,
    healthy_at: Mutex<Option<Instant>>,
}

impl RunListener {
    fn report(&self, status: ServingStatus) {
        if let Some(reporter) = self.health.clone() {
            tokio::spawn(async move { reporter.set_service_status("", status).await });
        }
    }
}

impl ManagerListener for RunListener {
    fn healthy(&self) {
        let now = Instant::now();
        *self.healthy_at.lock() = Some(now);
        tracing::info!(startup = ?now.duration_since(self.started), "started");
        self.report(ServingStatus::Serving);
    }

    fn stopped(&self) {
        let running = self.healthy_at.lock().map(|at| at.elapsed());
        tracing::info!(?running, "stopped");
        self.report(ServingStatus::NotServing);
    }

    fn failure(&self, service: &Service) {
        let module = module_name(&self.names, service);
        match service.failure_cause() {
            Some(cause) if cause.is_stop_process() => {
                tracing::info!(module, "module requested the process to stop");
            }
            Some(cause) => tracing::error!(module, error = %cause, "module failed"),
            None => tracing::error!(module, "module failed"),
        }
        self.report(ServingStatus::NotServing);
    }
}

fn module_name<'a>(names: &'a HashMap<ServiceId, String>, service: &Service) -> &'a str {
    names.get(&service.id()).map_or("<unknown>", String::as_str)
}

/// One line per state listing the modules currently in it.
fn state_breakdown(manager: &ServiceManager, names: &HashMap<ServiceId, String>) -> String {
    let by_state: BTreeMap<_, Vec<&str>> = manager
        .services_by_state()
        .into_iter()
        .map(|(state, services)| {
            let modules = services.iter().map(|s| module_name(names, s)).collect();
            (state, modules)
        })
        .collect();

    let mut out = String::from("*** modules by state ***");
    for (state, modules) in by_state {
        let _ = write!(out, "\n{state} ({}): {}", modules.len(), modules.join(", "));
    }
    out
}
