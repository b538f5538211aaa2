//! Edge server module: the process's HTTP and gRPC endpoints.
//!
//! The module publishes an `Arc<EdgeServer>` in the client hub during
//! construction. Modules that depend on it add their routes and gRPC services
//! from their own factories, before anything starts serving.

use std::sync::Arc;

use async_trait::async_trait;
use musterkit::{
    CancellationToken, FailureCause, Lifecycle, ModuleCtx, Service, ServiceResult,
};
use musterkit_bootstrap::ServerConfig;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

pub mod grpc;
pub mod server;

pub use grpc::RegisterGrpcServiceFn;
pub use server::{EdgeServer, RunOutcome};

pub const MODULE_NAME: &str = "server";

/// The other services of the run, looked up once the run is assembled.
pub type ServiceLookup = Arc<dyn Fn() -> Vec<Service> + Send + Sync>;

/// Build the edge server module. `others` yields the services the server
/// must outlive: it keeps serving until every one of them has terminated.
pub fn module_factory(
    cfg: ServerConfig,
    others: ServiceLookup,
) -> impl Fn(&ModuleCtx) -> anyhow::Result<Service> + Send + Sync + 'static {
    move |ctx: &ModuleCtx| {
        let server = Arc::new(EdgeServer::bind(cfg.clone())?);
        ctx.client_hub().register(Arc::clone(&server));
        Ok(Service::named(
            MODULE_NAME,
            ServerService {
                server,
                others: Arc::clone(&others),
                serving: Mutex::new(None),
            },
        ))
    }
}

struct ServerService {
    server: Arc<EdgeServer>,
    others: ServiceLookup,
    serving: Mutex<Option<JoinHandle<anyhow::Result<RunOutcome>>>>,
}

#[async_trait]
impl Lifecycle for ServerService {
    async fn running(&self, cancel: CancellationToken) -> ServiceResult {
        let mut serving = {
            let server = Arc::clone(&self.server);
            tokio::spawn(async move { server.run().await })
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                // keep serving while dependents wind down
                *self.serving.lock() = Some(serving);
                Ok(())
            }
            joined = &mut serving => match joined {
                Ok(Ok(RunOutcome::StopRequested)) => Err(FailureCause::StopProcess),
                Ok(Ok(RunOutcome::Closed)) => Ok(()),
                Ok(Err(e)) => Err(FailureCause::error(e)),
                Err(e) => Err(FailureCause::error(anyhow::anyhow!("edge server task aborted: {e}"))),
            },
        }
    }

    async fn stopping(&self, failure: Option<&FailureCause>) -> ServiceResult {
        let others = (self.others)();
        if failure.is_some() {
            for service in &others {
                service.stop_async();
            }
        }
        let never = CancellationToken::new();
        for service in &others {
            service.await_terminated(&never).await;
        }

        self.server.shutdown().await;
        let serving = self.serving.lock().take();
        if let Some(serving) = serving {
            match serving.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "edge server ended with an error"),
                Err(e) => tracing::warn!(error = %e, "edge server task aborted"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use musterkit::{ClientHub, State};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn local_cfg() -> ServerConfig {
        ServerConfig {
            http_bind_addr: "127.0.0.1:0".parse().unwrap(),
            grpc_bind_addr: "127.0.0.1:0".parse().unwrap(),
            drain_timeout: Duration::from_secs(1),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn factory_publishes_the_server() {
        let hub = Arc::new(ClientHub::new());
        let factory = module_factory(local_cfg(), Arc::new(Vec::new));
        let service = factory(&ModuleCtx::new(MODULE_NAME, Arc::clone(&hub))).unwrap();

        assert_eq!(service.name(), Some(MODULE_NAME));
        assert!(hub.get::<EdgeServer>().is_some());
    }

    #[tokio::test]
    async fn waits_for_other_services_before_shutting_down() {
        let hub = Arc::new(ClientHub::new());
        let other = Service::idle();
        let lookup: ServiceLookup = {
            let other = other.clone();
            Arc::new(move || vec![other.clone()])
        };
        let service = module_factory(local_cfg(), lookup)(&ModuleCtx::new(MODULE_NAME, hub)).unwrap();

        other.start_async().unwrap();
        service.start_async().unwrap();
        service.await_running(&CancellationToken::new()).await.unwrap();

        service.stop_async();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.state(), State::Stopping);

        other.stop_async();
        let state = timeout(WAIT, service.await_terminated(&CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(state, State::Terminated);
    }

    #[tokio::test]
    async fn stop_request_stops_the_other_services() {
        let hub = Arc::new(ClientHub::new());
        let other = Service::idle();
        let lookup: ServiceLookup = {
            let other = other.clone();
            Arc::new(move || vec![other.clone()])
        };
        let service =
            module_factory(local_cfg(), lookup)(&ModuleCtx::new(MODULE_NAME, Arc::clone(&hub))).unwrap();

        other.start_async().unwrap();
        service.start_async().unwrap();
        service.await_running(&CancellationToken::new()).await.unwrap();

        hub.require::<EdgeServer>().unwrap().request_stop();

        let state = timeout(WAIT, service.await_terminated(&CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(state, State::Failed);
        assert!(service.failure_cause().unwrap().is_stop_process());
        assert_eq!(other.state(), State::Terminated);
    }
}
