//! Module service wrapper.
//!
//! Wraps the service produced by a module factory so that it waits for the
//! modules it depends on to be `Running` before it starts, and for the modules
//! that depend on it to terminate before it stops.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::service::{FailureCause, Lifecycle, Service, ServiceError, ServiceResult, State};

/// Returns the services a module has to wait for, keyed by module name.
///
/// Evaluated lazily against the modules of the current run, so modules
/// outside the run are never awaited.
pub type DependencyLookup = Arc<dyn Fn(&str) -> BTreeMap<String, Service> + Send + Sync>;

pub struct ModuleService {
    name: String,
    service: Service,
    start_deps: DependencyLookup,
    stop_deps: DependencyLookup,
}

impl ModuleService {
    /// Wrap `service` for module `name`.
    ///
    /// The returned service carries the inner service's name, if it has one.
    pub fn wrap(
        name: impl Into<String>,
        service: Service,
        start_deps: DependencyLookup,
        stop_deps: DependencyLookup,
    ) -> Service {
        let forwarded = service.name().map(str::to_owned);
        let wrapper = ModuleService {
            name: name.into(),
            service,
            start_deps,
            stop_deps,
        };
        match forwarded {
            Some(name) => Service::named(name, wrapper),
            None => Service::new(wrapper),
        }
    }

    async fn wait_for_modules_to_stop(&self) {
        for (dependent, svc) in (self.stop_deps)(&self.name) {
            tracing::debug!(module = %self.name, waiting_for = %dependent, "module waiting for dependent to stop");
            // Only termination matters here, not how the dependent ended.
            svc.await_terminated(&CancellationToken::new()).await;
        }
    }
}

#[async_trait]
impl Lifecycle for ModuleService {
    async fn starting(&self, cancel: CancellationToken) -> ServiceResult {
        for (dependency, svc) in (self.start_deps)(&self.name) {
            tracing::debug!(module = %self.name, waiting_for = %dependency, "module waiting for initialization");
            svc.await_running(&cancel)
                .await
                .map_err(|source| ServiceError::DependencyFailed {
                    module: self.name.clone(),
                    dependency,
                    source: Box::new(source),
                })?;
        }

        // The inner service runs on its own token: cancelling this wait must
        // never abort it halfway through starting.
        tracing::info!(module = %self.name, "starting");
        self.service
            .start_async()
            .with_context(|| format!("error starting module: {}", self.name))?;

        if let Err(err) = self.service.await_running(&cancel).await {
            self.service.stop_and_await_terminated().await;
            return Err(anyhow::Error::new(err)
                .context(format!("starting module {}", self.name))
                .into());
        }
        Ok(())
    }

    async fn running(&self, cancel: CancellationToken) -> ServiceResult {
        self.service.await_terminated(&cancel).await;
        match self.service.failure_cause() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    async fn stopping(&self, _failure: Option<&FailureCause>) -> ServiceResult {
        let cause = match self.service.state() {
            State::Running => {
                self.wait_for_modules_to_stop().await;
                tracing::debug!(module = %self.name, "stopping");
                self.service.stop_and_await_terminated().await
            }
            State::Stopping => {
                self.service.await_terminated(&CancellationToken::new()).await;
                self.service.failure_cause()
            }
            _ => self.service.failure_cause(),
        };

        match &cause {
            Some(FailureCause::StopProcess) | None => {
                tracing::info!(module = %self.name, "module stopped");
            }
            Some(err) => {
                tracing::warn!(module = %self.name, error = %err, "module failed with error");
            }
        }
        cause.map_or(Ok(()), Err)
    }
}
