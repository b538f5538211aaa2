use std::collections::HashSet;

use parking_lot::Mutex;
use tonic::service::{Routes, RoutesBuilder};

/// Installs one named gRPC service into the edge server's routes.
pub struct RegisterGrpcServiceFn {
    pub service_name: &'static str,
    pub register: Box<dyn Fn(&mut RoutesBuilder) + Send + Sync>,
}

impl RegisterGrpcServiceFn {
    pub fn new(
        service_name: &'static str,
        register: impl Fn(&mut RoutesBuilder) + Send + Sync + 'static,
    ) -> Self {
        Self {
            service_name,
            register: Box::new(register),
        }
    }
}

impl std::fmt::Debug for RegisterGrpcServiceFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterGrpcServiceFn")
            .field("service_name", &self.service_name)
            .finish()
    }
}

/// Installers collected before the edge server starts serving.
#[derive(Default)]
pub(crate) struct GrpcInstallerStore {
    inner: Mutex<Vec<RegisterGrpcServiceFn>>,
}

impl GrpcInstallerStore {
    /// Add an installer. A service name may only be installed once.
    pub(crate) fn add(&self, installer: RegisterGrpcServiceFn) -> anyhow::Result<()> {
        let mut guard = self.inner.lock();
        if guard.iter().any(|i| i.service_name == installer.service_name) {
            anyhow::bail!("Duplicate gRPC service detected: {}", installer.service_name);
        }
        guard.push(installer);
        Ok(())
    }

    pub(crate) fn service_names(&self) -> Vec<&'static str> {
        self.inner.lock().iter().map(|i| i.service_name).collect()
    }

    /// Consume every installer into one route table.
    pub(crate) fn take_routes(&self) -> anyhow::Result<Routes> {
        let installers = std::mem::take(&mut *self.inner.lock());

        let mut seen = HashSet::new();
        let mut builder = RoutesBuilder::default();
        for installer in installers {
            if !seen.insert(installer.service_name) {
                anyhow::bail!("Duplicate gRPC service detected: {}", installer.service_name);
            }
            (installer.register)(&mut builder);
            tracing::debug!(service = installer.service_name, "gRPC service installed");
        }
        Ok(builder.routes())
    }
}
