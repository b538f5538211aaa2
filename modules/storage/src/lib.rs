//! Shared storage handle.
//!
//! The `storage` module owns one lazily connecting `sqlx` pool and publishes
//! it as `Arc<Storage>` for the domain modules. Record persistence itself
//! happens in those modules; this crate only manages the handle's lifetime.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use musterkit::{FailureCause, Lifecycle, ModuleCtx, Service, ServiceResult};
use musterkit_bootstrap::DatabaseConfig;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

pub const MODULE_NAME: &str = "storage";

/// Connection handle shared by every domain module.
#[derive(Clone, Debug)]
pub struct Storage {
    pool: AnyPool,
    backend: String,
}

impl Storage {
    /// Build the pool without connecting. Connections are opened on first use.
    pub fn connect_lazy(cfg: &DatabaseConfig) -> anyhow::Result<Self> {
        let dsn = cfg.resolved_dsn().context("invalid database configuration")?;
        let backend = dsn
            .split_once(':')
            .map(|(scheme, _)| scheme.to_string())
            .unwrap_or_default();

        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect_lazy(&dsn)
            .with_context(|| format!("creating {backend} connection pool"))?;

        tracing::info!(%backend, max_connections = cfg.max_connections, "storage pool created");
        Ok(Self { pool, backend })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// URL scheme of the DSN, e.g. `postgres` or `sqlite`.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// Factory for the `storage` module. Fails when the run has no `database`
/// section.
pub fn module_factory(
    cfg: Option<DatabaseConfig>,
) -> impl Fn(&ModuleCtx) -> anyhow::Result<Service> + Send + Sync + 'static {
    move |ctx: &ModuleCtx| {
        let cfg = cfg
            .as_ref()
            .context("the storage module requires a `database` configuration section")?;
        let storage = Arc::new(Storage::connect_lazy(cfg)?);
        ctx.client_hub().register(Arc::clone(&storage));
        Ok(Service::named(MODULE_NAME, StorageService { storage }))
    }
}

struct StorageService {
    storage: Arc<Storage>,
}

#[async_trait]
impl Lifecycle for StorageService {
    async fn stopping(&self, _failure: Option<&FailureCause>) -> ServiceResult {
        self.storage.pool.close().await;
        tracing::debug!(backend = %self.storage.backend, "storage pool closed");
        Ok(())
    }
}
