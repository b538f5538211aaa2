//! Domain modules of the roster: `units` and `users`.
//!
//! Both are lifecycle shells around externally implemented record handlers.
//! Each one takes the shared storage handle and the edge server from the
//! client hub, mounts a small info route, and then idles until stopped.

use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Json, Router};
use edge_server::EdgeServer;
use musterkit::{ModuleCtx, Service};
use serde::Serialize;
use storage::Storage;

pub mod units;
pub mod users;

/// Modules every roster module depends on.
pub const DEPENDENCIES: [&str; 2] = [storage::MODULE_NAME, edge_server::MODULE_NAME];

#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    pub module: &'static str,
    pub storage_backend: String,
}

fn domain_module(module: &'static str, ctx: &ModuleCtx) -> anyhow::Result<Service> {
    let hub = ctx.client_hub();
    let storage = hub
        .require::<Storage>()
        .with_context(|| format!("module '{module}' needs the storage handle"))?;
    let server = hub
        .require::<EdgeServer>()
        .with_context(|| format!("module '{module}' needs the edge server"))?;

    let info = ModuleInfo {
        module,
        storage_backend: storage.backend().to_string(),
    };
    server.merge_router(info_routes(info))?;

    tracing::debug!(module, "domain module constructed");
    Ok(Service::named(module, IdleModule { _storage: storage }))
}

fn info_routes(info: ModuleInfo) -> Router {
    let path = format!("/{}/info", info.module);
    let info = Arc::new(info);
    Router::new().route(
        &path,
        get(move || {
            let info = Arc::clone(&info);
            async move { Json((*info).clone()) }
        }),
    )
}

/// Holds the storage handle for as long as the module runs.
struct IdleModule {
    _storage: Arc<Storage>,
}

impl musterkit::Lifecycle for IdleModule {}

#[cfg(test)]
mod tests {
    use super::*;
    use musterkit::ClientHub;
    use musterkit_bootstrap::{DatabaseConfig, ServerConfig};

    fn hub_with_server() -> Arc<ClientHub> {
        let hub = Arc::new(ClientHub::new());
        let server = EdgeServer::bind(ServerConfig {
            http_bind_addr: "127.0.0.1:0".parse().unwrap(),
            grpc_bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        })
        .unwrap();
        hub.register(Arc::new(server));
        hub
    }

    #[tokio::test]
    async fn construction_needs_storage() {
        let hub = hub_with_server();
        let err = users::module_factory()(&ModuleCtx::new(users::MODULE_NAME, hub))
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("storage handle"));
    }

    #[tokio::test]
    async fn both_modules_construct_with_their_dependencies() {
        let hub = hub_with_server();
        let storage = Storage::connect_lazy(&DatabaseConfig {
            dsn: "sqlite::memory:".to_string(),
            max_connections: 1,
        })
        .unwrap();
        hub.register(Arc::new(storage));

        let units = units::module_factory()(&ModuleCtx::new(units::MODULE_NAME, Arc::clone(&hub))).unwrap();
        let users = users::module_factory()(&ModuleCtx::new(users::MODULE_NAME, hub)).unwrap();
        assert_eq!(units.name(), Some("units"));
        assert_eq!(users.name(), Some("users"));
    }
}
