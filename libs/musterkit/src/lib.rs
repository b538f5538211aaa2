//! # MusterKit - module lifecycle runtime
//!
//! Runs a selected set of named modules as one process:
//!
//! - **Service**: a `New → Starting → Running → Stopping → Terminated | Failed`
//!   state machine whose phases are supplied by a [`Lifecycle`].
//! - **Registry**: module names, factories and dependency edges; resolves
//!   targets to the concrete modules of a run.
//! - **Module service**: waits for dependencies before starting and for
//!   dependents before stopping.
//! - **Service manager**: starts and stops a run as a unit, stopping everything
//!   as soon as one service fails.
//!
//! ```rust,ignore
//! use musterkit::{ClientHub, ModuleRegistry, ServiceManager, Service, Visibility};
//!
//! let mut registry = ModuleRegistry::new();
//! registry.register_module("db", |_ctx| Ok(Service::idle()), Visibility::UserInvisible)?;
//! registry.register_module("users", |_ctx| Ok(Service::idle()), Visibility::UserVisible)?;
//! registry.add_dependency("users", &["db"])?;
//!
//! let services = registry.init_module_services(&["users"], Arc::new(ClientHub::new()))?;
//! let manager = ServiceManager::new(services.into_values().collect())?;
//! manager.start_async()?;
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;

pub mod client_hub;
pub mod context;
pub mod manager;
pub mod module_service;
pub mod registry;
pub mod service;

pub use client_hub::ClientHub;
pub use context::ModuleCtx;
pub use manager::{ManagerListener, ServiceManager};
pub use module_service::{DependencyLookup, ModuleService};
pub use registry::{ModuleFactory, ModuleRegistry, RegistryError, Visibility};
pub use service::{
    FailureCause, Lifecycle, Service, ServiceError, ServiceId, ServiceResult, State, WeakService,
};
