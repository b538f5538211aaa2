use musterkit::{ModuleCtx, Service};

pub const MODULE_NAME: &str = "users";

/// Factory for the `users` module.
pub fn module_factory() -> impl Fn(&ModuleCtx) -> anyhow::Result<Service> + Send + Sync + 'static {
    |ctx: &ModuleCtx| crate::domain_module(MODULE_NAME, ctx)
}
