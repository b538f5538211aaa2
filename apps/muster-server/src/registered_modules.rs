use edge_server::ServiceLookup;
use musterkit::{ModuleRegistry, RegistryError, Visibility};
use musterkit_bootstrap::AppConfig;
use roster::{units, users};

pub const GROUP_ALL: &str = "all";
pub const GROUP_BACKEND: &str = "backend";

/// Every module this binary knows about, with its dependencies.
///
/// `server_waits_for` yields the services the edge server must outlive; it is
/// only called once the run is assembled.
pub fn build_registry(
    config: &AppConfig,
    server_waits_for: ServiceLookup,
) -> Result<ModuleRegistry, RegistryError> {
    let mut registry = ModuleRegistry::new();

    registry.register_module(
        edge_server::MODULE_NAME,
        edge_server::module_factory(config.server.clone(), server_waits_for),
        Visibility::UserInvisible,
    )?;
    registry.register_module(
        storage::MODULE_NAME,
        storage::module_factory(config.database.clone()),
        Visibility::UserInvisible,
    )?;
    registry.register_module(units::MODULE_NAME, units::module_factory(), Visibility::UserVisible)?;
    registry.register_module(users::MODULE_NAME, users::module_factory(), Visibility::UserVisible)?;

    registry.add_dependency(units::MODULE_NAME, &roster::DEPENDENCIES)?;
    registry.add_dependency(users::MODULE_NAME, &roster::DEPENDENCIES)?;

    registry.register_group(GROUP_ALL)?;
    registry.add_dependency(GROUP_ALL, &[units::MODULE_NAME, users::MODULE_NAME])?;
    registry.register_group(GROUP_BACKEND)?;

    Ok(registry)
}

/// Configuration that only the modules of `order` need.
pub fn check_run(config: &AppConfig, order: &[String]) -> anyhow::Result<()> {
    if order.iter().any(|m| m == storage::MODULE_NAME) && config.database.is_none() {
        anyhow::bail!(
            "module '{}' is part of the run but the `database` section is missing",
            storage::MODULE_NAME
        );
    }
    Ok(())
}
