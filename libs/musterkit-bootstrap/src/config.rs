use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment prefix for configuration overrides, e.g.
/// `MUSTER__SERVER__HTTP_BIND_ADDR=127.0.0.1:8081` maps to `server.http_bind_addr`.
pub const ENV_PREFIX: &str = "MUSTER__";

/// Main application configuration with strongly-typed global sections
/// and a flexible per-module configuration bag.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage connection (optional; required only when storage runs).
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Logging configuration (optional, uses defaults if None).
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    /// Per-module configuration bag: module_name → arbitrary JSON/YAML value.
    #[serde(default)]
    pub modules: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeConfig {
    /// Modules or groups to run.
    pub target: Vec<String>,
    /// Pause between a termination signal and stopping the modules.
    #[serde(with = "humantime_serde")]
    pub shutdown_delay: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            target: vec!["all".to_string()],
            shutdown_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub http_bind_addr: SocketAddr,
    pub grpc_bind_addr: SocketAddr,
    /// Deadline for one HTTP request handler.
    #[serde(with = "humantime_serde")]
    pub http_request_timeout: Duration,
    /// Deadline for one RPC call.
    #[serde(with = "humantime_serde")]
    pub grpc_request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub grpc_keepalive_interval: Duration,
    /// Upper bound for in-flight HTTP requests to finish on shutdown.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            grpc_bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            http_request_timeout: Duration::from_secs(30),
            grpc_request_timeout: Duration::from_secs(30),
            grpc_keepalive_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Connection string; `${VAR}` references are expanded from the environment.
    pub dsn: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

const fn default_max_connections() -> u32 {
    10
}

impl DatabaseConfig {
    /// The DSN with environment references expanded, validated.
    pub fn resolved_dsn(&self) -> Result<String> {
        let dsn = expand_env_in_dsn(&self.dsn)?;
        validate_dsn(&dsn)?;
        Ok(dsn)
    }
}

/// Logging configuration - maps subsystem names to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit subsystems.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Section {
    #[serde(default)]
    pub console_level: String, // "info", "debug", "error", "off"
    #[serde(default)]
    pub file: String, // "logs/muster.log", empty for no file
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            ..Section::default()
        },
    );
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            server: ServerConfig::default(),
            database: None,
            logging: Some(default_logging_config()),
            modules: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Layered loading: defaults → YAML file (if given) → environment variables.
    pub fn load_layered(config_path: Option<&Path>) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        // Optional sections stay None unless YAML/ENV provide them.
        let base = AppConfig {
            logging: None,
            ..AppConfig::default()
        };

        let mut figment = Figment::new().merge(Serialized::defaults(base));
        if let Some(path) = config_path {
            if !path.is_file() {
                anyhow::bail!("config file '{}' does not exist", path.display());
            }
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment
            .extract()
            .context("Failed to extract config from figment")
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if !args.targets.is_empty() {
            self.runtime.target = args.targets.clone();
        }
        if let Some(delay) = args.shutdown_delay {
            self.runtime.shutdown_delay = delay;
        }

        let logging = self.logging.get_or_insert_with(default_logging_config);
        let default_section = logging.entry("default".to_string()).or_default();
        match args.verbose {
            0 => {}
            1 => default_section.console_level = "debug".to_string(),
            _ => default_section.console_level = "trace".to_string(),
        }
    }

    /// Checks that do not need any module to be constructed.
    pub fn validate(&self) -> Result<()> {
        if self.runtime.target.is_empty() {
            anyhow::bail!("runtime.target must name at least one module");
        }
        if self.server.drain_timeout.is_zero() {
            anyhow::bail!("server.drain_timeout must be greater than zero");
        }
        if let Some(db) = &self.database {
            db.resolved_dsn().context("database.dsn")?;
        }
        Ok(())
    }

    /// Typed view of one module's entry in the `modules` bag.
    pub fn module_config<T>(&self, module: &str) -> Result<Option<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        self.modules
            .get(module)
            .map(|raw| {
                serde_json::from_value(raw.clone())
                    .with_context(|| format!("invalid configuration for module '{module}'"))
            })
            .transpose()
    }
}

/// Command line values that override the loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub targets: Vec<String>,
    pub shutdown_delay: Option<Duration>,
    pub verbose: u8,
}

/// Expands `${VARNAME}` references from the environment.
/// A referenced variable that is not set is an error.
pub fn expand_env_in_dsn(dsn: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").context("env pattern")?;

    let mut result = dsn.to_string();
    for cap in re.captures_iter(dsn) {
        let var_name = &cap[1];
        let value = std::env::var(var_name)
            .with_context(|| format!("Environment variable '{var_name}' not found in DSN"))?;
        result = result.replace(&cap[0], &value);
    }
    Ok(result)
}

/// SQLite DSNs use a syntax the dsn crate does not know, so they are only
/// checked for their scheme. Everything else needs `<driver>://` followed by
/// a host.
pub fn validate_dsn(dsn: &str) -> Result<()> {
    if dsn.starts_with("sqlite:") {
        return Ok(());
    }
    let Some((scheme, rest)) = dsn.split_once("://") else {
        anyhow::bail!("Invalid DSN '{dsn}': expected '<driver>://...'");
    };
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
        anyhow::bail!("Invalid DSN '{dsn}': invalid driver '{scheme}'");
    }
    let location = rest.rsplit_once('@').map_or(rest, |(_, location)| location);
    if location.is_empty() || location.starts_with(['/', ':', '?']) {
        anyhow::bail!("Invalid DSN '{dsn}': missing host");
    }
    dsn::parse(dsn).map_err(|e| anyhow::anyhow!("Invalid DSN '{dsn}': {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests;
