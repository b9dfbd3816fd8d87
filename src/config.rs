use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming an optional TOML configuration file
pub const CONFIG_PATH_VAR: &str = "AUTH_PROXY_CONFIG";

pub const BACKEND_ADDRESS_VAR: &str = "BACKEND_ADDRESS";
pub const LISTEN_PORT_VAR: &str = "LISTEN_PORT";
pub const BIND_ADDRESS_VAR: &str = "BIND_ADDRESS";
pub const HEALTH_PATH_VAR: &str = "HEALTH_PATH";
pub const CONNECT_TIMEOUT_VAR: &str = "BACKEND_CONNECT_TIMEOUT_SECS";
pub const RESPONSE_TIMEOUT_VAR: &str = "BACKEND_RESPONSE_TIMEOUT_SECS";
pub const POOL_MAX_IDLE_VAR: &str = "POOL_MAX_IDLE";
pub const POOL_IDLE_TIMEOUT_VAR: &str = "POOL_IDLE_TIMEOUT_SECS";
pub const MAX_CONCURRENT_VAR: &str = "MAX_CONCURRENT_UPSTREAM";
pub const AUTH_REALM_VAR: &str = "AUTH_REALM";

/// Errors raised while assembling the startup configuration.
///
/// Every variant is fatal: the process exits before it starts listening.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing required setting {key}")]
    Missing { key: String },

    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("configuration errors:\n  - {}", join_errors(.0))]
    Multiple(Vec<ConfigError>),
}

impl ConfigError {
    pub fn missing(key: impl Into<String>) -> Self {
        ConfigError::Missing { key: key.into() }
    }

    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Collapse a list of problems into a single error, or `Ok` if there were none
    pub fn from_list(mut errors: Vec<ConfigError>) -> Result<(), ConfigError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::Multiple(errors)),
        }
    }
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n  - ")
}

/// Source of environment-style settings.
///
/// The process environment in production, a plain map in tests.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;

    /// First non-blank value among `keys`
    fn first_of(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|key| self.var(key))
            .find(|value| !value.trim().is_empty())
    }
}

/// The real process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Fixed upstream address, `host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    host: String,
    port: u16,
}

impl BackendTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for a Host header or URI authority
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for BackendTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("http://").unwrap_or(s);
        let s = s.trim_end_matches('/');

        if s.contains('/') {
            return Err(format!("'{}' must be host:port without a path", s));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("'{}' must be in host:port form", s))?;

        if host.is_empty() {
            return Err(format!("'{}' has an empty host", s));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| format!("'{}' has an invalid port", s))?;
        if port == 0 {
            return Err(format!("'{}': port must be greater than 0", s));
        }

        Ok(Self::new(host, port))
    }
}

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Authentication settings (credentials themselves come only from the environment)
    #[serde(default)]
    pub auth: AuthSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Unauthenticated liveness path (default: /healthcheck)
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Seconds in-flight connections get to finish after a shutdown signal
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            health_path: default_health_path(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Upstream `host:port`; required
    pub address: Option<String>,

    /// Backend connect timeout in seconds (default: 5, expiry answers 502)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Backend response timeout in seconds (default: 30, expiry answers 504)
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,

    /// Maximum idle pooled connections to the backend (default: 10)
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,

    /// Idle pooled connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Maximum simultaneous in-flight upstream requests (default: 256)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            address: None,
            connect_timeout_secs: default_connect_timeout(),
            response_timeout_secs: default_response_timeout(),
            pool_max_idle: default_pool_max_idle(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    /// Realm advertised in the `WWW-Authenticate` challenge
    #[serde(default = "default_realm")]
    pub realm: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            realm: default_realm(),
        }
    }
}

fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_health_path() -> String {
    "/healthcheck".to_string()
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_response_timeout() -> u64 {
    30
}

fn default_pool_max_idle() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_max_concurrent() -> usize {
    256
}

fn default_realm() -> String {
    "auth-proxy".to_string()
}

/// Parse `key` from the environment into `slot`, recording a problem if it doesn't parse
fn override_from_env<T, E>(env: &E, key: &str, slot: &mut T, errors: &mut Vec<ConfigError>)
where
    T: FromStr,
    E: EnvSource + ?Sized,
{
    let Some(raw) = env.var(key) else {
        return;
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return;
    }
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => errors.push(ConfigError::invalid(key, format!("'{}' is not a valid value", raw))),
    }
}

impl Config {
    /// Read a TOML config file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Build the startup configuration: defaults, then the optional file, then the environment
    pub fn load<E: EnvSource + ?Sized>(path: Option<&Path>, env: &E) -> Result<Self, ConfigError> {
        let config = Self::load_unvalidated(path, env)?;
        config.validate()?;
        Ok(config)
    }

    /// Layer file and environment without requiring a backend; used by `auth-proxy probe`
    pub fn load_unvalidated<E: EnvSource + ?Sized>(
        path: Option<&Path>,
        env: &E,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        Ok(config)
    }

    /// URL of the health endpoint as seen from inside the container
    pub fn local_health_url(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.server.port, self.server.health_path)
    }

    /// Overlay environment variables onto this configuration
    pub fn apply_env<E: EnvSource + ?Sized>(&mut self, env: &E) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if let Some(address) = env.first_of(&[BACKEND_ADDRESS_VAR]) {
            self.backend.address = Some(address.trim().to_string());
        }
        if let Some(bind) = env.first_of(&[BIND_ADDRESS_VAR]) {
            self.server.bind = bind.trim().to_string();
        }
        if let Some(path) = env.first_of(&[HEALTH_PATH_VAR]) {
            self.server.health_path = path.trim().to_string();
        }
        if let Some(realm) = env.first_of(&[AUTH_REALM_VAR]) {
            self.auth.realm = realm.trim().to_string();
        }

        override_from_env(env, LISTEN_PORT_VAR, &mut self.server.port, &mut errors);
        override_from_env(env, CONNECT_TIMEOUT_VAR, &mut self.backend.connect_timeout_secs, &mut errors);
        override_from_env(env, RESPONSE_TIMEOUT_VAR, &mut self.backend.response_timeout_secs, &mut errors);
        override_from_env(env, POOL_MAX_IDLE_VAR, &mut self.backend.pool_max_idle, &mut errors);
        override_from_env(env, POOL_IDLE_TIMEOUT_VAR, &mut self.backend.pool_idle_timeout_secs, &mut errors);
        override_from_env(env, MAX_CONCURRENT_VAR, &mut self.backend.max_concurrent, &mut errors);

        ConfigError::from_list(errors)
    }

    /// The configured upstream, parsed
    pub fn backend_target(&self) -> Result<BackendTarget, ConfigError> {
        let address = self
            .backend
            .address
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| ConfigError::missing(BACKEND_ADDRESS_VAR))?;
        address
            .parse()
            .map_err(|message: String| ConfigError::invalid(BACKEND_ADDRESS_VAR, message))
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if let Err(e) = self.backend_target() {
            errors.push(e);
        }

        if !self.server.health_path.starts_with('/') {
            errors.push(ConfigError::invalid(
                HEALTH_PATH_VAR,
                format!("'{}' must start with '/'", self.server.health_path),
            ));
        }

        if self.server.bind.parse::<std::net::IpAddr>().is_err() {
            errors.push(ConfigError::invalid(
                BIND_ADDRESS_VAR,
                format!("'{}' is not an IP address", self.server.bind),
            ));
        }

        if self.backend.connect_timeout_secs == 0 {
            errors.push(ConfigError::invalid(CONNECT_TIMEOUT_VAR, "must be greater than 0"));
        }
        if self.backend.response_timeout_secs == 0 {
            errors.push(ConfigError::invalid(RESPONSE_TIMEOUT_VAR, "must be greater than 0"));
        }
        // The connect happens inside the response window, so a connect timeout
        // that outlasts it would surface as 504 instead of 502
        if self.backend.response_timeout_secs > 0
            && self.backend.connect_timeout_secs >= self.backend.response_timeout_secs
        {
            errors.push(ConfigError::invalid(
                CONNECT_TIMEOUT_VAR,
                format!(
                    "must be less than {} ({}s)",
                    RESPONSE_TIMEOUT_VAR, self.backend.response_timeout_secs
                ),
            ));
        }
        if self.backend.max_concurrent == 0 {
            errors.push(ConfigError::invalid(MAX_CONCURRENT_VAR, "must be greater than 0"));
        }

        if self.auth.realm.contains('"') {
            errors.push(ConfigError::invalid(AUTH_REALM_VAR, "must not contain '\"'"));
        }

        ConfigError::from_list(errors)
    }

    /// `bind:port` socket address for the listener
    pub fn listen_addr(&self) -> Result<std::net::SocketAddr, ConfigError> {
        format!("{}:{}", self.server.bind, self.server.port)
            .parse()
            .or_else(|_| {
                // IPv6 literals need brackets
                format!("[{}]:{}", self.server.bind, self.server.port).parse()
            })
            .map_err(|_| {
                ConfigError::invalid(
                    BIND_ADDRESS_VAR,
                    format!("'{}:{}' is not a socket address", self.server.bind, self.server.port),
                )
            })
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_period_secs)
    }
}
