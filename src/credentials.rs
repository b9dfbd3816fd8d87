//! Admin credentials resolved once at startup
//!
//! The pair is read from the environment, validated, and then shared read-only
//! for the lifetime of the process. Rotating credentials requires a restart.

use crate::config::{ConfigError, EnvSource};
use std::fmt;

/// Environment variables holding the admin username, in lookup order
pub const USERNAME_VARS: &[&str] = &["ADMIN_USERNAME", "DEMO_WIREMOCK_ADMIN_USER"];
/// Environment variables holding the admin password, in lookup order
pub const PASSWORD_VARS: &[&str] = &["ADMIN_PASSWORD", "DEMO_WIREMOCK_ADMIN_PASS"];

/// The single username/password pair the proxy admits
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self, ConfigError> {
        let username = username.into();
        let password = password.into();
        let mut errors = Vec::new();

        if username.trim().is_empty() {
            errors.push(ConfigError::missing(USERNAME_VARS[0]));
        } else if username.contains(':') {
            // Basic auth cannot carry a colon in the user-id
            errors.push(ConfigError::invalid(USERNAME_VARS[0], "must not contain ':'"));
        }
        if password.trim().is_empty() {
            errors.push(ConfigError::missing(PASSWORD_VARS[0]));
        }

        ConfigError::from_list(errors)?;
        Ok(Self { username, password })
    }

    /// Resolve the credential pair from environment-style settings
    pub fn load<E: EnvSource + ?Sized>(env: &E) -> Result<Self, ConfigError> {
        let username = env.first_of(USERNAME_VARS).unwrap_or_default();
        let password = env.first_of(PASSWORD_VARS).unwrap_or_default();
        Self::new(username, password)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &"<redacted>")
            .field("password", &"<redacted>")
            .finish()
    }
}
