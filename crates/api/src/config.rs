//! Server configuration from environment variables

use std::fmt;

use bizpilot_billing::{StripeConfig, DEFAULT_TOLERANCE_SECS};
use thiserror::Error;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub bind_address: String,
    /// Maximum age in seconds of a signed webhook timestamp
    pub webhook_tolerance_secs: i64,
    pub database_max_connections: u32,
    pub run_migrations: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"<redacted>")
            .field("stripe_secret_key", &"<redacted>")
            .field("stripe_webhook_secret", &"<redacted>")
            .field("bind_address", &self.bind_address)
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .field("database_max_connections", &self.database_max_connections)
            .field("run_migrations", &self.run_migrations)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            stripe_secret_key: required("STRIPE_SECRET_KEY")?,
            stripe_webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            bind_address: lookup("BIND_ADDRESS")
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            webhook_tolerance_secs: parse_or(
                &lookup,
                "WEBHOOK_TOLERANCE_SECS",
                DEFAULT_TOLERANCE_SECS,
            )?,
            database_max_connections: parse_or(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                DEFAULT_MAX_CONNECTIONS,
            )?,
            run_migrations: parse_or(&lookup, "RUN_MIGRATIONS", true)?,
        })
    }

    pub fn stripe_config(&self) -> StripeConfig {
        StripeConfig {
            secret_key: self.stripe_secret_key.clone(),
            webhook_secret: self.stripe_webhook_secret.clone(),
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("DATABASE_URL", "postgres://localhost/bizpilot"),
        ("STRIPE_SECRET_KEY", "sk_test_123"),
        ("STRIPE_WEBHOOK_SECRET", "whsec_123"),
    ];

    #[test]
    fn test_defaults_apply() {
        let config = Config::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.webhook_tolerance_secs, 300);
        assert_eq!(config.database_max_connections, 10);
        assert!(config.run_migrations);
    }

    #[test]
    fn test_missing_webhook_secret() {
        let err = Config::from_lookup(lookup(&REQUIRED[..2])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("STRIPE_WEBHOOK_SECRET")));
    }

    #[test]
    fn test_blank_value_counts_as_missing() {
        let mut vars = REQUIRED.to_vec();
        vars[0] = ("DATABASE_URL", "  ");
        let err = Config::from_lookup(lookup(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn test_overrides_are_parsed() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("WEBHOOK_TOLERANCE_SECS", "60"));
        vars.push(("RUN_MIGRATIONS", "false"));
        vars.push(("BIND_ADDRESS", "127.0.0.1:9000"));
        let config = Config::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.webhook_tolerance_secs, 60);
        assert!(!config.run_migrations);
        assert_eq!(config.bind_address, "127.0.0.1:9000");
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("DATABASE_MAX_CONNECTIONS", "lots"));
        let err = Config::from_lookup(lookup(&vars)).unwrap_err();
        assert!(err.to_string().starts_with("DATABASE_MAX_CONNECTIONS is invalid"));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = Config::from_lookup(lookup(&REQUIRED)).unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("sk_test_123"));
        assert!(!rendered.contains("whsec_123"));
    }
}
