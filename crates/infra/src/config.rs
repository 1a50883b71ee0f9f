//! Worker configuration from environment variables.
//!
//! | variable | default |
//! |---|---|
//! | `DATABASE_URL` | unset: in-memory stores |
//! | `DATABASE_MAX_CONNECTIONS` | `5` |
//! | `RETRY_WEBHOOKS_ENABLED` | `true` |
//! | `RETRY_PAYOUTS_ENABLED` | `true` |
//! | `RETRY_RUN_ON_STARTUP` | `false` |
//! | `ALLOW_SIMULATED_PROVIDER` | `false` |
//!
//! Retry cadences are fixed in [`crate::schedule`] and cannot be overridden.
//!
//! The worker only ships the simulated payout processor and payment ledger.
//! Pairing them with Postgres would write fake transfers and lose ledger effects,
//! so a `DATABASE_URL` with any retry job enabled is rejected unless
//! `ALLOW_SIMULATED_PROVIDER` is set (staging databases only).

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a boolean, got '{value}'")]
    InvalidBool { name: &'static str, value: String },
    #[error("{name} must be a positive integer, got '{value}'")]
    InvalidNumber { name: &'static str, value: String },
    #[error(
        "DATABASE_URL is set but only simulated payout and ledger collaborators are available; \
         disable the retry jobs or set ALLOW_SIMULATED_PROVIDER=true"
    )]
    SimulatedProviderWithDatabase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub webhooks_enabled: bool,
    pub payouts_enabled: bool,
    pub run_on_startup: bool,
    pub allow_simulated_provider: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 5,
            webhooks_enabled: true,
            payouts_enabled: true,
            run_on_startup: false,
            allow_simulated_provider: false,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let flag = |name: &'static str, default: bool| match lookup(name) {
            Some(value) => parse_bool(name, &value),
            None => Ok(default),
        };

        let database_max_connections = match lookup("DATABASE_MAX_CONNECTIONS") {
            Some(value) => value
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidNumber {
                    name: "DATABASE_MAX_CONNECTIONS",
                    value,
                })?,
            None => defaults.database_max_connections,
        };

        let config = Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            database_max_connections,
            webhooks_enabled: flag("RETRY_WEBHOOKS_ENABLED", defaults.webhooks_enabled)?,
            payouts_enabled: flag("RETRY_PAYOUTS_ENABLED", defaults.payouts_enabled)?,
            run_on_startup: flag("RETRY_RUN_ON_STARTUP", defaults.run_on_startup)?,
            allow_simulated_provider: flag(
                "ALLOW_SIMULATED_PROVIDER",
                defaults.allow_simulated_provider,
            )?,
        };
        config.check_collaborators()?;
        Ok(config)
    }

    fn check_collaborators(&self) -> Result<(), ConfigError> {
        let jobs_enabled = self.webhooks_enabled || self.payouts_enabled;
        if self.database_url.is_some() && jobs_enabled && !self.allow_simulated_provider {
            return Err(ConfigError::SimulatedProviderWithDatabase);
        }
        Ok(())
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            name,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(load(&[]).unwrap(), WorkerConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/learnhub"),
            ("DATABASE_MAX_CONNECTIONS", "12"),
            ("RETRY_PAYOUTS_ENABLED", "false"),
            ("RETRY_RUN_ON_STARTUP", "1"),
            ("ALLOW_SIMULATED_PROVIDER", "true"),
        ])
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/learnhub"));
        assert_eq!(config.database_max_connections, 12);
        assert!(config.webhooks_enabled);
        assert!(!config.payouts_enabled);
        assert!(config.run_on_startup);
        assert!(config.allow_simulated_provider);
    }

    #[test]
    fn database_with_simulated_collaborators_needs_opt_in() {
        assert_eq!(
            load(&[("DATABASE_URL", "postgres://localhost/learnhub")]),
            Err(ConfigError::SimulatedProviderWithDatabase)
        );
        assert_eq!(
            load(&[
                ("DATABASE_URL", "postgres://localhost/learnhub"),
                ("RETRY_PAYOUTS_ENABLED", "false"),
            ]),
            Err(ConfigError::SimulatedProviderWithDatabase)
        );

        let idle = load(&[
            ("DATABASE_URL", "postgres://localhost/learnhub"),
            ("RETRY_WEBHOOKS_ENABLED", "false"),
            ("RETRY_PAYOUTS_ENABLED", "false"),
        ])
        .unwrap();
        assert!(!idle.allow_simulated_provider);

        assert!(load(&[("ALLOW_SIMULATED_PROVIDER", "false")]).is_ok());
    }

    #[test]
    fn blank_database_url_means_in_memory() {
        assert_eq!(load(&[("DATABASE_URL", "  ")]).unwrap().database_url, None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            load(&[("RETRY_WEBHOOKS_ENABLED", "maybe")]),
            Err(ConfigError::InvalidBool { name: "RETRY_WEBHOOKS_ENABLED", .. })
        ));
        assert!(matches!(
            load(&[("DATABASE_MAX_CONNECTIONS", "0")]),
            Err(ConfigError::InvalidNumber { .. })
        ));
    }
}
