//! Simulation configuration.
//!
//! Loaded from environment variables by the `changefeed-sim` binary.
//!
//! # Environment Variables
//!
//! - `CHANGEFEED_SEED`: Random seed (default: chosen at random and logged)
//! - `CHANGEFEED_STEPS`: Number of random operations to run (default: `200`)
//! - `CHANGEFEED_GROUPS`: Number of distinct join-key values (default: `6`)
//!
//! # Invariants
//!
//! - `steps` and `groups` are always at least 1

/// Simulation configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationConfig {
    /// Seed for the operation generator. The same seed replays the same run.
    pub seed: u64,
    /// Number of random operations.
    pub steps: usize,
    /// Number of distinct `group` values rows are spread over.
    pub groups: usize,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl SimulationConfig {
    pub const DEFAULT_STEPS: usize = 200;
    pub const DEFAULT_GROUPS: usize = 6;

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but not a valid number, or if
    /// `CHANGEFEED_STEPS` / `CHANGEFEED_GROUPS` is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value.
    ///
    /// # Errors
    ///
    /// Same as [`SimulationConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let seed = match lookup("CHANGEFEED_SEED") {
            Some(value) => parse::<u64>("CHANGEFEED_SEED", &value)?,
            None => rand::random(),
        };
        let steps = load_count(&lookup, "CHANGEFEED_STEPS", Self::DEFAULT_STEPS)?;
        let groups = load_count(&lookup, "CHANGEFEED_GROUPS", Self::DEFAULT_GROUPS)?;

        Ok(Self {
            seed,
            steps,
            groups,
        })
    }
}

fn load_count(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    let Some(value) = lookup(name) else {
        return Ok(default);
    };
    let count = parse::<usize>(name, &value)?;
    if count == 0 {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    Ok(count)
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        message: format!("'{value}' is not a valid non-negative integer"),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = SimulationConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.steps, SimulationConfig::DEFAULT_STEPS);
        assert_eq!(config.groups, SimulationConfig::DEFAULT_GROUPS);
    }

    #[test]
    fn test_explicit_values() {
        let config = SimulationConfig::from_lookup(lookup(&[
            ("CHANGEFEED_SEED", "42"),
            ("CHANGEFEED_STEPS", "10"),
            ("CHANGEFEED_GROUPS", " 3 "),
        ]))
        .unwrap();
        assert_eq!(
            config,
            SimulationConfig {
                seed: 42,
                steps: 10,
                groups: 3,
            }
        );
    }

    #[test]
    fn test_invalid_seed() {
        let error = SimulationConfig::from_lookup(lookup(&[("CHANGEFEED_SEED", "abc")]))
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "invalid value for CHANGEFEED_SEED: 'abc' is not a valid non-negative integer"
        );
    }

    #[test]
    fn test_zero_groups_rejected() {
        let error = SimulationConfig::from_lookup(lookup(&[("CHANGEFEED_GROUPS", "0")]))
            .unwrap_err();
        assert_eq!(
            error,
            ConfigError::InvalidValue {
                name: "CHANGEFEED_GROUPS".to_string(),
                message: "must be at least 1".to_string(),
            }
        );
    }

    #[test]
    fn test_config_error_display_missing() {
        let error = ConfigError::MissingEnvVar("TEST_VAR".to_string());
        assert_eq!(
            error.to_string(),
            "missing required environment variable: TEST_VAR"
        );
    }
}
