use std::{collections::HashMap, fmt};

/// Where service configuration variables come from: the process
/// environment in deployments, an in-memory map in tests and local
/// experiments.
///
/// Keeping the source behind one type lets the `from_env` constructors in
/// the service crates stay free of `std::env` so config parsing can be
/// exercised without mutating process state.
#[derive(Debug, Clone)]
pub enum EnvSource {
    Process,
    Map(HashMap<String, String>),
}

impl EnvSource {
    /// A source backed by the current process environment.
    pub fn process() -> Self {
        EnvSource::Process
    }

    /// A source backed by a fixed set of variables.
    pub fn from_map<const N: usize>(vars: [(&str, &str); N]) -> Self {
        EnvSource::Map(
            vars.into_iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        )
    }

    /// Looks up a variable, `None` when it is unset. An empty value is
    /// returned as-is, only absence counts as unset.
    pub fn var(&self, key: &str) -> Option<String> {
        match self {
            EnvSource::Process => std::env::var(key).ok(),
            EnvSource::Map(vars) => vars.get(key).cloned(),
        }
    }

    /// Looks up a required variable.
    pub fn require(&self, var: &'static str) -> Result<String, ConfigError> {
        self.var(var).ok_or(ConfigError::MissingVar(var))
    }

    /// Looks up an optional boolean variable, accepting only `true` and
    /// `false` when set.
    pub fn bool_var(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.var(var) {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidVar {
                var,
                reason: "must be either \"true\" or \"false\"".to_string(),
            }),
            None => Ok(default),
        }
    }
}

/// Provides a custom error type to be used for failures
/// in gathering service configuration from the environment.
#[derive(Debug)]
pub enum ConfigError {
    MissingVar(&'static str),
    InvalidVar {
        var: &'static str,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::MissingVar(var) => {
                write!(f, "config error: required environment variable `{var}` is not set")
            }
            ConfigError::InvalidVar { var, reason } => {
                write!(f, "config error: invalid value for `{var}`: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_map_source_lookup() {
        let env = EnvSource::from_map([("TOPIC_PREFIX", "mediator")]);
        assert_eq!(env.var("TOPIC_PREFIX"), Some("mediator".to_string()));
        assert_eq!(env.var("REDIS_SERVER_URL"), None);
    }

    #[test]
    fn test_require_reports_the_missing_variable() {
        let env = EnvSource::from_map([]);
        assert!(matches!(
            env.require("REDIS_SERVER_URL"),
            Err(ConfigError::MissingVar("REDIS_SERVER_URL"))
        ));
    }

    #[test]
    fn test_bool_var_defaults_and_validates() {
        let env = EnvSource::from_map([("MEDIATOR_MODE", "true"), ("REDIS_CLUSTER_MODE", "yes")]);
        assert!(env.bool_var("MEDIATOR_MODE", false).unwrap());
        assert!(env.bool_var("UNSET", true).unwrap());
        assert!(matches!(
            env.bool_var("REDIS_CLUSTER_MODE", true),
            Err(ConfigError::InvalidVar {
                var: "REDIS_CLUSTER_MODE",
                ..
            })
        ));
    }
}
