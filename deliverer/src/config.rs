use courier_helpers::{
    env::{ConfigError, EnvSource},
    redis::ConnectionConfig,
};

const DEFAULT_TOPIC_PREFIX: &str = "acapy";

/// Service configuration for the outbound deliverer,
/// sourced from the environment.
#[derive(Debug)]
pub struct DelivererServiceConfig {
    pub redis_url: String,
    pub cluster_mode: bool,
    pub topic_prefix: String,
}

impl DelivererServiceConfig {
    /// Creates a new instance of deliverer service configuration,
    /// sourcing config from the provided variable source.
    pub fn from_env(env: &EnvSource) -> Result<Self, ConfigError> {
        Ok(DelivererServiceConfig {
            redis_url: env.require("REDIS_SERVER_URL")?,
            cluster_mode: env.bool_var("REDIS_CLUSTER_MODE", true)?,
            topic_prefix: env
                .var("TOPIC_PREFIX")
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
        })
    }

    pub fn outbound_topic(&self) -> String {
        format!("{prefix}_outbound", prefix = self.topic_prefix)
    }

    pub fn retry_topic(&self) -> String {
        format!("{prefix}_outbound_retry", prefix = self.topic_prefix)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            nodes: vec![self.redis_url.clone()],
            password: None,
            cluster_mode: self.cluster_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_derives_topics_from_prefix() {
        let env = EnvSource::from_map([
            ("REDIS_SERVER_URL", "redis://localhost:6379"),
            ("TOPIC_PREFIX", "mediator"),
        ]);
        let config = DelivererServiceConfig::from_env(&env).unwrap();
        assert_eq!(config.outbound_topic(), "mediator_outbound");
        assert_eq!(config.retry_topic(), "mediator_outbound_retry");
        assert!(config.cluster_mode);
    }

    #[test]
    fn test_missing_redis_url_is_an_error() {
        let env = EnvSource::from_map([]);
        assert!(matches!(
            DelivererServiceConfig::from_env(&env),
            Err(ConfigError::MissingVar("REDIS_SERVER_URL"))
        ));
    }
}
