use courier_helpers::{
    env::{ConfigError, EnvSource},
    redis::ConnectionConfig,
};
use serde_json::Value;

const DEFAULT_TOPIC_PREFIX: &str = "acapy";

/// The wire transport a relay instance terminates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportKind {
    Http,
    Ws,
}

/// One `[transport, host, port]` entry from the inbound transport
/// configuration, yielding one relay instance.
#[derive(Debug, Clone)]
pub struct TransportBinding {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
}

/// Service configuration for the inbound relay,
/// sourced from the environment.
#[derive(Debug)]
pub struct RelayServiceConfig {
    pub redis_url: String,
    pub cluster_mode: bool,
    pub topic_prefix: String,
    pub mediator_mode: bool,
    pub transports: Vec<TransportBinding>,
}

impl RelayServiceConfig {
    /// Creates a new instance of relay service configuration,
    /// sourcing config from the provided variable source.
    pub fn from_env(env: &EnvSource) -> Result<Self, ConfigError> {
        let raw_transport_config = env.require("INBOUND_TRANSPORT_CONFIG")?;

        Ok(RelayServiceConfig {
            redis_url: env.require("REDIS_SERVER_URL")?,
            cluster_mode: env.bool_var("REDIS_CLUSTER_MODE", true)?,
            topic_prefix: env
                .var("TOPIC_PREFIX")
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            mediator_mode: env.bool_var("MEDIATOR_MODE", false)?,
            transports: parse_transport_config(&raw_transport_config)?,
        })
    }

    pub fn inbound_topic(&self) -> String {
        format!("{prefix}_inbound", prefix = self.topic_prefix)
    }

    pub fn direct_response_topic(&self) -> String {
        format!(
            "{prefix}_inbound_direct_response",
            prefix = self.topic_prefix
        )
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            nodes: vec![self.redis_url.clone()],
            password: None,
            cluster_mode: self.cluster_mode,
        }
    }
}

/// Parses the inbound transport configuration, a JSON array of
/// `[transport, host, port]` triples with `transport` one of `http`
/// and `ws`. Ports are accepted as numbers or strings.
fn parse_transport_config(raw: &str) -> Result<Vec<TransportBinding>, ConfigError> {
    let entries: Vec<(String, String, Value)> =
        serde_json::from_str(raw).map_err(|err| ConfigError::InvalidVar {
            var: "INBOUND_TRANSPORT_CONFIG",
            reason: format!("must be a JSON array of [transport, host, port] triples: {err}"),
        })?;

    let mut bindings = Vec::with_capacity(entries.len());
    for (transport, host, port) in entries {
        let transport = match transport.as_str() {
            "http" => TransportKind::Http,
            "ws" => TransportKind::Ws,
            other => {
                return Err(ConfigError::InvalidVar {
                    var: "INBOUND_TRANSPORT_CONFIG",
                    reason: format!(
                        "only ws and http transport types are supported, got `{other}`"
                    ),
                })
            }
        };
        let port = match &port {
            Value::Number(number) => number.as_u64().and_then(|p| u16::try_from(p).ok()),
            Value::String(text) => text.parse().ok(),
            _ => None,
        }
        .ok_or_else(|| ConfigError::InvalidVar {
            var: "INBOUND_TRANSPORT_CONFIG",
            reason: format!("invalid port `{port}`"),
        })?;

        bindings.push(TransportBinding {
            transport,
            host,
            port,
        });
    }
    Ok(bindings)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn env_with_transports(transports: &str) -> EnvSource {
        EnvSource::from_map([
            ("REDIS_SERVER_URL", "redis://localhost:6379"),
            ("INBOUND_TRANSPORT_CONFIG", transports),
        ])
    }

    #[test]
    fn test_parses_transport_bindings_with_numeric_and_string_ports() {
        let env =
            env_with_transports("[[\"http\", \"0.0.0.0\", 8021], [\"ws\", \"0.0.0.0\", \"8023\"]]");
        let config = RelayServiceConfig::from_env(&env).unwrap();

        assert_eq!(config.transports.len(), 2);
        assert_eq!(config.transports[0].transport, TransportKind::Http);
        assert_eq!(config.transports[0].port, 8021);
        assert_eq!(config.transports[1].transport, TransportKind::Ws);
        assert_eq!(config.transports[1].port, 8023);
        assert_eq!(config.inbound_topic(), "acapy_inbound");
        assert_eq!(
            config.direct_response_topic(),
            "acapy_inbound_direct_response"
        );
        assert!(!config.mediator_mode);
    }

    #[test]
    fn test_rejects_unsupported_transport_type() {
        let env = env_with_transports("[[\"grpc\", \"0.0.0.0\", 8021]]");
        assert!(matches!(
            RelayServiceConfig::from_env(&env),
            Err(ConfigError::InvalidVar {
                var: "INBOUND_TRANSPORT_CONFIG",
                ..
            })
        ));
    }

    #[test]
    fn test_missing_transport_config_is_an_error() {
        let env = EnvSource::from_map([("REDIS_SERVER_URL", "redis://localhost:6379")]);
        assert!(matches!(
            RelayServiceConfig::from_env(&env),
            Err(ConfigError::MissingVar("INBOUND_TRANSPORT_CONFIG"))
        ));
    }
}
