use std::{collections::HashMap, fmt::Debug, sync::Arc};

use courier_helpers::{envelope::OutboundJob, redis::BusConnection, time::Clock};
use tracing::{debug, error, info};

use crate::{errors::RouterError, routing::route_payload_recip_key};

/// Configuration for the agent-side outbound producer.
#[derive(Debug, Clone)]
pub struct OutboundProducerConfig {
    /// The topic that prepared outbound jobs are pushed onto for the
    /// deliverer.
    pub outbound_topic: String,
    /// When enabled, outbound messages are routed to recipient-key-suffixed
    /// queues through the mediator routing tables.
    pub mediator_mode: bool,
}

/// Queues prepared outbound messages for the deliverer.
pub struct OutboundProducer {
    connection: Box<dyn BusConnection>,
    clock: Arc<dyn Clock + Send + Sync>,
    config: OutboundProducerConfig,
}

impl Debug for OutboundProducer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "OutboundProducer({topic})",
            topic = self.config.outbound_topic
        )
    }
}

impl OutboundProducer {
    pub fn new(
        connection: Box<dyn BusConnection>,
        clock: Arc<dyn Clock + Send + Sync>,
        config: OutboundProducerConfig,
    ) -> Self {
        info!("setting up outbound producer with configuration: {config:?}");
        OutboundProducer {
            connection,
            clock,
            config,
        }
    }

    /// Prepares and queues one outbound message.
    ///
    /// The `Content-Type` header defaults to `application/json` when the
    /// caller has not set one.
    pub async fn enqueue(
        &mut self,
        endpoint: &str,
        payload: &[u8],
        headers: HashMap<String, String>,
    ) -> Result<(), RouterError> {
        if endpoint.is_empty() {
            return Err(RouterError::MissingEndpoint);
        }

        let mut headers = headers;
        headers
            .entry("Content-Type".to_string())
            .or_insert_with(|| "application/json".to_string());

        let job = OutboundJob::new(endpoint, payload, headers);
        let message = job.to_json()?;

        let topic = if self.config.mediator_mode {
            route_payload_recip_key(
                self.connection.as_mut(),
                self.clock.as_ref(),
                payload,
                &self.config.outbound_topic,
            )
            .await?
        } else {
            self.config.outbound_topic.clone()
        };

        debug!("adding outbound message to {topic}");
        self.connection
            .rpush(&topic, &message)
            .await
            .map_err(|err| {
                error!("error while pushing outbound message to {topic}: {err}");
                RouterError::Redis(err)
            })
    }
}
