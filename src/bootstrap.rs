// ============================================================================
// Pipeline Bootstrap
// ============================================================================
//
// Provisions the topics, builds the publisher and spawns one relay per
// staging topic. Every client owns its own transactional.id:
//
//   {prefix}publisher-{pod}
//   {prefix}relay-{stagingTopic}-{pod}
//
// Ids are stable across restarts of the same pod, so a restarted process
// fences its predecessor and aborts whatever transaction it left open.
//
// ============================================================================

use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::kafka::{
    KafkaStagingConsumer, KafkaTopicAdmin, KafkaTransactionalProducer, MemoryBroker,
    StagingConsumer, Topology, TransactionalProducer,
};
use crate::publisher::{Publisher, StagingPublisher};
use crate::relay::{RelayHealth, RelayStats, StagingRelay};
use courier_config::Config;

/// A running publisher and its relay workers
pub struct Pipeline {
    pub publisher: Arc<dyn StagingPublisher>,
    relays: Vec<(String, JoinHandle<Result<RelayStats>>)>,
    shutdown: Arc<AtomicBool>,
    health: RelayHealth,
}

impl Pipeline {
    /// Shared handle that flips once any relay stops before shutdown
    pub fn health(&self) -> RelayHealth {
        self.health.clone()
    }

    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    /// Signal the relays and wait for them, up to `grace`
    ///
    /// A relay always finishes its in-flight record (commit or abort) before
    /// it observes the flag.
    pub async fn shutdown(self, grace: Duration) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);

        let relays = self.relays;
        let joined = tokio::time::timeout(grace, async move {
            let mut failures = 0;
            for (source, handle) in relays {
                match handle.await {
                    Ok(Ok(stats)) => info!(
                        source = %source,
                        committed = stats.committed,
                        aborted = stats.aborted,
                        "Relay joined"
                    ),
                    Ok(Err(e)) => {
                        failures += 1;
                        error!(source = %source, error = %e, "Relay ended with an error");
                    }
                    Err(e) => {
                        failures += 1;
                        error!(source = %source, error = %e, "Relay task panicked");
                    }
                }
            }
            failures
        })
        .await;

        match joined {
            Ok(0) => Ok(()),
            Ok(failures) => Err(anyhow::anyhow!("{} relay(s) ended with an error", failures)),
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "Relays did not stop within the grace period");
                Ok(())
            }
        }
    }
}

/// Start against Kafka or the in-process broker, depending on `KAFKA_ENABLED`
pub async fn start(config: &Config) -> Result<Pipeline> {
    if config.kafka.enabled {
        start_kafka(config).await
    } else {
        warn!("KAFKA_ENABLED=false, running against the in-process broker");
        start_in_memory(config, &MemoryBroker::new()).await
    }
}

pub async fn start_kafka(config: &Config) -> Result<Pipeline> {
    info!(brokers = %config.kafka.brokers, "Starting pipeline against Kafka");
    let topology = Topology::from_config(&config.topics);

    let admin = KafkaTopicAdmin::new(&config.kafka)?;
    topology
        .ensure_all(&admin)
        .await
        .context("Failed to provision pipeline topics")?;

    let producer = KafkaTransactionalProducer::new(
        &config.kafka,
        config.kafka.transactional_id("publisher", config.pod_number),
    )
    .await?;
    let publisher: Arc<dyn StagingPublisher> =
        Arc::new(Publisher::for_topology(producer, &topology));

    let shutdown = Arc::new(AtomicBool::new(false));
    let health = RelayHealth::new();
    let mut relays = Vec::new();
    for route in topology.relay_routes() {
        let producer = KafkaTransactionalProducer::new(
            &config.kafka,
            relay_transactional_id(config, &route.source),
        )
        .await?;
        let consumer = KafkaStagingConsumer::new(&config.kafka, &route.source)?;
        let relay = StagingRelay::new(producer, consumer, route.destination, config.relay.clone());
        let handle = spawn_relay(relay, shutdown.clone(), health.clone());
        relays.push((route.source, handle));
    }

    Ok(Pipeline {
        publisher,
        relays,
        shutdown,
        health,
    })
}

/// Start against `broker`; the caller keeps a handle to inspect the topics
pub async fn start_in_memory(config: &Config, broker: &MemoryBroker) -> Result<Pipeline> {
    let topology = Topology::from_config(&config.topics);
    topology
        .ensure_all(broker.admin().as_ref())
        .await
        .context("Failed to provision pipeline topics")?;

    let producer = broker
        .transactional_producer(config.kafka.transactional_id("publisher", config.pod_number));
    let publisher: Arc<dyn StagingPublisher> =
        Arc::new(Publisher::for_topology(producer, &topology));

    let shutdown = Arc::new(AtomicBool::new(false));
    let health = RelayHealth::new();
    let mut relays = Vec::new();
    for route in topology.relay_routes() {
        let producer = broker.transactional_producer(relay_transactional_id(config, &route.source));
        let consumer = broker.consumer(config.kafka.consumer_group.clone(), route.source.clone());
        let relay = StagingRelay::new(producer, consumer, route.destination, config.relay.clone());
        let handle = spawn_relay(relay, shutdown.clone(), health.clone());
        relays.push((route.source, handle));
    }

    Ok(Pipeline {
        publisher,
        relays,
        shutdown,
        health,
    })
}

pub fn relay_transactional_id(config: &Config, source: &str) -> String {
    config
        .kafka
        .transactional_id(&format!("relay-{}", source), config.pod_number)
}

fn spawn_relay<P, C>(
    relay: StagingRelay<P, C>,
    shutdown: Arc<AtomicBool>,
    health: RelayHealth,
) -> JoinHandle<Result<RelayStats>>
where
    C: StagingConsumer + 'static,
    P: TransactionalProducer<GroupMetadata = C::GroupMetadata> + 'static,
{
    let source = relay.source().to_string();
    tokio::spawn(async move {
        let result = relay.run(shutdown).await;
        if let Err(e) = &result {
            error!(source = %source, error = %e, "Relay stopped before shutdown");
            health.mark_stopped();
        }
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transactional_ids_are_distinct_per_role() {
        let config = Config::default();
        let publisher = config.kafka.transactional_id("publisher", config.pod_number);
        let relay_a = relay_transactional_id(&config, "stagingA");
        let relay_b = relay_transactional_id(&config, "stagingB");

        assert_eq!(publisher, "courier-tx-publisher-0");
        assert_eq!(relay_a, "courier-tx-relay-stagingA-0");
        assert_ne!(relay_a, relay_b);
    }

    #[tokio::test]
    async fn test_in_memory_pipeline_starts_and_stops() {
        let broker = MemoryBroker::new();
        let pipeline = start_in_memory(&Config::default(), &broker).await.unwrap();

        assert_eq!(pipeline.relay_count(), 2);
        assert_eq!(broker.partition_count("publicB"), Some(3));
        pipeline.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_fenced_relay_is_reported_before_shutdown() {
        let config = Config::default();
        let broker = MemoryBroker::new();
        let pipeline = start_in_memory(&config, &broker).await.unwrap();
        let health = pipeline.health();
        assert!(health.is_healthy());

        // A second process registers the same relay id
        let _successor = broker.transactional_producer(relay_transactional_id(&config, "stagingA"));
        pipeline
            .publisher
            .publish(&["first".to_string()])
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), health.stopped())
            .await
            .expect("fenced relay was not reported");
        assert_eq!(health.stopped_relays(), 1);
        assert!(broker.payloads("publicA").is_empty());

        let err = pipeline.shutdown(Duration::from_secs(5)).await.unwrap_err();
        assert!(err.to_string().contains("1 relay(s)"));
    }
}
