// ============================================================================
// Topic Topology
// ============================================================================
//
// Four topics: two staging topics written by the publisher, two public topics
// written by the relays. All of them are created idempotently at startup;
// failing to provision any of them is a fatal startup error.
//
// ============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::RDKafkaErrorCode;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use super::config::create_client_config;
use super::error::{BrokerError, BrokerResult};
use super::TopicAdmin;
use courier_config::{KafkaConfig, TopicsConfig};

/// Provisioning parameters for one topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>, partitions: i32, replication_factor: i32) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }
}

/// Result of `ensure_topic`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicStatus {
    Created,
    AlreadyExists,
}

/// Startup failure while provisioning topics
#[derive(Error, Debug)]
#[error("Failed to ensure topic '{topic}': {source}")]
pub struct TopologyError {
    pub topic: String,
    #[source]
    pub source: BrokerError,
}

/// The staging -> public pairing handled by one relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRoute {
    pub source: String,
    pub destination: String,
}

/// Static declaration of the pipeline topics
#[derive(Debug, Clone)]
pub struct Topology {
    pub staging_a: TopicSpec,
    pub staging_b: TopicSpec,
    pub public_a: TopicSpec,
    pub public_b: TopicSpec,
}

impl Topology {
    pub fn from_config(config: &TopicsConfig) -> Self {
        let spec = |name: &str| TopicSpec::new(name, config.partitions, config.replication_factor);
        Self {
            staging_a: spec(&config.staging_a),
            staging_b: spec(&config.staging_b),
            public_a: spec(&config.public_a),
            public_b: spec(&config.public_b),
        }
    }

    pub fn all(&self) -> [&TopicSpec; 4] {
        [&self.staging_a, &self.staging_b, &self.public_a, &self.public_b]
    }

    /// stagingA -> publicA, stagingB -> publicB
    pub fn relay_routes(&self) -> [RelayRoute; 2] {
        [
            RelayRoute {
                source: self.staging_a.name.clone(),
                destination: self.public_a.name.clone(),
            },
            RelayRoute {
                source: self.staging_b.name.clone(),
                destination: self.public_b.name.clone(),
            },
        ]
    }

    /// Ensure every topic exists, in declaration order. Stops at the first failure.
    pub async fn ensure_all<A: TopicAdmin + ?Sized>(
        &self,
        admin: &A,
    ) -> Result<Vec<(String, TopicStatus)>, TopologyError> {
        let mut statuses = Vec::with_capacity(4);
        for spec in self.all() {
            let status = ensure_topic(admin, spec).await?;
            statuses.push((spec.name.clone(), status));
        }
        Ok(statuses)
    }
}

/// Create `spec` if absent. Idempotent.
pub async fn ensure_topic<A: TopicAdmin + ?Sized>(
    admin: &A,
    spec: &TopicSpec,
) -> Result<TopicStatus, TopologyError> {
    let status = admin
        .create_topic(spec)
        .await
        .map_err(|source| TopologyError {
            topic: spec.name.clone(),
            source,
        })?;

    match status {
        TopicStatus::Created => info!(
            topic = %spec.name,
            partitions = spec.partitions,
            replication_factor = spec.replication_factor,
            "Topic created"
        ),
        TopicStatus::AlreadyExists => info!(topic = %spec.name, "Topic already exists"),
    }

    Ok(status)
}

/// Topic admin backed by librdkafka's AdminClient
pub struct KafkaTopicAdmin {
    admin: AdminClient<DefaultClientContext>,
    operation_timeout: Duration,
}

impl KafkaTopicAdmin {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let admin = create_client_config(config)?
            .create()
            .context("Failed to create Kafka admin client")?;

        Ok(Self {
            admin,
            operation_timeout: Duration::from_millis(config.transaction_op_timeout_ms),
        })
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    async fn create_topic(&self, spec: &TopicSpec) -> BrokerResult<TopicStatus> {
        let new_topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication_factor),
        );
        let options = AdminOptions::new().operation_timeout(Some(self.operation_timeout));

        let results = self.admin.create_topics(&[new_topic], &options).await?;

        match results.into_iter().next() {
            Some(Ok(_)) => Ok(TopicStatus::Created),
            Some(Err((_, RDKafkaErrorCode::TopicAlreadyExists))) => Ok(TopicStatus::AlreadyExists),
            Some(Err((topic, code))) => Err(BrokerError::Unavailable(format!(
                "create_topics for '{}' failed: {}",
                topic, code
            ))),
            None => Err(BrokerError::Unavailable(format!(
                "create_topics returned no result for '{}'",
                spec.name
            ))),
        }
    }
}
