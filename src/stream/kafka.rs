//! Kafka-compatible broker connection.

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer as KafkaConsumer};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use snafu::prelude::*;
use tracing::{debug, info};

use super::consumer::{LogConnector, LogSource, OffsetMap};
use super::record::RawMessage;
use crate::config::BrokerConfig;
use crate::error::{BrokerSnafu, ClientConfigSnafu, CommitTaskSnafu, StreamError, SubscribeSnafu};

const SESSION_TIMEOUT_MS: &str = "30000";
const HEARTBEAT_INTERVAL_MS: &str = "10000";
const SOCKET_TIMEOUT_MS: &str = "40000";

/// Subscribes to one topic under one consumer group.
#[derive(Clone)]
pub struct KafkaConnector {
    topic: String,
    group_id: String,
    broker: BrokerConfig,
}

impl std::fmt::Debug for KafkaConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KafkaConnector<{}@{}>", self.topic, self.group_id)
    }
}

impl KafkaConnector {
    pub fn new(
        topic: impl Into<String>,
        group_id: impl Into<String>,
        broker: BrokerConfig,
    ) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            broker,
        }
    }

    /// Client properties shared by the consuming and committing handles.
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.broker.bootstrap_servers.join(","))
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", SESSION_TIMEOUT_MS)
            .set("heartbeat.interval.ms", HEARTBEAT_INTERVAL_MS)
            .set("socket.timeout.ms", SOCKET_TIMEOUT_MS)
            .set("security.protocol", self.broker.security_protocol());

        if let Some(username) = &self.broker.username {
            config
                .set("sasl.mechanism", &self.broker.sasl_mechanism)
                .set("sasl.username", username)
                .set(
                    "sasl.password",
                    self.broker.password.clone().unwrap_or_default(),
                );
        }

        for (key, value) in &self.broker.options {
            config.set(key, value);
        }

        config
    }

    fn partition_list(&self, offsets: &OffsetMap) -> Result<TopicPartitionList, StreamError> {
        let mut tpl = TopicPartitionList::new();
        for (topic, partition, offset) in offsets.iter() {
            tpl.add_partition_offset(topic, partition, Offset::Offset(offset))
                .map_err(|e| self.commit_error(e.to_string()))?;
        }
        Ok(tpl)
    }

    fn commit_error(&self, message: String) -> StreamError {
        StreamError::Commit {
            topic: self.topic.clone(),
            group: self.group_id.clone(),
            message,
        }
    }
}

#[async_trait]
impl LogConnector for KafkaConnector {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn open(&self) -> Result<Box<dyn LogSource>, StreamError> {
        let consumer: KafkaConsumer = self
            .client_config()
            .create()
            .context(ClientConfigSnafu { topic: &self.topic })?;

        consumer
            .subscribe(&[self.topic.as_str()])
            .context(SubscribeSnafu { topic: &self.topic })?;

        info!(
            topic = %self.topic,
            group = %self.group_id,
            "Subscribed"
        );

        Ok(Box::new(KafkaLogSource {
            consumer,
            topic: self.topic.clone(),
        }))
    }

    async fn commit(&self, offsets: &OffsetMap) -> Result<(), StreamError> {
        let tpl = self.partition_list(offsets)?;
        let config = self.client_config();
        let topic = self.topic.clone();
        let group = self.group_id.clone();

        // Short-lived handle in the same group; commit is a blocking call.
        tokio::task::spawn_blocking(move || -> Result<(), StreamError> {
            let consumer: BaseConsumer = config
                .create()
                .context(ClientConfigSnafu { topic: &topic })?;
            consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| StreamError::Commit {
                    topic,
                    group,
                    message: e.to_string(),
                })
        })
        .await
        .context(CommitTaskSnafu)??;

        debug!(topic = %self.topic, partitions = offsets.len(), "Offsets committed");
        Ok(())
    }
}

/// An open rdkafka subscription. Dropping it leaves the group.
struct KafkaLogSource {
    consumer: KafkaConsumer,
    topic: String,
}

#[async_trait]
impl LogSource for KafkaLogSource {
    async fn next_message(&mut self) -> Result<Option<RawMessage>, StreamError> {
        let message = self
            .consumer
            .recv()
            .await
            .context(BrokerSnafu { topic: &self.topic })?;

        Ok(Some(RawMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn broker(username: Option<&str>) -> BrokerConfig {
        BrokerConfig {
            bootstrap_servers: vec!["broker-1:9092".to_string(), "broker-2:9092".to_string()],
            security_protocol: None,
            sasl_mechanism: "SCRAM-SHA-256".to_string(),
            username: username.map(str::to_string),
            password: username.map(|_| "secret".to_string()),
            options: HashMap::from([("client.id".to_string(), "rivulet".to_string())]),
        }
    }

    #[test]
    fn test_client_config_with_credentials() {
        let connector = KafkaConnector::new(
            "trip_search",
            "airflow-trip-search-consumer-group",
            broker(Some("ingest")),
        );
        let config = connector.client_config();

        assert_eq!(
            config.get("bootstrap.servers"),
            Some("broker-1:9092,broker-2:9092")
        );
        assert_eq!(
            config.get("group.id"),
            Some("airflow-trip-search-consumer-group")
        );
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("sasl.mechanism"), Some("SCRAM-SHA-256"));
        assert_eq!(config.get("sasl.username"), Some("ingest"));
        assert_eq!(config.get("client.id"), Some("rivulet"));
    }

    #[test]
    fn test_client_config_plaintext() {
        let connector = KafkaConnector::new("trip_search", "g", broker(None));
        let config = connector.client_config();
        assert_eq!(config.get("security.protocol"), Some("PLAINTEXT"));
        assert_eq!(config.get("sasl.username"), None);
    }

    #[test]
    fn test_partition_list_uses_next_offsets() {
        let connector = KafkaConnector::new("trip_search", "g", broker(None));
        let mut offsets = OffsetMap::default();
        offsets.record("trip_search", 0, 41);
        offsets.record("trip_search", 2, 7);

        let tpl = connector.partition_list(&offsets).unwrap();
        assert_eq!(tpl.count(), 2);
        assert_eq!(
            tpl.find_partition("trip_search", 0).map(|e| e.offset()),
            Some(Offset::Offset(42))
        );
        assert_eq!(
            tpl.find_partition("trip_search", 2).map(|e| e.offset()),
            Some(Offset::Offset(8))
        );
    }
}
