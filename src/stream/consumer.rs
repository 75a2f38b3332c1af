use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::record::{Decoded, RawMessage, SkipReason, decode};
use crate::emit;
use crate::error::StreamError;
use crate::metrics::events::{RecordSkipped, Stage, StageCompleted};

/// An open subscription that yields messages one at a time.
#[async_trait]
pub trait LogSource: Send {
    /// Wait for the next message. `None` means the log is exhausted.
    async fn next_message(&mut self) -> Result<Option<RawMessage>, StreamError>;
}

/// Opens subscriptions and commits offsets for one topic and consumer group.
#[async_trait]
pub trait LogConnector: Send + Sync {
    fn topic(&self) -> &str;

    fn group_id(&self) -> &str;

    /// Subscribe under the consumer group. Auto-commit must be off.
    async fn open(&self) -> Result<Box<dyn LogSource>, StreamError>;

    /// Commit the given next-offsets for the consumer group.
    async fn commit(&self, offsets: &OffsetMap) -> Result<(), StreamError>;
}

/// Next offset to read per `(topic, partition)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetMap(BTreeMap<(String, i32), i64>);

impl OffsetMap {
    /// Mark `offset` as consumed.
    pub fn record(&mut self, topic: &str, partition: i32, offset: i64) {
        let next = offset + 1;
        self.0
            .entry((topic.to_string(), partition))
            .and_modify(|current| *current = (*current).max(next))
            .or_insert(next);
    }

    pub fn get(&self, topic: &str, partition: i32) -> Option<i64> {
        self.0.get(&(topic.to_string(), partition)).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i32, i64)> {
        self.0
            .iter()
            .map(|((topic, partition), offset)| (topic.as_str(), *partition, *offset))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A message that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    pub message: RawMessage,
    pub reason: SkipReason,
}

/// Why consumption stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No message arrived within the idle timeout.
    Idle,
    /// The source reported that no more messages exist.
    Exhausted,
    /// The per-batch record cap was reached.
    MaxRecords,
}

/// Everything read during one consumption call.
#[derive(Debug, Clone)]
pub struct ConsumedBatch {
    /// Decoded records in arrival order.
    pub records: Vec<Map<String, Value>>,
    pub skipped: Vec<SkippedRecord>,
    pub offsets: OffsetMap,
    /// Messages received, decoded or not.
    pub received: usize,
    pub stopped: StopReason,
}

impl ConsumedBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Limits for one consumption call.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub idle_timeout: Duration,
    pub max_records: Option<usize>,
    pub required_fields: Vec<String>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            max_records: None,
            required_fields: Vec::new(),
        }
    }
}

/// Pulls a finite batch from a topic under a fixed consumer group.
#[derive(Clone)]
pub struct StreamConsumer {
    connector: Arc<dyn LogConnector>,
    options: ConsumeOptions,
}

impl std::fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "StreamConsumer<{}@{}>",
            self.connector.topic(),
            self.connector.group_id()
        )
    }
}

impl StreamConsumer {
    pub fn new(connector: Arc<dyn LogConnector>, options: ConsumeOptions) -> Self {
        Self { connector, options }
    }

    pub fn topic(&self) -> &str {
        self.connector.topic()
    }

    pub fn group_id(&self) -> &str {
        self.connector.group_id()
    }

    /// Read until the topic is idle for `idle_timeout`, the source is
    /// exhausted, or `max_records` messages have arrived.
    ///
    /// Undecodable messages are logged, counted and returned in
    /// [`ConsumedBatch::skipped`]; they never fail the call. The subscription
    /// is closed before this returns.
    pub async fn consume(&self) -> Result<ConsumedBatch, StreamError> {
        let start = Instant::now();
        let mut source = self.connector.open().await?;

        let mut records = Vec::new();
        let mut skipped = Vec::new();
        let mut offsets = OffsetMap::default();
        let mut received = 0usize;

        let stopped = loop {
            if let Some(max) = self.options.max_records
                && received >= max
            {
                break StopReason::MaxRecords;
            }

            let message =
                match tokio::time::timeout(self.options.idle_timeout, source.next_message()).await
                {
                    Err(_) => break StopReason::Idle,
                    Ok(Ok(None)) => break StopReason::Exhausted,
                    Ok(Ok(Some(message))) => message,
                    Ok(Err(e)) => return Err(e),
                };

            received += 1;
            offsets.record(&message.topic, message.partition, message.offset);

            match decode(&message, &self.options.required_fields) {
                Decoded::Record(record) => records.push(record),
                Decoded::Skipped(reason) => {
                    warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        reason = %reason,
                        "Skipping undecodable record"
                    );
                    emit!(RecordSkipped {
                        reason: reason.as_str(),
                    });
                    skipped.push(SkippedRecord { message, reason });
                }
            }
        };
        drop(source);

        emit!(StageCompleted {
            stage: Stage::Consume,
            duration: start.elapsed(),
        });
        info!(
            topic = self.connector.topic(),
            group = self.connector.group_id(),
            received,
            decoded = records.len(),
            skipped = skipped.len(),
            stopped = ?stopped,
            "Consumed batch"
        );

        Ok(ConsumedBatch {
            records,
            skipped,
            offsets,
            received,
            stopped,
        })
    }

    /// Commit a batch's offsets for the consumer group.
    pub async fn commit(&self, offsets: &OffsetMap) -> Result<(), StreamError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        self.connector.commit(offsets).await?;
        emit!(StageCompleted {
            stage: Stage::Commit,
            duration: start.elapsed(),
        });
        debug!(
            topic = self.connector.topic(),
            partitions = offsets.len(),
            "Committed offsets"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Yields queued messages, then either ends or hangs forever.
    struct QueueSource {
        messages: VecDeque<RawMessage>,
        hang_when_empty: bool,
    }

    #[async_trait]
    impl LogSource for QueueSource {
        async fn next_message(&mut self) -> Result<Option<RawMessage>, StreamError> {
            match self.messages.pop_front() {
                Some(m) => Ok(Some(m)),
                None if self.hang_when_empty => {
                    std::future::pending::<()>().await;
                    Ok(None)
                }
                None => Ok(None),
            }
        }
    }

    struct QueueConnector {
        messages: Vec<RawMessage>,
        hang_when_empty: bool,
        committed: Mutex<Vec<OffsetMap>>,
    }

    #[async_trait]
    impl LogConnector for QueueConnector {
        fn topic(&self) -> &str {
            "trip_search"
        }

        fn group_id(&self) -> &str {
            "test-group"
        }

        async fn open(&self) -> Result<Box<dyn LogSource>, StreamError> {
            Ok(Box::new(QueueSource {
                messages: self.messages.clone().into(),
                hang_when_empty: self.hang_when_empty,
            }))
        }

        async fn commit(&self, offsets: &OffsetMap) -> Result<(), StreamError> {
            self.committed.lock().unwrap().push(offsets.clone());
            Ok(())
        }
    }

    fn message(partition: i32, offset: i64, payload: &str) -> RawMessage {
        RawMessage {
            topic: "trip_search".to_string(),
            partition,
            offset,
            payload: Some(payload.as_bytes().to_vec()),
        }
    }

    fn connector(messages: Vec<RawMessage>, hang_when_empty: bool) -> Arc<QueueConnector> {
        Arc::new(QueueConnector {
            messages,
            hang_when_empty,
            committed: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_idle_timeout() {
        let messages = vec![
            message(0, 0, r#"{"userId": "a"}"#),
            message(1, 4, r#"{"userId": "b"}"#),
        ];
        let consumer = StreamConsumer::new(
            connector(messages, true),
            ConsumeOptions {
                idle_timeout: Duration::from_secs(60),
                ..Default::default()
            },
        );

        let batch = consumer.consume().await.unwrap();
        assert_eq!(batch.stopped, StopReason::Idle);
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.offsets.get("trip_search", 0), Some(1));
        assert_eq!(batch.offsets.get("trip_search", 1), Some(5));
    }

    #[tokio::test]
    async fn test_skips_undecodable_without_aborting() {
        let messages = vec![
            message(0, 0, r#"{"userId": "a"}"#),
            message(0, 1, "not json"),
            message(0, 2, r#"{"userId": "c"}"#),
        ];
        let consumer = StreamConsumer::new(connector(messages, false), ConsumeOptions::default());

        let batch = consumer.consume().await.unwrap();
        assert_eq!(batch.stopped, StopReason::Exhausted);
        assert_eq!(batch.received, 3);
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.skipped.len(), 1);
        assert_eq!(batch.skipped[0].message.offset, 1);
        assert_eq!(batch.offsets.get("trip_search", 0), Some(3));
    }

    #[tokio::test]
    async fn test_max_records_caps_batch() {
        let messages = (0..10)
            .map(|i| message(0, i, r#"{"userId": "a"}"#))
            .collect();
        let consumer = StreamConsumer::new(
            connector(messages, false),
            ConsumeOptions {
                max_records: Some(4),
                ..Default::default()
            },
        );

        let batch = consumer.consume().await.unwrap();
        assert_eq!(batch.stopped, StopReason::MaxRecords);
        assert_eq!(batch.records.len(), 4);
        assert_eq!(batch.offsets.get("trip_search", 0), Some(4));
    }

    #[tokio::test]
    async fn test_commit_skips_empty_offsets() {
        let connector = connector(Vec::new(), false);
        let consumer = StreamConsumer::new(connector.clone(), ConsumeOptions::default());

        consumer.commit(&OffsetMap::default()).await.unwrap();
        assert!(connector.committed.lock().unwrap().is_empty());

        let mut offsets = OffsetMap::default();
        offsets.record("trip_search", 0, 9);
        consumer.commit(&offsets).await.unwrap();
        assert_eq!(connector.committed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_offset_map_keeps_highest() {
        let mut offsets = OffsetMap::default();
        offsets.record("t", 0, 5);
        offsets.record("t", 0, 3);
        assert_eq!(offsets.get("t", 0), Some(6));
        assert_eq!(offsets.iter().collect::<Vec<_>>(), vec![("t", 0, 6)]);
    }
}
