//! Bounded consumption from a partitioned log.
//!
//! A [`StreamConsumer`] reads until the topic has been idle for the configured
//! timeout, decodes each payload on its own, and returns a finite
//! [`ConsumedBatch`]. Offsets are not committed while consuming; the run
//! commits them once the batch has been handled.

mod consumer;
mod kafka;
mod record;

pub use consumer::{
    ConsumeOptions, ConsumedBatch, LogConnector, LogSource, OffsetMap, SkippedRecord,
    StopReason, StreamConsumer,
};
pub use kafka::KafkaConnector;
pub use record::{Decoded, RawMessage, SkipReason, decode};
