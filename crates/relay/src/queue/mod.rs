// Partitioned message log.
//
// One shared topic with a fixed number of partitions. Each ride session
// owns one partition for its lifetime; offsets within a partition are
// dense and start at zero.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::MemoryPartitionLog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub partition: u32,
    pub offset: i64,
    /// Producer key. Informational only; routing is by partition.
    pub key: String,
    pub payload: String,
}

#[async_trait]
pub trait PartitionLog: Send + Sync {
    fn partition_count(&self) -> u32;

    /// Appends to `partition` and returns the offset the record received.
    async fn produce(&self, partition: u32, key: &str, payload: String) -> anyhow::Result<i64>;

    /// Offset the next produced record will receive.
    async fn high_watermark(&self, partition: u32) -> anyhow::Result<i64>;

    /// Records with offsets in `[start, end)`, in offset order.
    async fn read_range(&self, partition: u32, start: i64, end: i64)
        -> anyhow::Result<Vec<LogRecord>>;

    /// Reader positioned at the current tail of `partition`.
    async fn subscribe_tail(&self, partition: u32) -> anyhow::Result<Box<dyn PartitionReader>>;
}

#[async_trait]
pub trait PartitionReader: Send {
    /// Waits for the next record after the reader's position.
    ///
    /// Callers bound the wait with `tokio::time::timeout`; dropping the
    /// future does not advance the reader.
    async fn next(&mut self) -> anyhow::Result<LogRecord>;
}
