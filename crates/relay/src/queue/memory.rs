use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::sync::{watch, RwLock};

use super::{LogRecord, PartitionLog, PartitionReader};

struct Partition {
    id: u32,
    records: RwLock<Vec<LogRecord>>,
    high_watermark: watch::Sender<i64>,
}

impl Partition {
    fn new(id: u32) -> Self {
        Self { id, records: RwLock::new(Vec::new()), high_watermark: watch::Sender::new(0) }
    }
}

/// In-process partition log.
pub struct MemoryPartitionLog {
    partitions: Vec<Arc<Partition>>,
}

impl MemoryPartitionLog {
    pub fn new(partition_count: u32) -> Self {
        Self { partitions: (0..partition_count).map(|id| Arc::new(Partition::new(id))).collect() }
    }

    fn partition(&self, partition: u32) -> anyhow::Result<&Arc<Partition>> {
        self.partitions
            .get(partition as usize)
            .ok_or_else(|| anyhow!("partition {partition} does not exist"))
    }
}

#[async_trait]
impl PartitionLog for MemoryPartitionLog {
    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn produce(&self, partition: u32, key: &str, payload: String) -> anyhow::Result<i64> {
        let target = self.partition(partition)?;
        let mut records = target.records.write().await;
        let offset = i64::try_from(records.len()).context("partition offset overflow")?;
        records.push(LogRecord { partition, offset, key: key.to_owned(), payload });
        target.high_watermark.send_replace(offset + 1);
        Ok(offset)
    }

    async fn high_watermark(&self, partition: u32) -> anyhow::Result<i64> {
        Ok(*self.partition(partition)?.high_watermark.borrow())
    }

    async fn read_range(
        &self,
        partition: u32,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Vec<LogRecord>> {
        let records = self.partition(partition)?.records.read().await;
        let start = usize::try_from(start.max(0)).unwrap_or(0).min(records.len());
        let end = usize::try_from(end.max(0)).unwrap_or(0).min(records.len());
        Ok(records.get(start..end).map(<[LogRecord]>::to_vec).unwrap_or_default())
    }

    async fn subscribe_tail(&self, partition: u32) -> anyhow::Result<Box<dyn PartitionReader>> {
        let target = Arc::clone(self.partition(partition)?);
        let mut watermark = target.high_watermark.subscribe();
        let position = *watermark.borrow_and_update();
        Ok(Box::new(MemoryReader { partition: target, position, watermark }))
    }
}

struct MemoryReader {
    partition: Arc<Partition>,
    position: i64,
    watermark: watch::Receiver<i64>,
}

#[async_trait]
impl PartitionReader for MemoryReader {
    async fn next(&mut self) -> anyhow::Result<LogRecord> {
        loop {
            let high_watermark = *self.watermark.borrow_and_update();
            if self.position < high_watermark {
                let records = self.partition.records.read().await;
                let index = usize::try_from(self.position).context("negative reader position")?;
                let record = records
                    .get(index)
                    .cloned()
                    .ok_or_else(|| anyhow!("partition {} lost offset {}", self.partition.id, index))?;
                self.position += 1;
                return Ok(record);
            }
            self.watermark
                .changed()
                .await
                .with_context(|| format!("partition {} closed", self.partition.id))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::MemoryPartitionLog;
    use crate::queue::PartitionLog;

    #[tokio::test]
    async fn offsets_are_dense_per_partition() {
        let log = MemoryPartitionLog::new(2);
        assert_eq!(log.produce(0, "7", "a".into()).await.expect("produce"), 0);
        assert_eq!(log.produce(0, "7", "b".into()).await.expect("produce"), 1);
        assert_eq!(log.produce(1, "9", "c".into()).await.expect("produce"), 0);

        assert_eq!(log.high_watermark(0).await.expect("hwm"), 2);
        assert_eq!(log.high_watermark(1).await.expect("hwm"), 1);
    }

    #[tokio::test]
    async fn read_range_is_half_open_and_clamped() {
        let log = MemoryPartitionLog::new(1);
        for payload in ["a", "b", "c"] {
            log.produce(0, "7", payload.into()).await.expect("produce");
        }

        let payloads: Vec<_> = log
            .read_range(0, 1, 3)
            .await
            .expect("read")
            .into_iter()
            .map(|record| record.payload)
            .collect();
        assert_eq!(payloads, vec!["b", "c"]);
        assert!(log.read_range(0, 3, 10).await.expect("read").is_empty());
        assert!(log.read_range(0, 2, 1).await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn unknown_partition_is_an_error() {
        let log = MemoryPartitionLog::new(1);
        assert!(log.produce(1, "7", "a".into()).await.is_err());
        assert!(log.high_watermark(4).await.is_err());
    }

    #[tokio::test]
    async fn tail_reader_skips_history_and_waits_for_new_records() {
        let log = MemoryPartitionLog::new(1);
        log.produce(0, "7", "old".into()).await.expect("produce");

        let mut reader = log.subscribe_tail(0).await.expect("subscribe");
        let idle = tokio::time::timeout(Duration::from_millis(20), reader.next()).await;
        assert!(idle.is_err());

        log.produce(0, "7", "new".into()).await.expect("produce");
        let record = reader.next().await.expect("next");
        assert_eq!(record.payload, "new");
        assert_eq!(record.offset, 1);
    }
}
