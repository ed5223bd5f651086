// Cold storage for finished rides.
//
// One object per booking, named by the booking id, holding the JSON array
// of every payload the ride published, in publish order.

pub mod reclaim;

use std::{path::Path, sync::Arc};

use anyhow::Context;
use object_store::{
    gcp::GoogleCloudStorageBuilder, local::LocalFileSystem, memory::InMemory,
    path::Path as ObjectPath, ObjectStore, PutPayload,
};
use serde_json::Value;
use tracing::info;

use crate::queue::LogRecord;

pub use reclaim::Reclaimer;

#[derive(Clone)]
pub struct ArchiveStore {
    inner: Arc<dyn ObjectStore>,
}

impl ArchiveStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    pub fn local(root: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("failed to create archive directory {}", root.display()))?;
        let store = LocalFileSystem::new_with_prefix(root)
            .with_context(|| format!("failed to open archive directory {}", root.display()))?;
        info!(path = %root.display(), "using local archive store");
        Ok(Self::new(Arc::new(store)))
    }

    pub fn gcs(bucket: &str) -> anyhow::Result<Self> {
        let store = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .build()
            .with_context(|| format!("failed to create GCS archive store for bucket {bucket}"))?;
        info!(bucket, "using GCS archive store");
        Ok(Self::new(Arc::new(store)))
    }

    /// Writes the archive object for `booking_id`.
    pub async fn put(&self, booking_id: &str, records: &[LogRecord]) -> anyhow::Result<()> {
        let body = serde_json::to_vec(&archive_document(records))
            .context("failed to encode archive document")?;
        self.inner
            .put(&ObjectPath::from(booking_id), PutPayload::from(body))
            .await
            .with_context(|| format!("failed to write archive for booking {booking_id}"))?;
        Ok(())
    }

    /// Reads an archive back, or `None` if nothing was archived.
    pub async fn get(&self, booking_id: &str) -> anyhow::Result<Option<Vec<Value>>> {
        let result = match self.inner.get(&ObjectPath::from(booking_id)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read archive for booking {booking_id}"))
            }
        };
        let bytes = result.bytes().await.context("failed to read archive body")?;
        let payloads = serde_json::from_slice(&bytes).context("archive is not a JSON array")?;
        Ok(Some(payloads))
    }

    /// Removes the archive for `booking_id`. Returns whether one existed.
    pub async fn delete(&self, booking_id: &str) -> anyhow::Result<bool> {
        let path = ObjectPath::from(booking_id);
        match self.inner.head(&path).await {
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => return Ok(false),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to look up archive for booking {booking_id}"))
            }
        }

        match self.inner.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {
                info!(booking_id, "archive deleted");
                Ok(true)
            }
            Err(error) => {
                Err(error).with_context(|| format!("failed to delete archive for booking {booking_id}"))
            }
        }
    }
}

/// Payloads that are JSON are embedded as-is; anything else as a string.
fn archive_document(records: &[LogRecord]) -> Value {
    Value::Array(
        records
            .iter()
            .map(|record| {
                serde_json::from_str(&record.payload)
                    .unwrap_or_else(|_| Value::String(record.payload.clone()))
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::ArchiveStore;
    use crate::queue::LogRecord;

    fn record(offset: i64, payload: &str) -> LogRecord {
        LogRecord { partition: 0, offset, key: "7".to_string(), payload: payload.to_string() }
    }

    #[tokio::test]
    async fn writes_one_array_per_booking() {
        let archive = ArchiveStore::in_memory();
        archive
            .put("B1", &[record(0, r#"{"lat":1.0}"#), record(1, "not json")])
            .await
            .expect("put");

        let payloads = archive.get("B1").await.expect("get").expect("archive exists");
        assert_eq!(payloads, vec![json!({"lat": 1.0}), json!("not json")]);
        assert!(archive.get("B2").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn delete_reports_whether_an_archive_existed() {
        let archive = ArchiveStore::in_memory();
        archive.put("B1", &[record(0, r#"{"lat":1.0}"#)]).await.expect("put");

        assert!(archive.delete("B1").await.expect("delete"));
        assert!(archive.get("B1").await.expect("get").is_none());
        assert!(!archive.delete("B1").await.expect("second delete"));
    }
}
