// Session records persisted in the key-value store.
//
// Records are stored as compact JSON arrays so that every process reading
// the keyspace agrees on the layout:
//
// - booking: `[partition, start_offset, driver_id]` (numbers)
// - driver:  `["session_id", "booking_id", "partition"]` (strings)
// - backup:  `["booking_id", "start_offset"]` (strings)

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record field `{field}` is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Active booking, keyed by booking id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u32, i64, i64)", into = "(u32, i64, i64)")]
pub struct BookingRecord {
    pub partition: u32,
    /// Log offset captured at creation; lower bound of the archive window.
    pub start_offset: i64,
    pub driver_id: i64,
}

impl From<(u32, i64, i64)> for BookingRecord {
    fn from((partition, start_offset, driver_id): (u32, i64, i64)) -> Self {
        Self { partition, start_offset, driver_id }
    }
}

impl From<BookingRecord> for (u32, i64, i64) {
    fn from(record: BookingRecord) -> Self {
        (record.partition, record.start_offset, record.driver_id)
    }
}

/// Current session of a driver, keyed by driver id. The session id is the
/// `sub` claim of the only booking token still accepted for this driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "[String; 3]", into = "[String; 3]")]
pub struct DriverRecord {
    pub session_id: String,
    pub booking_id: String,
    pub partition: u32,
}

impl TryFrom<[String; 3]> for DriverRecord {
    type Error = RecordError;

    fn try_from([session_id, booking_id, partition]: [String; 3]) -> Result<Self, Self::Error> {
        let partition = parse_number("partition", partition)?;
        Ok(Self { session_id, booking_id, partition })
    }
}

impl From<DriverRecord> for [String; 3] {
    fn from(record: DriverRecord) -> Self {
        [record.session_id, record.booking_id, record.partition.to_string()]
    }
}

/// Long-lived shadow of a session's archive window, keyed by partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "[String; 2]", into = "[String; 2]")]
pub struct BackupRecord {
    pub booking_id: String,
    pub start_offset: i64,
}

impl TryFrom<[String; 2]> for BackupRecord {
    type Error = RecordError;

    fn try_from([booking_id, start_offset]: [String; 2]) -> Result<Self, Self::Error> {
        let start_offset = parse_number("start_offset", start_offset)?;
        Ok(Self { booking_id, start_offset })
    }
}

impl From<BackupRecord> for [String; 2] {
    fn from(record: BackupRecord) -> Self {
        [record.booking_id, record.start_offset.to_string()]
    }
}

fn parse_number<T: std::str::FromStr>(field: &'static str, value: String) -> Result<T, RecordError> {
    value.parse().map_err(|_| RecordError::InvalidNumber { field, value })
}

/// Encoding shared by every record type.
pub trait StoredRecord: Serialize + DeserializeOwned + Clone {
    fn encode(&self) -> String {
        // Records are plain arrays of strings and integers.
        serde_json::to_string(self).unwrap_or_default()
    }

    fn decode(raw: &str) -> Result<Self, RecordError> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl StoredRecord for BookingRecord {}
impl StoredRecord for DriverRecord {}
impl StoredRecord for BackupRecord {}
