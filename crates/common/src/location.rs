// Live location updates: the ingest schema, its validation, and the blob
// that is published to the partition log and cached for idle viewers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_HEADING: f64 = 0.0;
pub const DEFAULT_ACCURACY: f64 = -1.0;

/// Progress of a ride as reported by the driver app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RideStatus {
    NotAccepted,
    Accepted,
    #[default]
    OnTheWay,
    PickupPoint,
    PassengerOnBoard,
    Clear,
}

impl RideStatus {
    pub const fn code(self) -> u8 {
        match self {
            Self::NotAccepted => 0,
            Self::Accepted => 1,
            Self::OnTheWay => 2,
            Self::PickupPoint => 3,
            Self::PassengerOnBoard => 4,
            Self::Clear => 5,
        }
    }
}

impl TryFrom<u8> for RideStatus {
    type Error = LocationError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::NotAccepted),
            1 => Ok(Self::Accepted),
            2 => Ok(Self::OnTheWay),
            3 => Ok(Self::PickupPoint),
            4 => Ok(Self::PassengerOnBoard),
            5 => Ok(Self::Clear),
            other => Err(LocationError::InvalidStatus(i64::from(other))),
        }
    }
}

impl From<RideStatus> for u8 {
    fn from(status: RideStatus) -> Self {
        status.code()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocationError {
    #[error("`{0}` is required")]
    Missing(&'static str),
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("`{0}` must be a finite number")]
    NotFinite(&'static str),
    #[error("status {0} is not a known ride status")]
    InvalidStatus(i64),
}

/// A validated WGS84 point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Result<Self, LocationError> {
        if !lat.is_finite() {
            return Err(LocationError::NotFinite("lat"));
        }
        if !lon.is_finite() {
            return Err(LocationError::NotFinite("lon"));
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(LocationError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(LocationError::LongitudeOutOfRange(lon));
        }

        Ok(Self { lat, lon })
    }
}

/// Body of an ingest call: `{"location": {...}}`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LocationEnvelope {
    pub location: LocationUpdate,
}

/// A location update exactly as the producer sent it. Every field is
/// optional at the decoding layer so that a missing coordinate surfaces as
/// a [`LocationError`] instead of an opaque deserialization failure.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct LocationUpdate {
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub status: Option<i64>,
}

impl LocationUpdate {
    /// Validates the update and fills defaults for the optional fields.
    pub fn into_blob(self, timestamp: i64) -> Result<LocationBlob, LocationError> {
        let lat = self.lat.ok_or(LocationError::Missing("lat"))?;
        let lon = self.lon.ok_or(LocationError::Missing("lon"))?;
        let coordinate = Coordinate::new(lat, lon)?;

        let heading = finite_or_default(self.heading, "heading", DEFAULT_HEADING)?;
        let accuracy = finite_or_default(self.accuracy, "accuracy", DEFAULT_ACCURACY)?;
        let status = match self.status {
            None => RideStatus::default(),
            Some(code) => u8::try_from(code)
                .map_err(|_| LocationError::InvalidStatus(code))
                .and_then(RideStatus::try_from)?,
        };

        Ok(LocationBlob {
            lat: coordinate.lat,
            lon: coordinate.lon,
            heading,
            accuracy,
            status,
            timestamp,
        })
    }
}

fn finite_or_default(
    value: Option<f64>,
    field: &'static str,
    default: f64,
) -> Result<f64, LocationError> {
    match value {
        None => Ok(default),
        Some(value) if value.is_finite() => Ok(value),
        Some(_) => Err(LocationError::NotFinite(field)),
    }
}

/// The normalized location payload carried by the log and the live cache.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationBlob {
    pub lat: f64,
    pub lon: f64,
    pub heading: f64,
    pub accuracy: f64,
    pub status: RideStatus,
    /// Unix seconds at which the server accepted the update.
    pub timestamp: i64,
}

impl LocationBlob {
    /// Blob used to seed the live cache before the first real update.
    pub fn seed(coordinate: Coordinate, timestamp: i64) -> Self {
        Self {
            lat: coordinate.lat,
            lon: coordinate.lon,
            heading: DEFAULT_HEADING,
            accuracy: DEFAULT_ACCURACY,
            status: RideStatus::default(),
            timestamp,
        }
    }
}
