// Booking directory: who drives a booking and where the ride starts.
//
// Bookings are owned by the dispatch system; the relay only reads them to
// confirm the caller is the assigned driver and to seed the live cache
// with the (already geocoded) pickup point.

use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use sqlx::PgPool;
use tokio::sync::RwLock;
use trackcast_common::location::Coordinate;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookingDetails {
    pub driver_id: i64,
    pub pickup: Coordinate,
}

#[derive(Clone)]
pub enum BookingDirectory {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<String, BookingDetails>>>),
}

impl BookingDirectory {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    pub async fn lookup(&self, booking_id: &str) -> anyhow::Result<Option<BookingDetails>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, (i64, f64, f64)>(
                    r#"
SELECT driver_id, pickup_lat, pickup_lon
FROM bookings
WHERE booking_ref = $1
                    "#,
                )
                .bind(booking_id)
                .fetch_optional(pool)
                .await
                .with_context(|| format!("failed to look up booking `{booking_id}`"))?;

                row.map(|(driver_id, lat, lon)| {
                    let pickup = Coordinate::new(lat, lon)
                        .with_context(|| format!("booking `{booking_id}` has an invalid pickup"))?;
                    Ok(BookingDetails { driver_id, pickup })
                })
                .transpose()
            }
            Self::Memory(bookings) => Ok(bookings.read().await.get(booking_id).copied()),
        }
    }

    /// Registers a booking in the in-memory directory. No-op for Postgres.
    pub async fn insert(&self, booking_id: &str, details: BookingDetails) {
        if let Self::Memory(bookings) = self {
            bookings.write().await.insert(booking_id.to_owned(), details);
        }
    }
}
