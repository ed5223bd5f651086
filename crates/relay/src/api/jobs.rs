// Operator routes: cron-triggered stale reap, booking index, forced end,
// full reset.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::sessions::StatusResponse;
use crate::{archive::reclaim::BookingIndex, error::StreamError, state::AppState};

#[derive(Debug, Deserialize, Serialize)]
pub struct CheckJobResponse {
    pub status: String,
    /// Partitions the reap pass is inspecting.
    pub partitions: usize,
}

/// Starts one stale-reap pass and returns without waiting for it.
pub async fn check_job(State(state): State<AppState>) -> Result<Json<CheckJobResponse>, StreamError> {
    let pass = state.reclaimer.stale_reap().await?;
    let partitions = pass.partitions;

    tokio::spawn(async move {
        let report = pass.wait().await;
        info!(
            alive = report.alive,
            freed = report.freed,
            archived = report.archived,
            failed = report.failed,
            "stale reap finished"
        );
    });

    Ok(Json(CheckJobResponse { status: "ok".to_string(), partitions }))
}

/// Bookings holding a partition, split by whether viewers can still attach.
pub async fn bookings(State(state): State<AppState>) -> Result<Json<BookingIndex>, StreamError> {
    Ok(Json(state.reclaimer.bookings().await?))
}

pub async fn end_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<String>,
) -> Result<Json<StatusResponse>, StreamError> {
    state.reclaimer.end(&booking_id).await?;
    Ok(Json(StatusResponse::new("ended")))
}

pub async fn reset(State(state): State<AppState>) -> Result<Json<StatusResponse>, StreamError> {
    state.reclaimer.reset().await?;
    Ok(Json(StatusResponse::new("reset")))
}
