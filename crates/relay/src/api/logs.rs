// Archived ride tracks.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::sessions::StatusResponse;
use crate::{error::StreamError, state::AppState};

#[derive(Debug, Deserialize, Serialize)]
pub struct ArchivedTrack {
    pub booking_id: String,
    /// Every payload the ride published, in publish order.
    pub coordinates: Vec<Value>,
}

pub async fn view_archive(
    State(state): State<AppState>,
    Path(booking_id): Path<String>,
) -> Result<Json<ArchivedTrack>, StreamError> {
    let coordinates = state
        .archive
        .get(&booking_id)
        .await?
        .ok_or_else(|| StreamError::NotFound(format!("no archive for booking {booking_id}")))?;
    Ok(Json(ArchivedTrack { booking_id, coordinates }))
}

pub async fn delete_archive(
    State(state): State<AppState>,
    Path(booking_id): Path<String>,
) -> Result<Json<StatusResponse>, StreamError> {
    if !state.archive.delete(&booking_id).await? {
        return Err(StreamError::NotFound(format!("no archive for booking {booking_id}")));
    }
    Ok(Json(StatusResponse::new("deleted")))
}
