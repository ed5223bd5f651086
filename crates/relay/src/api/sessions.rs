// Producer-facing routes: create/renew a booking session, ingest
// locations over HTTP or WebSocket, and end the ride.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Extension, State,
    },
    http::{header::SET_COOKIE, HeaderMap},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use trackcast_common::location::LocationEnvelope;

use crate::{
    auth::middleware::{
        booking_token_cookie, expired_booking_token_cookie, AuthenticatedBooking, DriverIdentity,
    },
    error::{request_id_from_headers_or_generate, with_request_id_scope, StreamError},
    state::AppState,
    validation::{check_ws_frame_size, ValidatedJson, MAX_WS_FRAME_BYTES},
};

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateSessionRequest {
    pub booking_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateSessionResponse {
    pub booking_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AddLocationResponse {
    pub status: String,
    pub offset: i64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn new(status: &str) -> Self {
        Self { status: status.to_owned() }
    }
}

pub async fn create_session(
    State(state): State<AppState>,
    Extension(DriverIdentity(driver_id)): Extension<DriverIdentity>,
    ValidatedJson(payload): ValidatedJson<CreateSessionRequest>,
) -> Result<impl IntoResponse, StreamError> {
    let booking_id = payload.booking_id.trim();
    if booking_id.is_empty() {
        return Err(StreamError::BadRequest("booking_id is required".to_string()));
    }

    let details = state
        .directory
        .lookup(booking_id)
        .await?
        .ok_or_else(|| StreamError::NotFound(format!("booking {booking_id} does not exist")))?;
    if details.driver_id != driver_id {
        return Err(StreamError::Unauthorized(format!(
            "booking {booking_id} is not assigned to driver {driver_id}"
        )));
    }

    end_previous_booking(&state, driver_id, booking_id).await?;

    let grant = state.sessions.create(driver_id, booking_id, details.pickup).await?;
    let cookie = booking_token_cookie(&grant.token.token, grant.expires_in);

    Ok((
        [(SET_COOKIE, cookie)],
        Json(CreateSessionResponse {
            booking_token: grant.token.token,
            expires_in: grant.expires_in,
        }),
    ))
}

/// A driver moving to a new booking ends whatever ride they still hold.
async fn end_previous_booking(
    state: &AppState,
    driver_id: i64,
    booking_id: &str,
) -> Result<(), StreamError> {
    let Some(previous) = state.sessions.driver_record(driver_id).await? else {
        return Ok(());
    };
    if previous.booking_id == booking_id {
        return Ok(());
    }

    match state.reclaimer.end(&previous.booking_id).await {
        Ok(ended) => {
            info!(
                driver_id,
                previous_booking_id = %ended.booking_id,
                booking_id,
                "driver switched bookings, previous session ended"
            );
            Ok(())
        }
        Err(StreamError::NotFound(_)) => Ok(()),
        Err(error) => Err(error),
    }
}

pub async fn add_location(
    State(state): State<AppState>,
    Extension(booking): Extension<AuthenticatedBooking>,
    ValidatedJson(envelope): ValidatedJson<LocationEnvelope>,
) -> Result<Json<AddLocationResponse>, StreamError> {
    let receipt = state.ingest.ingest(&booking.session, envelope.location).await?;
    Ok(Json(AddLocationResponse { status: "added".to_string(), offset: receipt.offset }))
}

pub async fn end_session(
    State(state): State<AppState>,
    Extension(booking): Extension<AuthenticatedBooking>,
) -> Result<impl IntoResponse, StreamError> {
    state.reclaimer.end(&booking.session.booking_id).await?;
    Ok(([(SET_COOKIE, expired_booking_token_cookie())], Json(StatusResponse::new("ended"))))
}

pub async fn ws_add(
    State(state): State<AppState>,
    Extension(booking): Extension<AuthenticatedBooking>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_WS_FRAME_BYTES).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, run_producer(state, booking, socket)).await;
    })
}

async fn run_producer(state: AppState, booking: AuthenticatedBooking, mut socket: WebSocket) {
    let AuthenticatedBooking { claims, session } = booking;
    let mut heartbeat_interval = tokio::time::interval(state.config.heartbeat_interval);
    heartbeat_interval.reset();
    info!(booking_id = %session.booking_id, partition = session.partition, "producer connected");

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                match state.sessions.is_current(&claims).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(booking_id = %session.booking_id, "booking session revoked, closing producer");
                        let _ = socket.send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: "booking session is no longer active".into(),
                        }))).await;
                        break;
                    }
                    Err(error) => warn!(booking_id = %session.booking_id, error = ?error, "session check failed"),
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if let Err(reason) = check_ws_frame_size(raw_message.as_str().as_bytes()) {
                            let _ = socket.send(Message::Close(Some(CloseFrame {
                                code: close_code::SIZE,
                                reason: reason.into(),
                            }))).await;
                            break;
                        }

                        let envelope = match serde_json::from_str::<LocationEnvelope>(raw_message.as_str()) {
                            Ok(envelope) => envelope,
                            Err(error) => {
                                warn!(booking_id = %session.booking_id, error = %error, "skipping malformed location frame");
                                continue;
                            }
                        };

                        match state.ingest.ingest(&session, envelope.location).await {
                            Ok(receipt) => debug!(booking_id = %session.booking_id, offset = receipt.offset, "frame ingested"),
                            Err(StreamError::BadRequest(reason)) => {
                                warn!(booking_id = %session.booking_id, reason = %reason, "skipping invalid location frame");
                            }
                            Err(error) => {
                                error!(booking_id = %session.booking_id, error = ?error, "failed to ingest frame");
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        debug!(booking_id = %session.booking_id, error = %error, "producer socket error");
                        break;
                    }
                }
            }
        }
    }

    info!(booking_id = %session.booking_id, "producer disconnected");
}
