// HTTP and streaming surface of the relay.
//
// | Route | Auth |
// |---|---|
// | `POST /create` | driver identity |
// | `POST /add` | booking token |
// | `DELETE /end` | booking token, current session |
// | `GET /ws/add` | booking token, current session |
// | `GET /view/{booking_id}` | none |
// | `GET /ws/view/{booking_id}` | none |
// | `PATCH /jobs/check_job` | admin identity |
// | `DELETE /jobs/end/{booking_id}` | admin identity |
// | `DELETE /jobs/reset` | admin identity |
// | `GET /bookings` | admin identity |
// | `GET /logs/view/{booking_id}` | admin identity |
// | `DELETE /logs/delete/{booking_id}` | admin identity |

pub mod jobs;
pub mod logs;
pub mod sessions;
pub mod viewers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, patch, post},
    Router,
};

use crate::{
    auth::middleware::{require_admin, require_booking_token, require_driver},
    state::AppState,
};

pub fn router(state: AppState) -> Router {
    let driver_layer =
        middleware::from_fn_with_state(Arc::clone(&state.identities), require_driver);
    let admin_layer = middleware::from_fn_with_state(Arc::clone(&state.identities), require_admin);
    let ingest_layer = middleware::from_fn_with_state(state.ingest_gate(), require_booking_token);
    let current_session_layer =
        middleware::from_fn_with_state(state.current_session_gate(), require_booking_token);

    let admin = Router::new()
        .route("/jobs/check_job", patch(jobs::check_job))
        .route("/jobs/end/{booking_id}", delete(jobs::end_booking))
        .route("/jobs/reset", delete(jobs::reset))
        .route("/bookings", get(jobs::bookings))
        .route("/logs/view/{booking_id}", get(logs::view_archive))
        .route("/logs/delete/{booking_id}", delete(logs::delete_archive))
        .route_layer(admin_layer);

    Router::new()
        .route("/create", post(sessions::create_session).route_layer(driver_layer))
        .route("/add", post(sessions::add_location).route_layer(ingest_layer))
        .route("/end", delete(sessions::end_session).route_layer(current_session_layer.clone()))
        .route("/ws/add", get(sessions::ws_add).route_layer(current_session_layer))
        .route("/view/{booking_id}", get(viewers::sse_view))
        .route("/ws/view/{booking_id}", get(viewers::ws_view))
        .merge(admin)
        .with_state(state)
}
