// Viewer routes. Both transports consume the same `ViewerFeed`; the feed
// task owns admission, replay, and the rebinding guard.

use std::{convert::Infallible, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::HeaderMap,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures_util::Stream;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::debug;

use crate::{
    error::{request_id_from_headers_or_generate, with_request_id_scope, StreamError},
    state::AppState,
    stream::ViewerFeed,
};

pub async fn sse_view(
    State(state): State<AppState>,
    Path(booking_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StreamError> {
    let feed = state.viewers.attach(&booking_id).await?;
    let stream =
        ReceiverStream::new(feed.receiver).map(|payload| Ok(Event::default().data(payload)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn ws_view(
    State(state): State<AppState>,
    Path(booking_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let feed = match state.viewers.attach(&booking_id).await {
        Ok(feed) => feed,
        Err(error) => return error.into_response(),
    };

    let request_id = request_id_from_headers_or_generate(&headers);
    let heartbeat = state.config.heartbeat_interval;
    ws.on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, relay_to_viewer(feed, heartbeat, socket)).await;
    })
}

async fn relay_to_viewer(mut feed: ViewerFeed, heartbeat: Duration, mut socket: WebSocket) {
    let mut heartbeat_interval = tokio::time::interval(heartbeat);
    heartbeat_interval.reset();

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_payload = feed.receiver.recv() => {
                let Some(payload) = maybe_payload else {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                match maybe_message {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!(booking_id = %feed.booking_id, partition = feed.partition, "viewer socket closed");
}
