use async_stream::stream;
use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use sideline_protocol::{ClientMessage, EngineStatus, MessageAck, ServerMessage};
use tokio::{runtime::Handle, sync::broadcast::error::RecvError};
use tracing::warn;
use uuid::Uuid;

use crate::engine::{ClientAttachment, Coordinator};
use crate::error::HttpError;

use super::HttpState;

const SOURCE: &str = "infra::http::control";

pub(super) async fn post_message(
    State(state): State<HttpState>,
    body: Bytes,
) -> Result<Json<MessageAck>, HttpError> {
    let message: ClientMessage = serde_json::from_slice(&body).map_err(|err| {
        HttpError::from_error(SOURCE, StatusCode::BAD_REQUEST, "Invalid message", &err)
    })?;
    Ok(Json(state.coordinator.handle_message(message).await))
}

pub(super) async fn status(State(state): State<HttpState>) -> Json<EngineStatus> {
    Json(state.coordinator.status().await)
}

/// One open channel is one controlled page. Closing the stream detaches it.
pub(super) async fn channel(State(state): State<HttpState>) -> Response {
    let ClientAttachment {
        id,
        mut notices,
        replay,
    } = state.coordinator.attach_client();
    let guard = ClientGuard {
        id,
        coordinator: state.coordinator.clone(),
    };

    let stream = stream! {
        let _guard = guard;
        if let Some(message) = replay {
            yield notice_event(&message);
        }
        loop {
            match notices.recv().await {
                Ok(message) => yield notice_event(&message),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(client = %id, skipped, "Notice channel lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn notice_event(message: &ServerMessage) -> Result<Event, axum::Error> {
    Event::default()
        .event(message.event_name())
        .json_data(message)
}

struct ClientGuard {
    id: Uuid,
    coordinator: Coordinator,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let id = self.id;
        let coordinator = self.coordinator.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    coordinator.detach_client(id).await;
                });
            }
            Err(_) => warn!(client = %id, "No runtime available to detach client"),
        }
    }
}
