//! HTTP/JSON surface of the dispatcher
//!
//! Push payloads travel base64-encoded. A draining gateway answers 503 so the
//! caller can retry against another instance.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::{Filter, Rejection, Reply};

use crate::core::bucket::DeliveryReport;
use crate::dispatcher::Dispatcher;
use crate::error::{CometError, Result};

const MAX_BODY_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct PushKeysRequest {
    pub keys: Vec<String>,
    /// Base64 payload
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct PushRoomRequest {
    pub room: String,
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct PushAllRequest {
    pub payload: String,
}

#[derive(Debug, Serialize)]
pub struct PushResponse {
    pub attempted: usize,
    pub failed: usize,
    pub delivered: usize,
}

impl From<DeliveryReport> for PushResponse {
    fn from(report: DeliveryReport) -> Self {
        Self {
            attempted: report.attempted,
            failed: report.failed,
            delivered: report.delivered(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    retryable: bool,
}

/// Every dispatcher route
pub fn routes(
    dispatcher: Dispatcher,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let push_keys = warp::path!("push" / "keys")
        .and(warp::post())
        .and(json_body::<PushKeysRequest>())
        .and(with_dispatcher(dispatcher.clone()))
        .and_then(handle_push_keys);

    let push_room = warp::path!("push" / "room")
        .and(warp::post())
        .and(json_body::<PushRoomRequest>())
        .and(with_dispatcher(dispatcher.clone()))
        .and_then(handle_push_room);

    let push_all = warp::path!("push" / "all")
        .and(warp::post())
        .and(json_body::<PushAllRequest>())
        .and(with_dispatcher(dispatcher.clone()))
        .and_then(handle_push_all);

    let rooms = warp::path!("rooms")
        .and(warp::get())
        .and(with_dispatcher(dispatcher.clone()))
        .map(|dispatcher: Dispatcher| respond(dispatcher.rooms()));

    // Room ids may contain slashes, so the rest of the path is the room
    let room_members = warp::path("rooms")
        .and(warp::path::tail())
        .and(warp::get())
        .and(with_dispatcher(dispatcher.clone()))
        .map(|tail: warp::path::Tail, dispatcher: Dispatcher| {
            respond(dispatcher.room_membership(tail.as_str()))
        });

    let connection_room = warp::path!("connections" / String / "room")
        .and(warp::get())
        .and(with_dispatcher(dispatcher.clone()))
        .map(|key: String, dispatcher: Dispatcher| {
            respond(
                dispatcher
                    .connection_room(&key)
                    .map(|room| serde_json::json!({ "key": key, "room": room })),
            )
        });

    let stats = warp::path!("stats")
        .and(warp::get())
        .and(with_dispatcher(dispatcher.clone()))
        .map(|dispatcher: Dispatcher| respond(dispatcher.stats()));

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_dispatcher(dispatcher))
        .map(|dispatcher: Dispatcher| {
            let (label, status) = if dispatcher.registry().is_draining() {
                ("draining", StatusCode::SERVICE_UNAVAILABLE)
            } else {
                ("ok", StatusCode::OK)
            };
            warp::reply::with_status(
                warp::reply::json(&serde_json::json!({
                    "status": label,
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                })),
                status,
            )
        });

    push_keys
        .or(push_room)
        .or(push_all)
        .or(rooms)
        .or(room_members)
        .or(connection_room)
        .or(stats)
        .or(health)
}

fn with_dispatcher(
    dispatcher: Dispatcher,
) -> impl Filter<Extract = (Dispatcher,), Error = Infallible> + Clone {
    warp::any().map(move || dispatcher.clone())
}

fn json_body<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: for<'de> Deserialize<'de> + Send,
{
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

fn decode_payload(payload: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(payload.trim())
        .map_err(|e| CometError::Protocol(format!("payload is not valid base64: {}", e)))
}

async fn handle_push_keys(
    request: PushKeysRequest,
    dispatcher: Dispatcher,
) -> std::result::Result<WithStatus<Json>, Infallible> {
    let result = decode_payload(&request.payload)
        .and_then(|payload| dispatcher.push_keys(&request.keys, payload))
        .map(PushResponse::from);
    Ok(respond(result))
}

async fn handle_push_room(
    request: PushRoomRequest,
    dispatcher: Dispatcher,
) -> std::result::Result<WithStatus<Json>, Infallible> {
    let result = match decode_payload(&request.payload) {
        Ok(payload) => dispatcher
            .push_room(&request.room, payload)
            .await
            .map(PushResponse::from),
        Err(e) => Err(e),
    };
    Ok(respond(result))
}

async fn handle_push_all(
    request: PushAllRequest,
    dispatcher: Dispatcher,
) -> std::result::Result<WithStatus<Json>, Infallible> {
    let result = match decode_payload(&request.payload) {
        Ok(payload) => dispatcher.push_all(payload).await.map(PushResponse::from),
        Err(e) => Err(e),
    };
    Ok(respond(result))
}

fn respond<T: Serialize>(result: Result<T>) -> WithStatus<Json> {
    match result {
        Ok(body) => warp::reply::with_status(warp::reply::json(&body), StatusCode::OK),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
                error!("RPC request failed: {}", e);
            } else {
                debug!("RPC request rejected: {}", e);
            }
            warp::reply::with_status(
                warp::reply::json(&ErrorResponse {
                    error: e.to_string(),
                    retryable: e.is_retryable(),
                }),
                status,
            )
        }
    }
}

fn status_for(err: &CometError) -> StatusCode {
    match err {
        CometError::Draining => StatusCode::SERVICE_UNAVAILABLE,
        CometError::NotFound(_) => StatusCode::NOT_FOUND,
        CometError::Frame(_) | CometError::Protocol(_) | CometError::Serialization(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&CometError::Draining), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(&CometError::NotFound("k".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&CometError::Protocol("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&FrameError::Oversized { declared: 5016, max: 4112 }.into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&CometError::Lock("poisoned".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(decode_payload("aGVsbG8=").unwrap(), b"hello");
        assert!(matches!(decode_payload("@@@"), Err(CometError::Protocol(_))));
    }
}
