use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{header, HeaderMap, Method},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use courier_shared::constants::USER_ID_HEADER;
use courier_shared::protocol::{ClientFrame, SendRequest, ServerFrame};
use courier_shared::{MessageId, RefType, TargetKind, UserId};
use courier_store::{Conversation, Message};

use crate::config::ServerConfig;
use crate::connections::{ConnectionHandle, ConnectionRegistry};
use crate::content_store::ContentStore;
use crate::db::SharedDb;
use crate::error::ServerError;
use crate::router::{DeliveryReport, DeliveryRouter, DeliveryStatus};

const DEFAULT_HISTORY_LIMIT: u32 = 50;
const MAX_HISTORY_LIMIT: u32 = 200;

#[derive(Clone)]
pub struct AppState {
    pub db: SharedDb,
    pub content: Arc<ContentStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<DeliveryRouter>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    // Multipart framing on top of the largest accepted file.
    let body_limit = state.config.max_blob_size.saturating_add(64 * 1024);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .route("/messages", post(send_message))
        .route("/messages/:kind/:target", get(message_history))
        .route("/conversations", get(list_conversations))
        .route("/conversations/:kind/:target/read", post(mark_read))
        .route("/files", post(upload_file))
        .route("/files/:hash", get(download_file))
        .route("/files/references/:id", delete(remove_reference))
        .route("/users/me/avatar", put(set_avatar))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The caller's identity, as stamped by the upstream gateway.
fn authenticated(headers: &HeaderMap) -> Result<UserId, ServerError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(UserId)
        .ok_or(ServerError::Unauthorized)
}

fn parse_kind(raw: &str) -> Result<TargetKind, ServerError> {
    Ok(TargetKind::from_str(raw)?)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connections: usize,
    online_users: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.registry.connection_count().await,
        online_users: state.registry.online_users().await.len(),
    })
}

// ─── Messages ───

async fn send_message(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> Result<Json<DeliveryReport>, ServerError> {
    let user = authenticated(&headers)?;
    let report = state.router.send(user, request).await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct HistoryParams {
    before: Option<i64>,
    limit: Option<u32>,
}

async fn message_history(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((kind, target)): Path<(String, i64)>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let user = authenticated(&headers)?;
    let kind = parse_kind(&kind)?;
    let before = params.before.map(MessageId);
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let messages = state
        .db
        .call(move |db| db.message_history(user, kind, target, before, limit))
        .await?;
    Ok(Json(messages))
}

async fn list_conversations(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<Conversation>>, ServerError> {
    let user = authenticated(&headers)?;
    let conversations = state.db.call(move |db| db.list_conversations(user)).await?;
    Ok(Json(conversations))
}

async fn mark_read(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((kind, target)): Path<(String, i64)>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user = authenticated(&headers)?;
    let kind = parse_kind(&kind)?;
    let updated = state
        .db
        .call(move |db| db.mark_read(user, kind, target))
        .await?;
    if !updated {
        return Err(ServerError::NotFound("Conversation not found".into()));
    }
    Ok(Json(serde_json::json!({ "updated": true })))
}

// ─── Files ───

#[derive(Serialize)]
struct UploadResponse {
    hash: String,
    file_name: String,
    file_size: i64,
    mime_type: String,
    deduplicated: bool,
    reference_id: Option<i64>,
}

/// Multipart upload. Field `file` carries the bytes; the optional `ref_type`
/// and `ref_id` fields attach a reference in the same request. A chat
/// reference must name a message the caller sent.
async fn upload_file(
    headers: HeaderMap,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ServerError> {
    let user = authenticated(&headers)?;

    let mut upload = None;
    let mut ref_type = None;
    let mut ref_id = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("").to_string();
                let mime = field.content_type().unwrap_or("").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;
                upload = Some((data, file_name, mime));
            }
            "ref_type" => ref_type = Some(RefType::from_str(text_field(field).await?.trim())?),
            "ref_id" => {
                let raw = text_field(field).await?;
                ref_id = Some(raw.trim().parse::<i64>().map_err(|_| {
                    ServerError::BadRequest(format!("Invalid ref_id: {raw}"))
                })?);
            }
            _ => {}
        }
    }

    let (data, file_name, mime) = upload.ok_or_else(|| {
        ServerError::BadRequest("Missing 'file' field in multipart form".to_string())
    })?;

    match (ref_type, ref_id) {
        (None, None) | (Some(RefType::Avatar), _) => {}
        (Some(_), Some(id)) => require_own_message(&state, user, id).await?,
        (None, Some(_)) | (Some(_), None) => {
            return Err(ServerError::BadRequest(
                "ref_type and ref_id must be given together".to_string(),
            ));
        }
    }

    let stored = state.content.put(&data, &file_name, &mime).await?;
    let file = stored.file;

    let reference_id = match (ref_type, ref_id) {
        (Some(RefType::Avatar), _) => Some(state.content.set_avatar(user, &file.hash).await?),
        (Some(kind), Some(id)) => Some(state.content.add_reference(&file.hash, user, kind, id).await?),
        _ => None,
    };

    info!(
        user = %user,
        hash = %file.hash,
        size = file.file_size,
        deduplicated = stored.deduplicated,
        "File uploaded via API"
    );

    Ok(Json(UploadResponse {
        hash: file.hash,
        file_name: file.file_name,
        file_size: file.file_size,
        mime_type: file.mime_type,
        deduplicated: stored.deduplicated,
        reference_id,
    }))
}

/// Chat references may only point at messages the caller sent. Other
/// users' messages are indistinguishable from missing ones.
async fn require_own_message(state: &AppState, user: UserId, ref_id: i64) -> Result<(), ServerError> {
    let message = state.db.call(move |db| db.get_message(MessageId(ref_id))).await?;
    if message.from_user_id != user {
        return Err(ServerError::NotFound("Record not found".into()));
    }
    Ok(())
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ServerError> {
    field
        .text()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))
}

async fn download_file(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Response, ServerError> {
    authenticated(&headers)?;
    let (file, data) = state.content.open(&hash).await?;
    Ok((
        [
            (header::CONTENT_TYPE, file.mime_type),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", file.file_name.replace('"', "")),
            ),
        ],
        data,
    )
        .into_response())
}

async fn remove_reference(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user = authenticated(&headers)?;
    let reference = state.db.call(move |db| db.get_reference(id)).await?;
    // Other users' references are indistinguishable from missing ones.
    if reference.user_id != user {
        return Err(ServerError::NotFound("Record not found".into()));
    }
    let removed = state.content.remove_reference(id).await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

#[derive(Deserialize)]
struct AvatarRequest {
    hash: String,
}

async fn set_avatar(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AvatarRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user = authenticated(&headers)?;
    let reference_id = state.content.set_avatar(user, &req.hash).await?;
    info!(user = %user, hash = %req.hash, "Avatar updated");
    Ok(Json(serde_json::json!({ "reference_id": reference_id })))
}

// ─── WebSocket ───

#[derive(Deserialize)]
struct WsParams {
    user_id: Option<i64>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Result<Response, ServerError> {
    let user = match params.user_id {
        Some(id) => UserId(id),
        None => authenticated(&headers)?,
    };
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, user, state)))
}

async fn handle_socket(socket: WebSocket, user: UserId, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (handle, mut queue) = ConnectionHandle::channel(state.config.outbound_queue);
    let conn = state.registry.register(user, handle.clone()).await;

    let writer = tokio::spawn(async move {
        while let Some(frame) = queue.next().await {
            if sink.send(WsMessage::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(incoming) = stream.next().await {
        let incoming = match incoming {
            Ok(m) => m,
            Err(e) => {
                debug!(conn = %conn, error = %e, "WebSocket read failed");
                break;
            }
        };
        state.registry.touch(conn).await;

        match incoming {
            WsMessage::Text(text) => {
                let reply = handle_client_frame(&state, user, &text).await;
                let encoded = match reply.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(conn = %conn, error = %e, "Failed to encode reply");
                        continue;
                    }
                };
                if let Err(e) = handle.write(encoded.into(), state.config.push_timeout).await {
                    debug!(conn = %conn, error = %e, "Reply not written, closing");
                    break;
                }
            }
            WsMessage::Close(_) => break,
            // Protocol pings are answered by axum; binary frames are not part
            // of the protocol.
            _ => {}
        }

        if writer.is_finished() {
            break;
        }
    }

    state.registry.unregister(conn).await;
    let _ = writer.await;
}

/// Answer one text frame from a client.
async fn handle_client_frame(state: &AppState, user: UserId, text: &str) -> ServerFrame {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            return ServerFrame::Error {
                error: format!("Malformed frame: {e}"),
            }
        }
    };

    match frame {
        ClientFrame::Ping => ServerFrame::Pong,
        ClientFrame::Send(request) => match state.router.send(user, request).await {
            Ok(report) => ServerFrame::Ack {
                id: report.message.id,
                delivered: report.status == DeliveryStatus::Delivered,
                offline_recipients: report.offline_recipients.len(),
            },
            Err(e) => {
                let (status, error) = e.status_and_message();
                if status.is_server_error() {
                    warn!(user = %user, error = %e, "Send over WebSocket failed");
                }
                ServerFrame::Error { error }
            }
        },
    }
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::blob_store::BlobStore;
    use crate::connections::OutboundQueue;
    use courier_shared::GroupId;

    const BOUNDARY: &str = "courier-test-boundary";

    async fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            database_path: dir.path().join("api.db"),
            blob_storage_path: dir.path().join("blobs"),
            ..ServerConfig::default()
        };
        let db = SharedDb::open(&config.database_path).await.unwrap();
        let blobs = BlobStore::new(config.blob_storage_path.clone(), config.max_blob_size)
            .await
            .unwrap();
        let content = Arc::new(ContentStore::new(db.clone(), blobs));
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(DeliveryRouter::new(
            db.clone(),
            registry.clone(),
            config.push_timeout,
        ));
        let state = AppState {
            db,
            content,
            registry,
            router,
            config: Arc::new(config),
        };
        (state, dir)
    }

    fn request(method: Method, uri: &str, user: Option<i64>) -> axum::http::request::Builder {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user.to_string());
        }
        builder
    }

    fn json_request(method: Method, uri: &str, user: i64, body: serde_json::Value) -> Request<Body> {
        request(method, uri, Some(user))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart_request(user: i64, data: &[u8], extra: &[(&str, &str)]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, value) in extra {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"pic.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        request(Method::POST, "/files", Some(user))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn call(state: &AppState, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = build_router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn call_json(state: &AppState, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let (status, body) = call(state, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _dir) = test_state().await;
        let (status, body) =
            call_json(&state, request(Method::GET, "/health", None).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_requires_identity() {
        let (state, _dir) = test_state().await;
        let req = request(Method::GET, "/conversations", None)
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&state, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_send_then_read_conversation() {
        let (state, _dir) = test_state().await;
        let body = serde_json::json!({ "to_user_id": 2, "content": "hey" });
        let (status, report) =
            call_json(&state, json_request(Method::POST, "/messages", 1, body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["status"], "partially_delivered");
        assert_eq!(report["message"]["content"], "hey");

        let list = request(Method::GET, "/conversations", Some(2))
            .body(Body::empty())
            .unwrap();
        let (_, convs) = call_json(&state, list).await;
        assert_eq!(convs[0]["unread_count"], 1);
        assert_eq!(convs[0]["target_id"], 1);

        let read = request(Method::POST, "/conversations/private/1/read", Some(2))
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&state, read).await;
        assert_eq!(status, StatusCode::OK);

        let history = request(Method::GET, "/messages/private/1?limit=10", Some(2))
            .body(Body::empty())
            .unwrap();
        let (_, messages) = call_json(&state, history).await;
        assert_eq!(messages.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_send_is_unprocessable() {
        let (state, _dir) = test_state().await;
        let body = serde_json::json!({ "to_user_id": 2, "group_id": 3, "content": "both" });
        let (status, body) =
            call_json(&state, json_request(Method::POST, "/messages", 1, body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].is_string());

        let bad_kind = request(Method::GET, "/messages/channel/1", Some(1))
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&state, bad_kind).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    async fn post_text(state: &AppState, from: i64, to: i64) -> i64 {
        let body = serde_json::json!({ "to_user_id": to, "content": "see attached" });
        let (status, report) =
            call_json(state, json_request(Method::POST, "/messages", from, body)).await;
        assert_eq!(status, StatusCode::OK);
        report["message"]["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_upload_download_and_release() {
        let (state, _dir) = test_state().await;
        let message_id = post_text(&state, 5, 6).await.to_string();
        let (status, upload) = call_json(
            &state,
            multipart_request(
                5,
                b"png-bytes",
                &[("ref_type", "chat_file"), ("ref_id", message_id.as_str())],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(upload["deduplicated"], false);
        assert_eq!(upload["file_name"], "pic.png");
        let hash = upload["hash"].as_str().unwrap().to_string();
        let reference_id = upload["reference_id"].as_i64().unwrap();

        let get = request(Method::GET, &format!("/files/{hash}"), Some(6))
            .body(Body::empty())
            .unwrap();
        let (status, bytes) = call(&state, get).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, b"png-bytes");

        let path = format!("/files/references/{reference_id}");
        let (status, _) = call(
            &state,
            request(Method::DELETE, &path, Some(6)).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call_json(
            &state,
            request(Method::DELETE, &path, Some(5)).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], true);
    }

    #[tokio::test]
    async fn test_upload_cannot_reference_foreign_message() {
        let (state, _dir) = test_state().await;
        let message_id = post_text(&state, 1, 2).await;

        for ref_id in [message_id.to_string(), "9999".to_string()] {
            let (status, _) = call(
                &state,
                multipart_request(
                    2,
                    b"sneaky",
                    &[("ref_type", "chat_image"), ("ref_id", ref_id.as_str())],
                ),
            )
            .await;
            assert_eq!(status, StatusCode::NOT_FOUND);
        }

        let hash = blake3::hash(b"sneaky").to_hex().to_string();
        let lookup = hash.clone();
        assert!(state
            .db
            .call(move |db| db.find_file_by_hash(&lookup))
            .await
            .unwrap()
            .is_none());
        let message = state
            .db
            .call(move |db| db.get_message(MessageId(message_id)))
            .await
            .unwrap();
        assert!(message.attachments.is_empty());
    }

    #[tokio::test]
    async fn test_avatar_endpoint() {
        let (state, _dir) = test_state().await;
        let (_, upload) = call_json(&state, multipart_request(8, b"face", &[])).await;
        assert!(upload["reference_id"].is_null());

        let body = serde_json::json!({ "hash": upload["hash"] });
        let (status, resp) =
            call_json(&state, json_request(Method::PUT, "/users/me/avatar", 8, body)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(resp["reference_id"].is_i64());

        let avatar = state
            .db
            .call(|db| db.avatar_for(UserId(8)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(avatar.ref_count, 1);
    }

    async fn connect(state: &AppState, user: i64) -> OutboundQueue {
        let (handle, queue) = ConnectionHandle::channel(8);
        state.registry.register(UserId(user), handle).await;
        queue
    }

    #[tokio::test]
    async fn test_client_frames() {
        let (state, _dir) = test_state().await;
        state
            .db
            .call(|db| {
                db.add_group_member(GroupId(1), UserId(1))?;
                db.add_group_member(GroupId(1), UserId(2))?;
                Ok(())
            })
            .await
            .unwrap();
        let mut member = connect(&state, 2).await;

        assert!(matches!(
            handle_client_frame(&state, UserId(1), r#"{"type":"ping"}"#).await,
            ServerFrame::Pong
        ));
        assert!(matches!(
            handle_client_frame(&state, UserId(1), "not json").await,
            ServerFrame::Error { .. }
        ));

        let send = r#"{"type":"send","group_id":1,"content":"hi team"}"#;
        match handle_client_frame(&state, UserId(1), send).await {
            ServerFrame::Ack {
                delivered,
                offline_recipients,
                ..
            } => {
                assert!(delivered);
                assert_eq!(offline_recipients, 0);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        let pushed = member.next().await.unwrap();
        assert!(pushed.contains("hi team"));

        let outsider = r#"{"type":"send","group_id":1,"content":"let me in"}"#;
        assert!(matches!(
            handle_client_frame(&state, UserId(9), outsider).await,
            ServerFrame::Error { .. }
        ));
    }
}
