#![allow(dead_code)]

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::net::TcpListener;
use tokio_websockets::{ClientBuilder, MaybeTlsStream, WebSocketStream};

pub const API_KEY: &str = "test-key";

/// Frame payload that makes the mock upstreams stall.
pub const SLOW_FRAME: &[u8] = b"slow";

pub type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub async fn spawn_router(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

#[derive(Clone)]
pub struct ClaudeScript {
    pub status: StatusCode,
    pub send_content: bool,
    pub hazard_answer: &'static str,
    pub description: &'static str,
    pub requests: Arc<Mutex<Vec<Value>>>,
}

impl ClaudeScript {
    pub fn answering(hazard_answer: &'static str, description: &'static str) -> Self {
        Self {
            status: StatusCode::OK,
            send_content: true,
            hazard_answer,
            description,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

async fn claude_messages(
    State(script): State<ClaudeScript>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    script.requests.lock().unwrap().push(body.clone());

    if headers.get("x-api-key").and_then(|v| v.to_str().ok()) != Some(API_KEY) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "bad key" })));
    }
    if script.status != StatusCode::OK {
        return (script.status, Json(json!({ "error": "scripted failure" })));
    }

    if !script.send_content {
        return (StatusCode::OK, Json(json!({ "content": [] })));
    }

    let data = body["messages"][0]["content"][0]["source"]["data"]
        .as_str()
        .unwrap_or_default();
    if data == STANDARD.encode(SLOW_FRAME) {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    let text = if body["max_tokens"] == 1 {
        script.hazard_answer
    } else {
        script.description
    };
    (
        StatusCode::OK,
        Json(json!({ "content": [{ "type": "text", "text": text }] })),
    )
}

pub async fn spawn_claude(script: ClaudeScript) -> SocketAddr {
    let router = Router::new()
        .route("/v1/messages", post(claude_messages))
        .with_state(script);
    spawn_router(router).await
}

#[derive(Clone)]
pub struct GeminiScript {
    pub addr: Arc<Mutex<Option<SocketAddr>>>,
    pub start_status: StatusCode,
    pub send_upload_url: bool,
    pub finish_status: StatusCode,
    pub send_file_uri: bool,
    pub generate_status: StatusCode,
    pub hazard_answer: &'static str,
    pub description: &'static str,
    pub uploads: Arc<Mutex<Vec<Bytes>>>,
    pub generate_requests: Arc<Mutex<Vec<Value>>>,
}

impl GeminiScript {
    pub fn answering(hazard_answer: &'static str, description: &'static str) -> Self {
        Self {
            addr: Arc::new(Mutex::new(None)),
            start_status: StatusCode::OK,
            send_upload_url: true,
            finish_status: StatusCode::OK,
            send_file_uri: true,
            generate_status: StatusCode::OK,
            hazard_answer,
            description,
            uploads: Arc::new(Mutex::new(Vec::new())),
            generate_requests: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

async fn gemini_start_upload(
    State(script): State<GeminiScript>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if query.get("key").map(String::as_str) != Some(API_KEY) {
        return (StatusCode::UNAUTHORIZED, HeaderMap::new());
    }
    assert_eq!(headers["x-goog-upload-protocol"], "resumable");
    assert_eq!(headers["x-goog-upload-command"], "start");
    if script.start_status != StatusCode::OK {
        return (script.start_status, HeaderMap::new());
    }

    let mut response_headers = HeaderMap::new();
    if script.send_upload_url {
        let addr = (*script.addr.lock().unwrap()).expect("mock address");
        let session = format!("http://{}/upload-session/1", addr);
        response_headers.insert("x-goog-upload-url", session.parse().unwrap());
    }
    (StatusCode::OK, response_headers)
}

async fn gemini_finish_upload(
    State(script): State<GeminiScript>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    assert_eq!(headers["x-goog-upload-command"], "upload, finalize");
    assert_eq!(headers["x-goog-upload-offset"], "0");
    script.uploads.lock().unwrap().push(body);
    if script.finish_status != StatusCode::OK {
        return (script.finish_status, Json(json!({})));
    }
    if !script.send_file_uri {
        return (StatusCode::OK, Json(json!({ "file": {} })));
    }
    (
        StatusCode::OK,
        Json(json!({ "file": { "uri": "https://files.example/abc" } })),
    )
}

async fn gemini_generate(
    State(script): State<GeminiScript>,
    Path(call): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    assert!(call.ends_with(":generateContent"), "unexpected call {call}");
    script.generate_requests.lock().unwrap().push(body.clone());

    if script.generate_status != StatusCode::OK {
        return (script.generate_status, Json(json!({})));
    }

    let text = if body["generationConfig"]["maxOutputTokens"] == 1 {
        script.hazard_answer
    } else {
        script.description
    };
    (
        StatusCode::OK,
        Json(json!({
            "candidates": [{ "content": { "parts": [{ "text": text }] } }]
        })),
    )
}

pub async fn spawn_gemini(script: GeminiScript) -> SocketAddr {
    let router = Router::new()
        .route("/upload/v1beta/files", post(gemini_start_upload))
        .route("/upload-session/1", post(gemini_finish_upload))
        .route("/v1beta/models/{call}", post(gemini_generate))
        .with_state(script.clone());
    let addr = spawn_router(router).await;
    *script.addr.lock().unwrap() = Some(addr);
    addr
}

pub async fn connect(addr: SocketAddr) -> WsClient {
    let uri = format!("ws://{}/", addr);
    let (client, _) = ClientBuilder::from_uri(uri.parse().unwrap())
        .connect()
        .await
        .unwrap();
    client
}

/// Next text message, or `None` once the server closes the connection.
pub async fn next_text(client: &mut WsClient) -> Option<String> {
    loop {
        match client.next().await {
            Some(Ok(message)) if message.is_text() => {
                return message.as_text().map(str::to_string);
            }
            Some(Ok(message)) if message.is_close() => return None,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}
