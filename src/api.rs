use anyhow::{Context, Result};
use axum::{
    Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::alarm::AlarmEvent;
use crate::audio::NotificationPlayer;
use crate::call::CallDialer;
use crate::config::RuntimeFlags;
use crate::dispatch::Dispatcher;
use crate::display::DisplaySession;
use crate::payload;
use crate::storage::PhotoStore;

const SERVICE_NAME: &str = "alarm-relay";
const LOG_TAIL_LINES: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub display: Arc<DisplaySession>,
    pub audio: Arc<NotificationPlayer>,
    pub photos: Arc<PhotoStore>,
    pub flags: Arc<RuntimeFlags>,
    pub dialer: Arc<CallDialer>,
    pub log_path: PathBuf,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Alarm ingestion
        .route("/webhook", get(webhook_get).post(webhook_post))
        // Display ingestion + gallery
        .route("/photo", post(receive_photo))
        .route("/photo/:filename", get(serve_photo))
        .route("/photos/api", get(photos_api))
        // Health & status
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/logs", get(view_logs))
        // Runtime configuration & maintenance
        .route("/config", get(get_config).post(set_config))
        .route("/test-audio", post(test_audio))
        .route("/reset-display", post(reset_display))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn webhook_post(
    State(state): State<AppState>,
    payload: Option<Json<Value>>,
) -> (StatusCode, Json<Value>) {
    let Some(Json(raw)) = payload else {
        warn!("webhook POST without a JSON body");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": "no JSON data" })),
        );
    };

    let event = AlarmEvent::new(raw);
    log_event(&event);
    state.dispatcher.handle(&event).await;

    (
        StatusCode::OK,
        Json(json!({ "status": "success", "message": "alarm processed" })),
    )
}

/// Legacy callers send alarms as bare GET query parameters. Those carry no
/// photo and too little structure to dispatch, so they are only logged.
async fn webhook_get(Query(params): Query<HashMap<String, String>>) -> &'static str {
    info!("webhook GET received, parameters: {params:?}");
    "webhook received"
}

fn log_event(event: &AlarmEvent) {
    info!("=== alarm received ({}) ===", event.id);
    info!(
        "payload (sanitized): {}",
        serde_json::to_string_pretty(&event.redacted).unwrap_or_default()
    );

    let info = event.alarm();
    info!("alarm name: {}", info.name.unwrap_or("unknown alarm"));
    for trigger in &info.triggers {
        info!(
            "trigger: {} on device {}",
            trigger.key.unwrap_or("unknown"),
            trigger.device.unwrap_or("unknown"),
        );
    }
    for condition in &info.conditions {
        info!(
            "condition: {} ({})",
            condition.source.unwrap_or("unknown"),
            condition.kind.unwrap_or("unknown"),
        );
    }
}

async fn receive_photo(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let (image, detected_name) = if content_type.contains("application/json") {
        match serde_json::from_slice::<Value>(&body) {
            Ok(data) => {
                let name = data
                    .get("detected_name")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                (find_image_field(&data).map(str::to_string), name)
            }
            Err(e) => {
                warn!("photo POST with invalid JSON: {e}");
                (None, None)
            }
        }
    } else {
        (encode_raw_body(&body), None)
    };

    let Some(image) = image else {
        warn!("no image found in photo request");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "no image found" })),
        );
    };

    if let Err(e) = validate_image(&image) {
        error!("invalid image data: {e:#}");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid image data" })),
        );
    }

    info!(
        "photo received ({} chars), name: {:?}",
        image.len(),
        detected_name
    );

    // Keep a copy on disk, then hand the image to the viewer. The sound cue
    // fires inside the display session.
    let store = Arc::clone(&state.photos);
    let stored = image.clone();
    tokio::task::spawn_blocking(move || {
        store.save(&stored, "received");
    });
    let size = image.len();
    state.display.show(image, detected_name);

    (
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "message": "photo received",
            "timestamp": Utc::now(),
            "size": size,
        })),
    )
}

/// The well-known image fields first, then a recursive hunt for anything that
/// looks like inline image data. Display clients are even less consistent
/// than the alarm payloads.
fn find_image_field(data: &Value) -> Option<&str> {
    const FIELDS: [&str; 5] = ["image", "photo", "thumbnail", "data", "base64"];
    for field in FIELDS {
        if let Some(value) = data.get(field).and_then(Value::as_str) {
            return Some(value);
        }
    }
    find_image_like(data)
}

fn find_image_like(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) if s.starts_with("data:image") || s.len() > 1000 => Some(s),
        Value::Object(map) => map.values().find_map(find_image_like),
        Value::Array(items) => items.iter().find_map(find_image_like),
        _ => None,
    }
}

fn encode_raw_body(body: &Bytes) -> Option<String> {
    use base64::Engine as _;

    if body.is_empty() {
        return None;
    }
    if body.starts_with(b"data:image") {
        return String::from_utf8(body.to_vec()).ok();
    }
    Some(base64::engine::general_purpose::STANDARD.encode(body))
}

fn validate_image(image: &str) -> Result<()> {
    let bytes = payload::decode_base64_image(image)?;
    image::load_from_memory(&bytes).context("bytes are not a decodable image")?;
    Ok(())
}

async fn serve_photo(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    // The gallery only hands out flat file names; anything else is rejected.
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return Err(StatusCode::FORBIDDEN);
    }

    let path = state.photos.dir().join(&filename);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;

    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        _ => "image/jpeg",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

async fn photos_api(State(state): State<AppState>) -> Json<Value> {
    let photos = state.photos.list();
    Json(json!({
        "count": photos.len(),
        "photos": photos,
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "timestamp": Utc::now(),
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "running",
        "service": SERVICE_NAME,
        "timestamp": Utc::now(),
        "display_window_active": state.display.window_active(),
        "auto_display": state.flags.auto_display(),
        "bring_to_foreground": state.flags.bring_to_foreground(),
        "persist_photos": state.flags.persist_photos(),
        "photos_directory": state.photos.dir(),
        "audio_enabled": state.flags.audio_enabled(),
        "audio_available": state.audio.available(),
        "audio_volume": state.flags.audio_volume(),
        "audio_file_exists": state.audio.sound_path().is_some(),
        "last_call": state.dialer.last_outcome(),
    }))
}

async fn view_logs(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let contents = tokio::fs::read_to_string(&state.log_path)
        .await
        .unwrap_or_default();
    let lines = tail_lines(&contents, LOG_TAIL_LINES);
    Ok(Json(json!({
        "count": lines.len(),
        "logs": lines,
    })))
}

fn tail_lines(contents: &str, count: usize) -> Vec<String> {
    let all: Vec<&str> = contents.lines().collect();
    let start = all.len().saturating_sub(count);
    all[start..].iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Deserialize)]
struct ConfigUpdate {
    auto_display: Option<bool>,
    bring_to_foreground: Option<bool>,
    persist_photos: Option<bool>,
    audio_enabled: Option<bool>,
    audio_volume: Option<f32>,
}

async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "auto_display": state.flags.auto_display(),
        "bring_to_foreground": state.flags.bring_to_foreground(),
        "persist_photos": state.flags.persist_photos(),
        "audio_enabled": state.flags.audio_enabled(),
        "audio_volume": state.flags.audio_volume(),
        "audio_available": state.audio.available(),
        "audio_file_exists": state.audio.sound_path().is_some(),
        "photos_directory": state.photos.dir(),
    }))
}

async fn set_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> Json<Value> {
    if let Some(on) = update.auto_display {
        state.flags.set_auto_display(on);
        info!("auto-display: {}", if on { "on" } else { "off" });
    }
    if let Some(on) = update.bring_to_foreground {
        state.flags.set_bring_to_foreground(on);
        info!("bring to foreground: {}", if on { "on" } else { "off" });
    }
    if let Some(on) = update.persist_photos {
        state.flags.set_persist_photos(on);
        info!("photo persistence: {}", if on { "on" } else { "off" });
    }
    if let Some(on) = update.audio_enabled {
        state.flags.set_audio_enabled(on);
        info!("audio: {}", if on { "on" } else { "off" });
    }
    if let Some(volume) = update.audio_volume {
        state.flags.set_audio_volume(volume);
        info!("audio volume: {}%", (state.flags.audio_volume() * 100.0) as u32);
    }
    Json(json!({ "status": "updated" }))
}

async fn test_audio(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    if !state.audio.available() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "message": "audio backend unavailable",
            })),
        );
    }

    if state.audio.play_default() {
        (
            StatusCode::OK,
            Json(json!({ "status": "success", "message": "test sound playing" })),
        )
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "message": "could not play sound, check that the audio file exists",
            })),
        )
    }
}

async fn reset_display(State(state): State<AppState>) -> Json<Value> {
    state.display.reset();
    Json(json!({ "status": "success", "message": "display session reset" }))
}

pub async fn serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let app = create_router(state);

    let addr = format!("{bind}:{port}");
    info!("HTTP API listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::render::test_png;

    #[test]
    fn image_field_lookup_prefers_well_known_names() {
        let data = json!({ "image": "abc", "other": "x".repeat(2000) });
        assert_eq!(find_image_field(&data), Some("abc"));
    }

    #[test]
    fn image_field_lookup_falls_back_to_recursive_search() {
        let blob = "x".repeat(2000);
        let data = json!({ "nested": { "deep": [ { "payload": blob } ] } });
        assert_eq!(find_image_field(&data), Some(blob.as_str()));

        let uri = json!({ "wrapped": { "pic": "data:image/jpeg;base64,abc" } });
        assert_eq!(find_image_field(&uri), Some("data:image/jpeg;base64,abc"));

        assert_eq!(find_image_field(&json!({ "note": "short" })), None);
    }

    #[test]
    fn raw_bodies_become_base64() {
        use base64::Engine as _;

        let raw = Bytes::from_static(b"\xff\xd8\xff jpeg-ish");
        assert_eq!(
            encode_raw_body(&raw),
            Some(base64::engine::general_purpose::STANDARD.encode(b"\xff\xd8\xff jpeg-ish"))
        );

        let uri = Bytes::from_static(b"data:image/jpeg;base64,Zm9v");
        assert_eq!(
            encode_raw_body(&uri),
            Some("data:image/jpeg;base64,Zm9v".to_string())
        );

        assert_eq!(encode_raw_body(&Bytes::new()), None);
    }

    #[test]
    fn image_validation_accepts_real_images_only() {
        assert!(validate_image(&test_png(4, 4)).is_ok());

        use base64::Engine as _;
        let not_image = base64::engine::general_purpose::STANDARD.encode(b"plain text");
        assert!(validate_image(&not_image).is_err());
        assert!(validate_image("not even base64 !!!").is_err());
    }

    #[test]
    fn tail_keeps_the_last_lines() {
        let contents = (0..60).map(|i| format!("line {i}\n")).collect::<String>();
        let tail = tail_lines(&contents, 50);
        assert_eq!(tail.len(), 50);
        assert_eq!(tail[0], "line 10");
        assert_eq!(tail[49], "line 59");

        assert!(tail_lines("", 50).is_empty());
    }
}
