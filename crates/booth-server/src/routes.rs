//! HTTP routes over the camera manager.
//!
//! Manager calls can block for as long as a device takes to probe, so they
//! all run on the blocking pool; only the slot read for `/snapshot` is done
//! inline.

use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use booth_camera::{
    mjpeg_stream, stream, CameraDescriptor, CameraError, CameraManager, CaptureRequest,
    SessionStatus,
};
use log::warn;
use serde::Serialize;
use serde_json::json;
use tokio_stream::StreamExt;

#[derive(Clone)]
pub struct AppState {
    manager: Arc<CameraManager>,
    /// Camera `/video_feed` brings up; follows the last start/switch.
    selected: Arc<Mutex<CaptureRequest>>,
}

impl AppState {
    fn selected(&self) -> CaptureRequest {
        self.selected.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn select(&self, request: &CaptureRequest) {
        *self.selected.lock().unwrap_or_else(PoisonError::into_inner) = request.clone();
    }
}

pub fn router(manager: Arc<CameraManager>, boot_request: CaptureRequest) -> Router {
    let state = AppState {
        manager,
        selected: Arc::new(Mutex::new(boot_request)),
    };
    Router::new()
        .route("/video_feed", get(video_feed))
        .route("/snapshot", get(snapshot))
        .route("/camera/status", get(status))
        .route("/camera/start", post(start))
        .route("/camera/switch", post(switch))
        .route("/camera/stop", post(stop))
        .route("/cameras", get(cameras))
        .with_state(state)
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<CameraError> for ApiError {
    fn from(err: CameraError) -> Self {
        let status = match err {
            CameraError::NoFrame
            | CameraError::ShutDown
            | CameraError::ProbeFailure { .. }
            | CameraError::NoDriver
            | CameraError::Open { .. }
            | CameraError::Spawn { .. }
            | CameraError::StartupTimeout(_)
            | CameraError::Cancelled
            | CameraError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, CameraError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(err) => Err(ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("camera task failed: {err}"),
        }),
    }
}

fn multipart(body: Body) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, stream::CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn video_feed(State(app): State<AppState>) -> Response {
    let manager = app.manager.clone();
    let request = app.selected();
    let viewer = blocking(move || manager.start(&request).map(|_| manager.viewer())).await;

    match viewer {
        Ok(frames) => {
            let parts = mjpeg_stream(frames).map(Ok::<_, Infallible>);
            multipart(Body::from_stream(parts))
        }
        Err(err) => {
            warn!("preview unavailable: {}", err.message);
            multipart(Body::from(stream::diagnostic_part(&err.message)))
        }
    }
}

async fn snapshot(State(app): State<AppState>) -> Result<Response, ApiError> {
    let frame = app.manager.snapshot()?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], frame.jpeg.to_vec()).into_response())
}

#[derive(Serialize)]
struct StatusReport {
    active: bool,
    selected: CaptureRequest,
    session: Option<SessionStatus>,
}

async fn status(State(app): State<AppState>) -> Result<Json<StatusReport>, ApiError> {
    let manager = app.manager.clone();
    let selected = app.selected();
    let (active, session) = blocking(move || Ok((manager.is_active(), manager.status()))).await?;
    Ok(Json(StatusReport {
        active,
        selected,
        session,
    }))
}

/// Start the posted camera, or the selected one when the body is empty.
async fn start(
    State(app): State<AppState>,
    body: Option<Json<CaptureRequest>>,
) -> Result<Json<SessionStatus>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_else(|| app.selected());
    let manager = app.manager.clone();
    let status = blocking({
        let request = request.clone();
        move || manager.start(&request)
    })
    .await?;
    app.select(&request);
    Ok(Json(status))
}

async fn switch(
    State(app): State<AppState>,
    Json(request): Json<CaptureRequest>,
) -> Result<Json<SessionStatus>, ApiError> {
    let manager = app.manager.clone();
    app.select(&request);
    let status = blocking({
        let request = request.clone();
        move || manager.switch(&request)
    })
    .await?;
    Ok(Json(status))
}

async fn stop(State(app): State<AppState>) -> Result<StatusCode, ApiError> {
    let manager = app.manager.clone();
    blocking(move || {
        manager.stop();
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cameras(State(app): State<AppState>) -> Result<Json<Vec<CameraDescriptor>>, ApiError> {
    let manager = app.manager.clone();
    Ok(Json(blocking(move || Ok(manager.inventory())).await?))
}
