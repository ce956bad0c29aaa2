use crate::core::DaemonEvent;
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use canvas_proto::config::AuthConfig;
use canvas_proto::image::ImageHandle;
use canvas_proto::pipeline::Pipeline;
use canvas_proto::protocol::{Command, SessionState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct HttpState {
    pipeline: Arc<Pipeline>,
    event_tx: mpsc::Sender<DaemonEvent>,
    auth: AuthConfig,
}

impl HttpState {
    pub fn new(pipeline: Arc<Pipeline>, event_tx: mpsc::Sender<DaemonEvent>, auth: AuthConfig) -> Self {
        Self {
            pipeline,
            event_tx,
            auth,
        }
    }
}

#[derive(Deserialize)]
struct AuthorizeRequest {
    redirect_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuthorizeResponse {
    authenticated: bool,
    /// The redirect location with its fragment removed.
    location: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuthInfo {
    authenticated: bool,
    login_url: String,
    entry_point: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LogoutResponse {
    entry_point: String,
}

/// Cross-origin access for exactly one front-end origin. `None` leaves the
/// API same-origin only.
fn cors_layer(allowed_origin: &str) -> Option<CorsLayer> {
    if allowed_origin.is_empty() {
        return None;
    }
    match HeaderValue::from_str(allowed_origin) {
        Ok(origin) => Some(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE]),
        ),
        Err(e) => {
            warn!("Ignoring invalid http.allowed_origin {:?}: {}", allowed_origin, e);
            None
        }
    }
}

pub fn router(state: HttpState, allowed_origin: &str) -> Router {
    let app = Router::new()
        .route("/api/state", get(get_state))
        .route("/api/auth", get(get_auth))
        .route("/api/refresh", post(refresh))
        .route("/api/logout", post(logout))
        .route("/api/authorize", post(authorize))
        .route("/api/image/:id", get(get_image));
    let app = match cors_layer(allowed_origin) {
        Some(cors) => app.layer(cors),
        None => app,
    };
    app.with_state(state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    allowed_origin: String,
    state: HttpState,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state, &allowed_origin);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_state(State(state): State<HttpState>) -> Json<SessionState> {
    Json(state.pipeline.snapshot().await)
}

async fn get_auth(State(state): State<HttpState>) -> Json<AuthInfo> {
    Json(AuthInfo {
        authenticated: state.pipeline.credentials().is_authenticated().await,
        login_url: state.auth.login_url.clone(),
        entry_point: state.auth.entry_point.clone(),
    })
}

async fn refresh(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Refresh");
    if state
        .event_tx
        .send(DaemonEvent::ClientCommand(Command::Refresh))
        .await
        .is_err()
    {
        error!("Failed to send refresh command");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::ACCEPTED
}

async fn logout(State(state): State<HttpState>) -> Result<Json<LogoutResponse>, StatusCode> {
    info!("HTTP API: Logout");
    let (reply, done) = oneshot::channel();
    if state.event_tx.send(DaemonEvent::Logout { reply }).await.is_err() {
        error!("Failed to send logout command");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    match done.await {
        Ok(Ok(())) => Ok(Json(LogoutResponse {
            entry_point: state.auth.entry_point.clone(),
        })),
        Ok(Err(e)) => {
            error!("Logout failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn authorize(
    State(state): State<HttpState>,
    Json(request): Json<AuthorizeRequest>,
) -> Result<Json<AuthorizeResponse>, StatusCode> {
    info!("HTTP API: Authorize");
    let (reply, done) = oneshot::channel();
    let event = DaemonEvent::Authorize {
        redirect_url: request.redirect_url,
        reply,
    };
    if state.event_tx.send(event).await.is_err() {
        error!("Failed to send authorize command");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    match done.await {
        Ok(Ok(resolution)) => Ok(Json(AuthorizeResponse {
            authenticated: resolution.credential.is_some(),
            location: resolution.location,
        })),
        Ok(Err(e)) => {
            error!("Authorize failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn get_image(State(state): State<HttpState>, Path(id): Path<u64>) -> Response {
    match state.pipeline.image_store().get(ImageHandle(id)).await {
        Some(image) => (
            [(header::CONTENT_TYPE, image.content_type)],
            image.data,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
