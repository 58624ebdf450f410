//! Plain HTTP endpoints served next to the WebSocket
//!
//! `/health`, `/config` and `/projects`. Every response is JSON and carries
//! permissive CORS headers since the UI runs on another origin.

use crate::config::SessionContext;
use crate::hub::{HubError, HubHandle};
use crate::projects::{ProjectState, ProjectStore, StoreError};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{self, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;

pub type Body = Full<Bytes>;

/// Largest request body we accept
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Everything a request handler can reach
#[derive(Clone)]
pub struct HttpState {
    pub ctx: SessionContext,
    pub hub: HubHandle,
    pub store: ProjectStore,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigUpdate {
    working_directory: Option<PathBuf>,
}

/// Route one request
pub async fn handle_request<B>(req: Request<B>, state: HttpState) -> Response<Body>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().trim_end_matches('/').to_string();
    tracing::debug!("{} {}", method, path);

    if method == Method::OPTIONS {
        return with_cors(Response::new(Body::default()), StatusCode::NO_CONTENT);
    }

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => health(&state).await,
        (&Method::GET, ["config"]) => json_response(StatusCode::OK, &state.ctx.config().await),
        (&Method::POST, ["config"]) => match read_json::<_, ConfigUpdate>(req).await {
            Ok(update) => update_config(update, &state).await,
            Err(response) => response,
        },
        (&Method::GET, ["projects"]) => list_projects(&state).await,
        (&Method::GET, ["projects", id]) => load_project(id.to_string(), &state).await,
        (&Method::POST, ["projects"]) => match read_json::<_, ProjectState>(req).await {
            Ok(project) => save_project(project, &state).await,
            Err(response) => response,
        },
        _ => error_response(StatusCode::NOT_FOUND, "Not found"),
    }
}

async fn health(state: &HttpState) -> Response<Body> {
    let config = state.ctx.config().await;
    json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "workingDirectory": config.working_directory,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    )
}

async fn update_config(update: ConfigUpdate, state: &HttpState) -> Response<Body> {
    let Some(path) = update.working_directory else {
        return error_response(StatusCode::BAD_REQUEST, "workingDirectory is required");
    };

    match state.hub.set_working_directory(path).await {
        Ok(config) => json_response(StatusCode::OK, &config),
        Err(HubError::Rejected(message)) => error_response(StatusCode::BAD_REQUEST, &message),
        Err(HubError::Closed) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down")
        }
    }
}

async fn list_projects(state: &HttpState) -> Response<Body> {
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.list()).await {
        Ok(ids) => json_response(StatusCode::OK, &ids),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn load_project(id: String, state: &HttpState) -> Response<Body> {
    let store = state.store.clone();
    let lookup = id.clone();
    match tokio::task::spawn_blocking(move || store.load(&lookup)).await {
        Ok(Ok(Some(project))) => json_response(StatusCode::OK, &project),
        Ok(Ok(None)) => error_response(StatusCode::NOT_FOUND, &format!("Project {} not found", id)),
        Ok(Err(e)) => store_error(e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn save_project(project: ProjectState, state: &HttpState) -> Response<Body> {
    let store = state.store.clone();
    let id = project.project.id.clone();
    match tokio::task::spawn_blocking(move || store.save(&project)).await {
        Ok(Ok(_)) => json_response(StatusCode::OK, &json!({ "success": true, "id": id })),
        Ok(Err(e)) => store_error(e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn store_error(e: StoreError) -> Response<Body> {
    match e {
        StoreError::InvalidId(_) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        _ => {
            tracing::error!("Project store error: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

/// Collect and parse a JSON body, or produce the 400 to send back
async fn read_json<B, T>(req: Request<B>) -> Result<T, Response<Body>>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    T: serde::de::DeserializeOwned,
{
    let limited = http_body_util::Limited::new(req.into_body(), MAX_BODY_BYTES);
    let bytes = match limited.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                &format!("Failed to read body: {}", e),
            ))
        }
    };
    serde_json::from_slice(&bytes).map_err(|e| {
        error_response(StatusCode::BAD_REQUEST, &format!("Invalid JSON body: {}", e))
    })
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Body::new(Bytes::from(body)));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            with_cors(response, status)
        }
        Err(e) => {
            tracing::error!("Failed to serialize response: {}", e);
            with_cors(
                Response::new(Body::default()),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        }
    }
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &json!({ "error": message }))
}

fn with_cors(mut response: Response<Body>, status: StatusCode) -> Response<Body> {
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}
