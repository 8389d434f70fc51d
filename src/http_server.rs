use std::future::Future;

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;

use crate::{error::GatewayError, link::websocket_link, Gateway};

// none of the API routes take a body
const BODY_LIMIT: usize = 16 * 1024;

impl Gateway {
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> crate::error::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.create_router();
        log::info!("listening on {}", listener.local_addr()?);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    pub fn create_router(&self) -> Router {
        Router::new()
            .route("/ws/:device_id", get(device_socket))
            .route("/api/devices", get(list_devices))
            .route("/api/devices/:id/status", get(get_status))
            .route("/api/devices/:id/status/cached", get(get_cached_status))
            .route(
                "/api/devices/:id/files",
                get(list_files).delete(delete_all_files),
            )
            .route(
                "/api/devices/:id/files/:name",
                get(download_file).delete(delete_file),
            )
            .route("/api/devices/:id/disconnect", post(disconnect))
            .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
            .with_state(self.clone())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::warn!("request failed: {self}");
        } else {
            log::debug!("request refused: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn device_socket(
    State(gateway): State<Gateway>,
    Path(device_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let max = gateway.config.max_frame_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| async move {
            let link = websocket_link(socket, gateway.config.outbound_queue);
            gateway.accept(&device_id, link);
        })
}

async fn list_devices(State(gateway): State<Gateway>) -> impl IntoResponse {
    Json(gateway.connected_devices())
}

async fn get_status(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    Ok(Json(gateway.status(&id).await?))
}

async fn get_cached_status(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<Response, GatewayError> {
    match gateway.cached_status(&id)? {
        Some(status) => Ok(Json(status).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Device {id} has not reported a status yet") })),
        )
            .into_response()),
    }
}

async fn list_files(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    Ok(Json(gateway.list_files(&id).await?))
}

async fn download_file(
    State(gateway): State<Gateway>,
    Path((id, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, GatewayError> {
    let file = gateway.download(&id, &name).await?;
    let mime = mime_guess::from_path(&file.filename)
        .first_or_octet_stream()
        .to_string();
    let disposition = format!("attachment; filename=\"{}\"", file.filename.replace('"', ""));

    Ok((
        [
            (header::CONTENT_TYPE, mime),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        file.data,
    ))
}

async fn delete_file(
    State(gateway): State<Gateway>,
    Path((id, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, GatewayError> {
    Ok(Json(gateway.delete_file(&id, &name).await?))
}

async fn delete_all_files(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    Ok(Json(gateway.delete_all_files(&id).await?))
}

async fn disconnect(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    Ok(Json(gateway.disconnect(&id).await?))
}
