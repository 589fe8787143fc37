//! HTTP route handlers.
//!
//! [`health`] is public; [`status`] and the UI WebSocket require the API key
//! (see [`crate::auth`]).

pub mod health;
pub mod status;

use axum::{middleware, routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::{auth, ws, AppState};

/// The daemon's full HTTP surface.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let authed_routes = Router::new()
        .route("/api/status", get(status::status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    let ws_route = Router::new().route("/api/ws", get(ws::ws_upgrade));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_route)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::state_in;
    use crate::tool::testing::ScriptedRunner;
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn serve(state: AppState) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        addr
    }

    /// Status line and body of a bare HTTP/1.1 GET.
    async fn http_get(addr: std::net::SocketAddr, path: &str, auth: Option<&str>) -> (String, String) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let auth = auth
            .map(|a| format!("Authorization: {a}\r\n"))
            .unwrap_or_default();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{auth}Connection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let status = response.lines().next().unwrap_or_default().to_string();
        let body = response
            .split_once("\r\n\r\n")
            .map(|(_, b)| b.to_string())
            .unwrap_or_default();
        (status, body)
    }

    #[tokio::test]
    async fn test_status_requires_bearer_key() {
        let dir = tempfile::tempdir().unwrap();
        let addr = serve(state_in(dir.path(), ScriptedRunner::new()).await).await;

        let (status, body) = http_get(addr, "/api/status", None).await;
        assert!(status.contains("401"), "{status}");
        assert!(body.contains("auth_missing"));

        let (status, body) = http_get(addr, "/api/status", Some("Bearer wrong")).await;
        assert!(status.contains("403"), "{status}");
        assert!(body.contains("auth_invalid"));

        let (status, body) = http_get(addr, "/api/status", Some("Bearer test-key")).await;
        assert!(status.contains("200"), "{status}");
        assert!(body.contains("remote_key_set"));

        let (status, _) = http_get(addr, "/api/health", None).await;
        assert!(status.contains("200"), "{status}");
    }

    #[tokio::test]
    async fn test_ws_token_uses_same_check() {
        let dir = tempfile::tempdir().unwrap();
        let addr = serve(state_in(dir.path(), ScriptedRunner::new()).await).await;

        let (status, body) = http_get(addr, "/api/ws?token=wrong", None).await;
        assert!(status.contains("403"), "{status}");
        assert!(body.contains("auth_invalid"));
        let (status, _) = http_get(addr, "/api/ws", None).await;
        assert!(status.contains("401"), "{status}");

        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws?token=test-key"))
                .await
                .unwrap();
        let first = ws.next().await.unwrap().unwrap();
        let first: serde_json::Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
        assert!(first["status"]["wifi"].is_object());
    }
}
