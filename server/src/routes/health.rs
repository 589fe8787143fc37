//! Unauthenticated health-check endpoint.

use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health`: liveness probe.
///
/// Returns status, uptime, version, device counts and relay connection
/// statistics. No authentication required.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let rs = &state.remote_stats;

    let remote = if state.config.remote.is_some() {
        let events = rs.events.lock().await;
        let now = std::time::Instant::now();
        let recent_events: Vec<Value> = events
            .iter()
            .rev()
            .take(10)
            .map(|e| {
                let ago = now.duration_since(e.timestamp);
                let ago_str = if ago.as_secs() < 60 {
                    format!("{}s ago", ago.as_secs())
                } else if ago.as_secs() < 3600 {
                    format!("{}m ago", ago.as_secs() / 60)
                } else {
                    format!("{}h ago", ago.as_secs() / 3600)
                };
                json!({
                    "time": ago_str,
                    "event": e.event_type.as_str(),
                    "detail": e.detail,
                })
            })
            .collect();

        json!({
            "state": rs.state().as_str(),
            "error": rs.last_error().map(|e| e.as_str()),
            "reconnects": rs.reconnects.load(Ordering::Relaxed),
            "messages_sent": rs.messages_sent.load(Ordering::Relaxed),
            "messages_received": rs.messages_received.load(Ordering::Relaxed),
            "dns_from_cache": rs.dns_from_cache.load(Ordering::Relaxed),
            "recent_events": recent_events,
        })
    } else {
        json!(null)
    };

    let wifi_interfaces = state.wifi.store().lock().await.len();
    let netif = state.netif.lock().await.len();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "interfaces": netif,
        "wifi_interfaces": wifi_interfaces,
        "modems": state.modems.count().await,
        "remote": remote,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::state_in;
    use crate::state::RemoteEventType;
    use crate::tool::testing::ScriptedRunner;

    #[tokio::test]
    async fn test_health_without_remote() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path(), ScriptedRunner::new()).await;
        let Json(body) = health(State(state)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["modems"], 0);
        assert!(body["remote"].is_null());
    }

    #[tokio::test]
    async fn test_health_reports_remote_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path(), ScriptedRunner::new()).await;
        let mut config = (*state.config).clone();
        config.remote = Some(crate::config::RemoteConfig::new("relay.example.net"));
        state.config = std::sync::Arc::new(config);
        state
            .remote_stats
            .push_event(RemoteEventType::AuthRejected, String::new())
            .await;

        let Json(body) = health(State(state)).await;
        assert_eq!(body["remote"]["state"], "disconnected");
        assert_eq!(body["remote"]["recent_events"][0]["event"], "auth_rejected");
    }
}
