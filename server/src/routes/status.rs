//! Full status snapshot for polling clients.

use axum::{extract::State, Json};
use serde_json::Value;

use crate::AppState;

/// `GET /api/status`: the same snapshots a new WebSocket session receives,
/// merged into one object.
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let mut merged = serde_json::Map::new();
    for msg in crate::ws::initial_messages(&state).await {
        if let Value::Object(sections) = msg {
            merged.extend(sections);
        }
    }
    Json(Value::Object(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::state_in;
    use crate::tool::testing::ScriptedRunner;

    #[tokio::test]
    async fn test_status_merges_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path(), ScriptedRunner::new()).await;
        let Json(body) = status(State(state)).await;
        assert!(body["status"]["wifi"].is_object());
        assert!(body["relays"]["servers"].is_object());
        assert_eq!(body["config"]["remote_key_set"], false);
    }
}
