//! WebSocket transport for UI sessions.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /api/ws?token=<api_key>`; the token is validated
//!    before the upgrade completes.
//! 2. The session receives the current `status` (wifi, modems, remote, netif),
//!    `relays` and `config` snapshots, then every broadcast from then on.
//! 3. Inbound messages are JSON objects keyed by section. Each is handled on
//!    its own task so a slow tool call never blocks the session. The relay
//!    client feeds frames through the same [`handle_message`].
//!
//! ## Commands (client → server)
//!
//! | Message                                             | Reply                                                  |
//! |-----------------------------------------------------|--------------------------------------------------------|
//! | `{"wifi": {"connect": uuid}}`                       | `{"wifi": {"connect": {"uuid", "success"}}}`           |
//! | `{"wifi": {"disconnect": uuid}}`                    | `{"wifi": {"disconnect": {"uuid", "success"}}}`        |
//! | `{"wifi": {"scan": device}}`                        | (status broadcasts)                                    |
//! | `{"wifi": {"new": {"device", "ssid", "password"}}}` | `{"wifi": {"new": {"device", "success"\|"error"}}}`    |
//! | `{"wifi": {"forget": uuid}}`                        | `{"wifi": {"forget": {"uuid", "success"}}}`            |
//! | `{"wifi": {"hotspot": {"start": {"device"}}}}`      | (status broadcasts)                                    |
//! | `{"wifi": {"hotspot": {"stop": {"device"}}}}`       | (status broadcasts)                                    |
//! | `{"wifi": {"hotspot": {"config": {"device", ..}}}}` | `{"wifi": {"hotspot": {"config": {"device", ..}}}}`    |
//! | `{"modems": {"scan": {"device"}}}`                  | (status broadcasts)                                    |
//! | `{"modems": {"config": {"device", ..}}}`            | `{"modems": {"config": {"device", "success"\|"error"}}}` |
//! | `{"config": {"remote_key": key}}`                   | `{"config": ..}` broadcast                             |
//!
//! ## Broadcasts (server → client)
//!
//! | Message                                  | Sent when                                   |
//! |------------------------------------------|---------------------------------------------|
//! | `{"status": {"wifi": ..}}`               | WiFi store changed                          |
//! | `{"status": {"modems": {id: delta}}}`    | modem fields changed                        |
//! | `{"status": {"remote": ..}}`             | relay connection state changed              |
//! | `{"status": {"netif": ..}}`              | interface addresses changed                 |
//! | `{"relays": ..}`                         | relay routing data changed                  |
//! | `{"config": ..}`                         | streaming config changed                    |

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::modems::ModemConfigRequest;
use crate::wifi::hotspot::HotspotConfig;
use crate::AppState;

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// API key passed as a query parameter (since HTTP headers aren't available
    /// during a browser WebSocket upgrade).
    pub token: Option<String>,
}

/// `GET /api/ws?token=<key>`: WebSocket upgrade handler.
///
/// The token is checked before the upgrade itself, so a bad key is reported
/// as such even to a client that is not speaking WebSocket.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Err(e) = auth::check_key(&state.config.auth.api_key, query.token.as_deref()) {
        debug!("WS: rejected upgrade ({})", e.as_str());
        return e.into_response();
    }
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_ws(socket, state)),
        Err(rejection) => rejection.into_response(),
    }
}

/// Snapshots sent to a freshly connected peer (UI session or relay).
pub async fn initial_messages(state: &AppState) -> Vec<Value> {
    let netif = state.netif.lock().await.build_status_message();
    let config = state.stream_config.lock().await.get().status_message();
    vec![
        json!({
            "status": {
                "wifi": state.wifi.status_message().await,
                "modems": state.modems.status_message().await,
                "remote": state.remote_stats.status_message(),
                "netif": netif,
            }
        }),
        json!({ "relays": state.relays.status_message().await }),
        json!({ "config": config }),
    ]
}

/// Main WebSocket event loop.
///
/// Outgoing messages are funneled through an mpsc channel so command tasks
/// can reply without holding the socket.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Value>(256);
    let mut broadcast_rx = state.events.subscribe();

    info!("WS: client connected");

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!("WS send: failed to serialize message: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    for msg in initial_messages(&state).await {
        if tx.send(msg).await.is_err() {
            break;
        }
    }

    loop {
        tokio::select! {
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                match msg {
                    Message::Text(text) => {
                        let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                            debug!("WS: ignoring malformed message");
                            continue;
                        };
                        let state = state.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            handle_message(&state, parsed, &tx).await;
                        });
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            event = broadcast_rx.recv() => match event {
                Ok(msg) => {
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("WS: client lagged, dropped {n} broadcasts");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    send_task.abort();
    info!("WS: client disconnected");
}

/// Dispatch one inbound message. Replies go to `reply`; state changes are
/// broadcast by the controllers themselves.
pub async fn handle_message(state: &AppState, msg: Value, reply: &mpsc::Sender<Value>) {
    let Value::Object(sections) = msg else {
        debug!("WS: ignoring non-object message");
        return;
    };
    for (section, body) in sections {
        match section.as_str() {
            "wifi" => handle_wifi(state, &body, reply).await,
            "modems" => handle_modems(state, &body, reply).await,
            "config" => handle_config(state, &body, reply).await,
            "keepalive" => {}
            other => debug!(section = other, "WS: unhandled message section"),
        }
    }
}

/// Device ids arrive as numbers or numeric strings, bare or as `{"device": id}`.
fn device_id(v: &Value) -> Option<u32> {
    let v = v.get("device").unwrap_or(v);
    match v {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

async fn send_reply(reply: &mpsc::Sender<Value>, msg: Value) {
    let _ = reply.send(msg).await;
}

async fn handle_wifi(state: &AppState, body: &Value, reply: &mpsc::Sender<Value>) {
    let Some(cmds) = body.as_object() else { return };
    for (cmd, arg) in cmds {
        match cmd.as_str() {
            "connect" | "disconnect" | "forget" => {
                let Some(uuid) = arg.as_str() else { continue };
                let success = match cmd.as_str() {
                    "connect" => state.wifi.connect(uuid).await,
                    "disconnect" => state.wifi.disconnect(uuid).await,
                    _ => state.wifi.forget(uuid).await,
                };
                let mut result = Map::new();
                result.insert(cmd.clone(), json!({ "uuid": uuid, "success": success }));
                send_reply(reply, json!({ "wifi": result })).await;
            }
            "scan" => {
                if let Some(id) = device_id(arg) {
                    state.wifi.rescan(id).await;
                }
            }
            "new" => {
                let Some(id) = device_id(arg) else { continue };
                let Some(ssid) = arg.get("ssid").and_then(Value::as_str) else {
                    continue;
                };
                let password = arg.get("password").and_then(Value::as_str);
                let result = match state.wifi.new_connection(id, ssid, password).await {
                    Ok(()) => json!({ "device": id, "success": true }),
                    Err(e) => json!({ "device": id, "error": e.as_str() }),
                };
                send_reply(reply, json!({ "wifi": { "new": result } })).await;
            }
            "hotspot" => handle_hotspot(state, arg, reply).await,
            other => debug!(cmd = other, "WS: unknown wifi command"),
        }
    }
}

async fn handle_hotspot(state: &AppState, body: &Value, reply: &mpsc::Sender<Value>) {
    let Some(cmds) = body.as_object() else { return };
    for (cmd, arg) in cmds {
        let Some(id) = device_id(arg) else {
            debug!(cmd = cmd.as_str(), "WS: hotspot command without device");
            continue;
        };
        match cmd.as_str() {
            "start" => state.wifi.hotspot_start(id).await,
            "stop" => state.wifi.hotspot_stop(id).await,
            "config" => {
                let req: HotspotConfig = match serde_json::from_value(arg.clone()) {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("WS: malformed hotspot config: {e}");
                        continue;
                    }
                };
                let result = match state.wifi.hotspot_config(id, &req).await {
                    Ok(()) => json!({ "device": id, "success": true }),
                    Err(e) => json!({ "device": id, "error": e.as_str() }),
                };
                send_reply(reply, json!({ "wifi": { "hotspot": { "config": result } } })).await;
            }
            other => debug!(cmd = other, "WS: unknown hotspot command"),
        }
    }
}

async fn handle_modems(state: &AppState, body: &Value, reply: &mpsc::Sender<Value>) {
    let Some(cmds) = body.as_object() else { return };
    for (cmd, arg) in cmds {
        let Some(id) = device_id(arg) else { continue };
        match cmd.as_str() {
            "scan" => state.modems.scan(id).await,
            "config" => {
                let req: ModemConfigRequest = match serde_json::from_value(arg.clone()) {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("WS: malformed modem config: {e}");
                        continue;
                    }
                };
                let result = match state.modems.config(id, &req).await {
                    Ok(()) => json!({ "device": id, "success": true }),
                    Err(e) => json!({ "device": id, "error": e.as_str() }),
                };
                send_reply(reply, json!({ "modems": { "config": result } })).await;
            }
            other => debug!(cmd = other, "WS: unknown modems command"),
        }
    }
}

async fn handle_config(state: &AppState, body: &Value, reply: &mpsc::Sender<Value>) {
    let Some(key) = body.get("remote_key").and_then(Value::as_str) else {
        return;
    };
    let key = Some(key.trim().to_string()).filter(|k| !k.is_empty());
    let view = {
        let mut store = state.stream_config.lock().await;
        let saved = store.update(|cfg| cfg.remote_key.clone_from(&key)).await;
        match saved {
            Ok(_) => store.get().status_message(),
            Err(e) => {
                warn!("Config: saving remote key failed: {e}");
                send_reply(reply, json!({ "config": { "error": "saving" } })).await;
                return;
            }
        }
    };
    info!("Config: remote key {}", if key.is_some() { "set" } else { "cleared" });
    let _ = state.events.send(json!({ "config": view }));
    state.remote_key.send_replace(key);
}
