//! Relay client: outbound WebSocket from the encoder to the cloud relay.
//!
//! Spawned on startup when `[remote]` is configured. One connection attempt
//! at a time; the loop below is the whole state machine:
//!
//! - no key: idle until one is set
//! - key rejected: report `key` and idle until the key changes
//! - anything else: report `network` and retry after `retry_delay_ms`
//!
//! While authenticated, relay frames are dispatched like UI messages (their
//! replies go back to the relay) and every UI broadcast is forwarded.

use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dns::DnsCache;
use super::{RemoteError, PROTOCOL_VERSION};
use crate::config::RemoteConfig;
use crate::state::{RemoteErrorKind, RemoteEventType, RemoteState};
use crate::status::envelope;
use crate::AppState;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// How often the liveness check runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn the relay client task. Runs until `shutdown` is cancelled.
pub fn spawn(
    state: AppState,
    config: RemoteConfig,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(remote_client_loop(state, config, shutdown))
}

/// Reason a connection ended without an error.
#[derive(Debug, PartialEq, Eq)]
enum DisconnectReason {
    Shutdown,
    KeyChanged,
}

async fn remote_client_loop(state: AppState, config: RemoteConfig, shutdown: CancellationToken) {
    let stats = state.remote_stats.clone();
    let mut key_rx = state.remote_key.subscribe();
    let mut dns = DnsCache::load(&state.config.data_dir().join("dns_cache.json")).await;
    let retry_delay = Duration::from_millis(config.retry_delay_ms);
    let mut attempts: u64 = 0;

    loop {
        let key = key_rx
            .borrow_and_update()
            .clone()
            .filter(|k| !k.is_empty());
        let Some(key) = key else {
            debug!("Remote: no key set, waiting");
            if !wait_for_key_change(&mut key_rx, &shutdown).await {
                break;
            }
            continue;
        };

        if attempts > 0 {
            stats.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        attempts += 1;
        stats.set_state(RemoteState::Connecting);
        info!("Remote: connecting to {}", config.url());

        let result = connect_and_run(&state, &config, &mut dns, &key, &mut key_rx, &shutdown).await;
        let was_authenticated = stats.state() == RemoteState::Authenticated;
        stats.set_state(RemoteState::Disconnected);

        match result {
            Ok(DisconnectReason::Shutdown) => {
                info!("Remote: shutting down");
                break;
            }
            Ok(DisconnectReason::KeyChanged) => {
                info!("Remote: key changed, reconnecting");
                stats
                    .push_event(RemoteEventType::Disconnected, "key changed".to_string())
                    .await;
                broadcast_status(&state);
            }
            Err(RemoteError::Key) => {
                warn!("Remote: key rejected by relay");
                stats.set_error(RemoteErrorKind::Key);
                stats
                    .push_event(RemoteEventType::AuthRejected, String::new())
                    .await;
                broadcast_status(&state);
                if !wait_for_key_change(&mut key_rx, &shutdown).await {
                    break;
                }
            }
            Err(e) => {
                warn!(
                    "Remote: {e}, retrying in {}ms",
                    retry_delay.as_millis()
                );
                stats.set_error(RemoteErrorKind::Network);
                let event = if was_authenticated {
                    RemoteEventType::Disconnected
                } else {
                    RemoteEventType::ConnectFailed
                };
                stats.push_event(event, e.to_string()).await;
                broadcast_status(&state);
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(retry_delay) => {}
                }
            }
        }
    }
    stats.set_state(RemoteState::Disconnected);
}

/// Returns `false` when the client should stop.
async fn wait_for_key_change(
    key_rx: &mut watch::Receiver<Option<String>>,
    shutdown: &CancellationToken,
) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        changed = key_rx.changed() => changed.is_ok(),
    }
}

fn broadcast_status(state: &AppState) {
    let _ = state
        .events
        .send(envelope("remote", state.remote_stats.status_message()));
}

/// Outcome of the relay's reply to the auth handshake.
fn auth_result(msg: &Value) -> Option<Result<(), RemoteError>> {
    let remote = msg.get("remote")?;
    let auth = remote.get("auth/encoder")?;
    if auth.as_bool() == Some(true) {
        return Some(Ok(()));
    }
    match remote.get("error").and_then(Value::as_str) {
        Some("version") => Some(Err(RemoteError::Protocol(format!(
            "relay rejected protocol version {PROTOCOL_VERSION}"
        )))),
        _ => Some(Err(RemoteError::Key)),
    }
}

/// A single connection: resolve, connect, authenticate, then serve frames
/// until something ends it.
#[allow(clippy::too_many_lines)]
async fn connect_and_run(
    state: &AppState,
    config: &RemoteConfig,
    dns: &mut DnsCache,
    key: &str,
    key_rx: &mut watch::Receiver<Option<String>>,
    shutdown: &CancellationToken,
) -> Result<DisconnectReason, RemoteError> {
    let stats = &state.remote_stats;
    let resolved = dns
        .resolve(&config.host, Duration::from_secs(config.dns_timeout_secs))
        .await
        .map_err(RemoteError::Network)?;
    stats
        .dns_from_cache
        .store(resolved.from_cache, Ordering::Relaxed);
    if resolved.from_cache {
        spawn_gateway_refresh(state, config);
    }
    let addr: IpAddr = resolved
        .pick()
        .ok_or_else(|| RemoteError::Network("no relay addresses".to_string()))?;

    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
    let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect((addr, config.port)))
        .await
        .map_err(|_| RemoteError::Network(format!("connect to {addr} timed out")))?
        .map_err(|e| RemoteError::Network(format!("connect to {addr}: {e}")))?;
    let (ws, _response) = tokio::time::timeout(
        connect_timeout,
        tokio_tungstenite::client_async_tls(config.url(), tcp),
    )
    .await
    .map_err(|_| RemoteError::Network("websocket handshake timed out".to_string()))?
    .map_err(|e| RemoteError::Network(e.to_string()))?;
    debug!(%addr, from_cache = resolved.from_cache, "Remote: socket open, authenticating");

    let (mut sink, mut stream) = ws.split();
    let auth = json!({"remote": {"auth/encoder": {"key": key, "version": PROTOCOL_VERSION}}});
    send_json(&mut sink, state, &auth).await?;

    let (reply_tx, mut reply_rx) = mpsc::channel::<Value>(64);
    let mut events_rx: Option<broadcast::Receiver<Value>> = None;
    let mut authenticated = false;
    let mut last_activity = Instant::now();
    let activity_timeout = Duration::from_secs(config.activity_timeout_secs);
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    let mut keepalive = tokio::time::interval(Duration::from_secs(config.keepalive_secs.max(1)));

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(DisconnectReason::Shutdown);
            }
            changed = key_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                if changed.is_err() {
                    return Ok(DisconnectReason::Shutdown);
                }
                return Ok(DisconnectReason::KeyChanged);
            }
            msg = stream.next() => {
                let Some(msg) = msg else {
                    return Err(RemoteError::Network("connection closed".to_string()));
                };
                let msg = msg.map_err(|e| RemoteError::Network(e.to_string()))?;
                last_activity = Instant::now();
                stats.messages_received.fetch_add(1, Ordering::Relaxed);
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => {
                        return Err(RemoteError::Network("closed by relay".to_string()));
                    }
                    _ => continue,
                };
                let parsed: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("Remote: ignoring malformed frame: {e}");
                        continue;
                    }
                };

                if !authenticated {
                    match auth_result(&parsed) {
                        Some(Ok(())) => {}
                        Some(Err(e)) => return Err(e),
                        None => continue,
                    }
                    authenticated = true;
                    stats.set_state(RemoteState::Authenticated);
                    if !resolved.from_cache {
                        dns.validate(&config.host).await;
                    }
                    info!(%addr, "Remote: authenticated");
                    stats.push_event(RemoteEventType::Connected, addr.to_string()).await;
                    broadcast_status(state);
                    events_rx = Some(state.events.subscribe());
                    for snapshot in crate::ws::initial_messages(state).await {
                        send_json(&mut sink, state, &snapshot).await?;
                    }
                    keepalive.reset();
                    continue;
                }

                if let Some(remote) = parsed.get("remote") {
                    if let Some(relays) = remote.get("relays") {
                        if let Err(e) = state.relays.handle_push(relays).await {
                            warn!("Remote: rejected relays payload: {e}");
                        }
                    }
                    for key in unhandled_remote_keys(remote) {
                        debug!("Remote: ignoring unhandled remote message: {key}");
                    }
                    continue;
                }
                let state = state.clone();
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    crate::ws::handle_message(&state, parsed, &reply_tx).await;
                });
            }
            Some(reply) = reply_rx.recv() => {
                send_json(&mut sink, state, &reply).await?;
            }
            event = next_event(&mut events_rx) => match event {
                Ok(msg) => send_json(&mut sink, state, &msg).await?,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Remote: dropped {n} broadcasts while the relay was slow");
                }
                Err(broadcast::error::RecvError::Closed) => events_rx = None,
            },
            _ = keepalive.tick(), if authenticated => {
                send_json(&mut sink, state, &json!({"keepalive": null})).await?;
            }
            _ = sweep.tick() => {
                if last_activity.elapsed() >= activity_timeout {
                    stats
                        .push_event(
                            RemoteEventType::ActivityTimeout,
                            format!("{}s", activity_timeout.as_secs()),
                        )
                        .await;
                    let _ = sink.send(Message::Close(None)).await;
                    return Err(RemoteError::Network(format!(
                        "no activity for {}s",
                        activity_timeout.as_secs()
                    )));
                }
            }
        }
    }
}

/// Keys of a relay `remote` frame this client does not act on once
/// authenticated. A non-object payload reports as `<non-object>`.
fn unhandled_remote_keys(remote: &Value) -> Vec<&str> {
    match remote.as_object() {
        Some(obj) => obj
            .keys()
            .map(String::as_str)
            .filter(|k| !matches!(*k, "relays" | "auth/encoder"))
            .collect(),
        None => vec!["<non-object>"],
    }
}

/// Next UI broadcast, or never while not subscribed.
async fn next_event(
    rx: &mut Option<broadcast::Receiver<Value>>,
) -> Result<Value, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn send_json(sink: &mut WsSink, state: &AppState, msg: &Value) -> Result<(), RemoteError> {
    sink.send(Message::Text(msg.to_string().into()))
        .await
        .map_err(|e| RemoteError::Network(e.to_string()))?;
    state
        .remote_stats
        .messages_sent
        .fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Cached DNS answers usually mean the uplink changed under us; flush the
/// route cache so the kernel picks the new gateway. At most one runs.
fn spawn_gateway_refresh(state: &AppState, config: &RemoteConfig) {
    let Some((program, args)) = config.gateway_refresh_cmd.split_first() else {
        return;
    };
    let stats = state.remote_stats.clone();
    if stats.gateway_refresh_running.swap(true, Ordering::AcqRel) {
        debug!("Remote: gateway refresh already running");
        return;
    }
    let runner = state.runner.clone();
    let program = program.clone();
    let args = args.to_vec();
    tokio::spawn(async move {
        match runner.run(&program, &args).await {
            Ok(_) => info!("Remote: gateway refresh done"),
            Err(e) => warn!("Remote: gateway refresh failed: {e}"),
        }
        stats.gateway_refresh_running.store(false, Ordering::Release);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::state_in;
    use crate::tool::testing::ScriptedRunner;
    use tokio::net::TcpListener;

    fn local_config(port: u16) -> RemoteConfig {
        let mut config = RemoteConfig::new("127.0.0.1");
        config.port = port;
        config.tls = false;
        config.activity_timeout_secs = 3;
        config
    }

    #[test]
    fn test_auth_result() {
        assert_eq!(
            auth_result(&json!({"remote": {"auth/encoder": true}})),
            Some(Ok(()))
        );
        assert_eq!(
            auth_result(&json!({"remote": {"auth/encoder": false}})),
            Some(Err(RemoteError::Key))
        );
        assert!(matches!(
            auth_result(&json!({"remote": {"auth/encoder": false, "error": "version"}})),
            Some(Err(RemoteError::Protocol(_)))
        ));
        assert_eq!(auth_result(&json!({"keepalive": null})), None);
    }

    #[test]
    fn test_unhandled_remote_keys() {
        assert!(unhandled_remote_keys(&json!({"relays": {}})).is_empty());
        assert_eq!(
            unhandled_remote_keys(&json!({"relays": {}, "bitrate": 5})),
            vec!["bitrate"]
        );
        assert_eq!(unhandled_remote_keys(&json!("hello")), vec!["<non-object>"]);
    }

    async fn recorded_events(state: &AppState) -> Vec<&'static str> {
        state
            .remote_stats
            .events
            .lock()
            .await
            .iter()
            .map(|e| e.event_type.as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_silent_relay_times_out_then_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path(), ScriptedRunner::new()).await;
        state.remote_key.send_replace(Some("good-key".to_string()));

        // Authenticates every connection, then never says anything again.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (accepted_tx, mut accepted_rx) = mpsc::channel::<Instant>(8);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let accepted_tx = accepted_tx.clone();
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    let _auth = ws.next().await;
                    let reply = json!({"remote": {"auth/encoder": true}});
                    ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                    let _ = accepted_tx.send(Instant::now()).await;
                    while ws.next().await.is_some() {}
                });
            }
        });

        let mut config = local_config(port);
        config.activity_timeout_secs = 2;
        config.keepalive_secs = 1;
        config.retry_delay_ms = 1000;
        let shutdown = CancellationToken::new();
        let handle = spawn(state.clone(), config, shutdown.clone());

        let first = tokio::time::timeout(Duration::from_secs(5), accepted_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(8), accepted_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let gap = second - first;
        // Timeout (checked once a second) plus the retry delay.
        assert!(gap >= Duration::from_millis(2900), "{gap:?}");
        assert!(gap < Duration::from_millis(4500), "{gap:?}");

        let events = recorded_events(&state).await;
        assert_eq!(
            &events[..3],
            ["connected", "activity_timeout", "disconnected"]
        );
        assert_eq!(state.remote_stats.reconnects.load(Ordering::Relaxed), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection_retried_at_constant_delay() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path(), ScriptedRunner::new()).await;
        state.remote_key.send_replace(Some("good-key".to_string()));
        let mut events = state.events.subscribe();

        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let shutdown = CancellationToken::new();
        let handle = spawn(state.clone(), local_config(port), shutdown.clone());

        // Every failed attempt publishes the remote status once.
        let mut failures = Vec::new();
        tokio::time::timeout(Duration::from_secs(6), async {
            while failures.len() < 4 {
                let msg = events.recv().await.unwrap();
                if msg["status"]["remote"] == json!({"error": "network"}) {
                    failures.push(Instant::now());
                }
            }
        })
        .await
        .unwrap();

        for pair in failures.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_millis(900), "{gap:?}");
            assert!(gap < Duration::from_millis(1500), "{gap:?}");
        }
        assert!(recorded_events(&state)
            .await
            .iter()
            .all(|e| *e == "connect_failed"));
        assert_eq!(state.remote_stats.state(), RemoteState::Disconnected);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_key_rejection_waits_for_new_key() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path(), ScriptedRunner::new()).await;
        state.remote_key.send_replace(Some("bad-key".to_string()));
        let mut events = state.events.subscribe();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (auth_tx, mut auth_rx) = mpsc::channel::<Value>(4);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let auth_tx = auth_tx.clone();
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    if let Some(Ok(Message::Text(t))) = ws.next().await {
                        auth_tx.send(serde_json::from_str(&t).unwrap()).await.unwrap();
                    }
                    let reply = json!({"remote": {"auth/encoder": false}});
                    ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                    while ws.next().await.is_some() {}
                });
            }
        });

        let shutdown = CancellationToken::new();
        let handle = spawn(state.clone(), local_config(port), shutdown.clone());

        let auth = auth_rx.recv().await.unwrap();
        assert_eq!(auth["remote"]["auth/encoder"]["key"], "bad-key");
        assert_eq!(auth["remote"]["auth/encoder"]["version"], PROTOCOL_VERSION);

        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let msg = events.recv().await.unwrap();
                if msg["status"]["remote"].is_object() {
                    return msg;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(status["status"]["remote"]["error"], "key");

        // No retry with the same key.
        let again = tokio::time::timeout(Duration::from_millis(2500), auth_rx.recv()).await;
        assert!(again.is_err());

        state.remote_key.send_replace(Some("new-key".to_string()));
        let auth = tokio::time::timeout(Duration::from_secs(5), auth_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(auth["remote"]["auth/encoder"]["key"], "new-key");

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_authenticated_session_sends_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path(), ScriptedRunner::new()).await;
        state.remote_key.send_replace(Some("good-key".to_string()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (frames_tx, mut frames_rx) = mpsc::channel::<Value>(64);
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _auth = ws.next().await;
            let reply = json!({"remote": {"auth/encoder": true}});
            ws.send(Message::Text(reply.to_string().into())).await.unwrap();
            while let Some(Ok(Message::Text(t))) = ws.next().await {
                if frames_tx.send(serde_json::from_str(&t).unwrap()).await.is_err() {
                    break;
                }
            }
        });

        let shutdown = CancellationToken::new();
        let handle = spawn(state.clone(), local_config(port), shutdown.clone());

        let mut saw_relays = false;
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(frame) = frames_rx.recv().await {
                if frame.get("relays").is_some() {
                    saw_relays = true;
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert!(saw_relays);
        assert_eq!(state.remote_stats.state(), RemoteState::Authenticated);

        // UI broadcasts are forwarded while authenticated.
        let _ = state.events.send(json!({"status": {"netif": {}}}));
        let forwarded = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frame = frames_rx.recv().await.unwrap();
                if frame == json!({"status": {"netif": {}}}) {
                    return frame;
                }
            }
        })
        .await;
        assert!(forwarded.is_ok());

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(state.remote_stats.state(), RemoteState::Disconnected);
    }
}
