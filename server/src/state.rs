//! Shared application state passed to every handler via Axum's `State` extractor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::{broadcast, watch, Mutex};

use crate::config::Config;
use crate::modems::mmcli::Mmcli;
use crate::modems::ModemController;
use crate::netif::DeviceList;
use crate::nmcli::Nmcli;
use crate::remote::relays::{RelayCache, Relays};
use crate::stream_config::StreamConfigStore;
use crate::tool::SharedRunner;
use crate::wifi::WifiManager;

/// Shared application state for the encoder control daemon.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// UI broadcast channel. Every WebSocket session and the relay client
    /// (while authenticated) receive everything sent here.
    pub events: broadcast::Sender<Value>,
    pub runner: SharedRunner,
    pub netif: Arc<Mutex<DeviceList>>,
    pub wifi: WifiManager,
    pub modems: ModemController,
    pub relays: Relays,
    pub stream_config: Arc<Mutex<StreamConfigStore>>,
    /// Current remote key; the relay client reconnects when it changes.
    pub remote_key: Arc<watch::Sender<Option<String>>>,
    pub remote_stats: Arc<RemoteStats>,
}

impl AppState {
    /// Build the state and load persisted stores from the data directory.
    pub async fn new(config: Config, runner: SharedRunner) -> Result<Self, String> {
        let data_dir = config.data_dir();
        let (events, _) = broadcast::channel(256);

        let stream_config = StreamConfigStore::load(&data_dir.join("config.json")).await?;
        let remote_key = stream_config.get().remote_key.clone();
        let stream_config = Arc::new(Mutex::new(stream_config));
        let relays = Relays::new(
            RelayCache::load(&data_dir.join("relays_cache.json")).await,
            stream_config.clone(),
            events.clone(),
        );

        let nm = Nmcli::new(runner.clone(), &config.tools.nmcli);
        let mmcli = Mmcli::new(runner.clone(), &config.tools.mmcli);
        let (key_tx, _) = watch::channel(remote_key);

        Ok(Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            wifi: WifiManager::new(nm.clone(), events.clone()),
            modems: ModemController::new(mmcli, nm, events.clone()),
            events,
            runner,
            netif: Arc::new(Mutex::new(DeviceList::new())),
            relays,
            stream_config,
            remote_key: Arc::new(key_tx),
            remote_stats: Arc::new(RemoteStats::new()),
        })
    }
}

/// Relay connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RemoteState {
    Disconnected = 0,
    Connecting = 1,
    Authenticated = 2,
}

impl RemoteState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Authenticated,
            _ => Self::Disconnected,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticated => "authenticated",
        }
    }
}

/// Last error surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    Network,
    Key,
}

impl RemoteErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Key => "key",
        }
    }
}

/// Relay connection event types.
#[derive(Clone, Debug)]
pub enum RemoteEventType {
    Connected,
    Disconnected,
    AuthRejected,
    ActivityTimeout,
    ConnectFailed,
}

impl RemoteEventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::AuthRejected => "auth_rejected",
            Self::ActivityTimeout => "activity_timeout",
            Self::ConnectFailed => "connect_failed",
        }
    }
}

/// A relay lifecycle event for observability.
#[derive(Clone, Debug)]
pub struct ConnectionEvent {
    pub timestamp: Instant,
    pub event_type: RemoteEventType,
    pub detail: String,
}

/// Maximum number of recent events to retain.
const MAX_REMOTE_EVENTS: usize = 50;

const ERROR_NONE: u8 = 0;
const ERROR_NETWORK: u8 = 1;
const ERROR_KEY: u8 = 2;

/// Relay connection statistics. Atomics for the hot path, a Mutex only for
/// the event log.
pub struct RemoteStats {
    state: AtomicU8,
    last_error: AtomicU8,
    pub reconnects: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    /// Current connection was made with cached DNS results.
    pub dns_from_cache: AtomicBool,
    /// A gateway refresh command is running.
    pub gateway_refresh_running: AtomicBool,
    /// Epoch for computing relative timestamps in events.
    pub epoch: Instant,
    pub events: Mutex<VecDeque<ConnectionEvent>>,
}

impl RemoteStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RemoteState::Disconnected as u8),
            last_error: AtomicU8::new(ERROR_NONE),
            reconnects: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            dns_from_cache: AtomicBool::new(false),
            gateway_refresh_running: AtomicBool::new(false),
            epoch: Instant::now(),
            events: Mutex::new(VecDeque::with_capacity(MAX_REMOTE_EVENTS)),
        }
    }

    pub fn state(&self) -> RemoteState {
        RemoteState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: RemoteState) {
        self.state.store(state as u8, Ordering::Relaxed);
        if state == RemoteState::Authenticated {
            self.last_error.store(ERROR_NONE, Ordering::Relaxed);
        }
    }

    pub fn set_error(&self, kind: RemoteErrorKind) {
        let v = match kind {
            RemoteErrorKind::Network => ERROR_NETWORK,
            RemoteErrorKind::Key => ERROR_KEY,
        };
        self.last_error.store(v, Ordering::Relaxed);
    }

    pub fn last_error(&self) -> Option<RemoteErrorKind> {
        match self.last_error.load(Ordering::Relaxed) {
            ERROR_NETWORK => Some(RemoteErrorKind::Network),
            ERROR_KEY => Some(RemoteErrorKind::Key),
            _ => None,
        }
    }

    /// UI view: `true` when authenticated, otherwise the last error if any.
    pub fn status_message(&self) -> Value {
        if self.state() == RemoteState::Authenticated {
            return json!(true);
        }
        match self.last_error() {
            Some(kind) => json!({ "error": kind.as_str() }),
            None => json!(false),
        }
    }

    /// Push a connection event, evicting oldest if at capacity.
    pub async fn push_event(&self, event_type: RemoteEventType, detail: String) {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_REMOTE_EVENTS {
            events.pop_front();
        }
        events.push_back(ConnectionEvent {
            timestamp: Instant::now(),
            event_type,
            detail,
        });
    }
}

impl Default for RemoteStats {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_message_reflects_state() {
        let stats = RemoteStats::new();
        assert_eq!(stats.status_message(), json!(false));
        stats.set_error(RemoteErrorKind::Key);
        assert_eq!(stats.status_message(), json!({"error": "key"}));
        stats.set_state(RemoteState::Authenticated);
        assert_eq!(stats.status_message(), json!(true));
        stats.set_state(RemoteState::Disconnected);
        assert_eq!(stats.status_message(), json!(false));
    }

    #[tokio::test]
    async fn test_event_ring_is_bounded() {
        let stats = RemoteStats::new();
        for i in 0..(MAX_REMOTE_EVENTS + 5) {
            stats
                .push_event(RemoteEventType::ConnectFailed, i.to_string())
                .await;
        }
        let events = stats.events.lock().await;
        assert_eq!(events.len(), MAX_REMOTE_EVENTS);
        assert_eq!(events.front().unwrap().detail, "5");
    }
}
