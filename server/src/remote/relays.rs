//! Relay routing data pushed by the cloud relay.
//!
//! The relay re-sends the full server/account list on every connect and
//! whenever it changes, so most pushes are identical to what is cached.
//! Only a validated, structurally different payload is written to disk and
//! broadcast. Ingest keys and server addresses stay on the device.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::stream_config::{StreamConfig, StreamConfigStore};
use crate::util::{read_json, write_json};

/// Server types this device can stream to.
const SERVER_TYPES: &[&str] = &["srtla"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayServer {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub addr: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAccount {
    pub name: String,
    pub ingest_key: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayData {
    #[serde(default)]
    pub servers: BTreeMap<String, RelayServer>,
    #[serde(default)]
    pub accounts: BTreeMap<String, RelayAccount>,
}

impl RelayData {
    /// UI view: names and flags only.
    pub fn status_message(&self) -> Value {
        let servers: Map<String, Value> = self
            .servers
            .iter()
            .map(|(id, s)| {
                let mut v = json!({ "name": s.name });
                if s.default {
                    v["default"] = json!(true);
                }
                (id.clone(), v)
            })
            .collect();
        let accounts: Map<String, Value> = self
            .accounts
            .iter()
            .map(|(id, a)| {
                let mut v = json!({ "name": a.name });
                if a.disabled {
                    v["disabled"] = json!(true);
                }
                (id.clone(), v)
            })
            .collect();
        json!({ "servers": servers, "accounts": accounts })
    }
}

fn non_empty_str(v: &Value) -> Option<String> {
    v.as_str().filter(|s| !s.is_empty()).map(ToString::to_string)
}

/// Ports arrive as numbers or numeric strings.
fn parse_port(v: &Value) -> Option<u16> {
    let n = match v {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    u16::try_from(n).ok().filter(|p| *p != 0)
}

fn parse_server(v: &Value) -> Option<RelayServer> {
    let kind = non_empty_str(&v["type"]).filter(|t| SERVER_TYPES.contains(&t.as_str()))?;
    Some(RelayServer {
        kind,
        name: non_empty_str(&v["name"])?,
        addr: non_empty_str(&v["addr"])?,
        port: parse_port(&v["port"])?,
        default: v["default"].as_bool().unwrap_or(false),
    })
}

fn parse_account(v: &Value) -> Option<RelayAccount> {
    Some(RelayAccount {
        name: non_empty_str(&v["name"])?,
        ingest_key: non_empty_str(&v["ingest_key"])?,
        disabled: v["disabled"].as_bool().unwrap_or(false),
    })
}

/// Validate a pushed payload, dropping malformed entries one by one.
///
/// Fails only when no valid server remains.
pub fn validate(payload: &Value) -> Result<RelayData, String> {
    let mut data = RelayData::default();
    if let Some(servers) = payload["servers"].as_object() {
        for (id, v) in servers {
            match parse_server(v) {
                Some(s) => {
                    data.servers.insert(id.clone(), s);
                }
                None => debug!("Relays: dropping invalid server {id}"),
            }
        }
    }
    if let Some(accounts) = payload["accounts"].as_object() {
        for (id, v) in accounts {
            match parse_account(v) {
                Some(a) => {
                    data.accounts.insert(id.clone(), a);
                }
                None => debug!("Relays: dropping invalid account {id}"),
            }
        }
    }
    if data.servers.is_empty() {
        return Err("no valid relay servers".to_string());
    }
    Ok(data)
}

/// Point a manually configured relay at cached entries, by id.
///
/// Only ever moves from manual values to ids. Returns whether `cfg` changed.
pub fn migrate_stream_config(cfg: &mut StreamConfig, data: &RelayData) -> bool {
    let mut changed = false;
    if cfg.relay_server.is_none() {
        if let (Some(addr), Some(port)) = (&cfg.srtla_addr, cfg.srtla_port) {
            if let Some((id, _)) = data
                .servers
                .iter()
                .find(|(_, s)| s.addr == *addr && s.port == port)
            {
                info!("Relays: migrating manual relay {addr}:{port} to server {id}");
                cfg.relay_server = Some(id.clone());
                cfg.srtla_addr = None;
                cfg.srtla_port = None;
                changed = true;
            }
        }
    }
    if cfg.relay_account.is_none() {
        if let Some(streamid) = &cfg.srt_streamid {
            if let Some((id, _)) = data.accounts.iter().find(|(_, a)| a.ingest_key == *streamid) {
                info!("Relays: migrating manual stream id to account {id}");
                cfg.relay_account = Some(id.clone());
                cfg.srt_streamid = None;
                changed = true;
            }
        }
    }
    changed
}

/// Disk-backed cache. A missing or unreadable file starts empty.
#[derive(Debug)]
pub struct RelayCache {
    path: PathBuf,
    data: RelayData,
}

impl RelayCache {
    pub async fn load(path: &Path) -> Self {
        let data = match read_json::<RelayData>(path).await {
            Ok(Some(data)) => {
                info!(
                    "Relays: loaded {} servers, {} accounts from cache",
                    data.servers.len(),
                    data.accounts.len()
                );
                data
            }
            Ok(None) => RelayData::default(),
            Err(e) => {
                warn!("Relays: ignoring cache: {e}");
                RelayData::default()
            }
        };
        Self {
            path: path.to_path_buf(),
            data,
        }
    }

    pub fn data(&self) -> &RelayData {
        &self.data
    }

    /// Replace the cache. Returns `false` (no write) when nothing changed.
    pub async fn update(&mut self, data: RelayData) -> Result<bool, String> {
        if data == self.data {
            return Ok(false);
        }
        write_json(&self.path, &data).await?;
        self.data = data;
        Ok(true)
    }
}

/// Relay cache wired to the stream config and the UI event channel.
#[derive(Clone)]
pub struct Relays {
    cache: Arc<Mutex<RelayCache>>,
    stream_config: Arc<Mutex<StreamConfigStore>>,
    events: broadcast::Sender<Value>,
}

impl Relays {
    pub fn new(
        cache: RelayCache,
        stream_config: Arc<Mutex<StreamConfigStore>>,
        events: broadcast::Sender<Value>,
    ) -> Self {
        Self {
            cache: Arc::new(Mutex::new(cache)),
            stream_config,
            events,
        }
    }

    pub async fn status_message(&self) -> Value {
        self.cache.lock().await.data().status_message()
    }

    /// Handle a `{"relays": ...}` push. Returns whether the cache changed.
    pub async fn handle_push(&self, payload: &Value) -> Result<bool, String> {
        let data = validate(payload)?;
        let view = {
            let mut cache = self.cache.lock().await;
            if !cache.update(data).await? {
                return Ok(false);
            }
            cache.data().status_message()
        };
        info!("Relays: cache updated");
        let _ = self.events.send(json!({ "relays": view }));

        let data = self.cache.lock().await.data().clone();
        let mut store = self.stream_config.lock().await;
        let migrated = store
            .update(|cfg| {
                migrate_stream_config(cfg, &data);
            })
            .await;
        match migrated {
            Ok(true) => {
                let _ = self
                    .events
                    .send(json!({ "config": store.get().status_message() }));
            }
            Ok(false) => {}
            Err(e) => warn!("Relays: saving migrated stream config failed: {e}"),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Value {
        json!({
            "servers": {
                "s1": {"type": "srtla", "name": "US East", "addr": "relay1.example.net", "port": 5000, "default": true},
                "s2": {"type": "srtla", "name": "EU", "addr": "relay2.example.net", "port": "5001"},
                "bad_type": {"type": "rtmp", "name": "X", "addr": "x", "port": 1},
                "bad_port": {"type": "srtla", "name": "Y", "addr": "y", "port": 70000},
                "no_addr": {"type": "srtla", "name": "Z", "port": 5000}
            },
            "accounts": {
                "a1": {"name": "Main", "ingest_key": "key-1"},
                "a2": {"name": "Old", "ingest_key": "key-2", "disabled": true},
                "a3": {"name": "Broken"}
            }
        })
    }

    async fn relays(dir: &Path) -> (Relays, broadcast::Receiver<Value>) {
        let (tx, rx) = broadcast::channel(16);
        let cache = RelayCache::load(&dir.join("relays_cache.json")).await;
        let store = StreamConfigStore::load(&dir.join("config.json")).await.unwrap();
        (Relays::new(cache, Arc::new(Mutex::new(store)), tx), rx)
    }

    #[test]
    fn test_validate_drops_bad_entries() {
        let data = validate(&payload()).unwrap();
        assert_eq!(data.servers.len(), 2);
        assert_eq!(data.servers["s2"].port, 5001);
        assert_eq!(data.accounts.len(), 2);
    }

    #[test]
    fn test_validate_rejects_zero_servers() {
        let p = json!({"servers": {"x": {"type": "srtla", "name": "X"}}, "accounts": {}});
        assert!(validate(&p).is_err());
        assert!(validate(&json!({})).is_err());
    }

    #[test]
    fn test_status_message_hides_secrets() {
        let view = validate(&payload()).unwrap().status_message();
        assert_eq!(view["servers"]["s1"], json!({"name": "US East", "default": true}));
        assert_eq!(view["accounts"]["a2"], json!({"name": "Old", "disabled": true}));
        assert!(!view.to_string().contains("key-1"));
        assert!(!view.to_string().contains("relay1.example.net"));
    }

    #[tokio::test]
    async fn test_identical_update_writes_and_broadcasts_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relays_cache.json");
        let (relays, mut rx) = relays(dir.path()).await;

        assert!(relays.handle_push(&payload()).await.unwrap());
        assert!(path.exists());
        std::fs::remove_file(&path).unwrap();

        assert!(!relays.handle_push(&payload()).await.unwrap());
        assert!(!path.exists());

        let mut broadcasts = 0;
        while let Ok(msg) = rx.try_recv() {
            if msg.get("relays").is_some() {
                broadcasts += 1;
            }
        }
        assert_eq!(broadcasts, 1);
    }

    #[tokio::test]
    async fn test_cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relays_cache.json");
        let mut cache = RelayCache::load(&path).await;
        assert!(cache.data().servers.is_empty());
        cache.update(validate(&payload()).unwrap()).await.unwrap();

        let reloaded = RelayCache::load(&path).await;
        assert_eq!(reloaded.data(), cache.data());
    }

    #[tokio::test]
    async fn test_invalid_push_leaves_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (relays, mut rx) = relays(dir.path()).await;
        assert!(relays.handle_push(&json!({"servers": {}})).await.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_migration_is_one_way() {
        let data = validate(&payload()).unwrap();
        let mut cfg = StreamConfig {
            srtla_addr: Some("relay2.example.net".into()),
            srtla_port: Some(5001),
            srt_streamid: Some("key-1".into()),
            ..Default::default()
        };
        assert!(migrate_stream_config(&mut cfg, &data));
        assert_eq!(cfg.relay_server.as_deref(), Some("s2"));
        assert_eq!(cfg.relay_account.as_deref(), Some("a1"));
        assert!(cfg.srtla_addr.is_none());
        assert!(cfg.srt_streamid.is_none());

        // Already referencing ids: nothing to do.
        assert!(!migrate_stream_config(&mut cfg, &data));

        let mut unmatched = StreamConfig {
            srtla_addr: Some("10.0.0.1".into()),
            srtla_port: Some(5000),
            ..Default::default()
        };
        assert!(!migrate_stream_config(&mut unmatched, &data));
        assert_eq!(unmatched.srtla_addr.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_push_migrates_stream_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"srtla_addr": "relay1.example.net", "srtla_port": 5000}"#,
        )
        .unwrap();
        let (relays, _rx) = relays(dir.path()).await;
        relays.handle_push(&payload()).await.unwrap();

        let raw: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("config.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(raw["relay_server"], "s1");
    }
}
