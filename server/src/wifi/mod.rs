//! WiFi state store and client-mode operations.
//!
//! [`WifiStore`] owns one [`WifiInterface`] per MAC address and is rebuilt
//! from three independent NetworkManager queries:
//!
//! - `device show` → interface set, active connection, capabilities
//! - `connection show` → saved client profiles and hotspot profiles
//! - `device wifi list` → visible networks, replaced wholesale per interface
//!
//! [`WifiManager`] wraps the store with the tool calls and broadcasts
//! `{"status": {"wifi": ...}}` after state changes. The store lock is never
//! held across a tool call.
//!
//! Scan results arrive an unpredictable time after a rescan request, so a
//! rescan schedules refreshes at fixed delays instead of waiting on a single
//! completion signal. A newer rescan replaces the pending schedule.

pub mod hotspot;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::nmcli::{non_empty, Nmcli, ScanRow, WifiDevice, WIFI_TYPE};
use crate::tool::ToolError;
use hotspot::{Hotspot, HotspotProfile};

/// Delays after a rescan at which scan results are re-read and rebroadcast.
const SCAN_REFRESH_DELAYS_MS: [u64; 6] = [1000, 3000, 5000, 10_000, 15_000, 20_000];

/// Settings read from every saved WiFi profile.
const CONNECTION_FIELDS: &[&str] = &[
    "connection.interface-name",
    "802-11-wireless.ssid",
    "802-11-wireless.mode",
    "802-11-wireless.mac-address",
    "802-11-wireless.band",
    "802-11-wireless.channel",
    "802-11-wireless.hidden",
    "802-11-wireless-security.key-mgmt",
    "802-11-wireless-security.psk",
    "802-11-wireless-security.proto",
    "802-11-wireless-security.pairwise",
    "802-11-wireless-security.group",
    "802-11-wireless-security.pmf",
];

/// A visible network. Rebuilt from every scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WifiNetwork {
    pub active: bool,
    pub ssid: String,
    pub signal: u8,
    pub security: String,
    pub freq: u32,
}

#[derive(Debug, Clone)]
pub struct WifiInterface {
    /// Stable handle used on the wire instead of the MAC.
    pub id: u32,
    pub ifname: String,
    pub mac: String,
    /// UUID of the active connection.
    pub conn: Option<String>,
    pub hw: String,
    /// Visible networks keyed by SSID.
    pub available: HashMap<String, WifiNetwork>,
    /// Saved client profiles, SSID → UUID.
    pub saved: BTreeMap<String, String>,
    /// Present only when the adapter can run as an access point.
    pub hotspot: Option<Hotspot>,
}

impl WifiInterface {
    /// Whether the interface currently reports hotspot mode.
    pub fn is_hotspot(&self, now: Instant) -> bool {
        self.hotspot
            .as_ref()
            .is_some_and(|h| h.is_active(self.conn.as_deref(), now))
    }
}

/// A saved WiFi profile, classified by mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SavedConnection {
    Client {
        uuid: String,
        ssid: String,
        /// Interface binding; `None` means usable on any interface.
        mac: Option<String>,
    },
    Hotspot(HotspotProfile),
}

/// Classify one profile from its settings. Ad-hoc/mesh profiles are ignored.
pub fn classify_connection(uuid: &str, fields: &HashMap<String, String>) -> Option<SavedConnection> {
    let ssid = non_empty(fields.get("802-11-wireless.ssid"))?;
    let mode = non_empty(fields.get("802-11-wireless.mode"));
    match mode.as_deref() {
        Some("ap") => Some(SavedConnection::Hotspot(HotspotProfile::from_fields(
            uuid, &ssid, fields,
        ))),
        None | Some("infrastructure") => Some(SavedConnection::Client {
            uuid: uuid.to_string(),
            ssid,
            mac: non_empty(fields.get("802-11-wireless.mac-address"))
                .map(|m| m.to_ascii_lowercase()),
        }),
        Some(_) => None,
    }
}

/// All WiFi interfaces, keyed by MAC address.
#[derive(Debug, Default)]
pub struct WifiStore {
    interfaces: BTreeMap<String, WifiInterface>,
    /// MAC → id, kept after removal so a replugged adapter keeps its id.
    ids: HashMap<String, u32>,
    next_id: u32,
}

impl WifiStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn id_for(&mut self, mac: &str) -> u32 {
        if let Some(id) = self.ids.get(mac) {
            return *id;
        }
        self.next_id += 1;
        self.ids.insert(mac.to_string(), self.next_id);
        self.next_id
    }

    /// Insert or update the interface owning `dev.mac`. Returns whether
    /// anything visible changed.
    pub fn upsert_interface(&mut self, dev: &WifiDevice) -> bool {
        let id = self.id_for(&dev.mac);
        let Some(iface) = self.interfaces.get_mut(&dev.mac) else {
            info!("WiFi: new interface {} ({})", dev.ifname, dev.mac);
            let hotspot = dev.supports_ap.then(|| Hotspot::new(dev.supports_5ghz));
            self.interfaces.insert(
                dev.mac.clone(),
                WifiInterface {
                    id,
                    ifname: dev.ifname.clone(),
                    mac: dev.mac.clone(),
                    conn: dev.conn.clone(),
                    hw: dev.hw.clone(),
                    available: HashMap::new(),
                    saved: BTreeMap::new(),
                    hotspot,
                },
            );
            return true;
        };

        let mut changed = false;
        if iface.ifname != dev.ifname {
            iface.ifname.clone_from(&dev.ifname);
            changed = true;
        }
        if iface.hw != dev.hw {
            iface.hw.clone_from(&dev.hw);
            changed = true;
        }
        if iface.conn != dev.conn {
            debug!("WiFi: {} connection {:?} -> {:?}", iface.ifname, iface.conn, dev.conn);
            iface.conn.clone_from(&dev.conn);
            changed = true;
        }
        match (&mut iface.hotspot, dev.supports_ap) {
            (Some(h), true) => changed |= h.set_5ghz_support(dev.supports_5ghz),
            (Some(_), false) => {
                iface.hotspot = None;
                changed = true;
            }
            (None, true) => {
                iface.hotspot = Some(Hotspot::new(dev.supports_5ghz));
                changed = true;
            }
            (None, false) => {}
        }
        changed
    }

    pub fn remove_interface(&mut self, mac: &str) -> bool {
        match self.interfaces.remove(mac) {
            Some(iface) => {
                info!("WiFi: interface {} ({mac}) removed", iface.ifname);
                true
            }
            None => false,
        }
    }

    /// Upsert every device and drop interfaces no longer reported.
    pub fn sync_interfaces(&mut self, devices: &[WifiDevice]) -> bool {
        let mut changed = false;
        for dev in devices {
            changed |= self.upsert_interface(dev);
        }
        let gone: Vec<String> = self
            .interfaces
            .keys()
            .filter(|mac| !devices.iter().any(|d| &d.mac == *mac))
            .cloned()
            .collect();
        for mac in gone {
            changed |= self.remove_interface(&mac);
        }
        changed
    }

    /// Replace every interface's `available` map from one scan listing.
    ///
    /// One entry per SSID: an active row beats inactive duplicates, otherwise
    /// the strongest signal wins. Hidden networks (empty SSID) are skipped.
    pub fn update_scan_results(&mut self, rows: &[ScanRow]) -> bool {
        let mut changed = false;
        for iface in self.interfaces.values_mut() {
            let mut available: HashMap<String, WifiNetwork> = HashMap::new();
            for row in rows
                .iter()
                .filter(|r| r.ifname == iface.ifname && !r.ssid.is_empty())
            {
                let network = WifiNetwork {
                    active: row.active,
                    ssid: row.ssid.clone(),
                    signal: row.signal,
                    security: row.security.clone(),
                    freq: row.freq,
                };
                match available.get(&row.ssid) {
                    Some(existing)
                        if (existing.active && !network.active)
                            || (existing.active == network.active
                                && existing.signal >= network.signal) => {}
                    _ => {
                        available.insert(row.ssid.clone(), network);
                    }
                }
            }
            if iface.available != available {
                iface.available = available;
                changed = true;
            }
        }
        changed
    }

    /// Replace every interface's saved profiles and hotspot profile.
    pub fn update_saved_connections(&mut self, conns: &[SavedConnection]) -> bool {
        let mut changed = false;
        for iface in self.interfaces.values_mut() {
            let saved: BTreeMap<String, String> = conns
                .iter()
                .filter_map(|c| match c {
                    SavedConnection::Client { uuid, ssid, mac }
                        if mac.as_deref().is_none_or(|m| m == iface.mac) =>
                    {
                        Some((ssid.clone(), uuid.clone()))
                    }
                    _ => None,
                })
                .collect();
            if iface.saved != saved {
                iface.saved = saved;
                changed = true;
            }

            let Some(hotspot) = iface.hotspot.as_mut() else {
                continue;
            };
            let profiles: Vec<&HotspotProfile> = conns
                .iter()
                .filter_map(|c| match c {
                    SavedConnection::Hotspot(p) if p.belongs_to(&iface.mac, &iface.ifname) => {
                        Some(p)
                    }
                    _ => None,
                })
                .collect();
            // Prefer the profile that is currently active on the interface.
            let profile = profiles
                .iter()
                .find(|p| iface.conn.as_deref() == Some(p.uuid.as_str()))
                .or_else(|| profiles.first())
                .copied();
            changed |= match profile {
                Some(p) => hotspot.apply_profile(p),
                None => hotspot.clear_profile(),
            };
        }
        changed
    }

    pub fn by_id(&self, id: u32) -> Option<&WifiInterface> {
        self.interfaces.values().find(|i| i.id == id)
    }

    pub fn by_mac_mut(&mut self, mac: &str) -> Option<&mut WifiInterface> {
        self.interfaces.get_mut(mac)
    }

    /// Interface that has `uuid` as a saved client profile or its hotspot profile.
    pub fn by_connection(&self, uuid: &str) -> Option<&WifiInterface> {
        self.interfaces.values().find(|i| {
            i.saved.values().any(|u| u == uuid)
                || i.hotspot
                    .as_ref()
                    .is_some_and(|h| h.conn.as_deref() == Some(uuid))
        })
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// Wire view keyed by interface id.
    ///
    /// Interfaces in hotspot mode (forced or reported) carry `hotspot`
    /// fields; client-mode interfaces carry `available`, `saved` and
    /// `supports_hotspot`.
    pub fn build_status_message(&self, now: Instant) -> Value {
        let mut map = serde_json::Map::new();
        for iface in self.interfaces.values() {
            let mut obj = json!({
                "ifname": iface.ifname,
                "hw": iface.hw,
                "conn": iface.conn,
            });
            match iface.hotspot.as_ref() {
                Some(h) if h.is_active(iface.conn.as_deref(), now) => {
                    obj["hotspot"] = h.status_message();
                }
                _ => {
                    let mut available: Vec<&WifiNetwork> = iface.available.values().collect();
                    available.sort_by(|a, b| {
                        b.active
                            .cmp(&a.active)
                            .then(b.signal.cmp(&a.signal))
                            .then(a.ssid.cmp(&b.ssid))
                    });
                    obj["available"] = json!(available);
                    obj["saved"] = json!(iface.saved);
                    obj["supports_hotspot"] = json!(iface.hotspot.is_some());
                }
            }
            map.insert(iface.id.to_string(), obj);
        }
        Value::Object(map)
    }
}

/// Why a new client connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewConnectionError {
    NotFound,
    Auth,
    Failed,
}

impl NewConnectionError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "device",
            Self::Auth => "auth",
            Self::Failed => "failed",
        }
    }
}

/// Cloneable handle combining the store, nmcli, and the event channel.
#[derive(Clone)]
pub struct WifiManager {
    store: Arc<Mutex<WifiStore>>,
    nm: Nmcli,
    events: broadcast::Sender<Value>,
    scan_timer: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl WifiManager {
    pub fn new(nm: Nmcli, events: broadcast::Sender<Value>) -> Self {
        Self {
            store: Arc::new(Mutex::new(WifiStore::new())),
            nm,
            events,
            scan_timer: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    pub fn store(&self) -> &Arc<Mutex<WifiStore>> {
        &self.store
    }

    pub async fn status_message(&self) -> Value {
        self.store.lock().await.build_status_message(Instant::now())
    }

    /// Push the current view to every UI session.
    pub async fn broadcast(&self) {
        let wifi = self.status_message().await;
        let _ = self.events.send(json!({"status": {"wifi": wifi}}));
    }

    pub async fn refresh_devices(&self) -> Result<bool, ToolError> {
        let devices = self.nm.wifi_devices().await?;
        Ok(self.store.lock().await.sync_interfaces(&devices))
    }

    pub async fn refresh_connections(&self) -> Result<bool, ToolError> {
        let summaries = self.nm.connections().await?;
        let mut conns = Vec::new();
        for summary in summaries.iter().filter(|c| c.conn_type == WIFI_TYPE) {
            // A profile deleted between the two calls is simply skipped.
            match self
                .nm
                .connection_fields(&summary.uuid, CONNECTION_FIELDS)
                .await
            {
                Ok(fields) => {
                    if let Some(c) = classify_connection(&summary.uuid, &fields) {
                        conns.push(c);
                    }
                }
                Err(e) => debug!("WiFi: reading connection {} failed: {e}", summary.uuid),
            }
        }
        Ok(self.store.lock().await.update_saved_connections(&conns))
    }

    pub async fn refresh_scan_results(&self) -> Result<bool, ToolError> {
        let rows = self.nm.wifi_list().await?;
        Ok(self.store.lock().await.update_scan_results(&rows))
    }

    /// Full re-sync. Individual failures leave that part of the state as is.
    pub async fn refresh_all(&self) -> bool {
        let mut changed = false;
        match self.refresh_devices().await {
            Ok(c) => changed |= c,
            Err(e) => warn!("WiFi: device refresh failed: {e}"),
        }
        match self.refresh_connections().await {
            Ok(c) => changed |= c,
            Err(e) => warn!("WiFi: connection refresh failed: {e}"),
        }
        match self.refresh_scan_results().await {
            Ok(c) => changed |= c,
            Err(e) => debug!("WiFi: scan refresh failed: {e}"),
        }
        changed
    }

    async fn ifname_for(&self, id: u32) -> Option<String> {
        self.store.lock().await.by_id(id).map(|i| i.ifname.clone())
    }

    /// Request a rescan on interface `id` and schedule result refreshes.
    pub async fn rescan(&self, id: u32) {
        let Some(ifname) = self.ifname_for(id).await else {
            debug!("WiFi: rescan for unknown device {id}");
            return;
        };
        if let Err(e) = self.nm.wifi_rescan(&ifname).await {
            // Rescans are rate limited by NetworkManager; the refreshes still
            // pick up whatever the last scan produced.
            debug!("WiFi: rescan on {ifname} failed: {e}");
        }
        self.schedule_scan_refreshes();
    }

    /// Replace any pending refresh schedule with a fresh one.
    pub fn schedule_scan_refreshes(&self) {
        let mgr = self.clone();
        let task = tokio::spawn(async move {
            let start = Instant::now();
            for ms in SCAN_REFRESH_DELAYS_MS {
                tokio::time::sleep_until(start + Duration::from_millis(ms)).await;
                match mgr.refresh_scan_results().await {
                    Ok(true) => mgr.broadcast().await,
                    Ok(false) => {}
                    Err(e) => debug!("WiFi: scheduled scan refresh failed: {e}"),
                }
            }
        });
        let mut slot = self.scan_timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    /// Activate a saved client profile.
    pub async fn connect(&self, uuid: &str) -> bool {
        let mac = {
            let store = self.store.lock().await;
            match store.by_connection(uuid) {
                Some(iface) => iface.mac.clone(),
                None => {
                    warn!("WiFi: connect to unknown connection {uuid}");
                    return false;
                }
            }
        };
        // Leaving hotspot mode: stop masking the tool's view.
        self.force_hotspot(&mac, 0).await;

        let ok = match self.nm.connection_up(uuid).await {
            Ok(()) => true,
            Err(e) => {
                warn!("WiFi: connecting {uuid} failed: {e}");
                false
            }
        };
        if let Err(e) = self.refresh_devices().await {
            debug!("WiFi: device refresh after connect failed: {e}");
        }
        self.broadcast().await;
        ok
    }

    pub async fn disconnect(&self, uuid: &str) -> bool {
        let ok = match self.nm.connection_down(uuid).await {
            Ok(()) => true,
            Err(e) => {
                warn!("WiFi: disconnecting {uuid} failed: {e}");
                false
            }
        };
        if let Err(e) = self.refresh_devices().await {
            debug!("WiFi: device refresh after disconnect failed: {e}");
        }
        self.broadcast().await;
        ok
    }

    /// Connect interface `id` to a network that has no saved profile yet.
    pub async fn new_connection(
        &self,
        id: u32,
        ssid: &str,
        password: Option<&str>,
    ) -> Result<(), NewConnectionError> {
        let Some(ifname) = self.ifname_for(id).await else {
            return Err(NewConnectionError::NotFound);
        };
        let result = self
            .nm
            .wifi_connect(&ifname, ssid, password.filter(|p| !p.is_empty()))
            .await
            .map_err(|e| {
                warn!("WiFi: connecting {ifname} to {ssid} failed: {e}");
                if is_auth_failure(&e) {
                    NewConnectionError::Auth
                } else {
                    NewConnectionError::Failed
                }
            });

        // A failed attempt can still leave a profile behind.
        if let Err(e) = self.refresh_connections().await {
            debug!("WiFi: connection refresh after new failed: {e}");
        }
        if let Err(e) = self.refresh_devices().await {
            debug!("WiFi: device refresh after new failed: {e}");
        }
        self.broadcast().await;
        result
    }

    pub async fn forget(&self, uuid: &str) -> bool {
        let ok = match self.nm.connection_delete(uuid).await {
            Ok(()) => true,
            Err(e) => {
                warn!("WiFi: deleting {uuid} failed: {e}");
                false
            }
        };
        if let Err(e) = self.refresh_connections().await {
            debug!("WiFi: connection refresh after forget failed: {e}");
        }
        self.broadcast().await;
        ok
    }
}

fn is_auth_failure(e: &ToolError) -> bool {
    let msg = e.stderr();
    msg.contains("Secrets were required") || msg.contains("802-1X supplicant")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tool::testing::ScriptedRunner;

    pub(crate) fn device(ifname: &str, mac: &str, conn: Option<&str>, ap: bool) -> WifiDevice {
        WifiDevice {
            ifname: ifname.to_string(),
            mac: mac.to_string(),
            hw: "Realtek RTL8812AU".to_string(),
            conn: conn.map(ToString::to_string),
            supports_ap: ap,
            supports_5ghz: false,
        }
    }

    fn row(ifname: &str, ssid: &str, active: bool, signal: u8) -> ScanRow {
        ScanRow {
            ifname: ifname.to_string(),
            active,
            ssid: ssid.to_string(),
            signal,
            security: "WPA2".to_string(),
            freq: 2437,
        }
    }

    #[test]
    fn test_one_interface_per_mac_with_stable_id() {
        let mut store = WifiStore::new();
        assert!(store.upsert_interface(&device("wlan0", "aa:bb:cc:dd:ee:01", None, true)));
        assert!(store.upsert_interface(&device("wlan1", "aa:bb:cc:dd:ee:01", None, true)));
        assert_eq!(store.len(), 1);
        let id = store.by_id(1).unwrap().id;

        store.remove_interface("aa:bb:cc:dd:ee:01");
        store.upsert_interface(&device("wlan0", "aa:bb:cc:dd:ee:01", None, true));
        assert_eq!(store.by_id(id).unwrap().ifname, "wlan0");
    }

    #[test]
    fn test_sync_interfaces_removes_missing() {
        let mut store = WifiStore::new();
        store.sync_interfaces(&[
            device("wlan0", "aa:bb:cc:dd:ee:01", None, false),
            device("wlan1", "aa:bb:cc:dd:ee:02", None, false),
        ]);
        assert!(store.sync_interfaces(&[device("wlan1", "aa:bb:cc:dd:ee:02", None, false)]));
        assert_eq!(store.len(), 1);
        assert!(!store.sync_interfaces(&[device("wlan1", "aa:bb:cc:dd:ee:02", None, false)]));
    }

    #[test]
    fn test_scan_results_replace_and_dedupe() {
        let mut store = WifiStore::new();
        store.upsert_interface(&device("wlan0", "aa:bb:cc:dd:ee:01", None, false));
        assert!(store.update_scan_results(&[
            row("wlan0", "Home", false, 90),
            row("wlan0", "Home", true, 40),
            row("wlan0", "Cafe", false, 30),
            row("wlan0", "Cafe", false, 60),
            row("wlan0", "", false, 99),
            row("wlan9", "Elsewhere", false, 50),
        ]));
        let iface = store.by_id(1).unwrap();
        assert_eq!(iface.available.len(), 2);
        assert!(iface.available["Home"].active);
        assert_eq!(iface.available["Cafe"].signal, 60);

        // Wholesale replacement, not merge.
        assert!(store.update_scan_results(&[row("wlan0", "Other", false, 10)]));
        let iface = store.by_id(1).unwrap();
        assert_eq!(iface.available.len(), 1);
        assert!(iface.available.contains_key("Other"));
        assert!(!store.update_scan_results(&[row("wlan0", "Other", false, 10)]));
    }

    #[test]
    fn test_saved_connections_by_mac() {
        let mut store = WifiStore::new();
        store.upsert_interface(&device("wlan0", "aa:bb:cc:dd:ee:01", None, false));
        store.upsert_interface(&device("wlan1", "aa:bb:cc:dd:ee:02", None, false));
        store.update_saved_connections(&[
            SavedConnection::Client {
                uuid: "u1".into(),
                ssid: "Home".into(),
                mac: Some("aa:bb:cc:dd:ee:01".into()),
            },
            SavedConnection::Client {
                uuid: "u2".into(),
                ssid: "Anywhere".into(),
                mac: None,
            },
        ]);
        let a = store.by_id(1).unwrap();
        let b = store.by_id(2).unwrap();
        assert_eq!(a.saved.len(), 2);
        assert_eq!(b.saved.len(), 1);
        assert_eq!(b.saved["Anywhere"], "u2");
        assert_eq!(store.by_connection("u1").unwrap().ifname, "wlan0");

        // Replaced, not merged.
        store.update_saved_connections(&[]);
        assert!(store.by_id(1).unwrap().saved.is_empty());
    }

    #[test]
    fn test_classify_connection() {
        let mut fields = HashMap::new();
        fields.insert("802-11-wireless.ssid".to_string(), "Home".to_string());
        fields.insert("802-11-wireless.mode".to_string(), "infrastructure".to_string());
        fields.insert(
            "802-11-wireless.mac-address".to_string(),
            "AA:BB:CC:DD:EE:01".to_string(),
        );
        assert_eq!(
            classify_connection("u1", &fields),
            Some(SavedConnection::Client {
                uuid: "u1".into(),
                ssid: "Home".into(),
                mac: Some("aa:bb:cc:dd:ee:01".into()),
            })
        );

        fields.insert("802-11-wireless.mode".to_string(), "adhoc".to_string());
        assert!(classify_connection("u1", &fields).is_none());

        fields.insert("802-11-wireless.mode".to_string(), "ap".to_string());
        assert!(matches!(
            classify_connection("u1", &fields),
            Some(SavedConnection::Hotspot(_))
        ));
    }

    #[test]
    fn test_status_message_client_fields() {
        let mut store = WifiStore::new();
        store.upsert_interface(&device("wlan0", "aa:bb:cc:dd:ee:01", Some("u1"), true));
        store.update_scan_results(&[row("wlan0", "Home", true, 70), row("wlan0", "Cafe", false, 80)]);
        let msg = store.build_status_message(Instant::now());
        let iface = &msg["1"];
        assert_eq!(iface["ifname"], "wlan0");
        assert_eq!(iface["supports_hotspot"], true);
        assert_eq!(iface["available"][0]["ssid"], "Home");
        assert!(iface.get("hotspot").is_none());
    }

    #[tokio::test]
    async fn test_new_connection_auth_error() {
        let runner = ScriptedRunner::new();
        runner.ok(
            "device show",
            "GENERAL.DEVICE:wlan0\nGENERAL.TYPE:wifi\nGENERAL.HWADDR:AA\\:BB\\:CC\\:DD\\:EE\\:01\n",
        );
        runner.ok("connection show", "");
        runner.on(
            "device wifi connect",
            Err(ToolError::Failed {
                code: 4,
                stderr: "Error: Connection activation failed: Secrets were required, but not provided."
                    .to_string(),
            }),
        );
        let (tx, mut rx) = broadcast::channel(16);
        let mgr = WifiManager::new(Nmcli::new(runner.clone(), "nmcli"), tx);
        mgr.refresh_devices().await.unwrap();

        let err = mgr.new_connection(1, "Home", Some("wrong")).await.unwrap_err();
        assert_eq!(err, NewConnectionError::Auth);
        assert!(rx.try_recv().unwrap()["status"]["wifi"].is_object());

        let err = mgr.new_connection(42, "Home", None).await.unwrap_err();
        assert_eq!(err, NewConnectionError::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_rescan_cancels_pending_refreshes() {
        let runner = ScriptedRunner::new();
        runner.ok(
            "device show",
            "GENERAL.DEVICE:wlan0\nGENERAL.TYPE:wifi\nGENERAL.HWADDR:AA\\:BB\\:CC\\:DD\\:EE\\:01\n",
        );
        runner.ok("device wifi rescan", "");
        runner.ok("device wifi list", "");
        let (tx, _rx) = broadcast::channel(16);
        let mgr = WifiManager::new(Nmcli::new(runner.clone(), "nmcli"), tx);
        mgr.refresh_devices().await.unwrap();

        mgr.rescan(1).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        mgr.rescan(1).await;
        tokio::time::sleep(Duration::from_secs(25)).await;

        let lists = runner
            .calls()
            .iter()
            .filter(|c| c.contains("device wifi list"))
            .count();
        // One refresh from the first schedule, six from the second.
        assert_eq!(lists, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_schedule_replaced_after_poisoned_lock() {
        let runner = ScriptedRunner::new();
        runner.ok("device wifi list", "");
        let (tx, _rx) = broadcast::channel(16);
        let mgr = WifiManager::new(Nmcli::new(runner.clone(), "nmcli"), tx);

        let timer = mgr.scan_timer.clone();
        let _ = std::thread::spawn(move || {
            let _guard = timer.lock().unwrap();
            panic!("poison the refresh slot");
        })
        .join();
        assert!(mgr.scan_timer.is_poisoned());

        mgr.schedule_scan_refreshes();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        mgr.schedule_scan_refreshes();
        tokio::time::sleep(Duration::from_secs(25)).await;

        let lists = runner
            .calls()
            .iter()
            .filter(|c| c.contains("device wifi list"))
            .count();
        assert_eq!(lists, 7);
    }
}
