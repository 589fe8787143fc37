//! Cellular modem controller.
//!
//! A background poller enumerates modems through ModemManager and joins each
//! one with the NetworkManager GSM profile bound to it (`gsm.device-id`).
//! Changes go out as per-modem, per-field deltas; see [`FieldDiff`].
//!
//! Network scans take minutes and need an idle modem, so a scan disconnects
//! the data connection first and `is_scanning` keeps a second scan of the
//! same modem from starting. The state lock is released for the duration.

pub mod mmcli;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::nmcli::{non_empty, Nmcli, GSM_TYPE};
use crate::status::{envelope, FieldDiff};
use crate::tool::ToolError;
use mmcli::{Mmcli, ModeCombo, ModemInfo, ScanNetwork};

const GSM_FIELDS: &[&str] = &[
    "gsm.device-id",
    "gsm.apn",
    "gsm.username",
    "gsm.password",
    "gsm.home-only",
    "gsm.network-id",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModemConfig {
    pub apn: String,
    pub username: String,
    pub password: String,
    pub roaming: bool,
    /// Operator code to lock to; empty for automatic selection.
    pub network: String,
    /// Empty APN: let the network supply bearer settings.
    pub autoconfig: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModemStatus {
    pub connection: String,
    pub signal: u8,
    pub network_type: String,
    pub network: Option<String>,
    pub roaming: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableNetwork {
    pub name: String,
    pub availability: String,
}

#[derive(Debug, Clone)]
pub struct Modem {
    pub id: u32,
    pub device_id: String,
    pub name: String,
    pub ifname: Option<String>,
    pub modes: Vec<ModeCombo>,
    pub current_mode: Option<ModeCombo>,
    /// UUID of the bound NetworkManager profile.
    pub profile: Option<String>,
    pub config: Option<ModemConfig>,
    pub status: Option<ModemStatus>,
    pub available_networks: Option<BTreeMap<String, AvailableNetwork>>,
    pub is_scanning: bool,
}

impl Modem {
    fn from_info(info: &ModemInfo) -> Self {
        let mut modem = Self {
            id: info.id,
            device_id: String::new(),
            name: String::new(),
            ifname: None,
            modes: Vec::new(),
            current_mode: None,
            profile: None,
            config: None,
            status: None,
            available_networks: None,
            is_scanning: false,
        };
        modem.apply_info(info);
        modem
    }

    fn apply_info(&mut self, info: &ModemInfo) {
        self.device_id.clone_from(&info.device_id);
        self.name.clone_from(&info.name);
        self.ifname.clone_from(&info.ifname);
        self.modes.clone_from(&info.supported_modes);
        self.current_mode.clone_from(&info.current_mode);
        self.status = Some(ModemStatus {
            connection: info.state.clone(),
            signal: info.signal,
            network_type: info.access_tech.join("/"),
            network: info.operator_name.clone(),
            roaming: info.roaming,
        });
    }

    fn apply_profile(&mut self, profile: Option<&GsmProfile>) {
        self.profile = profile.map(|p| p.uuid.clone());
        self.config = profile.map(|p| p.config.clone());
    }

    /// Top-level wire fields, diffed individually by the broadcaster.
    pub fn wire_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(self.name));
        fields.insert("ifname".into(), json!(self.ifname));
        fields.insert(
            "network_type".into(),
            json!({
                "supported": self.modes.iter().map(ModeCombo::name).collect::<Vec<_>>(),
                "active": self.current_mode.as_ref().map(ModeCombo::name),
            }),
        );
        fields.insert("config".into(), json!(self.config));
        fields.insert("status".into(), json!(self.status));
        if let Some(networks) = &self.available_networks {
            fields.insert("available_networks".into(), json!(networks));
        }
        fields.insert("is_scanning".into(), json!(self.is_scanning));
        fields
    }
}

/// Fold raw scan rows into one entry per operator code.
///
/// `current` counts as `available`, `unknown` rows are dropped, and an
/// `available` row wins over any other availability for the same code.
pub fn fold_scan_results(rows: &[ScanNetwork]) -> BTreeMap<String, AvailableNetwork> {
    let mut out: BTreeMap<String, AvailableNetwork> = BTreeMap::new();
    for row in rows {
        let availability = match row.availability.as_str() {
            "unknown" => continue,
            "current" => "available",
            other => other,
        };
        match out.get(&row.code) {
            Some(existing) if existing.availability == "available" => {}
            _ => {
                out.insert(
                    row.code.clone(),
                    AvailableNetwork {
                        name: row.name.clone(),
                        availability: availability.to_string(),
                    },
                );
            }
        }
    }
    out
}

/// A NetworkManager GSM profile and the config it encodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GsmProfile {
    pub uuid: String,
    pub device_id: Option<String>,
    pub config: ModemConfig,
}

pub fn parse_gsm_profile(uuid: &str, fields: &HashMap<String, String>) -> GsmProfile {
    let get = |key: &str| non_empty(fields.get(key)).unwrap_or_default();
    let apn = get("gsm.apn");
    GsmProfile {
        uuid: uuid.to_string(),
        device_id: non_empty(fields.get("gsm.device-id")),
        config: ModemConfig {
            autoconfig: apn.is_empty(),
            apn,
            username: get("gsm.username"),
            password: get("gsm.password"),
            roaming: get("gsm.home-only") != "yes",
            network: get("gsm.network-id"),
        },
    }
}

fn gsm_settings(device_id: &str, cfg: &ModemConfig) -> Vec<(&'static str, String)> {
    let apn = if cfg.autoconfig { "" } else { cfg.apn.as_str() };
    vec![
        ("gsm.device-id", device_id.to_string()),
        ("gsm.apn", apn.to_string()),
        ("gsm.username", cfg.username.clone()),
        ("gsm.password", cfg.password.clone()),
        ("gsm.home-only", if cfg.roaming { "no" } else { "yes" }.to_string()),
        ("gsm.network-id", cfg.network.clone()),
        ("connection.autoconnect", "yes".to_string()),
    ]
}

/// Body of a `modems.config` command.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModemConfigRequest {
    #[serde(default)]
    pub apn: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub roaming: bool,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub autoconfig: bool,
    #[serde(default)]
    pub network_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemConfigError {
    NotFound,
    NetworkType,
    Saving,
}

impl ModemConfigError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "device",
            Self::NetworkType => "network_type",
            Self::Saving => "saving",
        }
    }
}

#[derive(Clone)]
pub struct ModemController {
    modems: Arc<Mutex<BTreeMap<u32, Modem>>>,
    diff: Arc<Mutex<FieldDiff>>,
    mmcli: Mmcli,
    nm: Nmcli,
    events: broadcast::Sender<Value>,
}

impl ModemController {
    pub fn new(mmcli: Mmcli, nm: Nmcli, events: broadcast::Sender<Value>) -> Self {
        Self {
            modems: Arc::new(Mutex::new(BTreeMap::new())),
            diff: Arc::new(Mutex::new(FieldDiff::new())),
            mmcli,
            nm,
            events,
        }
    }

    pub async fn count(&self) -> usize {
        self.modems.lock().await.len()
    }

    async fn wire_view(&self) -> BTreeMap<String, Map<String, Value>> {
        self.modems
            .lock()
            .await
            .values()
            .map(|m| (m.id.to_string(), m.wire_fields()))
            .collect()
    }

    /// Full view for a newly connected session.
    pub async fn status_message(&self) -> Value {
        let view = self.wire_view().await;
        Value::Object(
            view.into_iter()
                .map(|(id, fields)| (id, Value::Object(fields)))
                .collect(),
        )
    }

    /// Broadcast whatever changed since the last broadcast.
    ///
    /// Lock order is diff, then modems.
    pub async fn broadcast_changes(&self) {
        let mut diff = self.diff.lock().await;
        let view = self.wire_view().await;
        if let Some(delta) = diff.diff(&view) {
            let _ = self.events.send(envelope("modems", delta));
        }
    }

    async fn read_profiles(&self) -> Result<HashMap<String, GsmProfile>, ToolError> {
        let mut profiles = HashMap::new();
        for summary in self
            .nm
            .connections()
            .await?
            .into_iter()
            .filter(|c| c.conn_type == GSM_TYPE)
        {
            match self.nm.connection_fields(&summary.uuid, GSM_FIELDS).await {
                Ok(fields) => {
                    let profile = parse_gsm_profile(&summary.uuid, &fields);
                    if let Some(device_id) = profile.device_id.clone() {
                        profiles.insert(device_id, profile);
                    }
                }
                Err(e) => debug!("Modems: reading profile {} failed: {e}", summary.uuid),
            }
        }
        Ok(profiles)
    }

    /// One enumeration pass. Modems absent from the listing are removed;
    /// a modem whose details fail to read is kept as it was.
    pub async fn poll(&self) -> Result<(), ToolError> {
        let ids = self.mmcli.list_modems().await?;
        let mut infos = Vec::new();
        for id in &ids {
            match self.mmcli.modem_info(*id).await {
                Ok(info) => infos.push(info),
                Err(e) => debug!("Modems: reading modem {id} failed: {e}"),
            }
        }
        let profiles = match self.read_profiles().await {
            Ok(p) => Some(p),
            Err(e) => {
                debug!("Modems: reading GSM profiles failed: {e}");
                None
            }
        };

        let present: HashSet<u32> = ids.into_iter().collect();
        let mut modems = self.modems.lock().await;
        for info in &infos {
            let modem = modems.entry(info.id).or_insert_with(|| {
                info!("Modems: found {} ({})", info.name, info.device_id);
                Modem::from_info(info)
            });
            modem.apply_info(info);
            if let Some(profiles) = &profiles {
                modem.apply_profile(profiles.get(&info.device_id));
            }
        }
        modems.retain(|id, m| {
            let keep = present.contains(id);
            if !keep {
                info!("Modems: {} removed", m.name);
            }
            keep
        });
        Ok(())
    }

    /// Run an operator scan on modem `id`.
    pub async fn scan(&self, id: u32) {
        let profile = {
            let mut modems = self.modems.lock().await;
            let Some(modem) = modems.get_mut(&id) else {
                debug!("Modems: scan for unknown modem {id}");
                return;
            };
            if modem.is_scanning {
                debug!("Modems: scan already running on modem {id}");
                return;
            }
            if modem.config.is_none() || modem.status.is_none() {
                debug!("Modems: modem {id} not ready for a scan");
                return;
            }
            modem.is_scanning = true;
            modem.profile.clone()
        };
        self.broadcast_changes().await;

        let mut reconnect = None;
        if let Some(uuid) = profile {
            match self.nm.connection_down(&uuid).await {
                Ok(()) => reconnect = Some(uuid),
                Err(e) => debug!("Modems: disconnecting {uuid} before scan: {e}"),
            }
        }

        info!("Modems: scanning on modem {id}");
        let result = self.mmcli.scan(id).await;
        {
            let mut diff = self.diff.lock().await;
            let mut modems = self.modems.lock().await;
            let Some(modem) = modems.get_mut(&id) else {
                debug!("Modems: modem {id} went away during scan");
                return;
            };
            modem.is_scanning = false;
            match result {
                Ok(rows) => {
                    let networks = fold_scan_results(&rows);
                    info!("Modems: scan on modem {id} found {} networks", networks.len());
                    modem.available_networks = Some(networks);
                }
                Err(e) => {
                    warn!("Modems: scan on modem {id} failed: {e}");
                    // Keep the last list; UIs still get one to leave the scanning view.
                    modem.available_networks.get_or_insert_with(BTreeMap::new);
                }
            }
            diff.force(&id.to_string(), "available_networks");
        }

        if let Some(uuid) = reconnect {
            if let Err(e) = self.nm.connection_up(&uuid).await {
                warn!("Modems: reconnecting {uuid} after scan failed: {e}");
            }
        }
        self.broadcast_changes().await;
    }

    /// Write the data connection settings for modem `id`.
    pub async fn config(&self, id: u32, req: &ModemConfigRequest) -> Result<(), ModemConfigError> {
        let (device_id, profile, mode_change) = {
            let modems = self.modems.lock().await;
            let modem = modems.get(&id).ok_or(ModemConfigError::NotFound)?;
            let mode_change = match &req.network_type {
                Some(name) => {
                    let combo = modem
                        .modes
                        .iter()
                        .find(|c| c.name() == *name)
                        .ok_or(ModemConfigError::NetworkType)?;
                    (modem.current_mode.as_ref() != Some(combo)).then(|| combo.clone())
                }
                None => None,
            };
            (modem.device_id.clone(), modem.profile.clone(), mode_change)
        };

        let cfg = ModemConfig {
            apn: req.apn.clone(),
            username: req.username.clone(),
            password: req.password.clone(),
            roaming: req.roaming,
            network: req.network.clone(),
            autoconfig: req.autoconfig,
        };
        let settings = gsm_settings(&device_id, &cfg);
        let saved = match profile {
            Some(uuid) => self.nm.connection_modify(&uuid, &settings).await,
            None => {
                let mut add = vec![
                    ("type", "gsm".to_string()),
                    ("ifname", "*".to_string()),
                    ("con-name", format!("Modem_{id}")),
                ];
                add.extend(settings);
                self.nm.connection_add(&add).await.map(|_| ())
            }
        };
        if let Err(e) = saved {
            warn!("Modems: saving config for modem {id} failed: {e}");
            return Err(ModemConfigError::Saving);
        }

        if let Some(combo) = mode_change {
            if let Err(e) = self.mmcli.set_modes(id, &combo).await {
                warn!("Modems: setting modes {} on modem {id} failed: {e}", combo.name());
                return Err(ModemConfigError::NetworkType);
            }
        }

        if let Some(modem) = self.modems.lock().await.get_mut(&id) {
            modem.config = Some(cfg);
        }
        if let Err(e) = self.poll().await {
            debug!("Modems: refresh after config failed: {e}");
        }
        self.broadcast_changes().await;
        Ok(())
    }
}

/// Spawn the background modem poller. Returns a `JoinHandle` for abort on shutdown.
pub fn spawn_modem_poller(
    controller: ModemController,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match controller.poll().await {
                Ok(()) => controller.broadcast_changes().await,
                Err(e) => debug!("Modems: poll failed: {e}"),
            }
        }
    })
}
