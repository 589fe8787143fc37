//! Hotspot (access point) mode.
//!
//! NetworkManager takes several seconds to bring an AP profile up, and until
//! it does `device show` still reports the previous client connection. A
//! forced-status deadline covers that gap: while it is in the future the
//! interface is reported in hotspot mode regardless of what the tool says.
//! The deadline only moves forward; a failure cancels it outright.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::WifiManager;
use crate::nmcli::non_empty;

/// How long hotspot mode is reported optimistically after a start/config.
pub const HOTSPOT_FORCE_MS: i64 = 12_000;

const NAME_PREFIX: &str = "Encoder_";
const PASSWORD_LEN: usize = 12;
const DEFAULT_CHANNEL: &str = "auto_24";

/// A channel choice as offered to the UI and its NetworkManager encoding.
struct ChannelDef {
    name: &'static str,
    band: &'static str,
    channel: u32,
    is_5ghz: bool,
}

const CHANNELS: &[ChannelDef] = &[
    ChannelDef { name: "auto", band: "", channel: 0, is_5ghz: false },
    ChannelDef { name: "auto_24", band: "bg", channel: 0, is_5ghz: false },
    ChannelDef { name: "auto_50", band: "a", channel: 0, is_5ghz: true },
    ChannelDef { name: "1", band: "bg", channel: 1, is_5ghz: false },
    ChannelDef { name: "6", band: "bg", channel: 6, is_5ghz: false },
    ChannelDef { name: "11", band: "bg", channel: 11, is_5ghz: false },
    ChannelDef { name: "36", band: "a", channel: 36, is_5ghz: true },
    ChannelDef { name: "40", band: "a", channel: 40, is_5ghz: true },
    ChannelDef { name: "44", band: "a", channel: 44, is_5ghz: true },
    ChannelDef { name: "48", band: "a", channel: 48, is_5ghz: true },
    ChannelDef { name: "149", band: "a", channel: 149, is_5ghz: true },
    ChannelDef { name: "153", band: "a", channel: 153, is_5ghz: true },
    ChannelDef { name: "157", band: "a", channel: 157, is_5ghz: true },
    ChannelDef { name: "161", band: "a", channel: 161, is_5ghz: true },
];

fn channel_def(name: &str) -> Option<&'static ChannelDef> {
    CHANNELS.iter().find(|c| c.name == name)
}

/// Channel names usable on an adapter.
pub fn available_channels(supports_5ghz: bool) -> Vec<String> {
    CHANNELS
        .iter()
        .filter(|c| supports_5ghz || !c.is_5ghz)
        .map(|c| c.name.to_string())
        .collect()
}

/// Map a profile's `(band, channel)` back to a channel name.
pub fn channel_from_profile(band: Option<&str>, channel: u32) -> Option<String> {
    let band = band.unwrap_or("");
    CHANNELS
        .iter()
        .find(|c| c.band == band && c.channel == channel)
        .map(|c| c.name.to_string())
}

fn channel_settings(name: &str) -> Vec<(&'static str, String)> {
    let (band, channel) = channel_def(name).map_or(("bg", 0), |c| (c.band, c.channel));
    vec![
        ("802-11-wireless.band", band.to_string()),
        ("802-11-wireless.channel", channel.to_string()),
    ]
}

/// Default profile name: prefix plus the last two MAC octets.
pub fn generate_name(mac: &str) -> String {
    let tail: String = mac
        .split(':')
        .rev()
        .take(2)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<String>()
        .to_ascii_uppercase();
    format!("{NAME_PREFIX}{tail}")
}

pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Settings for a brand-new AP profile.
fn new_profile_settings(
    ifname: &str,
    mac: &str,
    name: &str,
    password: &str,
) -> Vec<(&'static str, String)> {
    let mut settings = vec![
        ("type", "wifi".to_string()),
        ("ifname", ifname.to_string()),
        ("con-name", name.to_string()),
        ("autoconnect", "yes".to_string()),
        ("802-11-wireless.ssid", name.to_string()),
        ("802-11-wireless.mode", "ap".to_string()),
        ("802-11-wireless.mac-address", mac.to_string()),
        ("802-11-wireless.hidden", "no".to_string()),
        ("ipv4.method", "shared".to_string()),
        ("ipv6.method", "disabled".to_string()),
        ("802-11-wireless-security.key-mgmt", "wpa-psk".to_string()),
        ("802-11-wireless-security.psk", password.to_string()),
        ("802-11-wireless-security.proto", "rsn".to_string()),
        ("802-11-wireless-security.pairwise", "ccmp".to_string()),
        ("802-11-wireless-security.group", "ccmp".to_string()),
        ("802-11-wireless-security.pmf", "disable".to_string()),
    ];
    settings.extend(channel_settings(DEFAULT_CHANNEL));
    settings
}

fn user_settings(name: &str, password: &str, channel: &str) -> Vec<(&'static str, String)> {
    let mut settings = vec![
        ("802-11-wireless.ssid", name.to_string()),
        ("802-11-wireless-security.psk", password.to_string()),
    ];
    settings.extend(channel_settings(channel));
    settings
}

/// An AP-mode profile as read from NetworkManager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotspotProfile {
    pub uuid: String,
    pub name: String,
    pub password: Option<String>,
    pub mac: Option<String>,
    pub ifname: Option<String>,
    pub channel: Option<String>,
    /// Security/visibility settings match what this daemon creates.
    pub baseline: bool,
}

impl HotspotProfile {
    pub fn from_fields(uuid: &str, ssid: &str, fields: &HashMap<String, String>) -> Self {
        let get = |key: &str| non_empty(fields.get(key));
        let is = |key: &str, want: &str| get(key).as_deref() == Some(want);
        let pmf_off = get("802-11-wireless-security.pmf").is_some_and(|v| {
            let v = v.trim();
            v == "1" || v == "disable" || v.starts_with("1 ")
        });
        let baseline = is("802-11-wireless.hidden", "no")
            && is("802-11-wireless-security.key-mgmt", "wpa-psk")
            && is("802-11-wireless-security.proto", "rsn")
            && is("802-11-wireless-security.pairwise", "ccmp")
            && is("802-11-wireless-security.group", "ccmp")
            && pmf_off;
        let channel = get("802-11-wireless.channel")
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);

        Self {
            uuid: uuid.to_string(),
            name: ssid.to_string(),
            password: get("802-11-wireless-security.psk"),
            mac: get("802-11-wireless.mac-address").map(|m| m.to_ascii_lowercase()),
            ifname: get("connection.interface-name"),
            channel: channel_from_profile(get("802-11-wireless.band").as_deref(), channel),
            baseline,
        }
    }

    /// Profiles bind by MAC, falling back to interface name.
    pub fn belongs_to(&self, mac: &str, ifname: &str) -> bool {
        match (&self.mac, &self.ifname) {
            (Some(m), _) => m == mac,
            (None, Some(i)) => i == ifname,
            (None, None) => false,
        }
    }
}

/// Hotspot sub-state of an AP-capable interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hotspot {
    pub conn: Option<String>,
    pub name: Option<String>,
    pub password: Option<String>,
    pub channel: Option<String>,
    pub available_channels: Vec<String>,
    pub warnings: BTreeSet<String>,
    force_until: Option<Instant>,
}

impl Hotspot {
    pub fn new(supports_5ghz: bool) -> Self {
        Self {
            conn: None,
            name: None,
            password: None,
            channel: None,
            available_channels: available_channels(supports_5ghz),
            warnings: BTreeSet::new(),
            force_until: None,
        }
    }

    pub(super) fn set_5ghz_support(&mut self, supports_5ghz: bool) -> bool {
        let channels = available_channels(supports_5ghz);
        if channels == self.available_channels {
            return false;
        }
        self.available_channels = channels;
        true
    }

    /// Extend the forced window to `now + ms`, or cancel it when `ms <= 0`.
    /// A shorter request never shrinks an existing window.
    pub fn force_status(&mut self, ms: i64, now: Instant) {
        let Ok(ms) = u64::try_from(ms) else {
            self.force_until = None;
            return;
        };
        if ms == 0 {
            self.force_until = None;
            return;
        }
        let deadline = now + Duration::from_millis(ms);
        if self.force_until.is_none_or(|d| deadline > d) {
            self.force_until = Some(deadline);
        }
    }

    pub fn is_forced(&self, now: Instant) -> bool {
        self.force_until.is_some_and(|d| now < d)
    }

    /// Hotspot mode: forced, or the interface's active connection is ours.
    pub fn is_active(&self, iface_conn: Option<&str>, now: Instant) -> bool {
        self.is_forced(now) || (self.conn.is_some() && self.conn.as_deref() == iface_conn)
    }

    pub(super) fn apply_profile(&mut self, p: &HotspotProfile) -> bool {
        let before = self.clone();
        self.conn = Some(p.uuid.clone());
        self.name = Some(p.name.clone());
        self.password.clone_from(&p.password);
        self.channel.clone_from(&p.channel);
        if p.baseline {
            self.warnings.remove("modified");
        } else {
            self.warnings.insert("modified".to_string());
        }
        *self != before
    }

    pub(super) fn clear_profile(&mut self) -> bool {
        let before = self.clone();
        self.conn = None;
        self.name = None;
        self.password = None;
        self.channel = None;
        self.warnings.clear();
        *self != before
    }

    pub fn status_message(&self) -> Value {
        json!({
            "name": self.name,
            "password": self.password,
            "channel": self.channel,
            "available_channels": self.available_channels,
            "warnings": self.warnings,
        })
    }
}

/// Body of a `hotspot.config` command.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HotspotConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotspotConfigError {
    NotFound,
    Name,
    Password,
    Channel,
    Saving,
    Activation,
}

impl HotspotConfigError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "device",
            Self::Name => "name",
            Self::Password => "password",
            Self::Channel => "channel",
            Self::Saving => "saving",
            Self::Activation => "activation",
        }
    }
}

/// Validate in order name, password, channel; report the first failure.
fn validate_config<'a>(
    req: &'a HotspotConfig,
    available: &[String],
) -> Result<(&'a str, &'a str, &'a str), HotspotConfigError> {
    let name = req
        .name
        .as_deref()
        .filter(|n| (1..=32).contains(&n.chars().count()))
        .ok_or(HotspotConfigError::Name)?;
    let password = req
        .password
        .as_deref()
        .filter(|p| (8..=64).contains(&p.chars().count()))
        .ok_or(HotspotConfigError::Password)?;
    let channel = req
        .channel
        .as_deref()
        .filter(|c| channel_def(c).is_some() && available.iter().any(|a| a == c))
        .ok_or(HotspotConfigError::Channel)?;
    Ok((name, password, channel))
}

/// What a hotspot command needs from the store, copied out before tool calls.
struct Target {
    mac: String,
    ifname: String,
    conn: Option<String>,
}

impl WifiManager {
    async fn hotspot_target(&self, id: u32) -> Option<Target> {
        let store = self.store.lock().await;
        let Some(iface) = store.by_id(id) else {
            warn!("Hotspot: unknown device {id}");
            return None;
        };
        let Some(hotspot) = iface.hotspot.as_ref() else {
            warn!("Hotspot: {} does not support AP mode", iface.ifname);
            return None;
        };
        Some(Target {
            mac: iface.mac.clone(),
            ifname: iface.ifname.clone(),
            conn: hotspot.conn.clone(),
        })
    }

    /// Set or cancel the forced window on the interface owning `mac`.
    pub async fn force_hotspot(&self, mac: &str, ms: i64) {
        let mut store = self.store.lock().await;
        if let Some(h) = store.by_mac_mut(mac).and_then(|i| i.hotspot.as_mut()) {
            h.force_status(ms, Instant::now());
        }
    }

    /// Switch interface `id` to hotspot mode, creating the profile on first use.
    pub async fn hotspot_start(&self, id: u32) {
        let Some(target) = self.hotspot_target(id).await else {
            return;
        };

        let uuid = match target.conn {
            Some(uuid) => {
                if let Err(e) = self
                    .nm
                    .connection_modify(&uuid, &[("connection.autoconnect", "yes".to_string())])
                    .await
                {
                    debug!("Hotspot: enabling autoconnect on {uuid} failed: {e}");
                }
                uuid
            }
            None => {
                let name = generate_name(&target.mac);
                let password = generate_password();
                let settings = new_profile_settings(&target.ifname, &target.mac, &name, &password);
                let uuid = match self.nm.connection_add(&settings).await {
                    Ok(uuid) => uuid,
                    Err(e) => {
                        warn!("Hotspot: creating profile on {} failed: {e}", target.ifname);
                        return;
                    }
                };
                info!("Hotspot: created profile {name} ({uuid}) on {}", target.ifname);
                let mut store = self.store.lock().await;
                if let Some(h) = store.by_mac_mut(&target.mac).and_then(|i| i.hotspot.as_mut()) {
                    h.apply_profile(&HotspotProfile {
                        uuid: uuid.clone(),
                        name,
                        password: Some(password),
                        mac: Some(target.mac.clone()),
                        ifname: Some(target.ifname.clone()),
                        channel: Some(DEFAULT_CHANNEL.to_string()),
                        baseline: true,
                    });
                }
                uuid
            }
        };

        self.force_hotspot(&target.mac, HOTSPOT_FORCE_MS).await;
        self.broadcast().await;

        match self.nm.connection_up(&uuid).await {
            Ok(()) => {
                info!("Hotspot: {} started", target.ifname);
                if let Err(e) = self.refresh_devices().await {
                    debug!("Hotspot: device refresh after start failed: {e}");
                }
            }
            Err(e) => {
                warn!("Hotspot: activating on {} failed: {e}", target.ifname);
                self.force_hotspot(&target.mac, 0).await;
            }
        }
        self.broadcast().await;
    }

    /// Leave hotspot mode on interface `id` and look for client networks.
    pub async fn hotspot_stop(&self, id: u32) {
        let Some(target) = self.hotspot_target(id).await else {
            return;
        };
        let Some(uuid) = target.conn else {
            debug!("Hotspot: {} has no profile to stop", target.ifname);
            return;
        };

        // Otherwise NetworkManager brings it straight back up.
        if let Err(e) = self
            .nm
            .connection_modify(&uuid, &[("connection.autoconnect", "no".to_string())])
            .await
        {
            warn!("Hotspot: disabling autoconnect on {uuid} failed: {e}");
        }
        self.force_hotspot(&target.mac, 0).await;

        match self.nm.connection_down(&uuid).await {
            Ok(()) => {
                info!("Hotspot: {} stopped", target.ifname);
                {
                    let mut store = self.store.lock().await;
                    if let Some(iface) = store.by_mac_mut(&target.mac) {
                        iface.conn = None;
                        iface.available.clear();
                    }
                }
                self.broadcast().await;
                self.rescan(id).await;
            }
            Err(e) => {
                warn!("Hotspot: deactivating on {} failed: {e}", target.ifname);
                self.broadcast().await;
            }
        }
    }

    /// Change name/password/channel of the hotspot on interface `id`.
    ///
    /// When the hotspot is running the profile is re-activated; if that
    /// fails the previous values are written back and re-activated.
    pub async fn hotspot_config(
        &self,
        id: u32,
        req: &HotspotConfig,
    ) -> Result<(), HotspotConfigError> {
        let (mac, uuid, previous, was_active, (name, password, channel)) = {
            let store = self.store.lock().await;
            let iface = store.by_id(id).ok_or(HotspotConfigError::NotFound)?;
            let h = iface.hotspot.as_ref().ok_or(HotspotConfigError::NotFound)?;
            let values = validate_config(req, &h.available_channels)?;
            let uuid = h.conn.clone().ok_or(HotspotConfigError::NotFound)?;
            let previous = (h.name.clone(), h.password.clone(), h.channel.clone());
            let was_active = h.is_active(iface.conn.as_deref(), Instant::now());
            (iface.mac.clone(), uuid, previous, was_active, values)
        };

        if previous.0.as_deref() == Some(name)
            && previous.1.as_deref() == Some(password)
            && previous.2.as_deref() == Some(channel)
        {
            return Ok(());
        }

        if let Err(e) = self
            .nm
            .connection_modify(&uuid, &user_settings(name, password, channel))
            .await
        {
            warn!("Hotspot: saving config for {uuid} failed: {e}");
            return Err(HotspotConfigError::Saving);
        }
        self.set_hotspot_fields(&mac, Some(name), Some(password), Some(channel))
            .await;

        if !was_active {
            self.broadcast().await;
            return Ok(());
        }

        self.force_hotspot(&mac, HOTSPOT_FORCE_MS).await;
        self.broadcast().await;
        if let Err(e) = self.nm.connection_up(&uuid).await {
            warn!("Hotspot: activating new config for {uuid} failed: {e}");
            self.restore_hotspot_config(&mac, &uuid, previous).await;
            return Err(HotspotConfigError::Activation);
        }
        if let Err(e) = self.refresh_devices().await {
            debug!("Hotspot: device refresh after config failed: {e}");
        }
        self.broadcast().await;
        Ok(())
    }

    async fn set_hotspot_fields(
        &self,
        mac: &str,
        name: Option<&str>,
        password: Option<&str>,
        channel: Option<&str>,
    ) {
        let mut store = self.store.lock().await;
        if let Some(h) = store.by_mac_mut(mac).and_then(|i| i.hotspot.as_mut()) {
            h.name = name.map(ToString::to_string);
            h.password = password.map(ToString::to_string);
            h.channel = channel.map(ToString::to_string);
        }
    }

    async fn restore_hotspot_config(
        &self,
        mac: &str,
        uuid: &str,
        previous: (Option<String>, Option<String>, Option<String>),
    ) {
        let (name, password, channel) = previous;
        if let (Some(n), Some(p)) = (&name, &password) {
            let channel_name = channel.as_deref().unwrap_or(DEFAULT_CHANNEL);
            if let Err(e) = self
                .nm
                .connection_modify(uuid, &user_settings(n, p, channel_name))
                .await
            {
                warn!("Hotspot: restoring config for {uuid} failed: {e}");
            }
        }
        self.set_hotspot_fields(mac, name.as_deref(), password.as_deref(), channel.as_deref())
            .await;

        self.force_hotspot(mac, HOTSPOT_FORCE_MS).await;
        if let Err(e) = self.nm.connection_up(uuid).await {
            warn!("Hotspot: re-activating previous config for {uuid} failed: {e}");
            self.force_hotspot(mac, 0).await;
        }
        if let Err(e) = self.refresh_devices().await {
            debug!("Hotspot: device refresh after restore failed: {e}");
        }
        self.broadcast().await;
    }
}
