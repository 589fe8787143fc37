//! Network interface enumeration and change tracking.
//!
//! A cheap periodic poll of `ip -j addr show` feeds a mark-and-sweep pass
//! over [`DeviceList`]. The pass reports whether anything changed, which is
//! what decides if the heavier NetworkManager re-sync runs.
//!
//! The update contract is enforced by types: records can only be added
//! through the [`DeviceListUpdate`] returned by [`DeviceList::start_update`],
//! which holds the list mutably until [`DeviceListUpdate::end_update`].

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::tool::{args, SharedRunner, ToolError};

/// One network interface as last seen by the poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDevice {
    pub ifname: String,
    pub mac: String,
    pub inet: Option<Ipv4Addr>,
}

/// Known interfaces keyed by `ifname`.
#[derive(Debug, Default)]
pub struct DeviceList {
    devices: BTreeMap<String, NetworkDevice>,
}

/// An in-progress reconciliation pass. Dropping it without calling
/// [`end_update`](Self::end_update) keeps upserts but skips removals.
pub struct DeviceListUpdate<'a> {
    list: &'a mut DeviceList,
    seen: HashSet<String>,
    modified: bool,
}

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a pass. Every record not re-added before `end_update` is removed.
    pub fn start_update(&mut self) -> DeviceListUpdate<'_> {
        DeviceListUpdate {
            list: self,
            seen: HashSet::new(),
            modified: false,
        }
    }

    pub fn get(&self, ifname: &str) -> Option<&NetworkDevice> {
        self.devices.get(ifname)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkDevice> {
        self.devices.values()
    }

    /// Wire form: `{ifname: {"mac", "ip"}}`.
    pub fn build_status_message(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .devices
            .values()
            .map(|d| {
                (
                    d.ifname.clone(),
                    json!({
                        "mac": d.mac,
                        "ip": d.inet.map(|ip| ip.to_string()),
                    }),
                )
            })
            .collect();
        Value::Object(map)
    }
}

impl DeviceListUpdate<'_> {
    /// Upsert a record and mark it as present in this pass.
    pub fn add(&mut self, ifname: &str, mac: &str, inet: Option<Ipv4Addr>) {
        self.seen.insert(ifname.to_string());
        let record = NetworkDevice {
            ifname: ifname.to_string(),
            mac: mac.to_ascii_lowercase(),
            inet,
        };
        match self.list.devices.get_mut(ifname) {
            Some(existing) if *existing == record => {}
            Some(existing) => {
                *existing = record;
                self.modified = true;
            }
            None => {
                self.list.devices.insert(ifname.to_string(), record);
                self.modified = true;
            }
        }
    }

    /// Remove every record not added during this pass. Returns whether the
    /// list changed at all.
    pub fn end_update(self) -> bool {
        let before = self.list.devices.len();
        let seen = self.seen;
        self.list.devices.retain(|ifname, _| seen.contains(ifname));
        self.modified || self.list.devices.len() != before
    }
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    link_type: Option<String>,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    family: String,
    #[serde(default)]
    local: Option<String>,
}

/// Parse `ip -j addr show` into `(ifname, mac, first IPv4)` tuples, skipping
/// loopback and interfaces without a hardware address.
pub fn parse_ip_addr(output: &str) -> Result<Vec<(String, String, Option<Ipv4Addr>)>, String> {
    let links: Vec<IpLink> =
        serde_json::from_str(output).map_err(|e| format!("bad ip -j output: {e}"))?;
    Ok(links
        .into_iter()
        .filter(|l| l.link_type.as_deref() != Some("loopback"))
        .filter_map(|l| {
            let mac = l.address.filter(|a| !a.is_empty())?;
            let inet = l
                .addr_info
                .iter()
                .filter(|a| a.family == "inet")
                .find_map(|a| a.local.as_deref().and_then(|s| s.parse().ok()));
            Some((l.ifname, mac, inet))
        })
        .collect())
}

/// Run one enumeration pass. Returns whether the interface set changed.
///
/// On tool failure the list is left untouched.
pub async fn poll_interfaces(
    runner: &SharedRunner,
    ip_path: &str,
    list: &tokio::sync::Mutex<DeviceList>,
) -> Result<bool, ToolError> {
    let out = runner
        .run(ip_path, &args(["-j", "addr", "show"]))
        .await?;
    let links = parse_ip_addr(&out).map_err(|e| ToolError::Failed {
        code: 0,
        stderr: e,
    })?;

    let mut list = list.lock().await;
    let mut update = list.start_update();
    for (ifname, mac, inet) in &links {
        update.add(ifname, mac, *inet);
    }
    Ok(update.end_update())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::testing::ScriptedRunner;

    fn ip(s: &str) -> Option<Ipv4Addr> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn test_first_pass_reports_change() {
        let mut list = DeviceList::new();
        let mut u = list.start_update();
        u.add("wlan0", "AA:BB:CC:DD:EE:01", None);
        assert!(u.end_update());
        assert_eq!(list.get("wlan0").unwrap().mac, "aa:bb:cc:dd:ee:01");
    }

    #[test]
    fn test_identical_pass_reports_no_change() {
        let mut list = DeviceList::new();
        let mut u = list.start_update();
        u.add("eth0", "aa:bb:cc:dd:ee:02", ip("10.0.0.2"));
        u.end_update();

        let mut u = list.start_update();
        u.add("eth0", "aa:bb:cc:dd:ee:02", ip("10.0.0.2"));
        assert!(!u.end_update());
    }

    #[test]
    fn test_address_change_is_modification() {
        let mut list = DeviceList::new();
        let mut u = list.start_update();
        u.add("eth0", "aa:bb:cc:dd:ee:02", ip("10.0.0.2"));
        u.end_update();

        let mut u = list.start_update();
        u.add("eth0", "aa:bb:cc:dd:ee:02", ip("10.0.0.3"));
        assert!(u.end_update());
        assert_eq!(list.get("eth0").unwrap().inet, ip("10.0.0.3"));
    }

    #[test]
    fn test_omitted_device_removed_after_pass() {
        let mut list = DeviceList::new();
        for _ in 0..2 {
            let mut u = list.start_update();
            u.add("wlan0", "aa:bb:cc:dd:ee:01", None);
            u.add("eth0", "aa:bb:cc:dd:ee:02", None);
            u.end_update();
        }
        assert!(list.get("wlan0").is_some());

        let mut u = list.start_update();
        u.add("eth0", "aa:bb:cc:dd:ee:02", None);
        assert!(u.end_update());
        assert!(list.get("wlan0").is_none());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_retained_and_removed_sets() {
        let mut list = DeviceList::new();
        let mut u = list.start_update();
        for name in ["a", "b", "c"] {
            u.add(name, "00:00:00:00:00:01", None);
        }
        u.end_update();

        let mut u = list.start_update();
        for name in ["b", "d"] {
            u.add(name, "00:00:00:00:00:01", None);
        }
        u.end_update();

        let names: Vec<&str> = list.iter().map(|d| d.ifname.as_str()).collect();
        assert_eq!(names, vec!["b", "d"]);
    }

    #[test]
    fn test_parse_ip_addr_skips_loopback() {
        let out = r#"[
            {"ifindex":1,"ifname":"lo","link_type":"loopback","address":"00:00:00:00:00:00",
             "addr_info":[{"family":"inet","local":"127.0.0.1","prefixlen":8}]},
            {"ifindex":2,"ifname":"eth0","link_type":"ether","address":"aa:bb:cc:dd:ee:02",
             "addr_info":[{"family":"inet6","local":"fe80::1"},{"family":"inet","local":"192.168.1.5"}]},
            {"ifindex":3,"ifname":"wwan0","link_type":"none","addr_info":[]}
        ]"#;
        let links = parse_ip_addr(out).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].0, "eth0");
        assert_eq!(links[0].2, ip("192.168.1.5"));
    }

    #[tokio::test]
    async fn test_poll_interfaces_tool_failure_keeps_list() {
        let runner = ScriptedRunner::new();
        let shared: SharedRunner = runner.clone();
        let list = tokio::sync::Mutex::new(DeviceList::new());
        {
            let mut l = list.lock().await;
            let mut u = l.start_update();
            u.add("eth0", "aa:bb:cc:dd:ee:02", None);
            u.end_update();
        }
        runner.fail("ip -j addr show");
        assert!(poll_interfaces(&shared, "ip", &list).await.is_err());
        assert_eq!(list.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_poll_interfaces_detects_change() {
        let runner = ScriptedRunner::new();
        let shared: SharedRunner = runner.clone();
        runner.ok(
            "ip -j addr show",
            r#"[{"ifname":"wlan0","link_type":"ether","address":"aa:bb:cc:dd:ee:01","addr_info":[]}]"#,
        );
        let list = tokio::sync::Mutex::new(DeviceList::new());
        assert!(poll_interfaces(&shared, "ip", &list).await.unwrap());
        assert!(!poll_interfaces(&shared, "ip", &list).await.unwrap());
    }
}
