//! NetworkManager command-line wrapper.
//!
//! All calls use terse mode (`-t`), where fields are `:`-separated and literal
//! colons/backslashes inside values are escaped as `\:` / `\\`. Multi-line
//! `show` output is `KEY:value` per line, one record per device/connection.
//!
//! Every method returns either parsed data or a [`ToolError`]; there is no
//! partial success.

use std::collections::HashMap;

use crate::tool::{SharedRunner, ToolError};

/// A WiFi device as reported by `nmcli device show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiDevice {
    pub ifname: String,
    pub mac: String,
    /// Vendor + product, e.g. "Realtek RTL8812AU".
    pub hw: String,
    /// UUID of the active connection, if any.
    pub conn: Option<String>,
    pub supports_ap: bool,
    pub supports_5ghz: bool,
}

/// A row of `nmcli connection show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub uuid: String,
    pub conn_type: String,
}

/// A row of `nmcli device wifi list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRow {
    pub ifname: String,
    pub active: bool,
    pub ssid: String,
    pub signal: u8,
    pub security: String,
    pub freq: u32,
}

pub const WIFI_TYPE: &str = "802-11-wireless";
pub const GSM_TYPE: &str = "gsm";

/// Cloneable handle to the `nmcli` binary.
#[derive(Clone)]
pub struct Nmcli {
    runner: SharedRunner,
    program: String,
}

impl Nmcli {
    pub fn new(runner: SharedRunner, program: &str) -> Self {
        Self {
            runner,
            program: program.to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, ToolError> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        self.runner.run(&self.program, &args).await
    }

    async fn run_owned(&self, args: Vec<String>) -> Result<String, ToolError> {
        self.runner.run(&self.program, &args).await
    }

    /// All WiFi devices with their hardware capabilities and active connection.
    pub async fn wifi_devices(&self) -> Result<Vec<WifiDevice>, ToolError> {
        let out = self
            .run(&[
                "-t",
                "-f",
                "GENERAL.DEVICE,GENERAL.TYPE,GENERAL.HWADDR,GENERAL.VENDOR,GENERAL.PRODUCT,GENERAL.CON-UUID,WIFI-PROPERTIES.AP,WIFI-PROPERTIES.5GHZ",
                "device",
                "show",
            ])
            .await?;
        Ok(parse_wifi_devices(&out))
    }

    /// UUID and type of every saved connection.
    pub async fn connections(&self) -> Result<Vec<ConnectionSummary>, ToolError> {
        let out = self
            .run(&["-t", "-f", "UUID,TYPE", "connection", "show"])
            .await?;
        Ok(out
            .lines()
            .filter_map(|line| {
                let fields = split_terse(line);
                match fields.as_slice() {
                    [uuid, conn_type, ..] if !uuid.is_empty() => Some(ConnectionSummary {
                        uuid: uuid.clone(),
                        conn_type: conn_type.clone(),
                    }),
                    _ => None,
                }
            })
            .collect())
    }

    /// Selected settings of one connection, secrets included.
    pub async fn connection_fields(
        &self,
        uuid: &str,
        fields: &[&str],
    ) -> Result<HashMap<String, String>, ToolError> {
        let fields = fields.join(",");
        let out = self
            .run(&[
                "-t",
                "--show-secrets",
                "-f",
                &fields,
                "connection",
                "show",
                "uuid",
                uuid,
            ])
            .await?;
        Ok(parse_records(&out).into_iter().next().unwrap_or_default())
    }

    /// Cached scan results for every WiFi device.
    pub async fn wifi_list(&self) -> Result<Vec<ScanRow>, ToolError> {
        let out = self
            .run(&[
                "-t",
                "-f",
                "ACTIVE,SSID,SIGNAL,SECURITY,FREQ,DEVICE",
                "device",
                "wifi",
                "list",
                "--rescan",
                "no",
            ])
            .await?;
        Ok(parse_wifi_list(&out))
    }

    /// Ask the device to rescan. Results show up in [`Nmcli::wifi_list`] later.
    pub async fn wifi_rescan(&self, ifname: &str) -> Result<(), ToolError> {
        self.run(&["device", "wifi", "rescan", "ifname", ifname])
            .await
            .map(|_| ())
    }

    /// Create and activate a client connection to `ssid` on `ifname`.
    pub async fn wifi_connect(
        &self,
        ifname: &str,
        ssid: &str,
        password: Option<&str>,
    ) -> Result<(), ToolError> {
        let mut args = vec!["device", "wifi", "connect", ssid];
        if let Some(pw) = password {
            args.extend(["password", pw]);
        }
        args.extend(["ifname", ifname]);
        self.run(&args).await.map(|_| ())
    }

    pub async fn connection_up(&self, uuid: &str) -> Result<(), ToolError> {
        self.run(&["connection", "up", "uuid", uuid])
            .await
            .map(|_| ())
    }

    pub async fn connection_down(&self, uuid: &str) -> Result<(), ToolError> {
        self.run(&["connection", "down", "uuid", uuid])
            .await
            .map(|_| ())
    }

    pub async fn connection_delete(&self, uuid: &str) -> Result<(), ToolError> {
        self.run(&["connection", "delete", "uuid", uuid])
            .await
            .map(|_| ())
    }

    /// Write settings to an existing profile (does not reactivate it).
    pub async fn connection_modify(
        &self,
        uuid: &str,
        settings: &[(&str, String)],
    ) -> Result<(), ToolError> {
        let mut args = vec![
            "connection".to_string(),
            "modify".to_string(),
            "uuid".to_string(),
            uuid.to_string(),
        ];
        for (key, value) in settings {
            args.push((*key).to_string());
            args.push(value.clone());
        }
        self.run_owned(args).await.map(|_| ())
    }

    /// Create a profile and return its UUID.
    pub async fn connection_add(&self, settings: &[(&str, String)]) -> Result<String, ToolError> {
        let mut args = vec!["connection".to_string(), "add".to_string()];
        for (key, value) in settings {
            args.push((*key).to_string());
            args.push(value.clone());
        }
        let out = self.run_owned(args).await?;
        parse_added_uuid(&out).ok_or_else(|| ToolError::Failed {
            code: 0,
            stderr: format!("no uuid in output: {}", out.trim()),
        })
    }
}

// ── Parsers ──────────────────────────────────────────────────────────

/// Split one terse line on unescaped `:`, unescaping `\:` and `\\`.
pub fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Parse multi-line terse output into `KEY → value` records.
///
/// A record ends at a blank line or when its first key shows up again.
pub fn parse_records(output: &str) -> Vec<HashMap<String, String>> {
    let mut records = Vec::new();
    let mut current: HashMap<String, String> = HashMap::new();
    let mut first_key: Option<String> = None;

    for line in output.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
                first_key = None;
            }
            continue;
        }
        let Some((key, raw)) = line.split_once(':') else {
            continue;
        };
        let value = split_terse(raw).join(":");
        if first_key.as_deref() == Some(key) && !current.is_empty() {
            records.push(std::mem::take(&mut current));
        }
        if current.is_empty() {
            first_key = Some(key.to_string());
        }
        current.insert(key.to_string(), value);
    }
    if !current.is_empty() {
        records.push(current);
    }
    records
}

/// nmcli prints `--` for unset values.
pub fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && *v != "--")
        .map(ToString::to_string)
}

fn parse_wifi_devices(output: &str) -> Vec<WifiDevice> {
    parse_records(output)
        .into_iter()
        .filter(|r| r.get("GENERAL.TYPE").map(String::as_str) == Some("wifi"))
        .filter_map(|r| {
            let ifname = non_empty(r.get("GENERAL.DEVICE"))?;
            let mac = non_empty(r.get("GENERAL.HWADDR"))?.to_ascii_lowercase();
            let hw = [r.get("GENERAL.VENDOR"), r.get("GENERAL.PRODUCT")]
                .into_iter()
                .filter_map(non_empty)
                .collect::<Vec<_>>()
                .join(" ");
            Some(WifiDevice {
                ifname,
                mac,
                hw,
                conn: non_empty(r.get("GENERAL.CON-UUID")),
                supports_ap: r.get("WIFI-PROPERTIES.AP").map(String::as_str) == Some("yes"),
                supports_5ghz: r.get("WIFI-PROPERTIES.5GHZ").map(String::as_str) == Some("yes"),
            })
        })
        .collect()
}

fn parse_wifi_list(output: &str) -> Vec<ScanRow> {
    output
        .lines()
        .filter_map(|line| {
            let fields = split_terse(line);
            let [active, ssid, signal, security, freq, ifname] = fields.as_slice() else {
                return None;
            };
            let freq = freq
                .split_whitespace()
                .next()
                .and_then(|f| f.parse().ok())
                .unwrap_or(0);
            Some(ScanRow {
                ifname: ifname.clone(),
                active: active == "yes",
                ssid: ssid.clone(),
                signal: signal.parse::<u8>().unwrap_or(0).min(100),
                security: security.clone(),
                freq,
            })
        })
        .collect()
}

/// `Connection 'NAME' (UUID) successfully added.` → UUID
fn parse_added_uuid(output: &str) -> Option<String> {
    let line = output.lines().find(|l| l.contains("successfully added"))?;
    let start = line.rfind('(')? + 1;
    let end = line[start..].find(')')? + start;
    let uuid = line[start..end].trim();
    if uuid.is_empty() {
        None
    } else {
        Some(uuid.to_string())
    }
}
