//! ModemManager command-line wrapper.
//!
//! `-K` output is one `key : value` pair per line. Lists are flattened as
//! `key.length` plus `key.value[N]` entries, which [`KeyValues`] regroups.

use std::collections::HashMap;
use std::time::Duration;

use crate::tool::{SharedRunner, ToolError};

/// Upper bound for `--3gpp-scan`; the modem can take minutes.
pub const SCAN_TIMEOUT_SECS: u64 = 240;

/// Parsed `-K` output.
#[derive(Debug, Default)]
pub struct KeyValues {
    values: HashMap<String, String>,
    lists: HashMap<String, Vec<String>>,
}

impl KeyValues {
    pub fn parse(output: &str) -> Self {
        let mut kv = Self::default();
        for line in output.lines() {
            let Some((key, value)) = line.split_once(" : ").or_else(|| line.split_once(':')) else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if value.is_empty() || value == "--" {
                continue;
            }
            if let Some(idx) = key.find(".value[") {
                kv.lists
                    .entry(key[..idx].to_string())
                    .or_default()
                    .push(value.to_string());
            } else if !key.ends_with(".length") {
                kv.values.insert(key.to_string(), value.to_string());
            }
        }
        kv
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn list(&self, key: &str) -> &[String] {
        self.lists.get(key).map_or(&[], Vec::as_slice)
    }
}

/// An allowed/preferred mode combination, e.g. `allowed: 3g, 4g; preferred: 4g`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeCombo {
    pub allowed: Vec<String>,
    pub preferred: Option<String>,
}

impl ModeCombo {
    pub fn parse(s: &str) -> Option<Self> {
        let mut allowed = Vec::new();
        let mut preferred = None;
        for part in s.split(';') {
            let Some((key, value)) = part.split_once(':') else {
                continue;
            };
            match key.trim() {
                "allowed" => {
                    allowed = value
                        .split(',')
                        .map(|m| m.trim().to_ascii_lowercase())
                        .filter(|m| !m.is_empty())
                        .collect();
                }
                "preferred" => {
                    let p = value.trim().to_ascii_lowercase();
                    if p != "none" && !p.is_empty() {
                        preferred = Some(p);
                    }
                }
                _ => {}
            }
        }
        (!allowed.is_empty()).then_some(Self { allowed, preferred })
    }

    /// UI name: allowed modes concatenated, e.g. `3g4g`.
    pub fn name(&self) -> String {
        self.allowed.concat()
    }

    /// Arguments for `mmcli -m N`.
    pub fn set_args(&self) -> Vec<String> {
        let mut args = vec![format!("--set-allowed-modes={}", self.allowed.join("|"))];
        if let Some(p) = &self.preferred {
            args.push(format!("--set-preferred-mode={p}"));
        }
        args
    }
}

/// Snapshot of one modem from `mmcli -m N -K`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemInfo {
    pub id: u32,
    pub device_id: String,
    pub name: String,
    /// Data interface (`wwan0`), from the `(net)` port.
    pub ifname: Option<String>,
    pub state: String,
    pub signal: u8,
    pub access_tech: Vec<String>,
    pub supported_modes: Vec<ModeCombo>,
    pub current_mode: Option<ModeCombo>,
    pub operator_name: Option<String>,
    pub operator_code: Option<String>,
    pub roaming: bool,
}

pub fn parse_modem_info(id: u32, output: &str) -> Result<ModemInfo, String> {
    let kv = KeyValues::parse(output);
    let device_id = kv
        .get("modem.generic.device-identifier")
        .ok_or("missing device identifier")?
        .to_string();
    let name = [
        kv.get("modem.generic.manufacturer"),
        kv.get("modem.generic.model"),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ");
    let ifname = kv
        .list("modem.generic.ports")
        .iter()
        .find_map(|p| p.strip_suffix(" (net)").map(|n| n.trim().to_string()));
    let mut supported_modes: Vec<ModeCombo> = Vec::new();
    for combo in kv
        .list("modem.generic.supported-modes")
        .iter()
        .filter_map(|m| ModeCombo::parse(m))
    {
        // Several preferred variants per allowed set; the first one wins.
        if !supported_modes.iter().any(|c| c.allowed == combo.allowed) {
            supported_modes.push(combo);
        }
    }

    Ok(ModemInfo {
        id,
        device_id,
        name,
        ifname,
        state: kv.get("modem.generic.state").unwrap_or("unknown").to_string(),
        signal: kv
            .get("modem.generic.signal-quality.value")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        access_tech: kv.list("modem.generic.access-technologies").to_vec(),
        supported_modes,
        current_mode: kv.get("modem.generic.current-modes").and_then(ModeCombo::parse),
        operator_name: kv.get("modem.3gpp.operator-name").map(ToString::to_string),
        operator_code: kv.get("modem.3gpp.operator-code").map(ToString::to_string),
        roaming: kv.get("modem.3gpp.registration-state") == Some("roaming"),
    })
}

/// Modem indexes from `mmcli -L -K`.
pub fn parse_modem_list(output: &str) -> Vec<u32> {
    KeyValues::parse(output)
        .list("modem-list")
        .iter()
        .filter_map(|path| path.rsplit('/').next()?.parse().ok())
        .collect()
}

/// One `--3gpp-scan` row, unfolded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanNetwork {
    pub code: String,
    pub name: String,
    pub availability: String,
}

pub fn parse_scan(output: &str) -> Vec<ScanNetwork> {
    KeyValues::parse(output)
        .list("modem.3gpp.scan-networks")
        .iter()
        .filter_map(|row| {
            let fields: HashMap<&str, &str> = row
                .split(", ")
                .filter_map(|f| f.split_once(": "))
                .map(|(k, v)| (k.trim(), v.trim()))
                .collect();
            let code = fields.get("operator-code")?.to_string();
            Some(ScanNetwork {
                name: fields
                    .get("operator-name")
                    .map_or_else(|| code.clone(), ToString::to_string),
                availability: fields
                    .get("availability")
                    .unwrap_or(&"unknown")
                    .to_string(),
                code,
            })
        })
        .collect()
}

/// Cloneable handle to the `mmcli` binary.
#[derive(Clone)]
pub struct Mmcli {
    runner: SharedRunner,
    program: String,
}

impl Mmcli {
    pub fn new(runner: SharedRunner, program: &str) -> Self {
        Self {
            runner,
            program: program.to_string(),
        }
    }

    pub async fn list_modems(&self) -> Result<Vec<u32>, ToolError> {
        let out = self
            .runner
            .run(&self.program, &["-L".to_string(), "-K".to_string()])
            .await?;
        Ok(parse_modem_list(&out))
    }

    pub async fn modem_info(&self, id: u32) -> Result<ModemInfo, ToolError> {
        let out = self
            .runner
            .run(&self.program, &["-m".to_string(), id.to_string(), "-K".to_string()])
            .await?;
        parse_modem_info(id, &out).map_err(|e| ToolError::Failed { code: 0, stderr: e })
    }

    pub async fn scan(&self, id: u32) -> Result<Vec<ScanNetwork>, ToolError> {
        let args = vec![
            "-m".to_string(),
            id.to_string(),
            "--3gpp-scan".to_string(),
            format!("--timeout={SCAN_TIMEOUT_SECS}"),
            "-K".to_string(),
        ];
        let out = self
            .runner
            .run_with_timeout(
                &self.program,
                &args,
                Duration::from_secs(SCAN_TIMEOUT_SECS + 10),
            )
            .await?;
        Ok(parse_scan(&out))
    }

    pub async fn set_modes(&self, id: u32, combo: &ModeCombo) -> Result<(), ToolError> {
        let mut args = vec!["-m".to_string(), id.to_string()];
        args.extend(combo.set_args());
        self.runner.run(&self.program, &args).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW: &str = "\
modem.dbus-path                                 : /org/freedesktop/ModemManager1/Modem/0
modem.generic.device-identifier                 : 4f2a9c8e1b
modem.generic.manufacturer                      : Sierra Wireless, Incorporated
modem.generic.model                             : EM7455
modem.generic.ports.length                      : 3
modem.generic.ports.value[1]                    : cdc-wdm0 (qmi)
modem.generic.ports.value[2]                    : ttyUSB2 (at)
modem.generic.ports.value[3]                    : wwan0 (net)
modem.generic.state                             : connected
modem.generic.signal-quality.value              : 67
modem.generic.signal-quality.recent             : yes
modem.generic.access-technologies.length        : 1
modem.generic.access-technologies.value[1]      : lte
modem.generic.supported-modes.length            : 4
modem.generic.supported-modes.value[1]          : allowed: 4g; preferred: none
modem.generic.supported-modes.value[2]          : allowed: 3g, 4g; preferred: 4g
modem.generic.supported-modes.value[3]          : allowed: 3g, 4g; preferred: 3g
modem.generic.supported-modes.value[4]          : allowed: 2g, 3g, 4g; preferred: 4g
modem.generic.current-modes                     : allowed: 3g, 4g; preferred: 4g
modem.3gpp.operator-code                        : 310260
modem.3gpp.operator-name                        : T-Mobile
modem.3gpp.registration-state                   : roaming
";

    #[test]
    fn test_parse_modem_info() {
        let info = parse_modem_info(0, SHOW).unwrap();
        assert_eq!(info.device_id, "4f2a9c8e1b");
        assert_eq!(info.name, "Sierra Wireless, Incorporated EM7455");
        assert_eq!(info.ifname.as_deref(), Some("wwan0"));
        assert_eq!(info.signal, 67);
        assert_eq!(info.access_tech, vec!["lte"]);
        let names: Vec<String> = info.supported_modes.iter().map(ModeCombo::name).collect();
        assert_eq!(names, vec!["4g", "3g4g", "2g3g4g"]);
        assert_eq!(info.current_mode.unwrap().name(), "3g4g");
        assert!(info.roaming);
    }

    #[test]
    fn test_parse_modem_info_missing_id() {
        assert!(parse_modem_info(0, "modem.generic.model : X\n").is_err());
    }

    #[test]
    fn test_parse_modem_list() {
        let out = "modem-list.length   : 2\n\
                   modem-list.value[1] : /org/freedesktop/ModemManager1/Modem/0\n\
                   modem-list.value[2] : /org/freedesktop/ModemManager1/Modem/3\n";
        assert_eq!(parse_modem_list(out), vec![0, 3]);
        assert!(parse_modem_list("modem-list.length : 0\n").is_empty());
    }

    #[test]
    fn test_parse_scan() {
        let out = "modem.3gpp.scan-networks.length : 2\n\
            modem.3gpp.scan-networks.value[1] : operator-code: 310260, operator-name: T-Mobile, access-technologies: lte, availability: current\n\
            modem.3gpp.scan-networks.value[2] : operator-code: 310410, operator-name: AT&T, access-technologies: umts, availability: forbidden\n";
        let rows = parse_scan(out);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].code, "310260");
        assert_eq!(rows[0].availability, "current");
        assert_eq!(rows[1].name, "AT&T");
    }

    #[test]
    fn test_mode_combo_args() {
        let combo = ModeCombo::parse("allowed: 3g, 4g; preferred: 4g").unwrap();
        assert_eq!(
            combo.set_args(),
            vec!["--set-allowed-modes=3g|4g", "--set-preferred-mode=4g"]
        );
        let single = ModeCombo::parse("allowed: 4g; preferred: none").unwrap();
        assert_eq!(single.set_args(), vec!["--set-allowed-modes=4g"]);
        assert!(ModeCombo::parse("preferred: none").is_none());
    }
}
