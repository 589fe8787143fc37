//! Streaming configuration document (`config.json` in the data dir).
//!
//! The daemon only owns the relay-related keys and the remote key. All other
//! keys belong to the streaming pipeline and are carried through unchanged.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::util::{read_json, write_json};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_account: Option<String>,
    /// Manually entered relay address, superseded by `relay_server`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srtla_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srtla_port: Option<u16>,
    /// Manually entered stream id, superseded by `relay_account`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srt_streamid: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StreamConfig {
    /// UI view. The remote key is reported as set/unset only.
    pub fn status_message(&self) -> Value {
        let mut view = serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()));
        if let Some(obj) = view.as_object_mut() {
            obj.remove("remote_key");
            obj.insert("remote_key_set".into(), Value::Bool(self.remote_key.is_some()));
        }
        view
    }
}

/// In-memory copy of the document plus its on-disk location.
#[derive(Debug)]
pub struct StreamConfigStore {
    path: PathBuf,
    config: StreamConfig,
}

impl StreamConfigStore {
    /// Load from `path`; a missing file is an empty document.
    pub async fn load(path: &Path) -> Result<Self, String> {
        let config = read_json(path).await?.unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    pub fn get(&self) -> &StreamConfig {
        &self.config
    }

    /// Apply `f` and persist if the document changed. Returns whether it did.
    pub async fn update<F>(&mut self, f: F) -> Result<bool, String>
    where
        F: FnOnce(&mut StreamConfig),
    {
        let mut next = self.config.clone();
        f(&mut next);
        if next == self.config {
            return Ok(false);
        }
        write_json(&self.path, &next).await?;
        self.config = next;
        info!("Stream config saved to {}", self.path.display());
        Ok(true)
    }
}
