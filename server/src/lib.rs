#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! encctl library: the building blocks of the encoder control daemon.
//!
//! - `tool`: external command runner (`nmcli`, `mmcli`, `ip`)
//! - `nmcli`: NetworkManager CLI wrapper and terse-output parsing
//! - `netif`: network interface tracker
//! - `wifi`: WiFi state store, client operations, hotspot controller
//! - `modems`: cellular modem controller
//! - `remote`: cloud relay client, DNS cache, relay cache
//! - `stream_config`: persisted streaming configuration
//! - `status`: broadcast envelopes and per-field diffing
//! - `auth`: API key check shared by the REST middleware and the UI WebSocket
//! - `config`: configuration loading
//! - `routes`: REST API route handlers
//! - `ws`: UI WebSocket protocol handling

pub mod auth;
pub mod config;
pub mod modems;
pub mod netif;
pub mod nmcli;
pub mod remote;
pub mod routes;
pub mod state;
pub mod status;
pub mod stream_config;
pub mod tool;
pub mod util;
pub mod wifi;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use state::AppState;
