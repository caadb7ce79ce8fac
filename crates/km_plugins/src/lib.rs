#![forbid(unsafe_code)]
//! Out-of-process observer plugins for the `km` wiretap.
//!
//! A plugin is a separately compiled binary the wrapper spawns, handshakes
//! with over a magic-cookie protocol, and talks to via JSON-RPC on the
//! endpoint the plugin advertises. This crate covers the whole lifecycle:
//! discovery on disk ([`Discovery`]), packaged `.kmpkg` archives
//! ([`package`]), the authorization-gated runtime ([`PluginHost`]), the
//! verified manifest/install pipeline ([`Installer`]), and the persisted
//! [`Registry`].

mod discovery;
mod error;
mod host;
mod install;
pub mod package;
mod registry;
pub mod rpc;

pub use discovery::{Discovery, PluginBinary, PLUGIN_PREFIX};
pub use error::PluginError;
pub use host::{HostConfig, LoadOutcome, PluginHost};
pub use install::{Installer, Progress, UpdateOutcome};
pub use registry::{Registry, RegistryDoc, RegistryEntry};
pub use rpc::{
    parse_handshake, Handshake, PluginAuthResult, PluginInfo, PluginProcess, ProtocolKind,
    RpcClient, CORE_PROTOCOL_VERSION, DISPENSE_NAME, HANDSHAKE_COOKIE_KEY, HANDSHAKE_COOKIE_VALUE,
};
