//! Shared data types for the multiplex controller: endpoint descriptors,
//! the transport/network-family discriminators, user records, and the
//! structured error type returned at the controller's user-visible
//! boundary.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether an endpoint carries a stream- or datagram-oriented underlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    Stream,
    Datagram,
}

/// The network family discriminator embedded in an address, per the four
/// literal strings recognized by the facade (`tcp`/`tcp4`/`tcp6` and
/// `udp`/`udp4`/`udp6`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkFamily {
    V4Stream,
    V6Stream,
    V4Datagram,
    V6Datagram,
}

impl TransportKind {
    pub fn is_stream(self) -> bool {
        matches!(self, TransportKind::Stream)
    }
}

/// Parses one of the network literal strings the facade recognizes into a
/// `(TransportKind, NetworkFamily)` pair, or `None` for anything else.
pub fn parse_network(network: &str) -> Option<(TransportKind, NetworkFamily)> {
    match network {
        "tcp" | "tcp4" => Some((TransportKind::Stream, NetworkFamily::V4Stream)),
        "tcp6" => Some((TransportKind::Stream, NetworkFamily::V6Stream)),
        "udp" | "udp4" => Some((TransportKind::Datagram, NetworkFamily::V4Datagram)),
        "udp6" => Some((TransportKind::Datagram, NetworkFamily::V6Datagram)),
        _ => None,
    }
}

/// An endpoint the controller can dial (client) or bind (server).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Endpoint {
    pub network: String,
    pub local_address: Option<SocketAddr>,
    pub remote_address: Option<SocketAddr>,
    pub mtu: u32,
}

impl Endpoint {
    /// Validates the `network` string and returns the parsed transport kind
    /// and network family. Anything outside the six recognized literals is
    /// a configuration error surfaced to the accept-error slot (spec §6).
    pub fn parsed_network(&self) -> Result<(TransportKind, NetworkFamily), MuxError> {
        parse_network(&self.network).ok_or_else(|| MuxError::UnsupportedNetwork {
            network: self.network.clone(),
        })
    }

    pub fn transport(&self) -> Result<TransportKind, MuxError> {
        self.parsed_network().map(|(t, _)| t)
    }
}

/// A single user's credentials as recognized by the server-side `users`
/// configuration option.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    pub plaintext_password: Option<String>,
    pub hashed_password_hex: Option<String>,
}

pub type Users = HashMap<String, UserRecord>;

/// Structured errors surfaced to callers at the controller's user-visible
/// boundary (spec §7). Role-misuse and post-use-reconfiguration are
/// programming errors and are not represented here — they panic at the
/// call site instead.
#[derive(Debug, Error, Clone)]
pub enum MuxError {
    #[error("client password is empty")]
    NoPassword,
    #[error("server has no configured users")]
    NoUsers,
    #[error("no endpoints configured")]
    NoEndpoints,
    #[error("endpoint is missing the address required for this role")]
    MissingAddress,
    #[error("unsupported network {network:?}")]
    UnsupportedNetwork { network: String },
    #[error("failed to open underlay: {0}")]
    DialFailed(String),
    #[error("failed to attach session to underlay: {0}")]
    AttachFailed(String),
    #[error("controller is closed")]
    Closed,
    #[error("listener failed: {0}")]
    ListenFailed(String),
}

/// The on-disk shape of a controller's configuration, mirroring
/// `geph5-exit`'s own `ConfigFile` pattern (plain `Deserialize` struct,
/// `#[serde(default = "...")]` for optional knobs). Parsing this out of a
/// YAML file is left to the embedding process; this type only defines the
/// shape the controller's setters accept once parsed.
#[derive(Clone, Debug, Deserialize)]
pub struct ControllerConfigFile {
    pub endpoints: Vec<Endpoint>,

    /// Client-only: empty for a server config.
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_multiplex_factor")]
    pub multiplex_factor: u32,

    /// Server-only: empty for a client config.
    #[serde(default)]
    pub users: Users,
}

impl ControllerConfigFile {
    /// Parses a config file's raw bytes, mirroring the
    /// `serde_yaml::from_slice` call `geph5-exit`'s `main` makes against its
    /// own `ConfigFile`.
    pub fn from_yaml_slice(bytes: &[u8]) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_slice(bytes)
    }
}

fn default_multiplex_factor() -> u32 {
    4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_networks() {
        assert_eq!(
            parse_network("tcp"),
            Some((TransportKind::Stream, NetworkFamily::V4Stream))
        );
        assert_eq!(
            parse_network("tcp6"),
            Some((TransportKind::Stream, NetworkFamily::V6Stream))
        );
        assert_eq!(
            parse_network("udp4"),
            Some((TransportKind::Datagram, NetworkFamily::V4Datagram))
        );
        assert_eq!(parse_network("sctp"), None);
    }

    #[test]
    fn controller_config_file_applies_defaults() {
        let yaml = b"endpoints: []\npassword: hunter2\n";
        let parsed = ControllerConfigFile::from_yaml_slice(yaml).unwrap();
        assert_eq!(parsed.password.as_deref(), Some("hunter2"));
        assert_eq!(parsed.multiplex_factor, 4);
        assert!(parsed.users.is_empty());
    }

    #[test]
    fn endpoint_rejects_unsupported_network() {
        let ep = Endpoint {
            network: "sctp".to_string(),
            local_address: None,
            remote_address: None,
            mtu: 1400,
        };
        assert!(matches!(
            ep.parsed_network(),
            Err(MuxError::UnsupportedNetwork { .. })
        ));
    }
}
