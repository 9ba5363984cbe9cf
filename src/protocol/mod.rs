//! Outbound configuration model for the supported proxy protocols
//!
//! An [`OutboundConfig`] is a value type: builders create it, the validator
//! checks it and the lifecycle controller takes a copy of it when a tunnel
//! starts. Its serialized form is the engine's outbound JSON object.

use crate::error::{Result, VpnError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

pub mod builder;
pub mod validate;

pub use builder::{
    HysteriaParams, ShadowsocksParams, TrojanParams, TuicParams, VlessParams, VmessParams,
    WireGuardParams,
};
pub use validate::{validate, validate_batch};

/// Tags of the built-in outbounds every engine document carries
pub const RESERVED_TAGS: [&str; 2] = ["direct", "block"];

/// Proxy protocol of an outbound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Vmess,
    Trojan,
    Vless,
    Shadowsocks,
    WireGuard,
    Tuic,
    Hysteria,
}

impl Protocol {
    pub const ALL: [Protocol; 7] = [
        Protocol::Vmess,
        Protocol::Trojan,
        Protocol::Vless,
        Protocol::Shadowsocks,
        Protocol::WireGuard,
        Protocol::Tuic,
        Protocol::Hysteria,
    ];

    /// Engine type name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Trojan => "trojan",
            Protocol::Vless => "vless",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::WireGuard => "wireguard",
            Protocol::Tuic => "tuic",
            Protocol::Hysteria => "hysteria",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields shared by every outbound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Unique identifier used for routing and selection
    pub tag: String,
    /// Server hostname or IP address
    pub server: String,
    /// Server port
    #[serde(rename = "server_port")]
    pub port: u16,
}

/// TLS settings of an outbound
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
}

/// Stream transport layered under the proxy protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Transport network (ws, grpc, http, quic)
    #[serde(rename = "type")]
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// gRPC service name; set instead of `path` for grpc
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmessOutbound {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub uuid: String,
    pub security: String,
    #[serde(default)]
    pub alter_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrojanOutbound {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub password: String,
    pub tls: TlsSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlessOutbound {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub uuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flow: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowsocksOutbound {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub method: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireGuardOutbound {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub private_key: String,
    pub peer_public_key: String,
    pub local_address: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuicOutbound {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub uuid: String,
    pub password: String,
    pub tls: TlsSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HysteriaOutbound {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    #[serde(rename = "auth_str")]
    pub auth: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obfs: Option<String>,
    pub tls: TlsSettings,
}

/// A configured remote proxy endpoint and the protocol used to reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundConfig {
    Vmess(VmessOutbound),
    Trojan(TrojanOutbound),
    Vless(VlessOutbound),
    Shadowsocks(ShadowsocksOutbound),
    #[serde(rename = "wireguard")]
    WireGuard(WireGuardOutbound),
    Tuic(TuicOutbound),
    Hysteria(HysteriaOutbound),
}

impl OutboundConfig {
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        match self {
            OutboundConfig::Vmess(_) => Protocol::Vmess,
            OutboundConfig::Trojan(_) => Protocol::Trojan,
            OutboundConfig::Vless(_) => Protocol::Vless,
            OutboundConfig::Shadowsocks(_) => Protocol::Shadowsocks,
            OutboundConfig::WireGuard(_) => Protocol::WireGuard,
            OutboundConfig::Tuic(_) => Protocol::Tuic,
            OutboundConfig::Hysteria(_) => Protocol::Hysteria,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        match self {
            OutboundConfig::Vmess(c) => &c.endpoint,
            OutboundConfig::Trojan(c) => &c.endpoint,
            OutboundConfig::Vless(c) => &c.endpoint,
            OutboundConfig::Shadowsocks(c) => &c.endpoint,
            OutboundConfig::WireGuard(c) => &c.endpoint,
            OutboundConfig::Tuic(c) => &c.endpoint,
            OutboundConfig::Hysteria(c) => &c.endpoint,
        }
    }

    pub fn tag(&self) -> &str {
        &self.endpoint().tag
    }

    pub fn server(&self) -> &str {
        &self.endpoint().server
    }

    pub fn port(&self) -> u16 {
        self.endpoint().port
    }

    /// Serialize as the engine's outbound JSON object
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a host-supplied config: either one outbound object or a full
    /// engine document whose first non built-in outbound is taken.
    pub fn from_json(input: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(input)?;

        let candidate = match value.get("outbounds") {
            Some(Value::Array(outbounds)) => outbounds
                .iter()
                .find(|o| {
                    o.get("tag")
                        .and_then(Value::as_str)
                        .map_or(true, |tag| !RESERVED_TAGS.contains(&tag))
                })
                .cloned()
                .ok_or_else(|| {
                    VpnError::Parse("Engine document has no proxy outbound".to_string())
                })?,
            Some(_) => {
                return Err(VpnError::Parse(
                    "'outbounds' must be an array".to_string(),
                ))
            }
            None => value,
        };

        Ok(serde_json::from_value(candidate)?)
    }

    /// Wrap this outbound into a complete engine options document
    pub fn to_engine_document(&self, log_level: &str) -> Result<Value> {
        let outbound = serde_json::to_value(self)?;
        Ok(json!({
            "log": { "level": log_level },
            "outbounds": [
                outbound,
                { "type": "direct", "tag": "direct" },
                { "type": "block", "tag": "block" },
            ],
            "route": { "final": self.tag() },
        }))
    }
}

impl fmt::Display for OutboundConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}:{}",
            self.tag(),
            self.protocol(),
            self.server(),
            self.port()
        )
    }
}
