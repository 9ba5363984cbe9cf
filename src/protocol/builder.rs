//! Protocol config builders
//!
//! Each builder takes the flat string parameters a host passes in and
//! produces a typed [`OutboundConfig`]. Required fields must be non-blank,
//! numeric fields must parse and be in range, and encoded values (UUIDs,
//! WireGuard keys, CIDR prefixes) are checked, never coerced.

use super::{
    Endpoint, HysteriaOutbound, OutboundConfig, ShadowsocksOutbound, TlsSettings,
    TransportSettings, TrojanOutbound, TuicOutbound, VlessOutbound, VmessOutbound,
    WireGuardOutbound,
};
use crate::error::{Result, VpnError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ipnet::IpNet;
use uuid::Uuid;

const WIREGUARD_KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, Default)]
pub struct VmessParams<'a> {
    pub server: &'a str,
    pub port: &'a str,
    pub uuid: &'a str,
    pub security: &'a str,
    pub alter_id: &'a str,
    pub network: &'a str,
    pub path: &'a str,
    pub host: &'a str,
    pub tls: &'a str,
    pub sni: &'a str,
    pub tag: &'a str,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrojanParams<'a> {
    pub server: &'a str,
    pub port: &'a str,
    pub password: &'a str,
    pub sni: &'a str,
    pub network: &'a str,
    pub path: &'a str,
    pub host: &'a str,
    pub tag: &'a str,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VlessParams<'a> {
    pub server: &'a str,
    pub port: &'a str,
    pub uuid: &'a str,
    pub flow: &'a str,
    pub security: &'a str,
    pub sni: &'a str,
    pub network: &'a str,
    pub path: &'a str,
    pub host: &'a str,
    pub tag: &'a str,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShadowsocksParams<'a> {
    pub server: &'a str,
    pub port: &'a str,
    pub method: &'a str,
    pub password: &'a str,
    pub tag: &'a str,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WireGuardParams<'a> {
    pub server: &'a str,
    pub port: &'a str,
    pub private_key: &'a str,
    pub peer_public_key: &'a str,
    /// One or more CIDR prefixes, comma separated
    pub local_address: &'a str,
    pub tag: &'a str,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TuicParams<'a> {
    pub server: &'a str,
    pub port: &'a str,
    pub uuid: &'a str,
    pub password: &'a str,
    pub alpn: &'a str,
    pub sni: &'a str,
    pub tag: &'a str,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HysteriaParams<'a> {
    pub server: &'a str,
    pub port: &'a str,
    pub auth: &'a str,
    pub alpn: &'a str,
    pub sni: &'a str,
    pub obfs: &'a str,
    pub tag: &'a str,
}

/// Build a VMess outbound
pub fn vmess(p: &VmessParams<'_>) -> Result<OutboundConfig> {
    let endpoint = endpoint(p.server, p.port, p.tag)?;
    let uuid = parse_uuid("uuid", p.uuid)?;
    let alter_id = if p.alter_id.is_empty() {
        0
    } else {
        p.alter_id.parse::<u32>().map_err(|_| {
            VpnError::invalid_parameter("alter_id", "must be a non-negative integer")
        })?
    };
    let security = if p.security.is_empty() {
        "auto".to_string()
    } else {
        p.security.to_string()
    };

    let tls_enabled = parse_tls_flag("tls", p.tls)?;
    let tls = (tls_enabled || !p.sni.is_empty()).then(|| tls_settings(tls_enabled, p.sni, ""));

    Ok(OutboundConfig::Vmess(VmessOutbound {
        endpoint,
        uuid,
        security,
        alter_id,
        transport: transport(p.network, p.path, p.host),
        tls,
    }))
}

/// Build a Trojan outbound (TLS is always on)
pub fn trojan(p: &TrojanParams<'_>) -> Result<OutboundConfig> {
    let endpoint = endpoint(p.server, p.port, p.tag)?;
    let password = required("password", p.password)?;

    Ok(OutboundConfig::Trojan(TrojanOutbound {
        endpoint,
        password,
        tls: tls_settings(true, p.sni, ""),
        transport: transport(p.network, p.path, p.host),
    }))
}

/// Build a VLESS outbound
pub fn vless(p: &VlessParams<'_>) -> Result<OutboundConfig> {
    let endpoint = endpoint(p.server, p.port, p.tag)?;
    let uuid = parse_uuid("uuid", p.uuid)?;

    let tls_enabled = parse_tls_flag("security", p.security)?;
    let tls = (tls_enabled || !p.sni.is_empty()).then(|| tls_settings(tls_enabled, p.sni, ""));

    Ok(OutboundConfig::Vless(VlessOutbound {
        endpoint,
        uuid,
        flow: p.flow.to_string(),
        tls,
        transport: transport(p.network, p.path, p.host),
    }))
}

/// Build a Shadowsocks outbound
pub fn shadowsocks(p: &ShadowsocksParams<'_>) -> Result<OutboundConfig> {
    let endpoint = endpoint(p.server, p.port, p.tag)?;

    Ok(OutboundConfig::Shadowsocks(ShadowsocksOutbound {
        endpoint,
        method: required("method", p.method)?,
        password: required("password", p.password)?,
    }))
}

/// Build a WireGuard outbound
pub fn wireguard(p: &WireGuardParams<'_>) -> Result<OutboundConfig> {
    let endpoint = endpoint(p.server, p.port, p.tag)?;

    Ok(OutboundConfig::WireGuard(WireGuardOutbound {
        endpoint,
        private_key: parse_wireguard_key("private_key", p.private_key)?,
        peer_public_key: parse_wireguard_key("peer_public_key", p.peer_public_key)?,
        local_address: parse_local_addresses(p.local_address)?,
    }))
}

/// Build a TUIC outbound (TLS is always on)
pub fn tuic(p: &TuicParams<'_>) -> Result<OutboundConfig> {
    let endpoint = endpoint(p.server, p.port, p.tag)?;

    Ok(OutboundConfig::Tuic(TuicOutbound {
        endpoint,
        uuid: parse_uuid("uuid", p.uuid)?,
        password: required("password", p.password)?,
        tls: tls_settings(true, p.sni, p.alpn),
    }))
}

/// Build a Hysteria outbound (TLS is always on)
pub fn hysteria(p: &HysteriaParams<'_>) -> Result<OutboundConfig> {
    let endpoint = endpoint(p.server, p.port, p.tag)?;

    Ok(OutboundConfig::Hysteria(HysteriaOutbound {
        endpoint,
        auth: required("auth", p.auth)?,
        obfs: optional(p.obfs),
        tls: tls_settings(true, p.sni, p.alpn),
    }))
}

fn endpoint(server: &str, port: &str, tag: &str) -> Result<Endpoint> {
    Ok(Endpoint {
        server: required("server", server)?,
        port: parse_port(port)?,
        tag: required("tag", tag)?,
    })
}

fn required(field: &str, value: &str) -> Result<String> {
    if value.trim().is_empty() {
        return Err(VpnError::invalid_parameter(field, "is required"));
    }
    Ok(value.to_string())
}

fn optional(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Parse a textual port, accepting only 1..=65535
pub fn parse_port(value: &str) -> Result<u16> {
    if value.trim().is_empty() {
        return Err(VpnError::invalid_parameter("port", "is required"));
    }
    let port = value
        .parse::<u32>()
        .map_err(|_| VpnError::invalid_parameter("port", format!("'{value}' is not numeric")))?;
    match u16::try_from(port) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(VpnError::invalid_parameter(
            "port",
            format!("{port} is outside 1-65535"),
        )),
    }
}

fn parse_uuid(field: &str, value: &str) -> Result<String> {
    required(field, value)?;
    // Hyphenated 8-4-4-4-12 form only; simple/braced/urn forms are rejected.
    if value.len() != 36 || Uuid::try_parse(value).is_err() {
        return Err(VpnError::invalid_parameter(
            field,
            "must be an RFC 4122 UUID (8-4-4-4-12 hex)",
        ));
    }
    Ok(value.to_string())
}

fn parse_wireguard_key(field: &str, value: &str) -> Result<String> {
    required(field, value)?;
    match STANDARD.decode(value) {
        Ok(bytes) if bytes.len() == WIREGUARD_KEY_LEN => Ok(value.to_string()),
        Ok(bytes) => Err(VpnError::invalid_parameter(
            field,
            format!("decodes to {} bytes, expected {WIREGUARD_KEY_LEN}", bytes.len()),
        )),
        Err(e) => Err(VpnError::invalid_parameter(
            field,
            format!("is not valid base64: {e}"),
        )),
    }
}

fn parse_local_addresses(value: &str) -> Result<Vec<String>> {
    required("local_address", value)?;
    value
        .split(',')
        .map(str::trim)
        .map(|prefix| {
            prefix
                .parse::<IpNet>()
                .map(|net| net.to_string())
                .map_err(|_| {
                    VpnError::invalid_parameter(
                        "local_address",
                        format!("'{prefix}' is not a CIDR prefix"),
                    )
                })
        })
        .collect()
}

fn parse_tls_flag(field: &str, value: &str) -> Result<bool> {
    match value {
        "" | "none" => Ok(false),
        "tls" => Ok(true),
        other => Err(VpnError::invalid_parameter(
            field,
            format!("'{other}' must be 'tls' or 'none'"),
        )),
    }
}

fn tls_settings(enabled: bool, sni: &str, alpn: &str) -> TlsSettings {
    TlsSettings {
        enabled,
        server_name: optional(sni),
        alpn: alpn
            .split(',')
            .map(str::trim)
            .filter(|proto| !proto.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

fn transport(network: &str, path: &str, host: &str) -> Option<TransportSettings> {
    match network {
        "" | "tcp" => None,
        "grpc" => Some(TransportSettings {
            network: "grpc".to_string(),
            path: None,
            host: None,
            service_name: optional(path),
        }),
        network => Some(TransportSettings {
            network: network.to_string(),
            path: optional(path),
            host: optional(host),
            service_name: None,
        }),
    }
}
