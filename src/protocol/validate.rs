//! Config validation run between the builders and the lifecycle controller

use super::{OutboundConfig, TlsSettings, TransportSettings, RESERVED_TAGS};
use crate::error::{Result, VpnError};
use std::collections::HashSet;

pub const VMESS_SECURITY: [&str; 5] = ["auto", "aes-128-gcm", "chacha20-poly1305", "none", "zero"];
pub const NETWORKS: [&str; 5] = ["tcp", "ws", "grpc", "http", "quic"];
pub const VLESS_FLOWS: [&str; 2] = ["", "xtls-rprx-vision"];
pub const SHADOWSOCKS_METHODS: [&str; 9] = [
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "xchacha20-ietf-poly1305",
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "2022-blake3-chacha20-poly1305",
    "none",
];

/// Validate one outbound against the tags already present in the target session
pub fn validate(config: &OutboundConfig, existing_tags: &HashSet<String>) -> Result<()> {
    let tag = config.tag();
    if tag.trim().is_empty() {
        return Err(VpnError::validation("tag", "must not be empty"));
    }
    if RESERVED_TAGS.contains(&tag) {
        return Err(VpnError::validation(
            "tag",
            format!("'{tag}' is reserved for a built-in outbound"),
        ));
    }
    if existing_tags.contains(tag) {
        return Err(VpnError::validation(
            "tag",
            format!("'{tag}' is already used in this session"),
        ));
    }

    let server = config.server();
    if server.is_empty() {
        return Err(VpnError::validation("server", "must not be empty"));
    }
    if server.chars().any(char::is_whitespace) {
        return Err(VpnError::validation(
            "server",
            format!("'{server}' contains whitespace"),
        ));
    }
    if config.port() == 0 {
        return Err(VpnError::validation("port", "must be between 1 and 65535"));
    }

    match config {
        OutboundConfig::Vmess(c) => {
            one_of("security", &c.security, &VMESS_SECURITY)?;
            check_transport(c.transport.as_ref())?;
            check_tls(c.tls.as_ref())?;
        }
        OutboundConfig::Trojan(c) => {
            non_blank("password", &c.password)?;
            check_transport(c.transport.as_ref())?;
            check_tls(Some(&c.tls))?;
        }
        OutboundConfig::Vless(c) => {
            one_of("flow", &c.flow, &VLESS_FLOWS)?;
            check_transport(c.transport.as_ref())?;
            check_tls(c.tls.as_ref())?;
        }
        OutboundConfig::Shadowsocks(c) => {
            one_of("method", &c.method, &SHADOWSOCKS_METHODS)?;
            non_blank("password", &c.password)?;
        }
        OutboundConfig::WireGuard(c) => {
            if c.local_address.is_empty() {
                return Err(VpnError::validation(
                    "local_address",
                    "at least one address is required",
                ));
            }
        }
        OutboundConfig::Tuic(c) => {
            non_blank("password", &c.password)?;
            check_tls(Some(&c.tls))?;
        }
        OutboundConfig::Hysteria(c) => {
            non_blank("auth", &c.auth)?;
            if let Some(obfs) = &c.obfs {
                non_blank("obfs", obfs)?;
            }
            check_tls(Some(&c.tls))?;
        }
    }

    Ok(())
}

/// Validate a list of outbounds destined for one session.
///
/// Returns the accepted configs in order and the index and error of every
/// rejected one. Tags must be unique across the accepted set.
pub fn validate_batch(
    configs: Vec<OutboundConfig>,
) -> (Vec<OutboundConfig>, Vec<(usize, VpnError)>) {
    let mut seen = HashSet::new();
    let mut accepted = Vec::with_capacity(configs.len());
    let mut rejected = Vec::new();

    for (index, config) in configs.into_iter().enumerate() {
        match validate(&config, &seen) {
            Ok(()) => {
                seen.insert(config.tag().to_string());
                accepted.push(config);
            }
            Err(e) => rejected.push((index, e)),
        }
    }

    (accepted, rejected)
}

fn one_of(field: &str, value: &str, allowed: &[&str]) -> Result<()> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(VpnError::validation(
            field,
            format!("'{value}' is not one of {}", allowed.join(", ")),
        ))
    }
}

fn non_blank(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(VpnError::validation(field, "must not be blank"));
    }
    Ok(())
}

fn check_transport(transport: Option<&TransportSettings>) -> Result<()> {
    match transport {
        Some(t) => one_of("network", &t.network, &NETWORKS),
        None => Ok(()),
    }
}

fn check_tls(tls: Option<&TlsSettings>) -> Result<()> {
    let Some(tls) = tls else {
        return Ok(());
    };
    if let Some(sni) = &tls.server_name {
        if sni.is_empty() || sni.chars().any(char::is_whitespace) {
            return Err(VpnError::validation(
                "sni",
                format!("'{sni}' is not a valid server name"),
            ));
        }
    }
    if tls.alpn.iter().any(|p| p.trim().is_empty()) {
        return Err(VpnError::validation("alpn", "contains an empty protocol"));
    }
    Ok(())
}
