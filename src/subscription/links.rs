//! Share-link decoding (`vmess://`, `trojan://`, `vless://`, `ss://`,
//! `tuic://`, `hysteria://`)
//!
//! Links are split by hand rather than through a URL parser: the userinfo
//! part of `ss://` links is raw base64 and hosts may be bracketed IPv6
//! literals. Every link ends up in the protocol builders, so the checks
//! applied to host-supplied parameters apply here too.

use super::{DecodedEntry, SubscriptionDecoder};
use crate::error::{Result, VpnError};
use crate::protocol::builder::{
    self, HysteriaParams, ShadowsocksParams, TrojanParams, TuicParams, VlessParams, VmessParams,
};
use crate::protocol::OutboundConfig;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;

/// Decoder for newline separated share links, optionally base64 wrapped
#[derive(Debug, Clone, Copy, Default)]
pub struct ShareLinkDecoder;

impl SubscriptionDecoder for ShareLinkDecoder {
    fn decode(&self, document: &str) -> Vec<DecodedEntry> {
        unwrap_document(document)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| DecodedEntry {
                raw: line.to_string(),
                config: parse_link(line),
            })
            .collect()
    }
}

/// Parse a single share link into an outbound
pub fn parse_link(link: &str) -> Result<OutboundConfig> {
    let (scheme, body) = link
        .split_once("://")
        .ok_or_else(|| VpnError::Parse("entry is not a share link".to_string()))?;

    match scheme.to_ascii_lowercase().as_str() {
        "vmess" => parse_vmess(body),
        "trojan" => parse_trojan(body),
        "vless" => parse_vless(body),
        "ss" => parse_shadowsocks(body),
        "tuic" => parse_tuic(body),
        "hysteria" => parse_hysteria(body),
        other => Err(VpnError::Parse(format!("unsupported scheme '{other}'"))),
    }
}

fn unwrap_document(document: &str) -> Cow<'_, str> {
    let compact: String = document.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Cow::Borrowed(document);
    }
    match decode_base64(&compact).map(String::from_utf8) {
        Some(Ok(text)) => Cow::Owned(text),
        _ => Cow::Borrowed(document),
    }
}

fn decode_base64(input: &str) -> Option<Vec<u8>> {
    [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(input).ok())
}

fn decode_text(field: &str, input: &str) -> Result<String> {
    let bytes = decode_base64(input)
        .ok_or_else(|| VpnError::Parse(format!("{field} is not valid base64")))?;
    String::from_utf8(bytes).map_err(|_| VpnError::Parse(format!("{field} is not UTF-8 text")))
}

fn percent_decode(input: &str) -> Result<String> {
    urlencoding::decode(input)
        .map(Cow::into_owned)
        .map_err(|_| VpnError::Parse(format!("'{input}' is not valid percent-encoding")))
}

/// `[userinfo@]host:port[/][?query][#name]`
#[derive(Debug)]
struct LinkParts<'a> {
    userinfo: Option<&'a str>,
    host: &'a str,
    port: &'a str,
    params: HashMap<String, String>,
    name: Option<String>,
}

impl LinkParts<'_> {
    fn param(&self, key: &str) -> &str {
        self.params.get(key).map_or("", String::as_str)
    }

    /// Link name, or `host:port` when the link carries none
    fn tag(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

fn split_link(body: &str) -> Result<LinkParts<'_>> {
    let (main, name) = match body.split_once('#') {
        Some((main, name)) => (main, Some(percent_decode(name)?)),
        None => (body, None),
    };
    let (main, query) = main.split_once('?').unwrap_or((main, ""));
    let (userinfo, authority) = match main.rsplit_once('@') {
        Some((userinfo, authority)) => (Some(userinfo), authority),
        None => (None, main),
    };

    let authority = authority.trim_end_matches('/');
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| VpnError::Parse(format!("'{authority}' has no port")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let mut params = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(key.to_string(), percent_decode(value)?);
    }

    Ok(LinkParts {
        userinfo,
        host,
        port,
        params,
        name,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VmessLink {
    ps: String,
    add: String,
    #[serde(deserialize_with = "string_or_number")]
    port: String,
    id: String,
    #[serde(deserialize_with = "string_or_number")]
    aid: String,
    scy: String,
    net: String,
    path: String,
    host: String,
    tls: String,
    sni: String,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(D::Error::custom(format!(
            "expected a string or number, got {other}"
        ))),
    }
}

fn parse_vmess(body: &str) -> Result<OutboundConfig> {
    let json = decode_text("vmess payload", body.trim())?;
    let link: VmessLink = serde_json::from_str(&json)?;
    let tag = if link.ps.trim().is_empty() {
        format!("{}:{}", link.add, link.port)
    } else {
        link.ps.trim().to_string()
    };

    builder::vmess(&VmessParams {
        server: &link.add,
        port: &link.port,
        uuid: &link.id,
        security: &link.scy,
        alter_id: &link.aid,
        network: &link.net,
        path: &link.path,
        host: &link.host,
        tls: &link.tls,
        sni: &link.sni,
        tag: &tag,
    })
}

fn parse_trojan(body: &str) -> Result<OutboundConfig> {
    let link = split_link(body)?;
    let password = percent_decode(link.userinfo.unwrap_or(""))?;
    let sni = first_non_empty(link.param("sni"), link.param("peer"));
    let path = first_non_empty(link.param("path"), link.param("serviceName"));

    builder::trojan(&TrojanParams {
        server: link.host,
        port: link.port,
        password: &password,
        sni,
        network: link.param("type"),
        path,
        host: link.param("host"),
        tag: &link.tag(),
    })
}

fn parse_vless(body: &str) -> Result<OutboundConfig> {
    let link = split_link(body)?;
    let uuid = percent_decode(link.userinfo.unwrap_or(""))?;
    let path = first_non_empty(link.param("path"), link.param("serviceName"));

    builder::vless(&VlessParams {
        server: link.host,
        port: link.port,
        uuid: &uuid,
        flow: link.param("flow"),
        security: link.param("security"),
        sni: link.param("sni"),
        network: link.param("type"),
        path,
        host: link.param("host"),
        tag: &link.tag(),
    })
}

fn parse_shadowsocks(body: &str) -> Result<OutboundConfig> {
    let (main, name) = body.split_once('#').unwrap_or((body, ""));

    // Legacy form: base64("method:password@host:port")
    if !main.contains('@') {
        let main = main.split_once('?').map_or(main, |(main, _)| main);
        let expanded = decode_text("ss payload", main.trim_end_matches('/'))?;
        let rebuilt = if name.is_empty() {
            expanded
        } else {
            format!("{expanded}#{name}")
        };
        if !rebuilt.contains('@') {
            return Err(VpnError::Parse("ss payload has no server part".to_string()));
        }
        return parse_shadowsocks(&rebuilt);
    }

    let link = split_link(body)?;
    let userinfo = percent_decode(link.userinfo.unwrap_or(""))?;
    let credentials = if userinfo.contains(':') {
        userinfo
    } else {
        decode_text("ss userinfo", &userinfo)?
    };
    let (method, password) = credentials
        .split_once(':')
        .ok_or_else(|| VpnError::Parse("ss userinfo must be method:password".to_string()))?;

    builder::shadowsocks(&ShadowsocksParams {
        server: link.host,
        port: link.port,
        method,
        password,
        tag: &link.tag(),
    })
}

fn parse_tuic(body: &str) -> Result<OutboundConfig> {
    let link = split_link(body)?;
    let userinfo = percent_decode(link.userinfo.unwrap_or(""))?;
    let (uuid, password) = userinfo.split_once(':').unwrap_or((userinfo.as_str(), ""));

    builder::tuic(&TuicParams {
        server: link.host,
        port: link.port,
        uuid,
        password,
        alpn: link.param("alpn"),
        sni: link.param("sni"),
        tag: &link.tag(),
    })
}

fn parse_hysteria(body: &str) -> Result<OutboundConfig> {
    let link = split_link(body)?;
    let userinfo = match link.userinfo {
        Some(userinfo) => percent_decode(userinfo)?,
        None => String::new(),
    };
    let auth = first_non_empty(link.param("auth"), &userinfo);

    builder::hysteria(&HysteriaParams {
        server: link.host,
        port: link.port,
        auth,
        alpn: link.param("alpn"),
        sni: first_non_empty(link.param("peer"), link.param("sni")),
        obfs: link.param("obfsParam"),
        tag: &link.tag(),
    })
}

fn first_non_empty<'a>(a: &'a str, b: &'a str) -> &'a str {
    if a.is_empty() {
        b
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TransportSettings;
    use serde_json::json;

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    #[test]
    fn test_vmess_link() {
        let payload = json!({
            "v": "2", "ps": "VMess Node", "add": "vm.example.com", "port": 443,
            "id": UUID, "aid": "0", "scy": "auto", "net": "ws", "path": "/ray",
            "host": "cdn.example.com", "tls": "tls", "sni": "vm.example.com"
        });
        let link = format!("vmess://{}", STANDARD.encode(payload.to_string()));

        let OutboundConfig::Vmess(vmess) = parse_link(&link).unwrap() else {
            panic!("expected vmess");
        };
        assert_eq!(vmess.endpoint.tag, "VMess Node");
        assert_eq!(vmess.endpoint.port, 443);
        assert_eq!(
            vmess.transport,
            Some(TransportSettings {
                network: "ws".to_string(),
                path: Some("/ray".to_string()),
                host: Some("cdn.example.com".to_string()),
                service_name: None,
            })
        );
        let tls = vmess.tls.unwrap();
        assert!(tls.enabled);
        assert_eq!(tls.server_name.as_deref(), Some("vm.example.com"));
    }

    #[test]
    fn test_vmess_link_bad_payloads() {
        assert_eq!(parse_link("vmess://!!!").unwrap_err().kind(), "parse_error");
        let not_json = format!("vmess://{}", STANDARD.encode("hello"));
        assert_eq!(parse_link(&not_json).unwrap_err().kind(), "parse_error");
    }

    #[test]
    fn test_trojan_link_with_websocket() {
        let config =
            parse_link("trojan://p%40ss@tj.example.com:443?sni=sni.example.com&type=ws&path=%2Fws#Trojan%20JP")
                .unwrap();
        let OutboundConfig::Trojan(trojan) = config else {
            panic!("expected trojan");
        };
        assert_eq!(trojan.password, "p@ss");
        assert_eq!(trojan.endpoint.tag, "Trojan JP");
        assert!(trojan.tls.enabled);
        assert_eq!(trojan.tls.server_name.as_deref(), Some("sni.example.com"));
        assert_eq!(trojan.transport.unwrap().path.as_deref(), Some("/ws"));
    }

    #[test]
    fn test_vless_link_grpc_service_name() {
        let link = format!(
            "vless://{UUID}@[2001:db8::1]:8443?security=tls&type=grpc&serviceName=tun&flow=xtls-rprx-vision"
        );
        let config = parse_link(&link).unwrap();
        let outbound = serde_json::to_value(&config).unwrap();
        assert_eq!(outbound["transport"], json!({ "type": "grpc", "service_name": "tun" }));

        let OutboundConfig::Vless(vless) = config else {
            panic!("expected vless");
        };
        assert_eq!(vless.endpoint.server, "2001:db8::1");
        assert_eq!(vless.endpoint.tag, "2001:db8::1:8443");
        assert_eq!(vless.flow, "xtls-rprx-vision");
        assert!(vless.tls.unwrap().enabled);
    }

    #[test]
    fn test_shadowsocks_link_forms() {
        let sip002 = parse_link("ss://YWVzLTI1Ni1nY206cHc=@1.2.3.4:8388/?plugin=#node1").unwrap();
        let plain = parse_link("ss://aes-256-gcm:pw@1.2.3.4:8388#node1").unwrap();
        assert_eq!(sip002, plain);
        assert_eq!(
            serde_json::to_value(&plain).unwrap(),
            json!({
                "type": "shadowsocks", "tag": "node1", "server": "1.2.3.4",
                "server_port": 8388, "method": "aes-256-gcm", "password": "pw"
            })
        );

        let legacy =
            parse_link("ss://Y2hhY2hhMjAtaWV0Zi1wb2x5MTMwNTpzM2NyZXRAOS45LjkuOTo4Mzg5#old").unwrap();
        let OutboundConfig::Shadowsocks(ss) = legacy else {
            panic!("expected shadowsocks");
        };
        assert_eq!(ss.method, "chacha20-ietf-poly1305");
        assert_eq!(ss.password, "s3cret");
        assert_eq!(ss.endpoint.server, "9.9.9.9");
        assert_eq!(ss.endpoint.tag, "old");
    }

    #[test]
    fn test_tuic_and_hysteria_links() {
        let tuic = parse_link(&format!("tuic://{UUID}:pw@tuic.example.com:443?alpn=h3&sni=t.example.com#T"))
            .unwrap();
        let OutboundConfig::Tuic(tuic) = tuic else {
            panic!("expected tuic");
        };
        assert_eq!(tuic.tls.alpn, vec!["h3"]);
        assert_eq!(tuic.password, "pw");

        let hy = parse_link("hysteria://hy.example.com:36712?auth=secret&peer=hy.example.com&alpn=h3&obfs=xplus&obfsParam=mask#H")
            .unwrap();
        let OutboundConfig::Hysteria(hy) = hy else {
            panic!("expected hysteria");
        };
        assert_eq!(hy.auth, "secret");
        assert_eq!(hy.obfs.as_deref(), Some("mask"));
        assert_eq!(hy.tls.server_name.as_deref(), Some("hy.example.com"));
    }

    #[test]
    fn test_link_errors_keep_their_kind() {
        assert_eq!(parse_link("socks5://h:1").unwrap_err().kind(), "parse_error");
        assert_eq!(parse_link("plain text").unwrap_err().kind(), "parse_error");
        assert_eq!(parse_link("trojan://pw@host-without-port").unwrap_err().kind(), "parse_error");

        let err = parse_link("trojan://@tj.example.com:443").unwrap_err();
        assert_eq!(err.field(), Some("password"));
        let err = parse_link("vless://not-a-uuid@vl.example.com:443").unwrap_err();
        assert_eq!(err.field(), Some("uuid"));
    }

    #[test]
    fn test_decoder_skips_blank_and_comment_lines() {
        let entries = ShareLinkDecoder.decode("\n# header\n  ss://aes-256-gcm:pw@1.2.3.4:8388#a  \r\n\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].raw, "ss://aes-256-gcm:pw@1.2.3.4:8388#a");
        assert!(entries[0].config.is_ok());
    }
}
