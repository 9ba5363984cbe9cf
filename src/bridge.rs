//! Host bridge
//!
//! Flat-string request/response surface for host applications. Every
//! operation takes plain `&str` parameters and returns a [`Response`] that
//! serializes to `{"ok": true, "data": ...}` or
//! `{"ok": false, "error": {"kind": ..., "message": ...}}`.
//!
//! The bridge owns its own tokio runtime and blocks on the async core, so it
//! must be called from synchronous host code, not from inside a runtime.

use crate::client::LifecycleController;
use crate::config::Config;
use crate::error::{Result, VpnError};
use crate::protocol::builder::{
    self, HysteriaParams, ShadowsocksParams, TrojanParams, TuicParams, VlessParams, VmessParams,
    WireGuardParams,
};
use crate::protocol::{self, OutboundConfig};
use crate::subscription::{ShareLinkDecoder, SubscriptionFetcher, Transport};
use crate::tunnel::Engine;
use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Error codes exposed to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum ErrorKind {
    InvalidParameter = 1,
    ValidationError = 2,
    AlreadyRunning = 3,
    InvalidTransition = 4,
    StartTimeout = 5,
    NetworkError = 6,
    ParseError = 7,
    EmptySubscription = 8,
    EngineError = 9,
    ConfigError = 10,
    InternalError = 99,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<&VpnError> for ErrorKind {
    fn from(error: &VpnError) -> Self {
        match error {
            VpnError::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            VpnError::Validation { .. } => ErrorKind::ValidationError,
            VpnError::AlreadyRunning => ErrorKind::AlreadyRunning,
            VpnError::InvalidTransition(_) => ErrorKind::InvalidTransition,
            VpnError::StartTimeout(_) => ErrorKind::StartTimeout,
            VpnError::Network(_) => ErrorKind::NetworkError,
            VpnError::Parse(_) => ErrorKind::ParseError,
            VpnError::EmptySubscription(_) => ErrorKind::EmptySubscription,
            VpnError::Engine(_) => ErrorKind::EngineError,
            VpnError::Config(_) => ErrorKind::ConfigError,
            VpnError::Io(_) => ErrorKind::InternalError,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Result of one bridge call
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: &VpnError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: ErrorKind::from(error),
                message: error.to_string(),
                field: error.field().map(str::to_string),
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| internal_error_json(&e.to_string()))
    }
}

impl<T: Serialize> From<Result<T>> for Response {
    fn from(result: Result<T>) -> Self {
        match result.and_then(|data| Ok(serde_json::to_value(data)?)) {
            Ok(data) => Response::success(data),
            Err(e) => {
                debug!("Bridge call failed: {e}");
                Response::failure(&e)
            }
        }
    }
}

/// Synchronous host-facing entry point over the tunneling core
pub struct Bridge {
    runtime: Runtime,
    controller: LifecycleController,
    fetcher: SubscriptionFetcher,
}

impl Bridge {
    /// Bridge running the configured engine binary and fetching over HTTP
    pub fn new(config: Config) -> Result<Self> {
        let fetcher = SubscriptionFetcher::from_config(&config.subscription)?;
        let controller = LifecycleController::with_process_engine(config)?;
        Ok(Self {
            runtime: build_runtime()?,
            controller,
            fetcher,
        })
    }

    /// Bridge over caller-supplied collaborators
    pub fn with_parts(
        config: Config,
        engine: Arc<dyn Engine>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            runtime: build_runtime()?,
            controller: LifecycleController::new(config, engine),
            fetcher: SubscriptionFetcher::new(transport, Arc::new(ShareLinkDecoder)),
        })
    }

    /// Start a tunnel from an outbound object or a full engine document
    pub fn start_vpn(&self, config_json: &str) -> Response {
        self.runtime
            .block_on(async {
                self.controller.start_json(config_json).await?;
                Ok::<_, VpnError>(self.controller.status().await)
            })
            .into()
    }

    pub fn stop_vpn(&self) -> Response {
        self.runtime
            .block_on(async {
                self.controller.stop().await?;
                Ok::<_, VpnError>(self.controller.status().await)
            })
            .into()
    }

    pub fn vpn_status(&self) -> Response {
        let snapshot = self.runtime.block_on(self.controller.status());
        Ok::<_, VpnError>(snapshot).into()
    }

    pub fn fetch_subscription(&self, url: &str) -> Response {
        self.runtime.block_on(self.fetcher.fetch(url)).into()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_vmess_config(
        &self,
        server: &str,
        port: &str,
        uuid: &str,
        security: &str,
        alter_id: &str,
        network: &str,
        path: &str,
        host: &str,
        tls: &str,
        sni: &str,
        tag: &str,
    ) -> Response {
        checked(builder::vmess(&VmessParams {
            server,
            port,
            uuid,
            security,
            alter_id,
            network,
            path,
            host,
            tls,
            sni,
            tag,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_trojan_config(
        &self,
        server: &str,
        port: &str,
        password: &str,
        sni: &str,
        network: &str,
        path: &str,
        host: &str,
        tag: &str,
    ) -> Response {
        checked(builder::trojan(&TrojanParams {
            server,
            port,
            password,
            sni,
            network,
            path,
            host,
            tag,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_vless_config(
        &self,
        server: &str,
        port: &str,
        uuid: &str,
        flow: &str,
        security: &str,
        sni: &str,
        network: &str,
        path: &str,
        host: &str,
        tag: &str,
    ) -> Response {
        checked(builder::vless(&VlessParams {
            server,
            port,
            uuid,
            flow,
            security,
            sni,
            network,
            path,
            host,
            tag,
        }))
    }

    pub fn create_shadowsocks_config(
        &self,
        server: &str,
        port: &str,
        method: &str,
        password: &str,
        tag: &str,
    ) -> Response {
        checked(builder::shadowsocks(&ShadowsocksParams {
            server,
            port,
            method,
            password,
            tag,
        }))
    }

    pub fn create_wireguard_config(
        &self,
        server: &str,
        port: &str,
        private_key: &str,
        peer_public_key: &str,
        local_address: &str,
        tag: &str,
    ) -> Response {
        checked(builder::wireguard(&WireGuardParams {
            server,
            port,
            private_key,
            peer_public_key,
            local_address,
            tag,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_tuic_config(
        &self,
        server: &str,
        port: &str,
        uuid: &str,
        password: &str,
        alpn: &str,
        sni: &str,
        tag: &str,
    ) -> Response {
        checked(builder::tuic(&TuicParams {
            server,
            port,
            uuid,
            password,
            alpn,
            sni,
            tag,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_hysteria_config(
        &self,
        server: &str,
        port: &str,
        auth: &str,
        alpn: &str,
        sni: &str,
        obfs: &str,
        tag: &str,
    ) -> Response {
        checked(builder::hysteria(&HysteriaParams {
            server,
            port,
            auth,
            alpn,
            sni,
            obfs,
            tag,
        }))
    }

    pub fn version(&self) -> Response {
        Response::success(json!({
            "name": crate::NAME,
            "version": crate::VERSION,
        }))
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.block_on(self.controller.stop()) {
            warn!("Tunnel not stopped cleanly on bridge drop: {e}");
        }
    }
}

fn internal_error_json(message: &str) -> String {
    json!({
        "ok": false,
        "error": { "kind": "internal_error", "message": message },
    })
    .to_string()
}

fn build_runtime() -> Result<Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("rbox-bridge")
        .enable_all()
        .build()?)
}

/// Run a built config through the validator before handing it back
fn checked(built: Result<OutboundConfig>) -> Response {
    built
        .and_then(|config| {
            protocol::validate(&config, &HashSet::new())?;
            Ok(config)
        })
        .into()
}
