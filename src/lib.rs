//! rbox - multi-protocol tunneling client core
//!
//! This library sits between a host application and an external proxy
//! tunneling engine (sing-box compatible). It provides:
//! - Outbound config builders for VMess, Trojan, VLESS, Shadowsocks,
//!   WireGuard, TUIC and Hysteria, with validation
//! - A single-session tunnel lifecycle (start / stop / status) over a
//!   pluggable engine, with bounded startup and teardown
//! - Subscription fetching and share-link decoding
//! - A flat-string request/response bridge for host integration
//!
//! ## What The Host Must Provide
//! - The engine binary (or its own [`tunnel::Engine`] implementation)
//! - Platform VPN service integration, TUN device and routing setup
//! - UI

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod subscription;
pub mod tunnel;

// Re-export core types
pub use bridge::{Bridge, ErrorKind, Response};
pub use client::LifecycleController;
pub use config::Config;
pub use error::{Result, VpnError};
pub use protocol::{OutboundConfig, Protocol};
pub use subscription::{SubscriptionFetcher, SubscriptionResult};
pub use tunnel::{StatusSnapshot, TunnelState};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
