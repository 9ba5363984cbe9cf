//! Subscription Fetcher
//!
//! Retrieves a remote subscription document through a [`Transport`], hands
//! the text to a [`SubscriptionDecoder`] and validates what comes back as one
//! batch. Entries that fail are skipped and recorded, never fatal, unless
//! nothing usable is left.
//!
//! Fetching is independent of the tunnel session.

use crate::config::SubscriptionConfig;
use crate::error::{Result, VpnError};
use crate::protocol::{self, OutboundConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

mod links;

pub use links::{parse_link, ShareLinkDecoder};

const EXCERPT_LEN: usize = 64;

/// Network transport used to retrieve subscription documents
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the raw document at `url`
    async fn get(&self, url: &Url) -> Result<Vec<u8>>;
}

/// One entry produced by a decoder, in document order
#[derive(Debug)]
pub struct DecodedEntry {
    /// The raw entry text (usually one share link)
    pub raw: String,
    pub config: Result<OutboundConfig>,
}

/// Turns subscription text into candidate outbounds
pub trait SubscriptionDecoder: Send + Sync {
    fn decode(&self, document: &str) -> Vec<DecodedEntry>;
}

/// An entry left out of a [`SubscriptionResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    /// Position of the entry in the decoded document
    pub index: usize,
    pub excerpt: String,
    /// Error kind, as in [`VpnError::kind`]
    pub kind: String,
    pub reason: String,
}

impl SkippedEntry {
    fn new(index: usize, raw: &str, error: &VpnError) -> Self {
        Self {
            index,
            excerpt: raw.chars().take(EXCERPT_LEN).collect(),
            kind: error.kind().to_string(),
            reason: error.to_string(),
        }
    }
}

/// Outbounds resolved from one subscription document
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionResult {
    pub configs: Vec<OutboundConfig>,
    pub source_url: String,
    pub retrieved_at: DateTime<Utc>,
    pub skipped: Vec<SkippedEntry>,
}

/// HTTP(S) transport on reqwest
pub struct HttpTransport {
    client: Client,
    max_body_bytes: usize,
}

impl HttpTransport {
    pub fn new(config: &SubscriptionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| VpnError::Network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }

    fn too_large(&self, url: &Url) -> VpnError {
        VpnError::Network(format!(
            "{url} returned a document larger than {} bytes",
            self.max_body_bytes
        ))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &Url) -> Result<Vec<u8>> {
        let mut response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(VpnError::Network(format!("{url} returned HTTP {status}")));
        }

        let limit = u64::try_from(self.max_body_bytes).unwrap_or(u64::MAX);
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(self.too_large(url));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(self.too_large(url));
            }
            body.extend_from_slice(&chunk);
        }
        debug!("Fetched {} bytes from {url}", body.len());
        Ok(body)
    }
}

/// Resolves subscription URLs into validated outbounds
pub struct SubscriptionFetcher {
    transport: Arc<dyn Transport>,
    decoder: Arc<dyn SubscriptionDecoder>,
}

impl SubscriptionFetcher {
    pub fn new(transport: Arc<dyn Transport>, decoder: Arc<dyn SubscriptionDecoder>) -> Self {
        Self { transport, decoder }
    }

    /// HTTP transport with share-link decoding
    pub fn from_config(config: &SubscriptionConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(HttpTransport::new(config)?),
            Arc::new(ShareLinkDecoder),
        ))
    }

    /// Fetch and resolve the subscription at `url`
    ///
    /// # Errors
    /// `InvalidParameter("url")` before any I/O for a bad URL, `Network` on
    /// transport failure, `Parse` when the document is not UTF-8 text and
    /// `EmptySubscription` when no entry survives decoding and validation
    pub async fn fetch(&self, url: &str) -> Result<SubscriptionResult> {
        let parsed = parse_url(url)?;
        info!("Fetching subscription {parsed}");

        let body = self.transport.get(&parsed).await?;
        let document = String::from_utf8(body)
            .map_err(|_| VpnError::Parse("subscription document is not UTF-8 text".to_string()))?;

        let mut skipped = Vec::new();
        let mut positions = Vec::new();
        let mut candidates = Vec::new();
        for (index, entry) in self.decoder.decode(&document).into_iter().enumerate() {
            match entry.config {
                Ok(config) => {
                    positions.push((index, entry.raw));
                    candidates.push(config);
                }
                Err(e) => skipped.push(SkippedEntry::new(index, &entry.raw, &e)),
            }
        }

        let (configs, rejected) = protocol::validate_batch(candidates);
        for (candidate, error) in rejected {
            let (index, raw) = &positions[candidate];
            skipped.push(SkippedEntry::new(*index, raw, &error));
        }
        skipped.sort_by_key(|entry| entry.index);

        for entry in &skipped {
            warn!(
                "Skipped subscription entry {} ({}): {}",
                entry.index, entry.kind, entry.reason
            );
        }

        if configs.is_empty() {
            return Err(VpnError::EmptySubscription(url.to_string()));
        }

        info!(
            "Subscription {parsed} resolved to {} outbounds ({} skipped)",
            configs.len(),
            skipped.len()
        );
        Ok(SubscriptionResult {
            configs,
            source_url: url.to_string(),
            retrieved_at: Utc::now(),
            skipped,
        })
    }
}

fn parse_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| VpnError::invalid_parameter("url", format!("'{url}' is not a URL: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(VpnError::invalid_parameter(
            "url",
            format!("unsupported scheme '{scheme}'"),
        )),
    }
}
