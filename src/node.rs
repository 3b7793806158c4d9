//! Node Connection Module
//!
//! Connects to a blockchain node over a Unix IPC socket or a WebSocket and
//! exposes it to the pipeline as a [`ChainClient`]. The initial connection is
//! retried with exponential backoff; a dropped subscription is not (see
//! [`crate::worker::SubscriptionPolicy`]).

use alloy::primitives::TxHash;
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::pubsub::PubSubFrontend;
use alloy::transports::ipc::IpcConnect;
use alloy::transports::ws::WsConnect;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::chain::{ChainClient, ChainError, Inclusion, PendingTxStream};

/// Default endpoint, a local anvil IPC socket
pub const DEFAULT_ENDPOINT: &str = "/tmp/anvil.ipc";

/// Default number of connection attempts at startup
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;

/// Initial backoff delay between connection attempts
pub const INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum backoff delay between connection attempts
pub const MAX_BACKOFF_MS: u64 = 5000;

/// Errors that can occur while connecting to a node
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("IPC socket not found at path: {0}")]
    SocketNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Giving up after {0} connection attempts")]
    AttemptsExhausted(u32),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Transport selected from the endpoint string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Ipc(String),
    Ws(String),
}

impl Endpoint {
    /// Parse an endpoint: `ws://` / `wss://` URLs use WebSocket, anything else is an IPC path
    pub fn parse(raw: &str) -> Result<Self, NodeError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(NodeError::InvalidEndpoint("Endpoint cannot be empty".to_string()));
        }

        if raw.starts_with("ws://") || raw.starts_with("wss://") {
            return Ok(Endpoint::Ws(raw.to_string()));
        }

        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Err(NodeError::InvalidEndpoint(format!(
                "{raw}: HTTP cannot carry subscriptions, use ws:// or an IPC path"
            )));
        }

        Ok(Endpoint::Ipc(expand_path(raw)))
    }
}

/// Configuration for the node connection
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// IPC path or WebSocket URL
    pub endpoint: String,
    /// Connection attempts before giving up
    pub max_attempts: u32,
    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            max_attempts: DEFAULT_CONNECT_ATTEMPTS,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

impl NodeConfig {
    /// Create a new config for the given endpoint
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Backoff delay before retry number `attempt` (zero-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_backoff_ms * 2u64.pow(attempt.min(10));
        Duration::from_millis(delay_ms.min(self.max_backoff_ms))
    }
}

/// Expand ~ to home directory in path
pub fn expand_path(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen("~", &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

/// Open a single connection to the endpoint
pub async fn connect_once(endpoint: &Endpoint) -> Result<RootProvider<PubSubFrontend>, NodeError> {
    match endpoint {
        Endpoint::Ipc(path) => {
            if !Path::new(path).exists() {
                return Err(NodeError::SocketNotFound(path.clone()));
            }
            info!("Connecting to IPC socket at {}", path);
            let ipc: IpcConnect<String> = IpcConnect::new(path.clone());
            ProviderBuilder::new()
                .on_ipc(ipc)
                .await
                .map_err(|e| NodeError::ConnectionFailed(e.to_string()))
        }
        Endpoint::Ws(url) => {
            info!("Connecting to WebSocket at {}", url);
            ProviderBuilder::new()
                .on_ws(WsConnect::new(url.clone()))
                .await
                .map_err(|e| NodeError::ConnectionFailed(e.to_string()))
        }
    }
}

/// Alloy-backed chain client
#[derive(Clone)]
pub struct NodeClient {
    provider: RootProvider<PubSubFrontend>,
}

impl NodeClient {
    /// Wrap an already connected provider
    pub fn new(provider: RootProvider<PubSubFrontend>) -> Self {
        Self { provider }
    }

    /// Connect with exponential backoff, up to `config.max_attempts` tries
    pub async fn connect(config: &NodeConfig) -> Result<Self, NodeError> {
        let endpoint = Endpoint::parse(&config.endpoint)?;
        let attempts = config.max_attempts.max(1);

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = config.backoff_delay(attempt - 1);
                warn!(
                    "Retrying node connection (attempt {}/{}), waiting {:?}",
                    attempt + 1,
                    attempts,
                    delay
                );
                sleep(delay).await;
            }

            match connect_once(&endpoint).await {
                Ok(provider) => {
                    info!("Successfully connected to node");
                    return Ok(Self::new(provider));
                }
                Err(e) => error!("Connection attempt {} failed: {}", attempt + 1, e),
            }
        }

        Err(NodeError::AttemptsExhausted(attempts))
    }
}

#[async_trait]
impl ChainClient for NodeClient {
    async fn subscribe_pending(&self) -> Result<PendingTxStream, ChainError> {
        let subscription = self
            .provider
            .subscribe_full_pending_transactions()
            .await
            .map_err(|e| ChainError::Subscription(e.to_string()))?;

        let closed = futures::stream::once(async { Err(ChainError::SubscriptionClosed) });
        let stream = subscription
            .into_stream()
            .map(|tx| Ok(tx.inner))
            .chain(closed);

        Ok(stream.boxed())
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<Inclusion>, ChainError> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| ChainError::Receipt(e.to_string()))?;

        Ok(receipt.map(|r| Inclusion {
            block_number: r.block_number,
        }))
    }
}
