//! Container runtime abstraction
//!
//! The manager and watchers only talk to a runtime through [`ContainerRuntime`],
//! built fresh for every attempt by a [`Connector`]. The Docker implementation
//! lives in [`crate::docker`].

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Base delay for connection backoff
const BACKOFF_BASE_MS: u64 = 100;

/// A lifecycle event emitted by an event source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// Action string, e.g. `start` or `die`
    pub action: String,
    /// Object type, e.g. `container` or `network`
    pub kind: String,
    /// ID of the object the event is about
    pub actor_id: String,
    /// Free-form attributes attached to the event
    pub attributes: HashMap<String, String>,
}

/// Address of a container on one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkEndpoint {
    pub name: String,
    pub address: String,
}

/// One exposed port of a container
///
/// `public_port` is 0 and `ip` empty when the port is not published on the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    pub private_port: u16,
    pub public_port: u16,
    pub ip: String,
}

impl PortMapping {
    pub fn private(port: u16) -> Self {
        Self {
            private_port: port,
            ..Default::default()
        }
    }

    pub fn published(private_port: u16, public_port: u16, ip: &str) -> Self {
        Self {
            private_port,
            public_port,
            ip: ip.to_string(),
        }
    }
}

/// Inspected state of a running container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: String,
    pub names: Vec<String>,
    /// Raw `KEY=VALUE` environment lines
    pub env: Vec<String>,
    /// Networks the container is attached to, in enumeration order
    pub networks: Vec<NetworkEndpoint>,
    pub ports: Vec<PortMapping>,
}

/// Client for a single container runtime endpoint
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Liveness check against the endpoint
    async fn ping(&self) -> Result<()>;

    /// Subscribe to the endpoint's event stream.
    ///
    /// The stream ends when the underlying connection closes.
    fn events(&self) -> BoxStream<'static, Result<RuntimeEvent>>;

    /// All running containers, inspected, in the order the API lists them
    async fn list_running(&self) -> Result<Vec<ContainerRecord>>;

    /// Inspect a single container
    async fn inspect(&self, id: &str) -> Result<ContainerRecord>;
}

/// Builds runtime clients for endpoint addresses
pub trait Connector: Send + Sync {
    fn connect(&self, addr: &str) -> Result<Arc<dyn ContainerRuntime>>;
}

/// Delay before connection attempt number `tries`: `min(2^tries * 100ms, cap)`
pub fn backoff_delay(tries: u32, cap: Duration) -> Duration {
    let factor = 2u64.checked_pow(tries).unwrap_or(u64::MAX);
    Duration::from_millis(factor.saturating_mul(BACKOFF_BASE_MS)).min(cap)
}

/// Wait out the backoff for `tries`, then build a fresh client and ping it.
pub async fn connect_with_backoff(
    connector: &dyn Connector,
    addr: &str,
    tries: u32,
    cap: Duration,
) -> Result<Arc<dyn ContainerRuntime>> {
    tokio::time::sleep(backoff_delay(tries, cap)).await;
    info!(addr, tries, "Creating client");
    let client = connector.connect(addr)?;
    client.ping().await?;
    Ok(client)
}
