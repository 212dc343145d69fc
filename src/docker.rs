//! Docker implementation of the container runtime

use crate::error::{Error, Result};
use crate::runtime::{
    Connector, ContainerRecord, ContainerRuntime, NetworkEndpoint, PortMapping, RuntimeEvent,
};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerInspectResponse, PortBinding};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Request timeout handed to bollard, in seconds
const CLIENT_TIMEOUT_SECS: u64 = 120;

/// Client certificate material for TLS endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

impl TlsMaterial {
    /// Standard Docker layout: `cert.pem`, `key.pem` and `ca.pem` in one directory
    pub fn from_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            cert: dir.join("cert.pem"),
            key: dir.join("key.pem"),
            ca: dir.join("ca.pem"),
        }
    }
}

/// Transport picked from an endpoint address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Socket,
    Tcp,
}

/// Select the transport for an endpoint by its scheme
pub fn transport_for(addr: &str) -> Result<Transport> {
    match addr.split_once("://") {
        Some(("unix", path)) if !path.is_empty() => Ok(Transport::Socket),
        Some(("tcp", host)) | Some(("http", host)) if !host.is_empty() => Ok(Transport::Tcp),
        _ => Err(Error::InvalidUrl(addr.to_string())),
    }
}

/// Builds bollard clients, optionally with TLS for TCP endpoints
#[derive(Debug, Clone, Default)]
pub struct DockerConnector {
    tls: Option<TlsMaterial>,
}

impl DockerConnector {
    pub fn new(tls: Option<TlsMaterial>) -> Self {
        Self { tls }
    }

    fn client(&self, addr: &str) -> Result<Docker> {
        let client = match transport_for(addr)? {
            Transport::Socket => {
                let socket_path = addr.trim_start_matches("unix://");
                Docker::connect_with_socket(
                    socket_path,
                    CLIENT_TIMEOUT_SECS,
                    bollard::API_DEFAULT_VERSION,
                )?
            }
            Transport::Tcp => match &self.tls {
                Some(tls) => Docker::connect_with_ssl(
                    addr,
                    &tls.key,
                    &tls.cert,
                    &tls.ca,
                    CLIENT_TIMEOUT_SECS,
                    bollard::API_DEFAULT_VERSION,
                )?,
                None => {
                    Docker::connect_with_http(addr, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
                }
            },
        };
        Ok(client)
    }
}

impl Connector for DockerConnector {
    fn connect(&self, addr: &str) -> Result<Arc<dyn ContainerRuntime>> {
        let client = self.client(addr)?;
        Ok(Arc::new(DockerRuntime { client }))
    }
}

/// [`ContainerRuntime`] backed by the Docker Engine API
pub struct DockerRuntime {
    client: Docker,
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.client.ping().await?;
        Ok(())
    }

    fn events(&self) -> BoxStream<'static, Result<RuntimeEvent>> {
        self.client
            .events(None::<EventsOptions<String>>)
            .map(|result| {
                result.map_err(Error::from).map(|msg| {
                    let actor = msg.actor.unwrap_or_default();
                    RuntimeEvent {
                        action: msg.action.unwrap_or_default(),
                        kind: msg.typ.map(|t| t.to_string()).unwrap_or_default(),
                        actor_id: actor.id.unwrap_or_default(),
                        attributes: actor.attributes.unwrap_or_default(),
                    }
                })
            })
            .boxed()
    }

    async fn list_running(&self) -> Result<Vec<ContainerRecord>> {
        let mut filters = HashMap::new();
        filters.insert("status".to_string(), vec!["running".to_string()]);
        let options = ListContainersOptions {
            filters,
            ..Default::default()
        };

        let summaries = self.client.list_containers(Some(options)).await?;
        let mut out = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            match self.inspect(&id).await {
                Ok(mut record) => {
                    if let Some(names) = summary.names {
                        record.names = names;
                    }
                    out.push(record);
                }
                Err(e) if e.is_not_found() => {
                    debug!(container_id = %id, "Container disappeared before inspection");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerRecord> {
        let info = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(record_from_inspect(id, info))
    }
}

fn record_from_inspect(id: &str, info: ContainerInspectResponse) -> ContainerRecord {
    let env = info.config.and_then(|c| c.env).unwrap_or_default();
    let names = info.name.map(|n| vec![n]).unwrap_or_default();
    let settings = info.network_settings.unwrap_or_default();

    let mut networks: Vec<NetworkEndpoint> = settings
        .networks
        .unwrap_or_default()
        .into_iter()
        .map(|(name, endpoint)| NetworkEndpoint {
            name,
            address: endpoint.ip_address.unwrap_or_default(),
        })
        .collect();
    networks.sort_by(|a, b| a.name.cmp(&b.name));

    ContainerRecord {
        id: info.id.unwrap_or_else(|| id.to_string()),
        names,
        env,
        networks,
        ports: port_mappings(settings.ports.unwrap_or_default()),
    }
}

/// Flatten Docker's `"80/tcp" -> [bindings]` map into port mappings.
///
/// Unbound ports yield a private-only mapping. Identical (private, public)
/// pairs, as produced by separate IPv4 and IPv6 bindings, are collapsed.
fn port_mappings(ports: HashMap<String, Option<Vec<PortBinding>>>) -> Vec<PortMapping> {
    let mut keyed: Vec<(u16, Option<Vec<PortBinding>>)> = ports
        .into_iter()
        .filter_map(|(key, bindings)| {
            let port = key.split('/').next()?.parse().ok()?;
            Some((port, bindings))
        })
        .collect();
    keyed.sort_by_key(|(port, _)| *port);

    let mut out: Vec<PortMapping> = Vec::new();
    for (private_port, bindings) in keyed {
        let bindings = bindings.unwrap_or_default();
        if bindings.is_empty() {
            out.push(PortMapping::private(private_port));
            continue;
        }
        for binding in bindings {
            let public_port = binding
                .host_port
                .as_deref()
                .and_then(|p| p.parse().ok())
                .unwrap_or(0);
            let ip = binding.host_ip.unwrap_or_default();
            if out
                .iter()
                .any(|m| m.private_port == private_port && m.public_port == public_port)
            {
                continue;
            }
            out.push(PortMapping::published(private_port, public_port, &ip));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, EndpointSettings, NetworkSettings};

    fn binding(ip: &str, port: &str) -> PortBinding {
        PortBinding {
            host_ip: Some(ip.to_string()),
            host_port: Some(port.to_string()),
        }
    }

    #[test]
    fn test_transport_for() {
        assert_eq!(
            transport_for("unix:///var/run/docker.sock").unwrap(),
            Transport::Socket
        );
        assert_eq!(transport_for("tcp://10.0.0.1:2376").unwrap(), Transport::Tcp);
        assert_eq!(transport_for("http://localhost:2375").unwrap(), Transport::Tcp);
        assert!(matches!(
            transport_for("ftp://example.com"),
            Err(Error::InvalidUrl(_))
        ));
        assert!(transport_for("/var/run/docker.sock").is_err());
        assert!(transport_for("unix://").is_err());
    }

    #[test]
    fn test_connector_rejects_unknown_scheme() {
        let connector = DockerConnector::default();
        assert!(matches!(
            connector.connect("npipe:////./pipe/docker_engine"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_tls_material_from_dir() {
        let tls = TlsMaterial::from_dir("/certs");
        assert_eq!(tls.cert, PathBuf::from("/certs/cert.pem"));
        assert_eq!(tls.key, PathBuf::from("/certs/key.pem"));
        assert_eq!(tls.ca, PathBuf::from("/certs/ca.pem"));
    }

    #[test]
    fn test_port_mappings() {
        let mut ports = HashMap::new();
        ports.insert("9002/tcp".to_string(), Some(vec![binding("4.2.2.1", "81")]));
        ports.insert("9001/tcp".to_string(), Some(vec![binding("4.2.2.1", "80")]));
        ports.insert("53/udp".to_string(), None);

        let got = port_mappings(ports);
        assert_eq!(
            got,
            vec![
                PortMapping::private(53),
                PortMapping::published(9001, 80, "4.2.2.1"),
                PortMapping::published(9002, 81, "4.2.2.1"),
            ]
        );
    }

    #[test]
    fn test_port_mappings_collapse_dual_stack() {
        let mut ports = HashMap::new();
        ports.insert(
            "80/tcp".to_string(),
            Some(vec![binding("0.0.0.0", "8080"), binding("::", "8080")]),
        );
        let got = port_mappings(ports);
        assert_eq!(got, vec![PortMapping::published(80, 8080, "0.0.0.0")]);
    }

    #[test]
    fn test_record_from_inspect() {
        let mut networks = HashMap::new();
        networks.insert(
            "overlay-net".to_string(),
            EndpointSettings {
                ip_address: Some("10.0.1.2".to_string()),
                ..Default::default()
            },
        );
        networks.insert(
            "bridge".to_string(),
            EndpointSettings {
                ip_address: Some("172.17.0.3".to_string()),
                ..Default::default()
            },
        );
        let info = ContainerInspectResponse {
            id: Some("abc123".to_string()),
            name: Some("/web".to_string()),
            config: Some(ContainerConfig {
                env: Some(vec!["VIRTUAL_HOST=example.com".to_string()]),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        };

        let record = record_from_inspect("abc123", info);
        assert_eq!(record.id, "abc123");
        assert_eq!(record.names, vec!["/web".to_string()]);
        assert_eq!(record.env, vec!["VIRTUAL_HOST=example.com".to_string()]);
        let names: Vec<&str> = record.networks.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["bridge", "overlay-net"]);
        assert!(record.ports.is_empty());
    }
}
