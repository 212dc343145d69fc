//! Mapping of running containers to proxied sites
//!
//! A container opts in by declaring `VIRTUAL_HOST` (comma-separated) in its
//! environment. `VIRTUAL_PORT` picks the port when more than one is exposed.
//! Containers sharing a network with us are reached directly on their private
//! port; everything else goes through the published host port.

use crate::error::{Error, Result};
use crate::kv::parse_kv;
use crate::runtime::{ContainerRecord, NetworkEndpoint, PortMapping};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

pub const HOST_KEY: &str = "VIRTUAL_HOST";
pub const PORT_KEY: &str = "VIRTUAL_PORT";

/// Network marker for upstreams reached through a published host port
pub const PUBLIC_NETWORK: &str = "public";

/// Environment variable that overrides self-identity detection
pub const CONTAINER_ID_ENV: &str = "CONTAINER_ID";

const CGROUP_PATH: &str = "/proc/self/cgroup";

/// A single container's site: where to reach it and which hosts it serves
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Site {
    pub id: String,
    pub names: Vec<String>,
    pub contact: Mapping,
    pub hosts: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Full set of sites from one convergence cycle, shared read-only by observers
pub type RoutingTable = Arc<[Site]>;

/// Address and port the proxy forwards to, plus the network used to reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mapping {
    pub address: String,
    pub port: u16,
    pub network: String,
}

/// The container this process runs in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfContainer {
    pub id: String,
    /// Networks we are attached to, in enumeration order
    pub networks: Vec<String>,
}

impl SelfContainer {
    pub fn from_record(record: &ContainerRecord) -> Self {
        Self {
            id: record.id.clone(),
            networks: record.networks.iter().map(|n| n.name.clone()).collect(),
        }
    }
}

/// Derive the routing table from an inventory of running containers.
///
/// Our own container is skipped, as is every container that is not eligible.
/// Output order follows inventory order.
pub fn map_containers(inventory: &[ContainerRecord], me: &SelfContainer) -> Vec<Site> {
    let mut sites = Vec::with_capacity(inventory.len());
    for container in inventory {
        if container.id == me.id {
            continue;
        }
        if let Some(site) = map_container(container, &me.networks) {
            sites.push(site);
        }
    }
    sites
}

fn map_container(container: &ContainerRecord, my_networks: &[String]) -> Option<Site> {
    let env = match parse_kv(&container.env) {
        Ok(env) => env,
        Err(e) => {
            warn!(container_id = %container.id, error = %e, "Skipping container with malformed environment");
            return None;
        }
    };

    let hosts = find_hosts(&env)?;
    let port = find_port(&env).unwrap_or(0);

    let Some(contact) = find_mapping(my_networks, &container.networks, &container.ports, port)
    else {
        debug!(
            container_id = %container.id,
            ports = container.ports.len(),
            requested_port = port,
            "No usable port mapping for container"
        );
        return None;
    };

    Some(Site {
        id: container.id.clone(),
        names: container.names.clone(),
        contact,
        hosts,
        env,
    })
}

/// Virtual hosts declared by the container, trimmed, empty entries dropped
pub fn find_hosts(env: &HashMap<String, String>) -> Option<Vec<String>> {
    let hosts: Vec<String> = env
        .get(HOST_KEY)?
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect();
    if hosts.is_empty() {
        None
    } else {
        Some(hosts)
    }
}

/// Explicitly requested port, if present and numeric
pub fn find_port(env: &HashMap<String, String>) -> Option<u16> {
    env.get(PORT_KEY)?.trim().parse().ok()
}

/// Choose the upstream for a container.
///
/// A network shared with us wins (first of our networks, in order) using the
/// private port; otherwise the published host IP and port are used. Shared
/// networks without an address (e.g. `host`) are not usable.
pub fn find_mapping(
    my_networks: &[String],
    their_networks: &[NetworkEndpoint],
    ports: &[PortMapping],
    port: u16,
) -> Option<Mapping> {
    let data = find_port_mapping(ports, port)?;

    for name in my_networks {
        if let Some(net) = their_networks
            .iter()
            .find(|n| &n.name == name && !n.address.is_empty())
        {
            return Some(Mapping {
                address: net.address.clone(),
                port: data.private_port,
                network: name.clone(),
            });
        }
    }

    if !data.ip.is_empty() && data.public_port != 0 {
        return Some(Mapping {
            address: data.ip.clone(),
            port: data.public_port,
            network: PUBLIC_NETWORK.to_string(),
        });
    }
    None
}

/// Pick the port mapping to target.
///
/// A single mapping is used regardless of `port`. With several, `port` must
/// match the private or published port of one of them.
pub fn find_port_mapping(ports: &[PortMapping], port: u16) -> Option<&PortMapping> {
    match ports {
        [] => None,
        [only] => Some(only),
        _ if port == 0 => None,
        _ => ports
            .iter()
            .find(|m| m.private_port == port || m.public_port == port),
    }
}

/// Resolve our own container ID: `override_id`, then `CONTAINER_ID`, then cgroups.
pub fn current_container_id(override_id: Option<&str>) -> Result<String> {
    if let Some(id) = override_id.filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }
    if let Ok(id) = std::env::var(CONTAINER_ID_ENV) {
        if !id.is_empty() {
            return Ok(id);
        }
    }
    read_cgroup_id(Path::new(CGROUP_PATH))
}

fn read_cgroup_id(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::SelfIdentity(format!("{}: {}", path.display(), e)))?;
    container_id_from_cgroup(&content)
        .ok_or_else(|| Error::SelfIdentity(format!("no container ID in {}", path.display())))
}

/// Find a container ID in a cgroup membership listing.
///
/// Matches lines ending in `/docker/<64 hex>` or the systemd form
/// `/docker-<64 hex>.scope`.
pub fn container_id_from_cgroup(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let line = line.trim_end();
        let (_, last) = line.rsplit_once('/')?;
        let candidate = if line.ends_with(&format!("/docker/{}", last)) {
            last
        } else {
            last.strip_prefix("docker-")?.strip_suffix(".scope")?
        };
        is_container_id(candidate).then(|| candidate.to_string())
    })
}

fn is_container_id(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn net(name: &str, address: &str) -> NetworkEndpoint {
        NetworkEndpoint {
            name: name.to_string(),
            address: address.to_string(),
        }
    }

    fn public(address: &str, port: u16) -> Mapping {
        Mapping {
            address: address.to_string(),
            port,
            network: PUBLIC_NETWORK.to_string(),
        }
    }

    #[test]
    fn test_hosts() {
        assert_eq!(
            find_hosts(&env(&[(HOST_KEY, "www.google.com")])),
            Some(vec!["www.google.com".to_string()])
        );
        assert_eq!(find_hosts(&env(&[])), None);
        assert_eq!(
            find_hosts(&env(&[(HOST_KEY, "www.google.com,google.com,yahoo.com")])),
            Some(vec![
                "www.google.com".to_string(),
                "google.com".to_string(),
                "yahoo.com".to_string()
            ])
        );
    }

    #[test]
    fn test_hosts_trimmed_and_empty() {
        assert_eq!(
            find_hosts(&env(&[(HOST_KEY, " a.com , ,b.com")])),
            Some(vec!["a.com".to_string(), "b.com".to_string()])
        );
        assert_eq!(find_hosts(&env(&[(HOST_KEY, "")])), None);
        assert_eq!(find_hosts(&env(&[(HOST_KEY, ",,")])), None);
    }

    #[test]
    fn test_ports() {
        assert_eq!(find_port(&env(&[(PORT_KEY, "9001")])), Some(9001));
        assert_eq!(find_port(&env(&[])), None);
        assert_eq!(find_port(&env(&[(PORT_KEY, "ENOTASTRING")])), None);
        assert_eq!(find_port(&env(&[(PORT_KEY, "70000")])), None);
    }

    #[test]
    fn test_single_port_uses_public() {
        let ports = [PortMapping::published(9001, 80, "4.2.2.1")];
        assert_eq!(
            find_mapping(&[], &[], &ports, 80),
            Some(public("4.2.2.1", 80))
        );
    }

    #[test]
    fn test_single_port_ignores_requested_port() {
        let ports = [PortMapping::published(9001, 80, "4.2.2.1")];
        assert_eq!(
            find_mapping(&[], &[], &ports, 1234),
            Some(public("4.2.2.1", 80))
        );
    }

    #[test]
    fn test_multiple_ports_explicit_match() {
        let ports = [
            PortMapping::published(9001, 80, "4.2.2.1"),
            PortMapping::published(9002, 81, "4.2.2.1"),
        ];
        assert_eq!(
            find_mapping(&[], &[], &ports, 81),
            Some(public("4.2.2.1", 81))
        );
        // Private port matches too
        assert_eq!(
            find_mapping(&[], &[], &ports, 9002),
            Some(public("4.2.2.1", 81))
        );
        assert_eq!(find_mapping(&[], &[], &ports, 82), None);
    }

    #[test]
    fn test_multiple_ports_without_requested_port() {
        let ports = [
            PortMapping::published(9001, 80, "4.2.2.1"),
            PortMapping::published(9002, 81, "4.2.2.1"),
        ];
        assert_eq!(find_mapping(&[], &[], &ports, 0), None);
    }

    #[test]
    fn test_no_ports() {
        assert_eq!(find_mapping(&[], &[], &[], 0), None);
    }

    #[test]
    fn test_shared_network_preferred() {
        let mine = vec!["overlay-net".to_string()];
        let theirs = [net("overlay-net", "10.0.1.2")];
        let ports = [PortMapping::private(9001)];
        assert_eq!(
            find_mapping(&mine, &theirs, &ports, 0),
            Some(Mapping {
                address: "10.0.1.2".to_string(),
                port: 9001,
                network: "overlay-net".to_string(),
            })
        );

        // Even when the port is also published
        let ports = [PortMapping::published(9001, 80, "4.2.2.1")];
        assert_eq!(
            find_mapping(&mine, &theirs, &ports, 0).unwrap().network,
            "overlay-net"
        );
    }

    #[test]
    fn test_first_shared_network_wins() {
        let mine = vec!["backend".to_string(), "frontend".to_string()];
        let theirs = [net("frontend", "10.0.2.5"), net("backend", "10.0.1.5")];
        let ports = [PortMapping::private(8080)];
        let got = find_mapping(&mine, &theirs, &ports, 0).unwrap();
        assert_eq!(got.network, "backend");
        assert_eq!(got.address, "10.0.1.5");
    }

    #[test]
    fn test_shared_network_without_address_falls_back() {
        let mine = vec!["host".to_string()];
        let theirs = [net("host", "")];
        let ports = [PortMapping::published(80, 8080, "0.0.0.0")];
        assert_eq!(
            find_mapping(&mine, &theirs, &ports, 0),
            Some(Mapping {
                address: "0.0.0.0".to_string(),
                port: 8080,
                network: PUBLIC_NETWORK.to_string(),
            })
        );

        let mine = vec!["host".to_string(), "frontend".to_string()];
        let theirs = [net("host", ""), net("frontend", "10.0.2.5")];
        let got = find_mapping(&mine, &theirs, &ports, 0).unwrap();
        assert_eq!(got.network, "frontend");
        assert_eq!(got.port, 80);

        let unpublished = [PortMapping::private(80)];
        assert_eq!(find_mapping(&["host".to_string()], &[net("host", "")], &unpublished, 0), None);
    }

    #[test]
    fn test_unpublished_without_shared_network() {
        let ports = [PortMapping::private(9001)];
        assert_eq!(find_mapping(&[], &[net("other", "10.9.9.9")], &ports, 0), None);
    }

    fn container(id: &str, env: &[&str], ports: Vec<PortMapping>) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            names: vec![format!("/{}", id)],
            env: env.iter().map(|s| s.to_string()).collect(),
            networks: vec![net("proxy", &format!("10.0.0.{}", id.len()))],
            ports,
        }
    }

    #[test]
    fn test_map_containers() {
        let me = SelfContainer {
            id: "me".to_string(),
            networks: vec!["proxy".to_string()],
        };
        let inventory = vec![
            container("me", &["VIRTUAL_HOST=proxy.local"], vec![PortMapping::private(80)]),
            container("web", &["VIRTUAL_HOST=a.com,b.com"], vec![PortMapping::private(3000)]),
            container("db", &["POSTGRES_DB=app"], vec![PortMapping::private(5432)]),
            container("bad", &["VIRTUAL_HOST=c.com", "BROKEN"], vec![PortMapping::private(80)]),
            container(
                "api",
                &["VIRTUAL_HOST=api.com", "VIRTUAL_PORT=8080"],
                vec![PortMapping::private(8080), PortMapping::private(9090)],
            ),
            container(
                "ambiguous",
                &["VIRTUAL_HOST=x.com"],
                vec![PortMapping::private(1), PortMapping::private(2)],
            ),
        ];

        let sites = map_containers(&inventory, &me);
        let ids: Vec<&str> = sites.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["web", "api"]);

        assert_eq!(sites[0].hosts, vec!["a.com".to_string(), "b.com".to_string()]);
        assert_eq!(sites[0].contact.port, 3000);
        assert_eq!(sites[0].contact.network, "proxy");
        assert_eq!(sites[0].names, vec!["/web".to_string()]);
        assert_eq!(sites[1].contact.port, 8080);
        assert_eq!(sites[1].env.get(PORT_KEY).map(String::as_str), Some("8080"));
    }

    #[test]
    fn test_container_id_from_cgroup() {
        let id = "a".repeat(60) + "0f9e";
        let content = format!(
            "12:memory:/docker/{id}\n11:cpu,cpuacct:/docker/{id}\n",
            id = id
        );
        assert_eq!(container_id_from_cgroup(&content), Some(id.clone()));

        let systemd = format!("0::/system.slice/docker-{}.scope\n", id);
        assert_eq!(container_id_from_cgroup(&systemd), Some(id));

        assert_eq!(container_id_from_cgroup("0::/\n1:name=systemd:/init.scope"), None);
        assert_eq!(container_id_from_cgroup("1:cpu:/docker/abc123"), None);
        let not_hex = "z".repeat(64);
        assert_eq!(
            container_id_from_cgroup(&format!("1:cpu:/docker/{}", not_hex)),
            None
        );
    }

    #[test]
    fn test_current_container_id_override() {
        assert_eq!(current_container_id(Some("deadbeef")).unwrap(), "deadbeef");
    }

    #[test]
    fn test_read_cgroup_id_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_cgroup_id(&dir.path().join("cgroup")).unwrap_err();
        assert!(matches!(err, Error::SelfIdentity(_)));
    }
}
