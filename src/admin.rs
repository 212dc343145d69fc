//! Debug socket exposing the current routing table
//!
//! [`SiteRegistry`] is registered as an observer and keeps the latest table.
//! [`AdminServer`] serves it read-only over a Unix socket.

use crate::error::Result;
use crate::mapping::{Mapping, RoutingTable, Site};
use crate::observer::Observer;
use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the updater
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Latest routing table, as seen by the observers
#[derive(Default)]
pub struct SiteRegistry {
    sites: RwLock<RoutingTable>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self {
            sites: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Cheap clone of the current table
    pub fn snapshot(&self) -> RoutingTable {
        self.sites.read().clone()
    }
}

#[async_trait]
impl Observer for SiteRegistry {
    fn name(&self) -> &str {
        "adminsocket"
    }

    async fn update(&self, sites: RoutingTable) -> Result<()> {
        debug!(sites = sites.len(), "Routing table snapshot updated");
        *self.sites.write() = sites;
        Ok(())
    }
}

/// What the socket reports per site. The environment is left out since it
/// can carry credentials.
#[derive(Serialize)]
struct SiteView<'a> {
    id: &'a str,
    names: &'a [String],
    hosts: &'a [String],
    contact: &'a Mapping,
}

impl<'a> From<&'a Site> for SiteView<'a> {
    fn from(site: &'a Site) -> Self {
        Self {
            id: &site.id,
            names: &site.names,
            hosts: &site.hosts,
            contact: &site.contact,
        }
    }
}

/// Read-only HTTP server on a Unix socket
pub struct AdminServer {
    socket_path: PathBuf,
    registry: Arc<SiteRegistry>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        registry: Arc<SiteRegistry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            registry,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        // A socket left over from a previous run would make bind fail
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "Admin socket listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let registry = Arc::clone(&self.registry);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let registry = Arc::clone(&registry);
                                    async move { Ok::<_, hyper::Error>(handle_request(&req, &registry)) }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Admin socket shutting down");
                        break;
                    }
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            warn!(path = %self.socket_path.display(), error = %e, "Failed to remove admin socket");
        }
        Ok(())
    }
}

fn handle_request<B>(req: &Request<B>, registry: &SiteRegistry) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin request");

    match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/sites") => {
            let sites = registry.snapshot();
            let views: Vec<SiteView<'_>> = sites.iter().map(SiteView::from).collect();
            match serde_json::to_string(&views) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => {
                    error!(error = %e, "Failed to serialize sites");
                    response(StatusCode::INTERNAL_SERVER_ERROR, "serialization error")
                }
            }
        }

        (_, "/health" | "/version" | "/sites") => {
            response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn site(id: &str, host: &str) -> Site {
        Site {
            id: id.to_string(),
            names: vec![format!("/{}", id)],
            contact: Mapping {
                address: "172.17.0.5".to_string(),
                port: 8080,
                network: "bridge".to_string(),
            },
            hosts: vec![host.to_string()],
            env: [("AUTH_PASS".to_string(), "hunter2".to_string())].into(),
        }
    }

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    async fn body_string(resp: Response<Full<Bytes>>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_registry_snapshot() {
        let registry = SiteRegistry::new();
        assert!(registry.snapshot().is_empty());

        registry
            .update(Arc::from(vec![site("abc", "a.example.com")]))
            .await
            .unwrap();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "abc");
        assert_eq!(registry.name(), "adminsocket");
    }

    #[tokio::test]
    async fn test_sites_endpoint_hides_env() {
        let registry = SiteRegistry::new();
        registry
            .update(Arc::from(vec![site("abc", "a.example.com"), site("def", "b.example.com")]))
            .await
            .unwrap();

        let resp = handle_request(&get("/sites"), &registry);
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        assert_eq!(parsed[1]["hosts"][0], "b.example.com");
        assert_eq!(parsed[0]["contact"]["port"], 8080);
        assert!(!body.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_health_and_version() {
        let registry = SiteRegistry::new();
        let resp = handle_request(&get("/health"), &registry);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "ok");

        let resp = handle_request(&get("/version"), &registry);
        let parsed: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(parsed["name"], PKG_NAME);
        assert_eq!(parsed["version"], VERSION);
    }

    #[test]
    fn test_unknown_routes() {
        let registry = SiteRegistry::new();
        assert_eq!(handle_request(&get("/nope"), &registry).status(), StatusCode::NOT_FOUND);

        let post = Request::builder()
            .method(Method::POST)
            .uri("/sites")
            .body(())
            .unwrap();
        assert_eq!(
            handle_request(&post, &registry).status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[tokio::test]
    async fn test_serves_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admin.sock");
        // Stale file from a previous run
        std::fs::write(&path, "").unwrap();

        let registry = Arc::new(SiteRegistry::new());
        registry
            .update(Arc::from(vec![site("abc", "a.example.com")]))
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = AdminServer::new(&path, Arc::clone(&registry), shutdown_rx);
        let handle = tokio::spawn(server.run());

        let mut stream = None;
        for _ in 0..50 {
            match tokio::net::UnixStream::connect(&path).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        let mut stream = stream.expect("admin socket should accept connections");
        stream
            .write_all(b"GET /sites HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200 OK"));
        assert!(raw.contains("a.example.com"));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_site_view_fields() {
        let s = site("abc", "a.example.com");
        let view = SiteView::from(&s);
        let value = serde_json::to_value(&view).unwrap();
        let keys: HashMap<String, serde_json::Value> = serde_json::from_value(value).unwrap();
        assert!(keys.contains_key("id"));
        assert!(keys.contains_key("contact"));
        assert!(!keys.contains_key("env"));
    }
}
