//! Dockerproxy - keeps an nginx reverse proxy in sync with running containers
//!
//! This library provides an updater that:
//! - Watches one leader and any number of follower Docker endpoints for events
//! - Coalesces bursts of events into a single debounced update
//! - Maps containers declaring `VIRTUAL_HOST` to upstreams and virtual hosts
//! - Renders the nginx config and reloads nginx only when the output changes
//! - Exposes the current routing table on a read-only Unix socket

pub mod admin;
pub mod config;
pub mod debounce;
pub mod docker;
pub mod error;
pub mod kv;
pub mod manager;
pub mod mapping;
pub mod nginx;
pub mod observer;
pub mod runtime;
pub mod template;
pub mod watcher;
