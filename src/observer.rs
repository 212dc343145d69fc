//! Targets notified with every recomputed routing table

use crate::error::Result;
use crate::mapping::RoutingTable;
use async_trait::async_trait;

/// Something that consumes the routing table, e.g. the nginx renderer or the
/// debug socket.
///
/// Observers are registered with the manager before it starts and are called
/// in registration order after every convergence cycle. A failing observer
/// does not stop the others from being updated.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    /// Replace the observer's view with `sites`
    async fn update(&self, sites: RoutingTable) -> Result<()>;
}
