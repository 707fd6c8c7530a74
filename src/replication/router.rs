use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Maps a `(source, destination)` pair to the next hop that should carry a
/// replication request. The concrete routing policy lives outside the
/// engine; the leader only asks "who do I hand this to next".
pub trait Router: Send + Sync {
    /// The peer the request should be sent to on its way to `dest`.
    /// Returning `dest` itself means direct delivery.
    fn next_hop(&self, source: &Uuid, dest: &Uuid) -> Uuid;
}

/// Routing policy that always delivers directly to the destination.
#[derive(Debug, Default)]
pub struct DirectRouter;

impl Router for DirectRouter {
    fn next_hop(&self, _source: &Uuid, dest: &Uuid) -> Uuid {
        *dest
    }
}

/// A static routing table with per-destination overrides, falling back to
/// direct delivery. Useful for tests and simple hub topologies.
#[derive(Debug, Default)]
pub struct TableRouter {
    hops: RwLock<HashMap<Uuid, Uuid>>,
}

impl TableRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hop(&self, dest: Uuid, via: Uuid) {
        self.hops.write().insert(dest, via);
    }

    pub fn clear_hop(&self, dest: &Uuid) {
        self.hops.write().remove(dest);
    }
}

impl Router for TableRouter {
    fn next_hop(&self, _source: &Uuid, dest: &Uuid) -> Uuid {
        self.hops.read().get(dest).copied().unwrap_or(*dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_router_returns_destination() {
        let source = Uuid::new_v4();
        let dest = Uuid::new_v4();
        assert_eq!(DirectRouter.next_hop(&source, &dest), dest);
    }

    #[test]
    fn table_router_overrides_and_falls_back() {
        let router = TableRouter::new();
        let source = Uuid::new_v4();
        let dest = Uuid::new_v4();
        let via = Uuid::new_v4();
        assert_eq!(router.next_hop(&source, &dest), dest);
        router.set_hop(dest, via);
        assert_eq!(router.next_hop(&source, &dest), via);
        router.clear_hop(&dest);
        assert_eq!(router.next_hop(&source, &dest), dest);
    }
}
