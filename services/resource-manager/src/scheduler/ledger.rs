//! Cluster resource ledger.
//!
//! Per node: capacity, `reserved` (granted, user code not started yet),
//! `used` (running), and every container the node holds. Per queue: its
//! guaranteed share and the same split of what it holds.
//!
//! # Invariants
//!
//! - `used + reserved <= capacity` on every node, checked on every grant
//! - A container is credited back at most once; a second release is
//!   `UnknownContainer`
//! - Queue totals always equal the sum of the holdings of that queue

use std::collections::{BTreeMap, HashMap};

use rm_events::Resource;
use rm_id::{AttemptId, ContainerId, NodeId};
use serde::Serialize;
use thiserror::Error;

use crate::config::QueueConfig;

/// Errors from ledger mutations. The ledger is unchanged when one is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("node {0} is not registered")]
    UnknownNode(NodeId),

    #[error("node {0} is already registered")]
    NodeExists(NodeId),

    #[error("queue {0} is not configured")]
    UnknownQueue(String),

    #[error("container {0} is not held by any node")]
    UnknownContainer(ContainerId),

    #[error("container {0} is already held")]
    DuplicateContainer(ContainerId),

    #[error("{requested} does not fit on node {node_id}, {available} available")]
    Violation {
        node_id: NodeId,
        requested: Resource,
        available: Resource,
    },
}

/// Rejected node heartbeat.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeartbeatError {
    #[error("node {0} is not registered")]
    UnknownNode(NodeId),

    #[error("heartbeat {received} from node {node_id} is older than {last}")]
    OutOfOrder {
        node_id: NodeId,
        last: u64,
        received: u64,
    },
}

/// One container held by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Holding {
    pub attempt_id: AttemptId,
    pub queue: String,
    pub resource: Resource,
    /// False while the container only reserves its resources.
    pub started: bool,
}

/// Accounting for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeEntry {
    pub capacity: Resource,
    pub used: Resource,
    pub reserved: Resource,
    pub containers: BTreeMap<ContainerId, Holding>,
    pub last_heartbeat_seq: Option<u64>,
}

impl NodeEntry {
    fn new(capacity: Resource) -> Self {
        Self {
            capacity,
            used: Resource::ZERO,
            reserved: Resource::ZERO,
            containers: BTreeMap::new(),
            last_heartbeat_seq: None,
        }
    }

    /// Capacity not yet granted to anyone.
    pub fn available(&self) -> Resource {
        self.capacity.saturating_sub(&(self.used + self.reserved))
    }

    fn debit(&mut self, holding: &Holding) {
        if holding.started {
            self.used = self.used - holding.resource;
        } else {
            self.reserved = self.reserved - holding.resource;
        }
    }
}

/// Accounting for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueEntry {
    pub guaranteed_percent: u32,
    pub used: Resource,
    pub reserved: Resource,
    /// Outstanding asks, refreshed every scheduling pass.
    pub pending: Resource,
}

impl QueueEntry {
    /// Everything the queue holds, started or not.
    pub fn usage(&self) -> Resource {
        self.used + self.reserved
    }

    fn debit(&mut self, holding: &Holding) {
        if holding.started {
            self.used = self.used - holding.resource;
        } else {
            self.reserved = self.reserved - holding.resource;
        }
    }
}

/// Where every granted resource is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Ledger {
    nodes: BTreeMap<NodeId, NodeEntry>,
    queues: BTreeMap<String, QueueEntry>,
    #[serde(skip)]
    index: HashMap<ContainerId, NodeId>,
}

impl Ledger {
    pub fn new(queues: &[QueueConfig]) -> Self {
        Self {
            nodes: BTreeMap::new(),
            queues: queues
                .iter()
                .map(|q| {
                    let entry = QueueEntry {
                        guaranteed_percent: q.guaranteed_percent,
                        used: Resource::ZERO,
                        reserved: Resource::ZERO,
                        pending: Resource::ZERO,
                    };
                    (q.name.clone(), entry)
                })
                .collect(),
            index: HashMap::new(),
        }
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub fn add_node(&mut self, node_id: NodeId, capacity: Resource) -> Result<(), LedgerError> {
        if self.nodes.contains_key(&node_id) {
            return Err(LedgerError::NodeExists(node_id));
        }
        self.nodes.insert(node_id, NodeEntry::new(capacity));
        Ok(())
    }

    /// Drops a node with everything it holds, returning the dropped holdings.
    pub fn remove_node(
        &mut self,
        node_id: NodeId,
    ) -> Result<Vec<(ContainerId, Holding)>, LedgerError> {
        let node = self
            .nodes
            .remove(&node_id)
            .ok_or(LedgerError::UnknownNode(node_id))?;

        let holdings: Vec<_> = node.containers.into_iter().collect();
        for (container_id, holding) in &holdings {
            self.index.remove(container_id);
            if let Some(queue) = self.queues.get_mut(&holding.queue) {
                queue.debit(holding);
            }
        }
        Ok(holdings)
    }

    /// Accepts a heartbeat sequence number if it does not go backwards.
    pub fn record_heartbeat(&mut self, node_id: NodeId, seq: u64) -> Result<(), HeartbeatError> {
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(HeartbeatError::UnknownNode(node_id))?;

        if let Some(last) = node.last_heartbeat_seq {
            if seq < last {
                return Err(HeartbeatError::OutOfOrder {
                    node_id,
                    last,
                    received: seq,
                });
            }
        }
        node.last_heartbeat_seq = Some(seq);
        Ok(())
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&NodeEntry> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &NodeEntry)> {
        self.nodes.iter()
    }

    pub fn cluster_capacity(&self) -> Resource {
        self.nodes.values().map(|n| n.capacity).sum()
    }

    // =========================================================================
    // Queues
    // =========================================================================

    pub fn queue(&self, name: &str) -> Option<&QueueEntry> {
        self.queues.get(name)
    }

    pub fn queues(&self) -> impl Iterator<Item = (&String, &QueueEntry)> {
        self.queues.iter()
    }

    /// Share of the cluster `resource` amounts to.
    pub fn share_of(&self, resource: &Resource) -> f64 {
        resource.dominant_share(&self.cluster_capacity())
    }

    /// Guaranteed share of `queue` as a fraction of the cluster.
    pub fn guaranteed_share(&self, queue: &str) -> f64 {
        self.queues
            .get(queue)
            .map_or(0.0, |q| f64::from(q.guaranteed_percent) / 100.0)
    }

    /// How much of its guarantee a queue is using; above 1.0 is over.
    pub fn queue_share_ratio(&self, queue: &str) -> f64 {
        let usage = self.queues.get(queue).map_or(Resource::ZERO, QueueEntry::usage);
        let share = self.share_of(&usage);
        let guaranteed = self.guaranteed_share(queue);
        if guaranteed > 0.0 {
            share / guaranteed
        } else if share > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    }

    pub(crate) fn set_pending(&mut self, pending: &BTreeMap<String, Resource>) {
        for (name, queue) in &mut self.queues {
            queue.pending = pending.get(name).copied().unwrap_or(Resource::ZERO);
        }
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// Reserves `resource` on a node for a newly granted container.
    pub fn allocate(
        &mut self,
        node_id: NodeId,
        container_id: ContainerId,
        attempt_id: AttemptId,
        queue: &str,
        resource: Resource,
    ) -> Result<(), LedgerError> {
        if self.index.contains_key(&container_id) {
            return Err(LedgerError::DuplicateContainer(container_id));
        }
        let queue_entry = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| LedgerError::UnknownQueue(queue.to_string()))?;
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(LedgerError::UnknownNode(node_id))?;

        let available = node.available();
        if !resource.fits_in(&available) {
            return Err(LedgerError::Violation {
                node_id,
                requested: resource,
                available,
            });
        }

        node.reserved += resource;
        node.containers.insert(
            container_id,
            Holding {
                attempt_id,
                queue: queue.to_string(),
                resource,
                started: false,
            },
        );
        queue_entry.reserved += resource;
        self.index.insert(container_id, node_id);
        Ok(())
    }

    /// Moves a container from reserved to used. Idempotent.
    pub fn mark_started(&mut self, container_id: ContainerId) -> Result<(), LedgerError> {
        let node_id = self
            .index
            .get(&container_id)
            .ok_or(LedgerError::UnknownContainer(container_id))?;
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or(LedgerError::UnknownNode(*node_id))?;
        let holding = node
            .containers
            .get_mut(&container_id)
            .ok_or(LedgerError::UnknownContainer(container_id))?;

        if holding.started {
            return Ok(());
        }
        holding.started = true;
        node.reserved = node.reserved - holding.resource;
        node.used += holding.resource;
        if let Some(queue) = self.queues.get_mut(&holding.queue) {
            queue.reserved = queue.reserved - holding.resource;
            queue.used += holding.resource;
        }
        Ok(())
    }

    /// Credits a container's resources back to its node and queue.
    pub fn release(&mut self, container_id: ContainerId) -> Result<Holding, LedgerError> {
        let node_id = self
            .index
            .remove(&container_id)
            .ok_or(LedgerError::UnknownContainer(container_id))?;
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(LedgerError::UnknownNode(node_id))?;
        let holding = node
            .containers
            .remove(&container_id)
            .ok_or(LedgerError::UnknownContainer(container_id))?;

        node.debit(&holding);
        if let Some(queue) = self.queues.get_mut(&holding.queue) {
            queue.debit(&holding);
        }
        Ok(holding)
    }

    /// The node holding a container, with the holding.
    pub fn holding(&self, container_id: &ContainerId) -> Option<(NodeId, &Holding)> {
        let node_id = self.index.get(container_id)?;
        let holding = self.nodes.get(node_id)?.containers.get(container_id)?;
        Some((*node_id, holding))
    }

    pub fn container_count(&self) -> usize {
        self.index.len()
    }

    /// Full consistency check, for tests and debug assertions.
    pub fn is_consistent(&self) -> bool {
        let nodes_ok = self.nodes.values().all(|node| {
            let (used, reserved) = node.containers.values().fold(
                (Resource::ZERO, Resource::ZERO),
                |(used, reserved), h| {
                    if h.started {
                        (used + h.resource, reserved)
                    } else {
                        (used, reserved + h.resource)
                    }
                },
            );
            node.used == used
                && node.reserved == reserved
                && (node.used + node.reserved).fits_in(&node.capacity)
        });

        let queues_total: Resource = self.queues.values().map(QueueEntry::usage).sum();

        nodes_ok && queues_total.fits_in(&self.cluster_capacity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rm_id::AppId;

    fn ledger() -> Ledger {
        Ledger::new(&[QueueConfig::new("prod", 70), QueueConfig::new("dev", 30)])
    }

    #[test]
    fn test_allocate_start_release() {
        let mut ledger = ledger();
        let node = NodeId::new();
        let container = ContainerId::new();
        let attempt = AttemptId::new(AppId::new(), 1);
        ledger.add_node(node, Resource::new(8192, 8)).unwrap();

        ledger
            .allocate(node, container, attempt, "prod", Resource::new(2048, 2))
            .unwrap();
        assert_eq!(ledger.node(&node).unwrap().reserved, Resource::new(2048, 2));
        assert_eq!(ledger.queue("prod").unwrap().reserved, Resource::new(2048, 2));

        ledger.mark_started(container).unwrap();
        ledger.mark_started(container).unwrap();
        let entry = ledger.node(&node).unwrap();
        assert_eq!(entry.used, Resource::new(2048, 2));
        assert_eq!(entry.reserved, Resource::ZERO);

        let holding = ledger.release(container).unwrap();
        assert_eq!(holding.resource, Resource::new(2048, 2));
        assert_eq!(ledger.node(&node).unwrap().used, Resource::ZERO);
        assert_eq!(ledger.queue("prod").unwrap().usage(), Resource::ZERO);

        assert_eq!(
            ledger.release(container),
            Err(LedgerError::UnknownContainer(container))
        );
        assert!(ledger.is_consistent());
    }

    #[test]
    fn test_allocate_rejects_overcommit() {
        let mut ledger = ledger();
        let node = NodeId::new();
        let attempt = AttemptId::new(AppId::new(), 1);
        ledger.add_node(node, Resource::new(4096, 4)).unwrap();
        ledger
            .allocate(node, ContainerId::new(), attempt, "prod", Resource::new(3072, 1))
            .unwrap();

        let err = ledger
            .allocate(node, ContainerId::new(), attempt, "dev", Resource::new(2048, 1))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Violation { .. }));
        assert_eq!(ledger.container_count(), 1);
    }

    #[test]
    fn test_allocate_unknown_queue_and_node() {
        let mut ledger = ledger();
        let node = NodeId::new();
        let attempt = AttemptId::new(AppId::new(), 1);
        ledger.add_node(node, Resource::new(4096, 4)).unwrap();

        assert_eq!(
            ledger.allocate(node, ContainerId::new(), attempt, "batch", Resource::new(1, 1)),
            Err(LedgerError::UnknownQueue("batch".to_string()))
        );
        let other = NodeId::new();
        assert_eq!(
            ledger.allocate(other, ContainerId::new(), attempt, "dev", Resource::new(1, 1)),
            Err(LedgerError::UnknownNode(other))
        );
        assert_eq!(
            ledger.add_node(node, Resource::new(1, 1)),
            Err(LedgerError::NodeExists(node))
        );
    }

    #[test]
    fn test_remove_node_drops_holdings() {
        let mut ledger = ledger();
        let node = NodeId::new();
        let container = ContainerId::new();
        let attempt = AttemptId::new(AppId::new(), 1);
        ledger.add_node(node, Resource::new(4096, 4)).unwrap();
        ledger
            .allocate(node, container, attempt, "dev", Resource::new(1024, 1))
            .unwrap();

        let dropped = ledger.remove_node(node).unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].0, container);
        assert_eq!(ledger.queue("dev").unwrap().usage(), Resource::ZERO);
        assert_eq!(
            ledger.release(container),
            Err(LedgerError::UnknownContainer(container))
        );
    }

    #[test]
    fn test_heartbeat_sequence_must_not_go_backwards() {
        let mut ledger = ledger();
        let node = NodeId::new();
        ledger.add_node(node, Resource::new(1024, 1)).unwrap();

        ledger.record_heartbeat(node, 5).unwrap();
        ledger.record_heartbeat(node, 5).unwrap();
        ledger.record_heartbeat(node, 6).unwrap();
        assert_eq!(
            ledger.record_heartbeat(node, 4),
            Err(HeartbeatError::OutOfOrder {
                node_id: node,
                last: 6,
                received: 4,
            })
        );

        let unknown = NodeId::new();
        assert_eq!(
            ledger.record_heartbeat(unknown, 1),
            Err(HeartbeatError::UnknownNode(unknown))
        );
    }

    #[test]
    fn test_queue_share_ratio() {
        let mut ledger = ledger();
        let node = NodeId::new();
        let attempt = AttemptId::new(AppId::new(), 1);
        ledger.add_node(node, Resource::new(10_000, 10)).unwrap();
        ledger
            .allocate(node, ContainerId::new(), attempt, "dev", Resource::new(6000, 3))
            .unwrap();

        // dev holds 60% against a 30% guarantee
        assert!((ledger.queue_share_ratio("dev") - 2.0).abs() < 1e-9);
        assert_eq!(ledger.queue_share_ratio("prod"), 0.0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate { node: usize, memory_mb: u64, vcores: u32 },
        Start(usize),
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..3, 1u64..4096, 1u32..4).prop_map(|(node, memory_mb, vcores)| Op::Allocate {
                node,
                memory_mb,
                vcores
            }),
            (0usize..64).prop_map(Op::Start),
            (0usize..64).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn ledger_never_overcommits_or_double_credits(ops in prop::collection::vec(op(), 1..200)) {
            let mut ledger = ledger();
            let nodes: Vec<NodeId> = (0..3).map(|_| NodeId::new()).collect();
            for node in &nodes {
                ledger.add_node(*node, Resource::new(8192, 8)).unwrap();
            }
            let attempt = AttemptId::new(AppId::new(), 1);
            let mut granted: Vec<ContainerId> = Vec::new();
            let mut released = std::collections::HashSet::new();

            for op in ops {
                match op {
                    Op::Allocate { node, memory_mb, vcores } => {
                        let container = ContainerId::new();
                        if ledger
                            .allocate(nodes[node], container, attempt, "prod", Resource::new(memory_mb, vcores))
                            .is_ok()
                        {
                            granted.push(container);
                        }
                    }
                    Op::Start(i) if !granted.is_empty() => {
                        let container = granted[i % granted.len()];
                        let result = ledger.mark_started(container);
                        prop_assert_eq!(result.is_ok(), !released.contains(&container));
                    }
                    Op::Release(i) if !granted.is_empty() => {
                        let container = granted[i % granted.len()];
                        let result = ledger.release(container);
                        // a second release is always refused
                        prop_assert_eq!(result.is_ok(), released.insert(container));
                    }
                    _ => {}
                }
                prop_assert!(ledger.is_consistent());
            }
        }
    }
}
