//! Ask ordering and allocation planning.
//!
//! Planning is a pure function of the ledger and the ordered asks; the
//! scheduler commits the plan afterwards.

use std::collections::BTreeMap;
use std::str::FromStr;

use rm_events::Resource;
use rm_id::{AttemptId, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ledger::Ledger;

/// A policy name that is not recognised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind} {value:?}")]
pub struct ParsePolicyError {
    kind: &'static str,
    value: String,
}

/// Order in which pending asks are served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingPolicy {
    /// Submission order, then ask priority.
    #[default]
    Fifo,
    /// Queues furthest below their guaranteed share first, then FIFO.
    QueueShare,
}

impl FromStr for OrderingPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(Self::Fifo),
            "queue_share" | "queue-share" => Ok(Self::QueueShare),
            _ => Err(ParsePolicyError {
                kind: "ordering policy",
                value: s.to_string(),
            }),
        }
    }
}

/// Which preemption victims go first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VictimOrder {
    /// Containers that started longest ago.
    #[default]
    LeastRecentlyStarted,
    /// Containers that started most recently, losing the least work.
    MostRecentlyStarted,
}

impl FromStr for VictimOrder {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "least_recently_started" | "oldest" => Ok(Self::LeastRecentlyStarted),
            "most_recently_started" | "newest" => Ok(Self::MostRecentlyStarted),
            _ => Err(ParsePolicyError {
                kind: "victim order",
                value: s.to_string(),
            }),
        }
    }
}

// =============================================================================
// Asks
// =============================================================================

/// A request for `count` containers of one shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAsk {
    /// Lower values are served first within an application.
    pub priority: u32,
    pub resource: Resource,
    pub count: u32,
    /// Preferred node.
    pub locality: Option<NodeId>,
    /// Whether another node is acceptable when the preferred one is full.
    pub relax_locality: bool,
}

impl ResourceAsk {
    pub fn new(resource: Resource, count: u32) -> Self {
        Self {
            priority: 1,
            resource,
            count,
            locality: None,
            relax_locality: true,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Prefers `node_id`; with `relax` false, only that node will do.
    pub fn on_node(mut self, node_id: NodeId, relax: bool) -> Self {
        self.locality = Some(node_id);
        self.relax_locality = relax;
        self
    }

    /// Whether a container on `node_id` can serve this ask.
    pub fn accepts(&self, node_id: &NodeId) -> bool {
        match self.locality {
            Some(preferred) if !self.relax_locality => preferred == *node_id,
            _ => true,
        }
    }
}

/// An outstanding ask together with what ordering needs to know about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAsk {
    pub attempt_id: AttemptId,
    pub queue: String,
    pub submitted_seq: u64,
    /// The application master's own container.
    pub is_am: bool,
    pub ask: ResourceAsk,
}

impl PendingAsk {
    fn fifo_key(&self) -> (u64, AttemptId, bool, u32) {
        (self.submitted_seq, self.attempt_id, !self.is_am, self.ask.priority)
    }
}

impl OrderingPolicy {
    /// Sorts asks into serving order. Stable for equal keys.
    pub fn order(&self, ledger: &Ledger, asks: &mut [PendingAsk]) {
        match self {
            OrderingPolicy::Fifo => asks.sort_by_key(PendingAsk::fifo_key),
            OrderingPolicy::QueueShare => {
                let ratios: BTreeMap<&str, f64> = ledger
                    .queues()
                    .map(|(name, _)| (name.as_str(), ledger.queue_share_ratio(name)))
                    .collect();
                let ratio = |ask: &PendingAsk| ratios.get(ask.queue.as_str()).copied().unwrap_or(0.0);
                asks.sort_by(|a, b| {
                    ratio(a)
                        .total_cmp(&ratio(b))
                        .then_with(|| a.fifo_key().cmp(&b.fifo_key()))
                });
            }
        }
    }
}

// =============================================================================
// Planning
// =============================================================================

/// One container to grant: which ask it serves and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// Index into the ask slice passed to [`plan_allocations`].
    pub ask: usize,
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationPlan {
    pub grants: Vec<Grant>,
    /// Indexes of asks not fully served.
    pub unsatisfied: Vec<usize>,
}

/// Plans grants for `asks`, served in slice order, against the ledger's
/// free capacity.
pub fn plan_allocations(ledger: &Ledger, asks: &[PendingAsk]) -> AllocationPlan {
    let mut free: BTreeMap<NodeId, Resource> = ledger
        .nodes()
        .map(|(id, node)| (*id, node.available()))
        .collect();
    let mut plan = AllocationPlan::default();

    for (index, pending) in asks.iter().enumerate() {
        let mut granted = 0;
        while granted < pending.ask.count {
            let Some(node_id) = choose_node(&free, &pending.ask) else {
                break;
            };
            if let Some(room) = free.get_mut(&node_id) {
                *room = *room - pending.ask.resource;
            }
            plan.grants.push(Grant {
                ask: index,
                node_id,
            });
            granted += 1;
        }
        if granted < pending.ask.count {
            plan.unsatisfied.push(index);
        }
    }

    plan
}

/// The preferred node if it fits, else (when allowed) the node with the
/// most free memory. Ties go to the smallest node id.
fn choose_node(free: &BTreeMap<NodeId, Resource>, ask: &ResourceAsk) -> Option<NodeId> {
    if let Some(preferred) = ask.locality {
        if free.get(&preferred).is_some_and(|room| ask.resource.fits_in(room)) {
            return Some(preferred);
        }
        if !ask.relax_locality {
            return None;
        }
    }

    free.iter()
        .filter(|(_, room)| ask.resource.fits_in(room))
        .max_by(|(a_id, a), (b_id, b)| a.memory_mb.cmp(&b.memory_mb).then_with(|| b_id.cmp(a_id)))
        .map(|(id, _)| *id)
}
