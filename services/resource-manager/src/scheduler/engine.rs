//! Scheduler state and decisions.
//!
//! Everything here is synchronous and deterministic given its inputs; the
//! worker feeds it messages and turns the returned actions into events.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use rm_events::{exit_status, Allocation, Resource};
use rm_id::{AttemptId, ContainerId, NodeId};
use tracing::{debug, info, warn};

use super::ledger::{HeartbeatError, Holding, Ledger, LedgerError};
use super::policy::{plan_allocations, OrderingPolicy, PendingAsk, ResourceAsk, VictimOrder};
use super::preemption::{plan_preemption, Candidate};
use crate::config::{Config, QueueConfig};

/// What the scheduler wants done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerAction {
    /// The attempt is known to the scheduler and may ask.
    AttemptAccepted(AttemptId),
    /// A container was granted.
    Allocate(Allocation),
    /// Reclaim a container from its attempt.
    Preempt {
        attempt_id: AttemptId,
        container_id: ContainerId,
        grace: Duration,
    },
    /// Kill a container outright.
    Kill {
        container_id: ContainerId,
        exit_status: i32,
        diagnostics: String,
    },
}

/// Scheduler tunables.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub ordering: OrderingPolicy,
    pub preemption_enabled: bool,
    pub preemption_grace: Duration,
    pub victim_order: VictimOrder,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            ordering: OrderingPolicy::default(),
            preemption_enabled: true,
            preemption_grace: Duration::ZERO,
            victim_order: VictimOrder::default(),
        }
    }
}

impl From<&Config> for SchedulerSettings {
    fn from(config: &Config) -> Self {
        Self {
            ordering: config.ordering,
            preemption_enabled: config.preemption.enabled,
            preemption_grace: config.preemption.grace,
            victim_order: config.preemption.victim_order,
        }
    }
}

#[derive(Debug)]
struct AttemptEntry {
    queue: String,
    submitted_seq: u64,
    /// Outstanding asks, one per shape. `bool` marks the AM ask.
    asks: Vec<(bool, ResourceAsk)>,
    containers: BTreeSet<ContainerId>,
}

#[derive(Debug)]
struct LiveContainer {
    attempt_id: AttemptId,
    is_am: bool,
    started_seq: Option<u64>,
    marked: bool,
}

/// Scheduler state: the ledger, outstanding asks, and live containers.
#[derive(Debug)]
pub struct Scheduler {
    ledger: Ledger,
    attempts: BTreeMap<AttemptId, AttemptEntry>,
    containers: BTreeMap<ContainerId, LiveContainer>,
    settings: SchedulerSettings,
    /// Logical clock for container start order.
    clock: u64,
}

impl Scheduler {
    pub fn new(queues: &[QueueConfig], settings: SchedulerSettings) -> Self {
        Self {
            ledger: Ledger::new(queues),
            attempts: BTreeMap::new(),
            containers: BTreeMap::new(),
            settings,
            clock: 0,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Outstanding containers asked for by an attempt.
    pub fn pending_count(&self, attempt_id: &AttemptId) -> u32 {
        self.attempts
            .get(attempt_id)
            .map_or(0, |a| a.asks.iter().fold(0u32, |n, (_, ask)| n.saturating_add(ask.count)))
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub fn add_node(&mut self, node_id: NodeId, capacity: Resource) -> Result<(), LedgerError> {
        self.ledger.add_node(node_id, capacity)?;
        info!(node_id = %node_id, capacity = %capacity, "Node added");
        Ok(())
    }

    /// Forgets a node and kills everything it was running.
    pub fn remove_node(&mut self, node_id: NodeId, reason: &str) -> Vec<SchedulerAction> {
        let holdings = match self.ledger.remove_node(node_id) {
            Ok(holdings) => holdings,
            Err(e) => {
                debug!(node_id = %node_id, error = %e, "Node already gone");
                return Vec::new();
            }
        };

        info!(node_id = %node_id, reason, containers = holdings.len(), "Node removed");

        holdings
            .into_iter()
            .map(|(container_id, holding)| {
                self.forget_container(container_id, &holding);
                SchedulerAction::Kill {
                    container_id,
                    exit_status: exit_status::ABORTED,
                    diagnostics: format!("Container released on a lost node: {reason}"),
                }
            })
            .collect()
    }

    pub fn heartbeat(&mut self, node_id: NodeId, seq: u64) -> Result<(), HeartbeatError> {
        self.ledger.record_heartbeat(node_id, seq)
    }

    // =========================================================================
    // Attempts
    // =========================================================================

    pub fn add_attempt(
        &mut self,
        attempt_id: AttemptId,
        queue: String,
        submitted_seq: u64,
    ) -> Vec<SchedulerAction> {
        if self.attempts.contains_key(&attempt_id) {
            warn!(attempt_id = %attempt_id, "Attempt already added");
            return Vec::new();
        }
        if self.ledger.queue(&queue).is_none() {
            warn!(attempt_id = %attempt_id, queue = %queue, "Attempt added to unknown queue");
        }

        self.attempts.insert(
            attempt_id,
            AttemptEntry {
                queue,
                submitted_seq,
                asks: Vec::new(),
                containers: BTreeSet::new(),
            },
        );
        vec![SchedulerAction::AttemptAccepted(attempt_id)]
    }

    /// Drops an attempt's asks and kills its live containers.
    pub fn remove_attempt(&mut self, attempt_id: AttemptId) -> Vec<SchedulerAction> {
        let Some(entry) = self.attempts.remove(&attempt_id) else {
            return Vec::new();
        };

        debug!(attempt_id = %attempt_id, containers = entry.containers.len(), "Attempt removed");

        entry
            .containers
            .into_iter()
            .map(|container_id| SchedulerAction::Kill {
                container_id,
                exit_status: exit_status::KILLED_AFTER_APP_COMPLETION,
                diagnostics: "Container killed after its attempt completed".to_string(),
            })
            .collect()
    }

    /// Adds asks to an attempt. Asks of the same shape accumulate.
    pub fn add_asks(&mut self, attempt_id: AttemptId, asks: Vec<ResourceAsk>, is_am: bool) -> bool {
        let Some(entry) = self.attempts.get_mut(&attempt_id) else {
            warn!(attempt_id = %attempt_id, "Ask from unknown attempt dropped");
            return false;
        };

        for ask in asks.into_iter().filter(|a| a.count > 0) {
            match entry
                .asks
                .iter_mut()
                .find(|(am, existing)| *am == is_am && same_shape(existing, &ask))
            {
                Some((_, existing)) => existing.count = existing.count.saturating_add(ask.count),
                None => entry.asks.push((is_am, ask)),
            }
        }
        true
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// User code started: the container moves from reserved to used.
    pub fn container_started(&mut self, container_id: ContainerId) {
        if let Err(e) = self.ledger.mark_started(container_id) {
            debug!(container_id = %container_id, error = %e, "Start for unknown container");
            return;
        }
        self.clock += 1;
        if let Some(live) = self.containers.get_mut(&container_id) {
            live.started_seq.get_or_insert(self.clock);
        }
    }

    /// Credits a finished container back. Fails if it was already credited.
    pub fn container_released(&mut self, container_id: ContainerId) -> Result<Holding, LedgerError> {
        let holding = self.ledger.release(container_id)?;
        self.forget_container(container_id, &holding);
        Ok(holding)
    }

    fn forget_container(&mut self, container_id: ContainerId, holding: &Holding) {
        self.containers.remove(&container_id);
        if let Some(entry) = self.attempts.get_mut(&holding.attempt_id) {
            entry.containers.remove(&container_id);
        }
    }

    // =========================================================================
    // Allocation Pass
    // =========================================================================

    /// Grants what fits, then plans preemption for what does not.
    pub fn schedule(&mut self) -> Vec<SchedulerAction> {
        let mut asks = self.pending_asks();
        self.refresh_pending(&asks);
        if asks.is_empty() {
            return Vec::new();
        }

        self.settings.ordering.order(&self.ledger, &mut asks);
        let plan = plan_allocations(&self.ledger, &asks);

        let mut actions = Vec::new();
        for grant in &plan.grants {
            let pending = &asks[grant.ask];
            let container_id = ContainerId::new();

            if let Err(e) = self.ledger.allocate(
                grant.node_id,
                container_id,
                pending.attempt_id,
                &pending.queue,
                pending.ask.resource,
            ) {
                debug!(attempt_id = %pending.attempt_id, error = %e, "Grant rejected by ledger, ask stays pending");
                continue;
            }

            self.take_from_ask(pending);
            self.containers.insert(
                container_id,
                LiveContainer {
                    attempt_id: pending.attempt_id,
                    is_am: pending.is_am,
                    started_seq: None,
                    marked: false,
                },
            );
            if let Some(entry) = self.attempts.get_mut(&pending.attempt_id) {
                entry.containers.insert(container_id);
            }

            actions.push(SchedulerAction::Allocate(Allocation {
                container_id,
                attempt_id: pending.attempt_id,
                node_id: grant.node_id,
                queue: pending.queue.clone(),
                resource: pending.ask.resource,
                priority: pending.ask.priority,
                is_am: pending.is_am,
            }));
        }

        if self.settings.preemption_enabled && !plan.unsatisfied.is_empty() {
            let unsatisfied: Vec<PendingAsk> = plan
                .unsatisfied
                .iter()
                .map(|&i| asks[i].clone())
                .collect();
            actions.extend(self.preempt(&unsatisfied));
        }

        self.refresh_pending(&self.pending_asks());
        actions
    }

    fn preempt(&mut self, unsatisfied: &[PendingAsk]) -> Vec<SchedulerAction> {
        let candidates: Vec<Candidate> = self
            .containers
            .iter()
            .filter_map(|(container_id, live)| {
                let (node_id, holding) = self.ledger.holding(container_id)?;
                Some(Candidate {
                    container_id: *container_id,
                    attempt_id: live.attempt_id,
                    node_id,
                    queue: holding.queue.clone(),
                    resource: holding.resource,
                    started_seq: live.started_seq,
                    is_am: live.is_am,
                    marked: live.marked,
                })
            })
            .collect();

        let victims = plan_preemption(
            &self.ledger,
            unsatisfied,
            &candidates,
            self.settings.victim_order,
        );

        victims
            .into_iter()
            .map(|victim| {
                if let Some(live) = self.containers.get_mut(&victim.container_id) {
                    live.marked = true;
                }
                info!(
                    container_id = %victim.container_id,
                    attempt_id = %victim.attempt_id,
                    node_id = %victim.node_id,
                    for_attempt = %victim.for_attempt,
                    "Preempting container"
                );
                SchedulerAction::Preempt {
                    attempt_id: victim.attempt_id,
                    container_id: victim.container_id,
                    grace: self.settings.preemption_grace,
                }
            })
            .collect()
    }

    fn pending_asks(&self) -> Vec<PendingAsk> {
        self.attempts
            .iter()
            .flat_map(|(attempt_id, entry)| {
                entry
                    .asks
                    .iter()
                    .filter(|(_, ask)| ask.count > 0)
                    .map(move |(is_am, ask)| PendingAsk {
                        attempt_id: *attempt_id,
                        queue: entry.queue.clone(),
                        submitted_seq: entry.submitted_seq,
                        is_am: *is_am,
                        ask: ask.clone(),
                    })
            })
            .collect()
    }

    fn refresh_pending(&mut self, asks: &[PendingAsk]) {
        let mut pending: BTreeMap<String, Resource> = BTreeMap::new();
        for ask in asks {
            let total = ask.ask.resource.saturating_times(ask.ask.count);
            let queued = pending.entry(ask.queue.clone()).or_default();
            *queued = queued.saturating_add(&total);
        }
        self.ledger.set_pending(&pending);
    }

    fn take_from_ask(&mut self, pending: &PendingAsk) {
        let Some(entry) = self.attempts.get_mut(&pending.attempt_id) else {
            return;
        };
        if let Some((_, ask)) = entry
            .asks
            .iter_mut()
            .find(|(am, ask)| *am == pending.is_am && same_shape(ask, &pending.ask))
        {
            ask.count = ask.count.saturating_sub(1);
        }
        entry.asks.retain(|(_, ask)| ask.count > 0);
    }
}

fn same_shape(a: &ResourceAsk, b: &ResourceAsk) -> bool {
    a.priority == b.priority
        && a.resource == b.resource
        && a.locality == b.locality
        && a.relax_locality == b.relax_locality
}
