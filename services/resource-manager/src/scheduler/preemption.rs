//! Preemption planning.
//!
//! When an ask from a queue below its guaranteed share cannot be placed,
//! reclaim containers from queues above their share. Victims for one ask
//! all come from a single node the ask accepts, the one needing the fewest
//! victims.
//!
//! # Invariants
//!
//! - Never takes a queue below its guaranteed share
//! - Never picks an application master container
//! - Never picks a container already marked for preemption; capacity those
//!   containers will free counts as already reclaimed

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

use rm_events::Resource;
use rm_id::{AttemptId, ContainerId, NodeId};

use super::ledger::Ledger;
use super::policy::{PendingAsk, VictimOrder};

/// A live container preemption may consider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub container_id: ContainerId,
    pub attempt_id: AttemptId,
    pub node_id: NodeId,
    pub queue: String,
    pub resource: Resource,
    /// Scheduler sequence at which user code started; `None` if not yet.
    pub started_seq: Option<u64>,
    pub is_am: bool,
    /// Already asked to go.
    pub marked: bool,
}

/// A container chosen for preemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Victim {
    pub container_id: ContainerId,
    pub attempt_id: AttemptId,
    pub node_id: NodeId,
    pub resource: Resource,
    /// The attempt whose ask the victim makes room for.
    pub for_attempt: AttemptId,
}

/// Chooses victims for `unsatisfied` asks, served in slice order.
pub fn plan_preemption(
    ledger: &Ledger,
    unsatisfied: &[PendingAsk],
    candidates: &[Candidate],
    order: VictimOrder,
) -> Vec<Victim> {
    let mut usage: BTreeMap<String, Resource> = ledger
        .queues()
        .map(|(name, queue)| (name.clone(), queue.usage()))
        .collect();

    // Free room per node, counting what marked victims will hand back.
    let mut free: BTreeMap<NodeId, Resource> = ledger
        .nodes()
        .map(|(id, node)| (*id, node.available()))
        .collect();
    let mut taken: HashSet<ContainerId> = HashSet::new();
    for candidate in candidates.iter().filter(|c| c.marked) {
        taken.insert(candidate.container_id);
        if let Some(room) = free.get_mut(&candidate.node_id) {
            *room += candidate.resource;
        }
        if let Some(held) = usage.get_mut(&candidate.queue) {
            *held = *held - candidate.resource;
        }
    }

    let mut victims = Vec::new();

    for pending in unsatisfied {
        let need = pending.ask.resource;
        let after_grant = usage.get(&pending.queue).copied().unwrap_or(Resource::ZERO) + need;
        if ledger.share_of(&after_grant) > ledger.guaranteed_share(&pending.queue) {
            continue;
        }

        // Room already on its way.
        if let Some((_, room)) = free
            .iter_mut()
            .find(|(node_id, room)| pending.ask.accepts(node_id) && need.fits_in(room))
        {
            *room = *room - need;
            usage.insert(pending.queue.clone(), after_grant);
            continue;
        }

        let mut best: Option<NodePick<'_>> = None;
        for (node_id, room) in free.iter().filter(|(node_id, _)| pending.ask.accepts(node_id)) {
            let pick = pick_on_node(
                ledger, &usage, *node_id, *room, pending, candidates, &taken, order,
            );
            let Some(pick) = pick else {
                continue;
            };
            if best.as_ref().is_none_or(|b| pick.victims.len() < b.victims.len()) {
                best = Some(pick);
            }
        }

        let Some(pick) = best else {
            continue;
        };

        usage = pick.usage;
        usage.insert(pending.queue.clone(), after_grant);
        free.insert(pick.node_id, pick.room - need);
        for candidate in pick.victims {
            taken.insert(candidate.container_id);
            victims.push(Victim {
                container_id: candidate.container_id,
                attempt_id: candidate.attempt_id,
                node_id: candidate.node_id,
                resource: candidate.resource,
                for_attempt: pending.attempt_id,
            });
        }
    }

    victims
}

/// Victims on one node that together make room for an ask.
struct NodePick<'a> {
    node_id: NodeId,
    victims: Vec<&'a Candidate>,
    /// Room on the node once the victims are gone.
    room: Resource,
    /// Queue usage once the victims are gone.
    usage: BTreeMap<String, Resource>,
}

#[allow(clippy::too_many_arguments)]
fn pick_on_node<'a>(
    ledger: &Ledger,
    usage: &BTreeMap<String, Resource>,
    node_id: NodeId,
    room: Resource,
    pending: &PendingAsk,
    candidates: &'a [Candidate],
    taken: &HashSet<ContainerId>,
    order: VictimOrder,
) -> Option<NodePick<'a>> {
    let mut pool: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| {
            c.node_id == node_id
                && !c.is_am
                && !taken.contains(&c.container_id)
                && c.queue != pending.queue
        })
        .collect();

    // Containers that never started lose nothing, so they always go first.
    match order {
        VictimOrder::LeastRecentlyStarted => pool.sort_by_key(|c| {
            (c.started_seq.is_some(), c.started_seq, c.container_id)
        }),
        VictimOrder::MostRecentlyStarted => pool.sort_by_key(|c| {
            (c.started_seq.is_some(), Reverse(c.started_seq), c.container_id)
        }),
    }

    let mut usage = usage.clone();
    let mut room = room;
    let mut victims = Vec::new();

    for candidate in pool {
        if pending.ask.resource.fits_in(&room) {
            break;
        }
        let held = usage.get(&candidate.queue).copied().unwrap_or(Resource::ZERO);
        let remaining = held - candidate.resource;
        if ledger.share_of(&remaining) < ledger.guaranteed_share(&candidate.queue) {
            continue;
        }
        usage.insert(candidate.queue.clone(), remaining);
        room += candidate.resource;
        victims.push(candidate);
    }

    pending.ask.resource.fits_in(&room).then_some(NodePick {
        node_id,
        victims,
        room,
        usage,
    })
}
