//! Application attempt controller.
//!
//! One attempt is one run of an application master. The attempt asks the
//! scheduler for the AM container, saves itself once the container is
//! granted, launches it, and then follows the AM until it unregisters,
//! exits, goes silent, or is killed.
//!
//! ## State Machine
//!
//! ```text
//! new -> submitted -> scheduled -> allocated_saving -> allocated -> launched -> running
//!                          |                               |           |          |
//!                          |                               +-----------+----------+--> final_saving
//!                          |                                           |          |        |
//!                          +------------------ expire -----------------+----------+--> failed
//!
//! final_saving -> finishing -> finished
//!      |
//!      +--> finished | failed | killed
//! ```
//!
//! Any non-terminal state goes to `killed` on KILL. Terminal entry
//! unregisters the attempt from the AM liveliness monitor, removes it from
//! the scheduler (which kills its live containers), tells the application,
//! and saves a final snapshot.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use rm_events::{
    exit_status, AppEvent, AttemptEvent, AttemptEventType, AttemptSnapshot, AttemptState,
    ContainerEvent, ContainerStatus, EntityId, EntityState, EventEnvelope, EventPayload,
    FinalStatus, LaunchContext, Resource, Snapshot,
};
use rm_fsm::{HookError, Outcome, StateMachine, TransitionTable};
use rm_id::{AttemptId, ContainerId};
use tracing::{debug, info, warn};

use super::{lift, ApplyError, Diagnostics, EntityController, EntityStatus, Services};

use rm_events::AttemptEventType as T;
use rm_events::AttemptState as S;

type Table = TransitionTable<AttemptState, AttemptEventType, AttemptOperand, AttemptEvent>;

const NON_TERMINAL: &[AttemptState] = &[
    S::New,
    S::Submitted,
    S::Scheduled,
    S::AllocatedSaving,
    S::Allocated,
    S::Launched,
    S::Running,
    S::FinalSaving,
    S::Finishing,
];

static TABLE: LazyLock<Table> = LazyLock::new(|| {
    let mut builder = Table::builder(S::New, &[S::Finished, S::Failed, S::Killed])
        .transition_with(&[S::New], S::Submitted, T::Start, on_start)
        .choice(
            &[S::New],
            T::Recover,
            &[S::Finished, S::Failed, S::Killed],
            on_recover,
        )
        .transition_with(&[S::Submitted], S::Scheduled, T::AttemptAdded, on_added)
        .transition_with(
            &[S::Scheduled],
            S::AllocatedSaving,
            T::ContainerAllocated,
            on_am_allocated,
        )
        .transition_with(&[S::AllocatedSaving], S::Allocated, T::AttemptNewSaved, on_new_saved)
        .transition_with(&[S::Allocated], S::Launched, T::Launched, on_launched)
        .transition_with(&[S::Launched], S::Running, T::Registered, on_registered)
        .transition_with(&[S::Running], S::Running, T::ContainerAllocated, on_container_allocated)
        .transition_with(&[S::Running], S::Running, T::StatusUpdate, on_status_update)
        .transition_with(&[S::Running], S::FinalSaving, T::Unregistered, on_unregistered)
        .choice(
            &[S::Allocated],
            T::ContainerFinished,
            &[S::Allocated, S::FinalSaving],
            finished_while_allocated,
        )
        .choice(
            &[S::Launched],
            T::ContainerFinished,
            &[S::Launched, S::FinalSaving],
            finished_while_launched,
        )
        .choice(
            &[S::Running],
            T::ContainerFinished,
            &[S::Running, S::FinalSaving],
            finished_while_running,
        )
        .transition_with(
            &[S::FinalSaving],
            S::FinalSaving,
            T::ContainerFinished,
            finished_while_saving,
        )
        .choice(
            &[S::FinalSaving],
            T::AttemptUpdateSaved,
            &[S::Finishing, S::Finished, S::Failed, S::Killed],
            on_update_saved,
        )
        .choice(
            &[S::Finishing],
            T::ContainerFinished,
            &[S::Finishing, S::Finished],
            finished_while_finishing,
        )
        .transition(&[S::Finishing], S::Finished, T::Expire)
        .transition_with(
            &[S::Scheduled, S::Launched, S::Running],
            S::Failed,
            T::Expire,
            on_expire,
        )
        .transition_with(NON_TERMINAL, S::Killed, T::Kill, on_kill);

    for state in [
        S::Scheduled,
        S::AllocatedSaving,
        S::Allocated,
        S::Launched,
        S::Running,
    ] {
        builder = builder.transition_with(&[state], state, T::PreemptContainer, on_preempt);
    }
    for state in [
        S::AllocatedSaving,
        S::Allocated,
        S::Launched,
        S::FinalSaving,
        S::Finishing,
    ] {
        builder = builder.transition_with(&[state], state, T::ContainerAllocated, reject_allocation);
    }

    builder
        .ignore(&[S::FinalSaving, S::Finishing], &[T::StatusUpdate, T::PreemptContainer])
        .ignore(&[S::FinalSaving], &[T::Expire])
        .build()
});

/// What an attempt is created with.
#[derive(Debug, Clone)]
pub struct AttemptSpec {
    pub attempt_id: AttemptId,
    pub queue: String,
    pub submitted_seq: u64,
    pub am_resource: Resource,
    pub am_context: LaunchContext,
    /// Launch context for containers the AM asks for.
    pub container_context: LaunchContext,
}

struct AttemptOperand {
    spec: AttemptSpec,
    services: Services,
    diagnostics: Diagnostics,
    am_container: Option<ContainerId>,
    containers: BTreeSet<ContainerId>,
    host: Option<String>,
    rpc_port: Option<u16>,
    tracking_url: Option<String>,
    progress: f32,
    final_status: FinalStatus,
    /// Where FINAL_SAVING goes once the save completes.
    final_state: Option<AttemptState>,
    am_exited: bool,
    counts_toward_failures: bool,
    recovered: bool,
}

impl AttemptOperand {
    fn id(&self) -> AttemptId {
        self.spec.attempt_id
    }

    fn snapshot(&self, state: AttemptState) -> Snapshot {
        Snapshot::Attempt(AttemptSnapshot {
            attempt_id: self.id(),
            state,
            final_state: self.final_state,
            am_container: self.am_container,
            host: self.host.clone(),
            rpc_port: self.rpc_port,
            tracking_url: self.tracking_url.clone(),
            final_status: self.final_status,
            diagnostics: self.diagnostics.to_vec(),
        })
    }

    /// Saves a FINAL_SAVING snapshot; the save completion drives the
    /// attempt on.
    fn save_final(&self) {
        self.services.persist(
            self.snapshot(S::FinalSaving),
            Some(EventPayload::Attempt(AttemptEvent::AttemptUpdateSaved)),
        );
    }

    fn kill_container(&self, container_id: ContainerId, exit_status: i32, diagnostics: String) {
        self.services.dispatcher.post_container(
            container_id,
            ContainerEvent::Kill {
                exit_status,
                diagnostics,
            },
        );
    }

    fn is_am(&self, status: &ContainerStatus) -> bool {
        self.am_container == Some(status.container_id)
    }
}

fn unexpected(event: &AttemptEvent) -> HookError {
    HookError::new(format!("unexpected payload {:?}", event.event_type()))
}

// =============================================================================
// Hooks
// =============================================================================

fn on_start(op: &mut AttemptOperand, _: &AttemptEvent) -> Result<(), HookError> {
    op.services
        .scheduler
        .attempt_added(op.id(), op.spec.queue.clone(), op.spec.submitted_seq);
    Ok(())
}

fn on_added(op: &mut AttemptOperand, _: &AttemptEvent) -> Result<(), HookError> {
    op.services.scheduler.am_ask(op.id(), op.spec.am_resource);
    Ok(())
}

fn on_am_allocated(op: &mut AttemptOperand, event: &AttemptEvent) -> Result<(), HookError> {
    let AttemptEvent::ContainerAllocated { allocation } = event else {
        return Err(unexpected(event));
    };
    if !allocation.is_am {
        return Err(HookError::new(format!(
            "container {} is not an application master container",
            allocation.container_id
        )));
    }

    op.am_container = Some(allocation.container_id);
    op.services.persist(
        op.snapshot(S::AllocatedSaving),
        Some(EventPayload::Attempt(AttemptEvent::AttemptNewSaved)),
    );
    Ok(())
}

fn on_new_saved(op: &mut AttemptOperand, _: &AttemptEvent) -> Result<(), HookError> {
    let container_id = op
        .am_container
        .ok_or_else(|| HookError::new("no application master container"))?;
    op.services.dispatcher.post_container(
        container_id,
        ContainerEvent::Request {
            context: op.spec.am_context.clone(),
        },
    );
    Ok(())
}

fn on_launched(op: &mut AttemptOperand, _: &AttemptEvent) -> Result<(), HookError> {
    op.services.am_monitor.register(op.id());
    Ok(())
}

fn on_registered(op: &mut AttemptOperand, event: &AttemptEvent) -> Result<(), HookError> {
    let AttemptEvent::Registered {
        host,
        rpc_port,
        tracking_url,
    } = event
    else {
        return Err(unexpected(event));
    };
    op.host = Some(host.clone());
    op.rpc_port = Some(*rpc_port);
    op.tracking_url = tracking_url.clone();
    op.services.am_monitor.ping(op.id());
    op.services.dispatcher.post_app(
        op.id().app_id(),
        AppEvent::AttemptRegistered {
            attempt_id: op.id(),
        },
    );
    Ok(())
}

fn on_container_allocated(op: &mut AttemptOperand, event: &AttemptEvent) -> Result<(), HookError> {
    let AttemptEvent::ContainerAllocated { allocation } = event else {
        return Err(unexpected(event));
    };
    op.containers.insert(allocation.container_id);
    op.services.dispatcher.post_container(
        allocation.container_id,
        ContainerEvent::Request {
            context: op.spec.container_context.clone(),
        },
    );
    Ok(())
}

/// Grants that arrive when the AM can no longer use them are handed back.
fn reject_allocation(op: &mut AttemptOperand, event: &AttemptEvent) -> Result<(), HookError> {
    let AttemptEvent::ContainerAllocated { allocation } = event else {
        return Err(unexpected(event));
    };
    op.kill_container(
        allocation.container_id,
        exit_status::KILLED_BY_RESOURCEMANAGER,
        "Container allocated to an attempt that cannot use it".to_string(),
    );
    Ok(())
}

fn on_status_update(op: &mut AttemptOperand, event: &AttemptEvent) -> Result<(), HookError> {
    if let AttemptEvent::StatusUpdate { progress } = event {
        op.progress = progress.clamp(0.0, 1.0);
    }
    op.services.am_monitor.ping(op.id());
    Ok(())
}

fn on_unregistered(op: &mut AttemptOperand, event: &AttemptEvent) -> Result<(), HookError> {
    let AttemptEvent::Unregistered {
        final_status,
        diagnostics,
        tracking_url,
    } = event
    else {
        return Err(unexpected(event));
    };
    op.final_state = Some(S::Finishing);
    op.final_status = *final_status;
    op.diagnostics.push(diagnostics.as_str());
    if tracking_url.is_some() {
        op.tracking_url = tracking_url.clone();
    }
    op.progress = 1.0;
    op.save_final();
    Ok(())
}

/// A container finished while the attempt was in `stay`. The AM's exit
/// fails the attempt; a worker's exit only updates bookkeeping.
fn container_finished(
    op: &mut AttemptOperand,
    event: &AttemptEvent,
    stay: AttemptState,
) -> Result<AttemptState, HookError> {
    let AttemptEvent::ContainerFinished { status } = event else {
        return Err(unexpected(event));
    };

    if !op.is_am(status) {
        op.containers.remove(&status.container_id);
        return Ok(stay);
    }

    op.am_exited = true;
    op.final_state = Some(S::Failed);
    op.counts_toward_failures = !exit_status::is_external(status.exit_status);
    op.diagnostics.push(format!(
        "AM container {} exited with exit status {}",
        status.container_id, status.exit_status
    ));
    op.diagnostics.push(status.diagnostics.as_str());
    op.save_final();
    Ok(S::FinalSaving)
}

fn finished_while_allocated(op: &mut AttemptOperand, event: &AttemptEvent) -> Result<AttemptState, HookError> {
    container_finished(op, event, S::Allocated)
}

fn finished_while_launched(op: &mut AttemptOperand, event: &AttemptEvent) -> Result<AttemptState, HookError> {
    container_finished(op, event, S::Launched)
}

fn finished_while_running(op: &mut AttemptOperand, event: &AttemptEvent) -> Result<AttemptState, HookError> {
    container_finished(op, event, S::Running)
}

fn finished_while_saving(op: &mut AttemptOperand, event: &AttemptEvent) -> Result<(), HookError> {
    let AttemptEvent::ContainerFinished { status } = event else {
        return Err(unexpected(event));
    };
    if op.is_am(status) {
        op.am_exited = true;
    } else {
        op.containers.remove(&status.container_id);
    }
    Ok(())
}

fn finished_while_finishing(op: &mut AttemptOperand, event: &AttemptEvent) -> Result<AttemptState, HookError> {
    let AttemptEvent::ContainerFinished { status } = event else {
        return Err(unexpected(event));
    };
    if op.is_am(status) {
        op.am_exited = true;
        return Ok(S::Finished);
    }
    op.containers.remove(&status.container_id);
    Ok(S::Finishing)
}

fn on_update_saved(op: &mut AttemptOperand, _: &AttemptEvent) -> Result<AttemptState, HookError> {
    match op.final_state {
        // The AM already exited while the save was in flight.
        Some(S::Finishing) if op.am_exited => Ok(S::Finished),
        Some(state) => Ok(state),
        None => Err(HookError::new("no final state recorded")),
    }
}

fn on_expire(op: &mut AttemptOperand, _: &AttemptEvent) -> Result<(), HookError> {
    op.final_state = Some(S::Failed);
    op.counts_toward_failures = true;
    op.diagnostics.push(format!(
        "ApplicationMaster for attempt {} timed out",
        op.id()
    ));
    Ok(())
}

fn on_kill(op: &mut AttemptOperand, event: &AttemptEvent) -> Result<(), HookError> {
    if let AttemptEvent::Kill { diagnostics } = event {
        op.diagnostics.push(diagnostics.as_str());
    }
    op.final_state = Some(S::Killed);
    op.counts_toward_failures = false;
    Ok(())
}

fn on_preempt(op: &mut AttemptOperand, event: &AttemptEvent) -> Result<(), HookError> {
    let AttemptEvent::PreemptContainer {
        container_id,
        grace,
    } = event
    else {
        return Err(unexpected(event));
    };
    let container_id = *container_id;
    let grace = *grace;

    let started = match op
        .services
        .dispatcher
        .board()
        .get_state(&EntityId::Container(container_id))
    {
        Some(EntityState::Container(state)) => state.has_started(),
        _ => false,
    };

    let diagnostics = "Container preempted by the scheduler".to_string();
    if !started || grace.is_zero() {
        debug!(attempt_id = %op.id(), container_id = %container_id, started, "Preempting container now");
        op.kill_container(container_id, exit_status::PREEMPTED, diagnostics);
        return Ok(());
    }

    debug!(attempt_id = %op.id(), container_id = %container_id, grace_ms = grace.as_millis() as u64, "Preempting container after grace");
    let dispatcher = op.services.dispatcher.clone();
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        dispatcher.post_container(
            container_id,
            ContainerEvent::Kill {
                exit_status: exit_status::PREEMPTED,
                diagnostics,
            },
        );
    });
    Ok(())
}

fn on_recover(op: &mut AttemptOperand, event: &AttemptEvent) -> Result<AttemptState, HookError> {
    let AttemptEvent::Recover { snapshot } = event else {
        return Err(unexpected(event));
    };
    if snapshot.attempt_id != op.id() {
        return Err(HookError::new(format!(
            "snapshot for {} applied to {}",
            snapshot.attempt_id,
            op.id()
        )));
    }

    op.recovered = true;
    op.am_container = snapshot.am_container;
    op.host = snapshot.host.clone();
    op.rpc_port = snapshot.rpc_port;
    op.tracking_url = snapshot.tracking_url.clone();
    op.final_status = snapshot.final_status;
    for entry in &snapshot.diagnostics {
        op.diagnostics.push(entry.as_str());
    }

    if snapshot.state.is_terminal() {
        op.final_state = Some(snapshot.state);
        return Ok(snapshot.state);
    }

    op.final_state = Some(S::Failed);
    op.counts_toward_failures = false;
    op.diagnostics.push(format!(
        "Attempt {} was {} when the resource manager restarted",
        op.id(),
        snapshot.state
    ));
    op.services.persist(op.snapshot(S::Failed), None);
    Ok(S::Failed)
}

// =============================================================================
// Controller
// =============================================================================

/// Drives one application attempt.
pub struct AttemptController {
    machine: StateMachine<AttemptState, AttemptEventType, AttemptOperand, AttemptEvent>,
    operand: AttemptOperand,
}

impl AttemptController {
    pub fn new(spec: AttemptSpec, services: Services) -> Self {
        let cap = services.settings.diagnostics_cap;
        Self {
            machine: StateMachine::new(&TABLE),
            operand: AttemptOperand {
                spec,
                services,
                diagnostics: Diagnostics::new(cap),
                am_container: None,
                containers: BTreeSet::new(),
                host: None,
                rpc_port: None,
                tracking_url: None,
                progress: 0.0,
                final_status: FinalStatus::Undefined,
                final_state: None,
                am_exited: false,
                counts_toward_failures: true,
                recovered: false,
            },
        }
    }

    pub fn state(&self) -> AttemptState {
        self.machine.current_state()
    }

    pub fn progress(&self) -> f32 {
        self.operand.progress
    }

    fn on_terminal(&mut self, state: AttemptState) {
        let op = &self.operand;
        let attempt_id = op.id();

        op.services.am_monitor.unregister(attempt_id);
        op.services.scheduler.attempt_removed(attempt_id);

        if op.recovered {
            debug!(attempt_id = %attempt_id, state = %state, "Recovered attempt");
            return;
        }

        let diagnostics = op.diagnostics.joined();
        let event = match state {
            S::Finished => AppEvent::AttemptFinished {
                attempt_id,
                final_status: op.final_status,
                diagnostics,
            },
            S::Failed => AppEvent::AttemptFailed {
                attempt_id,
                diagnostics,
                counts_toward_failures: op.counts_toward_failures,
            },
            S::Killed => AppEvent::AttemptKilled {
                attempt_id,
                diagnostics,
            },
            other => {
                warn!(attempt_id = %attempt_id, state = %other, "Not a terminal attempt state");
                return;
            }
        };

        info!(
            attempt_id = %attempt_id,
            state = %state,
            final_status = ?op.final_status,
            "Attempt completed"
        );

        op.services.dispatcher.post_app(attempt_id.app_id(), event);
        op.services.persist(op.snapshot(state), None);
    }
}

impl EntityController for AttemptController {
    fn entity_id(&self) -> EntityId {
        EntityId::Attempt(self.operand.id())
    }

    fn handle(&mut self, envelope: &EventEnvelope) -> Result<Outcome<EntityState>, ApplyError> {
        let EventPayload::Attempt(event) = &envelope.payload else {
            return Err(ApplyError::wrong_kind(self.entity_id(), &envelope.payload));
        };

        let outcome = self
            .machine
            .apply(&mut self.operand, event.event_type(), event)?;

        if let Outcome::Transitioned { from, to } = outcome {
            if to.is_terminal() && !from.is_terminal() {
                self.on_terminal(to);
            }
        }

        Ok(lift(outcome, EntityState::Attempt))
    }

    fn status(&self) -> EntityStatus {
        EntityStatus {
            state: EntityState::Attempt(self.state()),
            diagnostics: self.operand.diagnostics.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use rm_events::Allocation;
    use rm_id::{AppId, EventId, NodeId};
    use tokio::sync::mpsc;

    use crate::controller::test_services;
    use crate::dispatcher::ShardMessage;
    use crate::scheduler::SchedulerMessage;

    fn spec() -> AttemptSpec {
        AttemptSpec {
            attempt_id: AttemptId::new(AppId::new(), 1),
            queue: "default".to_string(),
            submitted_seq: 1,
            am_resource: Resource::new(1024, 1),
            am_context: LaunchContext::default(),
            container_context: LaunchContext::default(),
        }
    }

    fn apply(c: &mut AttemptController, event: AttemptEvent) -> Result<Outcome<EntityState>, ApplyError> {
        let id = c.operand.id();
        c.handle(&EventEnvelope::for_attempt(EventId::new(1), id, event))
    }

    fn allocation(c: &AttemptController, is_am: bool) -> Allocation {
        Allocation {
            container_id: ContainerId::new(),
            attempt_id: c.operand.id(),
            node_id: NodeId::new(),
            queue: "default".to_string(),
            resource: Resource::new(1024, 1),
            priority: if is_am { 0 } else { 1 },
            is_am,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ShardMessage>) -> Vec<EventPayload> {
        let mut payloads = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let ShardMessage::Deliver(envelope) = msg {
                payloads.push(envelope.payload);
            }
        }
        payloads
    }

    fn preemption_kills(rx: &mut mpsc::UnboundedReceiver<ShardMessage>) -> usize {
        drain(rx)
            .iter()
            .filter(|p| {
                matches!(
                    p,
                    EventPayload::Container(ContainerEvent::Kill {
                        exit_status: exit_status::PREEMPTED,
                        ..
                    })
                )
            })
            .count()
    }

    /// Drives a fresh attempt to RUNNING, returning its AM container.
    fn run(c: &mut AttemptController) -> ContainerId {
        apply(c, AttemptEvent::Start).unwrap();
        apply(c, AttemptEvent::AttemptAdded).unwrap();
        let am = allocation(c, true);
        let am_id = am.container_id;
        apply(c, AttemptEvent::ContainerAllocated { allocation: am }).unwrap();
        apply(c, AttemptEvent::AttemptNewSaved).unwrap();
        apply(c, AttemptEvent::Launched).unwrap();
        apply(
            c,
            AttemptEvent::Registered {
                host: "am-host".to_string(),
                rpc_port: 8030,
                tracking_url: None,
            },
        )
        .unwrap();
        assert_eq!(c.state(), AttemptState::Running);
        am_id
    }

    #[tokio::test]
    async fn test_submission_path() {
        let (services, mut shard_rx, mut scheduler_rx) = test_services();
        let mut c = AttemptController::new(spec(), services);

        apply(&mut c, AttemptEvent::Start).unwrap();
        assert_eq!(c.state(), AttemptState::Submitted);
        assert!(matches!(
            scheduler_rx.try_recv(),
            Ok(SchedulerMessage::AttemptAdded { .. })
        ));

        apply(&mut c, AttemptEvent::AttemptAdded).unwrap();
        assert_eq!(c.state(), AttemptState::Scheduled);
        assert!(matches!(
            scheduler_rx.try_recv(),
            Ok(SchedulerMessage::Ask { is_am: true, .. })
        ));

        let am = allocation(&c, true);
        let am_id = am.container_id;
        apply(&mut c, AttemptEvent::ContainerAllocated { allocation: am }).unwrap();
        assert_eq!(c.state(), AttemptState::AllocatedSaving);

        // the background save posts the completion back to the attempt
        let saved = tokio::time::timeout(Duration::from_secs(5), shard_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match saved {
            ShardMessage::Deliver(envelope) => assert_eq!(
                envelope.payload,
                EventPayload::Attempt(AttemptEvent::AttemptNewSaved)
            ),
            _ => panic!("expected a delivered event"),
        }

        apply(&mut c, AttemptEvent::AttemptNewSaved).unwrap();
        assert_eq!(c.state(), AttemptState::Allocated);
        let requested = drain(&mut shard_rx);
        assert!(matches!(
            requested.as_slice(),
            [EventPayload::Container(ContainerEvent::Request { .. })]
        ));
        assert_eq!(c.operand.am_container, Some(am_id));
    }

    #[tokio::test]
    async fn test_registered_while_new_is_invalid() {
        let (services, _shard_rx, _scheduler_rx) = test_services();
        let mut c = AttemptController::new(spec(), services);

        let err = apply(
            &mut c,
            AttemptEvent::Registered {
                host: "h".to_string(),
                rpc_port: 1,
                tracking_url: None,
            },
        )
        .unwrap_err();

        assert!(err.is_invalid_transition());
        assert_eq!(c.state(), AttemptState::New);
    }

    #[tokio::test]
    async fn test_am_exit_fails_through_final_saving() {
        let (services, mut shard_rx, _scheduler_rx) = test_services();
        let mut c = AttemptController::new(spec(), services);
        let am = run(&mut c);
        drain(&mut shard_rx);

        apply(
            &mut c,
            AttemptEvent::ContainerFinished {
                status: ContainerStatus {
                    container_id: am,
                    exit_status: 1,
                    diagnostics: "segfault".to_string(),
                },
            },
        )
        .unwrap();
        assert_eq!(c.state(), AttemptState::FinalSaving);

        apply(&mut c, AttemptEvent::AttemptUpdateSaved).unwrap();
        assert_eq!(c.state(), AttemptState::Failed);

        let app_events: Vec<_> = drain(&mut shard_rx)
            .into_iter()
            .filter_map(|p| match p {
                EventPayload::App(e) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(app_events.len(), 1);
        assert!(matches!(
            &app_events[0],
            AppEvent::AttemptFailed {
                counts_toward_failures: true,
                ..
            }
        ));
        assert!(c
            .status()
            .diagnostics
            .iter()
            .any(|d| d.contains("exited with exit status 1")));
    }

    #[tokio::test]
    async fn test_preempted_am_exit_does_not_count() {
        let (services, mut shard_rx, _scheduler_rx) = test_services();
        let mut c = AttemptController::new(spec(), services);
        let am = run(&mut c);

        apply(
            &mut c,
            AttemptEvent::ContainerFinished {
                status: ContainerStatus {
                    container_id: am,
                    exit_status: exit_status::ABORTED,
                    diagnostics: "node lost".to_string(),
                },
            },
        )
        .unwrap();
        apply(&mut c, AttemptEvent::AttemptUpdateSaved).unwrap();

        let failed = drain(&mut shard_rx).into_iter().any(|p| {
            matches!(
                p,
                EventPayload::App(AppEvent::AttemptFailed {
                    counts_toward_failures: false,
                    ..
                })
            )
        });
        assert!(failed);
    }

    #[tokio::test]
    async fn test_unregister_then_am_exit_finishes() {
        let (services, mut shard_rx, mut scheduler_rx) = test_services();
        let mut c = AttemptController::new(spec(), services.clone());
        let am = run(&mut c);
        assert!(services.am_monitor.is_registered(c.operand.id()));

        apply(
            &mut c,
            AttemptEvent::Unregistered {
                final_status: FinalStatus::Succeeded,
                diagnostics: String::new(),
                tracking_url: Some("http://history".to_string()),
            },
        )
        .unwrap();
        assert_eq!(c.state(), AttemptState::FinalSaving);
        apply(&mut c, AttemptEvent::AttemptUpdateSaved).unwrap();
        assert_eq!(c.state(), AttemptState::Finishing);

        apply(
            &mut c,
            AttemptEvent::ContainerFinished {
                status: ContainerStatus {
                    container_id: am,
                    exit_status: 0,
                    diagnostics: String::new(),
                },
            },
        )
        .unwrap();
        assert_eq!(c.state(), AttemptState::Finished);
        assert!(!services.am_monitor.is_registered(c.operand.id()));
        assert_eq!(c.progress(), 1.0);

        let mut removed = false;
        while let Ok(msg) = scheduler_rx.try_recv() {
            removed |= matches!(msg, SchedulerMessage::AttemptRemoved { .. });
        }
        assert!(removed);

        let finished = drain(&mut shard_rx).into_iter().any(|p| {
            matches!(
                p,
                EventPayload::App(AppEvent::AttemptFinished {
                    final_status: FinalStatus::Succeeded,
                    ..
                })
            )
        });
        assert!(finished);
    }

    #[tokio::test]
    async fn test_worker_exit_keeps_running() {
        let (services, mut shard_rx, _scheduler_rx) = test_services();
        let mut c = AttemptController::new(spec(), services);
        run(&mut c);
        drain(&mut shard_rx);

        let worker = allocation(&c, false);
        let worker_id = worker.container_id;
        apply(&mut c, AttemptEvent::ContainerAllocated { allocation: worker }).unwrap();
        assert!(matches!(
            drain(&mut shard_rx).as_slice(),
            [EventPayload::Container(ContainerEvent::Request { .. })]
        ));

        apply(
            &mut c,
            AttemptEvent::ContainerFinished {
                status: ContainerStatus {
                    container_id: worker_id,
                    exit_status: 1,
                    diagnostics: String::new(),
                },
            },
        )
        .unwrap();
        assert_eq!(c.state(), AttemptState::Running);
        assert!(c.operand.containers.is_empty());
    }

    #[tokio::test]
    async fn test_expire_fails_running_attempt() {
        let (services, _shard_rx, _scheduler_rx) = test_services();
        let mut c = AttemptController::new(spec(), services);
        run(&mut c);

        apply(&mut c, AttemptEvent::Expire).unwrap();
        assert_eq!(c.state(), AttemptState::Failed);
        assert!(c.status().diagnostics[0].contains("timed out"));
    }

    #[tokio::test]
    async fn test_kill_is_absorbed_once_terminal() {
        let (services, _shard_rx, _scheduler_rx) = test_services();
        let mut c = AttemptController::new(spec(), services);
        apply(&mut c, AttemptEvent::Start).unwrap();

        let kill = AttemptEvent::Kill {
            diagnostics: "killed by user".to_string(),
        };
        apply(&mut c, kill.clone()).unwrap();
        assert_eq!(c.state(), AttemptState::Killed);
        assert!(matches!(apply(&mut c, kill).unwrap(), Outcome::Ignored { .. }));
        assert!(matches!(
            apply(&mut c, AttemptEvent::AttemptUpdateSaved).unwrap(),
            Outcome::Ignored { .. }
        ));
        assert!(apply(&mut c, AttemptEvent::Start).unwrap_err().is_invalid_transition());
    }

    #[tokio::test]
    async fn test_preempting_unstarted_container_kills_now() {
        let (services, mut shard_rx, _scheduler_rx) = test_services();
        let mut c = AttemptController::new(spec(), services);
        run(&mut c);
        drain(&mut shard_rx);

        let victim = ContainerId::new();
        apply(
            &mut c,
            AttemptEvent::PreemptContainer {
                container_id: victim,
                grace: Duration::from_secs(30),
            },
        )
        .unwrap();
        assert_eq!(c.state(), AttemptState::Running);
        assert_eq!(
            drain(&mut shard_rx),
            vec![EventPayload::Container(ContainerEvent::Kill {
                exit_status: exit_status::PREEMPTED,
                diagnostics: "Container preempted by the scheduler".to_string(),
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_preempting_running_container_waits_for_grace() {
        let (services, mut shard_rx, _scheduler_rx) = test_services();
        let victim = ContainerId::new();
        services.dispatcher.board().update(
            EntityId::Container(victim),
            EntityStatus {
                state: EntityState::Container(rm_events::ContainerState::Running),
                diagnostics: Vec::new(),
            },
        );
        let mut c = AttemptController::new(spec(), services);
        run(&mut c);
        drain(&mut shard_rx);

        apply(
            &mut c,
            AttemptEvent::PreemptContainer {
                container_id: victim,
                grace: Duration::from_secs(30),
            },
        )
        .unwrap();
        assert_eq!(preemption_kills(&mut shard_rx), 0);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(preemption_kills(&mut shard_rx), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(preemption_kills(&mut shard_rx), 1);
    }

    #[tokio::test]
    async fn test_recover_non_terminal_attempt_fails_without_counting() {
        let (services, mut shard_rx, _scheduler_rx) = test_services();
        let mut c = AttemptController::new(spec(), services);
        let snapshot = AttemptSnapshot {
            attempt_id: c.operand.id(),
            state: AttemptState::Running,
            final_state: None,
            am_container: None,
            host: Some("am-host".to_string()),
            rpc_port: Some(8030),
            tracking_url: None,
            final_status: FinalStatus::Undefined,
            diagnostics: Vec::new(),
        };

        apply(&mut c, AttemptEvent::Recover { snapshot }).unwrap();
        assert_eq!(c.state(), AttemptState::Failed);
        assert!(!c.operand.counts_toward_failures);
        // recovery tells nobody: the application recovers on its own
        assert!(drain(&mut shard_rx)
            .iter()
            .all(|p| p.kind() != rm_events::EntityKind::App));
    }
}
