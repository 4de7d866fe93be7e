//! Application controller.
//!
//! ## State Machine
//!
//! ```text
//! new -> new_saving -> accepted -> running -> finished
//!                         ^  |        |
//!                         +--+--------+  attempt failed, budget left
//!                            |        |
//!                            +--------+--> failed | killed
//! ```
//!
//! The application owns its attempts' lifetimes: it creates attempt 1 once
//! its submission is saved and a new attempt after every failure the retry
//! budget allows.

use std::sync::LazyLock;

use rm_events::{
    AppEvent, AppEventType, AppSnapshot, AppState, AttemptEvent, EntityId, EntityState,
    EventEnvelope, EventPayload, FinalStatus, LaunchContext, Resource, Snapshot,
};
use rm_fsm::{HookError, Outcome, StateMachine, TransitionTable};
use rm_id::{AppId, AttemptId};
use tracing::{debug, info};

use super::{
    lift, ApplyError, AttemptController, AttemptSpec, Diagnostics, EntityController, EntityStatus,
    Services,
};
use crate::retry::FailureBudget;

use rm_events::AppEventType as T;
use rm_events::AppState as S;

type Table = TransitionTable<AppState, AppEventType, AppOperand, AppEvent>;

static TABLE: LazyLock<Table> = LazyLock::new(|| {
    Table::builder(S::New, &[S::Finished, S::Failed, S::Killed])
        .transition_with(&[S::New], S::NewSaving, T::Start, on_start)
        .choice(
            &[S::New],
            T::Recover,
            &[S::Accepted, S::Finished, S::Failed, S::Killed],
            on_recover,
        )
        .transition_with(&[S::NewSaving], S::Accepted, T::AppNewSaved, on_new_saved)
        .transition(&[S::Accepted], S::Running, T::AttemptRegistered)
        .choice(
            &[S::Accepted],
            T::AttemptFailed,
            &[S::Accepted, S::Failed],
            failed_while_accepted,
        )
        .choice(
            &[S::Running],
            T::AttemptFailed,
            &[S::Running, S::Accepted, S::Failed],
            failed_while_running,
        )
        .transition_with(
            &[S::Accepted, S::Running],
            S::Finished,
            T::AttemptFinished,
            on_attempt_finished,
        )
        .transition_with(
            &[S::Accepted, S::Running],
            S::Killed,
            T::AttemptKilled,
            on_attempt_killed,
        )
        .transition_with(
            &[S::New, S::NewSaving, S::Accepted, S::Running],
            S::Killed,
            T::Kill,
            on_kill,
        )
        .build()
});

/// What a client submits.
#[derive(Debug, Clone)]
pub struct AppSpec {
    pub name: String,
    pub queue: String,
    pub am_resource: Resource,
    pub am_context: LaunchContext,
    /// Launch context for containers the application master asks for.
    pub container_context: LaunchContext,
    /// Overrides the configured attempt limit.
    pub max_attempts: Option<u32>,
}

impl AppSpec {
    pub fn new(name: impl Into<String>, queue: impl Into<String>, am_resource: Resource) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            am_resource,
            am_context: LaunchContext::default(),
            container_context: LaunchContext::default(),
            max_attempts: None,
        }
    }
}

struct AppOperand {
    app_id: AppId,
    spec: AppSpec,
    submitted_seq: u64,
    max_attempts: u32,
    budget: FailureBudget,
    /// Attempts created so far; the latest is `attempts`.
    attempts: u32,
    current_attempt: Option<AttemptId>,
    final_status: FinalStatus,
    diagnostics: Diagnostics,
    services: Services,
    recovered: bool,
}

impl AppOperand {
    fn snapshot(&self, state: AppState) -> Snapshot {
        Snapshot::App(AppSnapshot {
            app_id: self.app_id,
            name: self.spec.name.clone(),
            queue: self.spec.queue.clone(),
            am_resource: self.spec.am_resource,
            am_context: self.spec.am_context.clone(),
            container_context: self.spec.container_context.clone(),
            max_attempts: self.max_attempts,
            submitted_seq: self.submitted_seq,
            state,
            attempts: self.attempts,
            final_status: self.final_status,
            diagnostics: self.diagnostics.to_vec(),
        })
    }

    /// Creates the next attempt and starts it.
    fn start_attempt(&mut self) {
        self.attempts += 1;
        let attempt_id = AttemptId::new(self.app_id, self.attempts);
        let spec = AttemptSpec {
            attempt_id,
            queue: self.spec.queue.clone(),
            submitted_seq: self.submitted_seq,
            am_resource: self.spec.am_resource,
            am_context: self.spec.am_context.clone(),
            container_context: self.spec.container_context.clone(),
        };

        info!(app_id = %self.app_id, attempt_id = %attempt_id, "Starting attempt");

        let dispatcher = &self.services.dispatcher;
        dispatcher.register(Box::new(AttemptController::new(spec, self.services.clone())));
        dispatcher.post_attempt(attempt_id, AttemptEvent::Start);
        self.current_attempt = Some(attempt_id);
    }

    fn is_current(&self, attempt_id: AttemptId) -> bool {
        self.current_attempt == Some(attempt_id)
    }
}

fn unexpected(event: &AppEvent) -> HookError {
    HookError::new(format!("unexpected payload {:?}", event.event_type()))
}

fn on_start(op: &mut AppOperand, _: &AppEvent) -> Result<(), HookError> {
    op.services.persist(
        op.snapshot(S::NewSaving),
        Some(EventPayload::App(AppEvent::AppNewSaved)),
    );
    Ok(())
}

fn on_new_saved(op: &mut AppOperand, _: &AppEvent) -> Result<(), HookError> {
    op.start_attempt();
    Ok(())
}

fn attempt_failed(op: &mut AppOperand, event: &AppEvent, stay: AppState) -> Result<AppState, HookError> {
    let AppEvent::AttemptFailed {
        attempt_id,
        diagnostics,
        counts_toward_failures,
    } = event
    else {
        return Err(unexpected(event));
    };

    if !op.is_current(*attempt_id) {
        debug!(app_id = %op.app_id, attempt_id = %attempt_id, "Failure of a previous attempt ignored");
        return Ok(stay);
    }

    op.diagnostics.push(format!("Attempt {attempt_id} failed"));
    op.diagnostics.push(diagnostics.as_str());

    if *counts_toward_failures && op.budget.record_failure() {
        op.diagnostics.push(format!(
            "Application {} failed {} times due to AM failures; failing the application",
            op.app_id,
            op.budget.count()
        ));
        op.final_status = FinalStatus::Failed;
        return Ok(S::Failed);
    }

    op.start_attempt();
    op.services.persist(op.snapshot(S::Accepted), None);
    Ok(S::Accepted)
}

fn failed_while_accepted(op: &mut AppOperand, event: &AppEvent) -> Result<AppState, HookError> {
    attempt_failed(op, event, S::Accepted)
}

fn failed_while_running(op: &mut AppOperand, event: &AppEvent) -> Result<AppState, HookError> {
    attempt_failed(op, event, S::Running)
}

fn on_attempt_finished(op: &mut AppOperand, event: &AppEvent) -> Result<(), HookError> {
    let AppEvent::AttemptFinished {
        final_status,
        diagnostics,
        ..
    } = event
    else {
        return Err(unexpected(event));
    };
    op.final_status = *final_status;
    op.diagnostics.push(diagnostics.as_str());
    Ok(())
}

fn on_attempt_killed(op: &mut AppOperand, event: &AppEvent) -> Result<(), HookError> {
    if let AppEvent::AttemptKilled { diagnostics, .. } = event {
        op.diagnostics.push(diagnostics.as_str());
    }
    op.final_status = FinalStatus::Killed;
    Ok(())
}

fn on_kill(op: &mut AppOperand, event: &AppEvent) -> Result<(), HookError> {
    let AppEvent::Kill { diagnostics } = event else {
        return Err(unexpected(event));
    };
    op.diagnostics.push(diagnostics.as_str());
    op.final_status = FinalStatus::Killed;

    if let Some(attempt_id) = op.current_attempt {
        op.services.dispatcher.post_attempt(
            attempt_id,
            AttemptEvent::Kill {
                diagnostics: diagnostics.clone(),
            },
        );
    }
    Ok(())
}

fn on_recover(op: &mut AppOperand, event: &AppEvent) -> Result<AppState, HookError> {
    let AppEvent::Recover { snapshot } = event else {
        return Err(unexpected(event));
    };
    if snapshot.app_id != op.app_id {
        return Err(HookError::new(format!(
            "snapshot for {} applied to {}",
            snapshot.app_id, op.app_id
        )));
    }

    op.recovered = true;
    op.attempts = snapshot.attempts;
    op.final_status = snapshot.final_status;
    for entry in &snapshot.diagnostics {
        op.diagnostics.push(entry.as_str());
    }

    if snapshot.state.is_terminal() {
        return Ok(snapshot.state);
    }

    op.start_attempt();
    Ok(S::Accepted)
}

// =============================================================================
// Controller
// =============================================================================

/// Drives one application.
pub struct AppController {
    machine: StateMachine<AppState, AppEventType, AppOperand, AppEvent>,
    operand: AppOperand,
}

impl AppController {
    pub fn new(
        app_id: AppId,
        spec: AppSpec,
        submitted_seq: u64,
        default_max_attempts: u32,
        services: Services,
    ) -> Self {
        let max_attempts = spec.max_attempts.unwrap_or(default_max_attempts).max(1);
        let settings = &services.settings;
        let budget = FailureBudget::new(max_attempts, settings.attempt_failures_validity);
        let diagnostics = Diagnostics::new(settings.diagnostics_cap);

        Self {
            machine: StateMachine::new(&TABLE),
            operand: AppOperand {
                app_id,
                spec,
                submitted_seq,
                max_attempts,
                budget,
                attempts: 0,
                current_attempt: None,
                final_status: FinalStatus::Undefined,
                diagnostics,
                services,
                recovered: false,
            },
        }
    }

    /// A controller to receive `RECOVER` with `snapshot`.
    pub fn from_snapshot(snapshot: &AppSnapshot, services: Services) -> Self {
        let spec = AppSpec {
            name: snapshot.name.clone(),
            queue: snapshot.queue.clone(),
            am_resource: snapshot.am_resource,
            am_context: snapshot.am_context.clone(),
            container_context: snapshot.container_context.clone(),
            max_attempts: Some(snapshot.max_attempts),
        };
        Self::new(
            snapshot.app_id,
            spec,
            snapshot.submitted_seq,
            snapshot.max_attempts,
            services,
        )
    }

    pub fn state(&self) -> AppState {
        self.machine.current_state()
    }

    pub fn current_attempt(&self) -> Option<AttemptId> {
        self.operand.current_attempt
    }

    fn on_terminal(&self, from: AppState, to: AppState) {
        let op = &self.operand;
        info!(
            app_id = %op.app_id,
            state = %to,
            final_status = ?op.final_status,
            attempts = op.attempts,
            "Application completed"
        );
        // A terminal snapshot restored as is is already in the store.
        if !(op.recovered && from == S::New) {
            op.services.persist(op.snapshot(to), None);
        }
    }
}

impl EntityController for AppController {
    fn entity_id(&self) -> EntityId {
        EntityId::App(self.operand.app_id)
    }

    fn handle(&mut self, envelope: &EventEnvelope) -> Result<Outcome<EntityState>, ApplyError> {
        let EventPayload::App(event) = &envelope.payload else {
            return Err(ApplyError::wrong_kind(self.entity_id(), &envelope.payload));
        };

        let outcome = self
            .machine
            .apply(&mut self.operand, event.event_type(), event)?;

        if let Outcome::Transitioned { from, to } = outcome {
            if to.is_terminal() && !from.is_terminal() {
                self.on_terminal(from, to);
            }
        }

        Ok(lift(outcome, EntityState::App))
    }

    fn status(&self) -> EntityStatus {
        EntityStatus {
            state: EntityState::App(self.state()),
            diagnostics: self.operand.diagnostics.to_vec(),
        }
    }
}
