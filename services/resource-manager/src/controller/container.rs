//! Container controller.

use std::sync::LazyLock;

use rm_events::{
    exit_status, Allocation, AttemptEvent, ContainerEvent, ContainerEventType, ContainerNotification,
    ContainerState, ContainerStatus, EntityId, EntityState, EventEnvelope, EventPayload,
};
use rm_fsm::{HookError, Outcome, StateMachine, TransitionTable};
use rm_id::ContainerId;
use tracing::{debug, info};

use super::{lift, ApplyError, Diagnostics, EntityController, EntityStatus, Services};
use crate::launcher::ResourceRequest;

use rm_events::ContainerEventType as T;
use rm_events::ContainerState as S;

type Table = TransitionTable<ContainerState, ContainerEventType, ContainerOperand, ContainerEvent>;

static TABLE: LazyLock<Table> = LazyLock::new(|| {
    Table::builder(S::New, &[S::Done])
        .transition_with(&[S::New], S::Localizing, T::Request, on_request)
        .transition_with(&[S::New], S::Done, T::Kill, on_kill)
        .transition_with(&[S::Localizing], S::Running, T::Localized, on_localized)
        .transition_with(
            &[S::Localizing],
            S::ExitedWithFailure,
            T::LocalizationFailed,
            on_localization_failed,
        )
        .choice(
            &[S::Running],
            T::Exited,
            &[S::ExitedWithSuccess, S::ExitedWithFailure],
            on_exited,
        )
        .transition_with(&[S::Localizing, S::Running], S::Killing, T::Kill, on_stop)
        .transition_with(&[S::Killing], S::Killing, T::Exited, on_killed_exit)
        .transition(
            &[S::ExitedWithSuccess, S::ExitedWithFailure, S::Killing],
            S::Done,
            T::CleanedUp,
        )
        // Exited containers are already being cleaned up; a late stop
        // request has nothing left to do.
        .ignore(&[S::ExitedWithSuccess, S::ExitedWithFailure, S::Killing], &[T::Kill])
        .ignore(&[S::Killing], &[T::Localized, T::LocalizationFailed])
        .build()
});

/// Everything a container knows about itself.
struct ContainerOperand {
    allocation: Allocation,
    services: Services,
    exit_code: Option<i32>,
    /// Exit status and reason of a kill, if one was requested.
    kill: Option<(i32, String)>,
    diagnostics: Diagnostics,
    released: bool,
}

impl ContainerOperand {
    fn id(&self) -> ContainerId {
        self.allocation.container_id
    }

    /// What the owning attempt is told once the container is done.
    fn final_status(&self) -> ContainerStatus {
        let exit_status = match &self.kill {
            Some((status, _)) => *status,
            None => self.exit_code.unwrap_or(exit_status::INVALID),
        };
        ContainerStatus {
            container_id: self.id(),
            exit_status,
            diagnostics: self.diagnostics.joined(),
        }
    }

    fn record_kill(&mut self, status: i32, diagnostics: &str) {
        self.kill = Some((status, diagnostics.to_string()));
        self.diagnostics.push(diagnostics);
    }
}

fn unexpected(event: &ContainerEvent) -> HookError {
    HookError::new(format!("unexpected payload {:?}", event.event_type()))
}

fn on_request(op: &mut ContainerOperand, event: &ContainerEvent) -> Result<(), HookError> {
    let ContainerEvent::Request { context } = event else {
        return Err(unexpected(event));
    };
    op.services.launcher.localize(ResourceRequest {
        container_id: op.id(),
        attempt_id: op.allocation.attempt_id,
        node_id: op.allocation.node_id,
        resource: op.allocation.resource,
        context: context.clone(),
    });
    Ok(())
}

fn on_kill(op: &mut ContainerOperand, event: &ContainerEvent) -> Result<(), HookError> {
    let ContainerEvent::Kill {
        exit_status,
        diagnostics,
    } = event
    else {
        return Err(unexpected(event));
    };
    op.record_kill(*exit_status, diagnostics);
    Ok(())
}

fn on_localized(op: &mut ContainerOperand, _: &ContainerEvent) -> Result<(), HookError> {
    op.services.scheduler.container_started(op.id());
    if op.allocation.is_am {
        op.services
            .dispatcher
            .post_attempt(op.allocation.attempt_id, AttemptEvent::Launched);
    }
    Ok(())
}

fn on_localization_failed(op: &mut ContainerOperand, event: &ContainerEvent) -> Result<(), HookError> {
    let ContainerEvent::LocalizationFailed { diagnostics } = event else {
        return Err(unexpected(event));
    };
    op.exit_code = Some(exit_status::INVALID);
    op.diagnostics.push(format!("Localization failed: {diagnostics}"));
    op.services.launcher.cleanup(op.id());
    Ok(())
}

fn on_exited(op: &mut ContainerOperand, event: &ContainerEvent) -> Result<ContainerState, HookError> {
    let ContainerEvent::Exited {
        exit_code,
        diagnostics,
    } = event
    else {
        return Err(unexpected(event));
    };
    op.exit_code = Some(*exit_code);
    op.diagnostics.push(diagnostics.as_str());
    op.services.launcher.cleanup(op.id());

    Ok(if *exit_code == exit_status::SUCCESS {
        S::ExitedWithSuccess
    } else {
        S::ExitedWithFailure
    })
}

fn on_stop(op: &mut ContainerOperand, event: &ContainerEvent) -> Result<(), HookError> {
    on_kill(op, event)?;
    op.services.launcher.stop(op.id());
    Ok(())
}

fn on_killed_exit(op: &mut ContainerOperand, event: &ContainerEvent) -> Result<(), HookError> {
    if let ContainerEvent::Exited { exit_code, .. } = event {
        op.exit_code = Some(*exit_code);
    }
    Ok(())
}

// =============================================================================
// Controller
// =============================================================================

/// Drives one granted container from localization to release.
pub struct ContainerController {
    machine: StateMachine<ContainerState, ContainerEventType, ContainerOperand, ContainerEvent>,
    operand: ContainerOperand,
}

impl ContainerController {
    pub fn new(allocation: Allocation, services: Services) -> Self {
        let cap = services.settings.diagnostics_cap;
        Self {
            machine: StateMachine::new(&TABLE),
            operand: ContainerOperand {
                allocation,
                services,
                exit_code: None,
                kill: None,
                diagnostics: Diagnostics::new(cap),
                released: false,
            },
        }
    }

    pub fn state(&self) -> ContainerState {
        self.machine.current_state()
    }

    /// Releases the container's resources and reports its completion.
    /// Runs at most once.
    fn release(&mut self) {
        let op = &mut self.operand;
        if op.released {
            return;
        }
        op.released = true;

        let status = op.final_status();
        let allocation = &op.allocation;
        info!(
            container_id = %allocation.container_id,
            attempt_id = %allocation.attempt_id,
            exit_status = status.exit_status,
            "Container done"
        );

        op.services.scheduler.container_released(allocation.container_id);

        let notification = match &op.kill {
            Some((exit_status, diagnostics)) => ContainerNotification::Killed {
                container_id: allocation.container_id,
                attempt_id: allocation.attempt_id,
                node_id: allocation.node_id,
                exit_status: *exit_status,
                diagnostics: diagnostics.clone(),
            },
            None => ContainerNotification::Exited {
                container_id: allocation.container_id,
                attempt_id: allocation.attempt_id,
                node_id: allocation.node_id,
                exit_code: status.exit_status,
                diagnostics: status.diagnostics.clone(),
            },
        };

        op.services.dispatcher.post_attempt(
            allocation.attempt_id,
            AttemptEvent::ContainerFinished { status },
        );
        op.services.notifications.publish(notification);
    }
}

impl EntityController for ContainerController {
    fn entity_id(&self) -> EntityId {
        EntityId::Container(self.operand.id())
    }

    fn handle(&mut self, envelope: &EventEnvelope) -> Result<Outcome<EntityState>, ApplyError> {
        let EventPayload::Container(event) = &envelope.payload else {
            return Err(ApplyError::wrong_kind(self.entity_id(), &envelope.payload));
        };

        let outcome = self
            .machine
            .apply(&mut self.operand, event.event_type(), event)?;

        if let Outcome::Transitioned { to: S::Done, .. } = outcome {
            self.release();
        } else {
            debug!(container_id = %self.operand.id(), state = %outcome.state(), "Container event applied");
        }

        Ok(lift(outcome, EntityState::Container))
    }

    fn status(&self) -> EntityStatus {
        EntityStatus {
            state: EntityState::Container(self.state()),
            diagnostics: self.operand.diagnostics.to_vec(),
        }
    }
}
