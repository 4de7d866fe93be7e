//! Container launcher interface and simulated implementation.
//!
//! The launcher stages a container's resources, runs it and tears it down.
//! Every call returns immediately; progress comes back as container events
//! (`LOCALIZED`, `LOCALIZATION_FAILED`, `EXITED`, `CLEANED_UP`).

use std::sync::Mutex;

use rm_events::{ContainerEvent, LaunchContext, Resource};
use rm_id::{AttemptId, ContainerId, NodeId};
use tracing::{debug, info};

use crate::dispatcher::DispatcherHandle;

/// Everything needed to start a container on its node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub container_id: ContainerId,
    pub attempt_id: AttemptId,
    pub node_id: NodeId,
    pub resource: Resource,
    pub context: LaunchContext,
}

/// Container process lifecycle collaborator.
pub trait ContainerLauncher: Send + Sync {
    /// Stage resources and start the container.
    fn localize(&self, request: ResourceRequest);

    /// Stop a localizing or running container.
    fn stop(&self, container_id: ContainerId);

    /// Remove what the container left behind on its node.
    fn cleanup(&self, container_id: ContainerId);
}

/// Exit code reported for a container stopped by a signal.
pub const SIGTERM_EXIT_CODE: i32 = 143;

/// Launcher that never touches a node.
///
/// Localization succeeds at once unless the launcher is manual, in which
/// case containers stay in LOCALIZING until the caller posts the outcome.
/// Stops report `SIGTERM_EXIT_CODE` followed by a cleanup.
pub struct SimulatedLauncher {
    dispatcher: DispatcherHandle,
    auto_localize: bool,
    requests: Mutex<Vec<ResourceRequest>>,
}

impl SimulatedLauncher {
    pub fn new(dispatcher: DispatcherHandle) -> Self {
        Self {
            dispatcher,
            auto_localize: true,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A launcher that leaves containers localizing.
    pub fn manual(dispatcher: DispatcherHandle) -> Self {
        Self {
            auto_localize: false,
            ..Self::new(dispatcher)
        }
    }

    /// Every localization request seen so far.
    pub fn requests(&self) -> Vec<ResourceRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ContainerLauncher for SimulatedLauncher {
    fn localize(&self, request: ResourceRequest) {
        info!(
            container_id = %request.container_id,
            node_id = %request.node_id,
            memory_mb = request.resource.memory_mb,
            vcores = request.resource.vcores,
            "[SIM] Localizing container"
        );

        let container_id = request.container_id;
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        if self.auto_localize {
            self.dispatcher
                .post_container(container_id, ContainerEvent::Localized);
        }
    }

    fn stop(&self, container_id: ContainerId) {
        info!(container_id = %container_id, "[SIM] Stopping container");
        self.dispatcher.post_container(
            container_id,
            ContainerEvent::Exited {
                exit_code: SIGTERM_EXIT_CODE,
                diagnostics: "Container killed on request".to_string(),
            },
        );
        self.dispatcher
            .post_container(container_id, ContainerEvent::CleanedUp);
    }

    fn cleanup(&self, container_id: ContainerId) {
        debug!(container_id = %container_id, "[SIM] Cleaning up container");
        self.dispatcher
            .post_container(container_id, ContainerEvent::CleanedUp);
    }
}
