//! Resource manager facade.
//!
//! [`ResourceManager`] wires the dispatcher, the scheduler worker and the
//! liveliness monitors together and exposes the calls clients, node
//! managers and application masters make. It stands in for the RPC layer:
//! every call either posts an event or goes through the scheduler inbox.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rm_events::{
    AppEvent, AppSnapshot, AttemptEvent, AttemptSnapshot, ContainerEvent, ContainerNotification,
    EntityId, EntityState, FinalStatus, Resource, Snapshot,
};
use rm_id::{AppId, AttemptId, ContainerId, NodeId};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::controller::{
    AppController, AppSpec, AttemptController, AttemptSpec, ControllerSettings, SaveQueue,
    Services,
};
use crate::dispatcher::{DispatchError, Dispatcher, DispatcherHandle};
use crate::launcher::{ContainerLauncher, SimulatedLauncher};
use crate::monitor::LivelinessMonitor;
use crate::notify::NotificationBus;
use crate::scheduler::{
    HeartbeatError, Ledger, LedgerError, ResourceAsk, Scheduler, SchedulerHandle, SchedulerSettings,
    SchedulerStopped, SchedulerWorker,
};
use crate::store::{BackoffPolicy, MemoryStateStore, RetryingStore, StateStore, StoreError};

/// Errors returned by [`ResourceManager`] calls.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unknown queue {0:?}")]
    UnknownQueue(String),

    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Heartbeat(#[from] HeartbeatError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerStopped),
}

/// The orchestration core, running.
pub struct ResourceManager {
    config: Config,
    dispatcher: Dispatcher,
    services: Services,
    node_monitor: LivelinessMonitor<NodeId>,
    next_submission: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ResourceManager {
    /// Starts with an in-memory store and a simulated launcher.
    pub fn start(config: Config) -> Self {
        let store = RetryingStore::new(MemoryStateStore::new(), BackoffPolicy::default());
        Self::start_with(config, Arc::new(store), |dispatcher| {
            Arc::new(SimulatedLauncher::new(dispatcher))
        })
    }

    /// Starts with the given store and a launcher built on the dispatcher
    /// its events go back through.
    pub fn start_with<F>(config: Config, store: Arc<dyn StateStore>, make_launcher: F) -> Self
    where
        F: FnOnce(DispatcherHandle) -> Arc<dyn ContainerLauncher>,
    {
        let dispatcher = Dispatcher::start(config.dispatcher_workers, config.completed_retention);
        let handle = dispatcher.handle();
        let (scheduler, scheduler_rx) = SchedulerHandle::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let services = Services {
            launcher: make_launcher(handle.clone()),
            dispatcher: handle,
            scheduler,
            store,
            notifications: NotificationBus::new(config.notification_capacity),
            am_monitor: LivelinessMonitor::new("am", config.am_expiry),
            settings: Arc::new(ControllerSettings {
                diagnostics_cap: config.diagnostics_cap,
                attempt_failures_validity: config.attempt_failures_validity,
            }),
            saves: SaveQueue::new(),
        };
        let node_monitor = LivelinessMonitor::new("node", config.node_expiry);

        let mut tasks = Vec::new();

        let worker = SchedulerWorker::new(
            Scheduler::new(&config.queues, SchedulerSettings::from(&config)),
            scheduler_rx,
            config.scheduler_interval,
            services.clone(),
        );
        tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));

        let dispatcher_handle = services.dispatcher.clone();
        tasks.push(tokio::spawn(services.am_monitor.clone().run(
            config.liveness_check_interval,
            move |attempt_id: AttemptId| {
                warn!(attempt_id = %attempt_id, "Application master expired");
                dispatcher_handle.post_attempt(attempt_id, AttemptEvent::Expire);
            },
            shutdown_rx.clone(),
        )));

        let scheduler = services.scheduler.clone();
        tasks.push(tokio::spawn(node_monitor.clone().run(
            config.liveness_check_interval,
            move |node_id: NodeId| {
                warn!(node_id = %node_id, "Node expired");
                scheduler.remove_node(node_id, "node expired");
            },
            shutdown_rx,
        )));

        info!(
            queues = config.queues.len(),
            ordering = ?config.ordering,
            preemption = config.preemption.enabled,
            "Resource manager started"
        );

        Self {
            config,
            dispatcher,
            services,
            node_monitor,
            next_submission: AtomicU64::new(0),
            shutdown_tx,
            tasks,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.services.dispatcher
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub async fn register_node(&self, node_id: NodeId, capacity: Resource) -> Result<(), ManagerError> {
        self.services.scheduler.add_node(node_id, capacity).await??;
        self.node_monitor.register(node_id);
        Ok(())
    }

    /// Accepts a node heartbeat. Sequence numbers must not go backwards.
    pub async fn node_heartbeat(&self, node_id: NodeId, seq: u64) -> Result<(), ManagerError> {
        self.services.scheduler.heartbeat(node_id, seq).await??;
        self.node_monitor.ping(node_id);
        Ok(())
    }

    /// Takes a node out of service, killing what runs on it.
    pub fn decommission_node(&self, node_id: NodeId) {
        self.node_monitor.unregister(node_id);
        self.services.scheduler.remove_node(node_id, "node decommissioned");
    }

    /// A node reports that a container's process exited.
    pub fn report_container_exit(&self, container_id: ContainerId, exit_code: i32, diagnostics: impl Into<String>) {
        self.services.dispatcher.post_container(
            container_id,
            ContainerEvent::Exited {
                exit_code,
                diagnostics: diagnostics.into(),
            },
        );
    }

    // =========================================================================
    // Clients
    // =========================================================================

    pub fn submit_application(&self, spec: AppSpec) -> Result<AppId, ManagerError> {
        if !self.config.has_queue(&spec.queue) {
            return Err(ManagerError::UnknownQueue(spec.queue));
        }

        let app_id = AppId::new();
        let seq = self.next_submission.fetch_add(1, Ordering::SeqCst) + 1;
        info!(app_id = %app_id, name = %spec.name, queue = %spec.queue, "Application submitted");

        let controller = AppController::new(
            app_id,
            spec,
            seq,
            self.config.max_app_attempts,
            self.services.clone(),
        );
        self.services.dispatcher.register(Box::new(controller));
        self.services.dispatcher.post_app(app_id, AppEvent::Start);
        Ok(app_id)
    }

    pub fn kill_application(&self, app_id: AppId) -> Result<(), ManagerError> {
        self.require(app_id.into())?;
        self.services.dispatcher.post_app(
            app_id,
            AppEvent::Kill {
                diagnostics: "Application killed by user".to_string(),
            },
        );
        Ok(())
    }

    // =========================================================================
    // Application Masters
    // =========================================================================

    pub fn register_application_master(
        &self,
        attempt_id: AttemptId,
        host: impl Into<String>,
        rpc_port: u16,
        tracking_url: Option<String>,
    ) -> Result<(), ManagerError> {
        self.require(attempt_id.into())?;
        self.services.dispatcher.post_attempt(
            attempt_id,
            AttemptEvent::Registered {
                host: host.into(),
                rpc_port,
                tracking_url,
            },
        );
        Ok(())
    }

    /// The AM's heartbeat: reports progress and adds container asks.
    pub fn allocate(
        &self,
        attempt_id: AttemptId,
        asks: Vec<ResourceAsk>,
        progress: f32,
    ) -> Result<(), ManagerError> {
        self.require(attempt_id.into())?;
        self.services
            .dispatcher
            .post_attempt(attempt_id, AttemptEvent::StatusUpdate { progress });
        self.services.scheduler.ask(attempt_id, asks);
        Ok(())
    }

    pub fn unregister_application_master(
        &self,
        attempt_id: AttemptId,
        final_status: FinalStatus,
        diagnostics: impl Into<String>,
        tracking_url: Option<String>,
    ) -> Result<(), ManagerError> {
        self.require(attempt_id.into())?;
        self.services.dispatcher.post_attempt(
            attempt_id,
            AttemptEvent::Unregistered {
                final_status,
                diagnostics: diagnostics.into(),
                tracking_url,
            },
        );
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_state(&self, entity: impl Into<EntityId>) -> Option<EntityState> {
        self.services.dispatcher.board().get_state(&entity.into())
    }

    pub fn get_diagnostics(&self, entity: impl Into<EntityId>) -> Option<Vec<String>> {
        self.services.dispatcher.board().get_diagnostics(&entity.into())
    }

    pub async fn ledger_snapshot(&self) -> Result<Ledger, ManagerError> {
        Ok(self.services.scheduler.snapshot().await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContainerNotification> {
        self.services.notifications.subscribe()
    }

    /// Waits until every event posted so far has been applied.
    pub async fn flush(&self) {
        self.services.dispatcher.flush().await;
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Recreates applications and attempts from the store. Returns the
    /// number of applications recovered.
    pub async fn recover(&self) -> Result<usize, ManagerError> {
        let snapshots = self.services.store.load().await?;

        let mut apps: BTreeMap<AppId, AppSnapshot> = BTreeMap::new();
        let mut attempts: Vec<AttemptSnapshot> = Vec::new();
        for snapshot in snapshots {
            match snapshot {
                Snapshot::App(app) => {
                    apps.insert(app.app_id, app);
                }
                Snapshot::Attempt(attempt) => attempts.push(attempt),
            }
        }

        for attempt in attempts {
            let Some(app) = apps.get_mut(&attempt.attempt_id.app_id()) else {
                warn!(attempt_id = %attempt.attempt_id, "Attempt without an application, skipping");
                continue;
            };
            // the application's own snapshot may predate its later attempts
            app.attempts = app.attempts.max(attempt.attempt_id.attempt());

            let spec = AttemptSpec {
                attempt_id: attempt.attempt_id,
                queue: app.queue.clone(),
                submitted_seq: app.submitted_seq,
                am_resource: app.am_resource,
                am_context: app.am_context.clone(),
                container_context: app.container_context.clone(),
            };
            let attempt_id = attempt.attempt_id;
            self.services
                .dispatcher
                .register(Box::new(AttemptController::new(spec, self.services.clone())));
            self.services
                .dispatcher
                .post_attempt(attempt_id, AttemptEvent::Recover { snapshot: attempt });
        }

        let recovered = apps.len();
        for (app_id, app) in apps {
            self.next_submission
                .fetch_max(app.submitted_seq, Ordering::SeqCst);
            self.services
                .dispatcher
                .register(Box::new(AppController::from_snapshot(&app, self.services.clone())));
            self.services
                .dispatcher
                .post_app(app_id, AppEvent::Recover { snapshot: app });
        }

        info!(applications = recovered, "Recovery complete");
        Ok(recovered)
    }

    /// Stops every task. Events already queued are applied first.
    pub async fn shutdown(self) {
        info!("Shutting down resource manager");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Resource manager task failed");
            }
        }
        self.dispatcher.shutdown().await;
    }

    fn require(&self, entity: EntityId) -> Result<(), ManagerError> {
        match self.services.dispatcher.board().get_state(&entity) {
            Some(_) => Ok(()),
            None => Err(ManagerError::UnknownEntity(entity)),
        }
    }
}
