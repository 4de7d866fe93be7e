//! Configuration for the resource manager.

use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::scheduler::{OrderingPolicy, VictimOrder};

/// A scheduling queue and its guaranteed share of cluster capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,

    /// Guaranteed share, as a percentage of cluster capacity.
    pub guaranteed_percent: u32,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, guaranteed_percent: u32) -> Self {
        Self {
            name: name.into(),
            guaranteed_percent,
        }
    }
}

/// Preemption settings.
#[derive(Debug, Clone)]
pub struct PreemptionConfig {
    /// Whether the scheduler reclaims containers for under-served queues.
    pub enabled: bool,

    /// How long a running victim may keep running before it is killed.
    /// Zero kills immediately.
    pub grace: Duration,

    /// Which victims go first.
    pub victim_order: VictimOrder,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            grace: Duration::ZERO,
            victim_order: VictimOrder::default(),
        }
    }
}

/// Resource manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of dispatcher shards.
    pub dispatcher_workers: usize,

    /// Period of the scheduler's allocation pass.
    pub scheduler_interval: Duration,

    /// An application master that has not pinged for this long is expired.
    pub am_expiry: Duration,

    /// A node that has not heartbeated for this long is removed.
    pub node_expiry: Duration,

    /// How often liveliness monitors look for expired entries.
    pub liveness_check_interval: Duration,

    /// Counted attempt failures an application tolerates.
    pub max_app_attempts: u32,

    /// Failures older than this no longer count. `None` counts forever.
    pub attempt_failures_validity: Option<Duration>,

    /// Order in which pending asks are served.
    pub ordering: OrderingPolicy,

    pub preemption: PreemptionConfig,

    /// Diagnostics kept per entity; the oldest are dropped beyond this.
    pub diagnostics_cap: usize,

    /// Terminal entities kept per dispatcher shard and on the status board.
    pub completed_retention: usize,

    /// Buffer of the outward notification bus.
    pub notification_capacity: usize,

    /// Scheduling queues. Guaranteed shares must not exceed 100% in total.
    pub queues: Vec<QueueConfig>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatcher_workers: 4,
            scheduler_interval: Duration::from_millis(100),
            am_expiry: Duration::from_secs(600),
            node_expiry: Duration::from_secs(600),
            liveness_check_interval: Duration::from_secs(1),
            max_app_attempts: 2,
            attempt_failures_validity: None,
            ordering: OrderingPolicy::default(),
            preemption: PreemptionConfig::default(),
            diagnostics_cap: 100,
            completed_retention: 1024,
            notification_capacity: 1024,
            queues: vec![QueueConfig::new("default", 100)],
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let dispatcher_workers =
            env_parse("RM_DISPATCHER_WORKERS")?.unwrap_or(defaults.dispatcher_workers);

        let scheduler_interval =
            env_millis("RM_SCHEDULER_INTERVAL_MS")?.unwrap_or(defaults.scheduler_interval);

        let am_expiry = env_millis("RM_AM_EXPIRY_MS")?.unwrap_or(defaults.am_expiry);

        let node_expiry = env_millis("RM_NODE_EXPIRY_MS")?.unwrap_or(defaults.node_expiry);

        let liveness_check_interval =
            env_millis("RM_LIVENESS_CHECK_INTERVAL_MS")?.unwrap_or(defaults.liveness_check_interval);

        let max_app_attempts =
            env_parse("RM_MAX_APP_ATTEMPTS")?.unwrap_or(defaults.max_app_attempts);

        // 0 or unset disables the window
        let attempt_failures_validity = env_millis("RM_ATTEMPT_FAILURES_VALIDITY_MS")?
            .filter(|d| !d.is_zero());

        let ordering = match std::env::var("RM_ORDERING_POLICY") {
            Ok(s) => s.parse()?,
            Err(_) => defaults.ordering,
        };

        let preemption = PreemptionConfig {
            enabled: env_parse("RM_PREEMPTION_ENABLED")?.unwrap_or(defaults.preemption.enabled),
            grace: env_millis("RM_PREEMPTION_GRACE_MS")?.unwrap_or(defaults.preemption.grace),
            victim_order: match std::env::var("RM_VICTIM_ORDER") {
                Ok(s) => s.parse()?,
                Err(_) => defaults.preemption.victim_order,
            },
        };

        let diagnostics_cap = env_parse("RM_DIAGNOSTICS_CAP")?.unwrap_or(defaults.diagnostics_cap);

        let completed_retention =
            env_parse("RM_COMPLETED_RETENTION")?.unwrap_or(defaults.completed_retention);

        let notification_capacity =
            env_parse("RM_NOTIFICATION_CAPACITY")?.unwrap_or(defaults.notification_capacity);

        let queues = match std::env::var("RM_QUEUES") {
            Ok(s) => parse_queues(&s)?,
            Err(_) => defaults.queues,
        };

        let log_level = std::env::var("RM_LOG_LEVEL").unwrap_or(defaults.log_level);

        let config = Self {
            dispatcher_workers,
            scheduler_interval,
            am_expiry,
            node_expiry,
            liveness_check_interval,
            max_app_attempts,
            attempt_failures_validity,
            ordering,
            preemption,
            diagnostics_cap,
            completed_retention,
            notification_capacity,
            queues,
            log_level,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher_workers == 0 {
            bail!("dispatcher_workers must be at least 1");
        }
        if self.max_app_attempts == 0 {
            bail!("max_app_attempts must be at least 1");
        }
        if self.queues.is_empty() {
            bail!("at least one queue must be configured");
        }

        let total: u32 = self.queues.iter().map(|q| q.guaranteed_percent).sum();
        if total > 100 {
            bail!("queue guarantees add up to {total}%, more than 100%");
        }

        for (i, q) in self.queues.iter().enumerate() {
            if self.queues[..i].iter().any(|other| other.name == q.name) {
                bail!("queue {} is configured twice", q.name);
            }
        }

        Ok(())
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.iter().any(|q| q.name == name)
    }
}

/// Parses `name=percent` pairs separated by commas, e.g. `prod=70,dev=30`.
pub fn parse_queues(s: &str) -> Result<Vec<QueueConfig>> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (name, pct) = part
                .split_once('=')
                .with_context(|| format!("queue entry {part:?} is not name=percent"))?;
            let guaranteed_percent = pct
                .trim()
                .parse()
                .with_context(|| format!("queue {name} has an invalid percentage"))?;
            Ok(QueueConfig::new(name.trim(), guaranteed_percent))
        })
        .collect()
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(s) => s
            .parse()
            .map(Some)
            .with_context(|| format!("{key} has an invalid value {s:?}")),
        Err(_) => Ok(None),
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}
