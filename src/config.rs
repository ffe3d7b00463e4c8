//! Engine-wide configuration, §6 "Configuration" table.

use std::time::Duration;

/// Load policy controlling local-vs-remote reads (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPolicy {
    LocalOnly,
    #[default]
    LocalThenRemote,
    RemoteFirst,
}

/// Save policy controlling local-vs-remote writes (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SavePolicy {
    #[default]
    LocalFirst,
    RemoteFirst,
}

/// Which of the three bounded task queues a [`crate::queue::request_queue::NetworkTask`]
/// runs on (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Foreground,
    Load,
    Background,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub foreground_queue_concurrency: usize,
    pub load_queue_concurrency: usize,
    pub background_queue_concurrency: usize,

    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_percent: f64,
    pub min_retry_delay: Duration,
    pub max_retry_attempts: u32,

    pub foreground_poll_interval: Duration,
    pub background_poll_interval: Duration,

    pub foreground_queue_capacity_timeout: Duration,
    pub load_queue_capacity_timeout: Duration,
    pub background_queue_capacity_timeout: Duration,
    pub queue_capacity_check_interval: Duration,

    pub max_foreground_queue_capacity: usize,
    pub max_load_queue_capacity: usize,
    pub max_background_queue_capacity: usize,

    pub maximum_network_timeout: Duration,
    pub id_negotiation_timeout: Duration,
    pub background_sync_timeout: Duration,

    pub default_save_policy: SavePolicy,
    pub default_load_policy: LoadPolicy,

    /// Open question §9: the "deadlock potential" threshold is a fixed 5 in
    /// the source; parameterized here rather than hard-coded.
    pub deadlock_pending_task_threshold: usize,

    /// Open question §9: max negotiation-conflict-resolver attempts.
    pub max_id_conflict_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            foreground_queue_concurrency: 1,
            load_queue_concurrency: 2,
            background_queue_concurrency: 1,

            initial_retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(5 * 60),
            backoff_multiplier: 2.0,
            jitter_percent: 0.2,
            min_retry_delay: Duration::from_secs(1),
            max_retry_attempts: 50,

            foreground_poll_interval: Duration::from_secs(5),
            background_poll_interval: Duration::from_secs(5 * 60),

            foreground_queue_capacity_timeout: Duration::from_secs(10),
            load_queue_capacity_timeout: Duration::from_secs(5),
            background_queue_capacity_timeout: Duration::from_secs(2),
            queue_capacity_check_interval: Duration::from_millis(100),

            max_foreground_queue_capacity: 50,
            max_load_queue_capacity: 50,
            max_background_queue_capacity: 50,

            maximum_network_timeout: Duration::from_secs(20),
            id_negotiation_timeout: Duration::from_secs(30),
            background_sync_timeout: Duration::from_secs(20),

            default_save_policy: SavePolicy::LocalFirst,
            default_load_policy: LoadPolicy::LocalThenRemote,

            deadlock_pending_task_threshold: 5,
            max_id_conflict_attempts: 3,
        }
    }
}

impl EngineConfig {
    pub fn capacity_timeout(&self, kind: QueueKind) -> Duration {
        match kind {
            QueueKind::Foreground => self.foreground_queue_capacity_timeout,
            QueueKind::Load => self.load_queue_capacity_timeout,
            QueueKind::Background => self.background_queue_capacity_timeout,
        }
    }

    pub fn max_capacity(&self, kind: QueueKind) -> usize {
        match kind {
            QueueKind::Foreground => self.max_foreground_queue_capacity,
            QueueKind::Load => self.max_load_queue_capacity,
            QueueKind::Background => self.max_background_queue_capacity,
        }
    }

    pub fn concurrency(&self, kind: QueueKind) -> usize {
        match kind {
            QueueKind::Foreground => self.foreground_queue_concurrency,
            QueueKind::Load => self.load_queue_concurrency,
            QueueKind::Background => self.background_queue_concurrency,
        }
    }

    pub fn inter_task_delay(&self, kind: QueueKind) -> Duration {
        match kind {
            QueueKind::Foreground => Duration::from_millis(50),
            QueueKind::Load => Duration::from_millis(50),
            QueueKind::Background => Duration::from_millis(100),
        }
    }
}
