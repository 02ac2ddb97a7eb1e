use std::time::Duration;

use crate::capability::OpKind;
use crate::priority::DEFAULT_PREFERENCE;

/// Construction-time settings for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Caller preference between operation kinds, most preferred first.
    /// Used to break ties between equally specialized queue families.
    pub preference: Vec<OpKind>,
    /// Kinds that must be served by at least one family. Construction fails
    /// with [`ConfigurationError::NoFamilyForKind`] otherwise.
    ///
    /// [`ConfigurationError::NoFamilyForKind`]:
    ///     crate::error::ConfigurationError::NoFamilyForKind
    pub required_kinds: Vec<OpKind>,
    /// Upper bound on worker queues instantiated per referenced family.
    pub queues_per_family: u32,
    /// How long a task's running thread waits on its fence before the
    /// device is considered lost.
    pub fence_timeout: Duration,
    /// Reset command buffers kept per worker for reuse; surplus returns are
    /// freed.
    pub max_recycled_command_buffers: usize,
    /// Idle tasks retained per kind by the task pool. Each pooled task keeps
    /// two OS threads alive.
    pub max_pooled_tasks_per_kind: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            preference: DEFAULT_PREFERENCE.to_vec(),
            required_kinds: OpKind::ALL.to_vec(),
            queues_per_family: 1,
            fence_timeout: Duration::from_secs(10),
            max_recycled_command_buffers: 8,
            max_pooled_tasks_per_kind: 16,
        }
    }
}

impl SchedulerConfig {
    pub(crate) fn fence_timeout_ns(&self) -> u64 {
        u64::try_from(self.fence_timeout.as_nanos()).unwrap_or(u64::MAX)
    }
}
