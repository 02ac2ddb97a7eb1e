//! Idle [`Task`]s kept per operation kind.
//!
//! Creating a task spawns two threads and a fence, so finished tasks are
//! returned here and handed out again instead of being dropped.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::capability::OpKind;
use crate::driver::Driver;
use crate::error::{ProtocolViolation, SchedulerError};
use crate::task::Task;

pub struct TaskPool {
    driver: Arc<dyn Driver>,
    fence_timeout_ns: u64,
    max_per_kind: usize,
    idle: Mutex<[Vec<Task>; 3]>,
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("max_per_kind", &self.max_per_kind)
            .field("idle", &OpKind::ALL.map(|k| self.idle_count(k)))
            .finish_non_exhaustive()
    }
}

impl TaskPool {
    pub(crate) fn new(
        driver: &Arc<dyn Driver>,
        fence_timeout_ns: u64,
        max_per_kind: usize,
    ) -> Self {
        Self {
            driver: Arc::clone(driver),
            fence_timeout_ns,
            max_per_kind,
            idle: Mutex::new(Default::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, [Vec<Task>; 3]> {
        self.idle.lock().expect("task pool lock poisoned")
    }

    /// An idle task for `kind`, reused if one is pooled.
    pub fn get_or_create(&self, kind: OpKind) -> Result<Task, SchedulerError> {
        if let Some(task) = self.lock()[kind.index()].pop() {
            tracing::trace!("Reusing {kind} task {}", task.id());
            return Ok(task);
        }
        Task::new(kind, &self.driver, self.fence_timeout_ns)
    }

    /// Put an idle task back. Tasks beyond the per-kind limit are dropped.
    ///
    /// Installed callbacks are cleared so the next user starts clean.
    pub fn return_task(&self, mut task: Task) -> Result<(), SchedulerError> {
        if !task.is_idle() {
            return Err(ProtocolViolation::TaskNotIdle {
                task: task.id(),
                stage: task.stage(),
            }
            .into());
        }
        task.clear_callbacks();
        let mut idle = self.lock();
        let slot = &mut idle[task.op_kind().index()];
        if slot.len() >= self.max_per_kind {
            drop(idle);
            tracing::trace!("Task pool full, dropping task {}", task.id());
            drop(task);
        } else {
            slot.push(task);
        }
        Ok(())
    }

    pub fn idle_count(&self, kind: OpKind) -> usize {
        self.lock()[kind.index()].len()
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::*;
    use crate::testing::FakeDriver;

    #[test]
    fn tasks_are_reused_up_to_the_limit() {
        let driver: Arc<dyn Driver> = Arc::new(
            FakeDriver::builder()
                .families(&[(vk::QueueFlags::GRAPHICS, 1)])
                .build(),
        );
        let pool = TaskPool::new(&driver, 1_000_000_000, 1);

        let a = pool.get_or_create(OpKind::Transfer).unwrap();
        let b = pool.get_or_create(OpKind::Transfer).unwrap();
        let (a_id, b_id) = (a.id(), b.id());
        assert_ne!(a_id, b_id);

        pool.return_task(a).unwrap();
        pool.return_task(b).unwrap();
        assert_eq!(pool.idle_count(OpKind::Transfer), 1);
        assert_eq!(pool.idle_count(OpKind::Compute), 0);

        let again = pool.get_or_create(OpKind::Transfer).unwrap();
        assert_eq!(again.id(), a_id);
        let other = pool.get_or_create(OpKind::Compute).unwrap();
        assert_eq!(other.op_kind(), OpKind::Compute);
    }
}
