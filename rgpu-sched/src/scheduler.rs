//! Top-level assembly: survey → priority map → queue pool → task pool.

use std::sync::Arc;

use crate::capability::{OpKind, QueueSurvey};
use crate::config::SchedulerConfig;
use crate::device::Device;
use crate::driver::Driver;
use crate::error::{EnqueueError, EnqueueRejected, SchedulerError};
use crate::gateway::SubmissionGateway;
use crate::priority::{OpFamilyTable, OperationPriorityMap};
use crate::queue_pool::QueuePool;
use crate::task::{Task, TaskHandle};
use crate::task_pool::TaskPool;

/// Routes tasks to the best-suited hardware queue for their operation kind.
///
/// Dropping the scheduler shuts every worker down: work that has not been
/// submitted yet is abandoned, work that has is waited on.
pub struct Scheduler {
    queues: QueuePool,
    tasks: TaskPool,
    priorities: OperationPriorityMap,
    survey: QueueSurvey,
    gateway: Arc<SubmissionGateway>,
    driver: Arc<dyn Driver>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("priorities", &self.priorities)
            .field("queues", &self.queues)
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Build a scheduler that serializes driver calls through
    /// [`SubmissionGateway::global`].
    ///
    /// `survey` should describe the device behind `driver`. If the queues
    /// [`plan_queue_slots`](crate::queue_pool::plan_queue_slots) picks for
    /// it and `config` were not all created with the device, construction
    /// fails with [`ConfigurationError::QueueNotCreated`].
    ///
    /// [`ConfigurationError::QueueNotCreated`]:
    ///     crate::error::ConfigurationError::QueueNotCreated
    pub fn new(
        driver: Arc<dyn Driver>,
        survey: QueueSurvey,
        config: &SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        Self::with_gateway(driver, survey, config, SubmissionGateway::global())
    }

    /// Like [`new`](Self::new), with an explicit gateway.
    pub fn with_gateway(
        driver: Arc<dyn Driver>,
        survey: QueueSurvey,
        config: &SchedulerConfig,
        gateway: Arc<SubmissionGateway>,
    ) -> Result<Self, SchedulerError> {
        let _span = tracing::info_span!("scheduler_init").entered();
        let priorities = OperationPriorityMap::resolve(&survey, &config.preference);
        for &kind in &config.required_kinds {
            priorities.lookup(kind)?;
        }
        for kind in OpKind::ALL {
            tracing::info!("{kind} families: {:?}", priorities.families(kind));
        }

        let queues = QueuePool::new(&driver, &gateway, &survey, &priorities, config)?;
        let tasks = TaskPool::new(
            &driver,
            config.fence_timeout_ns(),
            config.max_pooled_tasks_per_kind,
        );
        tracing::info!("Scheduler ready with {} worker queue(s)", queues.len());
        Ok(Self {
            queues,
            tasks,
            priorities,
            survey,
            gateway,
            driver,
        })
    }

    /// Build a scheduler over a [`Device`] created with the same `config`.
    pub fn for_device(
        device: &Arc<Device>,
        config: &SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let driver: Arc<dyn Driver> = device.clone();
        Self::new(driver, device.queue_survey().clone(), config)
    }

    /// An idle task for `kind`, from the pool when possible.
    pub fn task(&self, kind: OpKind) -> Result<Task, SchedulerError> {
        self.tasks.get_or_create(kind)
    }

    /// Hand `task` to the best worker for its kind.
    pub fn enqueue(&self, task: Task) -> Result<TaskHandle, EnqueueRejected> {
        self.enqueue_on(task, 0)
    }

    /// Hand `task` to the `rank`-th worker in its kind's route.
    ///
    /// Never blocks on GPU work. On error the task comes back unchanged
    /// inside [`EnqueueRejected`].
    pub fn enqueue_on(
        &self,
        task: Task,
        rank: usize,
    ) -> Result<TaskHandle, EnqueueRejected> {
        let kind = task.op_kind();
        let Some(worker) = self.queues.worker_for(kind, rank) else {
            return Err(EnqueueRejected {
                error: EnqueueError::NoWorker { kind, rank },
                task,
            });
        };
        let shared = worker.shared();
        if let Err(error) =
            task.check_out(Arc::downgrade(shared), worker.slot(), shared.targets())
        {
            return Err(EnqueueRejected { error, task });
        }
        if let Err(error) = shared.enqueue(Arc::clone(task.shared())) {
            task.release_checkout();
            return Err(EnqueueRejected { error, task });
        }
        tracing::trace!("Task {} enqueued on {:?}", task.id(), worker.slot());
        Ok(TaskHandle::new(task, worker.slot()))
    }

    /// Wait for `handle`, then put its task back in the pool.
    pub fn reclaim(&self, handle: TaskHandle) -> Result<(), SchedulerError> {
        self.tasks.return_task(handle.into_task())
    }

    /// Block until the whole device is idle.
    pub fn wait_idle(&self) -> Result<(), SchedulerError> {
        self.gateway
            .device_wait_idle(&*self.driver)
            .map_err(|e| SchedulerError::driver("device wait idle", e))
    }

    /// Stop every worker. Also happens on drop.
    pub fn shutdown(&mut self) {
        let _span = tracing::info_span!("scheduler_shutdown").entered();
        self.queues.shutdown();
    }

    pub fn priorities(&self) -> &OperationPriorityMap {
        &self.priorities
    }

    pub fn targets(&self) -> OpFamilyTable {
        self.priorities.primary_families()
    }

    pub fn queue_survey(&self) -> &QueueSurvey {
        &self.survey
    }

    pub fn queue_pool(&self) -> &QueuePool {
        &self.queues
    }

    pub fn task_pool(&self) -> &TaskPool {
        &self.tasks
    }

    pub fn gateway(&self) -> &Arc<SubmissionGateway> {
        &self.gateway
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use ash::vk;

    use super::*;
    use crate::capability::survey_queue_families;
    use crate::error::ConfigurationError;
    use crate::task::{Stage, WaitStatus};
    use crate::testing::{FakeDriver, FakeDriverBuilder};

    fn scheduler(
        fake: FakeDriver,
        config: &SchedulerConfig,
    ) -> (Arc<FakeDriver>, Result<Scheduler, SchedulerError>) {
        let fake = Arc::new(fake);
        let survey = survey_queue_families(fake.queue_family_properties()).unwrap();
        let driver: Arc<dyn Driver> = fake.clone();
        let sched = Scheduler::with_gateway(
            driver,
            survey,
            config,
            Arc::new(SubmissionGateway::new()),
        );
        (fake, sched)
    }

    fn three_families() -> FakeDriverBuilder {
        FakeDriver::builder().families(&[
            (vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
            (vk::QueueFlags::TRANSFER, 1),
            (vk::QueueFlags::COMPUTE, 1),
        ])
    }

    #[test]
    fn tasks_land_on_their_most_specialized_family() {
        let (fake, sched) = scheduler(three_families().build(), &SchedulerConfig::default());
        let sched = sched.unwrap();

        let handles: Vec<_> = [OpKind::Transfer, OpKind::Graphics, OpKind::Compute]
            .into_iter()
            .map(|kind| sched.enqueue(sched.task(kind).unwrap()).unwrap())
            .collect();
        for handle in &handles {
            assert_eq!(handle.wait_responsively(), WaitStatus::Finished);
        }
        let families: Vec<_> = handles.iter().map(|h| h.slot().family).collect();
        assert_eq!(families, [1, 0, 2]);

        let mut submitted: Vec<_> =
            fake.submissions().iter().map(|s| s.slot.family).collect();
        submitted.sort_unstable();
        assert_eq!(submitted, [0, 1, 2]);
        assert_eq!(sched.targets().family(OpKind::Transfer), Some(1));
    }

    #[test]
    fn missing_required_kind_fails_construction() {
        let compute_only = || {
            FakeDriver::builder()
                .families(&[(vk::QueueFlags::COMPUTE, 1)])
                .build()
        };
        let (_, err) = scheduler(compute_only(), &SchedulerConfig::default());
        assert!(matches!(
            err,
            Err(SchedulerError::Configuration(
                ConfigurationError::NoFamilyForKind(OpKind::Graphics)
            ))
        ));

        let config = SchedulerConfig {
            required_kinds: vec![OpKind::Compute, OpKind::Transfer],
            ..SchedulerConfig::default()
        };
        let (_, sched) = scheduler(compute_only(), &config);
        let sched = sched.unwrap();
        let rejected = sched
            .enqueue(sched.task(OpKind::Graphics).unwrap())
            .unwrap_err();
        assert!(matches!(
            rejected.error,
            EnqueueError::NoWorker {
                kind: OpKind::Graphics,
                rank: 0
            }
        ));
        assert_eq!(rejected.task.stage(), Stage::Alloc);
    }

    #[test]
    fn reclaimed_task_comes_back_without_callbacks() {
        let (_, sched) = scheduler(three_families().build(), &SchedulerConfig::default());
        let sched = sched.unwrap();
        let recorded = Arc::new(AtomicUsize::new(0));

        let mut task = sched.task(OpKind::Compute).unwrap();
        let id = task.id();
        let counter = Arc::clone(&recorded);
        task.set_recorder(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let handle = sched.enqueue(task).unwrap();
        assert_eq!(handle.wait_responsively(), WaitStatus::Finished);
        sched.reclaim(handle).unwrap();
        assert_eq!(recorded.load(Ordering::SeqCst), 1);

        let reused = sched.task(OpKind::Compute).unwrap();
        assert_eq!(reused.id(), id);
        let handle = sched.enqueue(reused).unwrap();
        assert_eq!(handle.wait_responsively(), WaitStatus::Finished);
        assert_eq!(recorded.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reused_task_walks_the_stages_in_order() {
        let (_, sched) = scheduler(three_families().build(), &SchedulerConfig::default());
        let sched = sched.unwrap();

        let mut task = sched.task(OpKind::Compute).unwrap();
        for _ in 0..3 {
            task = sched.enqueue(task).unwrap().into_task();
        }
        let cycle = [
            Stage::Record,
            Stage::Submit,
            Stage::Running,
            Stage::Finished,
            Stage::Alloc,
        ];
        let mut expected = vec![Stage::Alloc];
        for _ in 0..3 {
            expected.extend(cycle);
        }
        assert_eq!(task.stage_history(), expected);
    }

    #[test]
    fn concurrent_waiters_all_observe_completion() {
        let (fake, sched) = scheduler(
            three_families().manual_completion().build(),
            &SchedulerConfig::default(),
        );
        let sched = sched.unwrap();

        let handle = sched.enqueue(sched.task(OpKind::Graphics).unwrap()).unwrap();
        assert!(fake.wait_for_submissions(1, Duration::from_secs(5)));
        assert_eq!(handle.wait_responsively_ms(20), WaitStatus::TimedOut);
        assert_eq!(handle.wait_responsively_us(500), WaitStatus::TimedOut);
        assert_eq!(handle.stage(), Stage::Running);

        std::thread::scope(|s| {
            let waiters: Vec<_> = (0..3)
                .map(|_| s.spawn(|| handle.wait_responsively()))
                .collect();
            std::thread::sleep(Duration::from_millis(20));
            assert_eq!(fake.complete_all(), 1);
            for waiter in waiters {
                assert_eq!(waiter.join().unwrap(), WaitStatus::Finished);
            }
        });
        assert_eq!(handle.stage(), Stage::Finished);
    }

    #[test]
    fn buffers_are_never_shared_between_live_tasks() {
        let config = SchedulerConfig {
            max_recycled_command_buffers: 2,
            ..SchedulerConfig::default()
        };
        let (fake, sched) = scheduler(
            three_families()
                .pool_latency(Duration::from_micros(50))
                .submit_latency(Duration::from_micros(50))
                .build(),
            &config,
        );
        let sched = sched.unwrap();
        let in_use = Arc::new(Mutex::new(HashSet::new()));
        let completions = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|s| {
            for kind in OpKind::ALL {
                let sched = &sched;
                let in_use = Arc::clone(&in_use);
                let completions = Arc::clone(&completions);
                s.spawn(move || {
                    for _ in 0..20 {
                        let mut handles = Vec::new();
                        for _ in 0..4 {
                            let mut task = sched.task(kind).unwrap();
                            let in_use = Arc::clone(&in_use);
                            task.set_recorder(move |ctx| {
                                let buffer = ctx.raw_command_buffer();
                                assert!(in_use.lock().unwrap().insert(buffer));
                                std::thread::sleep(Duration::from_micros(100));
                                in_use.lock().unwrap().remove(&buffer);
                            });
                            let completions = Arc::clone(&completions);
                            task.set_completion(move || {
                                completions.fetch_add(1, Ordering::Relaxed);
                            });
                            handles.push(sched.enqueue(task).unwrap());
                        }
                        for handle in handles {
                            sched.reclaim(handle).unwrap();
                        }
                    }
                });
            }
        });

        assert_eq!(completions.load(Ordering::Relaxed), 3 * 20 * 4);
        let stats = fake.stats();
        assert_eq!(stats.submit_calls, 3 * 20 * 4);
        assert_eq!(stats.max_concurrent_submits, 1);
        assert!(stats.violations.is_empty(), "{:?}", stats.violations);
        assert!(sched.task_pool().idle_count(OpKind::Transfer) >= 1);
    }

    #[test]
    fn dropping_the_scheduler_abandons_queued_work() {
        let (fake, sched) = scheduler(
            three_families().manual_completion().build(),
            &SchedulerConfig::default(),
        );
        let mut sched = sched.unwrap();

        let first = sched.enqueue(sched.task(OpKind::Transfer).unwrap()).unwrap();
        assert!(fake.wait_for_submissions(1, Duration::from_secs(5)));
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let mut gated = sched.task(OpKind::Transfer).unwrap();
        gated.set_recorder(move |_| {
            let _ = gate_rx.recv();
        });
        let gated = sched.enqueue(gated).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(50));
                drop(gate_tx);
                std::thread::sleep(Duration::from_millis(50));
                fake.complete_all();
            });
            std::thread::sleep(Duration::from_millis(20));
            sched.shutdown();
        });

        assert_eq!(first.wait_responsively(), WaitStatus::Finished);
        assert_eq!(gated.wait_responsively(), WaitStatus::Terminated);
        assert_eq!(fake.stats().submit_calls, 1);
        let rejected = sched.enqueue(gated.into_task()).unwrap_err();
        assert!(matches!(rejected.error, EnqueueError::ShutDown));

        // The refused task is still usable and goes back to the pool.
        let idle = sched.task_pool().idle_count(OpKind::Transfer);
        sched.task_pool().return_task(rejected.into_task()).unwrap();
        assert_eq!(sched.task_pool().idle_count(OpKind::Transfer), idle + 1);
    }

    #[test]
    fn wait_idle_goes_through_the_gateway() {
        let (fake, sched) = scheduler(three_families().build(), &SchedulerConfig::default());
        sched.unwrap().wait_idle().unwrap();
        assert_eq!(fake.stats().device_wait_idle_calls, 1);
    }
}
