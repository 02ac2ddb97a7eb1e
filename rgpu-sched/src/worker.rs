//! One hardware queue with an alloc/free thread that owns its command pool
//! and a submit thread that feeds it in enqueue order.

use std::collections::{BTreeMap, VecDeque};
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use ash::vk;

use crate::command::{AllocateCommandBufferError, CommandPool, CreateCommandPoolError};
use crate::driver::Driver;
use crate::error::{EnqueueError, SchedulerError, fatal};
use crate::gateway::SubmissionGateway;
use crate::priority::OpFamilyTable;
use crate::queue_pool::QueueSlot;
use crate::task::TaskShared;

#[derive(Default)]
struct AllocState {
    /// Tasks waiting for a buffer, with their submission ticket.
    pending: VecDeque<(u64, Arc<TaskShared>)>,
    /// Buffers handed back by tasks, not yet reset.
    returned: Vec<vk::CommandBuffer>,
    /// Buffers currently lent to tasks.
    lent: usize,
    next_ticket: u64,
    terminate: bool,
}

#[derive(Default)]
struct SubmitState {
    /// Recorded tasks keyed by ticket. Only `next_ticket` may be submitted.
    ready: BTreeMap<u64, Arc<TaskShared>>,
    next_ticket: u64,
    terminate: bool,
}

pub(crate) struct WorkerShared {
    slot: QueueSlot,
    queue: vk::Queue,
    driver: Arc<dyn Driver>,
    gateway: Arc<SubmissionGateway>,
    targets: OpFamilyTable,
    alloc: Mutex<AllocState>,
    alloc_cv: Condvar,
    submit: Mutex<SubmitState>,
    submit_cv: Condvar,
    #[cfg(test)]
    handoffs: AtomicUsize,
}

impl WorkerShared {
    fn lock_alloc(&self) -> MutexGuard<'_, AllocState> {
        self.alloc.lock().expect("worker alloc lock poisoned")
    }

    fn lock_submit(&self) -> MutexGuard<'_, SubmitState> {
        self.submit.lock().expect("worker submit lock poisoned")
    }

    pub(crate) fn slot(&self) -> QueueSlot {
        self.slot
    }

    pub(crate) fn raw_queue(&self) -> vk::Queue {
        self.queue
    }

    pub(crate) fn targets(&self) -> OpFamilyTable {
        self.targets
    }

    /// Queue `task` for a command buffer.
    pub(crate) fn enqueue(&self, task: Arc<TaskShared>) -> Result<(), EnqueueError> {
        let mut alloc = self.lock_alloc();
        if alloc.terminate {
            return Err(EnqueueError::ShutDown);
        }
        let ticket = alloc.next_ticket;
        alloc.next_ticket += 1;
        tracing::trace!(
            "Task {} queued on {:?} with ticket {ticket}",
            task.id(),
            self.slot
        );
        alloc.pending.push_back((ticket, task));
        drop(alloc);
        self.alloc_cv.notify_one();
        Ok(())
    }

    /// Hand a buffer back for reset and reuse.
    ///
    /// The buffer must not be pending execution.
    pub(crate) fn return_buffer(&self, buffer: vk::CommandBuffer) {
        let mut alloc = self.lock_alloc();
        alloc.returned.push(buffer);
        drop(alloc);
        self.alloc_cv.notify_one();
    }

    /// Pass a recorded task to the submit thread.
    ///
    /// Gives the task back if the worker is shutting down.
    pub(crate) fn hand_to_submit(
        &self,
        task: Arc<TaskShared>,
        ticket: u64,
    ) -> Result<(), Arc<TaskShared>> {
        #[cfg(test)]
        self.handoffs.fetch_add(1, Ordering::Relaxed);
        let mut submit = self.lock_submit();
        if submit.terminate {
            return Err(task);
        }
        submit.ready.insert(ticket, task);
        drop(submit);
        self.submit_cv.notify_one();
        Ok(())
    }

    /// Calls to [`hand_to_submit`](Self::hand_to_submit) so far.
    #[cfg(test)]
    pub(crate) fn handoffs(&self) -> usize {
        self.handoffs.load(Ordering::Relaxed)
    }

    /// Pending allocations and buffers currently lent out.
    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> (usize, usize) {
        let alloc = self.lock_alloc();
        (alloc.pending.len(), alloc.lent)
    }
}

fn alloc_free_loop(shared: Arc<WorkerShared>, mut pool: CommandPool) -> CommandPool {
    loop {
        let alloc = shared.lock_alloc();
        let mut alloc = shared
            .alloc_cv
            .wait_while(alloc, |s| {
                s.returned.is_empty()
                    && s.pending.is_empty()
                    && !(s.terminate && s.lent == 0)
            })
            .expect("worker alloc lock poisoned");

        let returned = std::mem::take(&mut alloc.returned);
        let lent = alloc.lent;
        alloc.lent = lent.checked_sub(returned.len()).unwrap_or_else(|| {
            tracing::error!(
                "Worker {:?} got back {} buffer(s) but only lent {lent}",
                shared.slot,
                returned.len(),
            );
            0
        });
        let terminate = alloc.terminate;
        let discarded: Vec<_> = if terminate {
            alloc.pending.drain(..).collect()
        } else {
            Vec::new()
        };
        let next = if terminate { None } else { alloc.pending.pop_front() };
        let done = terminate && alloc.lent == 0;
        drop(alloc);

        if !returned.is_empty() {
            // SAFETY: Tasks return buffers only after their fence signaled or
            // without ever submitting them, and the pool is only touched
            // from this thread.
            if let Err(e) = unsafe { pool.release(&returned) } {
                tracing::error!("{e}");
                fatal(SchedulerError::driver("command buffer reset", e.result()));
            }
            tracing::trace!(
                "Worker {:?} recycled {} buffer(s), {} on hand",
                shared.slot,
                returned.len(),
                pool.recycled_len()
            );
        }
        for (_, task) in discarded {
            task.abandon();
        }
        if let Some((ticket, task)) = next {
            lend_buffer(&shared, &mut pool, ticket, task);
        }
        if done {
            break;
        }
    }
    tracing::debug!("Alloc/free thread of worker {:?} exiting", shared.slot);
    pool
}

fn lend_buffer(
    shared: &Arc<WorkerShared>,
    pool: &mut CommandPool,
    ticket: u64,
    task: Arc<TaskShared>,
) {
    let (buffer, source) = match pool.acquire() {
        Ok(acquired) => acquired,
        Err(AllocateCommandBufferError::Vulkan(e)) => {
            fatal(SchedulerError::driver("command buffer allocation", e))
        }
    };
    // Counted before the task can possibly hand it back.
    shared.lock_alloc().lent += 1;
    match task.assign_command_buffer(buffer, ticket) {
        Ok(true) => {
            tracing::trace!(
                "Lent {source:?} buffer {buffer:?} to task {}",
                task.id()
            );
        }
        Ok(false) => {
            shared.lock_alloc().lent -= 1;
            // SAFETY: The buffer never left this thread.
            if let Err(e) = unsafe { pool.release(&[buffer]) } {
                fatal(SchedulerError::driver("command buffer reset", e.result()));
            }
            // The ticket still has to reach the submit thread to keep the
            // submission order moving.
            if let Err(task) = shared.hand_to_submit(task, ticket) {
                task.abandon();
            }
        }
        Err(violation) => fatal(violation.into()),
    }
}

fn submit_loop(shared: Arc<WorkerShared>) {
    loop {
        let submit = shared.lock_submit();
        let mut submit = shared
            .submit_cv
            .wait_while(submit, |s| {
                !s.ready.contains_key(&s.next_ticket) && !s.terminate
            })
            .expect("worker submit lock poisoned");
        if submit.terminate {
            let discarded = std::mem::take(&mut submit.ready);
            drop(submit);
            if !discarded.is_empty() {
                tracing::debug!(
                    "Worker {:?} discarding {} unsubmitted task(s)",
                    shared.slot,
                    discarded.len()
                );
            }
            for task in discarded.into_values() {
                task.abandon();
            }
            break;
        }
        let ticket = submit.next_ticket;
        let Some(task) = submit.ready.remove(&ticket) else {
            continue;
        };
        submit.next_ticket += 1;
        drop(submit);

        let _span =
            tracing::trace_span!("submit", task = %task.id(), ticket).entered();
        task.submit_on(&shared, &shared.gateway);
    }
    tracing::debug!("Submit thread of worker {:?} exiting", shared.slot);
}

/// A hardware queue with its command pool and feeding threads.
pub struct WorkerQueue {
    shared: Arc<WorkerShared>,
    alloc_thread: Option<JoinHandle<CommandPool>>,
    submit_thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerQueue")
            .field("slot", &self.shared.slot)
            .field("queue", &self.shared.queue)
            .finish_non_exhaustive()
    }
}

impl WorkerQueue {
    pub(crate) fn new(
        slot: QueueSlot,
        driver: &Arc<dyn Driver>,
        gateway: &Arc<SubmissionGateway>,
        targets: OpFamilyTable,
        max_recycled: usize,
    ) -> Result<Self, SchedulerError> {
        // SAFETY: QueuePool::new only builds workers for slots the driver
        // reports through has_queue.
        let queue = unsafe { driver.get_raw_queue(slot.family, slot.index) };
        let pool = CommandPool::new(driver, slot.family, max_recycled).map_err(
            |e| match e {
                CreateCommandPoolError::Vulkan(r) => {
                    SchedulerError::driver("command pool creation", r)
                }
            },
        )?;

        let shared = Arc::new(WorkerShared {
            slot,
            queue,
            driver: Arc::clone(driver),
            gateway: Arc::clone(gateway),
            targets,
            alloc: Mutex::new(AllocState::default()),
            alloc_cv: Condvar::new(),
            submit: Mutex::new(SubmitState::default()),
            submit_cv: Condvar::new(),
            #[cfg(test)]
            handoffs: AtomicUsize::new(0),
        });
        let mut worker = WorkerQueue {
            shared,
            alloc_thread: None,
            submit_thread: None,
        };

        let name = format!("wq{}.{}-alloc", slot.family, slot.index);
        let alloc_shared = Arc::clone(&worker.shared);
        worker.alloc_thread = Some(
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || alloc_free_loop(alloc_shared, pool))
                .map_err(|source| SchedulerError::ThreadSpawn { name, source })?,
        );

        let name = format!("wq{}.{}-submit", slot.family, slot.index);
        let submit_shared = Arc::clone(&worker.shared);
        worker.submit_thread = Some(
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || submit_loop(submit_shared))
                .map_err(|source| SchedulerError::ThreadSpawn { name, source })?,
        );

        tracing::debug!("Started worker for queue {slot:?} ({queue:?})");
        Ok(worker)
    }

    pub fn slot(&self) -> QueueSlot {
        self.shared.slot
    }

    pub fn raw_queue(&self) -> vk::Queue {
        self.shared.queue
    }

    pub(crate) fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    /// Stop accepting work, discard what has not been submitted, wait for
    /// what has, and release the queue's resources.
    ///
    /// Idempotent; also run on drop.
    pub fn shutdown(&mut self) {
        if self.alloc_thread.is_none() && self.submit_thread.is_none() {
            return;
        }
        let _span =
            tracing::debug_span!("worker_shutdown", slot = ?self.shared.slot).entered();
        self.shared.lock_alloc().terminate = true;
        self.shared.lock_submit().terminate = true;
        self.shared.alloc_cv.notify_all();
        self.shared.submit_cv.notify_all();

        if let Some(thread) = self.submit_thread.take()
            && thread.join().is_err()
        {
            tracing::error!("Submit thread of worker {:?} panicked", self.shared.slot);
        }
        let pool = match self.alloc_thread.take().map(JoinHandle::join) {
            Some(Ok(pool)) => Some(pool),
            Some(Err(_)) => {
                tracing::error!(
                    "Alloc/free thread of worker {:?} panicked",
                    self.shared.slot
                );
                None
            }
            None => None,
        };

        // SAFETY: The queue came from this driver.
        if let Err(e) = unsafe {
            self.shared
                .gateway
                .queue_wait_idle(&*self.shared.driver, self.shared.queue)
        } {
            tracing::error!(
                "Waiting for queue {:?} to go idle failed: {e}",
                self.shared.slot
            );
        }
        drop(pool);
    }
}

impl Drop for WorkerQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capability::OpKind;
    use crate::task::{Stage, Task, TaskHandle, WaitStatus};
    use crate::testing::FakeDriver;

    const TIMEOUT_NS: u64 = 5_000_000_000;

    struct Rig {
        fake: Arc<FakeDriver>,
        driver: Arc<dyn Driver>,
        worker: WorkerQueue,
    }

    fn rig(fake: FakeDriver, max_recycled: usize) -> Rig {
        let fake = Arc::new(fake);
        let driver: Arc<dyn Driver> = fake.clone();
        let gateway = Arc::new(SubmissionGateway::new());
        let worker = WorkerQueue::new(
            QueueSlot { family: 0, index: 0 },
            &driver,
            &gateway,
            OpFamilyTable::default(),
            max_recycled,
        )
        .unwrap();
        Rig {
            fake,
            driver,
            worker,
        }
    }

    fn enqueue(worker: &WorkerQueue, task: Task) -> TaskHandle {
        task.check_out(
            Arc::downgrade(worker.shared()),
            worker.slot(),
            OpFamilyTable::default(),
        )
        .unwrap();
        worker.shared().enqueue(Arc::clone(task.shared())).unwrap();
        TaskHandle::new(task, worker.slot())
    }

    #[test]
    fn submits_in_enqueue_order() {
        let rig = rig(
            FakeDriver::builder()
                .families(&[(vk::QueueFlags::TRANSFER, 1)])
                .build(),
            4,
        );
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        let mut ids = Vec::new();
        for delay_ms in [30, 10, 0] {
            let mut task = Task::new(OpKind::Transfer, &rig.driver, TIMEOUT_NS).unwrap();
            task.set_recorder(move |_| std::thread::sleep(Duration::from_millis(delay_ms)));
            let order = Arc::clone(&order);
            task.set_submitter(move |ctx| {
                let id = ctx.task_id();
                let submitted = ctx.submit()?;
                order.lock().unwrap().push(id);
                Ok(submitted)
            });
            ids.push(task.id());
            handles.push(enqueue(&rig.worker, task));
        }
        for handle in &handles {
            assert_eq!(handle.wait_responsively_ms(5_000), WaitStatus::Finished);
        }
        assert_eq!(*order.lock().unwrap(), ids);
        assert!(rig.fake.stats().violations.is_empty());
    }

    #[test]
    fn buffers_are_recycled_across_cycles() {
        let rig = rig(
            FakeDriver::builder()
                .families(&[(vk::QueueFlags::COMPUTE, 1)])
                .build(),
            4,
        );
        let mut task = Task::new(OpKind::Compute, &rig.driver, TIMEOUT_NS).unwrap();
        for _ in 0..5 {
            let handle = enqueue(&rig.worker, task);
            assert_eq!(handle.wait_responsively(), WaitStatus::Finished);
            task = handle.into_task();
        }
        // The buffer goes back before Finished is signaled, so the last
        // return may still be in flight to the alloc thread.
        let stats = rig.fake.stats();
        assert_eq!(stats.submit_calls, 5);
        assert_eq!(stats.command_buffers_allocated, 1);
        assert!(stats.violations.is_empty(), "{:?}", stats.violations);
    }

    #[test]
    fn shutdown_abandons_unsubmitted_work() {
        let mut rig = rig(
            FakeDriver::builder()
                .families(&[(vk::QueueFlags::GRAPHICS, 1)])
                .manual_completion()
                .build(),
            4,
        );
        let running =
            enqueue(&rig.worker, Task::new(OpKind::Graphics, &rig.driver, TIMEOUT_NS).unwrap());
        assert!(rig.fake.wait_for_submissions(1, Duration::from_secs(5)));

        // Parked behind the first task's recording gate.
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let mut blocked = Task::new(OpKind::Graphics, &rig.driver, TIMEOUT_NS).unwrap();
        blocked.set_recorder(move |_| {
            let _ = gate_rx.recv();
        });
        let blocked = enqueue(&rig.worker, blocked);

        std::thread::scope(|s| {
            let fake = Arc::clone(&rig.fake);
            s.spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                drop(gate_tx);
                // Shutdown waits on the first submission.
                std::thread::sleep(Duration::from_millis(50));
                fake.complete_all();
            });
            std::thread::sleep(Duration::from_millis(20));
            rig.worker.shutdown();
        });

        assert_eq!(running.wait_responsively(), WaitStatus::Finished);
        assert_eq!(blocked.wait_responsively(), WaitStatus::Terminated);
        assert_eq!(blocked.stage(), Stage::Submit);
        assert_eq!(rig.fake.stats().submit_calls, 1);

        let task = blocked.into_task();
        assert_eq!(task.stage(), Stage::Alloc);
        let err = rig.worker.shared().enqueue(Arc::clone(task.shared()));
        assert!(matches!(err, Err(EnqueueError::ShutDown)));
        assert_eq!(rig.worker.shared().outstanding(), (0, 0));

        drop(running);
        drop(task);
        drop(rig);
    }
}
