//! Pooled, reusable submission state machine.
//!
//! ```text
//! Alloc ──► Record ──► Submit ──► Running ──► Finished
//!   ▲                                            │
//!   └──────── reset, once Finished is observed ──┘
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use ash::vk;

use crate::capability::OpKind;
use crate::driver::Driver;
use crate::error::{
    EnqueueError, ProtocolViolation, SchedulerError, SubmitError, fatal,
};
use crate::gateway::SubmissionGateway;
use crate::priority::OpFamilyTable;
use crate::queue_pool::QueueSlot;
use crate::sync::{Fence, PrepareFenceError, WaitFenceError};
use crate::worker::WorkerShared;

// ---------------------------------------------------------------------------
// Identifiers and stages
// ---------------------------------------------------------------------------

/// Process-unique task identifier, used in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Alloc = 1,
    Record = 2,
    Submit = 3,
    Running = 4,
    Finished = 5,
}

impl Stage {
    /// The stage that follows this one in the cycle.
    pub fn next(self) -> Stage {
        match self {
            Stage::Alloc => Stage::Record,
            Stage::Record => Stage::Submit,
            Stage::Submit => Stage::Running,
            Stage::Running => Stage::Finished,
            Stage::Finished => Stage::Alloc,
        }
    }

    pub fn number(self) -> u8 {
        self as u8
    }
}

/// Outcome of a `wait_responsively*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The submission completed and its continuation has run.
    Finished,
    /// The task was abandoned by a shutting-down worker, or torn down.
    Terminated,
    /// The timeout elapsed first.
    TimedOut,
}

// ---------------------------------------------------------------------------
// Callback contexts
// ---------------------------------------------------------------------------

/// What a recording callback gets to work with.
///
/// The buffer is already in the recording state and is ended by the task
/// after the callback returns. Callbacks must not submit, reset or free it.
#[derive(Debug)]
pub struct RecordContext<'a> {
    task: TaskId,
    op: OpKind,
    slot: QueueSlot,
    command_buffer: vk::CommandBuffer,
    targets: &'a OpFamilyTable,
}

impl RecordContext<'_> {
    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Primary family per operation kind, for queue-family ownership
    /// transfer barriers.
    pub fn targets(&self) -> &OpFamilyTable {
        self.targets
    }

    pub fn op_kind(&self) -> OpKind {
        self.op
    }

    /// The queue the buffer will be submitted to.
    pub fn slot(&self) -> QueueSlot {
        self.slot
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }
}

/// Proof that a [`SubmitContext`] performed its one submission.
///
/// Only [`SubmitContext::submit`] and [`SubmitContext::submit_with`] can
/// produce it.
#[derive(Debug)]
pub struct Submitted {
    _private: (),
}

/// Semaphores attached to a submission.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubmitSync<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    /// One stage mask per wait semaphore.
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// What a submission callback gets to work with.
///
/// Consumed by the single submit it performs.
pub struct SubmitContext<'a> {
    task: TaskId,
    slot: QueueSlot,
    command_buffer: vk::CommandBuffer,
    queue: vk::Queue,
    fence: vk::Fence,
    driver: &'a dyn Driver,
    gateway: &'a SubmissionGateway,
}

impl std::fmt::Debug for SubmitContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitContext")
            .field("task", &self.task)
            .field("slot", &self.slot)
            .field("command_buffer", &self.command_buffer)
            .field("queue", &self.queue)
            .field("fence", &self.fence)
            .finish_non_exhaustive()
    }
}

impl SubmitContext<'_> {
    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn raw_queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn raw_fence(&self) -> vk::Fence {
        self.fence
    }

    pub fn slot(&self) -> QueueSlot {
        self.slot
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// Submit the task's buffer alone, signaling its fence.
    pub fn submit(self) -> Result<Submitted, SubmitError> {
        self.submit_with(&SubmitSync::default())
    }

    /// Submit the task's buffer with extra semaphores, signaling its fence.
    pub fn submit_with(
        self,
        sync: &SubmitSync<'_>,
    ) -> Result<Submitted, SubmitError> {
        if sync.wait_semaphores.len() != sync.wait_stages.len() {
            return Err(SubmitError::Callback(format!(
                "{} wait semaphore(s) but {} wait stage mask(s)",
                sync.wait_semaphores.len(),
                sync.wait_stages.len()
            )));
        }
        let buffers = [self.command_buffer];
        let info = vk::SubmitInfo::default()
            .command_buffers(&buffers)
            .wait_semaphores(sync.wait_semaphores)
            .wait_dst_stage_mask(sync.wait_stages)
            .signal_semaphores(sync.signal_semaphores);
        // SAFETY: The buffer was recorded and ended by this task's record
        // thread, the fence was reset by the submit thread, and the queue,
        // buffer and fence all come from `self.driver`.
        unsafe {
            self.gateway.queue_submit(
                self.driver,
                self.queue,
                std::slice::from_ref(&info),
                self.fence,
            )
        }
        .map_err(SubmitError::Vulkan)?;
        Ok(Submitted { _private: () })
    }
}

type Recorder = Box<dyn FnMut(&RecordContext<'_>) + Send>;
type Submitter =
    Box<dyn FnMut(SubmitContext<'_>) -> Result<Submitted, SubmitError> + Send>;
type Completion = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct TaskState {
    stage: Stage,
    command_buffer: Option<vk::CommandBuffer>,
    /// Non-owning back-reference, set while the task is checked out to a
    /// worker.
    worker: Option<Weak<WorkerShared>>,
    slot: Option<QueueSlot>,
    targets: OpFamilyTable,
    /// Position in the worker's submission order.
    ticket: u64,
    recorder: Option<Recorder>,
    submitter: Option<Submitter>,
    completion: Option<Completion>,
    terminate: bool,
    abandoned: bool,
    #[cfg(test)]
    history: Vec<Stage>,
}

impl TaskState {
    /// Past `Alloc` and not yet settled. While in flight the task's threads
    /// stay alive even if termination was requested.
    fn in_flight(&self) -> bool {
        !self.abandoned
            && matches!(self.stage, Stage::Record | Stage::Submit | Stage::Running)
    }

    fn settled(&self) -> bool {
        self.stage == Stage::Finished || self.abandoned || self.terminate
    }

    fn advance(&mut self, task: TaskId, to: Stage) -> Result<(), ProtocolViolation> {
        if to == Stage::Alloc || self.stage.next() != to {
            return Err(ProtocolViolation::StageOrder {
                task,
                from: self.stage,
                to,
            });
        }
        tracing::trace!("Task {task}: {:?} -> {to:?}", self.stage);
        self.stage = to;
        #[cfg(test)]
        self.history.push(to);
        Ok(())
    }
}

pub(crate) struct TaskShared {
    id: TaskId,
    op: OpKind,
    driver: Arc<dyn Driver>,
    fence_timeout_ns: u64,
    fence: Mutex<Fence>,
    state: Mutex<TaskState>,
    record_cv: Condvar,
    running_cv: Condvar,
    finished_cv: Condvar,
}

impl TaskShared {
    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().expect("task state lock poisoned")
    }

    fn lock_fence(&self) -> MutexGuard<'_, Fence> {
        self.fence.lock().expect("task fence lock poisoned")
    }

    fn notify_all(&self) {
        self.record_cv.notify_all();
        self.running_cv.notify_all();
        self.finished_cv.notify_all();
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    /// Lend `buffer` to the task and wake its record thread.
    ///
    /// Returns `Ok(false)` when the task is being torn down and did not take
    /// the buffer.
    pub(crate) fn assign_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        ticket: u64,
    ) -> Result<bool, ProtocolViolation> {
        let mut state = self.lock();
        if state.terminate || state.abandoned {
            return Ok(false);
        }
        if let Some(held) = state.command_buffer {
            return Err(ProtocolViolation::BufferAlreadyHeld {
                task: self.id,
                held,
                offered: buffer,
            });
        }
        state.advance(self.id, Stage::Record)?;
        state.command_buffer = Some(buffer);
        state.ticket = ticket;
        drop(state);
        self.record_cv.notify_all();
        Ok(true)
    }

    /// Give up on the current cycle without submitting.
    ///
    /// Any borrowed buffer is handed back to the worker.
    pub(crate) fn abandon(&self) {
        let mut state = self.lock();
        if state.abandoned || state.stage == Stage::Finished {
            return;
        }
        state.abandoned = true;
        let buffer = state.command_buffer.take();
        let worker = state.worker.take().and_then(|w| w.upgrade());
        let stage = state.stage;
        drop(state);

        tracing::debug!("Task {} abandoned in stage {stage:?}", self.id);
        if let Some(buffer) = buffer {
            match worker {
                Some(worker) => worker.return_buffer(buffer),
                None => tracing::warn!(
                    "Task {} holds {buffer:?} but its worker is gone",
                    self.id
                ),
            }
        }
        self.notify_all();
    }

    /// Submit step, run on the worker's submit thread.
    pub(crate) fn submit_on(
        &self,
        worker: &WorkerShared,
        gateway: &SubmissionGateway,
    ) {
        let mut state = self.lock();
        if state.terminate || state.abandoned {
            drop(state);
            self.abandon();
            return;
        }
        if state.stage != Stage::Submit {
            fatal(
                ProtocolViolation::StageOrder {
                    task: self.id,
                    from: state.stage,
                    to: Stage::Running,
                }
                .into(),
            );
        }
        let Some(buffer) = state.command_buffer else {
            fatal(ProtocolViolation::NoBufferHeld { task: self.id }.into());
        };
        let mut submitter = state.submitter.take();
        drop(state);

        let mut fence = self.lock_fence();
        match fence.prepare() {
            Ok(()) => {}
            Err(PrepareFenceError::StillPending) => fatal(
                ProtocolViolation::StageOrder {
                    task: self.id,
                    from: Stage::Submit,
                    to: Stage::Running,
                }
                .into(),
            ),
            Err(PrepareFenceError::Vulkan(e)) => {
                fatal(SchedulerError::driver("fence reset", e))
            }
        }

        let ctx = SubmitContext {
            task: self.id,
            slot: worker.slot(),
            command_buffer: buffer,
            queue: worker.raw_queue(),
            fence: fence.raw_fence(),
            driver: &*self.driver,
            gateway,
        };
        let result = catch_unwind(AssertUnwindSafe(|| match submitter.as_mut() {
            Some(submit) => submit(ctx),
            None => ctx.submit(),
        }));
        match result {
            Ok(Ok(Submitted { .. })) => {}
            Ok(Err(source)) => fatal(SchedulerError::Submission {
                task: self.id,
                queue: worker.raw_queue(),
                source,
            }),
            Err(_) => fatal(SchedulerError::CallbackPanicked {
                task: self.id,
                callback: "submission",
            }),
        }
        // SAFETY: The Submitted token proves the fence went to vkQueueSubmit.
        if let Err(e) = unsafe { fence.mark_submitted() } {
            tracing::error!("Task {}: {e}", self.id);
            fatal(
                ProtocolViolation::StageOrder {
                    task: self.id,
                    from: Stage::Submit,
                    to: Stage::Running,
                }
                .into(),
            );
        }
        drop(fence);

        let mut state = self.lock();
        state.submitter = submitter;
        if let Err(e) = state.advance(self.id, Stage::Running) {
            fatal(e.into());
        }
        drop(state);
        self.running_cv.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Resident threads
// ---------------------------------------------------------------------------

fn record_loop(shared: Arc<TaskShared>) {
    loop {
        let state = shared.lock();
        let state = shared
            .record_cv
            .wait_while(state, |s| {
                let ready = s.stage == Stage::Record && !s.abandoned;
                let exit = s.terminate && !s.in_flight();
                !ready && !exit
            })
            .expect("task state lock poisoned");
        if state.stage != Stage::Record || state.abandoned {
            break;
        }

        let worker = state.worker.as_ref().and_then(Weak::upgrade);
        let ticket = state.ticket;
        let Some(worker) = worker else {
            drop(state);
            shared.abandon();
            continue;
        };
        let mut state = state;
        if state.terminate {
            // Skip recording but still pass the ticket on, exactly once. The
            // submit thread sees `terminate` and abandons the task.
            if let Err(e) = state.advance(shared.id, Stage::Submit) {
                fatal(e.into());
            }
            drop(state);
            if worker.hand_to_submit(Arc::clone(&shared), ticket).is_err() {
                shared.abandon();
            }
            continue;
        }

        let Some(buffer) = state.command_buffer else {
            fatal(ProtocolViolation::NoBufferHeld { task: shared.id }.into());
        };
        let mut recorder = state.recorder.take();
        let targets = state.targets;
        let slot = state.slot.unwrap_or(worker.slot());
        drop(state);

        // SAFETY: The buffer was lent to this task in the initial state and
        // nobody else touches it until it is handed to the submit thread.
        unsafe { shared.driver.begin_raw_command_buffer(buffer) }
            .unwrap_or_else(|e| {
                fatal(SchedulerError::driver("command buffer begin", e))
            });
        if let Some(record) = recorder.as_mut() {
            let ctx = RecordContext {
                task: shared.id,
                op: shared.op,
                slot,
                command_buffer: buffer,
                targets: &targets,
            };
            if catch_unwind(AssertUnwindSafe(|| record(&ctx))).is_err() {
                fatal(SchedulerError::CallbackPanicked {
                    task: shared.id,
                    callback: "recording",
                });
            }
        }
        // SAFETY: Begun above on this thread.
        unsafe { shared.driver.end_raw_command_buffer(buffer) }
            .unwrap_or_else(|e| {
                fatal(SchedulerError::driver("command buffer end", e))
            });

        let mut state = shared.lock();
        state.recorder = recorder;
        if let Err(e) = state.advance(shared.id, Stage::Submit) {
            fatal(e.into());
        }
        drop(state);

        if worker.hand_to_submit(Arc::clone(&shared), ticket).is_err() {
            shared.abandon();
        }
    }
    tracing::trace!("Record thread of task {} exiting", shared.id);
}

fn running_loop(shared: Arc<TaskShared>) {
    loop {
        let state = shared.lock();
        let state = shared
            .running_cv
            .wait_while(state, |s| {
                let ready = s.stage == Stage::Running && !s.abandoned;
                let exit = s.terminate && !s.in_flight();
                !ready && !exit
            })
            .expect("task state lock poisoned");
        if state.stage != Stage::Running || state.abandoned {
            break;
        }
        drop(state);

        let fence = shared.lock_fence();
        match fence.wait(shared.fence_timeout_ns) {
            Ok(()) => {}
            Err(WaitFenceError::Timeout) => fatal(SchedulerError::Timeout {
                task: shared.id,
                fence: fence.raw_fence(),
                timeout: Duration::from_nanos(shared.fence_timeout_ns),
            }),
            Err(WaitFenceError::Vulkan(e)) => {
                fatal(SchedulerError::driver("fence wait", e))
            }
            Err(WaitFenceError::NotSubmitted) => fatal(
                ProtocolViolation::StageOrder {
                    task: shared.id,
                    from: Stage::Submit,
                    to: Stage::Running,
                }
                .into(),
            ),
        }
        drop(fence);

        let mut state = shared.lock();
        let Some(buffer) = state.command_buffer.take() else {
            fatal(ProtocolViolation::NoBufferHeld { task: shared.id }.into());
        };
        let worker = state.worker.take().and_then(|w| w.upgrade());
        let completion = state.completion.take();
        drop(state);

        match worker {
            Some(worker) => worker.return_buffer(buffer),
            None => tracing::warn!(
                "Task {} finished after its worker shut down",
                shared.id
            ),
        }
        if let Some(completion) = completion
            && catch_unwind(AssertUnwindSafe(completion)).is_err()
        {
            fatal(SchedulerError::CallbackPanicked {
                task: shared.id,
                callback: "completion",
            });
        }

        let mut state = shared.lock();
        if let Err(e) = state.advance(shared.id, Stage::Finished) {
            fatal(e.into());
        }
        drop(state);
        shared.notify_all();
    }
    tracing::trace!("Running thread of task {} exiting", shared.id);
}

fn spawn_named(
    name: String,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, SchedulerError> {
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|source| SchedulerError::ThreadSpawn { name, source })
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A reusable submission slot for one operation kind.
///
/// Obtain tasks from a [`TaskPool`](crate::task_pool::TaskPool), install
/// callbacks, then hand them to
/// [`Scheduler::enqueue`](crate::Scheduler::enqueue).
///
/// Dropping a task stops its threads. Work that already has a buffer is
/// allowed to settle first, so the drop blocks until any submitted fence
/// has signaled.
pub struct Task {
    shared: Arc<TaskShared>,
    record_thread: Option<JoinHandle<()>>,
    running_thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.shared.id)
            .field("op", &self.shared.op)
            .field("stage", &self.stage())
            .finish_non_exhaustive()
    }
}

impl Task {
    pub(crate) fn new(
        op: OpKind,
        driver: &Arc<dyn Driver>,
        fence_timeout_ns: u64,
    ) -> Result<Self, SchedulerError> {
        let id = TaskId::next();
        let fence = Fence::new_signaled(driver).map_err(|e| match e {
            crate::sync::CreateFenceError::Vulkan(r) => {
                SchedulerError::driver("fence creation", r)
            }
        })?;
        let shared = Arc::new(TaskShared {
            id,
            op,
            driver: Arc::clone(driver),
            fence_timeout_ns,
            fence: Mutex::new(fence),
            state: Mutex::new(TaskState {
                stage: Stage::Alloc,
                command_buffer: None,
                worker: None,
                slot: None,
                targets: OpFamilyTable::default(),
                ticket: 0,
                recorder: None,
                submitter: None,
                completion: None,
                terminate: false,
                abandoned: false,
                #[cfg(test)]
                history: vec![Stage::Alloc],
            }),
            record_cv: Condvar::new(),
            running_cv: Condvar::new(),
            finished_cv: Condvar::new(),
        });

        let mut task = Task {
            shared,
            record_thread: None,
            running_thread: None,
        };
        let record_shared = Arc::clone(&task.shared);
        task.record_thread = Some(spawn_named(format!("task{id}-record"), move || {
            record_loop(record_shared)
        })?);
        let running_shared = Arc::clone(&task.shared);
        task.running_thread =
            Some(spawn_named(format!("task{id}-running"), move || {
                running_loop(running_shared)
            })?);
        tracing::debug!("Created {op} task {id}");
        Ok(task)
    }

    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn op_kind(&self) -> OpKind {
        self.shared.op
    }

    pub fn stage(&self) -> Stage {
        self.shared.lock().stage
    }

    /// Install the recording callback. It stays installed across cycles
    /// until the task goes back to the [`TaskPool`](crate::task_pool::TaskPool).
    ///
    /// Without one, submissions carry an empty command buffer.
    pub fn set_recorder(
        &mut self,
        recorder: impl FnMut(&RecordContext<'_>) + Send + 'static,
    ) {
        self.shared.lock().recorder = Some(Box::new(recorder));
    }

    /// Install the submission callback. It stays installed across cycles
    /// until the task goes back to the [`TaskPool`](crate::task_pool::TaskPool).
    ///
    /// Without one, the buffer is submitted alone with
    /// [`SubmitContext::submit`].
    pub fn set_submitter(
        &mut self,
        submitter: impl FnMut(SubmitContext<'_>) -> Result<Submitted, SubmitError>
        + Send
        + 'static,
    ) {
        self.shared.lock().submitter = Some(Box::new(submitter));
    }

    /// Install the continuation for the next cycle only. It runs on the
    /// task's running thread after the fence signals.
    pub fn set_completion(&mut self, completion: impl FnOnce() + Send + 'static) {
        self.shared.lock().completion = Some(Box::new(completion));
    }

    /// Drop every installed callback.
    pub fn clear_callbacks(&mut self) {
        let mut state = self.shared.lock();
        state.recorder = None;
        state.submitter = None;
        state.completion = None;
    }

    pub(crate) fn shared(&self) -> &Arc<TaskShared> {
        &self.shared
    }

    /// Validate that the task is idle and bind it to `worker`.
    pub(crate) fn check_out(
        &self,
        worker: Weak<WorkerShared>,
        slot: QueueSlot,
        targets: OpFamilyTable,
    ) -> Result<(), EnqueueError> {
        let mut state = self.shared.lock();
        if state.stage != Stage::Alloc
            || state.command_buffer.is_some()
            || state.abandoned
        {
            return Err(EnqueueError::NotIdle {
                task: self.shared.id,
                stage: state.stage,
            });
        }
        state.worker = Some(worker);
        state.slot = Some(slot);
        state.targets = targets;
        Ok(())
    }

    /// Undo [`check_out`](Self::check_out) after a refused enqueue.
    pub(crate) fn release_checkout(&self) {
        let mut state = self.shared.lock();
        state.worker = None;
        state.slot = None;
    }

    /// Return a settled task to `Alloc` so it can be enqueued again.
    pub(crate) fn reset(&self) -> Result<(), ProtocolViolation> {
        let mut state = self.shared.lock();
        if state.stage == Stage::Alloc && !state.abandoned {
            return Ok(());
        }
        if state.stage != Stage::Finished && !state.abandoned {
            return Err(ProtocolViolation::TaskNotIdle {
                task: self.shared.id,
                stage: state.stage,
            });
        }
        if let Some(buffer) = state.command_buffer.take() {
            tracing::warn!(
                "Task {} dropped {buffer:?} whose worker is gone",
                self.shared.id
            );
        }
        state.stage = Stage::Alloc;
        state.abandoned = false;
        state.worker = None;
        state.slot = None;
        state.completion = None;
        #[cfg(test)]
        state.history.push(Stage::Alloc);
        Ok(())
    }

    /// Whether the task is in `Alloc` with nothing borrowed.
    pub(crate) fn is_idle(&self) -> bool {
        let state = self.shared.lock();
        state.stage == Stage::Alloc
            && state.command_buffer.is_none()
            && !state.abandoned
    }

    fn wait_until(&self, timeout: Option<Duration>) -> WaitStatus {
        let state = self.shared.lock();
        let state = match timeout {
            None => self
                .shared
                .finished_cv
                .wait_while(state, |s| !s.settled())
                .expect("task state lock poisoned"),
            Some(timeout) => {
                let (state, result) = self
                    .shared
                    .finished_cv
                    .wait_timeout_while(state, timeout, |s| !s.settled())
                    .expect("task state lock poisoned");
                if result.timed_out() && !state.settled() {
                    return WaitStatus::TimedOut;
                }
                state
            }
        };
        if state.stage == Stage::Finished {
            WaitStatus::Finished
        } else {
            WaitStatus::Terminated
        }
    }

    #[cfg(test)]
    pub(crate) fn stage_history(&self) -> Vec<Stage> {
        self.shared.lock().history.clone()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        tracing::debug!("Dropping task {}", self.shared.id);
        self.shared.lock().terminate = true;
        self.shared.notify_all();
        for thread in [self.record_thread.take(), self.running_thread.take()]
            .into_iter()
            .flatten()
        {
            if thread.join().is_err() {
                tracing::error!("Thread of task {} panicked", self.shared.id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TaskHandle
// ---------------------------------------------------------------------------

/// An enqueued task.
///
/// Returned by [`Scheduler::enqueue`](crate::Scheduler::enqueue). The handle
/// owns the task until [`into_task`](Self::into_task) gives it back. Waits
/// take `&self`, so several threads may wait on one handle.
#[derive(Debug)]
pub struct TaskHandle {
    task: Task,
    slot: QueueSlot,
}

impl TaskHandle {
    pub(crate) fn new(task: Task, slot: QueueSlot) -> Self {
        Self { task, slot }
    }

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn op_kind(&self) -> OpKind {
        self.task.op_kind()
    }

    pub fn stage(&self) -> Stage {
        self.task.stage()
    }

    /// The queue the task was routed to.
    pub fn slot(&self) -> QueueSlot {
        self.slot
    }

    /// Block until the task finishes or is terminated.
    pub fn wait_responsively(&self) -> WaitStatus {
        self.task.wait_until(None)
    }

    /// Like [`wait_responsively`](Self::wait_responsively), giving up after
    /// `micros` microseconds.
    pub fn wait_responsively_us(&self, micros: u64) -> WaitStatus {
        self.task.wait_until(Some(Duration::from_micros(micros)))
    }

    /// Like [`wait_responsively`](Self::wait_responsively), giving up after
    /// `millis` milliseconds.
    pub fn wait_responsively_ms(&self, millis: u64) -> WaitStatus {
        self.task.wait_until(Some(Duration::from_millis(millis)))
    }

    /// Wait for the task to settle, reset it to `Alloc` and give it back for
    /// reuse.
    pub fn into_task(self) -> Task {
        self.task.wait_until(None);
        if let Err(e) = self.task.reset() {
            fatal(e.into());
        }
        self.task
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::task_pool::TaskPool;
    use crate::testing::FakeDriver;
    use crate::worker::WorkerQueue;

    fn graphics_driver() -> Arc<dyn Driver> {
        Arc::new(
            FakeDriver::builder()
                .families(&[(vk::QueueFlags::GRAPHICS, 1)])
                .build(),
        )
    }

    #[test]
    fn stages_cycle_in_order() {
        let mut stage = Stage::Alloc;
        let mut seen = vec![stage.number()];
        for _ in 0..9 {
            stage = stage.next();
            seen.push(stage.number());
        }
        assert_eq!(seen, [1, 2, 3, 4, 5, 1, 2, 3, 4, 5]);
    }

    fn idle_state() -> TaskState {
        TaskState {
            stage: Stage::Alloc,
            command_buffer: None,
            worker: None,
            slot: None,
            targets: OpFamilyTable::default(),
            ticket: 0,
            recorder: None,
            submitter: None,
            completion: None,
            terminate: false,
            abandoned: false,
            history: vec![],
        }
    }

    #[test]
    fn skipped_and_backward_transitions_are_rejected() {
        let id = TaskId::from_raw(1);
        let mut state = idle_state();
        assert!(matches!(
            state.advance(id, Stage::Submit),
            Err(ProtocolViolation::StageOrder {
                from: Stage::Alloc,
                to: Stage::Submit,
                ..
            })
        ));
        state.advance(id, Stage::Record).unwrap();
        state.advance(id, Stage::Submit).unwrap();
        assert!(state.advance(id, Stage::Record).is_err());
        state.advance(id, Stage::Running).unwrap();
        state.advance(id, Stage::Finished).unwrap();
        // Finished -> Alloc only happens through an observed reset.
        assert!(state.advance(id, Stage::Alloc).is_err());
        assert_eq!(
            state.history,
            [Stage::Record, Stage::Submit, Stage::Running, Stage::Finished]
        );
    }

    #[test]
    fn in_flight_tracks_borrowed_stages() {
        let mut state = idle_state();
        assert!(!state.in_flight());
        state.stage = Stage::Submit;
        assert!(state.in_flight());
        state.abandoned = true;
        assert!(!state.in_flight());
        assert!(state.settled());
    }

    #[test]
    fn terminated_record_hands_its_ticket_on_once() {
        let driver = graphics_driver();
        let mut worker = WorkerQueue::new(
            QueueSlot { family: 0, index: 0 },
            &driver,
            &Arc::new(SubmissionGateway::new()),
            OpFamilyTable::default(),
            4,
        )
        .unwrap();
        let task = Task::new(OpKind::Graphics, &driver, 1_000_000_000).unwrap();
        {
            let mut state = task.shared.lock();
            state.worker = Some(Arc::downgrade(worker.shared()));
            state.slot = Some(worker.slot());
            state.stage = Stage::Record;
            // Not the submit thread's next ticket, so the task stays parked.
            state.ticket = 7;
            state.terminate = true;
        }
        task.shared.notify_all();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(worker.shared().handoffs(), 1);
        assert_eq!(task.stage(), Stage::Submit);

        // Shutdown abandons the parked task, which lets its threads exit.
        worker.shutdown();
        assert_eq!(worker.shared().handoffs(), 1);
        drop(task);
    }

    #[test]
    fn second_buffer_for_one_task_is_a_violation() {
        let driver = graphics_driver();
        let task = Task::new(OpKind::Graphics, &driver, 1_000_000_000).unwrap();
        let held = vk::CommandBuffer::from_raw(0x10);
        let offered = vk::CommandBuffer::from_raw(0x20);
        task.shared.lock().command_buffer = Some(held);

        let result = task.shared.assign_command_buffer(offered, 0);
        assert!(matches!(
            result,
            Err(ProtocolViolation::BufferAlreadyHeld { held: h, offered: o, .. })
                if h == held && o == offered
        ));
        assert_eq!(task.stage(), Stage::Alloc);
        task.shared.lock().command_buffer = None;
    }

    #[test]
    fn finished_task_is_neither_poolable_nor_enqueueable() {
        let driver = graphics_driver();
        let pool = TaskPool::new(&driver, 1_000_000_000, 4);
        let task = Task::new(OpKind::Graphics, &driver, 1_000_000_000).unwrap();
        let id = task.shared.id;
        task.shared.lock().stage = Stage::Finished;

        let slot = QueueSlot { family: 0, index: 0 };
        assert!(matches!(
            task.check_out(Weak::new(), slot, OpFamilyTable::default()),
            Err(EnqueueError::NotIdle { task: t, stage: Stage::Finished })
                if t == id
        ));
        assert!(matches!(
            pool.return_task(task),
            Err(SchedulerError::ProtocolViolation(
                ProtocolViolation::TaskNotIdle { task: t, stage: Stage::Finished }
            )) if t == id
        ));
        assert_eq!(pool.idle_count(OpKind::Graphics), 0);
    }
}
