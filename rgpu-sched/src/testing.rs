//! In-memory [`Driver`] for exercising the scheduler without a GPU.
//!
//! Misuse of command buffers, pools or `vkQueueSubmit` is recorded in
//! [`FakeStats::violations`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ash::vk::{self, Handle};

use crate::driver::Driver;
use crate::queue_pool::QueueSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Initial,
    Recording,
    Executable,
    Pending,
}

#[derive(Debug)]
struct BufferRecord {
    pool: vk::CommandPool,
    state: BufferState,
}

#[derive(Debug)]
struct PoolRecord {
    family: u32,
    busy: bool,
}

#[derive(Debug)]
struct PendingSubmit {
    buffers: Vec<vk::CommandBuffer>,
    fence: vk::Fence,
}

/// One `vkQueueSubmit` call as seen by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub queue: vk::Queue,
    pub slot: QueueSlot,
    pub buffers: Vec<vk::CommandBuffer>,
    pub fence: vk::Fence,
}

/// Counters collected by a [`FakeDriver`].
#[derive(Debug, Clone, Default)]
pub struct FakeStats {
    pub submit_calls: usize,
    pub max_concurrent_submits: usize,
    pub pools_created: usize,
    pub pools_destroyed: usize,
    pub command_buffers_allocated: usize,
    pub command_buffers_freed: usize,
    pub command_buffer_resets: usize,
    pub fences_created: usize,
    pub fences_destroyed: usize,
    pub queue_wait_idle_calls: usize,
    pub device_wait_idle_calls: usize,
    pub violations: Vec<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    queues: HashMap<vk::Queue, QueueSlot>,
    pools: HashMap<vk::CommandPool, PoolRecord>,
    buffers: HashMap<vk::CommandBuffer, BufferRecord>,
    fences: HashMap<vk::Fence, bool>,
    pending: HashMap<vk::Queue, VecDeque<PendingSubmit>>,
    submissions: Vec<SubmissionRecord>,
    stats: FakeStats,
}

impl FakeState {
    fn violation(&mut self, msg: String) {
        tracing::error!("FakeDriver violation: {msg}");
        self.stats.violations.push(msg);
    }

    fn finish(&mut self, submit: PendingSubmit) {
        for buffer in submit.buffers {
            if let Some(rec) = self.buffers.get_mut(&buffer) {
                rec.state = BufferState::Executable;
            }
        }
        if submit.fence != vk::Fence::null() {
            self.fences.insert(submit.fence, true);
        }
    }

    fn fence_pending(&self, fence: vk::Fence) -> bool {
        self.pending
            .values()
            .flatten()
            .any(|submit| submit.fence == fence)
    }
}

#[derive(Debug, Default)]
pub struct FakeDriverBuilder {
    families: Vec<vk::QueueFamilyProperties>,
    submit_latency: Duration,
    pool_latency: Duration,
    manual_completion: bool,
}

impl FakeDriverBuilder {
    /// Queue families as `(flags, queue_count)` pairs, in index order.
    pub fn families(mut self, families: &[(vk::QueueFlags, u32)]) -> Self {
        self.families = families
            .iter()
            .map(|(flags, count)| vk::QueueFamilyProperties {
                queue_flags: *flags,
                queue_count: *count,
                timestamp_valid_bits: 64,
                min_image_transfer_granularity: vk::Extent3D {
                    width: 1,
                    height: 1,
                    depth: 1,
                },
            })
            .collect();
        self
    }

    /// Time spent inside each `vkQueueSubmit`, to widen race windows.
    pub fn submit_latency(mut self, latency: Duration) -> Self {
        self.submit_latency = latency;
        self
    }

    /// Time spent inside each command pool call, to widen race windows.
    pub fn pool_latency(mut self, latency: Duration) -> Self {
        self.pool_latency = latency;
        self
    }

    /// Keep submissions pending until the test completes them.
    pub fn manual_completion(mut self) -> Self {
        self.manual_completion = true;
        self
    }

    pub fn build(self) -> FakeDriver {
        FakeDriver {
            families: self.families,
            submit_latency: self.submit_latency,
            pool_latency: self.pool_latency,
            manual_completion: self.manual_completion,
            next_handle: AtomicU64::new(1),
            submits_in_flight: AtomicUsize::new(0),
            state: Mutex::new(FakeState::default()),
            signal: Condvar::new(),
        }
    }
}

#[derive(Debug)]
pub struct FakeDriver {
    families: Vec<vk::QueueFamilyProperties>,
    submit_latency: Duration,
    pool_latency: Duration,
    manual_completion: bool,
    next_handle: AtomicU64,
    submits_in_flight: AtomicUsize,
    state: Mutex<FakeState>,
    signal: Condvar,
}

impl FakeDriver {
    pub fn builder() -> FakeDriverBuilder {
        FakeDriverBuilder::default()
    }

    /// The advertised queue family properties, for surveying.
    pub fn queue_family_properties(&self) -> &[vk::QueueFamilyProperties] {
        &self.families
    }

    pub fn stats(&self) -> FakeStats {
        self.lock().stats.clone()
    }

    /// Every submission so far, in call order.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.lock().submissions.clone()
    }

    /// Number of submissions not yet completed.
    pub fn pending_submissions(&self) -> usize {
        self.lock().pending.values().map(VecDeque::len).sum()
    }

    /// Complete the oldest pending submission on `queue`.
    ///
    /// Returns `false` when nothing is pending there.
    pub fn complete_next(&self, queue: vk::Queue) -> bool {
        let mut state = self.lock();
        let Some(submit) =
            state.pending.get_mut(&queue).and_then(VecDeque::pop_front)
        else {
            return false;
        };
        state.finish(submit);
        drop(state);
        self.signal.notify_all();
        true
    }

    /// Complete every pending submission on every queue.
    pub fn complete_all(&self) -> usize {
        let mut state = self.lock();
        let drained: Vec<_> = state
            .pending
            .values_mut()
            .flat_map(|q| q.drain(..))
            .collect();
        let count = drained.len();
        for submit in drained {
            state.finish(submit);
        }
        drop(state);
        self.signal.notify_all();
        count
    }

    /// Block until `count` submissions have been made or `timeout` elapses.
    pub fn wait_for_submissions(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.submissions.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .signal
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|p| p.into_inner())
                .0;
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn next<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Mark `pool` busy for the duration of `op`, recording a violation if
    /// another thread is already inside it.
    fn with_pool<R>(
        &self,
        pool: vk::CommandPool,
        what: &str,
        op: impl FnOnce(&mut FakeState) -> R,
    ) -> R {
        {
            let mut state = self.lock();
            match state.pools.get(&pool).map(|rec| rec.busy) {
                Some(true) => state.violation(format!(
                    "concurrent {what} on command pool {pool:?}"
                )),
                Some(false) => {
                    if let Some(rec) = state.pools.get_mut(&pool) {
                        rec.busy = true;
                    }
                }
                None => {
                    state.violation(format!("{what} on unknown pool {pool:?}"))
                }
            }
        }
        if !self.pool_latency.is_zero() {
            std::thread::sleep(self.pool_latency);
        }
        let mut state = self.lock();
        let out = op(&mut state);
        if let Some(rec) = state.pools.get_mut(&pool) {
            rec.busy = false;
        }
        out
    }

    fn buffer_pool(state: &FakeState, buffer: vk::CommandBuffer) -> Option<vk::CommandPool> {
        state.buffers.get(&buffer).map(|rec| rec.pool)
    }
}

impl Driver for FakeDriver {
    fn has_queue(&self, slot: QueueSlot) -> bool {
        self.families
            .get(slot.family as usize)
            .is_some_and(|f| slot.index < f.queue_count)
    }

    unsafe fn get_raw_queue(&self, family: u32, index: u32) -> vk::Queue {
        let slot = QueueSlot { family, index };
        let mut state = self.lock();
        let valid = self
            .families
            .get(family as usize)
            .is_some_and(|f| index < f.queue_count);
        if !valid {
            state.violation(format!("queue {slot:?} does not exist"));
        }
        if let Some((queue, _)) = state.queues.iter().find(|(_, s)| **s == slot)
        {
            return *queue;
        }
        let queue = self.next();
        state.queues.insert(queue, slot);
        queue
    }

    unsafe fn create_raw_command_pool(
        &self,
        family: u32,
    ) -> Result<vk::CommandPool, vk::Result> {
        if family as usize >= self.families.len() {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let pool = self.next();
        let mut state = self.lock();
        state.pools.insert(pool, PoolRecord { family, busy: false });
        state.stats.pools_created += 1;
        Ok(pool)
    }

    unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        self.with_pool(pool, "destroy", |state| {
            let pending = state.buffers.values().any(|b| {
                b.pool == pool && b.state == BufferState::Pending
            });
            if pending {
                state.violation(format!(
                    "pool {pool:?} destroyed with pending buffers"
                ));
            }
            state.buffers.retain(|_, b| b.pool != pool);
            state.stats.pools_destroyed += 1;
        });
        self.lock().pools.remove(&pool);
    }

    unsafe fn allocate_raw_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> Result<vk::CommandBuffer, vk::Result> {
        let buffer = self.next();
        self.with_pool(pool, "allocate", |state| {
            state.buffers.insert(
                buffer,
                BufferRecord {
                    pool,
                    state: BufferState::Initial,
                },
            );
            state.stats.command_buffers_allocated += 1;
        });
        Ok(buffer)
    }

    unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        buffers: &[vk::CommandBuffer],
    ) {
        self.with_pool(pool, "free", |state| {
            for buffer in buffers {
                match state.buffers.remove(buffer) {
                    Some(rec) if rec.state == BufferState::Pending => state
                        .violation(format!("freed pending buffer {buffer:?}")),
                    Some(_) => state.stats.command_buffers_freed += 1,
                    None => state
                        .violation(format!("freed unknown buffer {buffer:?}")),
                }
            }
        });
    }

    unsafe fn reset_raw_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        let pool = Self::buffer_pool(&self.lock(), buffer);
        let Some(pool) = pool else {
            self.lock()
                .violation(format!("reset of unknown buffer {buffer:?}"));
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        self.with_pool(pool, "reset", |state| {
            let current = state.buffers.get(&buffer).map(|b| b.state);
            match current {
                Some(BufferState::Pending | BufferState::Recording) => {
                    state.violation(format!(
                        "reset of busy buffer {buffer:?} ({current:?})"
                    ));
                }
                _ => {
                    if let Some(rec) = state.buffers.get_mut(&buffer) {
                        rec.state = BufferState::Initial;
                    }
                    state.stats.command_buffer_resets += 1;
                }
            }
        });
        Ok(())
    }

    unsafe fn begin_raw_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        let mut state = self.lock();
        let current = state.buffers.get(&buffer).map(|b| b.state);
        match current {
            Some(BufferState::Initial) => {
                if let Some(rec) = state.buffers.get_mut(&buffer) {
                    rec.state = BufferState::Recording;
                }
                Ok(())
            }
            other => {
                state.violation(format!(
                    "begin on buffer {buffer:?} in state {other:?}"
                ));
                Err(vk::Result::ERROR_UNKNOWN)
            }
        }
    }

    unsafe fn end_raw_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        let mut state = self.lock();
        let current = state.buffers.get(&buffer).map(|b| b.state);
        if current == Some(BufferState::Recording) {
            if let Some(rec) = state.buffers.get_mut(&buffer) {
                rec.state = BufferState::Executable;
            }
            Ok(())
        } else {
            state.violation(format!(
                "end on buffer {buffer:?} in state {current:?}"
            ));
            Err(vk::Result::ERROR_UNKNOWN)
        }
    }

    unsafe fn create_raw_fence(
        &self,
        signaled: bool,
    ) -> Result<vk::Fence, vk::Result> {
        let fence = self.next();
        let mut state = self.lock();
        state.fences.insert(fence, signaled);
        state.stats.fences_created += 1;
        Ok(fence)
    }

    unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        let mut state = self.lock();
        if state.fence_pending(fence) {
            state.violation(format!("destroyed pending fence {fence:?}"));
        }
        if state.fences.remove(&fence).is_none() {
            state.violation(format!("destroyed unknown fence {fence:?}"));
        }
        state.stats.fences_destroyed += 1;
    }

    unsafe fn wait_for_raw_fence(
        &self,
        fence: vk::Fence,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        let deadline =
            Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.lock();
        loop {
            match state.fences.get(&fence) {
                Some(true) => return Ok(()),
                Some(false) => {}
                None => {
                    state.violation(format!("wait on unknown fence {fence:?}"));
                    return Err(vk::Result::ERROR_DEVICE_LOST);
                }
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(vk::Result::TIMEOUT);
                    }
                    self.signal
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|p| p.into_inner())
                        .0
                }
                None => self.signal.wait(state).unwrap_or_else(|p| p.into_inner()),
            };
        }
    }

    unsafe fn reset_raw_fence(&self, fence: vk::Fence) -> Result<(), vk::Result> {
        let mut state = self.lock();
        if state.fence_pending(fence) {
            state.violation(format!("reset of pending fence {fence:?}"));
        }
        match state.fences.get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => {
                state.violation(format!("reset of unknown fence {fence:?}"));
                Err(vk::Result::ERROR_UNKNOWN)
            }
        }
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let concurrent =
            self.submits_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.submit_latency.is_zero() {
            std::thread::sleep(self.submit_latency);
        }

        let mut buffers = Vec::new();
        for submit in submits {
            if submit.command_buffer_count > 0 {
                // SAFETY: Caller guarantees `p_command_buffers` points at
                // `command_buffer_count` handles for the duration of the call.
                let slice = unsafe {
                    std::slice::from_raw_parts(
                        submit.p_command_buffers,
                        submit.command_buffer_count as usize,
                    )
                };
                buffers.extend_from_slice(slice);
            }
        }

        let mut state = self.lock();
        state.stats.submit_calls += 1;
        state.stats.max_concurrent_submits =
            state.stats.max_concurrent_submits.max(concurrent);
        if concurrent > 1 {
            state.violation(format!("{concurrent} overlapping vkQueueSubmit calls"));
        }

        let Some(slot) = state.queues.get(&queue).copied() else {
            state.violation(format!("submit to unknown queue {queue:?}"));
            self.submits_in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(vk::Result::ERROR_DEVICE_LOST);
        };

        for buffer in &buffers {
            let pool_family = state
                .buffers
                .get(buffer)
                .and_then(|b| state.pools.get(&b.pool))
                .map(|p| p.family);
            if pool_family != Some(slot.family) {
                state.violation(format!(
                    "buffer {buffer:?} from family {pool_family:?} submitted \
                     to family {}",
                    slot.family
                ));
            }
            let current = state.buffers.get(buffer).map(|b| b.state);
            if current == Some(BufferState::Executable) {
                if let Some(rec) = state.buffers.get_mut(buffer) {
                    rec.state = BufferState::Pending;
                }
            } else {
                state.violation(format!(
                    "submitted buffer {buffer:?} in state {current:?}"
                ));
            }
        }
        if fence != vk::Fence::null() && state.fences.get(&fence) != Some(&false)
        {
            state.violation(format!("submitted fence {fence:?} is not unsignaled"));
        }

        state.submissions.push(SubmissionRecord {
            queue,
            slot,
            buffers: buffers.clone(),
            fence,
        });
        let submit = PendingSubmit { buffers, fence };
        if self.manual_completion {
            state.pending.entry(queue).or_default().push_back(submit);
        } else {
            state.finish(submit);
        }
        drop(state);

        self.submits_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.signal.notify_all();
        Ok(())
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<(), vk::Result> {
        let mut state = self.lock();
        state.stats.queue_wait_idle_calls += 1;
        while state.pending.get(&queue).is_some_and(|q| !q.is_empty()) {
            state = self.signal.wait(state).unwrap_or_else(|p| p.into_inner());
        }
        Ok(())
    }

    unsafe fn device_wait_idle(&self) -> Result<(), vk::Result> {
        let mut state = self.lock();
        state.stats.device_wait_idle_calls += 1;
        while state.pending.values().any(|q| !q.is_empty()) {
            state = self.signal.wait(state).unwrap_or_else(|p| p.into_inner());
        }
        Ok(())
    }
}
