//! The driver entry points the scheduler depends on.

use ash::vk;

use crate::queue_pool::QueueSlot;

pub trait Driver: Send + Sync + 'static {
    /// Whether `slot` was requested when the device was created, i.e.
    /// whether [`get_raw_queue`](Self::get_raw_queue) may be called for it.
    fn has_queue(&self, slot: QueueSlot) -> bool;

    /// Fetch the queue at `index` of `family`.
    ///
    /// # Safety
    /// The device must have been created with at least `index + 1` queues of
    /// `family`.
    unsafe fn get_raw_queue(&self, family: u32, index: u32) -> vk::Queue;

    /// Create a command pool whose buffers can be reset individually.
    ///
    /// # Safety
    /// `family` must be a valid queue family index for this device.
    unsafe fn create_raw_command_pool(
        &self,
        family: u32,
    ) -> Result<vk::CommandPool, vk::Result>;

    /// # Safety
    /// `pool` must come from this driver, and no buffer allocated from it
    /// may be pending execution. Destroying a pool frees its buffers.
    unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool);

    /// Allocate one primary command buffer.
    ///
    /// # Safety
    /// `pool` must come from this driver and be externally synchronized.
    unsafe fn allocate_raw_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> Result<vk::CommandBuffer, vk::Result>;

    /// # Safety
    /// Every buffer must have been allocated from `pool`, none may be
    /// pending, and `pool` must be externally synchronized.
    unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        buffers: &[vk::CommandBuffer],
    );

    /// # Safety
    /// `buffer` must not be pending execution, and the pool it came from must
    /// be externally synchronized.
    unsafe fn reset_raw_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result>;

    /// Begin recording with `ONE_TIME_SUBMIT`.
    ///
    /// # Safety
    /// `buffer` must be in the initial state.
    unsafe fn begin_raw_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// `buffer` must be in the recording state.
    unsafe fn end_raw_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// None beyond a live device.
    unsafe fn create_raw_fence(
        &self,
        signaled: bool,
    ) -> Result<vk::Fence, vk::Result>;

    /// # Safety
    /// `fence` must come from this driver and must not be pending.
    unsafe fn destroy_raw_fence(&self, fence: vk::Fence);

    /// Block until `fence` is signaled or `timeout_ns` elapses.
    ///
    /// Returns `Err(vk::Result::TIMEOUT)` on timeout.
    ///
    /// # Safety
    /// `fence` must come from this driver.
    unsafe fn wait_for_raw_fence(
        &self,
        fence: vk::Fence,
        timeout_ns: u64,
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// `fence` must come from this driver and must not be pending.
    unsafe fn reset_raw_fence(&self, fence: vk::Fence) -> Result<(), vk::Result>;

    /// # Safety
    /// All handles in `submits` must come from this driver, command buffers
    /// must be executable, and `fence` (when not null) must be unsignaled.
    /// Callers must hold the gateway's submit lock.
    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// `queue` must come from this driver. Callers must hold the gateway's
    /// queue-idle lock.
    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<(), vk::Result>;

    /// # Safety
    /// Callers must hold the gateway's device-idle lock.
    unsafe fn device_wait_idle(&self) -> Result<(), vk::Result>;
}
