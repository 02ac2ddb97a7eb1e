use std::{marker::PhantomData, sync::Arc};

use ash::vk;
use thiserror::Error;

use crate::driver::Driver;

#[derive(Debug, Error)]
pub enum CreateCommandPoolError {
    #[error("Vulkan error creating command pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateCommandBufferError {
    #[error("Vulkan error allocating command buffer: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum RecycleCommandBufferError {
    #[error("Vulkan error resetting command buffer {buffer:?}: {result}")]
    Reset {
        buffer: vk::CommandBuffer,
        result: vk::Result,
    },
}

impl RecycleCommandBufferError {
    pub fn result(&self) -> vk::Result {
        match self {
            RecycleCommandBufferError::Reset { result, .. } => *result,
        }
    }
}

/// Where an acquired buffer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSource {
    Recycled,
    Allocated,
}

pub struct CommandPool {
    driver: Arc<dyn Driver>,
    pool: vk::CommandPool,
    family: u32,
    /// Reset buffers ready to be handed out again, most recent last.
    recycled: Vec<vk::CommandBuffer>,
    max_recycled: usize,
    /// Explicit `!Sync` marker: only the owning thread may touch the pool.
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("pool", &self.pool)
            .field("family", &self.family)
            .field("recycled", &self.recycled.len())
            .finish_non_exhaustive()
    }
}

impl CommandPool {
    /// Create a pool for `family` that keeps up to `max_recycled` reset
    /// buffers around for reuse.
    pub fn new(
        driver: &Arc<dyn Driver>,
        family: u32,
        max_recycled: usize,
    ) -> Result<Self, CreateCommandPoolError> {
        // SAFETY: Queue pools are only built for families taken from the
        // device's own survey.
        let pool = unsafe { driver.create_raw_command_pool(family) }
            .map_err(CreateCommandPoolError::Vulkan)?;
        Ok(Self {
            driver: Arc::clone(driver),
            pool,
            family,
            recycled: Vec::with_capacity(max_recycled),
            max_recycled,
            _not_sync: PhantomData,
        })
    }

    /// Hand out a buffer in the initial state, reusing a recycled one when
    /// available.
    pub fn acquire(
        &mut self,
    ) -> Result<(vk::CommandBuffer, BufferSource), AllocateCommandBufferError>
    {
        if let Some(buffer) = self.recycled.pop() {
            return Ok((buffer, BufferSource::Recycled));
        }
        // SAFETY: self.pool was created from self.driver and `&mut self` on a
        // !Sync type guarantees no concurrent pool access.
        let buffer = unsafe { self.driver.allocate_raw_command_buffer(self.pool) }
            .map_err(AllocateCommandBufferError::Vulkan)?;
        Ok((buffer, BufferSource::Allocated))
    }

    /// Take back buffers whose GPU work has completed (or that were never
    /// submitted).
    ///
    /// Each buffer is reset and kept for reuse up to the recycle limit; the
    /// surplus is freed to bound the pool's memory.
    ///
    /// # Safety
    /// Every buffer must have been acquired from this pool and must not be
    /// pending execution.
    pub unsafe fn release(
        &mut self,
        buffers: &[vk::CommandBuffer],
    ) -> Result<(), RecycleCommandBufferError> {
        let mut surplus = Vec::new();
        for &buffer in buffers {
            if self.recycled.len() >= self.max_recycled {
                surplus.push(buffer);
                continue;
            }
            // SAFETY: Caller guarantees the buffer is idle and from this
            // pool; `&mut self` provides the pool synchronization.
            unsafe { self.driver.reset_raw_command_buffer(buffer) }.map_err(
                |result| RecycleCommandBufferError::Reset { buffer, result },
            )?;
            self.recycled.push(buffer);
        }
        if !surplus.is_empty() {
            tracing::trace!(
                "Freeing {} surplus command buffer(s) from pool {:?}",
                surplus.len(),
                self.pool
            );
            // SAFETY: Caller guarantees the buffers are idle and from this
            // pool; `&mut self` provides the pool synchronization.
            unsafe { self.driver.free_raw_command_buffers(self.pool, &surplus) };
        }
        Ok(())
    }

    pub fn recycled_len(&self) -> usize {
        self.recycled.len()
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn raw_command_pool(&self) -> vk::CommandPool {
        self.pool
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.pool);
        // SAFETY: The owning worker waits for its queue to go idle before
        // dropping the pool, so no buffer allocated from it is pending.
        // vkDestroyCommandPool implicitly frees all allocated buffers.
        unsafe { self.driver.destroy_raw_command_pool(self.pool) };
    }
}

// CommandPool: Send + !Sync, so it can be moved into the alloc/free thread.
#[allow(dead_code)]
trait AssertSend: Send {}
impl AssertSend for CommandPool {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDriver;

    fn setup() -> (Arc<FakeDriver>, Arc<dyn Driver>) {
        let fake = Arc::new(
            FakeDriver::builder()
                .families(&[(vk::QueueFlags::TRANSFER, 1)])
                .build(),
        );
        let driver: Arc<dyn Driver> = fake.clone();
        (fake, driver)
    }

    #[test]
    fn released_buffers_are_reused() {
        let (fake, driver) = setup();
        let mut pool = CommandPool::new(&driver, 0, 4).unwrap();

        let (first, src) = pool.acquire().unwrap();
        assert_eq!(src, BufferSource::Allocated);
        // SAFETY: never submitted.
        unsafe { pool.release(&[first]) }.unwrap();

        let (again, src) = pool.acquire().unwrap();
        assert_eq!(src, BufferSource::Recycled);
        assert_eq!(again, first);
        assert_eq!(fake.stats().command_buffers_allocated, 1);
        assert_eq!(fake.stats().command_buffer_resets, 1);
    }

    #[test]
    fn surplus_is_freed() {
        let (fake, driver) = setup();
        let mut pool = CommandPool::new(&driver, 0, 2).unwrap();
        let buffers: Vec<_> =
            (0..5).map(|_| pool.acquire().unwrap().0).collect();

        // SAFETY: never submitted.
        unsafe { pool.release(&buffers) }.unwrap();

        assert_eq!(pool.recycled_len(), 2);
        assert_eq!(fake.stats().command_buffers_freed, 3);
        drop(pool);
        assert_eq!(fake.stats().pools_destroyed, 1);
        assert!(fake.stats().violations.is_empty());
    }
}
