//! Serialized access to `vkQueueSubmit`, `vkQueueWaitIdle` and
//! `vkDeviceWaitIdle`, which some drivers do not allow to run concurrently.
//! Every scheduler talking to one driver must share one gateway.

use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use ash::vk;

use crate::driver::Driver;

#[derive(Debug, Default)]
pub struct SubmissionGateway {
    submit: Mutex<()>,
    queue_idle: Mutex<()>,
    device_idle: Mutex<()>,
}

static GLOBAL: LazyLock<Arc<SubmissionGateway>> =
    LazyLock::new(|| Arc::new(SubmissionGateway::new()));

// The guarded value is `()`, so a poisoned lock carries no broken state.
fn lock(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SubmissionGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide gateway.
    pub fn global() -> Arc<SubmissionGateway> {
        Arc::clone(&GLOBAL)
    }

    /// `vkQueueSubmit` under the submit lock.
    ///
    /// # Safety
    /// Same contract as [`Driver::queue_submit`].
    pub unsafe fn queue_submit(
        &self,
        driver: &dyn Driver,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let _guard = lock(&self.submit);
        // SAFETY: Caller upholds the submit contract; the lock provides the
        // required serialization.
        unsafe { driver.queue_submit(queue, submits, fence) }
    }

    /// `vkQueueWaitIdle` under the queue-idle lock.
    ///
    /// # Safety
    /// `queue` must come from `driver`.
    pub unsafe fn queue_wait_idle(
        &self,
        driver: &dyn Driver,
        queue: vk::Queue,
    ) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("queue_wait_idle").entered();
        let _guard = lock(&self.queue_idle);
        // SAFETY: Caller guarantees queue provenance; the lock provides the
        // required serialization.
        unsafe { driver.queue_wait_idle(queue) }
    }

    /// `vkDeviceWaitIdle` under the device-idle lock.
    pub fn device_wait_idle(&self, driver: &dyn Driver) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        let _guard = lock(&self.device_idle);
        // SAFETY: The driver keeps its device alive for its own lifetime and
        // the lock provides the required serialization.
        unsafe { driver.device_wait_idle() }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::FakeDriver;

    #[test]
    fn submits_never_overlap() {
        let driver = FakeDriver::builder()
            .families(&[(vk::QueueFlags::GRAPHICS, 4)])
            .submit_latency(Duration::from_micros(200))
            .build();
        let gateway = SubmissionGateway::new();

        std::thread::scope(|s| {
            for index in 0..4 {
                let driver = &driver;
                let gateway = &gateway;
                s.spawn(move || {
                    // SAFETY: the fake creates every queue it advertises.
                    let queue = unsafe { driver.get_raw_queue(0, index) };
                    for _ in 0..25 {
                        // SAFETY: an empty submission with a null fence is
                        // always valid.
                        unsafe {
                            gateway.queue_submit(
                                driver,
                                queue,
                                &[],
                                vk::Fence::null(),
                            )
                        }
                        .unwrap();
                    }
                });
            }
        });

        assert_eq!(driver.stats().submit_calls, 100);
        assert_eq!(driver.stats().max_concurrent_submits, 1);
    }

    #[test]
    fn global_gateway_is_shared() {
        assert!(Arc::ptr_eq(
            &SubmissionGateway::global(),
            &SubmissionGateway::global()
        ));
    }
}
