use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::{
    AllocationError, MemoryLocation,
    vulkan::{
        Allocation, AllocationCreateDesc, AllocationScheme, Allocator,
        AllocatorCreateDesc,
    },
};
use thiserror::Error;

use crate::capability::{OpKind, QueueSurvey, survey_queue_families};
use crate::config::SchedulerConfig;
use crate::driver::Driver;
use crate::error::ConfigurationError;
use crate::instance::{
    FetchPhysicalDeviceError, Instance, SurfaceSupportError, VkVersion,
};
use crate::priority::OperationPriorityMap;
use crate::queue_pool::{QueueSlot, plan_queue_slots};

/// Which physical device [`Device::create_headless`] should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    /// The highest scoring adapter that serves every required kind.
    #[default]
    Best,
    /// The adapter at this position in enumeration order.
    Index(usize),
}

/// Intended access pattern of an allocation.
#[derive(Copy, Clone, Debug)]
pub enum MemoryUsage {
    /// GPU-only storage. Not CPU-mappable.
    GpuOnly,
    /// CPU-written, GPU-read.
    CpuToGpu,
    /// GPU-written, CPU-read.
    GpuToCpu,
}

impl From<MemoryUsage> for MemoryLocation {
    fn from(value: MemoryUsage) -> Self {
        match value {
            MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
            MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
            MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
        }
    }
}

#[derive(Debug, Error)]
pub enum CreateDeviceError {
    #[error(transparent)]
    Fetch(#[from] FetchPhysicalDeviceError),

    #[error("No physical device serves every required operation kind")]
    NoSuitableDevice,

    #[error("Physical device index {index} is out of range ({count} available)")]
    NoSuchDevice { index: usize, count: usize },

    #[error("Selected physical device cannot be used: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Failed to create logical device: {0}")]
    DeviceCreationFailed(vk::Result),

    #[error("Failed to create GPU allocator: {0}")]
    AllocatorCreation(AllocationError),
}

struct Candidate {
    handle: vk::PhysicalDevice,
    props: vk::PhysicalDeviceProperties,
    survey: QueueSurvey,
    priorities: OperationPriorityMap,
    /// (dedicated families, device type priority), compared
    /// lexicographically.
    score: (u32, u32),
}

fn device_type_priority(ty: vk::PhysicalDeviceType) -> u32 {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
        _ => 0,
    }
}

/// Number of non-graphics kinds served by some family without graphics.
fn dedicated_family_count(survey: &QueueSurvey) -> u32 {
    [OpKind::Transfer, OpKind::Compute]
        .into_iter()
        .filter(|&kind| {
            survey.families().iter().any(|f| {
                f.queue_count() > 0
                    && f.capabilities().supports(kind)
                    && !f.capabilities().supports(OpKind::Graphics)
            })
        })
        .count() as u32
}

fn evaluate(
    instance: &Instance,
    handle: vk::PhysicalDevice,
    config: &SchedulerConfig,
) -> Result<Candidate, ConfigurationError> {
    // SAFETY: handle was enumerated from instance.
    let props = unsafe { instance.get_raw_physical_device_properties(handle) };
    // SAFETY: handle was enumerated from instance.
    let families =
        unsafe { instance.get_raw_physical_device_queue_family_properties(handle) };
    let survey = survey_queue_families(&families)?;
    let priorities = OperationPriorityMap::resolve(&survey, &config.preference);
    for &kind in &config.required_kinds {
        priorities.lookup(kind)?;
    }
    let score = (
        dedicated_family_count(&survey),
        device_type_priority(props.device_type),
    );
    Ok(Candidate {
        handle,
        props,
        survey,
        priorities,
        score,
    })
}

/// A logical device created for the scheduler.
pub struct Device {
    parent: Arc<Instance>,
    allocator: Option<Mutex<Allocator>>,
    handle: ash::Device,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    survey: QueueSurvey,
    queue_slots: Vec<QueueSlot>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .field("queue_slots", &self.queue_slots)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        // The allocator frees its memory blocks, so it must go first.
        self.allocator = None;
        // SAFETY: Every object derived from this device holds an Arc to it,
        // so none remain.
        unsafe { self.handle.destroy_device(None) };
    }
}

impl Device {
    /// Pick a physical device and create a logical device with the queues
    /// a scheduler built from `config` will use.
    pub fn create_headless(
        instance: &Arc<Instance>,
        config: &SchedulerConfig,
        selector: DeviceSelector,
    ) -> Result<Arc<Self>, CreateDeviceError> {
        let physical_devices = instance.fetch_raw_physical_devices()?;

        let best = match selector {
            DeviceSelector::Index(index) => {
                let &handle = physical_devices.get(index).ok_or(
                    CreateDeviceError::NoSuchDevice {
                        index,
                        count: physical_devices.len(),
                    },
                )?;
                evaluate(instance, handle, config)?
            }
            DeviceSelector::Best => physical_devices
                .iter()
                .filter_map(|&handle| match evaluate(instance, handle, config) {
                    Ok(candidate) => Some(candidate),
                    Err(e) => {
                        tracing::debug!("Skipping physical device {handle:?}: {e}");
                        None
                    }
                })
                .max_by_key(|c| c.score)
                .ok_or(CreateDeviceError::NoSuitableDevice)?,
        };

        tracing::info!(
            "Selected physical device: {:?} (type: {:?}, api: {}, dedicated \
             families: {})",
            best.props.device_name_as_c_str().unwrap_or(c"unknown"),
            best.props.device_type,
            VkVersion::from_raw(best.props.api_version),
            best.score.0,
        );

        let queue_slots =
            plan_queue_slots(&best.priorities, &best.survey, config.queues_per_family)?;
        let mut per_family: BTreeMap<u32, u32> = BTreeMap::new();
        for slot in &queue_slots {
            let count = per_family.entry(slot.family).or_default();
            *count = (*count).max(slot.index + 1);
        }
        tracing::info!("Requesting queues per family: {per_family:?}");

        let priorities: Vec<Vec<f32>> = per_family
            .values()
            .map(|&count| vec![1.0; count as usize])
            .collect();
        let queue_create_infos: Vec<_> = per_family
            .keys()
            .zip(&priorities)
            .map(|(&family, priorities)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(priorities)
            })
            .collect();
        let create_info =
            vk::DeviceCreateInfo::default().queue_create_infos(&queue_create_infos);

        // SAFETY: The physical device came from this instance and the create
        // info only points at locals that outlive the call.
        let handle = unsafe { instance.create_ash_device(best.handle, &create_info) }
            .map_err(CreateDeviceError::DeviceCreationFailed)?;

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.ash_instance().clone(),
            device: handle.clone(),
            physical_device: best.handle,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                // SAFETY: Nothing has been created from the device yet.
                unsafe { handle.destroy_device(None) };
                return Err(CreateDeviceError::AllocatorCreation(e));
            }
        };

        Ok(Arc::new(Self {
            parent: Arc::clone(instance),
            allocator: Some(Mutex::new(allocator)),
            handle,
            physical_device: best.handle,
            properties: best.props,
            survey: best.survey,
            queue_slots,
        }))
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn queue_survey(&self) -> &QueueSurvey {
        &self.survey
    }

    /// The queues the device was created with.
    pub fn queue_slots(&self) -> &[QueueSlot] {
        &self.queue_slots
    }

    /// Distinct queue families the device was created with, ascending.
    pub fn queue_families(&self) -> Vec<u32> {
        let mut families: Vec<_> = self.queue_slots.iter().map(|s| s.family).collect();
        families.dedup();
        families
    }

    pub fn ash_device(&self) -> &ash::Device {
        &self.handle
    }

    pub fn raw_device(&self) -> vk::Device {
        self.handle.handle()
    }

    /// Whether `family` can present to `surface`.
    ///
    /// The answer is probed once and cached per family, so only one surface
    /// should ever be asked about.
    ///
    /// # Safety
    /// `surface` must come from this device's instance.
    pub unsafe fn family_supports_present(
        &self,
        family: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool, SurfaceSupportError> {
        let Some(descriptor) = self.survey.family(family) else {
            return Ok(false);
        };
        if let Some(known) = descriptor.known_present_support() {
            return Ok(known);
        }
        let mut error = None;
        let supported = descriptor.supports_present(|index| {
            // SAFETY: Caller guarantees surface provenance; the physical
            // device is ours.
            match unsafe {
                self.parent.get_raw_physical_device_surface_support(
                    self.physical_device,
                    index,
                    surface,
                )
            } {
                Ok(supported) => supported,
                Err(e) => {
                    error = Some(e);
                    false
                }
            }
        });
        match error {
            Some(e) => Err(e),
            None => Ok(supported),
        }
    }

    /// Allocate memory for `requirements` with gpu-allocator.
    pub fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
    ) -> Result<Allocation, AllocationError> {
        let mut allocator = self
            .allocator
            .as_ref()
            .expect("allocator is dropped only during Device::drop")
            .lock()
            .expect("allocator lock poisoned");
        allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: usage.into(),
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
    }

    pub fn free_memory(&self, allocation: Allocation) -> Result<(), AllocationError> {
        let mut allocator = self
            .allocator
            .as_ref()
            .expect("allocator is dropped only during Device::drop")
            .lock()
            .expect("allocator lock poisoned");
        allocator.free(allocation)
    }
}

// Buffer functionality
impl Device {
    /// # Safety
    /// `create_info` must be valid and everything it points to must outlive
    /// the call.
    pub unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    /// # Safety
    /// `buffer` must come from this device and no pending work may use it.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: Caller guarantees provenance and that the GPU is done.
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// # Safety
    /// `buffer` must come from this device.
    pub unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: Caller guarantees provenance.
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `buffer` and `memory` must come from this device, the buffer must
    /// not be bound yet, and `offset` must satisfy its requirements.
    pub unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees provenance and offset constraints.
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }
}

// Command recording functionality
impl Device {
    /// # Safety
    /// `command_buffer` must be recording, `buffer` must have been created
    /// with `TRANSFER_DST`, and `offset` and `size` must be multiples of 4
    /// within the buffer.
    pub unsafe fn cmd_fill_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    ) {
        // SAFETY: Caller guarantees recording state and range validity.
        unsafe {
            self.handle
                .cmd_fill_buffer(command_buffer, buffer, offset, size, data)
        };
    }

    /// # Safety
    /// `command_buffer` must be recording and every barrier must reference
    /// objects from this device.
    pub unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
    ) {
        // SAFETY: Caller guarantees recording state and barrier validity.
        unsafe {
            self.handle.cmd_pipeline_barrier(
                command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                buffer_barriers,
                &[],
            )
        };
    }
}

impl Driver for Device {
    fn has_queue(&self, slot: QueueSlot) -> bool {
        self.queue_slots.contains(&slot)
    }

    unsafe fn get_raw_queue(&self, family: u32, index: u32) -> vk::Queue {
        debug_assert!(
            self.queue_slots.contains(&QueueSlot { family, index }),
            "queue {family}.{index} was not requested at device creation"
        );
        // SAFETY: Caller guarantees the queue was requested.
        unsafe { self.handle.get_device_queue(family, index) }
    }

    unsafe fn create_raw_command_pool(
        &self,
        family: u32,
    ) -> Result<vk::CommandPool, vk::Result> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family);
        // SAFETY: Caller guarantees family validity.
        unsafe { self.handle.create_command_pool(&create_info, None) }
    }

    unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: Caller guarantees provenance and that no buffer is pending.
        unsafe { self.handle.destroy_command_pool(pool, None) };
    }

    unsafe fn allocate_raw_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> Result<vk::CommandBuffer, vk::Result> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: Caller guarantees pool provenance and synchronization.
        let buffers = unsafe { self.handle.allocate_command_buffers(&allocate_info) }?;
        buffers
            .first()
            .copied()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        buffers: &[vk::CommandBuffer],
    ) {
        if buffers.is_empty() {
            return;
        }
        // SAFETY: Caller guarantees provenance, idleness and pool
        // synchronization.
        unsafe { self.handle.free_command_buffers(pool, buffers) };
    }

    unsafe fn reset_raw_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the buffer is not pending and its pool is
        // synchronized. Pools are created with RESET_COMMAND_BUFFER.
        unsafe {
            self.handle
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    unsafe fn begin_raw_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: Caller guarantees the buffer is in the initial state.
        unsafe { self.handle.begin_command_buffer(buffer, &begin_info) }
    }

    unsafe fn end_raw_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the buffer is recording.
        unsafe { self.handle.end_command_buffer(buffer) }
    }

    unsafe fn create_raw_fence(&self, signaled: bool) -> Result<vk::Fence, vk::Result> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: The create info is complete.
        unsafe { self.handle.create_fence(&create_info, None) }
    }

    unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: Caller guarantees provenance and that it is not pending.
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    unsafe fn wait_for_raw_fence(
        &self,
        fence: vk::Fence,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees provenance.
        unsafe { self.handle.wait_for_fences(&[fence], true, timeout_ns) }
    }

    unsafe fn reset_raw_fence(&self, fence: vk::Fence) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees provenance and that it is not pending.
        unsafe { self.handle.reset_fences(&[fence]) }
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees handle provenance, buffer state and
        // holds the gateway's submit lock.
        unsafe { self.handle.queue_submit(queue, submits, fence) }
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees provenance and holds the queue-idle lock.
        unsafe { self.handle.queue_wait_idle(queue) }
    }

    unsafe fn device_wait_idle(&self) -> Result<(), vk::Result> {
        // SAFETY: Caller holds the device-idle lock.
        unsafe { self.handle.device_wait_idle() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn survey(families: &[(vk::QueueFlags, u32)]) -> QueueSurvey {
        let props: Vec<_> = families
            .iter()
            .map(|&(flags, count)| vk::QueueFamilyProperties {
                queue_flags: flags,
                queue_count: count,
                ..Default::default()
            })
            .collect();
        survey_queue_families(&props).unwrap()
    }

    #[test]
    fn dedicated_families_outrank_device_type() {
        let unified = survey(&[(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            16,
        )]);
        let split = survey(&[
            (vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
            (vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 2),
            (vk::QueueFlags::TRANSFER, 1),
        ]);
        let empty_transfer = survey(&[
            (vk::QueueFlags::GRAPHICS, 1),
            (vk::QueueFlags::TRANSFER, 0),
        ]);
        assert_eq!(dedicated_family_count(&unified), 0);
        assert_eq!(dedicated_family_count(&split), 2);
        assert_eq!(dedicated_family_count(&empty_transfer), 0);

        let integrated_split = (
            dedicated_family_count(&split),
            device_type_priority(vk::PhysicalDeviceType::INTEGRATED_GPU),
        );
        let discrete_unified = (
            dedicated_family_count(&unified),
            device_type_priority(vk::PhysicalDeviceType::DISCRETE_GPU),
        );
        assert!(integrated_split > discrete_unified);
        assert_eq!(device_type_priority(vk::PhysicalDeviceType::CPU), 0);
    }
}
