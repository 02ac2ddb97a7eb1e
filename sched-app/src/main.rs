#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

use std::{
    fs::{self, File},
    sync::Arc,
    time::{Duration, Instant},
};

use clap::Parser;
use eyre::eyre;
use rgpu_sched::{
    Device, DeviceSelector, Instance, MemoryUsage, OpKind, QueueSlot, Scheduler,
    SchedulerConfig, TaskHandle, VulkanLogLevel, WaitStatus, ash::vk,
    task::TaskId,
};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// 32-bit words each task fills.
const WORDS_PER_TASK: u64 = 4096;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    Info,
    Debug,
    Warn,
    #[default]
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            //We clamp this to the lowest possible level but this shouldn't happen
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        match value {
            CliVulkanLogLevel::Verbose => VulkanLogLevel::Verbose,
            CliVulkanLogLevel::Info => VulkanLogLevel::Info,
            CliVulkanLogLevel::Warning => VulkanLogLevel::Warning,
            CliVulkanLogLevel::Error => VulkanLogLevel::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliOpKind {
    Graphics,
    Compute,
    Transfer,
}

impl From<CliOpKind> for OpKind {
    fn from(value: CliOpKind) -> Self {
        match value {
            CliOpKind::Graphics => OpKind::Graphics,
            CliOpKind::Compute => OpKind::Compute,
            CliOpKind::Transfer => OpKind::Transfer,
        }
    }
}

#[derive(clap::Parser, Debug)]
struct CliArgs {
    #[arg(short, long, default_value = "error")]
    tracing_log_level: TracingLogLevel,
    #[arg(short, long)]
    graphics_debug_level: Option<CliVulkanLogLevel>,
    /// Tasks submitted per round, cycling transfer, graphics, compute.
    #[arg(long, default_value_t = 12)]
    tasks: u32,
    /// How many times the same tasks are re-enqueued.
    #[arg(long, default_value_t = 3)]
    rounds: u32,
    #[arg(long, default_value_t = 1)]
    queues_per_family: u32,
    /// How long a task waits on its fence before the device counts as lost.
    #[arg(long, default_value_t = 10_000)]
    fence_timeout_ms: u64,
    /// Tie-break order between operation kinds, most preferred first.
    #[arg(long, value_delimiter = ',')]
    preference: Vec<CliOpKind>,
    /// Physical device index. Picks the best one when omitted.
    #[arg(long)]
    device: Option<usize>,
}

const KIND_CYCLE: [OpKind; 3] = [OpKind::Transfer, OpKind::Graphics, OpKind::Compute];

fn fill_value(round: u32, task: u32) -> u32 {
    0xC0DE_0000 ^ (round << 12) ^ task
}

/// A host-visible buffer the tasks fill slice by slice.
struct TargetBuffer {
    device: Arc<Device>,
    buffer: vk::Buffer,
    allocation: Option<rgpu_sched::gpu_allocator::vulkan::Allocation>,
}

impl TargetBuffer {
    fn new(device: &Arc<Device>, words: u64) -> eyre::Result<Self> {
        let families = device.queue_families();
        let create_info = vk::BufferCreateInfo::default()
            .size(words * 4)
            .usage(vk::BufferUsageFlags::TRANSFER_DST);
        let create_info = if families.len() > 1 {
            create_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            create_info.sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        // SAFETY: create_info and the family list outlive the call.
        let buffer = unsafe { device.create_raw_buffer(&create_info) }?;
        // SAFETY: buffer was just created from this device.
        let requirements = unsafe { device.get_raw_buffer_memory_requirements(buffer) };
        let mut target = Self {
            device: Arc::clone(device),
            buffer,
            allocation: None,
        };
        let allocation = device.allocate_memory(
            "sched-app fill target",
            requirements,
            MemoryUsage::GpuToCpu,
            true,
        )?;
        // SAFETY: The memory handle is only used to bind this buffer while the
        // allocation is kept alive in `target`.
        let (memory, offset) = (unsafe { allocation.memory() }, allocation.offset());
        target.allocation = Some(allocation);
        // SAFETY: The allocation satisfies the buffer's requirements and the
        // buffer is unbound.
        unsafe { device.bind_raw_buffer_memory(buffer, memory, offset) }?;
        Ok(target)
    }

    fn words(&self) -> eyre::Result<&[u32]> {
        let bytes = self
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .ok_or_else(|| eyre!("fill target is not host mapped"))?;
        bytemuck::try_cast_slice(bytes).map_err(|e| eyre!("fill target mapping: {e}"))
    }
}

impl Drop for TargetBuffer {
    fn drop(&mut self) {
        // SAFETY: The scheduler is shut down before this drops, so the GPU no
        // longer uses the buffer.
        unsafe { self.device.destroy_raw_buffer(self.buffer) };
        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.device.free_memory(allocation)
        {
            tracing::error!("Failed to free fill target memory: {e}");
        }
    }
}

struct Outcome {
    task: TaskId,
    kind: OpKind,
    slot: QueueSlot,
    elapsed: Duration,
}

fn run_round(
    scheduler: &Scheduler,
    device: &Arc<Device>,
    target: &TargetBuffer,
    round: u32,
    tasks: u32,
) -> eyre::Result<Vec<Outcome>> {
    let _span = tracing::info_span!("round", round).entered();
    let started = Instant::now();

    let mut handles: Vec<TaskHandle> = Vec::with_capacity(tasks as usize);
    for i in 0..tasks {
        let kind = KIND_CYCLE[i as usize % KIND_CYCLE.len()];
        let mut task = scheduler.task(kind)?;

        let device = Arc::clone(device);
        let buffer = target.buffer;
        let offset = u64::from(i) * WORDS_PER_TASK * 4;
        let value = fill_value(round, i);
        task.set_recorder(move |ctx| {
            let cb = ctx.raw_command_buffer();
            let barrier = vk::BufferMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::HOST_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(buffer)
                .offset(offset)
                .size(WORDS_PER_TASK * 4);
            // SAFETY: The buffer is recording, the range lies in a
            // TRANSFER_DST buffer created from this device, and each task
            // writes a disjoint slice.
            unsafe {
                device.cmd_fill_buffer(cb, buffer, offset, WORDS_PER_TASK * 4, value);
                device.cmd_pipeline_barrier(
                    cb,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::HOST,
                    std::slice::from_ref(&barrier),
                );
            }
        });
        task.set_completion(move || {
            tracing::trace!("{kind} fill {i} of round {round} landed");
        });
        handles.push(scheduler.enqueue(task)?);
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        let status = handle.wait_responsively();
        if status != WaitStatus::Finished {
            return Err(eyre!("task {} ended with {status:?}", handle.id()));
        }
        outcomes.push(Outcome {
            task: handle.id(),
            kind: handle.op_kind(),
            slot: handle.slot(),
            elapsed: started.elapsed(),
        });
        scheduler.reclaim(handle)?;
    }

    let words = target.words()?;
    for (i, chunk) in words.chunks(WORDS_PER_TASK as usize).enumerate() {
        let expected = fill_value(round, i as u32);
        if let Some(pos) = chunk.iter().position(|&w| w != expected) {
            return Err(eyre!(
                "round {round}, task {i}: word {pos} is {:#010x}, expected {expected:#010x}",
                chunk[pos]
            ));
        }
    }
    tracing::info!("Round {round} verified in {:?}", started.elapsed());
    Ok(outcomes)
}

fn main() -> eyre::Result<()> {
    let app_dirs = directories::ProjectDirs::from("", "rgpu", "sched-app");

    let log_dir = match app_dirs
        .as_ref()
        .and_then(|x| x.runtime_dir().or_else(|| Some(x.data_dir())))
        .map(|p| p.to_owned())
    {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    let cli_args = CliArgs::parse();

    if cli_args.tracing_log_level != TracingLogLevel::Off {
        fs::create_dir_all(&log_dir)?;

        let mut log_file_path = log_dir.clone();
        log_file_path.push("log-file");
        log_file_path.set_extension("txt");
        let log_file = File::create(&log_file_path)?;
        let file_log = tracing_subscriber::fmt::layer()
            .with_writer(log_file)
            .with_ansi(false);

        println!("log_file_path: {}", log_file_path.display());
        println!("cli_args: {:#?}", cli_args);

        let stdout_log = tracing_subscriber::fmt::layer().pretty();

        tracing_subscriber::registry()
            .with(
                stdout_log
                    .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                        cli_args.tracing_log_level.into(),
                    ))
                    .and_then(file_log),
            )
            .init();
    }

    if cli_args.tasks == 0 {
        return Err(eyre!("--tasks must be at least 1"));
    }

    let mut config = SchedulerConfig {
        queues_per_family: cli_args.queues_per_family,
        fence_timeout: Duration::from_millis(cli_args.fence_timeout_ms),
        ..SchedulerConfig::default()
    };
    if !cli_args.preference.is_empty() {
        config.preference = cli_args.preference.iter().copied().map(Into::into).collect();
    }

    //SAFETY: Loads vulkan via libloading which is kinda unsafe but we're fine
    let instance = Arc::new(unsafe {
        Instance::new(
            "sched-app",
            cli_args.graphics_debug_level.map(Into::into),
            &[],
        )
    }?);

    let selector = match cli_args.device {
        Some(index) => DeviceSelector::Index(index),
        None => DeviceSelector::Best,
    };
    let device = Device::create_headless(&instance, &config, selector)?;

    let mut scheduler = Scheduler::for_device(&device, &config)?;
    for kind in OpKind::ALL {
        println!(
            "{kind:>8}: families {:?}",
            scheduler.priorities().families(kind)
        );
    }

    let target = TargetBuffer::new(&device, u64::from(cli_args.tasks) * WORDS_PER_TASK)?;

    let started = Instant::now();
    let mut outcomes = Vec::new();
    for round in 0..cli_args.rounds {
        outcomes.extend(run_round(
            &scheduler,
            &device,
            &target,
            round,
            cli_args.tasks,
        )?);
    }
    let total = started.elapsed();

    for outcome in &outcomes {
        println!(
            "task {:>4} {:>8} on queue {}.{} finished after {:?}",
            outcome.task.to_string(),
            outcome.kind,
            outcome.slot.family,
            outcome.slot.index,
            outcome.elapsed
        );
    }
    println!(
        "{} submissions over {} round(s) in {total:?}",
        outcomes.len(),
        cli_args.rounds
    );

    scheduler.wait_idle()?;
    scheduler.shutdown();
    drop(target);
    Ok(())
}
