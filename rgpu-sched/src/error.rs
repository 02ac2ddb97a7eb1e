//! Error taxonomy of the scheduler.
//!
//! Construction-time failures are returned as `Result`s. Failures detected
//! on a background thread (a worker loop or a task thread) cannot be handed
//! back to anyone and go through [`fatal`], which logs and aborts.

use std::time::Duration;

use ash::vk;
use thiserror::Error;

use crate::capability::OpKind;
use crate::task::{Stage, Task, TaskId};

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Physical device exposes no queue families")]
    NoQueueFamilies,

    #[error("No queue family supports {0} operations")]
    NoFamilyForKind(OpKind),

    #[error("queues_per_family must be at least 1")]
    ZeroQueuesPerFamily,

    #[error("Queue {index} of family {family} was not created with the device")]
    QueueNotCreated { family: u32, index: u32 },
}

/// A stage-ordering or ownership rule of the task protocol was broken.
///
/// These always indicate a scheduler bug, never a driver condition.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error(
        "Task {task} was handed command buffer {offered:?} while still \
         holding {held:?}"
    )]
    BufferAlreadyHeld {
        task: TaskId,
        held: vk::CommandBuffer,
        offered: vk::CommandBuffer,
    },

    #[error("Task {task} was asked to return a command buffer but holds none")]
    NoBufferHeld { task: TaskId },

    #[error("Task {task} cannot move from {from:?} to {to:?}")]
    StageOrder { task: TaskId, from: Stage, to: Stage },

    #[error("Task {task} is not idle (stage {stage:?})")]
    TaskNotIdle { task: TaskId, stage: Stage },
}

/// Error reported by a submission callback.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("vkQueueSubmit failed: {0}")]
    Vulkan(vk::Result),

    #[error("Submission callback failed: {0}")]
    Callback(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    ProtocolViolation(#[from] ProtocolViolation),

    #[error("Fence {fence:?} of task {task} did not signal within {timeout:?}")]
    Timeout {
        task: TaskId,
        fence: vk::Fence,
        timeout: Duration,
    },

    #[error("Submission of task {task} to queue {queue:?} failed: {source}")]
    Submission {
        task: TaskId,
        queue: vk::Queue,
        #[source]
        source: SubmitError,
    },

    #[error("Vulkan error during {stage}: {result}")]
    Driver {
        stage: &'static str,
        result: vk::Result,
    },

    #[error("The {callback} callback of task {task} panicked")]
    CallbackPanicked {
        task: TaskId,
        callback: &'static str,
    },

    #[error("Failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl SchedulerError {
    pub(crate) fn driver(stage: &'static str, result: vk::Result) -> Self {
        SchedulerError::Driver { stage, result }
    }
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("Worker queue has been shut down")]
    ShutDown,

    #[error("Task {task} cannot be enqueued from stage {stage:?}")]
    NotIdle { task: TaskId, stage: Stage },

    #[error("No worker at rank {rank} serves {kind} operations")]
    NoWorker { kind: OpKind, rank: usize },
}

/// A refused enqueue. Carries the task back so it can be retried or pooled.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct EnqueueRejected {
    pub error: EnqueueError,
    pub task: Task,
}

impl EnqueueRejected {
    pub fn into_task(self) -> Task {
        self.task
    }
}

/// Log `err` and terminate the process.
///
/// Used where a failure leaves the pipeline in a state nothing in this
/// layer can repair: lost devices, exhausted memory mid-submission, broken
/// stage ordering.
#[cold]
pub(crate) fn fatal(err: SchedulerError) -> ! {
    tracing::error!("Fatal scheduler error: {err}");
    eprintln!("rgpu-sched: fatal: {err}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_handle() {
        let err = SchedulerError::Timeout {
            task: TaskId::from_raw(7),
            fence: vk::Fence::null(),
            timeout: Duration::from_secs(10),
        };
        let msg = err.to_string();
        assert!(msg.contains("task #7"), "{msg}");
        assert!(msg.contains("10s"), "{msg}");

        let err: SchedulerError =
            ConfigurationError::NoFamilyForKind(OpKind::Compute).into();
        assert_eq!(err.to_string(), "No queue family supports compute operations");
    }
}
