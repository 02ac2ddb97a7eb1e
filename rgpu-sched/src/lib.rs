//! Multi-queue command submission scheduler built on [`ash`].
//!
//! > **Personal project.** This crate is not intended for general use
//! > and makes no API stability guarantees.
//!
//! # Pipeline
//!
//! ```text
//! Instance ─► Device ─► QueueSurvey ─► OperationPriorityMap
//!                                              │
//!                                              ▼
//!                    Scheduler ──► QueuePool ──► WorkerQueue (per queue slot)
//!                        │                         ├── alloc/free thread
//!                        │                         └── submit thread
//!                        └──► TaskPool ──► Task (per in-flight submission)
//!                                            ├── record thread
//!                                            └── running thread
//! ```
//!
//! A [`Task`](task::Task) walks through five stages (`Alloc → Record →
//! Submit → Running → Finished`). Each stage is owned by exactly one thread,
//! so a command buffer is never touched by two threads at once, and every
//! `vkQueueSubmit` goes through the [`SubmissionGateway`](gateway::SubmissionGateway).
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |
//! | `ash_*` | returns the `ash` wrapper object          |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod capability;
pub mod command;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod gateway;
pub mod instance;
pub mod priority;
pub mod queue_pool;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod task_pool;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use ash;
pub use gpu_allocator;

pub use capability::{OpKind, OpKindSet, QueueFamilyDescriptor, QueueSurvey};
pub use config::SchedulerConfig;
pub use device::{Device, DeviceSelector, MemoryUsage};
pub use error::{EnqueueRejected, SchedulerError};
pub use instance::{Instance, VulkanLogLevel};
pub use queue_pool::QueueSlot;
pub use scheduler::Scheduler;
pub use task::{Stage, Task, TaskHandle, WaitStatus};
