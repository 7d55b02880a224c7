//! Two-queue task scheduling
//!
//! Background tasks run FIFO on one dedicated worker thread. Upload tasks are
//! only ever executed by the render thread, one at a time, when it calls
//! [`UploadQueue::upload_one`] with its [`RenderContextToken`].

pub mod scheduler;
pub mod token;

pub use scheduler::{
    BackgroundQueue, BackgroundTask, EmptyHandler, SchedulerStats, TaskScheduler, UploadQueue, UploadTask,
};
pub use token::RenderContextToken;
