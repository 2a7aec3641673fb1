pub mod client;
pub mod config;
pub mod queue;
pub mod thumbnail;

pub use client::{
    Candidate, FocusMode, HttpSegmentClient, ProcessingMode, RemoteError, SegmentClient,
    SegmentParams, SegmentRequest, SegmentResult, Upload,
};
pub use config::{Milestone, QueueConfig};
pub use queue::Queue;
pub use queue::classify::classify_error;
pub use queue::types::{
    InputFile, QueueError, QueueState, StatusCounts, Task, TaskId, TaskStatus, ViewState,
};
