//! Queue configuration.

use std::time::Duration;

use crate::client::SegmentParams;
use crate::queue::types::TaskStatus;

/// Default number of simultaneously active tasks.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Hard deadline for one remote segmentation call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Largest file accepted at submission (matches the server's limit).
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 20 * 1024 * 1024;

/// A synthetic progress step applied while a remote call is in flight.
///
/// Milestones hide latency; they are not measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Milestone {
    /// Delay after admission.
    pub after: Duration,
    pub status: TaskStatus,
    pub progress: u8,
}

/// Configuration passed to [`Queue::new`](crate::queue::Queue::new).
///
/// All fields have sensible defaults via [`Default`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of tasks uploading or processing at once.  Defaults to `3`.
    pub concurrency: usize,
    /// Per-dispatch deadline.  Defaults to 120 s.
    pub request_timeout: Duration,
    /// Cosmetic progress steps, applied in order.
    pub milestones: Vec<Milestone>,
    /// Longest edge of generated thumbnails, in pixels.
    pub thumbnail_size: u32,
    /// Files above this size are rejected at submission.  `None` disables
    /// the check.
    pub max_upload_bytes: Option<u64>,
    /// Parameters given to newly submitted tasks.
    pub default_params: SegmentParams,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            milestones: vec![
                Milestone {
                    after: Duration::from_millis(600),
                    status: TaskStatus::Processing,
                    progress: 60,
                },
                Milestone {
                    after: Duration::from_millis(1400),
                    status: TaskStatus::Processing,
                    progress: 85,
                },
            ],
            thumbnail_size: 160,
            max_upload_bytes: Some(DEFAULT_MAX_UPLOAD_BYTES),
            default_params: SegmentParams::default(),
        }
    }
}
