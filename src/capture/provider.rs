use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{CaptureRef, TaskId};

/// Failure of a single capture request. Never fatal to tracking.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CaptureError {
    #[error("screen capture permission denied")]
    PermissionDenied,
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("capture upload failed: {0}")]
    UploadFailed(String),
    #[error("capture did not complete within {0}s")]
    TimedOut(u64),
}

/// Obtains one still frame, uploads it and returns a stable reference.
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    async fn request_capture(
        &self,
        task_id: &TaskId,
        session_id: Uuid,
    ) -> Result<CaptureRef, CaptureError>;
}
