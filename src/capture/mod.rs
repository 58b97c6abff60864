pub mod phash;
pub mod provider;
pub mod snapshot;

pub use provider::{CaptureError, CaptureProvider};
pub use snapshot::{FrameGrabber, ImageFileGrabber, LocalBlobStore, SnapshotCaptureProvider};
