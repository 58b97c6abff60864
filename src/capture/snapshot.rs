use std::{
    fs,
    io::{self, Cursor},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat};
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::{CaptureRef, TaskId};

use super::phash::compute_phash;
use super::provider::{CaptureError, CaptureProvider};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Blocking source of still frames. Called from a blocking worker thread.
pub trait FrameGrabber: Send + Sync + 'static {
    fn grab_frame(&self) -> Result<DynamicImage, CaptureError>;
}

/// Reads the most recent screen snapshot an OS-level tool keeps refreshed at
/// a well-known path.
#[derive(Debug, Clone)]
pub struct ImageFileGrabber {
    path: PathBuf,
}

impl ImageFileGrabber {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FrameGrabber for ImageFileGrabber {
    fn grab_frame(&self) -> Result<DynamicImage, CaptureError> {
        let bytes = fs::read(&self.path).map_err(|err| match err.kind() {
            io::ErrorKind::PermissionDenied => CaptureError::PermissionDenied,
            _ => CaptureError::DeviceUnavailable(format!(
                "cannot read snapshot {}: {err}",
                self.path.display()
            )),
        })?;

        image::load_from_memory(&bytes).map_err(|err| {
            CaptureError::DeviceUnavailable(format!(
                "snapshot {} is not a readable image: {err}",
                self.path.display()
            ))
        })
    }
}

/// Directory-backed blob storage returning `file://` URLs.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create blob directory {}", parent.display()))?;
        }
        fs::write(&path, bytes)
            .with_context(|| format!("failed to write blob {}", path.display()))?;

        let absolute = fs::canonicalize(&path)
            .with_context(|| format!("failed to resolve blob path {}", path.display()))?;
        Ok(format!("file://{}", absolute.display()))
    }
}

pub struct SnapshotCaptureProvider {
    grabber: Arc<dyn FrameGrabber>,
    blobs: Arc<LocalBlobStore>,
}

impl SnapshotCaptureProvider {
    pub fn new(grabber: impl FrameGrabber, blobs: LocalBlobStore) -> Self {
        Self {
            grabber: Arc::new(grabber),
            blobs: Arc::new(blobs),
        }
    }
}

#[async_trait]
impl CaptureProvider for SnapshotCaptureProvider {
    async fn request_capture(
        &self,
        task_id: &TaskId,
        session_id: Uuid,
    ) -> Result<CaptureRef, CaptureError> {
        let capture_start = Instant::now();
        let captured_at = Utc::now();
        let key = blob_key(task_id, session_id, captured_at);
        let grabber = Arc::clone(&self.grabber);
        let blobs = Arc::clone(&self.blobs);

        let (url, phash) = tokio::task::spawn_blocking(move || {
            let frame = grabber.grab_frame()?;
            let phash = compute_phash(&frame);
            let jpeg = encode_jpeg(&frame)?;
            let url = blobs
                .put(&key, &jpeg)
                .map_err(|err| CaptureError::UploadFailed(format!("{err:#}")))?;
            Ok::<_, CaptureError>((url, phash))
        })
        .await
        .map_err(|err| {
            log_warn!("capture worker for session {} did not finish: {err}", session_id);
            CaptureError::DeviceUnavailable(format!("capture worker join failed: {err}"))
        })??;

        log_info!(
            "Capture stored for session {} in {}ms: {}",
            session_id,
            capture_start.elapsed().as_millis(),
            url
        );

        Ok(CaptureRef::new(url, captured_at).with_phash(phash))
    }
}

fn encode_jpeg(frame: &DynamicImage) -> Result<Vec<u8>, CaptureError> {
    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(frame.to_rgb8());
    let mut bytes = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .map_err(|err| CaptureError::UploadFailed(format!("jpeg encoding failed: {err}")))?;
    Ok(bytes)
}

fn blob_key(task_id: &TaskId, session_id: Uuid, captured_at: DateTime<Utc>) -> String {
    format!(
        "captures/{}/{}/{}.jpg",
        path_segment(task_id.as_str()),
        session_id,
        captured_at.timestamp_millis()
    )
}

fn path_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".into()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use tempfile::TempDir;

    fn write_frame(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("screen.png");
        RgbaImage::from_fn(32, 24, |x, y| Rgba([(x * 8) as u8, (y * 10) as u8, 40, 255]))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn blob_key_sanitizes_task_id() {
        let session_id = Uuid::nil();
        let at = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let key = blob_key(&TaskId::from("gig/../42"), session_id, at);
        assert_eq!(
            key,
            format!("captures/gig____42/{session_id}/1700000000000.jpg")
        );
    }

    #[tokio::test]
    async fn stores_frame_and_returns_file_url() {
        let dir = TempDir::new().unwrap();
        let frame_path = write_frame(&dir);
        let blobs = LocalBlobStore::new(dir.path().join("blobs"));
        let provider = SnapshotCaptureProvider::new(ImageFileGrabber::new(frame_path), blobs);

        let capture = provider
            .request_capture(&TaskId::from("gig-1"), Uuid::new_v4())
            .await
            .unwrap();

        assert!(capture.url.starts_with("file://"));
        let stored = PathBuf::from(capture.url.trim_start_matches("file://"));
        assert!(stored.exists());
        assert_eq!(
            image::guess_format(&fs::read(&stored).unwrap()).unwrap(),
            ImageFormat::Jpeg
        );
        assert!(capture.phash.is_some());
    }

    #[tokio::test]
    async fn missing_snapshot_is_device_unavailable() {
        let dir = TempDir::new().unwrap();
        let provider = SnapshotCaptureProvider::new(
            ImageFileGrabber::new(dir.path().join("nope.png")),
            LocalBlobStore::new(dir.path().join("blobs")),
        );

        let err = provider
            .request_capture(&TaskId::from("gig-1"), Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(err, CaptureError::DeviceUnavailable(_)));
    }

    #[tokio::test]
    async fn unwritable_blob_root_is_upload_failure() {
        let dir = TempDir::new().unwrap();
        let frame_path = write_frame(&dir);
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"occupied").unwrap();
        let provider = SnapshotCaptureProvider::new(
            ImageFileGrabber::new(frame_path),
            LocalBlobStore::new(&blocker),
        );

        let err = provider
            .request_capture(&TaskId::from("gig-1"), Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(err, CaptureError::UploadFailed(_)));
    }
}
