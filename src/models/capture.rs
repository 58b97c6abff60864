use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single proof-of-work frame, already uploaded to blob storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRef {
    pub url: String,
    pub captured_at: DateTime<Utc>,
    /// Base64 perceptual hash of the frame, when the provider computed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phash: Option<String>,
}

impl CaptureRef {
    pub fn new(url: impl Into<String>, captured_at: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            captured_at,
            phash: None,
        }
    }

    pub fn with_phash(mut self, phash: impl Into<String>) -> Self {
        self.phash = Some(phash.into());
        self
    }
}
