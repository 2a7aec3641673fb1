use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Which part of the image the provider should treat as the subject.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FocusMode {
    #[default]
    Auto,
    Center,
    Largest,
    Detailed,
}

/// Hint telling the server which segmentation backend to prefer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProcessingMode {
    Gemini,
    Local,
    #[default]
    Auto,
}

/// Per-task segmentation parameters.
///
/// Out-of-range values are clamped by [`SegmentParams::clamped`] before they
/// are stored on a task, mirroring what the server does on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentParams {
    /// Mask binarisation threshold, 0–255.
    pub threshold: u8,
    /// Edge feathering radius, 0–10.
    pub feather: u8,
    /// Padding around the detected box in pixels, 0–50.
    pub padding: u8,
    pub auto_enhance: bool,
    pub focus_mode: FocusMode,
    pub allow_border_touch: bool,
    /// Pick a specific candidate from a previous multi-candidate response.
    pub candidate_index: Option<u32>,
    pub processing_mode: ProcessingMode,
}

impl SegmentParams {
    pub const MAX_FEATHER: u8 = 10;
    pub const MAX_PADDING: u8 = 50;

    pub fn clamped(mut self) -> Self {
        self.feather = self.feather.min(Self::MAX_FEATHER);
        self.padding = self.padding.min(Self::MAX_PADDING);
        self
    }
}

impl Default for SegmentParams {
    fn default() -> Self {
        Self {
            threshold: 128,
            feather: 4,
            padding: 8,
            auto_enhance: true,
            focus_mode: FocusMode::Auto,
            allow_border_touch: false,
            candidate_index: None,
            processing_mode: ProcessingMode::Auto,
        }
    }
}

/// The image half of a segmentation request.
#[derive(Debug, Clone)]
pub enum Upload {
    /// Send the original payload.
    File {
        name: String,
        mime: Option<String>,
        bytes: Bytes,
    },
    /// Re-use a payload the server already holds.
    FileId(String),
}

/// A single remote segmentation call.
#[derive(Debug, Clone)]
pub struct SegmentRequest {
    pub upload: Upload,
    pub params: SegmentParams,
}

/// One detection offered by the provider when several subjects were found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Candidate {
    #[serde(deserialize_with = "null_as_empty")]
    pub label: String,
    pub box_2d: Option<Vec<f64>>,
    pub confidence: Option<f64>,
    pub score: Option<f64>,
}

/// Result record returned by both the segment call and the job lookup.
///
/// A lookup of a job that has not finished yet only carries `id`, `status`
/// and possibly `error`; every other field falls back to its default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentResult {
    pub id: String,
    pub status: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub label: String,
    pub box_2d: Option<Vec<f64>>,
    pub mask_base64: String,
    pub cutout_png_base64: String,
    pub cutout_full_base64: Option<String>,
    pub candidates: Vec<Candidate>,
    pub selected_candidate: Option<u32>,
    pub timings: HashMap<String, serde_json::Value>,
    pub processor_used: Option<String>,
    /// Server-side upload id, usable as [`Upload::FileId`] on re-submission.
    pub file_id: Option<String>,
    pub download_url: Option<String>,
    pub error: Option<String>,
}

impl SegmentResult {
    /// Total server-side processing time, when the server reported it.
    pub fn total_ms(&self) -> Option<u64> {
        self.timings.get("total_ms").and_then(serde_json::Value::as_u64)
    }
}

/// Providers sometimes send `null` for a label they could not name.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
