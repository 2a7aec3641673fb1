use std::path::PathBuf;

use clap::Parser;
use cutout_core::{FocusMode, ProcessingMode, SegmentParams};

/// Cut subjects out of a batch of images using a remote segmentation server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Image files to process (JPG, PNG or WEBP).
    #[arg(required = true, value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// Base URL of the segmentation server.  Overrides `CUTOUT_SERVER`.
    #[arg(short, long, value_name = "URL")]
    pub server: Option<String>,

    /// Files processed at once.  Overrides `CUTOUT_CONCURRENCY`.
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Per-file deadline in seconds.  Overrides `CUTOUT_TIMEOUT_SECS`.
    #[arg(long, value_name = "SECS")]
    pub timeout_secs: Option<u64>,

    /// Reject files larger than this before uploading; 0 disables the check.
    #[arg(long, value_name = "BYTES")]
    pub max_upload_bytes: Option<u64>,

    /// Directory cutouts are written to.
    #[arg(short, long, default_value = ".", value_name = "DIR")]
    pub out_dir: PathBuf,

    /// Also download every finished cutout as one ZIP archive.
    #[arg(long, value_name = "PATH")]
    pub zip: Option<PathBuf>,

    /// Write the full-resolution cutout when the server provides one; the
    /// standard cutout is written otherwise, with a warning.
    #[arg(long)]
    pub full: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    pub log_json: bool,

    /// Mask binarisation threshold.
    #[arg(long, default_value_t = 128)]
    pub threshold: u8,

    /// Edge feather radius (0–10).
    #[arg(long, default_value_t = 4)]
    pub feather: u8,

    /// Padding around the subject (0–50).
    #[arg(long, default_value_t = 8)]
    pub padding: u8,

    /// Skip automatic contrast enhancement.
    #[arg(long)]
    pub no_enhance: bool,

    /// Subject choice: auto, center, largest or detailed.
    #[arg(long, default_value_t = FocusMode::Auto)]
    pub focus: FocusMode,

    /// Allow the subject to touch the image border.
    #[arg(long)]
    pub allow_border_touch: bool,

    /// Candidate to cut out when several subjects are detected.
    #[arg(long)]
    pub candidate: Option<u32>,

    /// Processor: gemini, local or auto.
    #[arg(long, default_value_t = ProcessingMode::Auto)]
    pub mode: ProcessingMode,
}

impl Args {
    pub fn params(&self) -> SegmentParams {
        SegmentParams {
            threshold: self.threshold,
            feather: self.feather,
            padding: self.padding,
            auto_enhance: !self.no_enhance,
            focus_mode: self.focus,
            allow_border_touch: self.allow_border_touch,
            candidate_index: self.candidate,
            processing_mode: self.mode,
        }
        .clamped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_segment_params() {
        let args = Args::parse_from([
            "cutout",
            "--feather",
            "30",
            "--focus",
            "largest",
            "--mode",
            "LOCAL",
            "--no-enhance",
            "a.png",
            "b.jpg",
        ]);
        let params = args.params();
        assert_eq!(args.files.len(), 2);
        assert_eq!(params.feather, SegmentParams::MAX_FEATHER);
        assert_eq!(params.focus_mode, FocusMode::Largest);
        assert_eq!(params.processing_mode, ProcessingMode::Local);
        assert!(!params.auto_enhance);
    }

    #[test]
    fn files_are_required() {
        assert!(Args::try_parse_from(["cutout"]).is_err());
    }
}
