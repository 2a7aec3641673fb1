//! Preview generation for submitted files.
//!
//! Thumbnails are produced off the async threads after submission.  Until
//! one is ready (or if it never is) the task shows [`object_url`], a direct
//! reference to the original file.

use std::io::Cursor;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::ImageFormat;
use thiserror::Error;

use crate::queue::types::InputFile;

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("file is empty")]
    Empty,

    #[error("failed to decode or encode image: {0}")]
    Image(#[from] image::ImageError),
}

/// Produces a displayable preview reference for a file.
pub trait Thumbnailer: Send + Sync + 'static {
    fn thumbnail(&self, file: &InputFile, size: u32) -> Result<String, ThumbnailError>;
}

/// Decodes with the `image` crate and returns a PNG data URL.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageThumbnailer;

impl Thumbnailer for ImageThumbnailer {
    fn thumbnail(&self, file: &InputFile, size: u32) -> Result<String, ThumbnailError> {
        if file.bytes.is_empty() {
            return Err(ThumbnailError::Empty);
        }
        let image = image::load_from_memory(&file.bytes)?;
        let thumb = image.thumbnail(size, size);

        let mut png = Cursor::new(Vec::new());
        thumb.write_to(&mut png, ImageFormat::Png)?;
        Ok(format!("data:image/png;base64,{}", STANDARD.encode(png.into_inner())))
    }
}

/// Direct reference to the original file.  Never empty.
pub fn object_url(file: &InputFile) -> String {
    match &file.path {
        Some(path) => format!("file://{}", path.display()),
        None if file.name.is_empty() => "blob:cutout/upload".to_owned(),
        None => format!("blob:cutout/{}", file.name),
    }
}
