//! Durable storage for uploaded images and their generated descriptions.
//!
//! Everything lives in one flat directory: `<id>.jpg` for the image and
//! `<id>.txt` for the description of that image. The shared filename stem is
//! the association between the two, so a description always names the image
//! it belongs to. Nothing is ever mutated or deleted; retention is someone
//! else's problem.

use std::{
    fmt,
    fs,
    io::{self, Cursor},
    path::{Path, PathBuf},
    sync::Mutex,
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use image::ImageOutputFormat;
use tracing::debug;

use crate::error::ApiError;

pub const IMAGE_EXT: &str = "jpg";
const DESCRIPTION_EXT: &str = "txt";

// Wall-clock, millisecond resolution: `2025-05-24_173321.988`. Fixed width,
// so lexicographic order is creation order.
const ID_FORMAT: &str = "%Y-%m-%d_%H%M%S%.3f";
const JPEG_QUALITY: u8 = 85;

/// Identifier of a stored image; doubles as the filename stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(String);

impl ImageId {
    pub(crate) fn from_stem(stem: impl Into<String>) -> Self {
        Self(stem.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct ImageStore {
    dir: PathBuf,
    // Last issued id in epoch milliseconds. Id generation serializes here and
    // bumps past this value, so two uploads landing in the same millisecond
    // still get distinct, strictly increasing ids.
    last_issued_ms: Mutex<i64>,
}

impl ImageStore {
    /// Opens the store, creating the backing directory if absent.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            last_issued_ms: Mutex::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_id(&self) -> ImageId {
        let mut last = self.last_issued_ms.lock().unwrap();
        let mut now = Utc::now();
        if now.timestamp_millis() <= *last {
            now = DateTime::from_timestamp_millis(*last + 1).unwrap_or(now);
        }
        *last = now.timestamp_millis();
        ImageId(now.format(ID_FORMAT).to_string())
    }

    /// Validates the payload as a raster image, re-encodes it as JPEG and
    /// writes it under a fresh timestamp id. Undecodable payloads are
    /// rejected before anything touches the disk.
    pub fn save_image(&self, bytes: &[u8]) -> Result<ImageId, ApiError> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| ApiError::InvalidImage(e.to_string()))?;

        let mut jpeg = Vec::new();
        decoded.write_to(
            &mut Cursor::new(&mut jpeg),
            ImageOutputFormat::Jpeg(JPEG_QUALITY),
        )?;

        let id = self.next_id();
        fs::write(self.image_path(&id), &jpeg)?;
        debug!("image saved as {}.{IMAGE_EXT}", id);
        Ok(id)
    }

    /// Writes the description for the given image id as its `.txt` sibling.
    pub fn save_description(&self, id: &ImageId, text: &str) -> Result<(), ApiError> {
        fs::write(self.dir.join(format!("{id}.{DESCRIPTION_EXT}")), text)?;
        debug!("description saved as {}.{DESCRIPTION_EXT}", id);
        Ok(())
    }

    pub fn image_path(&self, id: &ImageId) -> PathBuf {
        self.dir.join(format!("{id}.{IMAGE_EXT}"))
    }

    /// Reads back the stored (re-encoded) JPEG bytes for an id.
    pub fn read_image(&self, id: &ImageId) -> Result<Vec<u8>, ApiError> {
        Ok(fs::read(self.image_path(id))?)
    }

    /// Most recently written image, by modification time. Only the index page
    /// uses this; request handling goes through the in-memory register.
    pub fn latest_image(&self) -> Result<Option<ImageId>, ApiError> {
        Ok(self.latest_with_ext(IMAGE_EXT)?.and_then(|path| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map(ImageId::from_stem)
        }))
    }

    /// Contents of the most recently written description, if any.
    pub fn latest_description(&self) -> Result<Option<String>, ApiError> {
        match self.latest_with_ext(DESCRIPTION_EXT)? {
            Some(path) => Ok(Some(fs::read_to_string(path)?)),
            None => Ok(None),
        }
    }

    fn latest_with_ext(&self, ext: &str) -> Result<Option<PathBuf>, ApiError> {
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ext) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            // Ties on mtime fall back to the filename, which is creation order.
            let newer = match &newest {
                Some((time, seen)) => (modified, &path) > (*time, seen),
                None => true,
            };
            if newer {
                newest = Some((modified, path));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }
}
