//! Image describers turn image files into indexable text.
//!
//! Describers are chosen by name through [`describer_for`]. Each one is
//! initialized once per loader worker, shared by the worker's threads, and
//! released when the worker's batch is done.

use std::{io::Cursor, path::Path};

use crate::error::{Error, Result};

/// Configured name that turns image ingestion off.
pub const DISABLED: &str = "none";
pub const IMAGE_METADATA: &str = "image-metadata";

pub trait ImageDescriber: Send + Sync {
    fn name(&self) -> &str;

    /// Acquire whatever the describer needs (weights, handles).
    fn initialize(&mut self) -> Result<()>;

    fn describe(&self, path: &Path, bytes: &[u8]) -> Result<String>;

    /// Drop acquired resources. Safe to call more than once.
    fn release(&mut self);
}

type Constructor = fn() -> Box<dyn ImageDescriber>;

const DESCRIBERS: &[(&str, Constructor)] =
    &[(IMAGE_METADATA, metadata_describer)];

fn metadata_describer() -> Box<dyn ImageDescriber> {
    Box::new(MetadataDescriber::default())
}

/// Look up a describer by configured name. `none` yields `Ok(None)`.
pub fn describer_for(name: &str) -> Result<Option<Box<dyn ImageDescriber>>> {
    if name == DISABLED {
        return Ok(None);
    }

    DESCRIBERS
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, make)| Some(make()))
        .ok_or_else(|| {
            Error::Config(format!(
                "unknown vision model '{name}' (available: {}, {DISABLED})",
                available().join(", ")
            ))
        })
}

pub fn available() -> Vec<&'static str> {
    DESCRIBERS.iter().map(|(name, _)| *name).collect()
}

/// Describes an image by its name, pixel dimensions and encoding.
#[derive(Debug, Default)]
pub struct MetadataDescriber {
    initialized: bool,
}

impl ImageDescriber for MetadataDescriber {
    fn name(&self) -> &str {
        IMAGE_METADATA
    }

    fn initialize(&mut self) -> Result<()> {
        self.initialized = true;
        Ok(())
    }

    fn describe(&self, path: &Path, bytes: &[u8]) -> Result<String> {
        if !self.initialized {
            return Err(Error::Config(format!(
                "image describer '{IMAGE_METADATA}' used before initialize"
            )));
        }

        let reader = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| Error::malformed(path, e))?;
        let format = reader
            .format()
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("unknown");
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| Error::malformed(path, e))?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();

        Ok(format!("Image: {name} ({width}x{height}, {format})"))
    }

    fn release(&mut self) {
        self.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_png() -> Vec<u8> {
        let img = image::RgbImage::new(3, 2);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn dispatch_by_name() {
        assert!(describer_for("none").unwrap().is_none());
        let describer = describer_for("image-metadata").unwrap().unwrap();
        assert_eq!(describer.name(), "image-metadata");
        assert!(describer_for("florence-9000").is_err());
    }

    #[test]
    fn describes_dimensions_and_format() {
        let mut describer = MetadataDescriber::default();
        describer.initialize().unwrap();

        let text = describer
            .describe(Path::new("/pics/cat.png"), &tiny_png())
            .unwrap();
        assert_eq!(text, "Image: cat.png (3x2, png)");

        describer.release();
        describer.release();
    }

    #[test]
    fn requires_initialize() {
        let describer = MetadataDescriber::default();
        assert!(describer.describe(Path::new("a.png"), &tiny_png()).is_err());
    }

    #[test]
    fn garbage_is_malformed() {
        let mut describer = MetadataDescriber::default();
        describer.initialize().unwrap();
        let err = describer
            .describe(Path::new("broken.png"), b"not an image")
            .unwrap_err();
        assert!(matches!(err, Error::MalformedDocument { .. }));
    }
}
