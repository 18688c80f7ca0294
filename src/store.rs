//! Saving and loading target images.
//!
//! A target is written as one JSON document: a header (identity, geometry,
//! calibration), the data grid, and a list of tagged extensions for the
//! optional planes. Absent planes are simply not written, so the
//! absent-versus-zero distinction in [`TargetImage`] survives a round trip.
//! Plane shape and PSF oddness are re-validated on load through the same
//! setters used everywhere else.

use crate::target::{TargetError, TargetImage};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed target document: {0}")]
    Format(#[from] serde_json::Error),

    #[error(transparent)]
    Target(#[from] TargetError),
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    id: String,
    pixelscale: f64,
    origin: [f64; 2],
    zeropoint: Option<f64>,
    psf_upscale: usize,
}

/// One optional plane, tagged by what it is rather than by position.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Extension {
    Variance { data: Array2<f64> },
    Mask { data: Array2<bool> },
    Psf { data: Array2<f64> },
}

#[derive(Debug, Serialize, Deserialize)]
struct TargetDocument {
    header: Header,
    data: Array2<f64>,
    extensions: Vec<Extension>,
}

impl TargetDocument {
    fn from_target(target: &TargetImage) -> Self {
        let mut extensions = Vec::new();
        if let Some(v) = target.variance_plane() {
            extensions.push(Extension::Variance { data: v.clone() });
        }
        if let Some(m) = target.mask_plane() {
            extensions.push(Extension::Mask { data: m.clone() });
        }
        if let Some(p) = target.psf() {
            extensions.push(Extension::Psf { data: p.clone() });
        }
        Self {
            header: Header {
                id: target.id.clone(),
                pixelscale: target.pixelscale(),
                origin: target.window().origin,
                zeropoint: target.image.zeropoint,
                psf_upscale: target.psf_upscale(),
            },
            data: target.image.data.clone(),
            extensions,
        }
    }

    fn into_target(self) -> Result<TargetImage, StoreError> {
        let mut target = TargetImage::new(
            self.data,
            self.header.pixelscale,
            self.header.origin,
            self.header.id,
        );
        target.image.zeropoint = self.header.zeropoint;
        for ext in self.extensions {
            match ext {
                Extension::Variance { data } => target.set_variance(Some(data))?,
                Extension::Mask { data } => target.set_mask(Some(data))?,
                Extension::Psf { data } => {
                    target.set_psf(Some(data), self.header.psf_upscale)?
                }
            }
        }
        Ok(target)
    }
}

/// Write `target` to `path` as a JSON target document.
pub fn save_target(target: &TargetImage, path: &Path) -> Result<(), StoreError> {
    let file = File::create(path)?;
    serde_json::to_writer(BufWriter::new(file), &TargetDocument::from_target(target))?;
    Ok(())
}

/// Read a target document from `path`.
pub fn load_target(path: &Path) -> Result<TargetImage, StoreError> {
    let file = File::open(path)?;
    let doc: TargetDocument = serde_json::from_reader(BufReader::new(file))?;
    doc.into_target()
}
