//! The observed image a model is fit against.
//!
//! A [`TargetImage`] owns the data grid plus the auxiliary planes that
//! describe it: per-pixel noise variance, a boolean "ignore" mask, and the
//! instrument point-spread function. Auxiliary planes are optional, and the
//! distinction between "absent" and "zero-valued" is preserved everywhere
//! (including persistence, see [`crate::store`]). Shape invariants are
//! enforced at set time and never silently broadcast.

use crate::image::Image;
use crate::window::Window;
use ndarray::{s, Array2};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("{plane} shape {got:?} does not match data shape {expected:?}")]
    ShapeMismatch {
        plane: &'static str,
        expected: (usize, usize),
        got: (usize, usize),
    },

    #[error("psf must be odd-shaped in both axes, got {0:?}")]
    EvenPsf((usize, usize)),

    #[error("psf upscale factor must be at least 1, got {0}")]
    BadUpscale(usize),
}

/// Observed data, noise model, mask, and PSF for one image.
#[derive(Debug, Clone)]
pub struct TargetImage {
    pub image: Image,
    variance: Option<Array2<f64>>,
    mask: Option<Array2<bool>>,
    psf: Option<Array2<f64>>,
    psf_upscale: usize,
    /// Stable identity used to tag model and jacobian images.
    pub id: String,
}

impl TargetImage {
    pub fn new(
        data: Array2<f64>,
        pixelscale: f64,
        origin: [f64; 2],
        id: impl Into<String>,
    ) -> Self {
        Self {
            image: Image::from_data(data, pixelscale, origin),
            variance: None,
            mask: None,
            psf: None,
            psf_upscale: 1,
            id: id.into(),
        }
    }

    pub fn window(&self) -> Window {
        self.image.window
    }

    pub fn pixelscale(&self) -> f64 {
        self.image.pixelscale
    }

    pub fn set_variance(&mut self, variance: Option<Array2<f64>>) -> Result<(), TargetError> {
        if let Some(v) = &variance {
            if v.dim() != self.image.data.dim() {
                return Err(TargetError::ShapeMismatch {
                    plane: "variance",
                    expected: self.image.data.dim(),
                    got: v.dim(),
                });
            }
        }
        self.variance = variance;
        Ok(())
    }

    pub fn set_mask(&mut self, mask: Option<Array2<bool>>) -> Result<(), TargetError> {
        if let Some(m) = &mask {
            if m.dim() != self.image.data.dim() {
                return Err(TargetError::ShapeMismatch {
                    plane: "mask",
                    expected: self.image.data.dim(),
                    got: m.dim(),
                });
            }
        }
        self.mask = mask;
        Ok(())
    }

    /// Install a PSF kernel. The kernel must be odd-shaped in both axes so it
    /// has a well-defined center pixel.
    pub fn set_psf(&mut self, psf: Option<Array2<f64>>, upscale: usize) -> Result<(), TargetError> {
        if upscale < 1 {
            return Err(TargetError::BadUpscale(upscale));
        }
        if let Some(p) = &psf {
            let (ny, nx) = p.dim();
            if ny % 2 == 0 || nx % 2 == 0 {
                return Err(TargetError::EvenPsf((ny, nx)));
            }
        }
        self.psf = psf;
        self.psf_upscale = upscale;
        Ok(())
    }

    pub fn has_variance(&self) -> bool {
        self.variance.is_some()
    }

    pub fn has_mask(&self) -> bool {
        self.mask.is_some()
    }

    pub fn has_psf(&self) -> bool {
        self.psf.is_some()
    }

    /// Per-pixel noise variance; all ones when no variance plane is set.
    pub fn variance(&self) -> Array2<f64> {
        match &self.variance {
            Some(v) => v.clone(),
            None => Array2::ones(self.image.data.dim()),
        }
    }

    pub fn variance_plane(&self) -> Option<&Array2<f64>> {
        self.variance.as_ref()
    }

    /// Per-pixel ignore flags; all false when no mask is set.
    pub fn mask(&self) -> Array2<bool> {
        match &self.mask {
            Some(m) => m.clone(),
            None => Array2::from_elem(self.image.data.dim(), false),
        }
    }

    pub fn mask_plane(&self) -> Option<&Array2<bool>> {
        self.mask.as_ref()
    }

    pub fn psf(&self) -> Option<&Array2<f64>> {
        self.psf.as_ref()
    }

    pub fn psf_upscale(&self) -> usize {
        self.psf_upscale
    }

    /// Widen the mask: a pixel is ignored if either mask flags it.
    pub fn or_mask(&mut self, other: &Array2<bool>) -> Result<(), TargetError> {
        if other.dim() != self.image.data.dim() {
            return Err(TargetError::ShapeMismatch {
                plane: "mask",
                expected: self.image.data.dim(),
                got: other.dim(),
            });
        }
        let mut m = self.mask();
        m.zip_mut_with(other, |a, b| *a = *a || *b);
        self.mask = Some(m);
        Ok(())
    }

    /// Narrow the mask: a pixel is ignored only if both masks flag it.
    pub fn and_mask(&mut self, other: &Array2<bool>) -> Result<(), TargetError> {
        if other.dim() != self.image.data.dim() {
            return Err(TargetError::ShapeMismatch {
                plane: "mask",
                expected: self.image.data.dim(),
                got: other.dim(),
            });
        }
        let mut m = self.mask();
        m.zip_mut_with(other, |a, b| *a = *a && *b);
        self.mask = Some(m);
        Ok(())
    }

    /// Physical half-extent of the PSF per axis (`[x, y]`, sky units),
    /// rounded up by half a pixel. Sampling in `full` PSF mode pads the
    /// working window by this much so convolution edge effects land in the
    /// border that is cropped away afterwards.
    pub fn psf_border(&self) -> [f64; 2] {
        match &self.psf {
            Some(p) => {
                let (ny, nx) = p.dim();
                [
                    self.image.pixelscale * (1 + nx) as f64 / 2.0,
                    self.image.pixelscale * (1 + ny) as f64 / 2.0,
                ]
            }
            None => [0.0, 0.0],
        }
    }

    /// [`Self::psf_border`] in integer data pixels (`[x, y]`).
    pub fn psf_border_px(&self) -> [usize; 2] {
        match &self.psf {
            Some(p) => {
                let (ny, nx) = p.dim();
                [(1 + nx) / 2, (1 + ny) / 2]
            }
            None => [0, 0],
        }
    }

    /// A same-shape target with zeroed data, sharing mask/PSF/calibration.
    /// Useful for accumulating a model realization against the real target's
    /// geometry without touching its data.
    pub fn blank_copy(&self) -> TargetImage {
        let mut out = self.clone();
        out.image.data.fill(0.0);
        out
    }

    /// Crop the target (data, variance, mask) to the part of `window` that
    /// overlaps the data grid. The PSF and upscale carry over unchanged.
    pub fn view(&self, window: &Window) -> TargetImage {
        let (rows, cols) = window.indices_in(&self.image.window, self.image.pixelscale);
        let data = self
            .image
            .data
            .slice(s![rows.clone(), cols.clone()])
            .to_owned();
        let origin = [
            self.image.window.origin[0] + cols.start as f64 * self.image.pixelscale,
            self.image.window.origin[1] + rows.start as f64 * self.image.pixelscale,
        ];
        let mut out = TargetImage::new(data, self.image.pixelscale, origin, self.id.clone());
        out.image.zeropoint = self.image.zeropoint;
        out.variance = self
            .variance
            .as_ref()
            .map(|v| v.slice(s![rows.clone(), cols.clone()]).to_owned());
        out.mask = self
            .mask
            .as_ref()
            .map(|m| m.slice(s![rows, cols]).to_owned());
        out.psf = self.psf.clone();
        out.psf_upscale = self.psf_upscale;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn target() -> TargetImage {
        TargetImage::new(Array2::zeros((8, 10)), 1.0, [0.0, 0.0], "t")
    }

    #[test]
    fn variance_defaults_to_ones_and_mask_to_false() {
        let t = target();
        assert!(!t.has_variance());
        assert!(!t.has_mask());
        assert_abs_diff_eq!(t.variance().sum(), 80.0);
        assert!(!t.mask().iter().any(|&m| m));
    }

    #[test]
    fn variance_shape_mismatch_is_rejected() {
        let mut t = target();
        let err = t.set_variance(Some(Array2::ones((8, 9)))).unwrap_err();
        assert!(matches!(err, TargetError::ShapeMismatch { plane: "variance", .. }));
    }

    #[test]
    fn even_psf_is_rejected() {
        let mut t = target();
        let err = t.set_psf(Some(Array2::ones((4, 5))), 1).unwrap_err();
        assert!(matches!(err, TargetError::EvenPsf((4, 5))));
        t.set_psf(Some(Array2::ones((5, 5))), 1).unwrap();
    }

    #[test]
    fn psf_border_covers_half_the_kernel() {
        let mut t = target();
        t.set_psf(Some(Array2::ones((5, 3))), 1).unwrap();
        assert_eq!(t.psf_border_px(), [2, 3]);
        assert_eq!(t.psf_border(), [2.0, 3.0]);
    }

    #[test]
    fn view_slices_all_planes_and_keeps_the_psf() {
        let mut t = target();
        t.image.data[[2, 3]] = 7.0;
        t.set_variance(Some(Array2::from_elem((8, 10), 2.0))).unwrap();
        t.set_psf(Some(Array2::ones((3, 3))), 1).unwrap();
        let v = t.view(&Window::new([2.0, 1.0], [4.0, 3.0]));
        assert_eq!(v.image.data.dim(), (3, 4));
        assert_abs_diff_eq!(v.image.data[[1, 1]], 7.0);
        assert_eq!(v.window().origin, [2.0, 1.0]);
        assert!(v.has_variance());
        assert!(v.has_psf());
    }

    #[test]
    fn blank_copy_zeroes_data_and_keeps_planes() {
        let mut t = target();
        t.image.data.fill(3.0);
        t.set_psf(Some(Array2::ones((3, 3))), 1).unwrap();
        let b = t.blank_copy();
        assert_abs_diff_eq!(b.image.total_flux(), 0.0);
        assert!(b.has_psf());
        assert_eq!(b.window(), t.window());
    }

    #[test]
    fn and_mask_narrows() {
        let mut t = target();
        let mut wide = Array2::from_elem((8, 10), false);
        wide[[0, 0]] = true;
        wide[[1, 1]] = true;
        t.or_mask(&wide).unwrap();
        let mut keep = Array2::from_elem((8, 10), false);
        keep[[1, 1]] = true;
        t.and_mask(&keep).unwrap();
        assert!(!t.mask()[[0, 0]]);
        assert!(t.mask()[[1, 1]]);
    }

    #[test]
    fn or_mask_widens() {
        let mut t = target();
        let mut m = Array2::from_elem((8, 10), false);
        m[[0, 0]] = true;
        t.or_mask(&m).unwrap();
        assert!(t.mask()[[0, 0]]);
        assert!(!t.mask()[[1, 1]]);
    }
}
