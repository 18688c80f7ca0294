//! Pixel-grid image containers and their window-aware arithmetic.
//!
//! An [`Image`] is a 2-D grid of flux samples tied to a [`Window`] in sky
//! coordinates. All composition between images (accumulate, subtract,
//! replace) is resolved through window intersection: only the overlapping
//! region participates, disjoint windows are a no-op, and a pixelscale
//! mismatch is an error rather than a silent resample.
//!
//! Array convention: `data` is indexed `[row, col]` where rows run along the
//! sky y axis and columns along x. Window axis order is `[x, y]`.

use crate::window::Window;
use ndarray::{s, Array2, Array3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },

    #[error("pixelscale mismatch: {0} vs {1}; images must share a pixelscale to be combined")]
    PixelscaleMismatch(f64, f64),
}

/// Relative tolerance for deciding two pixelscales are "the same grid".
const PIXELSCALE_RTOL: f64 = 1e-9;

fn same_pixelscale(a: f64, b: f64) -> bool {
    (a - b).abs() <= PIXELSCALE_RTOL * a.abs().max(b.abs())
}

/// A pixel grid of flux samples over a sky-coordinate window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub data: Array2<f64>,
    pub pixelscale: f64,
    pub zeropoint: Option<f64>,
    pub window: Window,
}

impl Image {
    /// A zero-filled image covering `window` at `pixelscale`. The pixel count
    /// per axis follows [`Window::shape_px`].
    pub fn zeros(window: Window, pixelscale: f64) -> Self {
        let [nx, ny] = window.shape_px(pixelscale);
        Self {
            data: Array2::zeros((ny, nx)),
            pixelscale,
            zeropoint: None,
            window,
        }
    }

    /// Build an image from existing data; the window is derived from the
    /// data shape so the two never disagree.
    pub fn from_data(data: Array2<f64>, pixelscale: f64, origin: [f64; 2]) -> Self {
        let (ny, nx) = data.dim();
        let window = Window::new(origin, [nx as f64 * pixelscale, ny as f64 * pixelscale]);
        Self {
            data,
            pixelscale,
            zeropoint: None,
            window,
        }
    }

    pub fn origin(&self) -> [f64; 2] {
        self.window.origin
    }

    /// Sky coordinate of the center of pixel `(row, col)`.
    pub fn coordinate(&self, row: usize, col: usize) -> [f64; 2] {
        [
            self.window.origin[0] + (col as f64 + 0.5) * self.pixelscale,
            self.window.origin[1] + (row as f64 + 0.5) * self.pixelscale,
        ]
    }

    pub fn total_flux(&self) -> f64 {
        self.data.sum()
    }

    /// Index ranges `(rows, cols)` of `region` within this image's grid.
    pub fn indices_of(&self, region: &Window) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
        region.indices_in(&self.window, self.pixelscale)
    }

    fn combine(
        &mut self,
        other: &Image,
        op: impl FnMut(&mut f64, &f64),
    ) -> Result<(), ImageError> {
        if !same_pixelscale(self.pixelscale, other.pixelscale) {
            return Err(ImageError::PixelscaleMismatch(
                self.pixelscale,
                other.pixelscale,
            ));
        }
        let overlap = self.window & other.window;
        if overlap.is_empty() {
            return Ok(());
        }
        let (rs, cs) = self.indices_of(&overlap);
        let (ro, co) = other.indices_of(&overlap);
        // Clamping can trim one range by a pixel at the grid edge; combine
        // only the common extent so the slices always agree.
        let nr = (rs.end - rs.start).min(ro.end - ro.start);
        let nc = (cs.end - cs.start).min(co.end - co.start);
        let src = other
            .data
            .slice(s![ro.start..ro.start + nr, co.start..co.start + nc]);
        let mut dst = self
            .data
            .slice_mut(s![rs.start..rs.start + nr, cs.start..cs.start + nc]);
        dst.zip_mut_with(&src, op);
        Ok(())
    }

    /// Add `other` into the overlapping region of `self`.
    pub fn accumulate(&mut self, other: &Image) -> Result<(), ImageError> {
        self.combine(other, |d, s| *d += *s)
    }

    /// Subtract `other` from the overlapping region of `self`.
    pub fn subtract(&mut self, other: &Image) -> Result<(), ImageError> {
        self.combine(other, |d, s| *d -= *s)
    }

    /// Overwrite the overlapping region of `self` with `other`'s samples.
    /// Used by the adaptive integrator, which replaces (not adds) refined
    /// pixels.
    pub fn replace(&mut self, other: &Image) -> Result<(), ImageError> {
        self.combine(other, |d, s| *d = *s)
    }

    /// Flux-conserving downsample by an integer factor: each output pixel is
    /// the sum (not the mean) of a `scale x scale` block. Trailing rows and
    /// columns that do not fill a block are dropped. `scale == 1` is the
    /// identity.
    pub fn reduce(&self, scale: usize) -> Image {
        if scale <= 1 {
            return self.clone();
        }
        let (ny, nx) = self.data.dim();
        let (my, mx) = (ny / scale, nx / scale);
        let mut out = Array2::zeros((my, mx));
        for r in 0..my {
            for c in 0..mx {
                out[[r, c]] = self
                    .data
                    .slice(s![r * scale..(r + 1) * scale, c * scale..(c + 1) * scale])
                    .sum();
            }
        }
        let pixelscale = self.pixelscale * scale as f64;
        let window = Window::new(
            self.window.origin,
            [mx as f64 * pixelscale, my as f64 * pixelscale],
        );
        Image {
            data: out,
            pixelscale,
            zeropoint: self.zeropoint,
            window,
        }
    }

    /// Remove an integer pixel border `[x, y]` from all four sides.
    pub fn crop(&self, border: [usize; 2]) -> Image {
        let (ny, nx) = self.data.dim();
        let (bx, by) = (border[0], border[1]);
        if 2 * bx >= nx || 2 * by >= ny {
            let window = Window::new(self.window.center(), [0.0, 0.0]);
            return Image {
                data: Array2::zeros((0, 0)),
                pixelscale: self.pixelscale,
                zeropoint: self.zeropoint,
                window,
            };
        }
        let data = self.data.slice(s![by..ny - by, bx..nx - bx]).to_owned();
        let window = Window::new(
            [
                self.window.origin[0] + bx as f64 * self.pixelscale,
                self.window.origin[1] + by as f64 * self.pixelscale,
            ],
            [
                (nx - 2 * bx) as f64 * self.pixelscale,
                (ny - 2 * by) as f64 * self.pixelscale,
            ],
        );
        Image {
            data,
            pixelscale: self.pixelscale,
            zeropoint: self.zeropoint,
            window,
        }
    }

    /// Zero-pad by an integer pixel border `[x, y]` on all four sides.
    /// Total flux is preserved exactly.
    pub fn expand(&self, border: [usize; 2]) -> Image {
        let (ny, nx) = self.data.dim();
        let (bx, by) = (border[0], border[1]);
        let mut data = Array2::zeros((ny + 2 * by, nx + 2 * bx));
        data.slice_mut(s![by..by + ny, bx..bx + nx]).assign(&self.data);
        let window = self.window.pad([
            bx as f64 * self.pixelscale,
            by as f64 * self.pixelscale,
        ]);
        Image {
            data,
            pixelscale: self.pixelscale,
            zeropoint: self.zeropoint,
            window,
        }
    }
}

/// A per-call additive accumulator produced by sampling a model, tagged with
/// the identity of the target it is meant to be compared against.
#[derive(Debug, Clone)]
pub struct ModelImage {
    pub image: Image,
    pub target_id: String,
}

impl ModelImage {
    pub fn zeros(window: Window, pixelscale: f64, target_id: impl Into<String>) -> Self {
        Self {
            image: Image::zeros(window, pixelscale),
            target_id: target_id.into(),
        }
    }

    pub fn total_flux(&self) -> f64 {
        self.image.total_flux()
    }
}

/// A stack of per-pixel partial derivative planes, one per free parameter,
/// tagged with the owning target's identity and the ordered parameter names.
#[derive(Debug, Clone)]
pub struct JacobianImage {
    /// `(rows, cols, params)`.
    pub data: Array3<f64>,
    pub pixelscale: f64,
    pub window: Window,
    pub target_id: String,
    /// Globally-qualified parameter names, one per plane, in plane order.
    pub params: Vec<String>,
}

impl JacobianImage {
    pub fn zeros(
        window: Window,
        pixelscale: f64,
        params: Vec<String>,
        target_id: impl Into<String>,
    ) -> Self {
        let [nx, ny] = window.shape_px(pixelscale);
        Self {
            data: Array3::zeros((ny, nx, params.len())),
            pixelscale,
            window,
            target_id: target_id.into(),
            params,
        }
    }

    /// Borrow one derivative plane as a 2-D view.
    pub fn plane(&self, p: usize) -> ndarray::ArrayView2<'_, f64> {
        self.data.slice(s![.., .., p])
    }

    /// Add `plane` into derivative plane `p` over the window overlap. Exact
    /// index alignment comes from the shared window-to-index conversion;
    /// disjoint windows are a no-op.
    pub fn scatter(&mut self, plane: &Image, p: usize) -> Result<(), ImageError> {
        let overlap = self.window & plane.window;
        if overlap.is_empty() {
            return Ok(());
        }
        let (jr, jc) = overlap.indices_in(&self.window, self.pixelscale);
        let (pr, pc) = overlap.indices_in(&plane.window, plane.pixelscale);
        let nr = (jr.end - jr.start).min(pr.end - pr.start);
        let nc = (jc.end - jc.start).min(pc.end - pc.start);
        let src = plane
            .data
            .slice(s![pr.start..pr.start + nr, pc.start..pc.start + nc]);
        let mut dst = self
            .data
            .slice_mut(s![jr.start..jr.start + nr, jc.start..jc.start + nc, p]);
        dst += &src;
        Ok(())
    }
}
