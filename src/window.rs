//! Sky-coordinate window algebra.
//!
//! A [`Window`] is an axis-aligned rectangle in sky coordinates, described by
//! the position of its lower-left corner and its physical extent. Windows are
//! plain value types: every operation is pure and returns a new window.
//!
//! The bridge between sky coordinates and pixel indices lives here too, and
//! uses a single rounding rule (`f64::round`, half away from zero) in exactly
//! one place ([`Window::shape_px`] / [`Window::indices_in`]). Every call site
//! that needs pixel alignment goes through these helpers; changing the
//! rounding rule in one of them but not the other would silently shift pixel
//! alignment by one.

use serde::{Deserialize, Serialize};
use std::ops::{BitAnd, BitOr, Range};

/// Axis-aligned rectangle in sky coordinates.
///
/// Axis order is `[x, y]` (x along image columns, y along image rows).
/// `shape` components are always non-negative; a window with a zero extent on
/// either axis is "empty" and reports zero area.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Window {
    /// Sky coordinate of the lower-left corner.
    pub origin: [f64; 2],
    /// Physical extent along each axis, in sky units.
    pub shape: [f64; 2],
}

impl Window {
    pub fn new(origin: [f64; 2], shape: [f64; 2]) -> Self {
        Self {
            origin,
            shape: [shape[0].max(0.0), shape[1].max(0.0)],
        }
    }

    /// Build a window from its center point and extent.
    pub fn from_center(center: [f64; 2], shape: [f64; 2]) -> Self {
        Self::new(
            [center[0] - shape[0] / 2.0, center[1] - shape[1] / 2.0],
            shape,
        )
    }

    pub fn center(&self) -> [f64; 2] {
        [
            self.origin[0] + self.shape[0] / 2.0,
            self.origin[1] + self.shape[1] / 2.0,
        ]
    }

    pub fn area(&self) -> f64 {
        self.shape[0] * self.shape[1]
    }

    pub fn is_empty(&self) -> bool {
        self.shape[0] <= 0.0 || self.shape[1] <= 0.0
    }

    /// Translate the window by `delta`, keeping its extent.
    pub fn translate(&self, delta: [f64; 2]) -> Self {
        Self {
            origin: [self.origin[0] + delta[0], self.origin[1] + delta[1]],
            shape: self.shape,
        }
    }

    /// Grow the window by a physical border on all four sides.
    pub fn pad(&self, border: [f64; 2]) -> Self {
        Self::new(
            [self.origin[0] - border[0], self.origin[1] - border[1]],
            [
                self.shape[0] + 2.0 * border[0],
                self.shape[1] + 2.0 * border[1],
            ],
        )
    }

    /// Number of pixels hosted along each axis at the given pixelscale,
    /// `[nx, ny]`. This is the crate's single window-to-pixel-count rule.
    pub fn shape_px(&self, pixelscale: f64) -> [usize; 2] {
        [
            (self.shape[0] / pixelscale).round().max(0.0) as usize,
            (self.shape[1] / pixelscale).round().max(0.0) as usize,
        ]
    }

    /// Fraction of `self`'s area covered by `other`. Zero when `self` is
    /// empty or the windows are disjoint.
    pub fn overlap_frac(&self, other: &Window) -> f64 {
        let a = self.area();
        if a <= 0.0 {
            return 0.0;
        }
        (*self & *other).area() / a
    }

    /// Pixel index ranges `(rows, cols)` of `self` within the grid defined by
    /// `outer` at `pixelscale`, clamped to `outer`'s grid. Disjoint windows
    /// yield empty ranges, never a panic.
    pub fn indices_in(&self, outer: &Window, pixelscale: f64) -> (Range<usize>, Range<usize>) {
        let outer_px = outer.shape_px(pixelscale);
        let lo_col = ((self.origin[0] - outer.origin[0]) / pixelscale).round();
        let hi_col = ((self.origin[0] + self.shape[0] - outer.origin[0]) / pixelscale).round();
        let lo_row = ((self.origin[1] - outer.origin[1]) / pixelscale).round();
        let hi_row = ((self.origin[1] + self.shape[1] - outer.origin[1]) / pixelscale).round();

        let clamp = |v: f64, n: usize| -> usize { v.max(0.0).min(n as f64) as usize };
        let lo_col = clamp(lo_col, outer_px[0]);
        let hi_col = clamp(hi_col, outer_px[0]).max(lo_col);
        let lo_row = clamp(lo_row, outer_px[1]);
        let hi_row = clamp(hi_row, outer_px[1]).max(lo_row);
        (lo_row..hi_row, lo_col..hi_col)
    }
}

impl BitAnd for Window {
    type Output = Window;

    /// Intersection. Disjoint windows intersect to an empty (zero-area)
    /// window anchored at the clamped origin.
    fn bitand(self, other: Window) -> Window {
        let origin = [
            self.origin[0].max(other.origin[0]),
            self.origin[1].max(other.origin[1]),
        ];
        let top = [
            (self.origin[0] + self.shape[0]).min(other.origin[0] + other.shape[0]),
            (self.origin[1] + self.shape[1]).min(other.origin[1] + other.shape[1]),
        ];
        Window::new(origin, [top[0] - origin[0], top[1] - origin[1]])
    }
}

impl BitOr for Window {
    type Output = Window;

    /// Union: the smallest window containing both operands.
    fn bitor(self, other: Window) -> Window {
        let origin = [
            self.origin[0].min(other.origin[0]),
            self.origin[1].min(other.origin[1]),
        ];
        let top = [
            (self.origin[0] + self.shape[0]).max(other.origin[0] + other.shape[0]),
            (self.origin[1] + self.shape[1]).max(other.origin[1] + other.shape[1]),
        ];
        Window::new(origin, [top[0] - origin[0], top[1] - origin[1]])
    }
}
