//! The model object: sampling pipeline and adaptive integrator.
//!
//! A [`Model`] is one light distribution: a profile kind, a parameter set, a
//! sky window, and the sampling configuration (PSF mode, integration
//! settings, jacobian mode). `sample` evaluates the profile over an image
//! grid, refines under-sampled regions by recursive supersampling, convolves
//! with the target PSF when requested, and adds the result into a caller
//! accumulator.
//!
//! The pipeline is implemented once over a *stack* of planes sharing one
//! geometry: plane 0 carries the sampled values and planes 1.. carry partial
//! derivatives with respect to selected parameters. Every stage after
//! evaluation (region replacement, reduction, cropping, convolution,
//! accumulation) is linear in the evaluated intensities, so derivative planes
//! go through the identical code path — this is what the jacobian engine in
//! [`crate::jacobian`] builds on.

use crate::convolve::{
    convolve_same, fft_convolve_same, lanczos_shift_kernel, lanczos_shift_kernel_grad,
};
use crate::image::{Image, ImageError, ModelImage};
use crate::init::center_of_mass;
use crate::params::{ParamError, ParamSet};
use crate::profile::{Evaluator, ProfileKind};
use crate::target::TargetImage;
use crate::window::Window;
use ndarray::Array2;
use thiserror::Error;

/// Support order of the sub-pixel PSF shift kernel.
const LANCZOS_ORDER: usize = 3;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("psf convolution in a sub-window is not implemented")]
    UnsupportedPsfMode,

    #[error("jacobian mode '{0}' is not implemented")]
    UnsupportedJacobianMode(&'static str),

    #[error("psf mode 'full' requested but the target has no psf")]
    MissingPsf,

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Technique and scope of PSF convolution during sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PsfMode {
    /// No convolution; evaluate directly on the caller's grid.
    #[default]
    None,
    /// Convolve the full working window with the target PSF.
    Full,
    /// Convolution restricted to a sub-window. Recognized but not
    /// implemented; requesting it fails loudly.
    Window,
}

/// Strategy for computing the jacobian (see [`crate::jacobian`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JacobianMode {
    /// All parameter planes in one pipeline pass (forward-mode).
    #[default]
    Full,
    /// One parameter plane per pipeline pass; less peak memory.
    Single,
    /// Central finite differences; the fallback every other mode is
    /// validated against.
    Finite,
    /// Recognized but not implemented.
    Chunk,
}

/// Scope of the adaptive integrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegrateMode {
    /// No refinement; pixel-center evaluation only.
    None,
    /// Refine a fixed window around the model center.
    #[default]
    Window,
}

/// Fixed-depth supersampling configuration. The recursion is unconditional
/// (no error estimate): depth, shrink factor, and parity correction must be
/// treated as empirical configuration, not a quadrature guarantee.
#[derive(Debug, Clone, Copy)]
pub struct IntegrateConfig {
    pub mode: IntegrateMode,
    /// Size of the integration window, in pixels of the working image.
    pub window_px: usize,
    /// Supersampling factor per recursion level.
    pub factor: usize,
    /// Relative window size between recursion levels.
    pub recursion_factor: usize,
    /// Hard recursion bound; guarantees termination for any profile.
    pub depth: usize,
}

impl Default for IntegrateConfig {
    fn default() -> Self {
        Self {
            mode: IntegrateMode::Window,
            window_px: 10,
            factor: 3,
            recursion_factor: 2,
            depth: 2,
        }
    }
}

/// Plane stack: plane 0 is the sampled value, planes 1.. are parameter
/// partials sharing the same grid.
pub(crate) type Stack = Vec<Image>;

/// Snapshot of everything needed to evaluate the stack on any grid: the
/// profile evaluator, which spec indices get derivative planes, and which of
/// those are suppressed (center partials in `full` PSF mode, where the
/// evaluation grid translates with the center and the center dependence
/// moves into the shift kernel).
pub(crate) struct EvalPlan {
    eval: Evaluator,
    nspecs: usize,
    deriv: Vec<usize>,
    suppressed: Vec<bool>,
}

impl EvalPlan {
    fn stack(&self, window: Window, pixelscale: f64) -> Stack {
        let mut stack: Stack = (0..self.deriv.len() + 1)
            .map(|_| Image::zeros(window, pixelscale))
            .collect();
        let (ny, nx) = stack[0].data.dim();
        // Sample = surface brightness * pixel area, so sum-pooled
        // supersamples carry the same flux as direct samples.
        let area = pixelscale * pixelscale;
        if self.deriv.is_empty() {
            for r in 0..ny {
                for c in 0..nx {
                    let [x, y] = stack[0].coordinate(r, c);
                    stack[0].data[[r, c]] = self.eval.brightness(x, y) * area;
                }
            }
        } else {
            let mut grad = vec![0.0; self.nspecs];
            for r in 0..ny {
                for c in 0..nx {
                    let [x, y] = stack[0].coordinate(r, c);
                    let value = self.eval.brightness_grad(x, y, &mut grad);
                    stack[0].data[[r, c]] = value * area;
                    for (j, &si) in self.deriv.iter().enumerate() {
                        stack[j + 1].data[[r, c]] = if self.suppressed[j] {
                            0.0
                        } else {
                            grad[si] * area
                        };
                    }
                }
            }
        }
        stack
    }
}

/// One parametric light distribution.
#[derive(Debug, Clone)]
pub struct Model {
    pub name: String,
    pub kind: ProfileKind,
    pub params: ParamSet,
    /// Sky region this model is responsible for.
    pub window: Window,
    pub psf_mode: PsfMode,
    pub integrate: IntegrateConfig,
    pub jacobian_mode: JacobianMode,
    /// Locked models are excluded from group windows and free vectors.
    pub locked: bool,
}

impl Model {
    pub fn new(name: impl Into<String>, kind: ProfileKind, window: Window) -> Self {
        Self {
            name: name.into(),
            kind,
            params: ParamSet::new(kind.specs()),
            window,
            psf_mode: PsfMode::default(),
            integrate: IntegrateConfig::default(),
            jacobian_mode: JacobianMode::default(),
            locked: false,
        }
    }

    /// Qualified plane names for this model's free parameters.
    pub fn qualified_free_names(&self) -> Vec<String> {
        self.params
            .free_names()
            .into_iter()
            .map(|p| format!("{}|{}", self.name, p))
            .collect()
    }

    /// Model center in sky coordinates; the window center for kinds without
    /// a center parameter.
    fn center(&self) -> Result<[f64; 2], ParamError> {
        if self.kind.has_center() {
            Ok([
                self.params.value("center_x")?,
                self.params.value("center_y")?,
            ])
        } else {
            Ok(self.window.center())
        }
    }

    /// A zeroed accumulator covering this model's window on the target grid.
    pub fn new_image(&self, target: &TargetImage) -> ModelImage {
        ModelImage::zeros(self.window, target.pixelscale(), target.id.clone())
    }

    /// Evaluate the model over its window and return the accumulated image.
    pub fn sample(&self, target: &TargetImage) -> Result<ModelImage, ModelError> {
        let mut image = self.new_image(target);
        self.sample_into(target, &mut image, None)?;
        Ok(image)
    }

    /// Evaluate the model and add it into `image` (over the overlap with
    /// `window`, when given). The accumulator is never replaced, only added
    /// to, so several models can share it.
    pub fn sample_into(
        &self,
        target: &TargetImage,
        image: &mut ModelImage,
        window: Option<&Window>,
    ) -> Result<(), ModelError> {
        let stack = self.sample_planes(
            target,
            &image.image.window,
            image.image.pixelscale,
            window,
            &[],
        )?;
        image.image.accumulate(&stack[0])?;
        Ok(())
    }

    /// Build an [`EvalPlan`] for the given derivative spec indices.
    pub(crate) fn plan(&self, deriv: &[usize], suppress_center: bool) -> Result<EvalPlan, ModelError> {
        let specs = self.kind.specs();
        let suppressed = deriv
            .iter()
            .map(|&si| {
                suppress_center && matches!(specs[si].name, "center_x" | "center_y")
            })
            .collect();
        Ok(EvalPlan {
            eval: Evaluator::new(self.kind, &self.params)?,
            nspecs: specs.len(),
            deriv: deriv.to_vec(),
            suppressed,
        })
    }

    /// Run the full sampling pipeline and return the plane stack aligned to
    /// the caller's grid (`base_window` at `base_ps`). Plane 0 is the sampled
    /// image; planes 1.. are partials for `deriv` (spec indices).
    pub(crate) fn sample_planes(
        &self,
        target: &TargetImage,
        base_window: &Window,
        base_ps: f64,
        sub_window: Option<&Window>,
        deriv: &[usize],
    ) -> Result<Stack, ModelError> {
        let working_window = match sub_window {
            Some(w) => *w & *base_window,
            None => *base_window,
        };

        match self.psf_mode {
            PsfMode::Window => Err(ModelError::UnsupportedPsfMode),
            PsfMode::None => {
                let plan = self.plan(deriv, false)?;
                let mut stack = plan.stack(working_window, base_ps);
                let int_window = self.integrate_window(base_ps)?;
                self.integrate_stack(&mut stack, &plan, int_window, self.integrate.depth)?;
                Ok(stack)
            }
            PsfMode::Full => {
                let psf = target.psf().ok_or(ModelError::MissingPsf)?;
                let upscale = target.psf_upscale();
                let border = target.psf_border();
                let border_px = target.psf_border_px();

                // Pad so convolution edge effects stay inside the border
                // that is cropped away at the end.
                let padded = working_window.pad(border);
                let wps = base_ps / upscale as f64;

                // Fractional offset between the model center and the nearest
                // pixel-center-aligned point of the working grid. Shifting
                // the evaluation grid by this offset centers the model
                // exactly on a pixel; the PSF is then resampled by the same
                // offset so convolution puts the content back at the true
                // center.
                let shift = if self.kind.has_center() {
                    let c = self.center()?;
                    let mut s = [0.0; 2];
                    for k in 0..2 {
                        let phase = padded.origin[k] / wps + 0.5;
                        let align = phase - phase.floor();
                        s[k] = c[k] - ((c[k] / wps - align).round() + align) * wps;
                    }
                    s
                } else {
                    [0.0, 0.0]
                };

                let plan = self.plan(deriv, true)?;
                let mut stack = plan.stack(padded.translate(shift), wps);
                let int_window = self.integrate_window(wps)?;
                self.integrate_stack(&mut stack, &plan, int_window, self.integrate.depth)?;

                // Resample the PSF by the sub-pixel offset in working
                // pixels, then convolve every plane with the normalized
                // result. convolve_same is true convolution, so a kernel
                // built for +shift moves the content by +shift.
                let kernel_shift = [shift[0] / wps, shift[1] / wps];
                let shifted_psf = convolve_same(psf, &lanczos_shift_kernel(kernel_shift, LANCZOS_ORDER));
                let norm = shifted_psf.sum();
                let kernel = shifted_psf.mapv(|v| v / norm);

                let value_pre: Array2<f64> = stack[0].data.clone();
                for plane in stack.iter_mut() {
                    plane.data = fft_convolve_same(&plane.data, &kernel);
                }

                // Center derivative planes: the evaluation grid moves with
                // the center, so the sampled values are locally constant in
                // it and the whole center dependence sits in the shift
                // kernel. d(kernel_shift)/d(center) = 1/wps.
                if self.kind.has_center() && !deriv.is_empty() {
                    let (dk_dax, dk_day) = lanczos_shift_kernel_grad(kernel_shift, LANCZOS_ORDER);
                    let specs = self.kind.specs();
                    for (j, &si) in deriv.iter().enumerate() {
                        let dl = match specs[si].name {
                            "center_x" => &dk_dax,
                            "center_y" => &dk_day,
                            _ => continue,
                        };
                        let dg = convolve_same(psf, dl);
                        let dg_sum = dg.sum();
                        // Quotient rule through the kernel normalization,
                        // then the -1/wps chain factor.
                        let mut dk = dg;
                        dk.zip_mut_with(&kernel, |g, k| {
                            *g = (*g - k * dg_sum) / norm * (1.0 / wps)
                        });
                        let term = fft_convolve_same(&value_pre, &dk);
                        stack[j + 1].data += &term;
                    }
                }

                // Undo the sub-pixel shift, bin back to the data resolution
                // (pixel sums, fluxes are additive), and crop the padding.
                for plane in stack.iter_mut() {
                    plane.window = plane.window.translate([-shift[0], -shift[1]]);
                }
                Ok(stack
                    .iter()
                    .map(|plane| plane.reduce(upscale).crop(border_px))
                    .collect())
            }
        }
    }

    /// Characteristic radius of the profile's curved core, when the defining
    /// parameter has a value.
    fn characteristic_radius(&self) -> Option<f64> {
        let name = match self.kind {
            ProfileKind::Gaussian => "sigma",
            ProfileKind::Exponential | ProfileKind::Moffat => "rd",
            ProfileKind::Sersic => "re",
            ProfileKind::Sky => return None,
        };
        self.params.value(name).ok()
    }

    /// Window around the model center in which to refine the sampling: at
    /// least `window_px` working pixels on a side, widened to span five
    /// characteristic radii on each side of the center. Refining only the
    /// peak of a wide profile would remove the midpoint overestimate there
    /// while leaving the compensating tail underestimate in place, biasing
    /// the total flux low.
    fn integrate_window(&self, pixelscale: f64) -> Result<Window, ModelError> {
        let mut size = self.integrate.window_px as f64 * pixelscale;
        if let Some(r) = self.characteristic_radius() {
            size = size.max(10.0 * r);
        }
        Ok(Window::from_center(self.center()?, [size, size]))
    }

    /// Recursive fixed-depth supersampling. Evaluates the stack on a
    /// `factor`x finer grid over `window`, recurses into a shrunken window,
    /// then replaces the coarse pixels with the flux-conserving reduction of
    /// the fine grid. Zero overlap terminates the recursion silently.
    fn integrate_stack(
        &self,
        stack: &mut Stack,
        plan: &EvalPlan,
        window: Window,
        depth: usize,
    ) -> Result<(), ModelError> {
        if depth == 0 || self.integrate.mode == IntegrateMode::None {
            return Ok(());
        }
        if window.overlap_frac(&stack[0].window) <= 0.0 {
            return Ok(());
        }
        // Snap the refinement region to the working grid so the fine grid
        // nests exactly inside the coarse pixels it will replace.
        let ps = stack[0].pixelscale;
        let (rows, cols) = (window & stack[0].window).indices_in(&stack[0].window, ps);
        if rows.is_empty() || cols.is_empty() {
            return Ok(());
        }
        let working = Window::new(
            [
                stack[0].window.origin[0] + cols.start as f64 * ps,
                stack[0].window.origin[1] + rows.start as f64 * ps,
            ],
            [(cols.len()) as f64 * ps, (rows.len()) as f64 * ps],
        );
        let fine_ps = ps / self.integrate.factor as f64;
        log::debug!(
            "integrating {} at depth {depth}: window {:?} at pixelscale {fine_ps}",
            self.name,
            working
        );
        let mut fine = plan.stack(working, fine_ps);

        // Shrink the window for the next level, correcting pixel-count
        // parity so the recursive grid stays aligned with this one: odd when
        // the window center sits on a fine-pixel center, even when it sits
        // on an edge (within a quarter-pixel tolerance).
        let mut shape = [0.0; 2];
        for k in 0..2 {
            let n_px = (window.shape[k] / fine_ps).round();
            let mut m = (n_px / self.integrate.recursion_factor as f64).round() as i64;
            let phase = (window.center()[k] - fine[0].window.origin[k]) / fine_ps;
            let frac = phase - phase.floor();
            let aligned = (frac - 0.5).abs() <= 0.25;
            m = m + 1 - m % 2 + 1 - i64::from(aligned);
            shape[k] = m as f64 * fine_ps;
        }
        let recursive = Window::from_center(window.center(), shape);
        self.integrate_stack(&mut fine, plan, recursive, depth - 1)?;

        for (coarse, refined) in stack.iter_mut().zip(fine.iter()) {
            coarse.replace(&refined.reduce(self.integrate.factor))?;
        }
        Ok(())
    }

    /// Set starting parameter values from the target data. An unset center
    /// starts at the window center and is refined by an iterative windowed
    /// center-of-mass; a failed refinement (off the image, or zero mass) is
    /// recovered by keeping the window center. An unset sky level starts at
    /// the mean surface brightness of the window. Remaining unset parameters
    /// get rough data-driven starts: scale radii from the window size,
    /// brightness from the surface brightness at the center pixel, shape
    /// parameters from mid-range values. Already-set values are respected
    /// as-is.
    pub fn initialize(&mut self, target: &TargetImage) -> Result<(), ModelError> {
        if !self.kind.has_center() {
            if !self.params.is_set("sky")? {
                let area = target.view(&self.window);
                let n = area.image.data.len().max(1) as f64;
                let ps = target.pixelscale();
                self.params
                    .set("sky", area.image.data.sum() / n / (ps * ps))?;
            }
            return Ok(());
        }

        if !(self.params.is_set("center_x")? && self.params.is_set("center_y")?) {
            let fallback = self.window.center();
            self.params.set("center_x", fallback[0])?;
            self.params.set("center_y", fallback[1])?;
            let locked = self.params.is_locked("center_x")?
                && self.params.is_locked("center_y")?;
            if !locked {
                let area = target.view(&self.window);
                let ps = area.pixelscale();
                let start = [
                    (fallback[1] - area.window().origin[1]) / ps - 0.5,
                    (fallback[0] - area.window().origin[0]) / ps - 0.5,
                ];
                match center_of_mass(start, &area.image.data) {
                    Some(com) => {
                        self.params.set(
                            "center_x",
                            area.window().origin[0] + (com[1] + 0.5) * ps,
                        )?;
                        self.params.set(
                            "center_y",
                            area.window().origin[1] + (com[0] + 0.5) * ps,
                        )?;
                    }
                    None => {
                        log::warn!(
                            "{}: center of mass failed, keeping the window center",
                            self.name
                        );
                    }
                }
            }
        }

        let area = target.view(&self.window);
        let ps = area.pixelscale();
        let scale = (self.window.shape[0].min(self.window.shape[1]) / 10.0).max(ps);
        let center = self.center()?;
        let (ny, nx) = area.image.data.dim();
        let peak = if ny > 0 && nx > 0 {
            let col = (((center[0] - area.window().origin[0]) / ps - 0.5).round())
                .clamp(0.0, (nx - 1) as f64) as usize;
            let row = (((center[1] - area.window().origin[1]) / ps - 0.5).round())
                .clamp(0.0, (ny - 1) as f64) as usize;
            (area.image.data[[row, col]] / (ps * ps)).max(0.0)
        } else {
            0.0
        };
        for spec in self.kind.specs() {
            if self.params.is_set(spec.name)? {
                continue;
            }
            let start = match spec.name {
                "sigma" | "rd" | "re" => scale,
                "amplitude" | "i0" | "ie" => peak,
                "q" => 0.9,
                "pa" => 0.0,
                "n" => 2.0,
                "beta" => 2.5,
                _ => continue,
            };
            self.params.set(spec.name, start)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::Array2;
    use std::f64::consts::PI;

    fn gaussian_model(window: Window, cx: f64, cy: f64, sigma: f64, amp: f64) -> Model {
        let mut m = Model::new("g", ProfileKind::Gaussian, window);
        m.params.set("center_x", cx).unwrap();
        m.params.set("center_y", cy).unwrap();
        m.params.set("sigma", sigma).unwrap();
        m.params.set("amplitude", amp).unwrap();
        m
    }

    fn flat_target(n: usize, ps: f64) -> TargetImage {
        TargetImage::new(Array2::zeros((n, n)), ps, [0.0, 0.0], "t")
    }

    #[test]
    fn gaussian_total_flux_matches_analytic_integral() {
        let window = Window::new([0.0, 0.0], [50.0, 50.0]);
        let model = gaussian_model(window, 25.0, 25.0, 3.0, 1.0);
        let target = flat_target(50, 1.0);
        let image = model.sample(&target).unwrap();
        let expected = 2.0 * PI * 9.0;
        assert_relative_eq!(image.total_flux(), expected, max_relative = 1e-3);

        // For a profile this well resolved, pixel-center sums are already
        // nearly exact; refinement must not push the total away from them.
        let mut direct = model.clone();
        direct.integrate.mode = IntegrateMode::None;
        let coarse = direct.sample(&target).unwrap();
        assert_relative_eq!(
            image.total_flux(),
            coarse.total_flux(),
            max_relative = 1e-4
        );
    }

    #[test]
    fn depth_zero_is_bit_identical_to_direct_evaluation() {
        let window = Window::new([0.0, 0.0], [20.0, 20.0]);
        let target = flat_target(20, 1.0);

        let mut direct = gaussian_model(window, 10.2, 9.7, 0.8, 2.0);
        direct.integrate.mode = IntegrateMode::None;
        let a = direct.sample(&target).unwrap();

        let mut depth0 = gaussian_model(window, 10.2, 9.7, 0.8, 2.0);
        depth0.integrate.depth = 0;
        let b = depth0.sample(&target).unwrap();

        assert_eq!(a.image.data, b.image.data);
    }

    #[test]
    fn integration_is_identity_on_a_flat_profile() {
        let window = Window::new([0.0, 0.0], [16.0, 16.0]);
        let target = flat_target(16, 1.0);
        let mut sky = Model::new("sky", ProfileKind::Sky, window);
        sky.params.set("sky", 0.7).unwrap();

        let refined = sky.sample(&target).unwrap();
        sky.integrate.mode = IntegrateMode::None;
        let direct = sky.sample(&target).unwrap();

        for (a, b) in refined.image.data.iter().zip(direct.image.data.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn integration_refines_a_cuspy_profile() {
        let window = Window::new([0.0, 0.0], [20.0, 20.0]);
        let target = flat_target(20, 1.0);
        let mut m = Model::new("exp", ProfileKind::Exponential, window);
        for (k, v) in [
            ("center_x", 10.5),
            ("center_y", 10.5),
            ("q", 1.0),
            ("pa", 0.0),
            ("rd", 0.3),
            ("i0", 10.0),
        ] {
            m.params.set(k, v).unwrap();
        }
        let refined = m.sample(&target).unwrap();
        let mut direct = m.clone();
        direct.integrate.mode = IntegrateMode::None;
        let coarse = direct.sample(&target).unwrap();
        // Pixel-center evaluation overestimates the cusp pixel; the
        // supersampled value must be smaller and the far field untouched.
        assert!(refined.image.data[[10, 10]] < coarse.image.data[[10, 10]]);
        assert_abs_diff_eq!(
            refined.image.data[[0, 0]],
            coarse.image.data[[0, 0]],
            epsilon = 1e-12
        );
    }

    #[test]
    fn window_psf_mode_fails_loudly() {
        let window = Window::new([0.0, 0.0], [10.0, 10.0]);
        let mut m = gaussian_model(window, 5.0, 5.0, 1.0, 1.0);
        m.psf_mode = PsfMode::Window;
        let target = flat_target(10, 1.0);
        assert!(matches!(
            m.sample(&target),
            Err(ModelError::UnsupportedPsfMode)
        ));
    }

    #[test]
    fn full_psf_mode_without_a_psf_is_an_error() {
        let window = Window::new([0.0, 0.0], [10.0, 10.0]);
        let mut m = gaussian_model(window, 5.0, 5.0, 1.0, 1.0);
        m.psf_mode = PsfMode::Full;
        let target = flat_target(10, 1.0);
        assert!(matches!(m.sample(&target), Err(ModelError::MissingPsf)));
    }

    #[test]
    fn convolved_sampling_conserves_flux() {
        let window = Window::new([0.0, 0.0], [21.0, 21.0]);
        let mut m = gaussian_model(window, 10.5, 10.5, 1.5, 2.0);
        m.psf_mode = PsfMode::Full;
        let mut target = flat_target(21, 1.0);
        let psf = Array2::from_shape_fn((5, 5), |(r, c)| {
            let d2 = (r as f64 - 2.0).powi(2) + (c as f64 - 2.0).powi(2);
            (-d2 / 2.0).exp()
        });
        target.set_psf(Some(psf), 1).unwrap();

        let convolved = m.sample(&target).unwrap();
        m.psf_mode = PsfMode::None;
        let plain = m.sample(&target).unwrap();
        // The source sits well inside the window, so convolution with a
        // normalized kernel moves flux around without losing it.
        assert_relative_eq!(
            convolved.total_flux(),
            plain.total_flux(),
            max_relative = 1e-6
        );
        assert_eq!(convolved.image.data.dim(), plain.image.data.dim());
    }

    #[test]
    fn upscaled_psf_keeps_flux_and_position() {
        let window = Window::new([0.0, 0.0], [21.0, 21.0]);
        let mut m = gaussian_model(window, 10.25, 10.25, 0.12, 40.0);
        m.psf_mode = PsfMode::Full;
        let mut target = flat_target(21, 1.0);
        // PSF sampled on a 2x finer grid than the data.
        let psf = Array2::from_shape_fn((11, 11), |(r, c)| {
            let d2 = (r as f64 - 5.0).powi(2) + (c as f64 - 5.0).powi(2);
            (-d2 / (2.0 * 2.4 * 2.4)).exp()
        });
        target.set_psf(Some(psf), 2).unwrap();

        let convolved = m.sample(&target).unwrap();
        m.psf_mode = PsfMode::None;
        let plain = m.sample(&target).unwrap();
        assert_eq!(convolved.image.data.dim(), plain.image.data.dim());
        assert_relative_eq!(
            convolved.total_flux(),
            plain.total_flux(),
            max_relative = 1e-4
        );

        let image = &convolved.image;
        let (mut flux, mut mx, mut my) = (0.0, 0.0, 0.0);
        for ((r, c), &v) in image.data.indexed_iter() {
            let [x, y] = image.coordinate(r, c);
            flux += v;
            mx += v * x;
            my += v * y;
        }
        assert_abs_diff_eq!(mx / flux, 10.25, epsilon = 0.02);
        assert_abs_diff_eq!(my / flux, 10.25, epsilon = 0.02);
    }

    #[test]
    fn initialize_falls_back_to_window_center_on_blank_data() {
        let window = Window::new([0.0, 0.0], [10.0, 10.0]);
        let mut m = Model::new("g", ProfileKind::Gaussian, window);
        let target = flat_target(10, 1.0);
        m.initialize(&target).unwrap();
        assert_abs_diff_eq!(m.params.value("center_x").unwrap(), 5.0);
        assert_abs_diff_eq!(m.params.value("center_y").unwrap(), 5.0);
    }

    #[test]
    fn initialize_refines_toward_a_bright_source() {
        let window = Window::new([0.0, 0.0], [20.0, 20.0]);
        let mut data = Array2::zeros((20, 20));
        // Bright blob near (x=12.5, y=8.5).
        for r in 0..20usize {
            for c in 0..20usize {
                let d2 = (c as f64 - 12.0).powi(2) + (r as f64 - 8.0).powi(2);
                data[[r, c]] = (-d2 / 4.0).exp();
            }
        }
        let target = TargetImage::new(data, 1.0, [0.0, 0.0], "t");
        let mut m = Model::new("g", ProfileKind::Gaussian, window);
        m.initialize(&target).unwrap();
        assert_abs_diff_eq!(m.params.value("center_x").unwrap(), 12.5, epsilon = 0.5);
        assert_abs_diff_eq!(m.params.value("center_y").unwrap(), 8.5, epsilon = 0.5);
    }
}
