//! Per-pixel partial derivatives of the sampled image.
//!
//! Three strategies produce the same [`JacobianImage`]:
//!
//! - **full** — one pipeline pass carrying every parameter's derivative
//!   plane alongside the value plane (forward-mode propagation; the stages
//!   after evaluation are linear, see [`crate::model`]). Fastest, highest
//!   peak memory.
//! - **single** — the same propagation one parameter at a time.
//! - **finite** — central differences of the plain sampling pipeline under
//!   perturbed parameters. The slowest and least accurate, but it makes no
//!   differentiability assumption, so it is the reference the other two
//!   modes are validated against (and the fallback for profiles without
//!   analytic partials).
//!
//! Planes are tagged `"<model>|<parameter>"` so stacks from different models
//! concatenate into a group jacobian without collisions.

use crate::image::{Image, JacobianImage};
use crate::model::{JacobianMode, Model, ModelError};
use crate::target::TargetImage;

/// Default central-difference step for a parameter value.
fn default_step(value: f64) -> f64 {
    (value.abs() * 1e-4).max(1e-7)
}

impl Model {
    /// Compute the jacobian for the current (or given) free-parameter
    /// vector, using this model's configured [`JacobianMode`].
    pub fn jacobian(
        &mut self,
        target: &TargetImage,
        parameters: Option<&[f64]>,
    ) -> Result<JacobianImage, ModelError> {
        if let Some(p) = parameters {
            self.params.set_free_vector(p)?;
        }
        self.jacobian_current(target)
    }

    /// Jacobian at the current parameter values.
    pub fn jacobian_current(&self, target: &TargetImage) -> Result<JacobianImage, ModelError> {
        let specs = self.kind.specs();
        let mut deriv = Vec::new();
        for (i, spec) in specs.iter().enumerate() {
            if !self.params.is_locked(spec.name)? {
                deriv.push(i);
            }
        }
        let mut jac = JacobianImage::zeros(
            self.window,
            target.pixelscale(),
            self.qualified_free_names(),
            target.id.clone(),
        );

        match self.jacobian_mode {
            JacobianMode::Chunk => Err(ModelError::UnsupportedJacobianMode("chunk")),
            JacobianMode::Full => {
                let stack = self.sample_planes(
                    target,
                    &self.window,
                    target.pixelscale(),
                    None,
                    &deriv,
                )?;
                for j in 0..deriv.len() {
                    jac.scatter(&stack[j + 1], j)?;
                }
                Ok(jac)
            }
            JacobianMode::Single => {
                for (j, &si) in deriv.iter().enumerate() {
                    let stack = self.sample_planes(
                        target,
                        &self.window,
                        target.pixelscale(),
                        None,
                        &[si],
                    )?;
                    jac.scatter(&stack[1], j)?;
                }
                Ok(jac)
            }
            JacobianMode::Finite => {
                self.jacobian_finite_into(target, None, &mut jac)?;
                Ok(jac)
            }
        }
    }

    /// Central-difference jacobian with caller-supplied per-parameter steps
    /// (defaulted from the parameter magnitudes when absent).
    pub fn jacobian_finite(
        &self,
        target: &TargetImage,
        steps: Option<&[f64]>,
    ) -> Result<JacobianImage, ModelError> {
        let mut jac = JacobianImage::zeros(
            self.window,
            target.pixelscale(),
            self.qualified_free_names(),
            target.id.clone(),
        );
        self.jacobian_finite_into(target, steps, &mut jac)?;
        Ok(jac)
    }

    fn jacobian_finite_into(
        &self,
        target: &TargetImage,
        steps: Option<&[f64]>,
        jac: &mut JacobianImage,
    ) -> Result<(), ModelError> {
        let theta = self.params.free_vector()?;
        if let Some(steps) = steps {
            if steps.len() != theta.len() {
                return Err(ModelError::Param(
                    crate::params::ParamError::LengthMismatch {
                        expected: theta.len(),
                        got: steps.len(),
                    },
                ));
            }
        }
        for (j, &value) in theta.iter().enumerate() {
            let h = steps.map_or_else(|| default_step(value), |s| s[j]);
            let mut up = self.clone();
            let mut perturbed = theta.clone();
            perturbed[j] = value + h;
            up.params.set_free_vector(&perturbed)?;
            let mut down = self.clone();
            perturbed[j] = value - h;
            down.params.set_free_vector(&perturbed)?;

            let hi = up.sample(target)?;
            let lo = down.sample(target)?;
            let mut diff = hi.image.data;
            diff.zip_mut_with(&lo.image.data, |a, b| *a = (*a - b) / (2.0 * h));
            let plane = Image {
                data: diff,
                pixelscale: hi.image.pixelscale,
                zeropoint: None,
                window: hi.image.window,
            };
            jac.scatter(&plane, j)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IntegrateMode, PsfMode};
    use crate::profile::ProfileKind;
    use crate::window::Window;
    use ndarray::Array2;

    fn gaussian_model(window: Window) -> Model {
        let mut m = Model::new("g", ProfileKind::Gaussian, window);
        m.params.set("center_x", 10.3).unwrap();
        m.params.set("center_y", 9.8).unwrap();
        m.params.set("sigma", 1.6).unwrap();
        m.params.set("amplitude", 2.0).unwrap();
        m
    }

    fn flat_target(n: usize) -> TargetImage {
        TargetImage::new(Array2::zeros((n, n)), 1.0, [0.0, 0.0], "t")
    }

    fn max_abs(a: &ndarray::Array3<f64>) -> f64 {
        a.iter().fold(0.0f64, |m, v| m.max(v.abs()))
    }

    fn assert_planes_close(a: &JacobianImage, b: &JacobianImage, tol: f64) {
        assert_eq!(a.params, b.params);
        assert_eq!(a.data.dim(), b.data.dim());
        let scale = max_abs(&a.data).max(max_abs(&b.data)).max(1e-12);
        for (x, y) in a.data.iter().zip(b.data.iter()) {
            assert!(
                (x - y).abs() <= tol * scale,
                "planes differ: {x} vs {y} (scale {scale})"
            );
        }
    }

    #[test]
    fn full_single_and_finite_agree_without_convolution() {
        let window = Window::new([0.0, 0.0], [20.0, 20.0]);
        let target = flat_target(20);
        let mut m = gaussian_model(window);
        m.integrate.mode = IntegrateMode::None;

        m.jacobian_mode = JacobianMode::Full;
        let full = m.jacobian_current(&target).unwrap();
        m.jacobian_mode = JacobianMode::Single;
        let single = m.jacobian_current(&target).unwrap();
        m.jacobian_mode = JacobianMode::Finite;
        let finite = m.jacobian_current(&target).unwrap();

        // Full and single are the same propagation, so they match tightly;
        // finite carries the truncation error of its step.
        assert_planes_close(&full, &single, 1e-12);
        assert_planes_close(&full, &finite, 1e-5);
    }

    #[test]
    fn modes_agree_with_adaptive_integration_enabled() {
        let window = Window::new([0.0, 0.0], [20.0, 20.0]);
        let target = flat_target(20);
        let mut m = gaussian_model(window);

        m.jacobian_mode = JacobianMode::Full;
        let full = m.jacobian_current(&target).unwrap();
        m.jacobian_mode = JacobianMode::Finite;
        let finite = m.jacobian_current(&target).unwrap();
        assert_planes_close(&full, &finite, 1e-5);
    }

    #[test]
    fn modes_agree_under_psf_convolution() {
        let window = Window::new([0.0, 0.0], [21.0, 21.0]);
        let mut target = flat_target(21);
        let psf = Array2::from_shape_fn((5, 5), |(r, c)| {
            let d2 = (r as f64 - 2.0).powi(2) + (c as f64 - 2.0).powi(2);
            (-d2 / 2.0).exp()
        });
        target.set_psf(Some(psf), 1).unwrap();
        let mut m = gaussian_model(window);
        m.psf_mode = PsfMode::Full;

        m.jacobian_mode = JacobianMode::Full;
        let full = m.jacobian_current(&target).unwrap();
        m.jacobian_mode = JacobianMode::Single;
        let single = m.jacobian_current(&target).unwrap();
        m.jacobian_mode = JacobianMode::Finite;
        let finite = m.jacobian_current(&target).unwrap();

        assert_planes_close(&full, &single, 1e-12);
        assert_planes_close(&full, &finite, 1e-4);
    }

    #[test]
    fn planes_are_tagged_with_qualified_names() {
        let window = Window::new([0.0, 0.0], [10.0, 10.0]);
        let target = flat_target(10);
        let mut m = gaussian_model(window);
        m.params.set_locked("sigma", true).unwrap();
        let jac = m.jacobian_current(&target).unwrap();
        assert_eq!(jac.params, vec!["g|center_x", "g|center_y", "g|amplitude"]);
        assert_eq!(jac.data.dim().2, 3);
        assert_eq!(jac.target_id, "t");
    }

    #[test]
    fn chunk_mode_fails_loudly() {
        let window = Window::new([0.0, 0.0], [10.0, 10.0]);
        let target = flat_target(10);
        let mut m = gaussian_model(window);
        m.jacobian_mode = JacobianMode::Chunk;
        assert!(matches!(
            m.jacobian_current(&target),
            Err(ModelError::UnsupportedJacobianMode("chunk"))
        ));
    }

    #[test]
    fn locked_sky_parameter_yields_an_empty_jacobian() {
        let window = Window::new([0.0, 0.0], [8.0, 8.0]);
        let target = flat_target(8);
        let mut m = Model::new("sky", ProfileKind::Sky, window);
        m.params.set("sky", 0.4).unwrap();
        m.params.set_locked("sky", true).unwrap();
        let jac = m.jacobian_current(&target).unwrap();
        assert!(jac.params.is_empty());
        assert_eq!(jac.data.dim(), (8, 8, 0));
    }
}
