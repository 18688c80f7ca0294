//! Treating an ordered list of models as one model.
//!
//! A [`GroupModel`] samples each member into a shared accumulator whose
//! window is the union of the non-locked members' windows, and builds a
//! group jacobian by scattering each member's plane stack into the matching
//! pixel index range of one full-size stack. The target is injected
//! explicitly into every call; the group holds no target reference and no
//! member ever mutates it. Members are independent, so their jacobians are
//! computed in parallel — each one lands in its own plane range of the
//! shared output.

use crate::image::{Image, ImageError, JacobianImage, ModelImage};
use crate::model::{Model, ModelError};
use crate::params::ParamError;
use crate::target::TargetImage;
use crate::window::Window;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GroupError {
    #[error("group '{0}' has no unlocked members, so it covers no window")]
    Empty(String),

    #[error("free parameter vector length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Param(#[from] ParamError),
}

/// An ordered list of models composed additively over a shared window.
#[derive(Debug, Clone)]
pub struct GroupModel {
    pub name: String,
    pub models: Vec<Model>,
}

impl GroupModel {
    pub fn new(name: impl Into<String>, models: Vec<Model>) -> Self {
        Self {
            name: name.into(),
            models,
        }
    }

    pub fn add_model(&mut self, model: Model) {
        self.models.push(model);
    }

    /// Union of the non-locked members' windows.
    pub fn window(&self) -> Option<Window> {
        self.models
            .iter()
            .filter(|m| !m.locked)
            .map(|m| m.window)
            .reduce(|a, b| a | b)
    }

    /// Qualified free-parameter names across all non-locked members, in
    /// member order then declaration order.
    pub fn free_names(&self) -> Vec<String> {
        self.models
            .iter()
            .filter(|m| !m.locked)
            .flat_map(|m| m.qualified_free_names())
            .collect()
    }

    /// Current free-parameter vector across all non-locked members.
    pub fn free_vector(&self) -> Result<Vec<f64>, GroupError> {
        let mut out = Vec::new();
        for model in self.models.iter().filter(|m| !m.locked) {
            out.extend(model.params.free_vector()?);
        }
        Ok(out)
    }

    /// Write a group-level free-parameter vector back into the members.
    pub fn set_free_vector(&mut self, values: &[f64]) -> Result<(), GroupError> {
        let expected: usize = self
            .models
            .iter()
            .filter(|m| !m.locked)
            .map(|m| m.params.free_names().len())
            .sum();
        if values.len() != expected {
            return Err(GroupError::LengthMismatch {
                expected,
                got: values.len(),
            });
        }
        let mut start = 0;
        for model in self.models.iter_mut().filter(|m| !m.locked) {
            let n = model.params.free_names().len();
            model.params.set_free_vector(&values[start..start + n])?;
            start += n;
        }
        Ok(())
    }

    /// Initialize members in order, subtracting each member's sample from a
    /// working copy of the target so later members see the residual.
    pub fn initialize(&mut self, target: &TargetImage) -> Result<(), GroupError> {
        let mut residual = target.clone();
        for model in &mut self.models {
            model.initialize(&residual)?;
            let sampled = model.sample(&residual)?;
            residual.image.subtract(&sampled.image)?;
        }
        Ok(())
    }

    /// Sample every member into one accumulator over the group window.
    pub fn sample(&self, target: &TargetImage) -> Result<ModelImage, GroupError> {
        let window = self
            .window()
            .ok_or_else(|| GroupError::Empty(self.name.clone()))?;
        let mut image = ModelImage::zeros(window, target.pixelscale(), target.id.clone());
        for model in &self.models {
            model.sample_into(target, &mut image, None)?;
        }
        Ok(image)
    }

    /// Group jacobian: one full-size plane stack over the group window, with
    /// each member's planes scattered into that member's index range.
    pub fn jacobian(
        &mut self,
        target: &TargetImage,
        parameters: Option<&[f64]>,
    ) -> Result<JacobianImage, GroupError> {
        if let Some(p) = parameters {
            self.set_free_vector(p)?;
        }
        let window = self
            .window()
            .ok_or_else(|| GroupError::Empty(self.name.clone()))?;
        let mut jac = JacobianImage::zeros(
            window,
            target.pixelscale(),
            self.free_names(),
            target.id.clone(),
        );

        // Members are independent and each writes a disjoint plane range;
        // the shared output was sized above, before any parallel work.
        let subs: Result<Vec<JacobianImage>, ModelError> = self
            .models
            .par_iter()
            .filter(|m| !m.locked)
            .map(|m| m.jacobian_current(target))
            .collect();

        let mut offset = 0;
        for sub in subs? {
            for p in 0..sub.params.len() {
                let plane = Image {
                    data: sub.plane(p).to_owned(),
                    pixelscale: sub.pixelscale,
                    zeropoint: None,
                    window: sub.window,
                };
                jac.scatter(&plane, offset + p)?;
            }
            offset += sub.params.len();
        }
        Ok(jac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileKind;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::Array2;

    fn point_source(name: &str, window: Window, cx: f64, cy: f64) -> Model {
        let mut m = Model::new(name, ProfileKind::Gaussian, window);
        m.params.set("center_x", cx).unwrap();
        m.params.set("center_y", cy).unwrap();
        m.params.set("sigma", 0.8).unwrap();
        m.params.set("amplitude", 1.0).unwrap();
        m
    }

    fn flat_target(n: usize) -> TargetImage {
        TargetImage::new(Array2::zeros((n, n)), 1.0, [0.0, 0.0], "t")
    }

    #[test]
    fn group_window_is_the_union_of_unlocked_members() {
        let a = point_source("a", Window::new([0.0, 0.0], [10.0, 10.0]), 5.0, 5.0);
        let b = point_source("b", Window::new([20.0, 0.0], [10.0, 10.0]), 25.0, 5.0);
        let mut locked = point_source("c", Window::new([0.0, 40.0], [10.0, 10.0]), 5.0, 45.0);
        locked.locked = true;
        let group = GroupModel::new("grp", vec![a, b, locked]);
        let w = group.window().unwrap();
        assert_eq!(w.origin, [0.0, 0.0]);
        assert_eq!(w.shape, [30.0, 10.0]);
    }

    #[test]
    fn disjoint_sources_add_their_fluxes() {
        let target = flat_target(40);
        let a = point_source("a", Window::new([0.0, 0.0], [15.0, 15.0]), 7.5, 7.5);
        let b = point_source("b", Window::new([20.0, 20.0], [15.0, 15.0]), 27.5, 27.5);
        let fa = a.sample(&target).unwrap().total_flux();
        let fb = b.sample(&target).unwrap().total_flux();
        let group = GroupModel::new("grp", vec![a, b]);
        let combined = group.sample(&target).unwrap();
        assert_relative_eq!(combined.total_flux(), fa + fb, max_relative = 1e-12);
    }

    #[test]
    fn group_jacobian_scatters_member_planes_into_place() {
        let target = flat_target(40);
        let a = point_source("a", Window::new([0.0, 0.0], [15.0, 15.0]), 7.5, 7.5);
        let b = point_source("b", Window::new([20.0, 20.0], [15.0, 15.0]), 27.5, 27.5);
        let sub_b = b.jacobian_current(&target).unwrap();
        let mut group = GroupModel::new("grp", vec![a, b]);
        let jac = group.jacobian(&target, None).unwrap();

        assert_eq!(jac.params.len(), 8);
        assert_eq!(jac.params[4], "b|center_x");

        // Member b's amplitude plane must land, value for value, in b's
        // index range of the group stack.
        let (rows, cols) = sub_b.window.indices_in(&jac.window, jac.pixelscale);
        let plane = jac.plane(7);
        for (ri, r) in rows.clone().enumerate() {
            for (ci, c) in cols.clone().enumerate() {
                assert_abs_diff_eq!(
                    plane[[r, c]],
                    sub_b.plane(3)[[ri, ci]],
                    epsilon = 1e-12
                );
            }
        }
        // And nothing of member b leaks outside its window.
        assert_abs_diff_eq!(plane[[0, 0]], 0.0);
    }

    #[test]
    fn empty_group_is_an_error() {
        let group = GroupModel::new("grp", vec![]);
        let target = flat_target(10);
        assert!(matches!(group.sample(&target), Err(GroupError::Empty(_))));
    }

    #[test]
    fn set_free_vector_splits_across_members() {
        let a = point_source("a", Window::new([0.0, 0.0], [10.0, 10.0]), 5.0, 5.0);
        let b = point_source("b", Window::new([0.0, 0.0], [10.0, 10.0]), 5.0, 5.0);
        let mut group = GroupModel::new("grp", vec![a, b]);
        let mut v = group.free_vector().unwrap();
        assert_eq!(v.len(), 8);
        v[4] = 6.25;
        group.set_free_vector(&v).unwrap();
        assert_abs_diff_eq!(group.models[1].params.value("center_x").unwrap(), 6.25);
        assert!(matches!(
            group.set_free_vector(&v[..3]),
            Err(GroupError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn initialize_fits_members_against_the_residual() {
        let mut data = Array2::zeros((30, 30));
        for r in 0..30usize {
            for c in 0..30usize {
                let d1 = (c as f64 - 8.0).powi(2) + (r as f64 - 8.0).powi(2);
                let d2 = (c as f64 - 21.0).powi(2) + (r as f64 - 21.0).powi(2);
                data[[r, c]] = 10.0 * (-d1 / 4.0).exp() + 10.0 * (-d2 / 4.0).exp();
            }
        }
        let target = TargetImage::new(data, 1.0, [0.0, 0.0], "t");
        let a = Model::new("a", ProfileKind::Gaussian, Window::new([0.0, 0.0], [16.0, 16.0]));
        let b = Model::new(
            "b",
            ProfileKind::Gaussian,
            Window::new([14.0, 14.0], [16.0, 16.0]),
        );
        let mut group = GroupModel::new("grp", vec![a, b]);
        group.initialize(&target).unwrap();
        assert_abs_diff_eq!(
            group.models[0].params.value("center_x").unwrap(),
            8.5,
            epsilon = 0.5
        );
        assert_abs_diff_eq!(
            group.models[1].params.value("center_y").unwrap(),
            21.5,
            epsilon = 0.5
        );
    }
}
