//! Parametric surface-brightness profiles.
//!
//! One model value type with a [`ProfileKind`] tag replaces a subclass
//! hierarchy: each kind declares its parameter table statically and provides
//! a pure evaluator for the surface brightness at a sky position, plus the
//! analytic partial derivative of that brightness with respect to every
//! declared parameter. The partials are what make the `full` and `single`
//! jacobian modes possible — every pipeline stage after evaluation is linear
//! in the evaluated intensities, so derivative planes ride through the same
//! pipeline as the value plane.
//!
//! Elliptical profiles share a rotated, axis-ratio-scaled radius
//! `R = hypot(U, V)` with `U = dx cos pa + dy sin pa` and
//! `V = (dy cos pa - dx sin pa) / q`; their parameter partials chain through
//! `dI/dR` and the closed-form partials of `R`.

use crate::params::{ParamError, ParamSet, ParamSpec};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Profile family tag. Dispatch is a match on this tag, not virtual calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    /// Uniform surface brightness over the model window.
    Sky,
    /// Circular Gaussian: `I = A exp(-r^2 / 2 sigma^2)`.
    Gaussian,
    /// Elliptical exponential disk: `I = I0 exp(-R / rd)`.
    Exponential,
    /// Elliptical Sersic: `I = Ie exp(-b(n) ((R/Re)^(1/n) - 1))`.
    Sersic,
    /// Circular Moffat: `I = I0 (1 + (r/rd)^2)^(-beta)`.
    Moffat,
}

static SKY_SPECS: &[ParamSpec] = &[ParamSpec::plain("sky", "flux/arcsec^2")];

static GAUSSIAN_SPECS: &[ParamSpec] = &[
    ParamSpec::plain("center_x", "arcsec"),
    ParamSpec::plain("center_y", "arcsec"),
    ParamSpec::bounded("sigma", "arcsec", 0.0, f64::INFINITY),
    ParamSpec::plain("amplitude", "flux/arcsec^2"),
];

static EXPONENTIAL_SPECS: &[ParamSpec] = &[
    ParamSpec::plain("center_x", "arcsec"),
    ParamSpec::plain("center_y", "arcsec"),
    ParamSpec::bounded("q", "b/a", 0.0, 1.0),
    ParamSpec::cyclic("pa", "rad", 0.0, PI),
    ParamSpec::bounded("rd", "arcsec", 0.0, f64::INFINITY),
    ParamSpec::plain("i0", "flux/arcsec^2"),
];

static SERSIC_SPECS: &[ParamSpec] = &[
    ParamSpec::plain("center_x", "arcsec"),
    ParamSpec::plain("center_y", "arcsec"),
    ParamSpec::bounded("q", "b/a", 0.0, 1.0),
    ParamSpec::cyclic("pa", "rad", 0.0, PI),
    ParamSpec::bounded("n", "none", 0.36, 8.0),
    ParamSpec::bounded("re", "arcsec", 0.0, f64::INFINITY),
    ParamSpec::plain("ie", "flux/arcsec^2"),
];

static MOFFAT_SPECS: &[ParamSpec] = &[
    ParamSpec::plain("center_x", "arcsec"),
    ParamSpec::plain("center_y", "arcsec"),
    ParamSpec::bounded("beta", "none", 0.0, f64::INFINITY),
    ParamSpec::bounded("rd", "arcsec", 0.0, f64::INFINITY),
    ParamSpec::plain("i0", "flux/arcsec^2"),
];

impl ProfileKind {
    pub fn specs(&self) -> &'static [ParamSpec] {
        match self {
            ProfileKind::Sky => SKY_SPECS,
            ProfileKind::Gaussian => GAUSSIAN_SPECS,
            ProfileKind::Exponential => EXPONENTIAL_SPECS,
            ProfileKind::Sersic => SERSIC_SPECS,
            ProfileKind::Moffat => MOFFAT_SPECS,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProfileKind::Sky => "sky",
            ProfileKind::Gaussian => "gaussian",
            ProfileKind::Exponential => "exponential",
            ProfileKind::Sersic => "sersic",
            ProfileKind::Moffat => "moffat",
        }
    }

    /// True for kinds that carry a `center_x`/`center_y` pair.
    pub fn has_center(&self) -> bool {
        !matches!(self, ProfileKind::Sky)
    }
}

/// Ciotti & Bertin (1999) expansion of the Sersic b(n) coefficient.
fn sersic_b(n: f64) -> f64 {
    2.0 * n - 1.0 / 3.0 + 4.0 / (405.0 * n) + 46.0 / (25515.0 * n * n)
}

fn sersic_b_deriv(n: f64) -> f64 {
    2.0 - 4.0 / (405.0 * n * n) - 92.0 / (25515.0 * n * n * n)
}

/// Guard radius for derivative chain rules: partials of `R` are undefined at
/// the exact center pixel.
const R_FLOOR: f64 = 1e-12;

/// Snapshot of one profile's parameter values, ready for per-pixel
/// evaluation without name lookups.
#[derive(Debug, Clone)]
pub(crate) enum Evaluator {
    Sky {
        sky: f64,
    },
    Gaussian {
        cx: f64,
        cy: f64,
        sigma: f64,
        amplitude: f64,
    },
    Exponential {
        cx: f64,
        cy: f64,
        q: f64,
        pa: f64,
        rd: f64,
        i0: f64,
    },
    Sersic {
        cx: f64,
        cy: f64,
        q: f64,
        pa: f64,
        n: f64,
        re: f64,
        ie: f64,
        bn: f64,
    },
    Moffat {
        cx: f64,
        cy: f64,
        beta: f64,
        rd: f64,
        i0: f64,
    },
}

/// Elliptical radius and its partials with respect to
/// `(center_x, center_y, q, pa)`.
struct EllipticalRadius {
    r: f64,
    d_cx: f64,
    d_cy: f64,
    d_q: f64,
    d_pa: f64,
}

fn elliptical_radius(dx: f64, dy: f64, q: f64, pa: f64) -> EllipticalRadius {
    let (spa, cpa) = pa.sin_cos();
    let u = dx * cpa + dy * spa;
    let v = (dy * cpa - dx * spa) / q;
    let r = u.hypot(v).max(R_FLOOR);
    EllipticalRadius {
        r,
        d_cx: (u * (-cpa) + v * (spa / q)) / r,
        d_cy: (u * (-spa) + v * (-cpa / q)) / r,
        d_q: -v * v / (q * r),
        d_pa: u * v * (q - 1.0 / q) / r,
    }
}

impl Evaluator {
    pub(crate) fn new(kind: ProfileKind, params: &ParamSet) -> Result<Self, ParamError> {
        Ok(match kind {
            ProfileKind::Sky => Evaluator::Sky {
                sky: params.value("sky")?,
            },
            ProfileKind::Gaussian => Evaluator::Gaussian {
                cx: params.value("center_x")?,
                cy: params.value("center_y")?,
                sigma: params.value("sigma")?,
                amplitude: params.value("amplitude")?,
            },
            ProfileKind::Exponential => Evaluator::Exponential {
                cx: params.value("center_x")?,
                cy: params.value("center_y")?,
                q: params.value("q")?,
                pa: params.value("pa")?,
                rd: params.value("rd")?,
                i0: params.value("i0")?,
            },
            ProfileKind::Sersic => {
                let n = params.value("n")?;
                Evaluator::Sersic {
                    cx: params.value("center_x")?,
                    cy: params.value("center_y")?,
                    q: params.value("q")?,
                    pa: params.value("pa")?,
                    n,
                    re: params.value("re")?,
                    ie: params.value("ie")?,
                    bn: sersic_b(n),
                }
            }
            ProfileKind::Moffat => Evaluator::Moffat {
                cx: params.value("center_x")?,
                cy: params.value("center_y")?,
                beta: params.value("beta")?,
                rd: params.value("rd")?,
                i0: params.value("i0")?,
            },
        })
    }

    /// Surface brightness at sky position `(x, y)`.
    pub(crate) fn brightness(&self, x: f64, y: f64) -> f64 {
        match *self {
            Evaluator::Sky { sky } => sky,
            Evaluator::Gaussian {
                cx,
                cy,
                sigma,
                amplitude,
            } => {
                let r2 = (x - cx).powi(2) + (y - cy).powi(2);
                amplitude * (-r2 / (2.0 * sigma * sigma)).exp()
            }
            Evaluator::Exponential {
                cx,
                cy,
                q,
                pa,
                rd,
                i0,
            } => {
                let er = elliptical_radius(x - cx, y - cy, q, pa);
                i0 * (-er.r / rd).exp()
            }
            Evaluator::Sersic {
                cx,
                cy,
                q,
                pa,
                n,
                re,
                ie,
                bn,
            } => {
                let er = elliptical_radius(x - cx, y - cy, q, pa);
                let t = (er.r / re).powf(1.0 / n);
                ie * (-bn * (t - 1.0)).exp()
            }
            Evaluator::Moffat {
                cx,
                cy,
                beta,
                rd,
                i0,
            } => {
                let r2 = (x - cx).powi(2) + (y - cy).powi(2);
                i0 * (1.0 + r2 / (rd * rd)).powf(-beta)
            }
        }
    }

    /// Surface brightness plus its partial derivative with respect to every
    /// declared parameter, in declaration order. `grad` must have one slot
    /// per spec entry.
    pub(crate) fn brightness_grad(&self, x: f64, y: f64, grad: &mut [f64]) -> f64 {
        match *self {
            Evaluator::Sky { sky } => {
                grad[0] = 1.0;
                sky
            }
            Evaluator::Gaussian {
                cx,
                cy,
                sigma,
                amplitude,
            } => {
                let (dx, dy) = (x - cx, y - cy);
                let s2 = sigma * sigma;
                let r2 = dx * dx + dy * dy;
                let shape = (-r2 / (2.0 * s2)).exp();
                let value = amplitude * shape;
                grad[0] = value * dx / s2;
                grad[1] = value * dy / s2;
                grad[2] = value * r2 / (s2 * sigma);
                grad[3] = shape;
                value
            }
            Evaluator::Exponential {
                cx,
                cy,
                q,
                pa,
                rd,
                i0,
            } => {
                let er = elliptical_radius(x - cx, y - cy, q, pa);
                let shape = (-er.r / rd).exp();
                let value = i0 * shape;
                let di_dr = -value / rd;
                grad[0] = di_dr * er.d_cx;
                grad[1] = di_dr * er.d_cy;
                grad[2] = di_dr * er.d_q;
                grad[3] = di_dr * er.d_pa;
                grad[4] = value * er.r / (rd * rd);
                grad[5] = shape;
                value
            }
            Evaluator::Sersic {
                cx,
                cy,
                q,
                pa,
                n,
                re,
                ie,
                bn,
            } => {
                let er = elliptical_radius(x - cx, y - cy, q, pa);
                let t = (er.r / re).powf(1.0 / n);
                let shape = (-bn * (t - 1.0)).exp();
                let value = ie * shape;
                let di_dr = -value * bn * t / (n * er.r);
                grad[0] = di_dr * er.d_cx;
                grad[1] = di_dr * er.d_cy;
                grad[2] = di_dr * er.d_q;
                grad[3] = di_dr * er.d_pa;
                // d/dn: through both b(n) and the (R/Re)^(1/n) exponent.
                let log_ratio = (er.r / re).ln();
                grad[4] =
                    value * (-sersic_b_deriv(n) * (t - 1.0) + bn * t * log_ratio / (n * n));
                grad[5] = value * bn * t / (n * re);
                grad[6] = shape;
                value
            }
            Evaluator::Moffat {
                cx,
                cy,
                beta,
                rd,
                i0,
            } => {
                let (dx, dy) = (x - cx, y - cy);
                let rd2 = rd * rd;
                let r2 = dx * dx + dy * dy;
                let u = 1.0 + r2 / rd2;
                let shape = u.powf(-beta);
                let value = i0 * shape;
                let common = 2.0 * beta * value / (u * rd2);
                grad[0] = common * dx;
                grad[1] = common * dy;
                grad[2] = -value * u.ln();
                grad[3] = common * r2 / rd;
                grad[4] = shape;
                value
            }
        }
    }
}
