//! 2-D convolution and sub-pixel shift kernels.
//!
//! Sampling in `full` PSF mode convolves the working image with the target's
//! PSF through the Fourier domain ([`fft_convolve_same`]); the direct spatial
//! form ([`convolve_same`]) is kept for small kernels (shifting the PSF by a
//! Lanczos kernel) and as the reference the FFT path is tested against.
//!
//! Both functions compute true convolution (kernel flipped), zero-padded,
//! with `same` output geometry: the result has the image's shape and is
//! centered on the kernel's center pixel, which is well defined because PSF
//! kernels are odd-shaped by construction.

use ndarray::Array2;
use rustfft::{num_complex::Complex, FftPlanner};
use std::f64::consts::PI;

/// Direct spatial convolution, `same` geometry, zero padding.
pub fn convolve_same(image: &Array2<f64>, kernel: &Array2<f64>) -> Array2<f64> {
    let (ny, nx) = image.dim();
    let (ky, kx) = kernel.dim();
    let (cy, cx) = (ky / 2, kx / 2);
    let mut out = Array2::zeros((ny, nx));
    for r in 0..ny {
        for c in 0..nx {
            let mut acc = 0.0;
            for i in 0..ky {
                let rr = r as isize + cy as isize - i as isize;
                if rr < 0 || rr >= ny as isize {
                    continue;
                }
                for j in 0..kx {
                    let cc = c as isize + cx as isize - j as isize;
                    if cc < 0 || cc >= nx as isize {
                        continue;
                    }
                    acc += kernel[[i, j]] * image[[rr as usize, cc as usize]];
                }
            }
            out[[r, c]] = acc;
        }
    }
    out
}

/// FFT-based convolution, `same` geometry, zero padding. Matches
/// [`convolve_same`] to floating-point tolerance.
pub fn fft_convolve_same(image: &Array2<f64>, kernel: &Array2<f64>) -> Array2<f64> {
    let (ny, nx) = image.dim();
    let (ky, kx) = kernel.dim();
    if ny == 0 || nx == 0 || ky == 0 || kx == 0 {
        return Array2::zeros((ny, nx));
    }
    let ph = ny + ky - 1;
    let pw = nx + kx - 1;

    let mut a = vec![Complex::new(0.0, 0.0); ph * pw];
    for r in 0..ny {
        for c in 0..nx {
            a[r * pw + c].re = image[[r, c]];
        }
    }
    let mut b = vec![Complex::new(0.0, 0.0); ph * pw];
    for r in 0..ky {
        for c in 0..kx {
            b[r * pw + c].re = kernel[[r, c]];
        }
    }

    fft_2d(&mut a, ph, pw, false);
    fft_2d(&mut b, ph, pw, false);
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x *= *y;
    }
    fft_2d(&mut a, ph, pw, true);

    let norm = 1.0 / (ph * pw) as f64;
    let (oy, ox) = (ky / 2, kx / 2);
    Array2::from_shape_fn((ny, nx), |(r, c)| a[(r + oy) * pw + (c + ox)].re * norm)
}

/// In-place row/column 2-D FFT over a row-major buffer.
fn fft_2d(buf: &mut [Complex<f64>], h: usize, w: usize, inverse: bool) {
    let mut planner = FftPlanner::new();
    let row_fft = if inverse {
        planner.plan_fft_inverse(w)
    } else {
        planner.plan_fft_forward(w)
    };
    for row in buf.chunks_exact_mut(w) {
        row_fft.process(row);
    }
    let col_fft = if inverse {
        planner.plan_fft_inverse(h)
    } else {
        planner.plan_fft_forward(h)
    };
    let mut column = vec![Complex::new(0.0, 0.0); h];
    for c in 0..w {
        for r in 0..h {
            column[r] = buf[r * w + c];
        }
        col_fft.process(&mut column);
        for r in 0..h {
            buf[r * w + c] = column[r];
        }
    }
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-8 {
        1.0 - (PI * x).powi(2) / 6.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

fn sinc_deriv(x: f64) -> f64 {
    if x.abs() < 1e-8 {
        -PI * PI * x / 3.0
    } else {
        ((PI * x).cos() - sinc(x)) / x
    }
}

fn lanczos(x: f64, order: usize) -> f64 {
    let a = order as f64;
    if x.abs() >= a {
        0.0
    } else {
        sinc(x) * sinc(x / a)
    }
}

fn lanczos_deriv(x: f64, order: usize) -> f64 {
    let a = order as f64;
    if x.abs() >= a {
        0.0
    } else {
        sinc_deriv(x) * sinc(x / a) + sinc(x) * sinc_deriv(x / a) / a
    }
}

fn shift_weights(shift: f64, order: usize) -> (Vec<f64>, Vec<f64>) {
    let a = order as isize;
    let mut w = Vec::with_capacity(2 * order + 1);
    let mut dw = Vec::with_capacity(2 * order + 1);
    for k in -a..=a {
        let x = k as f64 - shift;
        w.push(lanczos(x, order));
        // d/dshift L(k - shift)
        dw.push(-lanczos_deriv(x, order));
    }
    (w, dw)
}

/// Separable windowed-sinc kernel that shifts an image by `shift` pixels
/// (`[x, y]`) when applied with [`convolve_same`]. Odd-sized
/// `(2*order + 1)` support on each axis.
pub fn lanczos_shift_kernel(shift: [f64; 2], order: usize) -> Array2<f64> {
    let (wx, _) = shift_weights(shift[0], order);
    let (wy, _) = shift_weights(shift[1], order);
    Array2::from_shape_fn((wy.len(), wx.len()), |(r, c)| wy[r] * wx[c])
}

/// Partial derivatives of [`lanczos_shift_kernel`] with respect to the x and
/// y shift components. Used by the jacobian engine: in `full` PSF mode the
/// center dependence of the sampled image lives entirely in this kernel.
pub fn lanczos_shift_kernel_grad(shift: [f64; 2], order: usize) -> (Array2<f64>, Array2<f64>) {
    let (wx, dwx) = shift_weights(shift[0], order);
    let (wy, dwy) = shift_weights(shift[1], order);
    let dx = Array2::from_shape_fn((wy.len(), wx.len()), |(r, c)| wy[r] * dwx[c]);
    let dy = Array2::from_shape_fn((wy.len(), wx.len()), |(r, c)| dwy[r] * wx[c]);
    (dx, dy)
}
