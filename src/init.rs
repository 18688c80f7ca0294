//! Parameter initialization helpers.

use ndarray::Array2;

/// Iterative windowed center-of-mass walk, in `(row, col)` index space.
///
/// Starting from `start`, repeatedly computes the center of light in a small
/// box and moves the box there, stopping once an iteration moves less than a
/// tenth of a pixel (or after 100 iterations). Returns `None` when the box
/// leaves the image or the enclosed mass is non-positive; the caller decides
/// the fallback (typically the window center).
pub fn center_of_mass(start: [f64; 2], data: &Array2<f64>) -> Option<[f64; 2]> {
    let (ny, nx) = data.dim();
    let mut box_px = ((ny.min(nx) / 10).clamp(6, 20)) as i64;
    box_px += box_px % 2;
    let half = box_px as f64 / 2.0;

    let mut center = start;
    for _ in 0..100 {
        let r0 = (center[0] - half).round() as i64;
        let r1 = (center[0] + half).round() as i64;
        let c0 = (center[1] - half).round() as i64;
        let c1 = (center[1] + half).round() as i64;
        if r0 < 0 || c0 < 0 || r1 >= ny as i64 || c1 >= nx as i64 {
            return None;
        }

        // Inclusive box, symmetric about the current center; an exclusive
        // end biases the walk half a pixel low.
        let mut mass = 0.0;
        let mut moment = [0.0, 0.0];
        for r in r0..=r1 {
            for c in c0..=c1 {
                let v = data[[r as usize, c as usize]];
                mass += v;
                moment[0] += v * (r - r0) as f64;
                moment[1] += v * (c - c0) as f64;
            }
        }
        if mass <= 0.0 {
            return None;
        }
        let new_center = [r0 as f64 + moment[0] / mass, c0 as f64 + moment[1] / mass];
        let step = (center[0] - new_center[0]).abs() + (center[1] - new_center[1]).abs();
        center = new_center;
        if step < 0.1 {
            break;
        }
    }
    Some(center)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn walks_to_a_nearby_blob() {
        let mut data = Array2::zeros((30, 30));
        for r in 0..30usize {
            for c in 0..30usize {
                let d2 = (r as f64 - 18.0).powi(2) + (c as f64 - 11.0).powi(2);
                data[[r, c]] = (-d2 / 6.0).exp();
            }
        }
        let com = center_of_mass([15.0, 14.0], &data).unwrap();
        assert_abs_diff_eq!(com[0], 18.0, epsilon = 0.3);
        assert_abs_diff_eq!(com[1], 11.0, epsilon = 0.3);
    }

    #[test]
    fn zero_mass_is_a_recoverable_degeneracy() {
        let data = Array2::zeros((30, 30));
        assert!(center_of_mass([15.0, 15.0], &data).is_none());
    }

    #[test]
    fn leaving_the_image_returns_none() {
        let data = Array2::ones((30, 30));
        assert!(center_of_mass([1.0, 1.0], &data).is_none());
    }
}
