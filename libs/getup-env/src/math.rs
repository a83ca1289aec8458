//! Small numeric helpers shared by the controller, observations and rewards.

use nalgebra as na;

/// Rotate a world-frame vector into the body frame of `rotation`.
#[inline]
pub fn rotate_inverse(rotation: &na::UnitQuaternion<f32>, v: &na::Vector3<f32>) -> na::Vector3<f32> {
    rotation.inverse_transform_vector(v)
}

/// Build a unit quaternion from an `[x, y, z, w]` array.
pub fn quat_from_xyzw(q: [f32; 4]) -> na::UnitQuaternion<f32> {
    na::UnitQuaternion::from_quaternion(na::Quaternion::new(q[3], q[0], q[1], q[2]))
}

/// Bounded shaping primitive with a Gaussian falloff.
///
/// Returns 1 inside `[lower, upper]`. Outside, the distance to the nearest
/// bound is normalized by `margin` and mapped through a Gaussian that equals
/// `value_at_margin` at exactly one margin away. A zero margin gives a hard
/// 0/1 step.
pub fn tolerance(x: f32, bounds: (f32, f32), margin: f32, value_at_margin: f32) -> f32 {
    let (lower, upper) = bounds;
    let in_bounds = lower <= x && x <= upper;
    if in_bounds {
        return 1.0;
    }
    if margin == 0.0 {
        return 0.0;
    }
    let distance = (if x < lower { lower - x } else { x - upper }) / margin;
    let scale = (-2.0 * value_at_margin.ln()).sqrt();
    (-0.5 * (distance * scale).powi(2)).exp()
}

/// Sum of squares of a row slice.
#[inline]
pub fn sum_sq<'a>(values: impl IntoIterator<Item = &'a f32>) -> f32 {
    values.into_iter().map(|v| v * v).sum()
}

/// Population variance.
pub fn variance(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_tolerance_inside_bounds() {
        assert_eq!(tolerance(0.5, (0.0, 1.0), 1.0, 0.1), 1.0);
        assert_eq!(tolerance(1.0, (1.0, f32::INFINITY), 1.0, 0.1), 1.0);
    }

    #[test]
    fn test_tolerance_value_at_margin() {
        assert_relative_eq!(tolerance(0.0, (1.0, f32::INFINITY), 1.0, 0.1), 0.1, epsilon = 1e-5);
        assert_relative_eq!(tolerance(2.5, (0.0, 2.0), 0.5, 0.05), 0.05, epsilon = 1e-5);
    }

    #[test]
    fn test_tolerance_decays_monotonically() {
        let near = tolerance(0.9, (1.0, 2.0), 1.0, 0.1);
        let far = tolerance(0.2, (1.0, 2.0), 1.0, 0.1);
        assert!(near < 1.0 && far < near && far > 0.0);
    }

    #[test]
    fn test_tolerance_zero_margin_is_step() {
        assert_eq!(tolerance(1.01, (0.0, 1.0), 0.0, 0.1), 0.0);
        assert_eq!(tolerance(0.99, (0.0, 1.0), 0.0, 0.1), 1.0);
    }

    #[test]
    fn test_projected_gravity_upright_and_flipped() {
        let gravity = na::Vector3::new(0.0, 0.0, -1.0);
        let upright = na::UnitQuaternion::identity();
        assert_relative_eq!(rotate_inverse(&upright, &gravity), gravity);

        let flipped = na::UnitQuaternion::from_axis_angle(&na::Vector3::x_axis(), std::f32::consts::PI);
        let g = rotate_inverse(&flipped, &gravity);
        assert_relative_eq!(g.z, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_quat_from_xyzw_normalizes() {
        let q = quat_from_xyzw([0.0, -1.0, 0.0, 1.0]);
        assert_relative_eq!(q.quaternion().norm(), 1.0, epsilon = 1e-6);
        assert_relative_eq!(q.angle(), std::f32::consts::FRAC_PI_2, epsilon = 1e-5);
    }

    #[test]
    fn test_variance() {
        assert_eq!(variance(&[]), 0.0);
        assert_relative_eq!(variance(&[1.0, 3.0]), 1.0);
    }
}
