//! Polynomial radial fisheye projection model.
//!
//! The model maps a 3D point in the sensor frame to pixel coordinates in two
//! stages: a rigid extrinsic transform `p = Rz·Ry·Rx · x + t`, followed by a
//! radial mapping where the image radius is a polynomial in the zenith angle
//! between the transformed ray and the optical axis. The projection is
//! written generically over [`nalgebra::RealField`] so that the same formula
//! serves plain `f64` evaluation and dual-number evaluation inside the
//! optimizer's automatic differentiation.

use nalgebra::{Matrix3, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::camera::{validation, CalibrationError, Resolution};

/// Polynomial order variant, fixed once per run from the total parameter
/// count (6 extrinsic + 2 principal point + active radial coefficients).
///
/// Each variant carries its own coefficient-index mapping into the full
/// degree-5 polynomial `inv_r = a0 + a1·θ + a2·θ² + a3·θ³ + a4·θ⁴ + a5·θ⁵`;
/// lower-order terms are dropped first as the parameter count shrinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelOrder {
    /// 11 parameters: active coefficients `{a1, a3, a4}`.
    Order11,
    /// 12 parameters: active coefficients `{a0, a1, a3, a5}`.
    Order12,
    /// 13 parameters: active coefficients `{a0, a1, a2, a3, a4}`.
    Order13,
}

/// Number of extrinsic scalars (three rotation angles, three translations).
pub const EXTRINSIC_COUNT: usize = 6;

impl ModelOrder {
    /// Selects the order from the total parameter count, failing fast on
    /// anything other than 11, 12 or 13.
    pub fn from_param_count(count: usize) -> Result<Self, CalibrationError> {
        match count {
            11 => Ok(ModelOrder::Order11),
            12 => Ok(ModelOrder::Order12),
            13 => Ok(ModelOrder::Order13),
            other => Err(CalibrationError::InvalidParameterCount(other)),
        }
    }

    /// Total parameter count of this order.
    pub fn param_count(&self) -> usize {
        match self {
            ModelOrder::Order11 => 11,
            ModelOrder::Order12 => 12,
            ModelOrder::Order13 => 13,
        }
    }

    /// Number of intrinsic scalars (`u0`, `v0` plus active coefficients).
    pub fn intrinsic_count(&self) -> usize {
        self.param_count() - EXTRINSIC_COUNT
    }

    /// Expands the intrinsic block `[u0, v0, coeffs...]` into the dense
    /// coefficient vector `[a0..a5]`, zero-filling the inactive terms.
    pub fn expand_coefficients<T: RealField>(&self, intrinsic: &[T]) -> [T; 6] {
        let z = T::zero;
        match self {
            ModelOrder::Order13 => [
                intrinsic[2].clone(),
                intrinsic[3].clone(),
                intrinsic[4].clone(),
                intrinsic[5].clone(),
                intrinsic[6].clone(),
                z(),
            ],
            ModelOrder::Order12 => [
                intrinsic[2].clone(),
                intrinsic[3].clone(),
                z(),
                intrinsic[4].clone(),
                z(),
                intrinsic[5].clone(),
            ],
            ModelOrder::Order11 => [
                z(),
                intrinsic[2].clone(),
                z(),
                intrinsic[3].clone(),
                intrinsic[4].clone(),
                z(),
            ],
        }
    }
}

/// Projects a sensor-frame point to pixel coordinates `(u, v)` where `u` is
/// the image row and `v` the image column.
///
/// `extrinsic` is `[rx, ry, rz, tx, ty, tz]`, `intrinsic` is
/// `[u0, v0, coeffs...]` laid out according to `order`. Returns `None` when
/// the transformed point lies on the optical axis (zero planar radius), in
/// which case the projection direction is undefined.
pub fn project_point<T: RealField>(
    order: ModelOrder,
    extrinsic: &[T],
    intrinsic: &[T],
    point: &Vector3<f64>,
) -> Option<(T, T)> {
    let (sx, cx) = (extrinsic[0].clone().sin(), extrinsic[0].clone().cos());
    let (sy, cy) = (extrinsic[1].clone().sin(), extrinsic[1].clone().cos());
    let (sz, cz) = (extrinsic[2].clone().sin(), extrinsic[2].clone().cos());
    let one = T::one;
    let zero = T::zero;

    // R = Rz * Ry * Rx, angles applied about the fixed sensor axes.
    let rot_x = Matrix3::new(
        one(),
        zero(),
        zero(),
        zero(),
        cx.clone(),
        -sx.clone(),
        zero(),
        sx,
        cx,
    );
    let rot_y = Matrix3::new(
        cy.clone(),
        zero(),
        sy.clone(),
        zero(),
        one(),
        zero(),
        -sy,
        zero(),
        cy,
    );
    let rot_z = Matrix3::new(
        cz.clone(),
        -sz.clone(),
        zero(),
        sz,
        cz,
        zero(),
        zero(),
        zero(),
        one(),
    );
    let rotation = rot_z * rot_y * rot_x;

    let sensor = Vector3::new(
        T::from_f64(point.x).unwrap(),
        T::from_f64(point.y).unwrap(),
        T::from_f64(point.z).unwrap(),
    );
    let translation = Vector3::new(
        extrinsic[3].clone(),
        extrinsic[4].clone(),
        extrinsic[5].clone(),
    );
    let p = rotation * sensor + translation;

    let planar_radius = (p.x.clone() * p.x.clone() + p.y.clone() * p.y.clone()).sqrt();
    if planar_radius < T::from_f64(f64::EPSILON.sqrt()).unwrap() {
        return None;
    }

    let norm = (planar_radius.clone() * planar_radius.clone() + p.z.clone() * p.z.clone()).sqrt();
    // Clamp against floating-point overshoot before acos.
    let mut ratio = p.z.clone() / norm;
    if ratio > T::one() {
        ratio = T::one();
    } else if ratio < -T::one() {
        ratio = -T::one();
    }
    let theta = ratio.acos();

    let a = order.expand_coefficients(intrinsic);
    let theta2 = theta.clone() * theta.clone();
    let theta3 = theta2.clone() * theta.clone();
    let theta4 = theta3.clone() * theta.clone();
    let theta5 = theta4.clone() * theta.clone();
    let inv_radius = a[0].clone()
        + a[1].clone() * theta
        + a[2].clone() * theta2
        + a[3].clone() * theta3
        + a[4].clone() * theta4
        + a[5].clone() * theta5;

    let radial = inv_radius / planar_radius;
    let u = -radial.clone() * p.x.clone() + intrinsic[0].clone();
    let v = -radial * p.y.clone() + intrinsic[1].clone();
    Some((u, v))
}

/// Polynomial radial fisheye model bound to a concrete parameter vector.
///
/// The parameter layout is `[rx, ry, rz, tx, ty, tz, u0, v0, coeffs...]`,
/// the same contiguous layout the optimizer works on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolyFisheyeModel {
    params: Vec<f64>,
    order: ModelOrder,
    pub resolution: Resolution,
}

impl PolyFisheyeModel {
    pub fn new(params: Vec<f64>, resolution: Resolution) -> Result<Self, CalibrationError> {
        let order = ModelOrder::from_param_count(params.len())?;
        validation::validate_finite(&params)?;
        Ok(PolyFisheyeModel {
            params,
            order,
            resolution,
        })
    }

    pub fn order(&self) -> ModelOrder {
        self.order
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    /// Extrinsic sub-vector `[rx, ry, rz, tx, ty, tz]`.
    pub fn extrinsic(&self) -> &[f64] {
        &self.params[..EXTRINSIC_COUNT]
    }

    /// Intrinsic sub-vector `[u0, v0, coeffs...]`.
    pub fn intrinsic(&self) -> &[f64] {
        &self.params[EXTRINSIC_COUNT..]
    }

    /// Projects a sensor-frame point to `(row, column)` pixel coordinates.
    pub fn project(&self, point: &Vector3<f64>) -> Result<Vector2<f64>, CalibrationError> {
        project_point(self.order, self.extrinsic(), self.intrinsic(), point)
            .map(|(u, v)| Vector2::new(u, v))
            .ok_or(CalibrationError::DegenerateProjection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_resolution() -> Resolution {
        Resolution {
            width: 2448,
            height: 2048,
        }
    }

    #[test]
    fn test_order_selection() {
        assert_eq!(
            ModelOrder::from_param_count(11).unwrap(),
            ModelOrder::Order11
        );
        assert_eq!(
            ModelOrder::from_param_count(12).unwrap(),
            ModelOrder::Order12
        );
        assert_eq!(
            ModelOrder::from_param_count(13).unwrap(),
            ModelOrder::Order13
        );
        assert!(matches!(
            ModelOrder::from_param_count(10),
            Err(CalibrationError::InvalidParameterCount(10))
        ));
        assert!(matches!(
            ModelOrder::from_param_count(14),
            Err(CalibrationError::InvalidParameterCount(14))
        ));
    }

    #[test]
    fn test_coefficient_sparsity_patterns() {
        // Markers at the coefficient slots of the intrinsic block.
        let intr13 = [0.0, 0.0, 10.0, 11.0, 12.0, 13.0, 14.0];
        assert_eq!(
            ModelOrder::Order13.expand_coefficients(&intr13),
            [10.0, 11.0, 12.0, 13.0, 14.0, 0.0]
        );

        let intr12 = [0.0, 0.0, 10.0, 11.0, 12.0, 13.0];
        assert_eq!(
            ModelOrder::Order12.expand_coefficients(&intr12),
            [10.0, 11.0, 0.0, 12.0, 0.0, 13.0]
        );

        let intr11 = [0.0, 0.0, 10.0, 11.0, 12.0];
        assert_eq!(
            ModelOrder::Order11.expand_coefficients(&intr11),
            [0.0, 10.0, 0.0, 11.0, 12.0, 0.0]
        );
    }

    #[test]
    fn test_projection_known_value() {
        // Identity extrinsics, Order13 with only a1 active: inv_r = a1 * theta.
        let params = vec![
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1024.0, 1224.0, 0.0, 600.0, 0.0, 0.0, 0.0,
        ];
        let model = PolyFisheyeModel::new(params, sample_resolution()).unwrap();

        // Point (1, 0, 1): theta = pi/4, planar radius 1.
        let projected = model.project(&Vector3::new(1.0, 0.0, 1.0)).unwrap();
        let inv_r = 600.0 * std::f64::consts::FRAC_PI_4;
        assert_relative_eq!(projected.x, -inv_r + 1024.0, epsilon = 1e-9);
        assert_relative_eq!(projected.y, 1224.0, epsilon = 1e-9);
    }

    #[test]
    fn test_projection_sign_convention() {
        let params = vec![
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1024.0, 1224.0, 0.0, 600.0, 0.0, 0.0, 0.0,
        ];
        let model = PolyFisheyeModel::new(params, sample_resolution()).unwrap();

        // Positive radial coefficients push the projection towards negative
        // offsets from the principal point along both axes.
        let px = model.project(&Vector3::new(0.5, 0.0, 1.0)).unwrap();
        assert!(px.x < 1024.0);
        let py = model.project(&Vector3::new(0.0, 0.5, 1.0)).unwrap();
        assert!(py.y < 1224.0);
    }

    #[test]
    fn test_extrinsic_rotation_order() {
        // A pure z-rotation of pi/2 maps +x onto +y.
        let params = vec![
            0.0,
            0.0,
            std::f64::consts::FRAC_PI_2,
            0.0,
            0.0,
            0.0,
            1000.0,
            1000.0,
            0.0,
            600.0,
            0.0,
            0.0,
            0.0,
        ];
        let model = PolyFisheyeModel::new(params, sample_resolution()).unwrap();
        let projected = model.project(&Vector3::new(1.0, 0.0, 1.0)).unwrap();

        let reference = PolyFisheyeModel::new(
            vec![
                0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1000.0, 1000.0, 0.0, 600.0, 0.0, 0.0, 0.0,
            ],
            sample_resolution(),
        )
        .unwrap();
        let expected = reference.project(&Vector3::new(0.0, 1.0, 1.0)).unwrap();
        assert_relative_eq!(projected.x, expected.x, epsilon = 1e-9);
        assert_relative_eq!(projected.y, expected.y, epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_on_axis_point() {
        let params = vec![
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1024.0, 1224.0, 0.0, 600.0, 0.0, 0.0, 0.0,
        ];
        let model = PolyFisheyeModel::new(params, sample_resolution()).unwrap();
        assert!(matches!(
            model.project(&Vector3::new(0.0, 0.0, 5.0)),
            Err(CalibrationError::DegenerateProjection)
        ));
    }

    #[test]
    fn test_zenith_angle_is_finite_near_axis() {
        let params = vec![
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1024.0, 1224.0, 0.0, 600.0, 0.0, 0.0, 0.0,
        ];
        let model = PolyFisheyeModel::new(params, sample_resolution()).unwrap();
        // Barely off-axis: acos argument is prone to overshoot 1.0 here.
        let projected = model.project(&Vector3::new(1e-6, 0.0, 10.0)).unwrap();
        assert!(projected.x.is_finite());
        assert!(projected.y.is_finite());
    }

    #[test]
    fn test_rejects_non_finite_params() {
        let params = vec![
            0.0,
            f64::NAN,
            0.0,
            0.0,
            0.0,
            0.0,
            1024.0,
            1224.0,
            0.0,
            600.0,
            0.0,
            0.0,
            0.0,
        ];
        assert!(PolyFisheyeModel::new(params, sample_resolution()).is_err());
    }
}
