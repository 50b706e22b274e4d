//! Cost function matching one projected lidar edge point against a scene's
//! edge density surface.

use std::sync::Arc;

use nalgebra::{DVector, Vector3};
use tiny_solver::factors::Factor;

use crate::camera::{project_point, ModelOrder};
use crate::kde::DensityGrid;

/// Residual of one edge point in one scene.
///
/// Projects the point with the shared `[extrinsic, intrinsic]` parameter
/// blocks, samples the scene's density surface at the projected location and
/// emits `weight * (reference - density)` duplicated into a 2-vector. The
/// duplication keeps the per-point normal-equation block well ranked for
/// this cost shape; it is not a pair of independent measurements.
///
/// A degenerate projection (point on the optical axis) contributes a zero
/// residual instead of propagating NaN into the Jacobian.
#[derive(Debug, Clone)]
pub struct DensityFactor {
    point: Vector3<f64>,
    weight: f64,
    reference_density: f64,
    scale: f64,
    order: ModelOrder,
    grid: Arc<DensityGrid>,
}

impl DensityFactor {
    pub fn new(
        point: Vector3<f64>,
        weight: f64,
        order: ModelOrder,
        grid: Arc<DensityGrid>,
        reference_density: f64,
    ) -> Self {
        let scale = grid.scale();
        DensityFactor {
            point,
            weight,
            reference_density,
            scale,
            order,
            grid,
        }
    }
}

impl<T: nalgebra::RealField> Factor<T> for DensityFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let extrinsic = params[0].as_slice();
        let intrinsic = params[1].as_slice();

        match project_point(self.order, extrinsic, intrinsic, &self.point) {
            Some((u, v)) => {
                let scale = T::from_f64(self.scale).unwrap();
                let density = self.grid.interpolate(u * scale.clone(), v * scale);
                let residual = T::from_f64(self.weight).unwrap()
                    * (T::from_f64(self.reference_density).unwrap() - density);
                DVector::from_vec(vec![residual.clone(), residual])
            }
            None => DVector::zeros(2),
        }
    }
}
