//! Per-scene observation containers.

use std::sync::Arc;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::kde::DensityGrid;

/// One lidar edge point with its observation weight.
///
/// The weight is a non-negative per-point residual multiplier, typically
/// derived from an edge-confidence measure upstream. Points are immutable
/// inputs to the optimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgePoint {
    /// Position in the sensor frame.
    pub position: Vector3<f64>,
    pub weight: f64,
}

impl EdgePoint {
    pub fn new(x: f64, y: f64, z: f64, weight: f64) -> Self {
        EdgePoint {
            position: Vector3::new(x, y, z),
            weight,
        }
    }
}

/// Raw observations of one scene, supplied by the upstream edge-extraction
/// collaborators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneObservations {
    /// Lidar edge points in the sensor frame.
    pub edge_points: Vec<EdgePoint>,
    /// Camera edge pixels as `[row, col]` in native image coordinates.
    pub edge_pixels: Vec<[f64; 2]>,
    pub image_rows: usize,
    pub image_cols: usize,
}

impl SceneObservations {
    /// A scene without edge points or without edge pixels carries no signal
    /// and is skipped by the optimizer rather than treated as an error.
    pub fn is_degenerate(&self) -> bool {
        self.edge_points.is_empty() || self.edge_pixels.is_empty()
    }
}

/// A scene prepared for solving: the finalized density grid plus its
/// reference density. Built once per solve and discarded afterwards.
#[derive(Debug, Clone)]
pub struct Scene {
    pub index: usize,
    pub grid: Arc<DensityGrid>,
    pub reference_density: f64,
}
