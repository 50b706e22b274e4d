//! Lidar Fisheye Calibration Library
//!
//! A Rust library for jointly calibrating the extrinsic pose and intrinsic
//! projection of a fisheye camera against lidar edge observations from
//! multiple scenes. The pipeline:
//! - Polynomial radial fisheye projection model with selectable coefficient
//!   sparsity (11, 12 or 13 parameters)
//! - Gaussian kernel density estimation of camera edge pixels, sampled
//!   through a differentiable bicubic interpolant
//! - Joint multi-scene nonlinear least-squares optimization using the
//!   tiny-solver optimization framework
//! - Export of calibrated projections as CSV correspondences and image
//!   overlays

pub mod camera;
pub mod export;
pub mod kde;
pub mod optimization;

// Re-export commonly used types
pub use camera::{CalibrationError, ModelOrder, PolyFisheyeModel, Resolution};
pub use export::ProjectionExporter;
pub use kde::DensityGrid;
pub use optimization::{
    CalibrationReport, DensityFactor, EdgePoint, FrozenBlock, MultiSceneOptimizer, Scene,
    SceneObservations, SolveOptions, SolveStatus,
};
