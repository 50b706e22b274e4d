//! Joint multi-scene calibration optimizer.
//!
//! All scenes share one extrinsic block and one intrinsic block; every lidar
//! edge point in every scene contributes one two-dimensional residual that
//! compares the edge density at its projected pixel against the scene's
//! reference density. The problem is assembled single-threaded, then solved
//! with `tiny_solver`'s bounded Levenberg-Marquardt optimizer inside a
//! dedicated rayon thread pool; parameters are snapshotted into the caller's
//! log sink after every iteration.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tiny_solver::loss_functions::{HuberLoss, Loss};
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer, OptimizerOptions};

pub mod factor;
pub mod scene;

pub use factor::DensityFactor;
pub use scene::{EdgePoint, Scene, SceneObservations};

use crate::camera::poly_fisheye::EXTRINSIC_COUNT;
use crate::camera::{CalibrationError, ModelOrder};
use crate::kde::DensityGrid;

const EXTRINSIC_BLOCK: &str = "extrinsic";
const INTRINSIC_BLOCK: &str = "intrinsic";

/// Which parameter block is held constant during the solve.
///
/// A frozen block keeps its initial values exactly and its box bounds are
/// not applied; it acts as a fixed reference when the other block is
/// under-constrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrozenBlock {
    #[default]
    None,
    Extrinsic,
    Intrinsic,
}

/// Terminal state of one solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    Converged,
    MaxIterationsReached,
    NumericalFailure,
}

/// Solve configuration, immutable during the solve.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveOptions {
    /// Gaussian kernel bandwidth for the per-scene density grids.
    pub bandwidth: f64,
    /// Huber loss threshold; `None` selects a plain linear loss.
    pub loss_threshold: Option<f64>,
    /// Per-parameter box bounds over the full parameter vector. Leave both
    /// empty for an unbounded solve; otherwise lengths must match the
    /// parameter count.
    pub lower_bounds: Vec<f64>,
    pub upper_bounds: Vec<f64>,
    pub frozen_block: FrozenBlock,
    /// Worker threads for the solver's Jacobian evaluation; 0 picks the
    /// rayon default.
    pub num_threads: usize,
    /// Relative cost-decrease threshold that terminates the solve.
    pub function_tolerance: f64,
    pub max_iterations: usize,
    /// Parameter names, used for reporting only.
    pub param_names: Vec<String>,
}

impl Default for SolveOptions {
    fn default() -> Self {
        SolveOptions {
            bandwidth: 4.0,
            loss_threshold: Some(0.05),
            lower_bounds: Vec::new(),
            upper_bounds: Vec::new(),
            frozen_block: FrozenBlock::None,
            num_threads: 0,
            function_tolerance: 1e-7,
            max_iterations: 100,
            param_names: Vec::new(),
        }
    }
}

impl SolveOptions {
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, CalibrationError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}

/// Outcome of one solve: final parameters plus per-iteration history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// Final parameter vector, `[extrinsic || intrinsic]`.
    pub params: Vec<f64>,
    pub status: SolveStatus,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Parameter snapshot after every solver iteration.
    pub history: Vec<Vec<f64>>,
}

impl CalibrationReport {
    pub fn write_json<W: Write>(&self, writer: W) -> Result<(), CalibrationError> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

/// Joint multi-scene nonlinear calibration optimizer.
pub struct MultiSceneOptimizer {
    options: SolveOptions,
}

impl MultiSceneOptimizer {
    pub fn new(options: SolveOptions) -> Self {
        MultiSceneOptimizer { options }
    }

    pub fn options(&self) -> &SolveOptions {
        &self.options
    }

    /// Solves the joint calibration over all scenes.
    ///
    /// Configuration errors (invalid parameter count, bounds mismatch, bad
    /// bandwidth) fail before any grid is built. Solver non-convergence is
    /// not an error: the last parameter state is returned together with a
    /// [`SolveStatus`] describing how the solve terminated. One
    /// tab-separated parameter line is written to `log_sink` after every
    /// iteration.
    pub fn solve<W: Write>(
        &self,
        scenes: &[SceneObservations],
        initial_params: &[f64],
        log_sink: &mut W,
    ) -> Result<CalibrationReport, CalibrationError> {
        let order = ModelOrder::from_param_count(initial_params.len())?;
        self.validate_bounds(initial_params.len())?;

        // Phase 1: build every density grid into a finalized collection
        // before any residual references one of them.
        let built = self.build_scenes(scenes)?;

        // Phase 2: assemble the joint problem, one 2-residual block per
        // edge point per scene, all sharing the two parameter blocks.
        let mut problem = tiny_solver::Problem::new();
        let mut total_points = 0usize;
        for (observations, scene) in scenes.iter().zip(&built) {
            let Some(scene) = scene else { continue };
            for point in &observations.edge_points {
                let factor = DensityFactor::new(
                    point.position,
                    point.weight,
                    order,
                    scene.grid.clone(),
                    scene.reference_density,
                );
                let loss: Option<Box<dyn Loss + Send>> = self
                    .options
                    .loss_threshold
                    .map(|scale| Box::new(HuberLoss::new(scale)) as Box<dyn Loss + Send>);
                problem.add_residual_block(
                    2,
                    &[EXTRINSIC_BLOCK, INTRINSIC_BLOCK],
                    Box::new(factor),
                    loss,
                );
                total_points += 1;
            }
        }
        info!(
            "assembled joint problem: {} residual blocks over {} scenes",
            total_points,
            scenes.len()
        );

        self.log_params("initial", initial_params);
        if total_points == 0 {
            warn!("no usable scenes, returning initial parameters");
            return Ok(CalibrationReport {
                params: initial_params.to_vec(),
                status: SolveStatus::Converged,
                iterations: 0,
                initial_cost: 0.0,
                final_cost: 0.0,
                history: Vec::new(),
            });
        }

        self.apply_freezing_and_bounds(&mut problem, order);

        let mut values = HashMap::new();
        values.insert(
            EXTRINSIC_BLOCK.to_string(),
            DVector::from_row_slice(&initial_params[..EXTRINSIC_COUNT]),
        );
        values.insert(
            INTRINSIC_BLOCK.to_string(),
            DVector::from_row_slice(&initial_params[EXTRINSIC_COUNT..]),
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.num_threads)
            .build()
            .map_err(|e| CalibrationError::NumericalError(e.to_string()))?;

        let optimizer = LevenbergMarquardtOptimizer::default();
        let initial_cost = pool.install(|| total_cost(&problem, &values));
        let mut previous_cost = initial_cost;
        let mut status = SolveStatus::MaxIterationsReached;
        let mut history: Vec<Vec<f64>> = Vec::new();
        let mut iterations = 0usize;

        // The solver runs one outer Levenberg-Marquardt step at a time so
        // that a parameter snapshot can be emitted after every iteration.
        for _ in 0..self.options.max_iterations {
            let step_options = OptimizerOptions {
                max_iteration: 1,
                verbosity_level: 0,
                ..Default::default()
            };
            let result =
                pool.install(|| optimizer.optimize(&problem, &values, Some(step_options)));
            let Some(next) = result else {
                warn!("solver step failed at iteration {iterations}");
                status = SolveStatus::NumericalFailure;
                break;
            };
            values = next;
            iterations += 1;

            let snapshot = flatten_params(&values)?;
            let line = snapshot
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("\t");
            writeln!(log_sink, "{line}")?;
            history.push(snapshot);

            let cost = pool.install(|| total_cost(&problem, &values));
            if !cost.is_finite() {
                warn!("non-finite cost at iteration {iterations}");
                status = SolveStatus::NumericalFailure;
                break;
            }
            let decrease = (previous_cost - cost).max(0.0);
            if decrease <= self.options.function_tolerance * previous_cost.abs().max(f64::EPSILON) {
                previous_cost = cost;
                status = SolveStatus::Converged;
                break;
            }
            previous_cost = cost;
        }

        let params = flatten_params(&values)?;
        self.log_params("final", &params);
        info!(
            "solve finished: {:?} after {} iterations, cost {:.6e} -> {:.6e}",
            status, iterations, initial_cost, previous_cost
        );

        Ok(CalibrationReport {
            params,
            status,
            iterations,
            initial_cost,
            final_cost: previous_cost,
            history,
        })
    }

    fn validate_bounds(&self, param_count: usize) -> Result<(), CalibrationError> {
        for bounds in [&self.options.lower_bounds, &self.options.upper_bounds] {
            if !bounds.is_empty() && bounds.len() != param_count {
                return Err(CalibrationError::BoundsMismatch {
                    expected: param_count,
                    got: bounds.len(),
                });
            }
        }
        if self.options.lower_bounds.len() != self.options.upper_bounds.len() {
            return Err(CalibrationError::BoundsMismatch {
                expected: self.options.lower_bounds.len(),
                got: self.options.upper_bounds.len(),
            });
        }
        Ok(())
    }

    fn build_scenes(
        &self,
        scenes: &[SceneObservations],
    ) -> Result<Vec<Option<Scene>>, CalibrationError> {
        let mut built = Vec::with_capacity(scenes.len());
        for (index, observations) in scenes.iter().enumerate() {
            if observations.is_degenerate() {
                warn!("scene {index} has no edge observations, skipping");
                built.push(None);
                continue;
            }
            let grid = DensityGrid::from_edge_pixels(
                &observations.edge_pixels,
                self.options.bandwidth,
                observations.image_rows,
                observations.image_cols,
            )?;
            let reference_density = grid.peak();
            if reference_density <= 0.0 {
                warn!("scene {index} produced an all-zero density grid, skipping");
                built.push(None);
                continue;
            }
            info!(
                "scene {index}: {} edge points, {} edge pixels, reference density {:.6e}",
                observations.edge_points.len(),
                observations.edge_pixels.len(),
                reference_density
            );
            built.push(Some(Scene {
                index,
                grid: Arc::new(grid),
                reference_density,
            }));
        }
        Ok(built)
    }

    fn apply_freezing_and_bounds(&self, problem: &mut tiny_solver::Problem, order: ModelOrder) {
        match self.options.frozen_block {
            FrozenBlock::Extrinsic => {
                for i in 0..EXTRINSIC_COUNT {
                    problem.fix_variable(EXTRINSIC_BLOCK, i);
                }
            }
            FrozenBlock::Intrinsic => {
                for i in 0..order.intrinsic_count() {
                    problem.fix_variable(INTRINSIC_BLOCK, i);
                }
            }
            FrozenBlock::None => {}
        }

        if self.options.lower_bounds.is_empty() {
            return;
        }
        for i in 0..order.param_count() {
            let lower = self.options.lower_bounds[i];
            let upper = self.options.upper_bounds[i];
            if i < EXTRINSIC_COUNT {
                if self.options.frozen_block != FrozenBlock::Extrinsic {
                    problem.set_variable_bounds(EXTRINSIC_BLOCK, i, lower, upper);
                }
            } else if self.options.frozen_block != FrozenBlock::Intrinsic {
                problem.set_variable_bounds(INTRINSIC_BLOCK, i - EXTRINSIC_COUNT, lower, upper);
            }
        }
    }

    fn log_params(&self, label: &str, params: &[f64]) {
        let rendered = params
            .iter()
            .enumerate()
            .map(|(i, value)| match self.options.param_names.get(i) {
                Some(name) => format!("{name}: {value:.6}"),
                None => format!("p{i}: {value:.6}"),
            })
            .collect::<Vec<_>>()
            .join(" ");
        info!("{label} {rendered}");
    }
}

fn total_cost(problem: &tiny_solver::Problem, values: &HashMap<String, DVector<f64>>) -> f64 {
    let param_blocks = problem.initialize_parameter_blocks(values);
    let residuals = problem.compute_residuals(&param_blocks, true);
    0.5 * residuals.as_ref().squared_norm_l2()
}

fn flatten_params(values: &HashMap<String, DVector<f64>>) -> Result<Vec<f64>, CalibrationError> {
    let extrinsic = values
        .get(EXTRINSIC_BLOCK)
        .ok_or_else(|| CalibrationError::NumericalError("missing extrinsic block".to_string()))?;
    let intrinsic = values
        .get(INTRINSIC_BLOCK)
        .ok_or_else(|| CalibrationError::NumericalError("missing intrinsic block".to_string()))?;
    Ok(extrinsic
        .iter()
        .chain(intrinsic.iter())
        .cloned()
        .collect())
}
