//! Kernel density estimation of camera edge pixels and bicubic sampling of
//! the resulting grid.
//!
//! Each scene's edge-pixel samples are turned into a smooth non-negative
//! density field over scaled image coordinates. The grid resolution is
//! `scale = 2 / bandwidth` times the native pixel resolution, which keeps
//! the kernel standard deviation at a constant two grid cells regardless of
//! the bandwidth choice. The optimizer samples the field through a
//! Catmull-Rom bicubic interpolant evaluated in generic scalar arithmetic,
//! so dual-number evaluation yields the gradient of the density surface for
//! free.

use log::debug;
use nalgebra::RealField;

use crate::camera::CalibrationError;

/// Smoothed edge-pixel density over scaled image coordinates, stored
/// row-major. Immutable once built; shared read-only across solver threads.
#[derive(Debug, Clone)]
pub struct DensityGrid {
    rows: usize,
    cols: usize,
    scale: f64,
    data: Vec<f64>,
    peak: f64,
}

impl DensityGrid {
    /// Builds the density grid for one scene from its edge-pixel samples
    /// (`[row, col]` in native pixel coordinates).
    ///
    /// An empty sample set yields an all-zero grid with `peak() == 0.0`;
    /// the caller decides whether such a scene carries any signal.
    pub fn from_edge_pixels(
        samples: &[[f64; 2]],
        bandwidth: f64,
        image_rows: usize,
        image_cols: usize,
    ) -> Result<Self, CalibrationError> {
        if !bandwidth.is_finite() || bandwidth <= 0.0 {
            return Err(CalibrationError::InvalidParams(format!(
                "bandwidth must be positive, got {bandwidth}"
            )));
        }
        if image_rows == 0 || image_cols == 0 {
            return Err(CalibrationError::InvalidParams(
                "image dimensions must be non-zero".to_string(),
            ));
        }

        let scale = 2.0 / bandwidth;
        let rows = ((image_rows as f64 * scale).ceil() as usize).max(1);
        let cols = ((image_cols as f64 * scale).ceil() as usize).max(1);
        let mut grid = DensityGrid {
            rows,
            cols,
            scale,
            data: vec![0.0; rows * cols],
            peak: 0.0,
        };
        if samples.is_empty() {
            debug!("no edge-pixel samples, returning all-zero density grid");
            return Ok(grid);
        }

        // Deposit each sample into its nearest grid cell, then smooth with a
        // separable Gaussian. Equivalent to direct kernel evaluation on the
        // grid nodes up to the half-cell deposit rounding.
        for sample in samples {
            let r = (sample[0] * scale).round();
            let c = (sample[1] * scale).round();
            if !r.is_finite() || !c.is_finite() {
                continue;
            }
            let i = (r.max(0.0) as usize).min(rows - 1);
            let j = (c.max(0.0) as usize).min(cols - 1);
            grid.data[i * cols + j] += 1.0;
        }

        let sigma = bandwidth * scale;
        let kernel = gaussian_kernel(sigma);
        grid.data = convolve_rows(&grid.data, rows, cols, &kernel);
        grid.data = convolve_cols(&grid.data, rows, cols, &kernel);

        // Normalize to the Gaussian KDE density in native pixel units.
        let norm = 1.0 / (samples.len() as f64 * 2.0 * std::f64::consts::PI * bandwidth.powi(2));
        for value in &mut grid.data {
            *value *= norm;
        }
        grid.peak = grid.data.iter().cloned().fold(0.0, f64::max);
        debug!(
            "density grid {}x{} (scale {:.4}), peak {:.6e}",
            rows, cols, scale, grid.peak
        );
        Ok(grid)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Coordinate scale relative to native pixel coordinates. Every
    /// coordinate passed to [`DensityGrid::interpolate`] must be multiplied
    /// by this factor.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Maximum density value, used as the per-scene reference density.
    pub fn peak(&self) -> f64 {
        self.peak
    }

    /// Grid node value at `(row, col)`.
    pub fn value(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    /// Bicubic (Catmull-Rom) interpolation at fractional grid coordinates.
    ///
    /// Node indices are clamped at the grid boundary, so out-of-range
    /// coordinates evaluate to the extended edge value instead of being
    /// undefined. The interpolation weights are computed in `T` arithmetic,
    /// which keeps the evaluation differentiable under forward-mode
    /// automatic differentiation.
    pub fn interpolate<T: RealField>(&self, row: T, col: T) -> T {
        let row_f: f64 = nalgebra::convert_unchecked::<T, f64>(row.clone());
        let col_f: f64 = nalgebra::convert_unchecked::<T, f64>(col.clone());
        if !row_f.is_finite() || !col_f.is_finite() {
            return T::zero();
        }

        let row_base = row_f.floor();
        let col_base = col_f.floor();
        let tr = row - T::from_f64(row_base).unwrap();
        let tc = col - T::from_f64(col_base).unwrap();
        let wr = catmull_rom_weights(&tr);
        let wc = catmull_rom_weights(&tc);

        let mut result = T::zero();
        for (m, weight_r) in wr.iter().enumerate() {
            let i = clamp_index(row_base as isize - 1 + m as isize, self.rows);
            let mut line = T::zero();
            for (n, weight_c) in wc.iter().enumerate() {
                let j = clamp_index(col_base as isize - 1 + n as isize, self.cols);
                line += weight_c.clone() * T::from_f64(self.value(i, j)).unwrap();
            }
            result += weight_r.clone() * line;
        }
        result
    }
}

fn clamp_index(idx: isize, len: usize) -> usize {
    idx.clamp(0, len as isize - 1) as usize
}

/// Catmull-Rom cubic convolution weights for the four nodes surrounding a
/// sample with fractional offset `t` in `[0, 1)`.
fn catmull_rom_weights<T: RealField>(t: &T) -> [T; 4] {
    let c = |v: f64| T::from_f64(v).unwrap();
    let t2 = t.clone() * t.clone();
    let t3 = t2.clone() * t.clone();
    [
        c(-0.5) * t3.clone() + t2.clone() - c(0.5) * t.clone(),
        c(1.5) * t3.clone() - c(2.5) * t2.clone() + T::one(),
        c(-1.5) * t3.clone() + c(2.0) * t2.clone() + c(0.5) * t.clone(),
        c(0.5) * t3 - c(0.5) * t2,
    ]
}

/// One-sided Gaussian taps out to four standard deviations.
fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (4.0 * sigma).ceil() as usize;
    (0..=radius)
        .map(|k| (-((k * k) as f64) / (2.0 * sigma * sigma)).exp())
        .collect()
}

fn convolve_rows(data: &[f64], rows: usize, cols: usize, kernel: &[f64]) -> Vec<f64> {
    let radius = kernel.len() as isize - 1;
    let mut out = vec![0.0; data.len()];
    for i in 0..rows as isize {
        for k in -radius..=radius {
            let src = i + k;
            if src < 0 || src >= rows as isize {
                continue;
            }
            let w = kernel[k.unsigned_abs()];
            let src_row = &data[src as usize * cols..(src as usize + 1) * cols];
            let dst_row = &mut out[i as usize * cols..(i as usize + 1) * cols];
            for (dst, val) in dst_row.iter_mut().zip(src_row) {
                *dst += w * val;
            }
        }
    }
    out
}

fn convolve_cols(data: &[f64], rows: usize, cols: usize, kernel: &[f64]) -> Vec<f64> {
    let radius = kernel.len() as isize - 1;
    let mut out = vec![0.0; data.len()];
    for i in 0..rows {
        let src_row = &data[i * cols..(i + 1) * cols];
        let dst_row = &mut out[i * cols..(i + 1) * cols];
        for j in 0..cols as isize {
            let mut acc = 0.0;
            for k in -radius..=radius {
                let src = j + k;
                if src < 0 || src >= cols as isize {
                    continue;
                }
                acc += kernel[k.unsigned_abs()] * src_row[src as usize];
            }
            dst_row[j as usize] = acc;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_empty_samples_yield_zero_grid() {
        let grid = DensityGrid::from_edge_pixels(&[], 10.0, 200, 300).unwrap();
        assert_eq!(grid.peak(), 0.0);
        assert!(grid.data.iter().all(|&v| v == 0.0));
        assert_relative_eq!(grid.interpolate(5.0, 5.0), 0.0);
    }

    #[test]
    fn test_invalid_bandwidth_is_rejected() {
        assert!(DensityGrid::from_edge_pixels(&[[1.0, 1.0]], 0.0, 100, 100).is_err());
        assert!(DensityGrid::from_edge_pixels(&[[1.0, 1.0]], -2.0, 100, 100).is_err());
        assert!(DensityGrid::from_edge_pixels(&[[1.0, 1.0]], f64::NAN, 100, 100).is_err());
    }

    #[test]
    fn test_scale_matches_bandwidth() {
        let grid = DensityGrid::from_edge_pixels(&[[50.0, 50.0]], 8.0, 200, 200).unwrap();
        assert_relative_eq!(grid.scale(), 0.25);
        assert_eq!(grid.rows(), 50);
        assert_eq!(grid.cols(), 50);
    }

    #[test]
    fn test_density_peaks_at_sample_cluster() {
        let samples = vec![[100.0, 200.0]; 20];
        let grid = DensityGrid::from_edge_pixels(&samples, 10.0, 400, 400).unwrap();
        let scale = grid.scale();

        let at_cluster: f64 = grid.interpolate(100.0 * scale, 200.0 * scale);
        let far_away: f64 = grid.interpolate(300.0 * scale, 50.0 * scale);
        assert!(at_cluster > far_away);
        assert!(at_cluster > 0.0);
        assert_relative_eq!(at_cluster, grid.peak(), max_relative = 1e-6);
    }

    #[test]
    fn test_peak_value_matches_kernel_normalization() {
        // All mass at one point: the density there is 1/(2*pi*h^2)
        // regardless of the sample count.
        let bandwidth = 10.0;
        for n in [1, 7] {
            let samples = vec![[100.0, 100.0]; n];
            let grid = DensityGrid::from_edge_pixels(&samples, bandwidth, 200, 200).unwrap();
            let expected = 1.0 / (2.0 * std::f64::consts::PI * bandwidth * bandwidth);
            assert_relative_eq!(grid.peak(), expected, max_relative = 1e-6);
        }
    }

    #[test]
    fn test_interpolation_reproduces_node_values() {
        let samples: Vec<[f64; 2]> = (0..40)
            .map(|k| [50.0 + (k % 7) as f64, 60.0 + (k % 5) as f64])
            .collect();
        let grid = DensityGrid::from_edge_pixels(&samples, 4.0, 150, 150).unwrap();
        for (i, j) in [(10usize, 12usize), (25, 31), (40, 40)] {
            let interpolated: f64 = grid.interpolate(i as f64, j as f64);
            assert_relative_eq!(interpolated, grid.value(i, j), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_non_negative_everywhere() {
        let samples: Vec<[f64; 2]> = (0..25).map(|k| [(k * 3) as f64, (k * 2) as f64]).collect();
        let grid = DensityGrid::from_edge_pixels(&samples, 6.0, 120, 120).unwrap();
        assert!(grid.data.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_out_of_range_coordinates_are_defined() {
        let samples = vec![[10.0, 10.0]; 5];
        let grid = DensityGrid::from_edge_pixels(&samples, 10.0, 100, 100).unwrap();

        let below: f64 = grid.interpolate(-50.0, -50.0);
        assert!(below.is_finite());
        assert_relative_eq!(below, grid.value(0, 0), epsilon = 1e-12);

        let beyond: f64 = grid.interpolate(1e4, 1e4);
        assert!(beyond.is_finite());
        let nan: f64 = grid.interpolate(f64::NAN, 3.0);
        assert_eq!(nan, 0.0);
    }

    #[test]
    fn test_samples_outside_image_are_clamped() {
        let samples = vec![[-5.0, 500.0], [50.0, 50.0]];
        let grid = DensityGrid::from_edge_pixels(&samples, 10.0, 100, 100).unwrap();
        assert!(grid.peak() > 0.0);
    }
}
