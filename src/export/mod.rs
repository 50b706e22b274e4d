//! Export of calibrated projections: pixel correspondences as CSV and lidar
//! points painted onto a camera image.

use std::io::Write;

use image::RgbImage;
use log::warn;
use nalgebra::Vector3;

use crate::camera::{CalibrationError, PolyFisheyeModel, Resolution};

/// Red intensity added to the base image at every projected point.
const OVERLAY_RED_GAIN: u8 = 204;

/// Projects lidar points with a calibrated model and renders the results for
/// downstream consumers.
pub struct ProjectionExporter {
    model: PolyFisheyeModel,
}

impl ProjectionExporter {
    /// Builds an exporter around a calibrated parameter vector.
    pub fn new(params: Vec<f64>, resolution: Resolution) -> Result<Self, CalibrationError> {
        Ok(ProjectionExporter {
            model: PolyFisheyeModel::new(params, resolution)?,
        })
    }

    pub fn model(&self) -> &PolyFisheyeModel {
        &self.model
    }

    /// Projects every point to integer `[row, col]` pixel coordinates,
    /// rounded to the nearest pixel and clamped to the image bounds.
    ///
    /// Points that project degenerately (on the optical axis) are dropped
    /// with a warning, so the output may be shorter than the input.
    pub fn project_points(&self, points: &[Vector3<f64>]) -> Vec<[usize; 2]> {
        let Resolution { width, height } = self.model.resolution;
        let mut pixels = Vec::with_capacity(points.len());
        for point in points {
            match self.model.project(point) {
                Ok(projected) => {
                    let row = clamp_pixel(projected.x, height);
                    let col = clamp_pixel(projected.y, width);
                    pixels.push([row, col]);
                }
                Err(_) => {
                    warn!(
                        "skipping degenerate projection of point ({}, {}, {})",
                        point.x, point.y, point.z
                    );
                }
            }
        }
        pixels
    }

    /// Writes the projected correspondences as CSV, one `row,col` record per
    /// projected point.
    pub fn write_correspondences<W: Write>(
        &self,
        points: &[Vector3<f64>],
        writer: W,
    ) -> Result<(), CalibrationError> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        for pixel in self.project_points(points) {
            csv_writer.write_record(&[pixel[0].to_string(), pixel[1].to_string()])?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    /// Paints the given pixels onto a copy of `base` by brightening the red
    /// channel, leaving the other channels untouched. Pixels outside the
    /// base image are clamped onto its border.
    pub fn overlay_image(&self, base: &RgbImage, pixels: &[[usize; 2]]) -> RgbImage {
        let mut overlay = base.clone();
        if overlay.width() == 0 || overlay.height() == 0 {
            return overlay;
        }
        for pixel in pixels {
            let x = (pixel[1] as u32).min(overlay.width() - 1);
            let y = (pixel[0] as u32).min(overlay.height() - 1);
            let rgb = overlay.get_pixel_mut(x, y);
            rgb.0[0] = rgb.0[0].saturating_add(OVERLAY_RED_GAIN);
        }
        overlay
    }
}

fn clamp_pixel(value: f64, extent: u32) -> usize {
    let max = extent.saturating_sub(1) as f64;
    value.round().clamp(0.0, max) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn sample_exporter() -> ProjectionExporter {
        let params = vec![
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1024.0, 1224.0, 0.0, 600.0, 0.0, 0.0, 0.0,
        ];
        ProjectionExporter::new(
            params,
            Resolution {
                width: 2448,
                height: 2048,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_project_points_rounds_and_clamps() {
        let exporter = sample_exporter();
        // theta = pi/4, planar radius 1: u = -600*pi/4 + 1024 = 552.76.
        let inside = Vector3::new(1.0, 0.0, 1.0);
        // Large theta pushes u far below zero.
        let outside = Vector3::new(5.0, 0.0, -1.0);
        let pixels = exporter.project_points(&[inside, outside]);

        assert_eq!(pixels.len(), 2);
        let expected_row = (-600.0 * std::f64::consts::FRAC_PI_4 + 1024.0).round() as usize;
        assert_eq!(pixels[0], [expected_row, 1224]);
        assert_eq!(pixels[1][0], 0);
        assert!(pixels[1][1] < 2448);
    }

    #[test]
    fn test_degenerate_points_are_dropped() {
        let exporter = sample_exporter();
        let pixels = exporter.project_points(&[
            Vector3::new(0.0, 0.0, 4.0),
            Vector3::new(1.0, 0.0, 1.0),
        ]);
        assert_eq!(pixels.len(), 1);
    }

    #[test]
    fn test_correspondence_csv_format() {
        let exporter = sample_exporter();
        let mut buffer = Vec::new();
        exporter
            .write_correspondences(
                &[Vector3::new(1.0, 0.0, 1.0), Vector3::new(0.0, 1.0, 1.0)],
                &mut buffer,
            )
            .unwrap();

        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let expected_r = (-600.0 * std::f64::consts::FRAC_PI_4 + 1024.0).round() as usize;
        assert_eq!(lines[0], format!("{expected_r},1224"));
        let expected_c = (-600.0 * std::f64::consts::FRAC_PI_4 + 1224.0).round() as usize;
        assert_eq!(lines[1], format!("1024,{expected_c}"));
    }

    #[test]
    fn test_overlay_brightens_red_channel_only() {
        let exporter = sample_exporter();
        let base = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let overlay = exporter.overlay_image(&base, &[[2, 3], [2, 3], [100, 100]]);

        // Two hits on the same pixel saturate the red channel.
        assert_eq!(overlay.get_pixel(3, 2), &Rgb([255, 20, 30]));
        // Out-of-bounds pixels land on the border.
        assert_eq!(overlay.get_pixel(7, 7), &Rgb([214, 20, 30]));
        // Untouched pixels keep the base value.
        assert_eq!(overlay.get_pixel(0, 0), &Rgb([10, 20, 30]));
        assert_eq!(base.get_pixel(3, 2), &Rgb([10, 20, 30]));
    }
}
