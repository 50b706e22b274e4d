//! Camera-side types: the polynomial radial fisheye projection model, the
//! image resolution descriptor, and the crate-wide error type.

use serde::{Deserialize, Serialize};

pub mod poly_fisheye;

pub use poly_fisheye::{project_point, ModelOrder, PolyFisheyeModel};

/// Image resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("invalid parameter count {0}, expected 11, 12 or 13")]
    InvalidParameterCount(usize),
    #[error("bounds of length {got} do not match parameter count {expected}")]
    BoundsMismatch { expected: usize, got: usize },
    #[error("degenerate projection, point lies on the optical axis")]
    DegenerateProjection,
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Numerical error: {0}")]
    NumericalError(String),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("CSV error: {0}")]
    CsvError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> Self {
        CalibrationError::IOError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CalibrationError {
    fn from(err: serde_yaml::Error) -> Self {
        CalibrationError::YamlError(err.to_string())
    }
}

impl From<serde_json::Error> for CalibrationError {
    fn from(err: serde_json::Error) -> Self {
        CalibrationError::IOError(err.to_string())
    }
}

impl From<csv::Error> for CalibrationError {
    fn from(err: csv::Error) -> Self {
        CalibrationError::CsvError(err.to_string())
    }
}

/// Common validation helpers for calibration parameters.
pub mod validation {
    use super::CalibrationError;

    pub fn validate_finite(params: &[f64]) -> Result<(), CalibrationError> {
        if let Some(idx) = params.iter().position(|p| !p.is_finite()) {
            return Err(CalibrationError::InvalidParams(format!(
                "parameter {idx} is not finite"
            )));
        }
        Ok(())
    }
}
