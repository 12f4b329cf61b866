//! Resistance to temperature calibration curves.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// One calibration point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// Sensor resistance (ohm)
    pub resistance: f64,
    /// Temperature at that resistance (K)
    pub temperature: f64,
}

/// Piecewise-linear curve over resistance.
///
/// Readings outside the table clamp to the nearest end point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<CalibrationPoint>", into = "Vec<CalibrationPoint>")]
pub struct CalibrationCurve {
    points: Vec<CalibrationPoint>,
}

impl TryFrom<Vec<CalibrationPoint>> for CalibrationCurve {
    type Error = DaqError;

    fn try_from(points: Vec<CalibrationPoint>) -> Result<Self, Self::Error> {
        Self::new(points)
    }
}

impl From<CalibrationCurve> for Vec<CalibrationPoint> {
    fn from(curve: CalibrationCurve) -> Self {
        curve.points
    }
}

impl CalibrationCurve {
    /// Builds a curve; points are sorted by resistance.
    pub fn new(mut points: Vec<CalibrationPoint>) -> AppResult<Self> {
        if points.is_empty() {
            return Err(DaqError::Configuration(
                "calibration curve needs at least one point".to_string(),
            ));
        }
        if points
            .iter()
            .any(|p| !p.resistance.is_finite() || !p.temperature.is_finite())
        {
            return Err(DaqError::Configuration(
                "calibration points must be finite".to_string(),
            ));
        }
        points.sort_by(|a, b| a.resistance.total_cmp(&b.resistance));
        Ok(Self { points })
    }

    /// Generic ruthenium oxide sensor table.
    pub fn ruo2_default() -> Self {
        let table = [
            (1_000.0, 300.0),
            (1_150.0, 40.0),
            (1_400.0, 10.0),
            (1_800.0, 4.0),
            (2_600.0, 1.5),
            (4_000.0, 0.6),
            (7_000.0, 0.25),
            (15_000.0, 0.1),
            (40_000.0, 0.04),
            (120_000.0, 0.015),
        ];
        Self {
            points: table
                .iter()
                .map(|&(resistance, temperature)| CalibrationPoint {
                    resistance,
                    temperature,
                })
                .collect(),
        }
    }

    /// Temperature for `resistance`, NaN for a non-finite reading.
    pub fn temperature(&self, resistance: f64) -> f64 {
        if !resistance.is_finite() {
            return f64::NAN;
        }
        let (first, last) = match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return f64::NAN,
        };
        if resistance <= first.resistance {
            return first.temperature;
        }
        if resistance >= last.resistance {
            return last.temperature;
        }
        let upper = self
            .points
            .partition_point(|p| p.resistance < resistance)
            .min(self.points.len() - 1);
        let hi = self.points[upper];
        let lo = self.points[upper.saturating_sub(1)];
        if hi.resistance == lo.resistance {
            return hi.temperature;
        }
        let t = (resistance - lo.resistance) / (hi.resistance - lo.resistance);
        lo.temperature + t * (hi.temperature - lo.temperature)
    }
}
