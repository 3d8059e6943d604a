// THEORY:
// Converting residual area into a plant count needs an expected per-plant
// footprint, and the best source for that number is the detector itself: the
// plants it *did* find in a band are live evidence of how large a plant
// appears at that distance from the camera. Calibrating per band, rather
// than once per region, is what makes the perspective banding pay off.
//
// Two guards keep the calibration honest:
// 1.  **Minimum sample size**: with too few detections in a band the mean is
//     noise; below the threshold the calibrator returns a configured
//     fallback footprint and flags the record so consumers can tell.
// 2.  **IQR outlier trimming**: one anomalously huge or tiny detection (a
//     detector misfire, two plants merged into one box) must not drag the
//     average. Values outside [Q1 - 1.5*IQR, Q3 + 1.5*IQR] are discarded;
//     if the trim empties the set, the unfiltered mean is used instead.

use crate::core_modules::detection::Detection;
use serde::{Deserialize, Serialize};

/// Tuning for the per-band plant-size calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Minimum detections a band needs before its own mean is trusted.
    pub min_samples: usize,
    /// Per-plant pixel footprint assumed when a band is under-sampled.
    pub fallback_area: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_samples: 10,
            fallback_area: 2500.0,
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.fallback_area > 0.0) {
            return Err(format!(
                "fallback_area must be positive, got {}",
                self.fallback_area
            ));
        }
        Ok(())
    }
}

/// Result of calibrating one band.
#[derive(Debug, Clone, PartialEq)]
pub struct BandCalibration {
    /// Expected per-plant pixel footprint for the band.
    pub average_area: f64,
    /// Number of detections whose center fell inside the band.
    pub sample_count: usize,
    /// True when the configured fallback footprint was used.
    pub fallback_used: bool,
}

/// Derives the expected per-plant footprint for a band from the detections
/// whose center-y falls inside [y_start, y_end).
pub fn calibrate_band(
    detections: &[Detection],
    y_start: u32,
    y_end: u32,
    config: &CalibrationConfig,
) -> BandCalibration {
    let samples: Vec<f64> = detections
        .iter()
        .filter(|d| d.center_y >= y_start as f64 && d.center_y < y_end as f64)
        .map(Detection::area)
        .collect();

    // An empty band always falls back, even when `min_samples` is tuned to
    // zero; the quartile math needs at least one value.
    if samples.is_empty() || samples.len() < config.min_samples {
        return BandCalibration {
            average_area: config.fallback_area,
            sample_count: samples.len(),
            fallback_used: true,
        };
    }

    let mut sorted = samples.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q1 = quartile(&sorted, 0.25);
    let q3 = quartile(&sorted, 0.75);
    let iqr = q3 - q1;
    let low = q1 - 1.5 * iqr;
    let high = q3 + 1.5 * iqr;

    let kept: Vec<f64> = samples
        .iter()
        .copied()
        .filter(|&area| area >= low && area <= high)
        .collect();

    // The trim can only empty the set in pathological distributions; the
    // unfiltered mean is still better than the fallback there.
    let average_area = if kept.is_empty() {
        mean(&samples)
    } else {
        mean(&kept)
    };

    BandCalibration {
        average_area,
        sample_count: samples.len(),
        fallback_used: false,
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Linear-interpolation quantile over pre-sorted values.
fn quartile(sorted: &[f64], p: f64) -> f64 {
    let rank = p * (sorted.len() - 1) as f64;
    let below = rank.floor() as usize;
    let fraction = rank - below as f64;
    if below + 1 < sorted.len() {
        sorted[below] + fraction * (sorted[below + 1] - sorted[below])
    } else {
        sorted[below]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection_with_area(center_y: f64, side: f64) -> Detection {
        Detection {
            center_x: 50.0,
            center_y,
            width: side,
            height: side,
            confidence: 0.9,
            class_label: "plant".to_string(),
        }
    }

    #[test]
    fn under_sampled_band_uses_the_fallback_exactly() {
        let detections: Vec<Detection> =
            (0..9).map(|i| detection_with_area(10.0 + i as f64, 40.0)).collect();
        let calibration = calibrate_band(&detections, 0, 100, &CalibrationConfig::default());
        assert!(calibration.fallback_used);
        assert_eq!(calibration.average_area, 2500.0);
        assert_eq!(calibration.sample_count, 9);
    }

    #[test]
    fn only_detections_inside_the_band_are_sampled() {
        let mut detections: Vec<Detection> =
            (0..10).map(|i| detection_with_area(10.0 + i as f64, 40.0)).collect();
        // Centers at or past y_end belong to the next band.
        detections.push(detection_with_area(100.0, 40.0));
        detections.push(detection_with_area(250.0, 40.0));
        let calibration = calibrate_band(&detections, 0, 100, &CalibrationConfig::default());
        assert_eq!(calibration.sample_count, 10);
        assert!(!calibration.fallback_used);
    }

    #[test]
    fn identical_areas_survive_the_trim_untouched() {
        let detections: Vec<Detection> =
            (0..12).map(|i| detection_with_area(5.0 + i as f64, 30.0)).collect();
        let calibration = calibrate_band(&detections, 0, 50, &CalibrationConfig::default());
        assert!(!calibration.fallback_used);
        assert_eq!(calibration.average_area, 900.0);
        assert_eq!(calibration.sample_count, 12);
    }

    #[test]
    fn a_single_outlier_is_discarded() {
        let mut detections: Vec<Detection> =
            (0..10).map(|i| detection_with_area(5.0 + i as f64, 50.0)).collect();
        detections.push(detection_with_area(20.0, 500.0));
        let calibration = calibrate_band(&detections, 0, 50, &CalibrationConfig::default());
        // 10 areas of 2500 plus one of 250000: the outlier must not move the mean.
        assert_eq!(calibration.average_area, 2500.0);
        assert_eq!(calibration.sample_count, 11);
        assert!(!calibration.fallback_used);
    }

    #[test]
    fn zero_detections_is_the_fallback_path() {
        let calibration = calibrate_band(&[], 0, 100, &CalibrationConfig::default());
        assert!(calibration.fallback_used);
        assert_eq!(calibration.average_area, 2500.0);
        assert_eq!(calibration.sample_count, 0);
    }

    #[test]
    fn empty_band_falls_back_even_with_min_samples_zero() {
        let config = CalibrationConfig {
            min_samples: 0,
            fallback_area: 2500.0,
        };
        assert!(config.validate().is_ok());
        let calibration = calibrate_band(&[], 0, 100, &config);
        assert!(calibration.fallback_used);
        assert_eq!(calibration.average_area, 2500.0);
        assert_eq!(calibration.sample_count, 0);
    }

    #[test]
    fn quartiles_interpolate_linearly() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quartile(&sorted, 0.25), 1.75);
        assert_eq!(quartile(&sorted, 0.75), 3.25);
        assert_eq!(quartile(&sorted, 0.0), 1.0);
        assert_eq!(quartile(&sorted, 1.0), 4.0);
    }
}
