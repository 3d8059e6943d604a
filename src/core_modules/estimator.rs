// THEORY:
// The estimator is where all the preceding machinery cashes out into a
// number: for each band, the suppressed residual area divided by the
// calibrated per-plant footprint, deliberately biased toward overcounting.
// For a sales/inventory product, reporting stock that is not there is
// annoying; failing to report stock that *is* there is lost revenue, so the
// divisor is shrunk by `alpha_overcount` (< 1.0) and the quotient is rounded
// up.
//
// `RegionEstimator::run_region` is the single-region engine: it sequences
// mask building, residual computation, band partitioning, and per-band
// suppression/calibration/estimation, strictly in order, producing one
// immutable `EstimationRecord` per band. It owns no shared state and is safe
// to run for many regions concurrently; the coordinator does exactly that.

use crate::core_modules::bands::partition_bands;
use crate::core_modules::calibration::{CalibrationConfig, calibrate_band};
use crate::core_modules::detection::Detection;
use crate::core_modules::floor_filter::{FloorFilterConfig, suppress_floor};
use crate::core_modules::mask_builder::{build_detection_mask, mask_area, residual_mask};
use crate::core_modules::region::{ContainerType, SegmentationRegion};
use crate::error::{EstimationError, ValidationError};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tuning for the estimation engine. All values that were once empirical
/// literals live here so they can be tuned and tested independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Number of horizontal perspective bands per region.
    pub band_count: usize,
    /// Divisor bias in (0, 1]; values below 1.0 skew toward overcounting.
    pub alpha_overcount: f64,
    /// Detection-circle radius as a fraction of the box's larger side.
    pub radius_scale: f64,
    /// Per-band plant-size calibration settings.
    pub calibration: CalibrationConfig,
    /// Floor/background suppression settings.
    pub floor_filter: FloorFilterConfig,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            band_count: crate::core_modules::bands::DEFAULT_BAND_COUNT,
            alpha_overcount: 0.9,
            radius_scale: crate::core_modules::mask_builder::DEFAULT_RADIUS_SCALE,
            calibration: CalibrationConfig::default(),
            floor_filter: FloorFilterConfig::default(),
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<(), EstimationError> {
        if self.band_count == 0 {
            return Err(EstimationError::InvalidConfig(
                "band_count must be at least 1".to_string(),
            ));
        }
        if !(self.alpha_overcount > 0.0 && self.alpha_overcount <= 1.0) {
            return Err(EstimationError::InvalidConfig(format!(
                "alpha_overcount must be in (0, 1], got {}",
                self.alpha_overcount
            )));
        }
        if !(self.radius_scale > 0.0) {
            return Err(EstimationError::InvalidConfig(format!(
                "radius_scale must be positive, got {}",
                self.radius_scale
            )));
        }
        self.calibration
            .validate()
            .map_err(EstimationError::InvalidConfig)?;
        self.floor_filter
            .validate()
            .map_err(EstimationError::InvalidConfig)?;
        Ok(())
    }
}

/// The output of processing one band: one flat, bulk-insert-ready row.
/// Created once per band per run and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationRecord {
    pub region_id: u64,
    pub band_index: usize,
    pub y_start: u32,
    pub y_end: u32,
    /// Region area left unexplained by detections, in px².
    pub residual_area: u64,
    /// Residual area surviving floor suppression, in px².
    pub suppressed_area: u64,
    /// Area removed by floor suppression, in px².
    pub removed_area: u64,
    /// Undetected plants attributed to this band.
    pub estimated_count: u64,
    /// Per-plant footprint the count was computed with.
    pub calibration_average_area: f64,
    /// Detections that fed the calibration.
    pub calibration_sample_count: usize,
    /// True when the fallback footprint was used.
    pub fallback_used: bool,
    /// The overcount bias in force for this record.
    pub alpha_overcount: f64,
    pub container_type: ContainerType,
}

/// `ceil(suppressed_area / (avg_plant_area * alpha))`, clamped to zero for
/// empty bands. `avg_plant_area` and `alpha` are positive by construction.
pub fn estimate_band_count(suppressed_area: u64, avg_plant_area: f64, alpha_overcount: f64) -> u64 {
    if suppressed_area == 0 {
        return 0;
    }
    (suppressed_area as f64 / (avg_plant_area * alpha_overcount)).ceil() as u64
}

/// The single-region estimation engine.
pub struct RegionEstimator {
    config: EstimatorConfig,
}

impl RegionEstimator {
    pub fn new(config: EstimatorConfig) -> Result<Self, EstimationError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Runs the full estimation sequence for one region. Any failure is
    /// region-scoped; the coordinator converts it into a warning.
    pub fn run_region(
        &self,
        region: &SegmentationRegion,
        detections: &[Detection],
        crop: &RgbImage,
    ) -> Result<Vec<EstimationRecord>, EstimationError> {
        let region_mask = region
            .resolve_mask()
            .map_err(|e| EstimationError::region(region.id, "estimation", e))?;
        if crop.dimensions() != region_mask.dimensions() {
            return Err(EstimationError::region(
                region.id,
                "estimation",
                format!(
                    "crop {}x{} does not match mask {}x{}",
                    crop.width(),
                    crop.height(),
                    region_mask.width(),
                    region_mask.height()
                ),
            ));
        }
        if mask_area(&region_mask) == 0 {
            return Err(EstimationError::region(
                region.id,
                "estimation",
                ValidationError::EmptyMask,
            ));
        }

        // --- 1. Explained vs residual area ---
        let detection_mask = build_detection_mask(
            detections,
            region_mask.width(),
            region_mask.height(),
            self.config.radius_scale,
        );
        let residual = residual_mask(&region_mask, &detection_mask);

        // --- 2. Perspective banding ---
        let bands = partition_bands(&residual, self.config.band_count);

        // --- 3. Per-band suppression, calibration, estimation ---
        let mut records = Vec::with_capacity(bands.len());
        for band in &bands {
            let residual_area = mask_area(&band.residual);
            let suppressed = suppress_floor(&band.residual, crop, &self.config.floor_filter);
            let suppressed_area = mask_area(&suppressed);
            let calibration = calibrate_band(
                detections,
                band.y_start,
                band.y_end,
                &self.config.calibration,
            );
            let estimated_count = estimate_band_count(
                suppressed_area,
                calibration.average_area,
                self.config.alpha_overcount,
            );

            debug!(
                region_id = region.id,
                band = band.index,
                residual_area,
                suppressed_area,
                estimated_count,
                fallback = calibration.fallback_used,
                "band estimated"
            );

            records.push(EstimationRecord {
                region_id: region.id,
                band_index: band.index,
                y_start: band.y_start,
                y_end: band.y_end,
                residual_area,
                suppressed_area,
                removed_area: residual_area - suppressed_area,
                estimated_count,
                calibration_average_area: calibration.average_area,
                calibration_sample_count: calibration.sample_count,
                fallback_used: calibration.fallback_used,
                alpha_overcount: self.config.alpha_overcount,
                container_type: region.container_type.clone(),
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::region::RegionBoundary;
    use image::{GrayImage, Luma, Rgb};

    #[test]
    fn zero_suppressed_area_estimates_zero() {
        assert_eq!(estimate_band_count(0, 2500.0, 0.9), 0);
    }

    #[test]
    fn count_is_rounded_up() {
        // 5000 / (2500 * 1.0) = 2.0 exactly; 5001 rounds to 3.
        assert_eq!(estimate_band_count(5000, 2500.0, 1.0), 2);
        assert_eq!(estimate_band_count(5001, 2500.0, 1.0), 3);
    }

    #[test]
    fn alpha_below_one_biases_toward_overcounting() {
        let unbiased = estimate_band_count(10_000, 2500.0, 1.0);
        let biased = estimate_band_count(10_000, 2500.0, 0.9);
        assert!(biased >= unbiased);
        assert_eq!(biased, 5);
    }

    #[test]
    fn config_validation_rejects_bad_alpha_and_band_count() {
        let mut config = EstimatorConfig::default();
        config.alpha_overcount = 0.0;
        assert!(config.validate().is_err());
        config.alpha_overcount = 1.5;
        assert!(config.validate().is_err());

        let mut config = EstimatorConfig::default();
        config.band_count = 0;
        assert!(config.validate().is_err());
    }

    fn full_mask_region(id: u64, width: u32, height: u32) -> SegmentationRegion {
        let mut mask = GrayImage::new(width, height);
        for pixel in mask.pixels_mut() {
            pixel.0[0] = 255;
        }
        SegmentationRegion {
            id,
            container_type: ContainerType::Tray,
            origin: (0, 0),
            boundary: RegionBoundary::Mask(mask),
        }
    }

    /// Foliage everywhere: bright green with a sprinkle of darker leaves so
    /// the brightness split has two classes to separate.
    fn leafy_crop(width: u32, height: u32) -> RgbImage {
        let mut crop = RgbImage::new(width, height);
        for (x, y, pixel) in crop.enumerate_pixels_mut() {
            *pixel = if (x + y) % 7 == 0 {
                Rgb([25, 60, 20])
            } else {
                Rgb([70, 180, 60])
            };
        }
        crop
    }

    #[test]
    fn records_preserve_band_order_and_partition() {
        let region = full_mask_region(1, 40, 100);
        let estimator = RegionEstimator::new(EstimatorConfig::default()).unwrap();
        let records = estimator
            .run_region(&region, &[], &leafy_crop(40, 100))
            .unwrap();
        assert_eq!(records.len(), 4);
        for (index, record) in records.iter().enumerate() {
            assert_eq!(record.band_index, index);
        }
        assert_eq!(records[0].y_start, 0);
        assert_eq!(records[3].y_end, 100);
    }

    #[test]
    fn zero_detections_drive_every_band_to_fallback() {
        let region = full_mask_region(2, 40, 100);
        let estimator = RegionEstimator::new(EstimatorConfig::default()).unwrap();
        let records = estimator
            .run_region(&region, &[], &leafy_crop(40, 100))
            .unwrap();
        for record in &records {
            assert!(record.fallback_used);
            assert_eq!(record.calibration_average_area, 2500.0);
            assert_eq!(record.calibration_sample_count, 0);
        }
    }

    #[test]
    fn residual_only_in_band_zero_leaves_other_bands_at_zero() {
        // 1000x1000 region whose mask covers only the top band of four.
        let mut mask = GrayImage::new(1000, 1000);
        for y in 0..250 {
            for x in 0..1000 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let region = SegmentationRegion {
            id: 3,
            container_type: ContainerType::Tray,
            origin: (0, 0),
            boundary: RegionBoundary::Mask(mask),
        };
        let estimator = RegionEstimator::new(EstimatorConfig::default()).unwrap();
        let records = estimator
            .run_region(&region, &[], &leafy_crop(1000, 1000))
            .unwrap();

        assert!(records[0].estimated_count > 0);
        for record in &records[1..] {
            assert_eq!(record.residual_area, 0);
            assert_eq!(record.suppressed_area, 0);
            assert_eq!(record.estimated_count, 0);
        }
    }

    #[test]
    fn suppressed_never_exceeds_residual_in_any_band() {
        let region = full_mask_region(4, 64, 64);
        let detections = vec![Detection {
            center_x: 32.0,
            center_y: 16.0,
            width: 20.0,
            height: 20.0,
            confidence: 0.9,
            class_label: "plant".to_string(),
        }];
        let estimator = RegionEstimator::new(EstimatorConfig::default()).unwrap();
        let records = estimator
            .run_region(&region, &detections, &leafy_crop(64, 64))
            .unwrap();
        let region_area = 64 * 64u64;
        for record in &records {
            assert!(record.suppressed_area <= record.residual_area);
            assert!(record.residual_area <= region_area);
            assert_eq!(
                record.removed_area,
                record.residual_area - record.suppressed_area
            );
        }
    }

    #[test]
    fn empty_region_mask_is_a_region_scoped_error() {
        let region = SegmentationRegion {
            id: 5,
            container_type: ContainerType::Box,
            origin: (0, 0),
            boundary: RegionBoundary::Mask(GrayImage::new(32, 32)),
        };
        let estimator = RegionEstimator::new(EstimatorConfig::default()).unwrap();
        let result = estimator.run_region(&region, &[], &RgbImage::new(32, 32));
        assert!(matches!(
            result,
            Err(EstimationError::Region { region_id: 5, .. })
        ));
    }

    #[test]
    fn identical_inputs_yield_identical_records() {
        let region = full_mask_region(6, 80, 80);
        let crop = leafy_crop(80, 80);
        let detections: Vec<Detection> = (0..12)
            .map(|i| Detection {
                center_x: 40.0,
                center_y: 5.0 + i as f64,
                width: 18.0,
                height: 18.0,
                confidence: 0.9,
                class_label: "plant".to_string(),
            })
            .collect();
        let estimator = RegionEstimator::new(EstimatorConfig::default()).unwrap();
        let first = estimator.run_region(&region, &detections, &crop).unwrap();
        let second = estimator.run_region(&region, &detections, &crop).unwrap();
        assert_eq!(first, second);
    }
}
