// THEORY:
// The error surface of the engine mirrors its failure taxonomy. There are
// exactly three kinds of trouble:
// 1.  **Fatal**: the whole session is unusable (unreadable source image, a
//     segmenter that found nothing, cancellation, or a broken configuration).
//     These propagate to the caller as the single error of the run.
// 2.  **Region-scoped**: one region's detection or estimation step failed.
//     These are caught at the region-processing boundary, converted to
//     structured warnings, and never escape to the caller as errors.
// 3.  **Validation**: a malformed input record (detection or region boundary)
//     rejected before it can enter the pipeline at all.
// Callers therefore always receive either a finished `PipelineResult` or one
// fatal `EstimationError`, never a half-built aggregate.

use thiserror::Error;

/// Crate-level error type for the estimation engine.
#[derive(Debug, Error)]
pub enum EstimationError {
    /// The source image cannot be processed (zero dimensions, corrupt data).
    #[error("source image is unreadable: {0}")]
    UnreadableImage(String),

    /// Segmentation produced zero regions; there is nothing to count.
    #[error("segmentation produced zero regions")]
    NoRegions,

    /// The session was cancelled before it could complete.
    #[error("session cancelled before completion")]
    Cancelled,

    /// A configuration value is outside its allowed range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// One region's processing failed. Caught at the region boundary and
    /// converted into a warning; never surfaced to the session caller.
    #[error("region {region_id} failed during {stage}: {message}")]
    Region {
        region_id: u64,
        stage: &'static str,
        message: String,
    },

    /// A malformed input record was rejected at the boundary.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl EstimationError {
    /// Wraps any error into the region-scoped variant for the given stage.
    pub fn region(region_id: u64, stage: &'static str, source: impl std::fmt::Display) -> Self {
        Self::Region {
            region_id,
            stage,
            message: source.to_string(),
        }
    }
}

/// Rejection reasons for malformed input records.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("non-positive dimensions {width}x{height}")]
    NonPositiveDimensions { width: f64, height: f64 },

    #[error("center ({x}, {y}) lies outside the {region_width}x{region_height} region")]
    CenterOutOfBounds {
        x: f64,
        y: f64,
        region_width: u32,
        region_height: u32,
    },

    #[error("confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),

    #[error("degenerate region boundary: {0}")]
    DegenerateBoundary(String),

    #[error("region mask contains no set pixels")]
    EmptyMask,

    #[error("region crop at ({x}, {y}) size {width}x{height} exceeds the {source_width}x{source_height} source image")]
    CropOutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        source_width: u32,
        source_height: u32,
    },
}
