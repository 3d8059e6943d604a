// THEORY:
// This file is the main entry point for the `canopy_count` library crate.
// It follows the standard Rust convention of using `lib.rs` to define the
// public API exposed to external consumers (the task-runner and persistence
// layers that wrap this engine).
//
// The primary goal is to export the `EstimationPipeline` and its associated
// data structures (`PipelineConfig`, `PipelineResult`, the estimation
// records) as the clean, high-level interface for the counting engine. The
// per-region algorithms live in `core_modules` and remain usable on their
// own for callers that bring their own orchestration.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use core_modules::detection::Detection;
pub use core_modules::estimator::{EstimationRecord, EstimatorConfig, RegionEstimator};
pub use core_modules::region::{ContainerType, RegionBoundary, SegmentationRegion};
pub use error::{EstimationError, ValidationError};
pub use parallel_pipeline::CancelHandle;
pub use pipeline::{
    EstimationPipeline, PipelineConfig, PipelineResult, PipelineStage, PipelineStatus,
    PlantDetector, ProgressUpdate, RegionSegmenter,
};
