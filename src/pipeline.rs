// THEORY:
// The `pipeline` module is the top-level API for the estimation engine. It
// owns the session state machine
// (Pending → Segmenting → Detecting → Estimating → Aggregating → Completed)
// and sequences the external collaborators around the per-region estimation
// engine. Three design rules shape it:
// 1.  **Partial failure is normal**: a single region failing its detection or
//     estimation step becomes a structured warning and the session continues;
//     only an unreadable source image or an empty segmentation is fatal.
//     Callers always get either a finished `PipelineResult` or one fatal
//     error, never an unlabeled partial.
// 2.  **Regions run on the worker pool**: the Detecting and Estimating stages
//     fan regions out over `RegionWorkerPool` and gather the oneshot replies
//     at a single aggregation point. Band order inside a region is
//     preserved; cross-region order in the aggregate is unspecified.
// 3.  **Progress is monotone**: a watch channel publishes the percentage with
//     checkpoints after each stage (20/50/80/100). The exact checkpoint
//     values are policy; monotonicity and the final 100 are invariant.

use crate::core_modules::detection::Detection;
use crate::core_modules::estimator::{EstimationRecord, EstimatorConfig, RegionEstimator};
use crate::core_modules::region::SegmentationRegion;
use crate::error::EstimationError;
use crate::parallel_pipeline::{CancelHandle, RegionDetection, RegionWorkerPool};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

/// Supplies the region list for a source photograph. Implemented by the
/// external segmentation collaborator.
pub trait RegionSegmenter: Send + Sync {
    fn segment(&self, image: &RgbImage) -> Result<Vec<SegmentationRegion>, EstimationError>;
}

/// Supplies detections for one region's crop. Implemented by the external
/// object-detection collaborator.
pub trait PlantDetector: Send + Sync {
    fn detect(
        &self,
        region: &SegmentationRegion,
        crop: &RgbImage,
    ) -> Result<Vec<Detection>, EstimationError>;
}

/// Where a session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineStage {
    Pending,
    Segmenting,
    Detecting,
    Estimating,
    Aggregating,
    Completed,
}

impl PipelineStage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Segmenting => "segmenting",
            Self::Detecting => "detecting",
            Self::Estimating => "estimating",
            Self::Aggregating => "aggregating",
            Self::Completed => "completed",
        }
    }
}

/// Final disposition of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineStatus {
    Completed,
    CompletedWithWarnings,
    /// Never produced by `run` itself, which reports fatal failure as an
    /// error instead; callers persisting session rows use this to mark a
    /// session that ended in that error.
    Failed,
}

/// A recoverable, region-scoped failure recorded during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionWarning {
    pub region_id: u64,
    pub stage: String,
    pub message: String,
}

/// One detection actually used by a completed region, flattened for bulk
/// insert by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRow {
    pub region_id: u64,
    pub center_x: f64,
    pub center_y: f64,
    pub width: f64,
    pub height: f64,
    pub confidence: f64,
    pub class_label: String,
}

impl DetectionRow {
    fn from_detection(region_id: u64, detection: &Detection) -> Self {
        Self {
            region_id,
            center_x: detection.center_x,
            center_y: detection.center_y,
            width: detection.width,
            height: detection.height,
            confidence: detection.confidence,
            class_label: detection.class_label.clone(),
        }
    }
}

/// Wall-clock time spent in each stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTimings {
    pub segmentation_ms: u64,
    pub detection_ms: u64,
    pub estimation_ms: u64,
    pub aggregation_ms: u64,
}

/// Session-level aggregate handed to the persistence collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    /// Detections used across all completed regions.
    pub total_detected: u64,
    /// Sum of `estimated_count` over every record.
    pub total_estimated: u64,
    pub timings: StageTimings,
    pub status: PipelineStatus,
    pub warnings: Vec<RegionWarning>,
    /// One row per band per completed region; band order preserved within a
    /// region, cross-region order unspecified.
    pub records: Vec<EstimationRecord>,
    /// One row per detection used, for completed regions only.
    pub detections: Vec<DetectionRow>,
}

/// Progress signal published over the watch channel, suitable for hand-off
/// to a notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Monotonically increasing, 100 on completion.
    pub percent: u8,
    pub stage: PipelineStage,
    /// Snapshot of every region warning recorded so far.
    pub warnings: Vec<RegionWarning>,
}

/// Session-level tuning for the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub estimator: EstimatorConfig,
    /// Region workers; 0 means one per available CPU.
    pub worker_count: usize,
    /// Optional per-region task timeout.
    pub region_timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            estimator: EstimatorConfig::default(),
            worker_count: 0,
            region_timeout_ms: None,
        }
    }
}

// Progress checkpoints after each stage. Policy values, not invariants.
const PROGRESS_AFTER_SEGMENTATION: u8 = 20;
const PROGRESS_AFTER_DETECTION: u8 = 50;
const PROGRESS_AFTER_ESTIMATION: u8 = 80;
const PROGRESS_AFTER_AGGREGATION: u8 = 100;

/// The Pipeline Coordinator: one instance drives one session at a time.
pub struct EstimationPipeline {
    config: PipelineConfig,
    segmenter: Arc<dyn RegionSegmenter>,
    detector: Arc<dyn PlantDetector>,
    estimator: Arc<RegionEstimator>,
    progress: watch::Sender<ProgressUpdate>,
    cancel: CancelHandle,
}

impl EstimationPipeline {
    pub fn new(
        config: PipelineConfig,
        segmenter: Arc<dyn RegionSegmenter>,
        detector: Arc<dyn PlantDetector>,
    ) -> Result<Self, EstimationError> {
        let estimator = Arc::new(RegionEstimator::new(config.estimator.clone())?);
        let (progress, _) = watch::channel(ProgressUpdate {
            percent: 0,
            stage: PipelineStage::Pending,
            warnings: Vec::new(),
        });
        Ok(Self {
            config,
            segmenter,
            detector,
            estimator,
            progress,
            cancel: CancelHandle::new(),
        })
    }

    /// Subscribes to progress updates for this session.
    pub fn progress(&self) -> watch::Receiver<ProgressUpdate> {
        self.progress.subscribe()
    }

    /// Handle that cancels the session from outside.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs one full session over a source photograph.
    pub async fn run(&self, image: &RgbImage) -> Result<PipelineResult, EstimationError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(EstimationError::UnreadableImage(
                "zero-dimension source image".to_string(),
            ));
        }
        self.ensure_not_cancelled()?;

        let mut timings = StageTimings::default();
        let mut warnings: Vec<RegionWarning> = Vec::new();

        // --- Stage 1: Segmenting ---
        self.publish(0, PipelineStage::Segmenting, &warnings);
        let stage_start = Instant::now();
        let regions = self.segmenter.segment(image)?;
        if regions.is_empty() {
            return Err(EstimationError::NoRegions);
        }
        timings.segmentation_ms = stage_start.elapsed().as_millis() as u64;
        info!(regions = regions.len(), "segmentation complete");
        self.publish(PROGRESS_AFTER_SEGMENTATION, PipelineStage::Detecting, &warnings);

        let worker_count = if self.config.worker_count == 0 {
            num_cpus::get()
        } else {
            self.config.worker_count
        };
        let pool = RegionWorkerPool::new(
            worker_count,
            Arc::clone(&self.detector),
            Arc::clone(&self.estimator),
        );
        let image = Arc::new(image.clone());

        // --- Stage 2: Detecting ---
        let stage_start = Instant::now();
        let mut pending = Vec::with_capacity(regions.len());
        for region in regions {
            self.ensure_not_cancelled()?;
            let region_id = region.id;
            match pool.submit_detect(region, Arc::clone(&image)) {
                Ok(receiver) => pending.push((region_id, receiver)),
                Err(error) => warnings.push(self.record_warning(region_id, "detection", &error)),
            }
        }
        let replies = futures::future::join_all(pending.into_iter().map(
            |(region_id, receiver)| async move {
                (
                    region_id,
                    self.await_reply(region_id, "detection", receiver).await,
                )
            },
        ))
        .await;
        let mut detected: Vec<RegionDetection> = Vec::with_capacity(replies.len());
        for (region_id, reply) in replies {
            match reply {
                Ok(outcome) => detected.push(outcome),
                Err(error) => warnings.push(self.record_warning(region_id, "detection", &error)),
            }
        }
        self.ensure_not_cancelled()?;
        timings.detection_ms = stage_start.elapsed().as_millis() as u64;
        info!(
            regions = detected.len(),
            warnings = warnings.len(),
            "detection complete"
        );
        self.publish(PROGRESS_AFTER_DETECTION, PipelineStage::Estimating, &warnings);

        // --- Stage 3: Estimating ---
        let stage_start = Instant::now();
        let mut pending = Vec::with_capacity(detected.len());
        for outcome in detected {
            self.ensure_not_cancelled()?;
            let region_id = outcome.region.id;
            let detections = outcome.detections.clone();
            match pool.submit_estimate(outcome.region, outcome.crop, outcome.detections) {
                Ok(receiver) => pending.push((region_id, detections, receiver)),
                Err(error) => warnings.push(self.record_warning(region_id, "estimation", &error)),
            }
        }
        let replies = futures::future::join_all(pending.into_iter().map(
            |(region_id, detections, receiver)| async move {
                (
                    region_id,
                    detections,
                    self.await_reply(region_id, "estimation", receiver).await,
                )
            },
        ))
        .await;
        let mut records: Vec<EstimationRecord> = Vec::new();
        let mut detection_rows: Vec<DetectionRow> = Vec::new();
        for (region_id, detections, reply) in replies {
            match reply {
                Ok(region_records) => {
                    detection_rows.extend(
                        detections
                            .iter()
                            .map(|d| DetectionRow::from_detection(region_id, d)),
                    );
                    records.extend(region_records);
                }
                Err(error) => warnings.push(self.record_warning(region_id, "estimation", &error)),
            }
        }
        self.ensure_not_cancelled()?;
        timings.estimation_ms = stage_start.elapsed().as_millis() as u64;
        self.publish(PROGRESS_AFTER_ESTIMATION, PipelineStage::Aggregating, &warnings);

        // --- Stage 4: Aggregating ---
        let stage_start = Instant::now();
        let total_detected = detection_rows.len() as u64;
        let total_estimated: u64 = records.iter().map(|r| r.estimated_count).sum();
        let status = if warnings.is_empty() {
            PipelineStatus::Completed
        } else {
            PipelineStatus::CompletedWithWarnings
        };
        timings.aggregation_ms = stage_start.elapsed().as_millis() as u64;
        self.publish(PROGRESS_AFTER_AGGREGATION, PipelineStage::Completed, &warnings);
        info!(
            total_detected,
            total_estimated,
            warnings = warnings.len(),
            "session complete"
        );

        Ok(PipelineResult {
            total_detected,
            total_estimated,
            timings,
            status,
            warnings,
            records,
            detections: detection_rows,
        })
    }

    /// Awaits one region reply, applying the configured per-region timeout.
    async fn await_reply<T>(
        &self,
        region_id: u64,
        stage: &'static str,
        receiver: oneshot::Receiver<Result<T, EstimationError>>,
    ) -> Result<T, EstimationError> {
        let reply = match self.config.region_timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(Duration::from_millis(ms), receiver).await {
                    Ok(reply) => reply,
                    Err(_) => {
                        return Err(EstimationError::region(
                            region_id,
                            stage,
                            "region task timed out",
                        ));
                    }
                }
            }
            None => receiver.await,
        };
        match reply {
            Ok(result) => result,
            Err(_) => Err(EstimationError::region(
                region_id,
                stage,
                "worker dropped the task",
            )),
        }
    }

    fn record_warning(
        &self,
        region_id: u64,
        stage: &'static str,
        error: &EstimationError,
    ) -> RegionWarning {
        warn!(region_id, stage, %error, "region excluded from aggregate");
        RegionWarning {
            region_id,
            stage: stage.to_string(),
            message: error.to_string(),
        }
    }

    fn publish(&self, percent: u8, stage: PipelineStage, warnings: &[RegionWarning]) {
        self.progress.send_replace(ProgressUpdate {
            percent,
            stage,
            warnings: warnings.to_vec(),
        });
    }

    fn ensure_not_cancelled(&self) -> Result<(), EstimationError> {
        if self.cancel.is_cancelled() {
            Err(EstimationError::Cancelled)
        } else {
            Ok(())
        }
    }
}
