// THEORY:
// Regions are embarrassingly parallel: no region's processing reads or writes
// another region's data, and the only shared mutable state in the whole
// session is the coordinator's aggregation point. This module supplies the
// machinery that exploits that:
// 1.  **Bounded worker pool**: a fixed set of worker tasks fed by a
//     round-robin dispatcher. Each worker holds nothing but Arc'd read-only
//     collaborators (the detector and the estimator), so region tasks can run
//     side by side without locks.
// 2.  **Oneshot replies**: every submitted task carries its own reply
//     channel. The coordinator gathers replies at a single point, which keeps
//     aggregation a single-writer reduction.
// 3.  **Cancellation**: a `CancelHandle` is a cheap shared flag. The
//     coordinator checks it before dispatching each region; in-flight tasks
//     are abandoned by dropping their reply receivers, so partial results can
//     never reach the aggregate.
// Within one region task the step sequence stays strictly sequential; the
// parallelism is across regions only.

use crate::core_modules::detection::{Detection, retain_valid};
use crate::core_modules::estimator::{EstimationRecord, RegionEstimator};
use crate::core_modules::region::SegmentationRegion;
use crate::error::EstimationError;
use crate::pipeline::PlantDetector;
use image::RgbImage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Session-level cancellation signal. Cloning hands out another view of the
/// same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevents any further region task from being dispatched. In-flight
    /// tasks finish or are abandoned; their results are never merged.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Everything a region carries from the detection stage into the estimation
/// stage.
#[derive(Debug)]
pub struct RegionDetection {
    pub region: SegmentationRegion,
    pub crop: RgbImage,
    pub detections: Vec<Detection>,
}

/// Work items accepted by the pool.
pub enum RegionTask {
    Detect {
        region: SegmentationRegion,
        image: Arc<RgbImage>,
        reply: oneshot::Sender<Result<RegionDetection, EstimationError>>,
    },
    Estimate {
        region: SegmentationRegion,
        crop: RgbImage,
        detections: Vec<Detection>,
        reply: oneshot::Sender<Result<Vec<EstimationRecord>, EstimationError>>,
    },
}

/// A bounded pool of region workers behind a round-robin dispatcher.
pub struct RegionWorkerPool {
    task_sender: mpsc::UnboundedSender<RegionTask>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl RegionWorkerPool {
    pub fn new(
        worker_count: usize,
        detector: Arc<dyn PlantDetector>,
        estimator: Arc<RegionEstimator>,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<RegionTask>();

        // A single dispatcher distributes tasks over per-worker channels.
        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..worker_count)
            .map(|_| mpsc::unbounded_channel::<RegionTask>())
            .unzip();

        tokio::spawn(async move {
            let mut worker_index = 0;
            while let Some(task) = task_receiver.recv().await {
                let _ = worker_senders[worker_index].send(task);
                worker_index = (worker_index + 1) % worker_count;
            }
        });

        let mut workers = Vec::with_capacity(worker_count);
        for mut worker_receiver in worker_receivers {
            let detector = Arc::clone(&detector);
            let estimator = Arc::clone(&estimator);

            workers.push(tokio::spawn(async move {
                while let Some(task) = worker_receiver.recv().await {
                    match task {
                        RegionTask::Detect {
                            region,
                            image,
                            reply,
                        } => {
                            let _ = reply.send(run_detection(detector.as_ref(), region, &image));
                        }
                        RegionTask::Estimate {
                            region,
                            crop,
                            detections,
                            reply,
                        } => {
                            let _ = reply.send(estimator.run_region(&region, &detections, &crop));
                        }
                    }
                }
            }));
        }

        Self {
            task_sender,
            workers,
        }
    }

    /// Queues the detection step for one region and returns the reply slot.
    pub fn submit_detect(
        &self,
        region: SegmentationRegion,
        image: Arc<RgbImage>,
    ) -> Result<oneshot::Receiver<Result<RegionDetection, EstimationError>>, EstimationError> {
        let region_id = region.id;
        let (reply, receiver) = oneshot::channel();
        self.task_sender
            .send(RegionTask::Detect {
                region,
                image,
                reply,
            })
            .map_err(|_| EstimationError::region(region_id, "detection", "worker pool is down"))?;
        Ok(receiver)
    }

    /// Queues the estimation step for one region and returns the reply slot.
    pub fn submit_estimate(
        &self,
        region: SegmentationRegion,
        crop: RgbImage,
        detections: Vec<Detection>,
    ) -> Result<oneshot::Receiver<Result<Vec<EstimationRecord>, EstimationError>>, EstimationError>
    {
        let region_id = region.id;
        let (reply, receiver) = oneshot::channel();
        self.task_sender
            .send(RegionTask::Estimate {
                region,
                crop,
                detections,
                reply,
            })
            .map_err(|_| EstimationError::region(region_id, "estimation", "worker pool is down"))?;
        Ok(receiver)
    }
}

/// The detection step for one region: resolve the crop, call the external
/// detector, and drop malformed records at the boundary.
fn run_detection(
    detector: &dyn PlantDetector,
    region: SegmentationRegion,
    image: &RgbImage,
) -> Result<RegionDetection, EstimationError> {
    let (width, height) = region
        .mask_dimensions()
        .map_err(|e| EstimationError::region(region.id, "detection", e))?;
    let crop = region
        .crop_from(image)
        .map_err(|e| EstimationError::region(region.id, "detection", e))?;
    let raw = detector
        .detect(&region, &crop)
        .map_err(|e| EstimationError::region(region.id, "detection", e))?;

    let (detections, dropped) = retain_valid(raw, width, height);
    if dropped > 0 {
        debug!(
            region_id = region.id,
            dropped, "dropped malformed detection records"
        );
    }

    Ok(RegionDetection {
        region,
        crop,
        detections,
    })
}
