// The estimation engine proper: every module here is deterministic, owns no
// shared state, and operates on exactly one region (or one band) at a time.
// Orchestration across regions lives in `pipeline` / `parallel_pipeline`.

pub mod bands;
pub mod calibration;
pub mod detection;
pub mod estimator;
pub mod floor_filter;
pub mod mask_builder;
pub mod region;
