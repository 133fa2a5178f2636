// THEORY:
// This file is the entry point for the `meanshift_vision` library crate. It
// exposes the `TrackingPipeline` and its configuration as the high-level
// interface, while the `core_modules` hold the layers it is assembled from:
//
// - `numeric`, `histogram`, `region`: the appearance model and its geometry.
// - `notification`, `shared_buffer`, `transfer`: the cross-domain protocol.
// - `accelerator`: the offload worker and its session lifecycle.
// - `weight_engine`, `tracker`: the per-frame mean-shift computation.
//
// The core modules stay public so that embedders can drive the tracker or the
// accelerator directly, without the pipeline.

pub mod core_modules;
pub mod error;
pub mod pipeline;

pub use error::{TrackingError, TrackingResult};
pub use pipeline::{FrameSink, TrackReport, TrackerConfig, TrackingPipeline};
