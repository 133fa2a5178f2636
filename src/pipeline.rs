// THEORY:
// The `pipeline` module is the top-level API. It assembles the full stack
// (accelerator session, weight engine, tracker) from a single `TrackerConfig`
// and drives it over a stream of frames, handing every frame and its tracked
// region to a `FrameSink`. Video decoding, drawing and file output live on the
// other side of those two seams.

use crate::core_modules::accelerator::{AcceleratorSession, WorkerStats};
use crate::core_modules::histogram::HistogramKind;
use crate::core_modules::numeric::Numeric;
use crate::core_modules::region::TrackedRegion;
use crate::core_modules::tracker::{MaskShape, MeanShiftTracker, TrackOutcome};
use crate::core_modules::weight_engine::WeightEngine;
use crate::error::{TrackingError, TrackingResult};
use futures::{Stream, StreamExt};
use image::RgbImage;
use std::str::FromStr;
use tracing::{debug, info, warn};

pub const DEFAULT_BUFFER_SIZE: &str = "65536";
pub const DEFAULT_EXECUTABLE: &str = "pool_notify.out";
pub const DEFAULT_MAX_FRAMES: usize = 32;

/// Configuration for the tracking pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Rows at the bottom of each analysis window computed by the
    /// accelerator. Zero disables offload and no session is started.
    pub accelerator_rows: usize,
    /// Columns trimmed from each side of the region. `None` trims a wide
    /// region to its centred square.
    pub horizontal_shift: Option<u32>,
    pub mask: MaskShape,
    /// Kernel-weighted histograms cannot be combined with offload.
    pub histogram: HistogramKind,
    /// Shared buffer capacity in bytes, as a decimal string.
    pub buffer_size: String,
    /// Identifier of the accelerator image. Recorded, never loaded.
    pub executable: String,
    pub processor_id: u8,
    /// Stop after this many frames. `None` runs until the source ends.
    pub max_frames: Option<usize>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            accelerator_rows: 0,
            horizontal_shift: None,
            mask: MaskShape::Circular,
            histogram: HistogramKind::SinglePixel,
            buffer_size: DEFAULT_BUFFER_SIZE.to_string(),
            executable: DEFAULT_EXECUTABLE.to_string(),
            processor_id: 0,
            max_frames: Some(DEFAULT_MAX_FRAMES),
        }
    }
}

impl TrackerConfig {
    /// Defaults overridden by `MS_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`. Values that do not parse are logged
    /// and ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(rows) = parse_var(&lookup, "MS_ACCEL_ROWS") {
            self.accelerator_rows = rows;
        }
        if let Some(shift) = parse_var(&lookup, "MS_H_SHIFT") {
            self.horizontal_shift = Some(shift);
        }
        if let Some(name) = lookup("MS_MASK") {
            match MaskShape::from_name(&name) {
                Some(shape) => self.mask = shape,
                None => warn!(value = %name, "ignoring unknown MS_MASK"),
            }
        }
        if let Some(name) = lookup("MS_HISTOGRAM") {
            match HistogramKind::from_name(&name) {
                Some(kind) => self.histogram = kind,
                None => warn!(value = %name, "ignoring unknown MS_HISTOGRAM"),
            }
        }
        if let Some(size) = lookup("MS_BUFFER_SIZE") {
            self.buffer_size = size;
        }
        if let Some(executable) = lookup("MS_EXECUTABLE") {
            self.executable = executable;
        }
        if let Some(max) = parse_var::<usize>(&lookup, "MS_MAX_FRAMES") {
            self.max_frames = (max > 0).then_some(max);
        }
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable override");
            None
        }
    }
}

/// The tracker's answer for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackReport {
    pub frame_index: usize,
    pub outcome: TrackOutcome,
}

/// Receives every tracked frame, e.g. to draw the region and encode the
/// result.
pub trait FrameSink {
    fn accept(&mut self, frame: &RgbImage, report: &TrackReport) -> TrackingResult<()>;
}

impl FrameSink for Vec<TrackReport> {
    fn accept(&mut self, _frame: &RgbImage, report: &TrackReport) -> TrackingResult<()> {
        self.push(*report);
        Ok(())
    }
}

/// The main, top-level struct for the tracking engine.
pub struct TrackingPipeline<N: Numeric> {
    tracker: MeanShiftTracker<N>,
    config: TrackerConfig,
    frames_processed: usize,
}

impl<N: Numeric> TrackingPipeline<N> {
    /// Starts the accelerator (when offload is configured) and builds the
    /// target model from `region` of `first_frame`.
    pub async fn start(
        config: TrackerConfig,
        first_frame: &RgbImage,
        region: TrackedRegion,
    ) -> TrackingResult<Self> {
        if config.accelerator_rows > 0 && !config.histogram.is_mirrored() {
            return Err(TrackingError::UnsupportedConfiguration(format!(
                "{:?} histograms need accelerator_rows = 0, got {}",
                config.histogram, config.accelerator_rows
            )));
        }
        let engine = if config.accelerator_rows > 0 {
            let session =
                AcceleratorSession::start::<N>(&config.executable, &config.buffer_size).await?;
            WeightEngine::with_accelerator(session, config.accelerator_rows)
        } else {
            WeightEngine::host_only()
        };

        let mut tracker = MeanShiftTracker::new(engine)
            .with_mask(config.mask)
            .with_histogram(config.histogram);
        if let Some(shift) = config.horizontal_shift {
            tracker = tracker.with_horizontal_shift(shift);
        }
        if let Err(e) = tracker.init_target(first_frame, region) {
            if let Err(stop) = tracker.shutdown(config.processor_id).await {
                warn!("accelerator shutdown after failed init: {stop}");
            }
            return Err(e);
        }

        info!(
            %region,
            accelerator_rows = config.accelerator_rows,
            histogram = ?config.histogram,
            backend = N::NAME,
            "tracking pipeline started"
        );
        Ok(Self {
            tracker,
            config,
            frames_processed: 0,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn tracker(&self) -> &MeanShiftTracker<N> {
        &self.tracker
    }

    pub fn frames_processed(&self) -> usize {
        self.frames_processed
    }

    pub async fn process_frame(&mut self, frame: &RgbImage) -> TrackingResult<TrackReport> {
        let outcome = self.tracker.track(frame).await?;
        let report = TrackReport {
            frame_index: self.frames_processed,
            outcome,
        };
        self.frames_processed += 1;
        debug!(
            frame = report.frame_index,
            region = %outcome.region,
            iterations = outcome.iterations,
            converged = outcome.converged,
            "frame tracked"
        );
        Ok(report)
    }

    /// Tracks every frame of `frames`, up to the configured maximum, and
    /// returns how many were processed.
    pub async fn run<S, K>(&mut self, frames: S, sink: &mut K) -> TrackingResult<usize>
    where
        S: Stream<Item = RgbImage>,
        K: FrameSink + ?Sized,
    {
        let limit = self.config.max_frames.unwrap_or(usize::MAX);
        let frames = frames.take(limit);
        futures::pin_mut!(frames);

        let mut processed = 0;
        while let Some(frame) = frames.next().await {
            let report = self.process_frame(&frame).await?;
            sink.accept(&frame, &report)?;
            processed += 1;
        }
        info!(processed, total = self.frames_processed, "frame source drained");
        Ok(processed)
    }

    /// Tears the accelerator session down, if one was started.
    pub async fn finish(mut self) -> TrackingResult<Option<WorkerStats>> {
        let stats = self.tracker.shutdown(self.config.processor_id).await?;
        info!(frames = self.frames_processed, ?stats, "tracking pipeline finished");
        Ok(stats)
    }
}
