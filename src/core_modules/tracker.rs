// THEORY:
// The `tracker` module owns the tracked object. It holds the target model
// (built once, from the first frame) and the current region, and for every
// new frame it climbs the weight field toward the densest match with the
// mean-shift procedure.
//
// Key architectural principles:
// 1.  **One candidate per frame**: the candidate histogram is sampled from the
//     region as it stood when the frame arrived. Iterations within the frame
//     move the window, not the candidate.
// 2.  **Normalised centroid**: cell coordinates are mapped onto `[-1, 1]`
//     across the analysis window. The weighted mean of those coordinates,
//     scaled back by the window's half-extent and truncated toward zero, is
//     the pixel step for the iteration.
// 3.  **Bounded search**: at most `MAX_ITERATIONS` weight fields per frame.
//     A zero step on both axes is convergence. So is a step that the frame
//     border cancels out.
// 4.  **Fail soft per frame**: an error inside a frame (a degenerate weight
//     sum, a malformed accelerator exchange) aborts only that frame. The
//     region stays where it was and the next frame starts from it again. A
//     dead accelerator is not a per-frame failure and ends tracking.

use crate::core_modules::accelerator::WorkerStats;
use crate::core_modules::histogram::{HistogramKind, HistogramModel, HistogramRole};
use crate::core_modules::numeric::Numeric;
use crate::core_modules::region::TrackedRegion;
use crate::core_modules::weight_engine::{AnalysisWindow, WeightEngine, WeightField};
use crate::error::{TrackingError, TrackingResult};
use image::RgbImage;
use tracing::{debug, error, info, warn};

/// Weight fields computed per frame before the tracker gives up converging.
pub const MAX_ITERATIONS: u32 = 8;
/// Smallest window extent for which normalised coordinates are defined.
const MIN_WINDOW_EXTENT: u32 = 2;

/// The footprint of cells that vote in the centroid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskShape {
    /// Cells inside the ellipse inscribed in the window.
    #[default]
    Circular,
    /// Every cell of the window.
    Square,
}

impl MaskShape {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "circular" | "circle" => Some(MaskShape::Circular),
            "square" | "full" => Some(MaskShape::Square),
            _ => None,
        }
    }
}

/// A precomputed boolean footprint over the analysis window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceMask {
    width: usize,
    height: usize,
    cells: Vec<bool>,
}

impl ConvergenceMask {
    pub fn new(shape: MaskShape, width: usize, height: usize) -> Self {
        match shape {
            MaskShape::Circular => Self::circular(width, height),
            MaskShape::Square => Self::square(width, height),
        }
    }

    pub fn circular(width: usize, height: usize) -> Self {
        let mut cells = Vec::with_capacity(width * height);
        for row in 0..height {
            let ny = normalized(row, height);
            for col in 0..width {
                let nx = normalized(col, width);
                cells.push(nx * nx + ny * ny <= 1.0);
            }
        }
        Self {
            width,
            height,
            cells,
        }
    }

    pub fn square(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            cells: vec![true; width * height],
        }
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        row < self.height && col < self.width && self.cells[row * self.width + col]
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn count(&self) -> usize {
        self.cells.iter().filter(|&&c| c).count()
    }
}

/// Where the tracker is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Tracking { iteration: u32 },
    Converged,
}

/// The result of tracking one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackOutcome {
    pub region: TrackedRegion,
    /// Weight fields computed for this frame.
    pub iterations: u32,
    pub converged: bool,
    /// Total movement relative to the region the frame started from.
    pub displacement: (i32, i32),
    /// Movement applied by the final iteration. Zero when the frame converged.
    pub last_step: (i32, i32),
}

struct Target<N: Numeric> {
    model: HistogramModel<N>,
    region: TrackedRegion,
    mask: ConvergenceMask,
    horizontal_shift: u32,
}

/// Single-object mean-shift tracker.
pub struct MeanShiftTracker<N: Numeric> {
    engine: WeightEngine<N>,
    mask_shape: MaskShape,
    histogram: HistogramKind,
    horizontal_shift: Option<u32>,
    target: Option<Target<N>>,
    state: TrackerState,
}

impl<N: Numeric> MeanShiftTracker<N> {
    pub fn new(engine: WeightEngine<N>) -> Self {
        Self {
            engine,
            mask_shape: MaskShape::default(),
            histogram: HistogramKind::default(),
            horizontal_shift: None,
            target: None,
            state: TrackerState::Idle,
        }
    }

    pub fn with_mask(mut self, shape: MaskShape) -> Self {
        self.mask_shape = shape;
        self
    }

    pub fn with_histogram(mut self, kind: HistogramKind) -> Self {
        self.histogram = kind;
        self
    }

    /// Overrides the columns trimmed from each side of the region.
    pub fn with_horizontal_shift(mut self, shift: u32) -> Self {
        self.horizontal_shift = Some(shift);
        self
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn region(&self) -> Option<TrackedRegion> {
        self.target.as_ref().map(|t| t.region)
    }

    pub fn target_model(&self) -> Option<&HistogramModel<N>> {
        self.target.as_ref().map(|t| &t.model)
    }

    pub fn mask(&self) -> Option<&ConvergenceMask> {
        self.target.as_ref().map(|t| &t.mask)
    }

    pub fn histogram(&self) -> HistogramKind {
        self.histogram
    }

    pub fn engine(&self) -> &WeightEngine<N> {
        &self.engine
    }

    /// Builds the target model from `region` of `frame` and starts tracking
    /// from there. Replaces any previous target.
    pub fn init_target(&mut self, frame: &RgbImage, region: TrackedRegion) -> TrackingResult<()> {
        if !region.fits_within(frame.width(), frame.height()) {
            return Err(TrackingError::RegionOutOfBounds {
                region,
                frame_width: frame.width(),
                frame_height: frame.height(),
            });
        }

        let horizontal_shift = self
            .horizontal_shift
            .unwrap_or_else(|| default_horizontal_shift(&region));
        let window = AnalysisWindow::from_region(&region, horizontal_shift)?;
        if window.width < MIN_WINDOW_EXTENT || window.height < MIN_WINDOW_EXTENT {
            return Err(TrackingError::RegionTooSmall(region));
        }
        if self.engine.is_offloading() && !self.histogram.is_mirrored() {
            return Err(TrackingError::UnsupportedConfiguration(format!(
                "{:?} histograms cannot be mirrored on the accelerator",
                self.histogram
            )));
        }
        self.engine.check_capacity(&window)?;

        let (model, bins) = HistogramModel::build_as(self.histogram, frame, &region)?;
        if let Some(bins) = bins {
            self.engine.publish(HistogramRole::Model, bins)?;
        }

        let mask = ConvergenceMask::new(self.mask_shape, window.width as usize, window.height as usize);
        info!(
            %region,
            horizontal_shift,
            histogram = ?self.histogram,
            mask_cells = mask.count(),
            backend = N::NAME,
            "target model initialised"
        );
        self.target = Some(Target {
            model,
            region,
            mask,
            horizontal_shift,
        });
        self.state = TrackerState::Idle;
        Ok(())
    }

    /// Tracks the target into `frame`. On a per-frame failure the frame is
    /// dropped: the region is left where it was and the outcome reports no
    /// movement. Losing the accelerator is returned as an error.
    pub async fn track(&mut self, frame: &RgbImage) -> TrackingResult<TrackOutcome> {
        let previous = self.region().ok_or(TrackingError::TargetNotInitialised)?;
        match self.try_track(frame).await {
            Ok(outcome) => Ok(outcome),
            Err(e @ (TrackingError::ChannelClosed | TrackingError::WorkerJoin(_))) => {
                error!(region = %previous, "accelerator lost, tracking stopped: {e}");
                self.state = TrackerState::Idle;
                Err(e)
            }
            Err(e) => {
                warn!(region = %previous, "frame aborted, keeping previous region: {e}");
                self.state = TrackerState::Idle;
                Ok(TrackOutcome {
                    region: previous,
                    iterations: 0,
                    converged: false,
                    displacement: (0, 0),
                    last_step: (0, 0),
                })
            }
        }
    }

    /// Tracks the target into `frame`, propagating the first error.
    pub async fn try_track(&mut self, frame: &RgbImage) -> TrackingResult<TrackOutcome> {
        let Some(target) = self.target.as_mut() else {
            return Err(TrackingError::TargetNotInitialised);
        };
        let start = target.region;

        let (candidate, bins) = HistogramModel::build_as(self.histogram, frame, &start)?;
        if let Some(bins) = bins {
            self.engine.publish(HistogramRole::Candidate, bins)?;
        }

        let mut region = start;
        let mut iterations = 0;
        let mut converged = false;
        let mut last_step = (0, 0);
        while iterations < MAX_ITERATIONS {
            self.state = TrackerState::Tracking {
                iteration: iterations,
            };
            iterations += 1;

            let window = AnalysisWindow::from_region(&region, target.horizontal_shift)?;
            let field = self
                .engine
                .compute(frame, &window, &target.model, &candidate)
                .await?;
            let (dx, dy) = mean_shift_step(&field, &target.mask)?;
            debug!(iteration = iterations, dx, dy, %region, "mean-shift step");

            if dx == 0 && dy == 0 {
                converged = true;
                last_step = (0, 0);
                break;
            }
            let moved = region
                .translate(dx, dy)
                .clamp_within(frame.width(), frame.height())
                .ok_or(TrackingError::RegionOutOfBounds {
                    region,
                    frame_width: frame.width(),
                    frame_height: frame.height(),
                })?;
            if moved == region {
                converged = true;
                last_step = (0, 0);
                break;
            }
            last_step = (moved.x - region.x, moved.y - region.y);
            region = moved;
        }

        target.region = region;
        if converged {
            self.state = TrackerState::Converged;
        }
        Ok(TrackOutcome {
            region,
            iterations,
            converged,
            displacement: (region.x - start.x, region.y - start.y),
            last_step,
        })
    }

    /// Stops the accelerator behind the engine, if any.
    pub async fn shutdown(&mut self, processor_id: u8) -> TrackingResult<Option<WorkerStats>> {
        self.engine.shutdown(processor_id).await
    }
}

/// Trims a wide region to its centred square slice.
fn default_horizontal_shift(region: &TrackedRegion) -> u32 {
    region.width.saturating_sub(region.height) / 2
}

/// Maps `index` onto `[-1, 1]` across `extent` cells.
fn normalized(index: usize, extent: usize) -> f64 {
    if extent <= 1 {
        0.0
    } else {
        2.0 * index as f64 / (extent - 1) as f64 - 1.0
    }
}

fn half_extent(extent: usize) -> f64 {
    (extent.saturating_sub(1) / 2) as f64
}

/// The integer pixel step toward the weighted centroid of the masked cells.
fn mean_shift_step(field: &WeightField, mask: &ConvergenceMask) -> TrackingResult<(i32, i32)> {
    let (width, height) = (field.width(), field.height());
    let mut sum_x = 0.0f64;
    let mut sum_y = 0.0f64;
    let mut total = 0.0f64;

    for row in 0..height {
        let ny = normalized(row, height);
        for (col, &weight) in field.row(row).iter().enumerate() {
            if !mask.contains(row, col) {
                continue;
            }
            let weight = weight as f64;
            sum_x += weight * normalized(col, width);
            sum_y += weight * ny;
            total += weight;
        }
    }

    if !(total.is_finite() && total > 0.0) {
        return Err(TrackingError::degenerate(format!(
            "total weight under the mask is {total}"
        )));
    }
    let dx = (sum_x / total * half_extent(width)).trunc() as i32;
    let dy = (sum_y / total * half_extent(height)).trunc() as i32;
    Ok((dx, dy))
}
