// THEORY:
// The `WeightEngine` is the host half of the weight computation. For every
// pixel of the analysis window it folds the three per-plane ratios
// `model[bin] / candidate[bin]` into a single weight, then compresses the
// result with a square root.
//
// Key architectural principles:
// 1.  **Row split**: the last `accelerator_rows` rows of the window go to the
//     accelerator; the rest are computed inline. The split is per plane: the
//     host packs the plane's samples into the shared buffer, signals, computes
//     its own rows while the accelerator works, then waits and folds the
//     returned floats in.
// 2.  **Same answer either way**: both sides read the same 16-entry ratio
//     table (same backend, same histograms) and the fold order is fixed,
//     plane 0 then 1 then 2, so moving rows across the split cannot change
//     a single bit of the result.
// 3.  **Batched arithmetic**: rows are padded to a multiple of four lanes and
//     processed four cells at a time. Padding cells keep the neutral weight.
// 4.  **Degeneracy up front**: the ratio table is computed before any
//     exchange is opened, so a zero divisor is reported without leaving the
//     accelerator mid-handshake.

use crate::core_modules::accelerator::{AcceleratorSession, WorkerStats};
use crate::core_modules::histogram::{
    BIN_COUNT, BinTriple, HistogramModel, HistogramRole, PLANES, quantize,
};
use crate::core_modules::notification::{Notification, Reply};
use crate::core_modules::numeric::Numeric;
use crate::core_modules::region::TrackedRegion;
use crate::core_modules::shared_buffer::{BufferView, SharedBuffer};
use crate::core_modules::transfer::HostEndpoint;
use crate::error::{TrackingError, TrackingResult};
use image::RgbImage;
use std::marker::PhantomData;
use std::ops::Range;
use tracing::trace;

/// Cells processed per batch.
pub const LANES: usize = 4;
/// The weight of a cell before any plane has been folded in.
pub const NEUTRAL_WEIGHT: f32 = 1.0;

const CHANNELS: usize = 3;

/// The frame-coordinate rectangle the weight field covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisWindow {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl AnalysisWindow {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The slice of `region` left after trimming `horizontal_shift` columns
    /// from each side.
    pub fn from_region(region: &TrackedRegion, horizontal_shift: u32) -> TrackingResult<Self> {
        let trimmed = horizontal_shift
            .checked_mul(2)
            .filter(|&t| t < region.width)
            .ok_or(TrackingError::RegionTooSmall(*region))?;
        if region.x < 0 || region.y < 0 {
            return Err(TrackingError::RegionTooSmall(*region));
        }
        Ok(Self {
            x: region.x as u32 + horizontal_shift,
            y: region.y as u32,
            width: region.width - trimmed,
            height: region.height,
        })
    }

    pub fn fits_within(&self, frame: &RgbImage) -> bool {
        self.x as u64 + self.width as u64 <= frame.width() as u64
            && self.y as u64 + self.height as u64 <= frame.height() as u64
    }

    fn as_region(&self) -> TrackedRegion {
        TrackedRegion::new(self.x as i32, self.y as i32, self.width, self.height)
    }
}

/// Per-pixel weights over an analysis window, rows padded to whole lanes.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightField {
    width: usize,
    height: usize,
    stride: usize,
    weights: Vec<f32>,
}

impl WeightField {
    pub fn neutral(width: usize, height: usize) -> Self {
        let stride = width.div_ceil(LANES) * LANES;
        Self {
            width,
            height,
            stride,
            weights: vec![NEUTRAL_WEIGHT; stride * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.weights[row * self.stride + col]
    }

    /// The window cells of `row`, without padding.
    pub fn row(&self, row: usize) -> &[f32] {
        let start = row * self.stride;
        &self.weights[start..start + self.width]
    }

    /// Every cell including padding.
    pub fn cells(&self) -> &[f32] {
        &self.weights
    }

    fn padded_row_mut(&mut self, row: usize) -> &mut [f32] {
        let start = row * self.stride;
        &mut self.weights[start..start + self.stride]
    }

    fn smooth(&mut self) {
        for weight in self.weights.chunks_exact_mut(LANES).flatten() {
            *weight = weight.sqrt();
        }
    }
}

/// Computes weight fields, optionally offloading rows to an accelerator.
pub struct WeightEngine<N: Numeric> {
    accelerator_rows: usize,
    session: Option<AcceleratorSession>,
    readback: Vec<f32>,
    staging: Vec<u32>,
    backend: PhantomData<N>,
}

impl<N: Numeric> WeightEngine<N> {
    /// An engine that computes every row on the host.
    pub fn host_only() -> Self {
        Self {
            accelerator_rows: 0,
            session: None,
            readback: Vec::new(),
            staging: Vec::new(),
            backend: PhantomData,
        }
    }

    /// An engine that hands the last `accelerator_rows` rows of each window
    /// to `session`.
    pub fn with_accelerator(session: AcceleratorSession, accelerator_rows: usize) -> Self {
        Self {
            accelerator_rows,
            session: Some(session),
            ..Self::host_only()
        }
    }

    pub fn is_offloading(&self) -> bool {
        self.session.is_some() && self.accelerator_rows > 0
    }

    /// How many rows of a window of `window_height` the accelerator computes.
    pub fn offloaded_rows(&self, window_height: usize) -> usize {
        if self.session.is_some() {
            self.accelerator_rows.min(window_height)
        } else {
            0
        }
    }

    /// Fails when the offloaded rows of `window` cannot fit in the shared
    /// buffer.
    pub fn check_capacity(&mut self, window: &AnalysisWindow) -> TrackingResult<()> {
        let rows = self.offloaded_rows(window.height as usize);
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let required = rows * window.width as usize * SharedBuffer::ELEMENT_BYTES;
        let capacity = session.host().raw_buffer().capacity_bytes();
        if required > capacity {
            return Err(TrackingError::exhausted(required, capacity));
        }
        Ok(())
    }

    /// Mirrors a histogram change on the accelerator, if one is attached.
    pub fn publish(&mut self, role: HistogramRole, bins: BinTriple) -> TrackingResult<()> {
        match self.session.as_mut() {
            Some(session) => session.host().send(Notification::index_update(role, bins)),
            None => Ok(()),
        }
    }

    pub async fn compute(
        &mut self,
        frame: &RgbImage,
        window: &AnalysisWindow,
        model: &HistogramModel<N>,
        candidate: &HistogramModel<N>,
    ) -> TrackingResult<WeightField> {
        if !window.fits_within(frame) {
            return Err(TrackingError::RegionOutOfBounds {
                region: window.as_region(),
                frame_width: frame.width(),
                frame_height: frame.height(),
            });
        }

        let height = window.height as usize;
        let offloaded = self.offloaded_rows(height);
        let host_rows = 0..height - offloaded;
        let accelerator_rows = host_rows.end..height;
        let mut field = WeightField::neutral(window.width as usize, height);

        for plane in 0..PLANES {
            let table = model.ratio_table(candidate, plane)?;

            let exchange = match self.session.as_mut() {
                Some(session) if offloaded > 0 => {
                    let host = session.host();
                    Self::hand_over(host, &mut self.staging, frame, window, plane, &accelerator_rows)?;
                    Some(host)
                }
                _ => None,
            };

            fold_host_rows(frame, window, plane, &table, &mut field, host_rows.clone());

            if let Some(host) = exchange {
                Self::collect(host, &mut self.readback, plane, &accelerator_rows, &mut field).await?;
            }
        }

        field.smooth();
        Ok(field)
    }

    #[cfg(test)]
    pub(crate) fn session_mut(&mut self) -> Option<&mut AcceleratorSession> {
        self.session.as_mut()
    }

    /// Stops the attached accelerator, if any.
    pub async fn shutdown(&mut self, processor_id: u8) -> TrackingResult<Option<WorkerStats>> {
        match self.session.take() {
            Some(session) => Ok(Some(session.stop(processor_id).await?)),
            None => Ok(None),
        }
    }

    /// Packs the raw samples of `rows` for `plane`, flushes them and signals
    /// the accelerator.
    fn hand_over(
        host: &mut HostEndpoint,
        staging: &mut Vec<u32>,
        frame: &RgbImage,
        window: &AnalysisWindow,
        plane: usize,
        rows: &Range<usize>,
    ) -> TrackingResult<()> {
        let width = window.width as usize;
        staging.clear();
        for row in rows.clone() {
            let pixels = window_row(frame, window, row);
            staging.extend(pixels.chunks_exact(CHANNELS).take(width).map(|px| px[plane] as u32));
        }

        let buffer = host.raw_buffer();
        buffer.switch_view(BufferView::Samples);
        buffer.write_samples(0, staging)?;
        host.write_buffer(staging.len() * SharedBuffer::ELEMENT_BYTES)?;
        host.send(Notification::PlaneReady(plane as u8))?;
        trace!(plane, samples = staging.len(), "plane handed to accelerator");
        Ok(())
    }

    /// Waits for the accelerator's acknowledgement and folds its ratios into
    /// `rows` of the field.
    async fn collect(
        host: &mut HostEndpoint,
        readback: &mut Vec<f32>,
        plane: usize,
        rows: &Range<usize>,
        field: &mut WeightField,
    ) -> TrackingResult<()> {
        let reply = host.wait_receive().await?;
        debug_assert_eq!(reply, Reply::PlaneDone(plane as u8));

        let width = field.width();
        let expected = rows.len() * width;
        let buffer = host.raw_buffer();
        let valid = buffer.invalidate() / SharedBuffer::ELEMENT_BYTES;
        if valid != expected {
            return Err(TrackingError::protocol(format!(
                "accelerator returned {valid} ratios for plane {plane}, expected {expected}"
            )));
        }
        readback.resize(expected, 0.0);
        buffer.read_ratios(0, readback)?;

        for (row, ratios) in rows.clone().zip(readback.chunks_exact(width.max(1))) {
            let weights = &mut field.padded_row_mut(row)[..width];
            for (weight, ratio) in weights.iter_mut().zip(ratios) {
                *weight *= ratio;
            }
        }
        Ok(())
    }
}

/// Interleaved pixel bytes of one window row.
fn window_row<'a>(frame: &'a RgbImage, window: &AnalysisWindow, row: usize) -> &'a [u8] {
    let frame_width = frame.width() as usize;
    let start = ((window.y as usize + row) * frame_width + window.x as usize) * CHANNELS;
    &frame.as_raw()[start..start + window.width as usize * CHANNELS]
}

/// Multiplies `plane`'s ratios into the host rows, one batch of lanes at a time.
fn fold_host_rows(
    frame: &RgbImage,
    window: &AnalysisWindow,
    plane: usize,
    table: &[f32; BIN_COUNT],
    field: &mut WeightField,
    rows: Range<usize>,
) {
    let width = field.width();
    for row in rows {
        let pixels = window_row(frame, window, row);
        let weights = field.padded_row_mut(row);
        for (batch, lanes) in weights.chunks_exact_mut(LANES).enumerate() {
            let mut ratios = [NEUTRAL_WEIGHT; LANES];
            for (lane, ratio) in ratios.iter_mut().enumerate() {
                let col = batch * LANES + lane;
                if col < width {
                    *ratio = table[quantize(pixels[col * CHANNELS + plane]) as usize];
                }
            }
            for (weight, ratio) in lanes.iter_mut().zip(ratios) {
                *weight *= ratio;
            }
        }
    }
}
