// THEORY:
// The shared buffer is the only mutable state both compute domains can see.
// It is one fixed-capacity arena of 32-bit cells that is read two ways:
// as unsigned samples while the host is handing pixel data over, and as
// floats while the accelerator is handing ratios back. Only one reading is
// valid at a time, so the arena carries an explicit `BufferView` flag that the
// protocol flips, and every accessor checks it.
//
// There are no locks. The ping-pong protocol guarantees that only one side
// touches the arena between two notifications. What remains is visibility:
// the writer calls `flush` (release) before it signals, the reader calls
// `invalidate` (acquire) after it is woken. On hardware without coherent
// caches these are the write-back and invalidate points.

use crate::error::{TrackingError, TrackingResult};
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering, fence};

/// Which interpretation of the arena is currently valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferView {
    /// Host-written unsigned pixel samples.
    Samples,
    /// Accelerator-written floating-point ratios.
    Ratios,
}

impl BufferView {
    fn to_tag(self) -> u8 {
        match self {
            BufferView::Samples => 0,
            BufferView::Ratios => 1,
        }
    }

    fn from_tag(tag: u8) -> Self {
        if tag == 0 {
            BufferView::Samples
        } else {
            BufferView::Ratios
        }
    }
}

pub struct SharedBuffer {
    cells: Box<[AtomicU32]>,
    view: AtomicU8,
    valid_bytes: AtomicUsize,
}

impl SharedBuffer {
    pub const ELEMENT_BYTES: usize = 4;

    /// Allocates an arena of `capacity_bytes`, which must be a positive
    /// multiple of the element size.
    pub fn allocate(capacity_bytes: usize) -> TrackingResult<Self> {
        if capacity_bytes == 0 || capacity_bytes % Self::ELEMENT_BYTES != 0 {
            return Err(TrackingError::InvalidBufferSize(format!(
                "{capacity_bytes} bytes is not a positive multiple of {}",
                Self::ELEMENT_BYTES
            )));
        }
        let elements = capacity_bytes / Self::ELEMENT_BYTES;
        let mut cells = Vec::new();
        cells
            .try_reserve_exact(elements)
            .map_err(|_| TrackingError::exhausted(capacity_bytes, 0))?;
        cells.extend((0..elements).map(|_| AtomicU32::new(0)));
        Ok(Self {
            cells: cells.into_boxed_slice(),
            view: AtomicU8::new(BufferView::Samples.to_tag()),
            valid_bytes: AtomicUsize::new(0),
        })
    }

    /// Allocates from a decimal size string such as `"65536"`.
    pub fn from_size_str(size: &str) -> TrackingResult<Self> {
        let capacity_bytes = size
            .trim()
            .parse::<usize>()
            .map_err(|e| TrackingError::InvalidBufferSize(format!("{size:?}: {e}")))?;
        Self::allocate(capacity_bytes)
    }

    pub fn capacity_bytes(&self) -> usize {
        self.cells.len() * Self::ELEMENT_BYTES
    }

    pub fn capacity_elements(&self) -> usize {
        self.cells.len()
    }

    pub fn view(&self) -> BufferView {
        BufferView::from_tag(self.view.load(Ordering::Acquire))
    }

    /// Switches the valid interpretation. Only the side that currently owns
    /// the arena under the protocol may call this.
    pub fn switch_view(&self, view: BufferView) {
        self.view.store(view.to_tag(), Ordering::Release);
    }

    pub fn write_samples(&self, offset: usize, samples: &[u32]) -> TrackingResult<()> {
        self.expect_view(BufferView::Samples)?;
        let cells = self.span(offset, samples.len())?;
        for (cell, &sample) in cells.iter().zip(samples) {
            cell.store(sample, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn read_samples(&self, offset: usize, out: &mut [u32]) -> TrackingResult<()> {
        self.expect_view(BufferView::Samples)?;
        let cells = self.span(offset, out.len())?;
        for (slot, cell) in out.iter_mut().zip(cells) {
            *slot = cell.load(Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn write_ratios(&self, offset: usize, ratios: &[f32]) -> TrackingResult<()> {
        self.expect_view(BufferView::Ratios)?;
        let cells = self.span(offset, ratios.len())?;
        for (cell, &ratio) in cells.iter().zip(ratios) {
            cell.store(ratio.to_bits(), Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn read_ratios(&self, offset: usize, out: &mut [f32]) -> TrackingResult<()> {
        self.expect_view(BufferView::Ratios)?;
        let cells = self.span(offset, out.len())?;
        for (slot, cell) in out.iter_mut().zip(cells) {
            *slot = f32::from_bits(cell.load(Ordering::Relaxed));
        }
        Ok(())
    }

    /// Publishes the first `byte_count` bytes to the other domain.
    pub fn flush(&self, byte_count: usize) -> TrackingResult<()> {
        if byte_count > self.capacity_bytes() {
            return Err(TrackingError::exhausted(byte_count, self.capacity_bytes()));
        }
        fence(Ordering::Release);
        self.valid_bytes.store(byte_count, Ordering::Release);
        Ok(())
    }

    /// Makes the other domain's last flush visible and returns how many bytes
    /// it published.
    pub fn invalidate(&self) -> usize {
        let valid = self.valid_bytes.load(Ordering::Acquire);
        fence(Ordering::Acquire);
        valid
    }

    fn expect_view(&self, expected: BufferView) -> TrackingResult<()> {
        let actual = self.view();
        if actual == expected {
            Ok(())
        } else {
            Err(TrackingError::WrongBufferView { expected, actual })
        }
    }

    fn span(&self, offset: usize, len: usize) -> TrackingResult<&[AtomicU32]> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.cells.len())
            .ok_or_else(|| {
                TrackingError::exhausted(
                    offset.saturating_add(len).saturating_mul(Self::ELEMENT_BYTES),
                    self.capacity_bytes(),
                )
            })?;
        Ok(&self.cells[offset..end])
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("capacity_bytes", &self.capacity_bytes())
            .field("view", &self.view())
            .field("valid_bytes", &self.valid_bytes.load(Ordering::Relaxed))
            .finish()
    }
}
