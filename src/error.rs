//! Error types for tracking and offload operations.

use crate::core_modules::region::TrackedRegion;
use crate::core_modules::shared_buffer::BufferView;
use thiserror::Error;

/// Result type for tracking operations.
pub type TrackingResult<T> = Result<T, TrackingError>;

/// Errors that can occur while building models, computing weights, or
/// exchanging data with the accelerator.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("shared buffer exhausted: {requested} bytes requested, {capacity} available")]
    ResourceExhaustion { requested: usize, capacity: usize },

    #[error("invalid shared buffer size: {0}")]
    InvalidBufferSize(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("arithmetic degeneracy: {0}")]
    ArithmeticDegeneracy(String),

    #[error("shared buffer is in the {actual:?} view, {expected:?} was required")]
    WrongBufferView {
        expected: BufferView,
        actual: BufferView,
    },

    #[error("region {region} does not fit in a {frame_width}x{frame_height} frame")]
    RegionOutOfBounds {
        region: TrackedRegion,
        frame_width: u32,
        frame_height: u32,
    },

    #[error("region {0} is too small to track")]
    RegionTooSmall(TrackedRegion),

    #[error("bin index {0} is out of range")]
    BinOutOfRange(u8),

    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("target model has not been initialised")]
    TargetNotInitialised,

    #[error("accelerator channel closed")]
    ChannelClosed,

    #[error("accelerator worker failed: {0}")]
    WorkerJoin(#[from] tokio::task::JoinError),
}

impl TrackingError {
    /// Create a protocol violation error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    /// Create an arithmetic degeneracy error.
    pub fn degenerate(message: impl Into<String>) -> Self {
        Self::ArithmeticDegeneracy(message.into())
    }

    /// Create a buffer exhaustion error.
    pub fn exhausted(requested: usize, capacity: usize) -> Self {
        Self::ResourceExhaustion {
            requested,
            capacity,
        }
    }
}
