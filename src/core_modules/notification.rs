// THEORY:
// The notification payload is the only protocol surface between the host and
// the accelerator, and it is a single 32-bit word. The top nibble selects the
// message kind; the low bytes carry either three bin indices (one per plane)
// or a two-bit plane id. The layout has to stay bit-exact: the accelerator
// side may be reimplemented independently and only this word is shared.
//
// Decoding tests the kind bits in a fixed order (model, candidate, plane) and
// treats a word with none of them set as the termination request. The host
// reads the accelerator's replies through `Reply`, because the same bits mean
// something different in that direction: `0` is the readiness signal, not a
// termination.

use crate::core_modules::histogram::{BinTriple, HistogramRole, PLANES};
use crate::error::{TrackingError, TrackingResult};

pub const NOTIF_PDF_MODEL: u32 = 0x1000_0000;
pub const NOTIF_PDF_CANDIDATE: u32 = 0x2000_0000;
pub const NOTIF_BGR_PLANE: u32 = 0x4000_0000;
pub const PLANE_MASK: u32 = 0x0000_0003;
/// Canonical termination word. Any word without a kind bit terminates.
pub const NOTIF_TERMINATE: u32 = 0;
/// Sent once by the accelerator after it has finished its own setup.
pub const NOTIF_READY: u32 = 0;

/// A host-to-accelerator message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    ModelIndexUpdate(BinTriple),
    CandidateIndexUpdate(BinTriple),
    /// The shared buffer holds samples of this plane. Valid ids are `0..3`;
    /// the wire format can also express `3`, which the worker rejects.
    PlaneReady(u8),
    Terminate,
}

impl Notification {
    pub fn index_update(role: HistogramRole, bins: BinTriple) -> Self {
        match role {
            HistogramRole::Model => Notification::ModelIndexUpdate(bins),
            HistogramRole::Candidate => Notification::CandidateIndexUpdate(bins),
        }
    }

    pub fn encode(self) -> u32 {
        match self {
            Notification::ModelIndexUpdate(bins) => NOTIF_PDF_MODEL | pack_bins(bins),
            Notification::CandidateIndexUpdate(bins) => NOTIF_PDF_CANDIDATE | pack_bins(bins),
            Notification::PlaneReady(plane) => NOTIF_BGR_PLANE | (plane as u32 & PLANE_MASK),
            Notification::Terminate => NOTIF_TERMINATE,
        }
    }

    /// Decodes a raw word. Index updates whose bytes do not address a bin
    /// are reported as `BinOutOfRange`.
    pub fn decode(raw: u32) -> TrackingResult<Self> {
        if raw & NOTIF_PDF_MODEL != 0 {
            Ok(Notification::ModelIndexUpdate(unpack_bins(raw)?))
        } else if raw & NOTIF_PDF_CANDIDATE != 0 {
            Ok(Notification::CandidateIndexUpdate(unpack_bins(raw)?))
        } else if raw & NOTIF_BGR_PLANE != 0 {
            Ok(Notification::PlaneReady((raw & PLANE_MASK) as u8))
        } else {
            Ok(Notification::Terminate)
        }
    }
}

/// An accelerator-to-host message, as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ready,
    PlaneDone(u8),
}

impl Reply {
    pub fn encode(self) -> u32 {
        match self {
            Reply::Ready => NOTIF_READY,
            Reply::PlaneDone(plane) => Notification::PlaneReady(plane).encode(),
        }
    }

    pub fn decode(raw: u32) -> TrackingResult<Self> {
        if raw == NOTIF_READY {
            Ok(Reply::Ready)
        } else if raw & NOTIF_BGR_PLANE != 0 && raw & !(NOTIF_BGR_PLANE | PLANE_MASK) == 0 {
            Ok(Reply::PlaneDone((raw & PLANE_MASK) as u8))
        } else {
            Err(TrackingError::protocol(format!(
                "unexpected reply payload {raw:#010x}"
            )))
        }
    }
}

fn pack_bins(bins: BinTriple) -> u32 {
    let [b0, b1, b2] = bins.bins();
    b0 as u32 | (b1 as u32) << 8 | (b2 as u32) << 16
}

fn unpack_bins(raw: u32) -> TrackingResult<BinTriple> {
    let mut bins = [0u8; PLANES];
    for (plane, slot) in bins.iter_mut().enumerate() {
        *slot = (raw >> (8 * plane)) as u8;
    }
    BinTriple::new(bins)
}
