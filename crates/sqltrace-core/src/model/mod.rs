//! Conversation/frame data model shared by the decoder, the TCP analysis
//! passes, and the TDS reconstructor.
//!
//! Frames and conversations live in arena vectors owned by [`NetworkTrace`];
//! cross-references are indices, so a frame is reachable from exactly one
//! conversation and passes can borrow the arenas disjointly.

mod conversation;
mod frame;
mod trace;

pub use conversation::{Conversation, SqlServer};
pub use frame::{Frame, FrameType, tcp_flags};
pub use trace::{EndpointKey, FileData, NetworkTrace};

/// Frame index into [`NetworkTrace::frames`].
pub type FrameId = usize;
/// Conversation index into [`NetworkTrace::conversations`].
pub type ConvId = usize;

/// 100 ns ticks per second, the capture timestamp unit.
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// Tunable constants of the analysis passes.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    /// Bounded look-back (same-direction frames) shared by duplicate
    /// suppression and all TCP analysis passes.
    pub lookback: usize,
    /// Idle gap after a RESET before a SYN on the same 4-tuple starts a new
    /// conversation epoch.
    pub idle_reuse_threshold: u64,
    /// Conversations with either port below this are never considered for
    /// TDS classification (well-known service traffic).
    pub sql_port_floor: u16,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            lookback: 20,
            idle_reuse_threshold: 10 * TICKS_PER_SECOND,
            sql_port_floor: 500,
        }
    }
}
