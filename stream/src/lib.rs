//! In-process reliable ordered log-streaming transport with an archive
//! service and shared counters.
//!
//! Publications `offer` framed payloads which are routed, in order, to every
//! subscription listening on the destination endpoint and stream id. Stream
//! positions are byte offsets advancing by the frame-aligned length of each
//! payload, so positions are comparable across members and across replay of
//! archived recordings.

pub mod archive;
pub mod channel;
pub mod conductor;
pub mod counter;
pub mod transport;

pub use archive::{Archive, ArchiveError, RecordingExtent, SourceLocation};
pub use channel::ChannelUri;
pub use conductor::{Agent, BackoffIdle, Conductor, IdleStrategy};
pub use counter::{Counter, Counters};
pub use transport::{Action, Publication, Subscription, Transport};

/// Frames are aligned to this boundary; stream positions advance by
/// [`aligned_frame_length`] per payload.
pub const FRAME_ALIGNMENT: usize = 32;

/// Fixed per-frame header contribution to the stream position.
pub const FRAME_HEADER_LENGTH: usize = 32;

/// Sentinel returned by [`Publication::offer`] when a receiver queue is full.
/// The caller must retry the same payload on a later duty cycle.
pub const BACK_PRESSURE: i64 = -2;

/// Sentinel returned by [`Publication::offer`] when no subscriber is
/// reachable for any destination.
pub const NOT_CONNECTED: i64 = -3;

/// Null sentinel for positions and recording ids.
pub const NULL_POSITION: i64 = -1;

/// Null sentinel for transport session ids.
pub const NULL_SESSION_ID: i32 = -1;

/// Length a payload occupies in a stream once framed and aligned.
pub const fn aligned_frame_length(payload_length: usize) -> usize {
    (FRAME_HEADER_LENGTH + payload_length + (FRAME_ALIGNMENT - 1)) & !(FRAME_ALIGNMENT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_lengths_are_aligned() {
        assert_eq!(aligned_frame_length(0), 32);
        assert_eq!(aligned_frame_length(1), 64);
        assert_eq!(aligned_frame_length(32), 64);
        assert_eq!(aligned_frame_length(33), 96);
    }
}
