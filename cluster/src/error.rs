//! Error taxonomy of the consensus module.
//!
//! Transient transport back-pressure is deliberately not represented here:
//! soft-fail sentinels are returned by the offer-style APIs and retried on a
//! later duty cycle. Everything below is either recovered by a new election
//! or fatal to the module.

use log::error;
use stream::{ArchiveError, Counter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("recording has stopped unexpectedly: {0}")]
    RecordingStopped(i64),

    #[error("unexpected interrupt awaiting {0}")]
    Interrupted(&'static str),

    #[error(
        "invalid service ack in state {state}: service_id={service_id} \
         log_position={log_position} expected {expected_position} \
         ack_id={ack_id} expected {expected_ack_id}"
    )]
    InvalidServiceAck {
        state: &'static str,
        service_id: i32,
        log_position: i64,
        expected_position: i64,
        ack_id: i64,
        expected_ack_id: i64,
    },

    #[error("no heartbeat from service: {last_heartbeat_ms}")]
    ServiceHeartbeatLost { last_heartbeat_ms: i64 },

    #[error("no active follower quorum")]
    NoActiveQuorum,

    #[error("heartbeat timeout from leader")]
    LeaderHeartbeatTimeout,

    #[error(
        "no leader connection: log_position={log_position} \
         commit_position={commit_position} leadership_term_id={leadership_term_id}"
    )]
    NoLeaderConnection {
        log_position: i64,
        commit_position: i64,
        leadership_term_id: i64,
    },

    #[error("unexpected {origin} for term {term_id} beyond {current_term_id}")]
    UnexpectedTerm {
        origin: &'static str,
        term_id: i64,
        current_term_id: i64,
    },

    #[error("unexpected close of image when replaying log: position={0}")]
    ImageClosedInReplay(i64),

    #[error("member not found: {0}")]
    MemberNotFound(i32),

    #[error("invalid cluster members string: {0}")]
    InvalidMemberString(String),

    #[error("leadership term not found: {0}")]
    UnknownTerm(i64),

    #[error("recording log entry out of order: {0}")]
    RecordingLogOrder(String),

    #[error("snapshot ended unexpectedly: {0}")]
    SnapshotLoad(String),
}

/// Routes errors through the module error counter before logging them, so
/// external monitoring sees every failure the module absorbed.
pub struct CountedErrorHandler {
    counter: Counter,
}

impl CountedErrorHandler {
    pub fn new(counter: Counter) -> Self {
        Self { counter }
    }

    pub fn on_error(&self, err: &ClusterError) {
        self.counter.increment_ordered();
        error!("{}", err);
    }

    pub fn error_count(&self) -> i64 {
        self.counter.get()
    }
}
