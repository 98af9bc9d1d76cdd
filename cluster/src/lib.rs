//! Consensus module for a replicated state-machine cluster.
//!
//! Replicates a totally-ordered log of client requests across a set of
//! members over a reliable log-streaming transport, elects a leader among
//! them, commits entries once a quorum has appended them, delivers the
//! committed stream to co-located services, and coordinates snapshotting,
//! recovery, dynamic membership and graceful termination.
//!
//! The entry point is [`ConsensusModuleAgent`]: a single-threaded
//! cooperative agent whose `do_work(now_ms)` is driven by a conductor and
//! performs a bounded amount of work per call.

pub mod agent;
pub mod codec;
pub mod config;
pub mod dynamic_join;
pub mod election;
pub mod error;
pub mod ingress;
pub mod log_stream;
pub mod member;
pub mod pending;
pub mod recording;
pub mod service;
pub mod session;
pub mod snapshot;
pub mod timer;

pub use agent::{ConsensusModuleAgent, ModuleState, Role, MESSAGE_LIMIT};
pub use config::{Context, ToggleState};
pub use election::{Election, ElectionState};
pub use error::ClusterError;
pub use member::ClusterMember;
pub use recording::{RecordingLog, RecoveryPlan};
pub use session::{Authenticator, ClusterSession, EventCode, SessionState};

/// Null sentinel for ids and terms.
pub const NULL_VALUE: i64 = -1;

/// Null sentinel for member ids.
pub const NULL_MEMBER_ID: i32 = -1;

/// Service id under which the module's own snapshot is recorded.
pub const MODULE_SERVICE_ID: i32 = -1;

/// Counter type id for the recovery state published to hosted services.
pub const RECOVERY_STATE_TYPE_ID: i32 = 200;
