//! Module context: recognised options, channels, counters and hooks.
//!
//! There is no file or command-line layer here; the embedding constructs a
//! `Context`, adjusts fields and hands it to the agent. Durations are
//! configured in nanoseconds and converted to the millisecond clock the
//! agent runs on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use stream::{Counter, Counters, Transport};

use crate::recording::RecordingLog;
use crate::session::{AllowAllAuthenticator, Authenticator};
use crate::NULL_MEMBER_ID;

pub const DEFAULT_SESSION_TIMEOUT_NS: i64 = 5_000_000_000;
pub const DEFAULT_LEADER_HEARTBEAT_INTERVAL_NS: i64 = 200_000_000;
pub const DEFAULT_LEADER_HEARTBEAT_TIMEOUT_NS: i64 = 10_000_000_000;
pub const DEFAULT_SERVICE_HEARTBEAT_TIMEOUT_NS: i64 = 10_000_000_000;
pub const DEFAULT_TERMINATION_TIMEOUT_NS: i64 = 5_000_000_000;
pub const DEFAULT_ELECTION_TIMEOUT_NS: i64 = 1_000_000_000;
pub const DEFAULT_ELECTION_STATUS_INTERVAL_NS: i64 = 20_000_000;
pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 10;

pub const DEFAULT_LOG_STREAM_ID: i32 = 100;
pub const DEFAULT_MEMBER_STATUS_STREAM_ID: i32 = 101;
pub const DEFAULT_INGRESS_STREAM_ID: i32 = 102;
pub const DEFAULT_REPLAY_STREAM_ID: i32 = 103;
pub const DEFAULT_CONSENSUS_MODULE_STREAM_ID: i32 = 104;
pub const DEFAULT_SERVICE_STREAM_ID: i32 = 105;
pub const DEFAULT_SNAPSHOT_STREAM_ID: i32 = 106;

/// Values of the externally-writable control-toggle counter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ToggleState {
    Neutral,
    Suspend,
    Resume,
    Snapshot,
    Shutdown,
    Abort,
}

impl ToggleState {
    pub fn code(self) -> i64 {
        match self {
            ToggleState::Neutral => 0,
            ToggleState::Suspend => 1,
            ToggleState::Resume => 2,
            ToggleState::Snapshot => 3,
            ToggleState::Shutdown => 4,
            ToggleState::Abort => 5,
        }
    }

    pub fn from_code(code: i64) -> ToggleState {
        match code {
            1 => ToggleState::Suspend,
            2 => ToggleState::Resume,
            3 => ToggleState::Snapshot,
            4 => ToggleState::Shutdown,
            5 => ToggleState::Abort,
            _ => ToggleState::Neutral,
        }
    }

    pub fn get(toggle: &Counter) -> ToggleState {
        Self::from_code(toggle.get())
    }

    pub fn reset(toggle: &Counter) {
        toggle.set_ordered(ToggleState::Neutral.code());
    }
}

/// Hook run when the module must terminate the wider process.
pub type TerminationHook = Box<dyn FnMut() + Send>;

/// Invoked on every idle iteration of a bounded wait so co-located agents
/// keep making progress while the module holds the thread.
pub type Invoker = Box<dyn FnMut() -> usize + Send>;

pub struct Context {
    pub cluster_member_id: i32,
    pub appointed_leader_id: i32,
    /// `id,client,member,log,transfer,archive|…` or empty for dynamic join.
    pub cluster_members: String,
    /// Member-facing endpoints to contact when dynamically joining.
    pub cluster_members_status_endpoints: String,
    pub cluster_members_ignore_snapshot: bool,
    /// This member's own endpoints when not listed in `cluster_members`
    /// (the dynamic-join starting point).
    pub member_endpoints: String,

    pub service_count: usize,
    pub max_concurrent_sessions: usize,

    pub session_timeout_ns: i64,
    pub leader_heartbeat_interval_ns: i64,
    pub leader_heartbeat_timeout_ns: i64,
    pub service_heartbeat_timeout_ns: i64,
    pub termination_timeout_ns: i64,
    pub election_timeout_ns: i64,
    pub election_status_interval_ns: i64,

    pub log_stream_id: i32,
    pub member_status_stream_id: i32,
    pub ingress_stream_id: i32,
    pub replay_stream_id: i32,
    pub consensus_module_stream_id: i32,
    pub service_stream_id: i32,
    pub snapshot_stream_id: i32,

    /// Endpoint for snapshot replay back into this member on recovery.
    pub replay_channel: String,
    pub snapshot_channel: String,
    pub service_control_channel: String,

    pub transport: Transport,

    /// This member's counters registry, through which co-located services
    /// discover the recovery state.
    pub counters: Counters,

    /// Index of terms and snapshots; its durable home is the archive, so the
    /// embedding owns it and hands the same instance back across restarts.
    pub recording_log: Arc<Mutex<RecordingLog>>,

    pub module_state: Counter,
    pub cluster_role: Counter,
    pub commit_position: Counter,
    pub control_toggle: Counter,
    pub snapshot_counter: Counter,
    pub error_counter: Counter,
    pub timed_out_client_counter: Counter,
    pub invalid_request_counter: Counter,
    /// Stands in for the mark-file activity timestamp.
    pub activity_timestamp: Counter,
    pub service_heartbeats: Vec<Counter>,

    pub authenticator: Box<dyn Authenticator>,
    pub termination_hook: TerminationHook,
    pub invoker: Option<Invoker>,
    interrupt_flag: Arc<AtomicBool>,
}

impl Context {
    pub fn new(transport: Transport, cluster_member_id: i32) -> Self {
        let service_count = 1;
        Self {
            cluster_member_id,
            appointed_leader_id: NULL_MEMBER_ID,
            cluster_members: String::new(),
            cluster_members_status_endpoints: String::new(),
            cluster_members_ignore_snapshot: false,
            member_endpoints: String::new(),
            service_count,
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
            session_timeout_ns: DEFAULT_SESSION_TIMEOUT_NS,
            leader_heartbeat_interval_ns: DEFAULT_LEADER_HEARTBEAT_INTERVAL_NS,
            leader_heartbeat_timeout_ns: DEFAULT_LEADER_HEARTBEAT_TIMEOUT_NS,
            service_heartbeat_timeout_ns: DEFAULT_SERVICE_HEARTBEAT_TIMEOUT_NS,
            termination_timeout_ns: DEFAULT_TERMINATION_TIMEOUT_NS,
            election_timeout_ns: DEFAULT_ELECTION_TIMEOUT_NS,
            election_status_interval_ns: DEFAULT_ELECTION_STATUS_INTERVAL_NS,
            log_stream_id: DEFAULT_LOG_STREAM_ID,
            member_status_stream_id: DEFAULT_MEMBER_STATUS_STREAM_ID,
            ingress_stream_id: DEFAULT_INGRESS_STREAM_ID,
            replay_stream_id: DEFAULT_REPLAY_STREAM_ID,
            consensus_module_stream_id: DEFAULT_CONSENSUS_MODULE_STREAM_ID,
            service_stream_id: DEFAULT_SERVICE_STREAM_ID,
            snapshot_stream_id: DEFAULT_SNAPSHOT_STREAM_ID,
            replay_channel: format!("mem:member-{}-replay", cluster_member_id),
            snapshot_channel: format!("mem:member-{}-snapshot", cluster_member_id),
            service_control_channel: format!("mem:member-{}-service", cluster_member_id),
            transport,
            counters: Counters::new(),
            recording_log: Arc::new(Mutex::new(RecordingLog::new())),
            module_state: Counter::new(0),
            cluster_role: Counter::new(0),
            commit_position: Counter::new(0),
            control_toggle: Counter::new(0),
            snapshot_counter: Counter::new(0),
            error_counter: Counter::new(0),
            timed_out_client_counter: Counter::new(0),
            invalid_request_counter: Counter::new(0),
            activity_timestamp: Counter::new(0),
            service_heartbeats: (0..service_count).map(|_| Counter::new(0)).collect(),
            authenticator: Box::new(AllowAllAuthenticator),
            termination_hook: Box::new(|| {}),
            invoker: None,
            interrupt_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Resizes the per-service heartbeat counters to `service_count`.
    pub fn service_count(mut self, service_count: usize) -> Self {
        self.service_count = service_count;
        self.service_heartbeats = (0..service_count).map(|_| Counter::new(0)).collect();
        self
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt_flag)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt_flag.load(Ordering::Acquire)
    }

    pub fn session_timeout_ms(&self) -> i64 {
        self.session_timeout_ns / 1_000_000
    }

    pub fn leader_heartbeat_interval_ms(&self) -> i64 {
        self.leader_heartbeat_interval_ns / 1_000_000
    }

    pub fn leader_heartbeat_timeout_ms(&self) -> i64 {
        self.leader_heartbeat_timeout_ns / 1_000_000
    }

    pub fn service_heartbeat_timeout_ms(&self) -> i64 {
        self.service_heartbeat_timeout_ns / 1_000_000
    }

    pub fn termination_timeout_ms(&self) -> i64 {
        self.termination_timeout_ns / 1_000_000
    }

    pub fn election_timeout_ms(&self) -> i64 {
        self.election_timeout_ns / 1_000_000
    }

    pub fn election_status_interval_ms(&self) -> i64 {
        (self.election_status_interval_ns / 1_000_000).max(1)
    }
}
