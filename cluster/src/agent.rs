//! The consensus module agent.
//!
//! A single cooperative agent driven by a conductor calling `do_work(now)`.
//! Each tick performs slow-tick housekeeping when the millisecond clock
//! moves, polls peer and service control, then advances exactly one of the
//! three modes: dynamic join, election, or normal consensus.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::MutexGuard;

use bytes::Bytes;
use log::{debug, info, warn};
use stream::{
    Action, Archive, ChannelUri, Counter, Publication, SourceLocation, Subscription,
    NULL_POSITION,
};

use crate::codec::client::IngressRequest;
use crate::codec::log::{ChangeType, ClusterAction, LogRecord};
use crate::codec::peer::PeerMessage;
use crate::codec::service::FromServiceMessage;
use crate::codec::snapshot::SnapshotRecord;
use crate::config::{Context, ToggleState};
use crate::dynamic_join::DynamicJoin;
use crate::election::Election;
use crate::error::{ClusterError, CountedErrorHandler};
use crate::ingress::{EgressPublisher, IngressAdapter, SessionProxy};
use crate::log_stream::{LogAdapter, LogPublisher};
use crate::member::{add_status_publications, ClusterMember};
use crate::pending::PendingServiceMessages;
use crate::recording::{RecordingLog, RecoveryPlan, Snapshot};
use crate::service::{ServiceAck, ServiceAdapter, ServiceProxy};
use crate::session::{
    semantic_version_major, CloseReason, ClusterSession, EventCode, SessionState,
    PROTOCOL_MAJOR_VERSION, SESSION_INVALID_VERSION_DETAIL, SESSION_LIMIT_DETAIL,
    SESSION_TERMINATED_DETAIL, SESSION_TIMEOUT_DETAIL,
};
use crate::snapshot::{SnapshotLoader, SnapshotTaker};
use crate::timer::TimerService;
use crate::{MODULE_SERVICE_ID, NULL_MEMBER_ID, NULL_VALUE, RECOVERY_STATE_TYPE_ID};

/// Bound on messages drained from any one source per duty cycle.
pub const MESSAGE_LIMIT: usize = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModuleState {
    Init,
    Active,
    Suspended,
    Snapshot,
    Leaving,
    Terminating,
    Closed,
}

impl ModuleState {
    pub fn code(self) -> i64 {
        match self {
            ModuleState::Init => 0,
            ModuleState::Active => 1,
            ModuleState::Suspended => 2,
            ModuleState::Snapshot => 3,
            ModuleState::Leaving => 4,
            ModuleState::Terminating => 5,
            ModuleState::Closed => 6,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn code(self) -> i64 {
        match self {
            Role::Follower => 0,
            Role::Candidate => 1,
            Role::Leader => 2,
        }
    }
}

/// Tracks the shutdown handshake the leader runs across the cluster.
struct ClusterTermination {
    deadline_ms: i64,
    has_service_terminated: bool,
}

impl ClusterTermination {
    fn new(deadline_ms: i64) -> Self {
        Self {
            deadline_ms,
            has_service_terminated: false,
        }
    }

    fn can_terminate(&self, members: &[ClusterMember], leader_id: i32, now_ms: i64) -> bool {
        if now_ms >= self.deadline_ms {
            return true;
        }
        self.has_service_terminated
            && members
                .iter()
                .filter(|member| member.id != leader_id)
                .all(|member| member.has_sent_termination_ack)
    }
}

pub struct ConsensusModuleAgent {
    pub ctx: Context,
    pub(crate) archive: Archive,

    pub(crate) member_id: i32,
    high_member_id: i32,
    this_member: ClusterMember,
    pub(crate) cluster_members: Vec<ClusterMember>,
    passive_members: Vec<ClusterMember>,
    leader_member_id: i32,
    client_facing_endpoints: String,

    state: ModuleState,
    role: Role,
    pub(crate) leadership_term_id: i64,
    next_session_id: i64,
    next_service_session_id: i64,
    log_service_session_id: i64,
    expected_ack_position: i64,
    service_ack_id: i64,
    service_acks: Vec<ServiceAck>,
    last_appended_position: i64,
    pub(crate) follower_commit_position: i64,
    termination_position: i64,
    time_of_last_log_update_ms: i64,
    time_of_last_append_position_ms: i64,
    pub(crate) cached_time_ms: i64,
    cluster_time_ms: i64,
    pending_member_removals: usize,

    appended_position: Option<Counter>,
    commit_position: Counter,

    timers: TimerService,
    expired_timer_counts: HashMap<i64, i64>,
    sessions: BTreeMap<i64, ClusterSession>,
    pending_sessions: Vec<ClusterSession>,
    rejected_sessions: Vec<ClusterSession>,
    redirect_sessions: Vec<ClusterSession>,
    pending_service_messages: PendingServiceMessages,

    member_status_subscription: Subscription,
    service_proxy: ServiceProxy,
    service_adapter: ServiceAdapter,
    ingress_adapter: IngressAdapter,
    egress: EgressPublisher,
    log_publisher: LogPublisher,
    log_adapter: Option<LogAdapter>,
    log_recording_channel: Option<String>,
    log_recording_id: i64,

    pub(crate) recovery_plan: RecoveryPlan,
    dynamic_join_snapshots: Vec<Snapshot>,
    election: Option<Election>,
    dynamic_join: Option<DynamicJoin>,
    cluster_termination: Option<ClusterTermination>,
    error_handler: CountedErrorHandler,
}

impl ConsensusModuleAgent {
    pub fn new(ctx: Context) -> Result<Self, ClusterError> {
        let archive = Archive::connect(&ctx.transport);
        let mut cluster_members = ClusterMember::parse(&ctx.cluster_members)?;

        let this_member = match ClusterMember::find(&cluster_members, ctx.cluster_member_id) {
            Some(member) => ClusterMember::parse_endpoints(member.id, &member.encode_endpoints())?,
            None => ClusterMember::parse_endpoints(ctx.cluster_member_id, &ctx.member_endpoints)?,
        };

        let member_status_subscription = ctx.transport.add_subscription(
            &format!("mem:{}", this_member.member_facing_endpoint),
            ctx.member_status_stream_id,
        );
        add_status_publications(
            &mut cluster_members,
            this_member.id,
            &ctx.transport,
            ctx.member_status_stream_id,
        );

        let service_proxy = ServiceProxy::new(
            ctx.transport
                .add_publication(&ctx.service_control_channel, ctx.service_stream_id),
        );
        let service_adapter = ServiceAdapter::new(
            ctx.transport
                .add_subscription(&ctx.service_control_channel, ctx.consensus_module_stream_id),
        );

        let high_member_id = ClusterMember::high_member_id(&cluster_members);
        let service_acks = ServiceAck::new_array(ctx.service_count);
        let ingress_adapter = IngressAdapter::new(ctx.invalid_request_counter.clone());
        let error_handler = CountedErrorHandler::new(ctx.error_counter.clone());
        let commit_position = ctx.commit_position.clone();
        let member_id = this_member.id;

        ctx.cluster_role.set_ordered(Role::Follower.code());
        ctx.module_state.set_ordered(ModuleState::Init.code());

        Ok(Self {
            ctx,
            archive,
            member_id,
            high_member_id,
            this_member,
            cluster_members,
            passive_members: Vec::new(),
            leader_member_id: NULL_MEMBER_ID,
            client_facing_endpoints: String::new(),
            state: ModuleState::Init,
            role: Role::Follower,
            leadership_term_id: NULL_VALUE,
            next_session_id: 1,
            next_service_session_id: i64::MIN,
            log_service_session_id: i64::MIN,
            expected_ack_position: 0,
            service_ack_id: 0,
            service_acks,
            last_appended_position: 0,
            follower_commit_position: 0,
            termination_position: NULL_POSITION,
            time_of_last_log_update_ms: 0,
            time_of_last_append_position_ms: 0,
            cached_time_ms: 0,
            cluster_time_ms: NULL_VALUE,
            pending_member_removals: 0,
            appended_position: None,
            commit_position,
            timers: TimerService::new(),
            expired_timer_counts: HashMap::new(),
            sessions: BTreeMap::new(),
            pending_sessions: Vec::new(),
            rejected_sessions: Vec::new(),
            redirect_sessions: Vec::new(),
            pending_service_messages: PendingServiceMessages::new(),
            member_status_subscription,
            service_proxy,
            service_adapter,
            ingress_adapter,
            egress: EgressPublisher,
            log_publisher: LogPublisher::new(),
            log_adapter: None,
            log_recording_channel: None,
            log_recording_id: NULL_VALUE,
            recovery_plan: RecoveryPlan::default(),
            dynamic_join_snapshots: Vec::new(),
            election: None,
            dynamic_join: None,
            cluster_termination: None,
            error_handler,
        })
    }

    //
    // Observers for the embedding.
    //

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn member_id(&self) -> i32 {
        self.member_id
    }

    pub fn leadership_term_id(&self) -> i64 {
        self.leadership_term_id
    }

    pub fn leader_member_id(&self) -> i32 {
        self.leader_member_id
    }

    pub fn commit_position_value(&self) -> i64 {
        self.commit_position.get()
    }

    pub fn cluster_time_ms(&self) -> i64 {
        self.cluster_time_ms
    }

    pub fn open_session_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|session| session.state() == SessionState::Open)
            .count()
    }

    pub fn active_member_count(&self) -> usize {
        self.cluster_members.len()
    }

    pub fn in_election(&self) -> bool {
        self.election.is_some()
    }

    //
    // Lifecycle.
    //

    /// Boot: dynamic join when no members are configured, otherwise build
    /// the recovery plan, restore the latest snapshot, wait for service
    /// acknowledgements and enter the startup election.
    pub fn on_start(&mut self, now_ms: i64) -> Result<(), ClusterError> {
        self.cached_time_ms = now_ms;
        self.time_of_last_log_update_ms = now_ms;
        self.time_of_last_append_position_ms = now_ms;

        if self.cluster_members.is_empty()
            && !self.ctx.cluster_members_status_endpoints.is_empty()
        {
            info!("member starting dynamic join");
            self.dynamic_join = Some(DynamicJoin::new(
                &self.ctx.cluster_members_status_endpoints.clone(),
            ));
            return Ok(());
        }

        let recovery_plan = self
            .recording_log()
            .create_recovery_plan(&self.archive, self.ctx.service_count);
        self.recovery_plan = recovery_plan;
        let recovery_counter = self.add_recovery_state_counter();

        if let Some(snapshot) = self.recovery_plan.snapshots.first().cloned() {
            self.recover_from_snapshot(&snapshot)?;
        }
        let expected = self.expected_ack_position;
        self.await_service_acks(expected)?;
        self.ctx.counters.remove(&recovery_counter);

        if self.state != ModuleState::Suspended {
            self.module_state(ModuleState::Active);
        }

        self.leadership_term_id = self.recovery_plan.last_leadership_term_id;
        self.last_appended_position = self.recovery_plan.appended_log_position;

        self.election = Some(Election::new(
            true,
            self.leadership_term_id,
            self.recovery_plan.appended_log_position,
        ));
        Ok(())
    }

    pub fn on_close(&mut self) {
        for session in self.sessions.values_mut() {
            session.close(CloseReason::ServiceAction);
        }
        for member in self.cluster_members.iter_mut() {
            member.close_publication();
        }
        self.log_publisher.disconnect();
        self.log_adapter = None;
        self.ingress_adapter.close();
    }

    pub fn do_work(&mut self, now_ms: i64) -> usize {
        if self.state == ModuleState::Closed {
            return 0;
        }
        let mut work_count = 0;

        if self.cached_time_ms != now_ms {
            self.cached_time_ms = now_ms;
            if self.role == Role::Leader {
                self.cluster_time(now_ms);
            }
            work_count += self.slow_tick_work(now_ms);
        }

        work_count += self.poll_member_status(now_ms);
        work_count += self.poll_service_adapter();

        if let Some(mut join) = self.dynamic_join.take() {
            work_count += join.do_work(self, now_ms);
            if join.is_done() {
                self.dynamic_join_complete(&join);
            } else {
                self.dynamic_join = Some(join);
            }
        } else if let Some(mut election) = self.election.take() {
            work_count += election.do_work(self, now_ms);
            if !election.is_closed() {
                self.election = Some(election);
            }
        } else {
            work_count += self.consensus_work(now_ms);
        }

        work_count
    }

    //
    // Slow tick.
    //

    fn slow_tick_work(&mut self, now_ms: i64) -> usize {
        let mut work_count = 0;

        self.ctx.activity_timestamp.set_ordered(now_ms);
        self.check_service_heartbeats(now_ms);
        work_count += self.process_redirect_sessions(now_ms);
        work_count += self.process_rejected_sessions(now_ms);

        if self.election.is_some() || self.dynamic_join.is_some() {
            return work_count;
        }

        if self.role == Role::Leader {
            work_count += self.check_control_toggle(now_ms);

            if self.state == ModuleState::Active {
                work_count += self.process_pending_sessions(now_ms);
                work_count += self.check_sessions(now_ms);
                work_count += self.process_passive_members(now_ms);

                if !ClusterMember::has_active_quorum(
                    &self.cluster_members,
                    now_ms,
                    self.ctx.leader_heartbeat_timeout_ms(),
                ) {
                    self.counted_error(ClusterError::NoActiveQuorum);
                    self.enter_election(now_ms);
                    work_count += 1;
                }
            } else if self.state == ModuleState::Terminating {
                let can_terminate = self
                    .cluster_termination
                    .as_ref()
                    .map_or(false, |termination| {
                        termination.can_terminate(&self.cluster_members, self.member_id, now_ms)
                    });
                if can_terminate {
                    let position = self.termination_position;
                    self.recording_log()
                        .commit_log_position(self.leadership_term_id, position);
                    self.terminate();
                }
            }
        } else if matches!(self.state, ModuleState::Active | ModuleState::Suspended) {
            if self.termination_position != NULL_POSITION
                && self.log_position() >= self.termination_position
            {
                self.service_proxy.termination_position(self.termination_position);
                self.expected_ack_position = self.termination_position;
                self.module_state(ModuleState::Terminating);
            }

            if now_ms >= self.time_of_last_log_update_ms + self.ctx.leader_heartbeat_timeout_ms()
            {
                self.counted_error(ClusterError::LeaderHeartbeatTimeout);
                self.enter_election(now_ms);
                work_count += 1;
            }
        }

        work_count
    }

    fn check_service_heartbeats(&mut self, now_ms: i64) {
        if self.dynamic_join.is_some() || self.state == ModuleState::Init {
            return;
        }

        let threshold = now_ms - self.ctx.service_heartbeat_timeout_ms();
        let stale = self
            .ctx
            .service_heartbeats
            .iter()
            .map(Counter::get)
            .find(|heartbeat| *heartbeat < threshold);
        if let Some(heartbeat) = stale {
            self.on_fatal(ClusterError::ServiceHeartbeatLost {
                last_heartbeat_ms: heartbeat,
            });
        }
    }

    fn check_control_toggle(&mut self, now_ms: i64) -> usize {
        match ToggleState::get(&self.ctx.control_toggle) {
            ToggleState::Suspend => {
                if self.state == ModuleState::Active && self.append_action(ClusterAction::Suspend) {
                    self.module_state(ModuleState::Suspended);
                    ToggleState::reset(&self.ctx.control_toggle);
                }
            }
            ToggleState::Resume => {
                if self.state == ModuleState::Suspended
                    && self.append_action(ClusterAction::Resume)
                {
                    self.module_state(ModuleState::Active);
                    ToggleState::reset(&self.ctx.control_toggle);
                }
            }
            ToggleState::Snapshot => {
                if self.state == ModuleState::Active
                    && self.append_action(ClusterAction::Snapshot)
                {
                    self.expected_ack_position = self.log_position();
                    self.module_state(ModuleState::Snapshot);
                }
            }
            ToggleState::Shutdown => {
                if self.state == ModuleState::Active
                    && self.append_action(ClusterAction::Snapshot)
                {
                    let position = self.log_position();
                    self.begin_termination(position, now_ms);
                    self.expected_ack_position = position;
                    self.module_state(ModuleState::Snapshot);
                }
            }
            ToggleState::Abort => {
                if self.state == ModuleState::Active {
                    let position = self.log_position();
                    self.begin_termination(position, now_ms);
                    self.service_proxy.termination_position(position);
                    self.expected_ack_position = position;
                    self.module_state(ModuleState::Terminating);
                }
            }
            ToggleState::Neutral => return 0,
        }
        1
    }

    fn begin_termination(&mut self, position: i64, now_ms: i64) {
        self.cluster_termination = Some(ClusterTermination::new(
            now_ms + self.ctx.termination_timeout_ms(),
        ));
        self.termination_position = position;
        let message = PeerMessage::TerminationPosition {
            log_position: position,
        };
        self.publish_to_all_members(&message);
    }

    fn append_action(&self, action: ClusterAction) -> bool {
        self.log_publisher
            .append_cluster_action(self.leadership_term_id, self.cluster_time_ms, action)
            > 0
    }

    //
    // Session processing.
    //

    fn process_pending_sessions(&mut self, now_ms: i64) -> usize {
        let mut work_count = 0;
        let mut index = 0;

        while index < self.pending_sessions.len() {
            let state = self.pending_sessions[index].state();

            match state {
                SessionState::Init | SessionState::Connected => {
                    if self.pending_sessions[index].is_response_publication_connected() {
                        self.pending_sessions[index].connected();
                        let mut proxy =
                            SessionProxy::new(&mut self.pending_sessions[index], &self.egress);
                        self.ctx.authenticator.on_connected_session(&mut proxy, now_ms);
                    }
                }
                SessionState::Challenged => {
                    if self.pending_sessions[index].is_response_publication_connected() {
                        let mut proxy =
                            SessionProxy::new(&mut self.pending_sessions[index], &self.egress);
                        self.ctx.authenticator.on_challenged_session(&mut proxy, now_ms);
                    }
                }
                _ => {}
            }

            match self.pending_sessions[index].state() {
                SessionState::Authenticated => {
                    let position = self.log_publisher.append_session_open(
                        &self.pending_sessions[index],
                        self.leadership_term_id,
                        self.cluster_time_ms,
                    );
                    if position > 0 {
                        let mut session = self.pending_sessions.swap_remove(index);
                        session.set_time_of_last_activity_ms(now_ms);
                        session.open(position);
                        self.egress.send_event(
                            &session,
                            self.leadership_term_id,
                            self.leader_member_id,
                            EventCode::Ok,
                            "",
                        );
                        self.sessions.insert(session.id(), session);
                        work_count += 1;
                        continue;
                    }
                }
                SessionState::Rejected => {
                    let session = self.pending_sessions.swap_remove(index);
                    self.rejected_sessions.push(session);
                    continue;
                }
                _ => {
                    if now_ms
                        > self.pending_sessions[index].time_of_last_activity_ms()
                            + self.ctx.session_timeout_ms()
                    {
                        let mut session = self.pending_sessions.swap_remove(index);
                        session.close(CloseReason::Timeout);
                        self.ctx.timed_out_client_counter.increment_ordered();
                        continue;
                    }
                }
            }

            index += 1;
        }

        work_count
    }

    fn process_rejected_sessions(&mut self, now_ms: i64) -> usize {
        let mut work_count = 0;
        let mut index = 0;

        while index < self.rejected_sessions.len() {
            let session = &self.rejected_sessions[index];
            let sent = self.egress.send_event(
                session,
                self.leadership_term_id,
                self.leader_member_id,
                session.event_code(),
                &session.response_detail().to_string(),
            );
            if sent || now_ms > session.time_of_last_activity_ms() + self.ctx.session_timeout_ms()
            {
                let mut session = self.rejected_sessions.swap_remove(index);
                session.close(CloseReason::ServiceAction);
                work_count += 1;
                continue;
            }
            index += 1;
        }

        work_count
    }

    fn process_redirect_sessions(&mut self, now_ms: i64) -> usize {
        let mut work_count = 0;
        let mut index = 0;

        while index < self.redirect_sessions.len() {
            let session = &self.redirect_sessions[index];
            let sent = self.egress.send_event(
                session,
                self.leadership_term_id,
                self.leader_member_id,
                EventCode::Redirect,
                &self.client_facing_endpoints.clone(),
            );
            if sent || now_ms > session.time_of_last_activity_ms() + self.ctx.session_timeout_ms()
            {
                let mut session = self.redirect_sessions.swap_remove(index);
                session.close(CloseReason::ServiceAction);
                work_count += 1;
                continue;
            }
            index += 1;
        }

        work_count
    }

    fn check_sessions(&mut self, now_ms: i64) -> usize {
        let mut work_count = 0;
        let session_timeout = self.ctx.session_timeout_ms();
        let ids: Vec<i64> = self.sessions.keys().copied().collect();

        for id in ids {
            let Some(session) = self.sessions.get_mut(&id) else { continue };

            if now_ms > session.time_of_last_activity_ms() + session_timeout {
                match session.state() {
                    SessionState::Open => {
                        if session.is_response_publication_connected() {
                            self.egress.send_event(
                                session,
                                self.leadership_term_id,
                                self.leader_member_id,
                                EventCode::Error,
                                SESSION_TIMEOUT_DETAIL,
                            );
                        }
                        session.close(CloseReason::Timeout);
                        if self.log_publisher.append_session_close(
                            session,
                            self.leadership_term_id,
                            self.cluster_time_ms,
                        ) {
                            self.sessions.remove(&id);
                            self.ctx.timed_out_client_counter.increment_ordered();
                        }
                    }
                    SessionState::Closed => {
                        let appended = self.log_publisher.append_session_close(
                            session,
                            self.leadership_term_id,
                            self.cluster_time_ms,
                        );
                        if appended {
                            let timed_out =
                                session.close_reason() == Some(CloseReason::Timeout);
                            self.sessions.remove(&id);
                            if timed_out {
                                self.ctx.timed_out_client_counter.increment_ordered();
                            }
                        }
                    }
                    _ => {
                        session.close(CloseReason::ServiceAction);
                        self.sessions.remove(&id);
                    }
                }
                work_count += 1;
            } else if session.has_new_leader_event_pending() {
                let sent = self.egress.new_leader(
                    session,
                    self.leadership_term_id,
                    self.leader_member_id,
                    &self.client_facing_endpoints.clone(),
                );
                if sent {
                    session.set_new_leader_event_pending(false);
                }
                work_count += 1;
            }
        }

        work_count
    }

    fn process_passive_members(&mut self, _now_ms: i64) -> usize {
        let mut work_count = 0;
        let mut admit_index = None;

        for (index, member) in self.passive_members.iter_mut().enumerate() {
            if member.correlation_id != NULL_VALUE {
                let message = PeerMessage::ClusterMembersChange {
                    correlation_id: member.correlation_id,
                    leader_member_id: self.member_id,
                    active_members: ClusterMember::encode_as_string(&self.cluster_members),
                    passive_members: String::new(),
                };
                let sent = member
                    .publication
                    .as_ref()
                    .map_or(false, |publication| publication.offer(&message.encode()) > 0);
                if sent {
                    member.correlation_id = NULL_VALUE;
                    work_count += 1;
                }
            } else if member.has_requested_join
                && member.log_position == self.log_publisher.position()
            {
                admit_index = Some(index);
                break;
            }
        }

        if let Some(index) = admit_index {
            let mut member = self.passive_members.remove(index);
            let mut new_members_string = ClusterMember::encode_as_string(&self.cluster_members);
            new_members_string.push('|');
            new_members_string.push_str(&format!("{},{}", member.id, member.encode_endpoints()));

            let position = self.log_publisher.append_membership_change_event(
                self.leadership_term_id,
                self.cluster_time_ms,
                self.member_id,
                self.cluster_members.len() as i32 + 1,
                ChangeType::Join,
                member.id,
                &new_members_string,
            );

            if position > 0 {
                info!("admitting member {} at {}", member.id, position);
                self.time_of_last_log_update_ms =
                    self.cached_time_ms - self.ctx.leader_heartbeat_interval_ms();
                member.has_requested_join = false;
                self.cluster_members.push(member);
                work_count += 1;
            } else {
                self.passive_members.insert(index, member);
            }
        }

        work_count
    }

    //
    // Consensus work.
    //

    fn consensus_work(&mut self, now_ms: i64) -> usize {
        let mut work_count = 0;

        if self.role == Role::Leader && self.state == ModuleState::Active {
            work_count += self.poll_ingress();
            work_count += self.drain_pending_service_messages();
            work_count += self.poll_timers(self.cluster_time_ms);
        } else if self.role == Role::Follower
            && matches!(self.state, ModuleState::Active | ModuleState::Suspended)
        {
            work_count += self.poll_ingress();

            if let Some(mut adapter) = self.log_adapter.take() {
                let bound = self.follower_commit_position;
                let count =
                    adapter.poll(bound, MESSAGE_LIMIT, |record, position| {
                        self.on_replay_record(record, position)
                    });
                let closed = count == 0 && adapter.is_image_closed();
                let log_position = adapter.position();
                self.log_adapter = Some(adapter);

                if closed {
                    self.counted_error(ClusterError::NoLeaderConnection {
                        log_position,
                        commit_position: self.commit_position.get_weak(),
                        leadership_term_id: self.leadership_term_id,
                    });
                    self.enter_election(now_ms);
                    return work_count + 1;
                }
                work_count += count;
            }

            if self.state == ModuleState::Active {
                // Follower timers run against the leader-timeout-lagged
                // clock: cluster time only advances with delivered records.
                work_count +=
                    self.poll_timers(now_ms - self.ctx.leader_heartbeat_timeout_ms());
            }
        }

        work_count += self.update_member_position(now_ms);
        work_count
    }

    fn poll_timers(&mut self, now_ms: i64) -> usize {
        if now_ms < 0 {
            return 0;
        }
        let role = self.role;
        let leadership_term_id = self.leadership_term_id;
        let cluster_time_ms = self.cluster_time_ms;
        let publisher = &self.log_publisher;

        self.timers.poll(now_ms, |correlation_id| {
            role != Role::Leader
                || publisher.append_timer_event(correlation_id, leadership_term_id, cluster_time_ms)
        })
    }

    fn drain_pending_service_messages(&mut self) -> usize {
        let leadership_term_id = self.leadership_term_id;
        let cluster_time_ms = self.cluster_time_ms;
        let publisher = &self.log_publisher;
        let mut appended_id = self.log_service_session_id;

        let consumed = self.pending_service_messages.consume(
            |message| {
                let position = publisher.append_message(
                    leadership_term_id,
                    message.cluster_session_id,
                    cluster_time_ms,
                    message.payload.clone(),
                );
                if position > 0 {
                    appended_id = message.cluster_session_id;
                    true
                } else {
                    false
                }
            },
            MESSAGE_LIMIT,
        );

        self.log_service_session_id = appended_id;
        consumed
    }

    fn poll_ingress(&mut self) -> usize {
        let Some(subscription) = self.ingress_adapter.take_subscription() else {
            return 0;
        };

        let count = subscription.poll(
            |_, _, payload| match IngressRequest::decode(payload) {
                Ok(request) => self.on_ingress_request(request),
                Err(err) => {
                    self.ctx.invalid_request_counter.increment_ordered();
                    warn!("invalid ingress frame: {}", err);
                    Action::Continue
                }
            },
            MESSAGE_LIMIT,
        );

        self.ingress_adapter.restore_subscription(subscription);
        count
    }

    fn on_ingress_request(&mut self, request: IngressRequest) -> Action {
        match request {
            IngressRequest::SessionConnect {
                correlation_id,
                response_stream_id,
                version,
                response_channel,
                encoded_credentials,
            } => {
                self.on_session_connect(
                    correlation_id,
                    response_stream_id,
                    version,
                    &response_channel,
                    &encoded_credentials,
                );
                Action::Continue
            }
            IngressRequest::SessionClose {
                leadership_term_id,
                cluster_session_id,
            } => {
                if self.role == Role::Leader && leadership_term_id == self.leadership_term_id {
                    if let Some(session) = self.sessions.get_mut(&cluster_session_id) {
                        session.close(CloseReason::ClientAction);
                        if self.log_publisher.append_session_close(
                            session,
                            leadership_term_id,
                            self.cluster_time_ms,
                        ) {
                            self.sessions.remove(&cluster_session_id);
                        }
                    }
                }
                Action::Continue
            }
            IngressRequest::Message {
                leadership_term_id,
                cluster_session_id,
                payload,
            } => self.on_ingress_message(leadership_term_id, cluster_session_id, payload),
            IngressRequest::SessionKeepAlive {
                leadership_term_id,
                cluster_session_id,
            } => {
                if self.role == Role::Leader && leadership_term_id == self.leadership_term_id {
                    if let Some(session) = self.sessions.get_mut(&cluster_session_id) {
                        if session.state() == SessionState::Open {
                            session.set_time_of_last_activity_ms(self.cluster_time_ms);
                        }
                    }
                }
                Action::Continue
            }
            IngressRequest::ChallengeResponse {
                correlation_id,
                cluster_session_id,
                encoded_credentials,
            } => {
                if self.role == Role::Leader {
                    for session in self.pending_sessions.iter_mut() {
                        if session.id() == cluster_session_id
                            && session.state() == SessionState::Challenged
                        {
                            session.last_activity(self.cluster_time_ms, correlation_id);
                            self.ctx.authenticator.on_challenge_response(
                                cluster_session_id,
                                &encoded_credentials,
                                self.cluster_time_ms,
                            );
                            break;
                        }
                    }
                }
                Action::Continue
            }
        }
    }

    fn on_session_connect(
        &mut self,
        correlation_id: i64,
        response_stream_id: i32,
        version: i32,
        response_channel: &str,
        encoded_credentials: &Bytes,
    ) {
        let session_id = if self.role == Role::Leader {
            let id = self.next_session_id;
            self.next_session_id += 1;
            id
        } else {
            NULL_VALUE
        };

        let mut session = ClusterSession::new(session_id, response_stream_id, response_channel);
        session.last_activity(self.cached_time_ms, correlation_id);
        session.connect(&self.ctx.transport);

        if self.role != Role::Leader {
            self.redirect_sessions.push(session);
            return;
        }

        if semantic_version_major(version) != PROTOCOL_MAJOR_VERSION {
            session.reject(EventCode::Error, SESSION_INVALID_VERSION_DETAIL);
            self.rejected_sessions.push(session);
        } else if self.pending_sessions.len() + self.sessions.len()
            >= self.ctx.max_concurrent_sessions
        {
            session.reject(EventCode::Error, SESSION_LIMIT_DETAIL);
            self.rejected_sessions.push(session);
        } else {
            self.ctx.authenticator.on_connect_request(
                session.id(),
                encoded_credentials,
                self.cluster_time_ms,
            );
            self.pending_sessions.push(session);
        }
    }

    fn on_ingress_message(
        &mut self,
        leadership_term_id: i64,
        cluster_session_id: i64,
        payload: Bytes,
    ) -> Action {
        if leadership_term_id != self.leadership_term_id || self.role != Role::Leader {
            return Action::Continue;
        }

        let Some(session) = self.sessions.get_mut(&cluster_session_id) else {
            return Action::Continue;
        };
        if session.state() == SessionState::Closed {
            return Action::Continue;
        }

        if session.state() == SessionState::Open {
            let position = self.log_publisher.append_message(
                leadership_term_id,
                cluster_session_id,
                self.cluster_time_ms,
                payload,
            );
            if position > 0 {
                session.set_time_of_last_activity_ms(self.cluster_time_ms);
                return Action::Continue;
            }
            return Action::Abort;
        }

        Action::Continue
    }

    //
    // Peer control.
    //

    fn poll_member_status(&mut self, now_ms: i64) -> usize {
        let mut messages = Vec::new();
        let count = self.member_status_subscription.poll(
            |_, _, payload| {
                match PeerMessage::decode(payload) {
                    Ok(message) => messages.push(message),
                    Err(err) => warn!("undecodable member status message: {}", err),
                }
                Action::Continue
            },
            MESSAGE_LIMIT,
        );

        for message in messages {
            self.on_peer_message(message, now_ms);
        }
        count
    }

    fn with_election<R>(
        &mut self,
        f: impl FnOnce(&mut Election, &mut Self) -> R,
    ) -> Option<R> {
        let mut election = self.election.take()?;
        let result = f(&mut election, self);
        if !election.is_closed() {
            self.election = Some(election);
        }
        Some(result)
    }

    fn with_dynamic_join<R>(
        &mut self,
        f: impl FnOnce(&mut DynamicJoin, &mut Self) -> R,
    ) -> Option<R> {
        let mut join = self.dynamic_join.take()?;
        let result = f(&mut join, self);
        self.dynamic_join = Some(join);
        Some(result)
    }

    fn on_peer_message(&mut self, message: PeerMessage, now_ms: i64) {
        match message {
            PeerMessage::CanvassPosition {
                log_leadership_term_id,
                log_position,
                follower_member_id,
            } => {
                if self.election.is_some() {
                    self.with_election(|election, agent| {
                        election.on_canvass_position(
                            agent,
                            log_leadership_term_id,
                            log_position,
                            follower_member_id,
                        )
                    });
                } else if self.role == Role::Leader {
                    self.on_canvass_position_as_leader(log_leadership_term_id, follower_member_id);
                }
            }
            PeerMessage::RequestVote {
                log_leadership_term_id,
                log_position,
                candidate_term_id,
                candidate_member_id,
            } => {
                if self.election.is_none() && candidate_term_id > self.leadership_term_id {
                    self.counted_error(ClusterError::UnexpectedTerm {
                        origin: "vote request",
                        term_id: candidate_term_id,
                        current_term_id: self.leadership_term_id,
                    });
                    self.enter_election(now_ms);
                }
                self.with_election(|election, agent| {
                    election.on_request_vote(
                        agent,
                        log_leadership_term_id,
                        log_position,
                        candidate_term_id,
                        candidate_member_id,
                    )
                });
            }
            PeerMessage::Vote {
                candidate_term_id,
                candidate_member_id,
                follower_member_id,
                vote,
                ..
            } => {
                self.with_election(|election, agent| {
                    election.on_vote(
                        agent,
                        candidate_term_id,
                        candidate_member_id,
                        follower_member_id,
                        vote,
                    )
                });
            }
            PeerMessage::NewLeadershipTerm {
                log_leadership_term_id,
                log_position,
                leadership_term_id,
                max_log_position,
                leader_member_id,
                log_session_id,
            } => {
                if self.election.is_some() {
                    self.with_election(|election, agent| {
                        election.on_new_leadership_term(
                            agent,
                            log_leadership_term_id,
                            log_position,
                            leadership_term_id,
                            max_log_position,
                            leader_member_id,
                            log_session_id,
                        )
                    });
                } else if leadership_term_id > self.leadership_term_id {
                    self.counted_error(ClusterError::UnexpectedTerm {
                        origin: "new leadership term",
                        term_id: leadership_term_id,
                        current_term_id: self.leadership_term_id,
                    });
                    self.enter_election(now_ms);
                }
            }
            PeerMessage::AppendedPosition {
                leadership_term_id,
                log_position,
                follower_member_id,
            } => {
                let cached = self.cached_time_ms;
                if let Some(member) =
                    ClusterMember::find_mut(&mut self.cluster_members, follower_member_id)
                        .or_else(|| {
                            ClusterMember::find_mut(&mut self.passive_members, follower_member_id)
                        })
                {
                    member.log_position = log_position;
                    member.time_of_last_append_ms = cached;
                }
                if self.election.is_none()
                    && self.role == Role::Leader
                    && leadership_term_id == self.leadership_term_id
                {
                    self.check_catchup_stop(follower_member_id);
                }
            }
            PeerMessage::CommitPosition {
                leadership_term_id,
                log_position,
                ..
            } => {
                if self.election.is_some() {
                    self.with_election(|election, agent| {
                        election.on_commit_position(agent, leadership_term_id, log_position)
                    });
                } else if self.role == Role::Follower
                    && leadership_term_id == self.leadership_term_id
                {
                    self.time_of_last_log_update_ms = self.cached_time_ms;
                    self.follower_commit_position = log_position;
                } else if leadership_term_id > self.leadership_term_id {
                    self.counted_error(ClusterError::UnexpectedTerm {
                        origin: "commit position",
                        term_id: leadership_term_id,
                        current_term_id: self.leadership_term_id,
                    });
                    self.enter_election(now_ms);
                }
            }
            PeerMessage::CatchupPosition {
                leadership_term_id,
                log_position,
                follower_member_id,
            } => {
                if self.election.is_none()
                    && self.role == Role::Leader
                    && leadership_term_id == self.leadership_term_id
                {
                    self.start_catchup_replay(log_position, follower_member_id);
                }
            }
            PeerMessage::StopCatchup { follower_member_id, .. } => {
                if follower_member_id == self.member_id {
                    self.with_election(|election, agent| election.on_stop_catchup(agent, now_ms));
                }
            }
            PeerMessage::AddPassiveMember {
                correlation_id,
                member_endpoints,
            } => self.on_add_passive_member(correlation_id, &member_endpoints),
            PeerMessage::ClusterMembersChange {
                correlation_id,
                leader_member_id,
                active_members,
                passive_members,
            } => {
                self.with_dynamic_join(|join, agent| {
                    join.on_cluster_members_change(
                        agent,
                        correlation_id,
                        leader_member_id,
                        &active_members,
                        &passive_members,
                    )
                });
            }
            PeerMessage::SnapshotRecordingQuery {
                correlation_id,
                request_member_id,
            } => {
                if self.election.is_none() && self.role == Role::Leader {
                    let snapshots = self.recovery_plan.snapshots.clone();
                    let members = ClusterMember::encode_as_string(&self.cluster_members);
                    self.publish_to_member(
                        request_member_id,
                        &PeerMessage::SnapshotRecordings {
                            correlation_id,
                            snapshots,
                            cluster_members: members,
                        },
                    );
                }
            }
            PeerMessage::SnapshotRecordings {
                correlation_id,
                snapshots,
                ..
            } => {
                self.with_dynamic_join(|join, agent| {
                    join.on_snapshot_recordings(agent, correlation_id, snapshots)
                });
            }
            PeerMessage::JoinCluster { member_id, .. } => self.on_join_cluster(member_id),
            PeerMessage::TerminationPosition { log_position } => {
                if self.role == Role::Follower {
                    self.termination_position = log_position;
                }
            }
            PeerMessage::TerminationAck {
                log_position,
                member_id,
            } => {
                if self.role == Role::Leader && log_position == self.termination_position {
                    if let Some(member) =
                        ClusterMember::find_mut(&mut self.cluster_members, member_id)
                    {
                        member.has_sent_termination_ack = true;
                        let can_terminate = self
                            .cluster_termination
                            .as_ref()
                            .map_or(false, |termination| {
                                termination.can_terminate(
                                    &self.cluster_members,
                                    self.member_id,
                                    self.cached_time_ms,
                                )
                            });
                        if can_terminate {
                            self.recording_log()
                                .commit_log_position(self.leadership_term_id, log_position);
                            self.terminate();
                        }
                    }
                }
            }
            PeerMessage::RemoveMember {
                member_id,
                is_passive,
                ..
            } => self.on_remove_member(member_id, is_passive),
        }
    }

    fn on_canvass_position_as_leader(
        &mut self,
        log_leadership_term_id: i64,
        follower_member_id: i32,
    ) {
        let position = if log_leadership_term_id == self.leadership_term_id {
            self.log_position()
        } else {
            match self.recording_log().get_term_entry(self.leadership_term_id) {
                Ok(entry) => entry.term_base_log_position,
                Err(_) => self.log_position(),
            }
        };

        let message = PeerMessage::NewLeadershipTerm {
            log_leadership_term_id: self.leadership_term_id,
            log_position: position,
            leadership_term_id: self.leadership_term_id,
            max_log_position: self.log_position(),
            leader_member_id: self.member_id,
            log_session_id: self.log_publisher.session_id(),
        };
        self.publish_to_member(follower_member_id, &message);
    }

    fn on_add_passive_member(&mut self, correlation_id: i64, member_endpoints: &str) {
        if self.election.is_some() {
            return;
        }

        if self.role == Role::Leader {
            if ClusterMember::is_duplicate_endpoints(&self.passive_members, member_endpoints) {
                return;
            }
            self.high_member_id += 1;
            let member_id = self.high_member_id;
            let Ok(mut member) = ClusterMember::parse_endpoints(member_id, member_endpoints)
            else {
                return;
            };

            member.correlation_id = correlation_id;
            member.add_status_publication(&self.ctx.transport, self.ctx.member_status_stream_id);
            self.log_publisher.add_passive_follower(&member.log_endpoint);
            info!("passive member {} announced: {}", member_id, member_endpoints);
            self.passive_members.push(member);
        } else if self.role == Role::Follower {
            // Relay to the leader.
            let message = PeerMessage::AddPassiveMember {
                correlation_id,
                member_endpoints: member_endpoints.to_string(),
            };
            self.publish_to_member(self.leader_member_id, &message);
        }
    }

    fn on_join_cluster(&mut self, member_id: i32) {
        if self.election.is_some() || self.role != Role::Leader {
            return;
        }
        let transport = self.ctx.transport.clone();
        let status_stream_id = self.ctx.member_status_stream_id;
        let log_publisher = &self.log_publisher;

        if let Some(member) = ClusterMember::find_mut(&mut self.passive_members, member_id) {
            if !member.has_requested_join {
                if member.publication.is_none() {
                    member.add_status_publication(&transport, status_stream_id);
                    log_publisher.add_passive_follower(&member.log_endpoint);
                }
                member.has_requested_join = true;
            }
        }
    }

    fn on_remove_member(&mut self, member_id: i32, is_passive: bool) {
        if self.election.is_some() || self.role != Role::Leader {
            return;
        }

        if is_passive {
            if let Some(member) = ClusterMember::find_mut(&mut self.passive_members, member_id) {
                member.close_publication();
                let log_endpoint = member.log_endpoint.clone();
                self.log_publisher.remove_passive_follower(&log_endpoint);
                ClusterMember::remove_member(&mut self.passive_members, member_id);
            }
            return;
        }

        if ClusterMember::find(&self.cluster_members, member_id).is_none() {
            return;
        }

        let remaining: Vec<String> = self
            .cluster_members
            .iter()
            .filter(|member| member.id != member_id)
            .map(|member| format!("{},{}", member.id, member.encode_endpoints()))
            .collect();
        let new_members_string = remaining.join("|");

        let position = self.log_publisher.append_membership_change_event(
            self.leadership_term_id,
            self.cluster_time_ms,
            self.member_id,
            self.cluster_members.len() as i32,
            ChangeType::Quit,
            member_id,
            &new_members_string,
        );

        if position > 0 {
            self.time_of_last_log_update_ms =
                self.cached_time_ms - self.ctx.leader_heartbeat_interval_ms();
            if let Some(member) = ClusterMember::find_mut(&mut self.cluster_members, member_id) {
                member.has_requested_remove = true;
                member.removal_position = position;
            }
            self.pending_member_removals += 1;
        }
    }

    fn start_catchup_replay(&mut self, log_position: i64, follower_member_id: i32) {
        let log_session_id = self.log_publisher.session_id();
        let log_recording_id = self.log_recording_id;
        let log_stream_id = self.ctx.log_stream_id;
        let archive = self.archive.clone();

        let member = ClusterMember::find_mut(&mut self.cluster_members, follower_member_id)
            .or_else(|| ClusterMember::find_mut(&mut self.passive_members, follower_member_id));
        let Some(member) = member else { return };
        if member.catchup_replay_session_id != NULL_VALUE {
            return;
        }

        let channel = format!("mem:{}?session-id={}", member.log_endpoint, log_session_id);
        match archive.start_replay(log_recording_id, log_position, i64::MAX, &channel, log_stream_id)
        {
            Ok(replay_id) => {
                info!(
                    "catch-up replay for member {} from {}",
                    follower_member_id, log_position
                );
                member.catchup_replay_session_id = replay_id;
            }
            Err(err) => self.counted_error(err.into()),
        }
    }

    fn check_catchup_stop(&mut self, member_id: i32) {
        let leader_position = self.log_publisher.position();
        let leadership_term_id = self.leadership_term_id;
        let archive = self.archive.clone();

        let member = ClusterMember::find_mut(&mut self.cluster_members, member_id)
            .or_else(|| ClusterMember::find_mut(&mut self.passive_members, member_id));
        let Some(member) = member else { return };

        if member.catchup_replay_session_id != NULL_VALUE && member.log_position >= leader_position
        {
            archive.stop_replay(member.catchup_replay_session_id);
            let message = PeerMessage::StopCatchup {
                leadership_term_id,
                log_position: leader_position,
                follower_member_id: member.id,
            };
            let sent = member
                .publication
                .as_ref()
                .map_or(false, |publication| publication.offer(&message.encode()) > 0);
            if sent {
                member.catchup_replay_session_id = NULL_VALUE;
            }
        }
    }

    //
    // Service control.
    //

    fn poll_service_adapter(&mut self) -> usize {
        let mut messages = Vec::new();
        let count = self
            .service_adapter
            .poll(|message| messages.push(message), MESSAGE_LIMIT);
        for message in messages {
            self.on_service_control(message);
        }
        count
    }

    fn on_service_control(&mut self, message: FromServiceMessage) {
        match message {
            FromServiceMessage::ServiceAck {
                log_position,
                ack_id,
                relevant_id,
                service_id,
            } => self.on_service_ack(log_position, ack_id, relevant_id, service_id),
            FromServiceMessage::ServiceMessage {
                leadership_term_id,
                payload,
            } => self.on_service_message(leadership_term_id, payload),
            FromServiceMessage::CloseSession { cluster_session_id } => {
                self.on_service_close_session(cluster_session_id)
            }
            FromServiceMessage::ScheduleTimer {
                correlation_id,
                deadline_ms,
            } => self.on_schedule_timer(correlation_id, deadline_ms),
            FromServiceMessage::CancelTimer { correlation_id } => {
                self.timers.cancel(correlation_id);
            }
            FromServiceMessage::ClusterMembersQuery { correlation_id } => {
                self.service_proxy.cluster_members_response(
                    correlation_id,
                    self.leader_member_id,
                    &ClusterMember::encode_as_string(&self.cluster_members),
                    &ClusterMember::encode_as_string(&self.passive_members),
                );
            }
        }
    }

    fn on_service_ack(&mut self, log_position: i64, ack_id: i64, relevant_id: i64, service_id: i32) {
        if log_position != self.expected_ack_position || ack_id != self.service_ack_id {
            self.on_fatal(ClusterError::InvalidServiceAck {
                state: state_name(self.state),
                service_id,
                log_position,
                expected_position: self.expected_ack_position,
                ack_id,
                expected_ack_id: self.service_ack_id,
            });
            return;
        }

        let index = service_id as usize;
        if index >= self.service_acks.len() {
            return;
        }
        self.service_acks[index] = ServiceAck {
            log_position,
            ack_id,
            relevant_id,
        };

        if !ServiceAck::has_reached_position(log_position, self.service_ack_id, &self.service_acks)
        {
            return;
        }

        match self.state {
            ModuleState::Snapshot => {
                self.service_ack_id += 1;
                if let Err(err) = self.take_snapshot(self.cluster_time_ms, log_position) {
                    // The attempt is abandoned; only a dead recording or an
                    // interrupt takes the module down with it.
                    match err {
                        ClusterError::Interrupted(_) | ClusterError::RecordingStopped(_) => {
                            self.on_fatal(err);
                            return;
                        }
                        err => self.counted_error(err),
                    }
                }

                if self.termination_position == NULL_POSITION {
                    self.module_state(ModuleState::Active);
                    ToggleState::reset(&self.ctx.control_toggle);
                    let now_ms = self.cached_time_ms;
                    for session in self.sessions.values_mut() {
                        session.set_time_of_last_activity_ms(now_ms);
                    }
                } else {
                    self.service_proxy.termination_position(self.termination_position);
                    if let Some(termination) = &mut self.cluster_termination {
                        termination.deadline_ms =
                            self.cached_time_ms + self.ctx.termination_timeout_ms();
                    }
                    self.module_state(ModuleState::Terminating);
                }
            }
            ModuleState::Leaving => {
                self.recording_log()
                    .commit_log_position(self.leadership_term_id, log_position);
                self.terminate();
            }
            ModuleState::Terminating => {
                let can_terminate = match &mut self.cluster_termination {
                    None => {
                        // Follower: acknowledge to the leader and go.
                        let message = PeerMessage::TerminationAck {
                            log_position,
                            member_id: self.member_id,
                        };
                        self.publish_to_member(self.leader_member_id, &message);
                        true
                    }
                    Some(termination) => {
                        termination.has_service_terminated = true;
                        termination.can_terminate(
                            &self.cluster_members,
                            self.member_id,
                            self.cached_time_ms,
                        )
                    }
                };

                if can_terminate {
                    self.recording_log()
                        .commit_log_position(self.leadership_term_id, log_position);
                    self.terminate();
                }
            }
            _ => {}
        }
    }

    fn on_service_message(&mut self, leadership_term_id: i64, payload: Bytes) {
        if leadership_term_id != self.leadership_term_id {
            return;
        }

        self.next_service_session_id += 1;
        let cluster_session_id = self.next_service_session_id;

        if self.role != Role::Leader
            || self.state != ModuleState::Active
            || !self.pending_service_messages.is_empty()
        {
            self.pending_service_messages.append(cluster_session_id, payload);
            return;
        }

        let position = self.log_publisher.append_message(
            leadership_term_id,
            cluster_session_id,
            self.cluster_time_ms,
            payload.clone(),
        );
        if position > 0 {
            self.log_service_session_id = cluster_session_id;
        } else {
            self.pending_service_messages.append(cluster_session_id, payload);
        }
    }

    fn on_service_close_session(&mut self, cluster_session_id: i64) {
        let Some(session) = self.sessions.get_mut(&cluster_session_id) else {
            return;
        };

        if session.is_response_publication_connected() {
            self.egress.send_event(
                session,
                self.leadership_term_id,
                self.leader_member_id,
                EventCode::Error,
                SESSION_TERMINATED_DETAIL,
            );
        }
        session.close(CloseReason::ServiceAction);

        if self.role == Role::Leader
            && self.log_publisher.append_session_close(
                session,
                self.leadership_term_id,
                self.cluster_time_ms,
            )
        {
            self.sessions.remove(&cluster_session_id);
        }
    }

    /// Scheduling after a local expiry nets out against the pending
    /// expiration count instead of installing a duplicate timer.
    fn on_schedule_timer(&mut self, correlation_id: i64, deadline_ms: i64) {
        match self.expired_timer_counts.get_mut(&correlation_id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    self.expired_timer_counts.remove(&correlation_id);
                }
            }
            _ => self.timers.schedule(correlation_id, deadline_ms),
        }
    }

    //
    // Log replay dispatch.
    //

    fn on_replay_record(&mut self, record: LogRecord, log_position: i64) {
        self.cluster_time(record.timestamp_ms());

        match record {
            LogRecord::Message {
                cluster_session_id, ..
            } => match self.sessions.get_mut(&cluster_session_id) {
                Some(session) => {
                    let time = self.cluster_time_ms;
                    session.set_time_of_last_activity_ms(time);
                }
                None => self.sweep_pending_service_messages(cluster_session_id),
            },
            LogRecord::TimerEvent { correlation_id, .. } => {
                if !self.timers.cancel(correlation_id) {
                    *self.expired_timer_counts.entry(correlation_id).or_insert(0) += 1;
                }
            }
            LogRecord::SessionOpen {
                cluster_session_id,
                correlation_id,
                timestamp_ms,
                response_stream_id,
                response_channel,
                ..
            } => {
                let mut session = ClusterSession::new(
                    cluster_session_id,
                    response_stream_id,
                    &response_channel,
                );
                session.last_activity(timestamp_ms, correlation_id);
                session.connected();
                session.authenticated();
                session.open(log_position);
                self.sessions.insert(cluster_session_id, session);
                if cluster_session_id >= self.next_session_id {
                    self.next_session_id = cluster_session_id + 1;
                }
            }
            LogRecord::SessionClose {
                cluster_session_id,
                close_reason,
                ..
            } => {
                if let Some(mut session) = self.sessions.remove(&cluster_session_id) {
                    session.close(close_reason);
                }
            }
            LogRecord::ClusterAction { log_position, action, .. } => match action {
                ClusterAction::Suspend => self.module_state(ModuleState::Suspended),
                ClusterAction::Resume => self.module_state(ModuleState::Active),
                ClusterAction::Snapshot => {
                    self.expected_ack_position = log_position;
                    self.module_state(ModuleState::Snapshot);
                }
            },
            LogRecord::NewLeadershipTermEvent {
                leadership_term_id,
                log_position,
                timestamp_ms,
                ..
            } => {
                self.leadership_term_id = leadership_term_id;
                let recording_id = self.log_recording_id;
                let appended = {
                    let mut recording_log = self.recording_log();
                    if recording_log.get_term_entry(leadership_term_id).is_err() {
                        recording_log.append_term(
                            recording_id,
                            leadership_term_id,
                            log_position,
                            timestamp_ms,
                        )
                    } else {
                        Ok(())
                    }
                };
                if let Err(err) = appended {
                    self.counted_error(err);
                }
            }
            LogRecord::MembershipChangeEvent {
                leadership_term_id,
                log_position,
                leader_member_id,
                change_type,
                member_id,
                cluster_members,
                ..
            } => {
                self.leadership_term_id = leadership_term_id;
                self.on_membership_change(
                    log_position,
                    leader_member_id,
                    change_type,
                    member_id,
                    &cluster_members,
                );
            }
        }
    }

    fn on_membership_change(
        &mut self,
        log_position: i64,
        leader_member_id: i32,
        change_type: ChangeType,
        member_id: i32,
        cluster_members: &str,
    ) {
        match change_type {
            ChangeType::Join => {
                if member_id == self.member_id {
                    // Our own admission: adopt the full membership.
                    match ClusterMember::parse(cluster_members) {
                        Ok(mut members) => {
                            info!("member {} joined cluster at {}", member_id, log_position);
                            add_status_publications(
                                &mut members,
                                self.member_id,
                                &self.ctx.transport,
                                self.ctx.member_status_stream_id,
                            );
                            self.cluster_members = members;
                            self.high_member_id = self
                                .high_member_id
                                .max(ClusterMember::high_member_id(&self.cluster_members));
                            self.leader_member_id = leader_member_id;
                            self.update_member_details(leader_member_id);
                        }
                        Err(err) => self.counted_error(err),
                    }
                } else if ClusterMember::find(&self.cluster_members, member_id).is_none() {
                    match ClusterMember::parse(cluster_members) {
                        Ok(members) => {
                            if let Some(new_member) =
                                members.into_iter().find(|member| member.id == member_id)
                            {
                                self.high_member_id = self.high_member_id.max(member_id);
                                let mut member = new_member;
                                if member.id != self.member_id {
                                    member.add_status_publication(
                                        &self.ctx.transport,
                                        self.ctx.member_status_stream_id,
                                    );
                                }
                                self.cluster_members.push(member);
                            }
                        }
                        Err(err) => self.counted_error(err),
                    }
                }
            }
            ChangeType::Quit => {
                if member_id == self.member_id {
                    self.expected_ack_position = log_position;
                    self.module_state(ModuleState::Leaving);
                } else {
                    let leader_stepped_down = leader_member_id == member_id;
                    if let Some(member) =
                        ClusterMember::find_mut(&mut self.cluster_members, member_id)
                    {
                        member.close_publication();
                    }
                    ClusterMember::remove_member(&mut self.cluster_members, member_id);

                    if leader_stepped_down {
                        self.commit_position.propose_max_ordered(log_position);
                        self.enter_election(self.cached_time_ms);
                    }
                }
            }
        }
    }

    fn sweep_pending_service_messages(&mut self, cluster_session_id: i64) {
        self.log_service_session_id = cluster_session_id;
        let log_service_session_id = self.log_service_session_id;
        self.pending_service_messages.consume(
            |message| message.cluster_session_id <= log_service_session_id,
            usize::MAX,
        );
    }

    //
    // Position and commit advancement.
    //

    fn update_member_position(&mut self, now_ms: i64) -> usize {
        let mut work_count = 0;

        if self.role == Role::Leader {
            let appended = self.appended_value().min(self.log_publisher.position());
            self.this_member.log_position = appended;
            self.this_member.time_of_last_append_ms = now_ms;
            let member_id = self.member_id;
            if let Some(own) = ClusterMember::find_mut(&mut self.cluster_members, member_id) {
                own.log_position = appended;
                own.time_of_last_append_ms = now_ms;
            }

            let quorum_position = ClusterMember::quorum_position(&self.cluster_members);
            let advanced = self.commit_position.propose_max_ordered(quorum_position);

            if advanced
                || now_ms >= self.time_of_last_log_update_ms + self.ctx.leader_heartbeat_interval_ms()
            {
                let commit_position = self.commit_position.get_weak();
                let message = PeerMessage::CommitPosition {
                    leadership_term_id: self.leadership_term_id,
                    log_position: commit_position,
                    leader_member_id: self.member_id,
                };
                self.publish_to_all_members(&message);
                self.time_of_last_log_update_ms = now_ms;

                if self.pending_member_removals > 0 {
                    self.handle_member_removals(commit_position);
                }
                work_count += 1;
            }
        } else if self.role == Role::Follower {
            let appended = self.appended_value();

            if appended != self.last_appended_position
                || now_ms
                    >= self.time_of_last_append_position_ms
                        + self.ctx.leader_heartbeat_interval_ms()
            {
                let message = PeerMessage::AppendedPosition {
                    leadership_term_id: self.leadership_term_id,
                    log_position: appended,
                    follower_member_id: self.member_id,
                };
                if self.publish_to_member(self.leader_member_id, &message) {
                    self.last_appended_position = appended;
                    self.time_of_last_append_position_ms = now_ms;
                    work_count += 1;
                }
            }

            if let Some(adapter) = &self.log_adapter {
                self.commit_position
                    .propose_max_ordered(adapter.position().min(appended));
            }
        }

        work_count
    }

    fn handle_member_removals(&mut self, commit_position: i64) {
        let mut removed_ids = Vec::new();
        for member in &self.cluster_members {
            if member.has_requested_remove && member.removal_position <= commit_position {
                removed_ids.push(member.id);
            }
        }

        for member_id in removed_ids {
            if member_id == self.member_id {
                self.expected_ack_position = commit_position;
                self.module_state(ModuleState::Leaving);
            }
            if let Some(member) = ClusterMember::find_mut(&mut self.cluster_members, member_id) {
                member.close_publication();
                let log_endpoint = member.log_endpoint.clone();
                self.log_publisher.remove_passive_follower(&log_endpoint);
            }
            ClusterMember::remove_member(&mut self.cluster_members, member_id);
            self.pending_member_removals -= 1;
            info!("removed member {} at {}", member_id, commit_position);
        }
    }

    //
    // Election and leadership transitions (called by the election).
    //

    pub(crate) fn enter_election(&mut self, now_ms: i64) {
        if self.election.is_some() {
            return;
        }

        self.ingress_adapter.close();
        let commit_position = self.commit_position.get_weak();
        let mut election = Election::new(false, self.leadership_term_id, commit_position);
        election.do_work(self, now_ms);
        self.service_proxy.election_start_event(commit_position);
        self.election = Some(election);
    }

    pub(crate) fn reset_canvass_state(&mut self) {
        for member in self.cluster_members.iter_mut() {
            if member.id != self.member_id {
                member.leadership_term_id = NULL_VALUE;
            }
            member.vote = None;
        }
    }

    pub(crate) fn role_candidate(&mut self) {
        self.set_role(Role::Candidate);
    }

    pub(crate) fn counted_error(&mut self, err: ClusterError) {
        self.error_handler.on_error(&err);
    }

    fn on_fatal(&mut self, err: ClusterError) {
        self.error_handler.on_error(&err);
        self.terminate();
    }

    fn terminate(&mut self) {
        self.module_state(ModuleState::Closed);
        (self.ctx.termination_hook)();
    }

    pub(crate) fn publish_to_all_members(&mut self, message: &PeerMessage) {
        let encoded = message.encode();
        for member in &self.cluster_members {
            if member.id == self.member_id {
                continue;
            }
            if let Some(publication) = &member.publication {
                publication.offer(&encoded);
            }
        }
    }

    pub(crate) fn publish_to_member(&mut self, member_id: i32, message: &PeerMessage) -> bool {
        let member = ClusterMember::find(&self.cluster_members, member_id)
            .or_else(|| ClusterMember::find(&self.passive_members, member_id));
        match member.and_then(|member| member.publication.as_ref()) {
            Some(publication) => publication.offer(&message.encode()) > 0,
            None => false,
        }
    }

    pub(crate) fn log_adapter_position(&self) -> i64 {
        self.log_adapter.as_ref().map_or(0, LogAdapter::position)
    }

    fn log_position(&self) -> i64 {
        match &self.log_adapter {
            Some(adapter) => adapter.position(),
            None => self.log_publisher.position(),
        }
    }

    fn appended_value(&self) -> i64 {
        self.appended_position
            .as_ref()
            .map_or(self.last_appended_position, |counter| {
                counter.get().max(self.last_appended_position)
            })
    }

    pub(crate) fn update_member_details(&mut self, leader_member_id: i32) {
        self.leader_member_id = leader_member_id;
        for member in self.cluster_members.iter_mut() {
            member.is_leader = member.id == leader_member_id;
        }
        self.client_facing_endpoints =
            ClusterMember::client_facing_endpoints(&self.cluster_members);
    }

    /// Leader-side transition: new log publication, recording, term entry
    /// and service join for the new term. Returns the log session id.
    pub(crate) fn become_leader(
        &mut self,
        leadership_term_id: i64,
        log_position: i64,
        now_ms: i64,
    ) -> Result<i32, ClusterError> {
        self.close_existing_log();
        self.leadership_term_id = leadership_term_id;

        let log_session_id = self.ctx.transport.next_correlation_id() as i32;
        let channel = format!(
            "mem:?session-id={}|init-position={}",
            log_session_id, log_position
        );
        let publication = self.ctx.transport.add_publication(&channel, self.ctx.log_stream_id);
        for member in &self.cluster_members {
            if member.id != self.member_id {
                publication.add_destination(&member.log_endpoint);
            }
        }
        for member in &self.passive_members {
            publication.add_destination(&member.log_endpoint);
        }
        // Local services consume through this member's own log endpoint.
        publication.add_destination(&self.this_member.log_endpoint);
        self.log_publisher.set_publication(publication);

        let recording_id = self.start_log_recording(&channel, SourceLocation::Local)?;
        self.appended_position = Some(self.archive.recording_position_counter(recording_id)?);
        self.last_appended_position = log_position;

        self.recording_log().append_term(
            recording_id,
            leadership_term_id,
            log_position,
            now_ms,
        )?;

        self.join_services(leadership_term_id, log_position, log_session_id)?;

        for session in self.sessions.values_mut() {
            if session.state() != SessionState::Closed {
                session.connect(&self.ctx.transport);
                session.set_time_of_last_activity_ms(now_ms);
                session.set_new_leader_event_pending(true);
            }
        }

        self.set_role(Role::Leader);
        info!(
            "member {} leading term {} from {}",
            self.member_id, leadership_term_id, log_position
        );
        Ok(log_session_id)
    }

    /// Follower-side transition: log subscription + remote recording, then
    /// service join at the given position.
    pub(crate) fn follower_prepare(
        &mut self,
        leadership_term_id: i64,
        join_position: i64,
        log_session_id: i32,
    ) -> Result<(), ClusterError> {
        self.prepare_for_new_leadership(join_position)?;
        self.close_existing_log();
        self.leadership_term_id = leadership_term_id;

        let channel = format!("mem:{}", self.this_member.log_endpoint);
        let subscription = self.ctx.transport.add_subscription(&channel, self.ctx.log_stream_id);
        self.log_adapter = Some(LogAdapter::new(subscription, log_session_id, join_position));

        let recording_channel = format!(
            "mem:{}?session-id={}",
            self.this_member.log_endpoint, log_session_id
        );
        let recording_id = self.start_log_recording(&recording_channel, SourceLocation::Remote)?;
        self.appended_position = Some(self.archive.recording_position_counter(recording_id)?);
        self.last_appended_position = join_position;
        self.follower_commit_position = join_position;

        self.append_dynamic_join_term_and_snapshots()?;
        self.join_services(leadership_term_id, join_position, log_session_id)?;
        self.set_role(Role::Follower);
        Ok(())
    }

    /// Leaving the old term behind: stop recording, truncate anything
    /// recorded beyond the new term base and drop sessions opened past it.
    /// Applies to a deposed leader and to a follower whose uncommitted tail
    /// exceeds the agreed base alike.
    fn prepare_for_new_leadership(&mut self, log_position: i64) -> Result<(), ClusterError> {
        if let Some(channel) = self.log_recording_channel.take() {
            self.archive.stop_recording(&channel, self.ctx.log_stream_id)?;
        }

        if self.log_recording_id != NULL_VALUE {
            let stop_position = self.archive.get_stop_position(self.log_recording_id)?;
            if stop_position > log_position {
                self.archive.truncate_recording(self.log_recording_id, log_position)?;
            }
        }

        self.last_appended_position = log_position;
        self.follower_commit_position = log_position;
        self.commit_position.propose_max_ordered(log_position);
        self.clear_sessions_after(log_position);
        Ok(())
    }

    fn clear_sessions_after(&mut self, log_position: i64) {
        let stale: Vec<i64> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.opened_log_position() > log_position)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(mut session) = self.sessions.remove(&id) {
                session.close(CloseReason::ServiceAction);
            }
        }
        for session in self.pending_sessions.iter_mut() {
            session.close(CloseReason::ServiceAction);
        }
        self.pending_sessions.clear();
    }

    fn close_existing_log(&mut self) {
        self.log_publisher.disconnect();
        self.log_adapter = None;
    }

    fn start_log_recording(
        &mut self,
        channel: &str,
        source: SourceLocation,
    ) -> Result<i64, ClusterError> {
        let recording_id = match self.recording_log().find_last_term_recording_id() {
            id if id == NULL_VALUE => {
                self.archive
                    .start_recording(channel, self.ctx.log_stream_id, source)?
            }
            id => {
                self.archive
                    .extend_recording(id, channel, self.ctx.log_stream_id, source)?;
                id
            }
        };
        self.log_recording_id = recording_id;
        self.log_recording_channel = Some(channel.to_string());
        Ok(recording_id)
    }

    fn join_services(
        &mut self,
        leadership_term_id: i64,
        log_position: i64,
        log_session_id: i32,
    ) -> Result<(), ClusterError> {
        let channel = format!("mem:{}", self.this_member.log_endpoint);
        loop {
            let sent = self.service_proxy.join_log(
                leadership_term_id,
                log_position,
                i64::MAX,
                self.member_id,
                log_session_id,
                self.ctx.log_stream_id,
                &channel,
            );
            if sent {
                break;
            }
            self.idle(0)?;
        }

        self.expected_ack_position = log_position;
        self.await_service_acks(log_position)
    }

    /// Finishes the election on this member: baseline positions, sweep the
    /// service-message ring and (on the leader) append the term event.
    pub(crate) fn election_complete(
        &mut self,
        is_leader: bool,
        base_position: i64,
        now_ms: i64,
    ) -> bool {
        let log_service_session_id = self.log_service_session_id;
        self.pending_service_messages.consume(
            |message| message.cluster_session_id <= log_service_session_id,
            usize::MAX,
        );

        if is_leader {
            self.cluster_time(now_ms);
            let appended = self.log_publisher.append_new_leadership_term_event(
                self.leadership_term_id,
                base_position,
                self.cluster_time_ms,
                self.member_id,
                self.log_publisher.session_id(),
            );
            if !appended {
                return false;
            }
            self.time_of_last_log_update_ms = now_ms - self.ctx.leader_heartbeat_interval_ms();
        } else {
            self.follower_commit_position = self.follower_commit_position.max(base_position);
            self.time_of_last_log_update_ms = now_ms;
            self.time_of_last_append_position_ms = now_ms;
        }
        self.commit_position.propose_max_ordered(base_position);

        let ingress_channel = format!("mem:{}", self.this_member.client_facing_endpoint);
        let subscription = self
            .ctx
            .transport
            .add_subscription(&ingress_channel, self.ctx.ingress_stream_id);
        self.ingress_adapter.connect(subscription);

        debug!(
            "member {} completed election for term {} as {:?}",
            self.member_id, self.leadership_term_id, self.role
        );
        true
    }

    /// Follower catch-up: consume the merged replay/live image, committing
    /// as appended, and keep the leader posted on progress.
    pub(crate) fn catchup_poll(&mut self, now_ms: i64) -> Result<usize, ClusterError> {
        let Some(mut adapter) = self.log_adapter.take() else {
            return Ok(0);
        };

        let count = adapter.poll(i64::MAX, MESSAGE_LIMIT, |record, position| {
            self.on_replay_record(record, position)
        });
        let position = adapter.position();
        let closed = count == 0 && adapter.is_image_closed();
        self.log_adapter = Some(adapter);

        if closed {
            return Err(ClusterError::ImageClosedInReplay(position));
        }

        let appended = self.appended_value();
        self.commit_position.propose_max_ordered(appended);

        if appended != self.last_appended_position
            || now_ms
                >= self.time_of_last_append_position_ms + self.ctx.leader_heartbeat_interval_ms()
        {
            let message = PeerMessage::AppendedPosition {
                leadership_term_id: self.leadership_term_id,
                log_position: appended,
                follower_member_id: self.member_id,
            };
            if self.publish_to_member(self.leader_member_id, &message) {
                self.last_appended_position = appended;
                self.time_of_last_append_position_ms = now_ms;
            }
        }

        Ok(count)
    }

    pub(crate) fn this_member_endpoints(&self) -> String {
        self.this_member.encode_endpoints()
    }

    pub(crate) fn this_member_transfer_endpoint(&self) -> String {
        self.this_member.transfer_endpoint.clone()
    }

    //
    // Recovery, replay and snapshotting.
    //

    fn recording_log(&self) -> MutexGuard<'_, RecordingLog> {
        self.ctx.recording_log.lock().unwrap()
    }

    fn add_recovery_state_counter(&mut self) -> Counter {
        let plan = &self.recovery_plan;
        let mut key = vec![
            plan.last_leadership_term_id,
            plan.snapshots.first().map_or(0, |snapshot| snapshot.log_position),
            plan.snapshots.first().map_or(0, |snapshot| snapshot.timestamp_ms),
            plan.has_replay() as i64,
        ];
        for snapshot in &plan.snapshots {
            if snapshot.service_id != MODULE_SERVICE_ID {
                key.push(snapshot.recording_id);
            }
        }

        let counter = self
            .ctx
            .counters
            .allocate(RECOVERY_STATE_TYPE_ID, "cluster-recovery", &key);
        counter.set_ordered(1);
        counter
    }

    fn recover_from_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), ClusterError> {
        info!(
            "recovering from snapshot at {} of term {}",
            snapshot.log_position, snapshot.leadership_term_id
        );
        self.cluster_time(snapshot.timestamp_ms);
        self.expected_ack_position = snapshot.log_position;
        self.leadership_term_id = snapshot.leadership_term_id;

        let session_id = self.ctx.transport.next_correlation_id() as i32;
        let channel = ChannelUri::with_session_id(&self.ctx.replay_channel, session_id);
        let subscription = self
            .ctx
            .transport
            .add_subscription(&channel, self.ctx.replay_stream_id);
        let replay_id = self.archive.start_replay(
            snapshot.recording_id,
            0,
            -1,
            &channel,
            self.ctx.replay_stream_id,
        )?;

        let mut loader = SnapshotLoader::new(subscription, session_id);
        while !loader.is_done() {
            let mut records = Vec::new();
            let fragments = loader.poll(|record| records.push(record))?;
            for record in records {
                self.apply_snapshot_record(record);
            }
            if fragments == 0 {
                if loader.is_image_closed() {
                    self.archive.stop_replay(replay_id);
                    return Err(ClusterError::SnapshotLoad("image closed".to_string()));
                }
                self.idle(0)?;
            }
        }

        self.archive.stop_replay(replay_id);
        Ok(())
    }

    fn apply_snapshot_record(&mut self, record: SnapshotRecord) {
        match record {
            SnapshotRecord::Marker { .. } => {}
            SnapshotRecord::ModuleState {
                next_session_id,
                next_service_session_id,
                log_service_session_id,
                pending_message_capacity,
            } => {
                self.next_session_id = next_session_id;
                self.next_service_session_id = next_service_session_id;
                self.log_service_session_id = log_service_session_id;
                self.pending_service_messages
                    .reset(pending_message_capacity as usize);
            }
            SnapshotRecord::ClusterMembers {
                member_id,
                high_member_id,
                cluster_members,
            } => self.on_reload_cluster_members(member_id, high_member_id, &cluster_members),
            SnapshotRecord::Session {
                cluster_session_id,
                correlation_id,
                opened_log_position,
                time_of_last_activity_ms,
                close_reason,
                response_stream_id,
                response_channel,
            } => {
                let session = ClusterSession::restore(
                    cluster_session_id,
                    correlation_id,
                    opened_log_position,
                    time_of_last_activity_ms,
                    response_stream_id,
                    &response_channel,
                    close_reason,
                );
                self.sessions.insert(cluster_session_id, session);
                if cluster_session_id >= self.next_session_id {
                    self.next_session_id = cluster_session_id + 1;
                }
            }
            SnapshotRecord::Timer {
                correlation_id,
                deadline_ms,
            } => self.timers.schedule(correlation_id, deadline_ms),
            SnapshotRecord::PendingMessage {
                cluster_session_id,
                payload,
            } => self.pending_service_messages.append(cluster_session_id, payload),
        }
    }

    fn on_reload_cluster_members(&mut self, member_id: i32, high_member_id: i32, members: &str) {
        if self.ctx.cluster_members_ignore_snapshot || self.dynamic_join.is_some() {
            return;
        }

        if self.member_id == NULL_MEMBER_ID {
            self.member_id = member_id;
            self.this_member.id = member_id;
        }

        if self.cluster_members.is_empty() {
            match ClusterMember::parse(members) {
                Ok(mut parsed) => {
                    add_status_publications(
                        &mut parsed,
                        self.member_id,
                        &self.ctx.transport,
                        self.ctx.member_status_stream_id,
                    );
                    self.cluster_members = parsed;
                    self.high_member_id = high_member_id
                        .max(ClusterMember::high_member_id(&self.cluster_members));
                }
                Err(err) => self.counted_error(err),
            }
        } else {
            self.high_member_id = self.high_member_id.max(high_member_id);
        }
    }

    /// Replays the recovery-plan tail to the hosted services (and through
    /// this module) before a term transition.
    pub(crate) fn replay_tail_to_services(&mut self) -> Result<(), ClusterError> {
        let Some(tail) = self.recovery_plan.log.clone() else {
            return Ok(());
        };
        if !self.recovery_plan.has_replay() {
            return Ok(());
        }

        let start_position = tail.start_position;
        let stop_position = tail.stop_position;
        info!(
            "replaying log tail [{}, {}) of term {}",
            start_position, stop_position, tail.leadership_term_id
        );

        let session_id = self.ctx.transport.next_correlation_id() as i32;
        let channel = ChannelUri::with_session_id(&self.ctx.replay_channel, session_id);
        let subscription = self
            .ctx
            .transport
            .add_subscription(&channel, self.ctx.log_stream_id);
        let mut adapter = LogAdapter::new(subscription, session_id, start_position);

        loop {
            let sent = self.service_proxy.join_log(
                tail.leadership_term_id,
                start_position,
                stop_position,
                self.member_id,
                session_id,
                self.ctx.log_stream_id,
                &channel,
            );
            if sent {
                break;
            }
            self.idle(0)?;
        }
        self.expected_ack_position = start_position;
        self.await_service_acks(start_position)?;

        let replay_id = self.archive.start_replay(
            tail.recording_id,
            start_position,
            stop_position - start_position,
            &channel,
            self.ctx.log_stream_id,
        )?;

        while adapter.position() < stop_position {
            let count = adapter.poll(stop_position, MESSAGE_LIMIT, |record, position| {
                self.on_replay_record(record, position)
            });
            self.commit_position.propose_max_ordered(adapter.position());
            self.poll_service_adapter();
            self.idle(count)?;
        }
        self.archive.stop_replay(replay_id);

        self.expected_ack_position = stop_position;
        self.await_service_acks(stop_position)?;

        // Timers due within replayed time fire without appending; the log
        // already carries their events.
        let cluster_time_ms = self.cluster_time_ms;
        self.timers.poll(cluster_time_ms, |_| true);

        self.leadership_term_id = tail.leadership_term_id;
        Ok(())
    }

    fn take_snapshot(&mut self, timestamp_ms: i64, log_position: i64) -> Result<(), ClusterError> {
        let session_id = self.ctx.transport.next_correlation_id() as i32;
        let channel = ChannelUri::with_session_id(&self.ctx.snapshot_channel, session_id);
        let publication = self
            .ctx
            .transport
            .add_publication(&channel, self.ctx.snapshot_stream_id);
        let recording_id =
            self.archive
                .start_recording(&channel, self.ctx.snapshot_stream_id, SourceLocation::Local)?;

        let term_base_log_position = self
            .recording_log()
            .get_term_entry(self.leadership_term_id)?
            .term_base_log_position;

        let result = self.snapshot_state(&publication, log_position, timestamp_ms);
        self.archive.stop_recording(&channel, self.ctx.snapshot_stream_id)?;
        publication.close();
        result?;

        {
            let mut recording_log = self.recording_log();
            for service_id in (0..self.service_acks.len() as i32).rev() {
                let snapshot_recording_id = self.service_acks[service_id as usize].relevant_id;
                recording_log.append_snapshot(
                    snapshot_recording_id,
                    self.leadership_term_id,
                    term_base_log_position,
                    log_position,
                    timestamp_ms,
                    service_id,
                );
            }
            recording_log.append_snapshot(
                recording_id,
                self.leadership_term_id,
                term_base_log_position,
                log_position,
                timestamp_ms,
                MODULE_SERVICE_ID,
            );
        }

        let recovery_plan = self
            .recording_log()
            .create_recovery_plan(&self.archive, self.ctx.service_count);
        self.recovery_plan = recovery_plan;
        self.ctx.snapshot_counter.increment_ordered();
        info!("snapshot taken at {} into recording {}", log_position, recording_id);
        Ok(())
    }

    fn snapshot_state(
        &mut self,
        publication: &Publication,
        log_position: i64,
        timestamp_ms: i64,
    ) -> Result<(), ClusterError> {
        let interrupt = self.ctx.interrupt_flag();
        let invoker = &mut self.ctx.invoker;
        let idle = || -> Result<(), ClusterError> {
            if interrupt.load(Ordering::Acquire) {
                return Err(ClusterError::Interrupted("snapshot"));
            }
            if let Some(invoke) = invoker.as_mut() {
                invoke();
            }
            Ok(())
        };
        let mut taker = SnapshotTaker::new(publication, idle);

        taker.mark_begin(log_position, self.leadership_term_id, timestamp_ms)?;
        taker.snapshot(SnapshotRecord::ModuleState {
            next_session_id: self.next_session_id,
            next_service_session_id: self.next_service_session_id,
            log_service_session_id: self.log_service_session_id,
            pending_message_capacity: self.pending_service_messages.size() as i64,
        })?;
        taker.snapshot(SnapshotRecord::ClusterMembers {
            member_id: self.member_id,
            high_member_id: self.high_member_id,
            cluster_members: ClusterMember::encode_as_string(&self.cluster_members),
        })?;

        for session in self.sessions.values() {
            if matches!(session.state(), SessionState::Open | SessionState::Closed) {
                taker.snapshot(SnapshotRecord::Session {
                    cluster_session_id: session.id(),
                    correlation_id: session.correlation_id(),
                    opened_log_position: session.opened_log_position(),
                    time_of_last_activity_ms: session.time_of_last_activity_ms(),
                    close_reason: session.close_reason(),
                    response_stream_id: session.response_stream_id(),
                    response_channel: session.response_channel().to_string(),
                })?;
            }
        }

        let mut timer_records = Vec::new();
        self.timers.snapshot(|correlation_id, deadline_ms| {
            timer_records.push(SnapshotRecord::Timer {
                correlation_id,
                deadline_ms,
            });
        });
        for record in timer_records {
            taker.snapshot(record)?;
        }

        let pending_records: Vec<SnapshotRecord> = self
            .pending_service_messages
            .iter()
            .map(|message| SnapshotRecord::PendingMessage {
                cluster_session_id: message.cluster_session_id,
                payload: message.payload.clone(),
            })
            .collect();
        for record in pending_records {
            taker.snapshot(record)?;
        }

        taker.mark_end(log_position, self.leadership_term_id, timestamp_ms)
    }

    //
    // Dynamic join support.
    //

    pub(crate) fn retrieved_snapshot(&mut self, local_recording_id: i64, snapshot: &Snapshot) {
        self.dynamic_join_snapshots.push(Snapshot {
            recording_id: local_recording_id,
            leadership_term_id: snapshot.leadership_term_id,
            term_base_log_position: snapshot.term_base_log_position,
            log_position: snapshot.log_position,
            timestamp_ms: snapshot.timestamp_ms,
            service_id: snapshot.service_id,
        });
    }

    pub(crate) fn load_snapshots_from_dynamic_join(&mut self) -> Result<(), ClusterError> {
        self.recovery_plan =
            RecordingLog::create_recovery_plan_from_snapshots(&self.dynamic_join_snapshots);
        let recovery_counter = self.add_recovery_state_counter();

        if let Some(snapshot) = self.recovery_plan.snapshots.first().cloned() {
            self.recover_from_snapshot(&snapshot)?;
        }
        let expected = self.expected_ack_position;
        self.await_service_acks(expected)?;
        self.ctx.counters.remove(&recovery_counter);

        if self.state != ModuleState::Suspended {
            self.module_state(ModuleState::Active);
        }
        self.leadership_term_id = self.recovery_plan.last_leadership_term_id;
        self.last_appended_position = self.recovery_plan.appended_log_position;
        Ok(())
    }

    fn append_dynamic_join_term_and_snapshots(&mut self) -> Result<(), ClusterError> {
        if self.dynamic_join_snapshots.is_empty() {
            return Ok(());
        }

        let recording_id = self.log_recording_id;
        let snapshots = std::mem::take(&mut self.dynamic_join_snapshots);
        let last = snapshots.last().expect("non-empty snapshots");

        let mut recording_log = self.recording_log();
        recording_log.append_term(
            recording_id,
            last.leadership_term_id,
            last.term_base_log_position,
            last.timestamp_ms,
        )?;
        for snapshot in &snapshots {
            recording_log.append_snapshot(
                snapshot.recording_id,
                snapshot.leadership_term_id,
                snapshot.term_base_log_position,
                snapshot.log_position,
                snapshot.timestamp_ms,
                snapshot.service_id,
            );
        }
        Ok(())
    }

    fn dynamic_join_complete(&mut self, join: &DynamicJoin) {
        if self.cluster_members.is_empty() {
            match ClusterMember::parse(&join.cluster_members_string) {
                Ok(members) => self.cluster_members = members,
                Err(err) => {
                    self.counted_error(err);
                    return;
                }
            }
        }

        if self.member_id == NULL_MEMBER_ID {
            self.member_id = join.member_id;
            self.this_member.id = join.member_id;
        }
        self.high_member_id = self
            .high_member_id
            .max(ClusterMember::high_member_id(&self.cluster_members))
            .max(self.member_id);
        self.leader_member_id = join.leader_member_id;

        add_status_publications(
            &mut self.cluster_members,
            self.member_id,
            &self.ctx.transport,
            self.ctx.member_status_stream_id,
        );

        info!("dynamic join complete for member {}", self.member_id);
        self.election = Some(Election::new(
            true,
            self.leadership_term_id,
            self.recovery_plan.appended_log_position,
        ));
    }

    //
    // Bounded waits.
    //

    fn idle(&mut self, work_count: usize) -> Result<(), ClusterError> {
        if self.ctx.is_interrupted() {
            return Err(ClusterError::Interrupted("idle"));
        }
        if work_count == 0 {
            if let Some(invoker) = self.ctx.invoker.as_mut() {
                invoker();
            }
        }
        Ok(())
    }

    fn await_service_acks(&mut self, log_position: i64) -> Result<(), ClusterError> {
        while !ServiceAck::has_reached_position(
            log_position,
            self.service_ack_id,
            &self.service_acks,
        ) {
            let work_count = self.poll_service_adapter();
            self.idle(work_count)?;
        }
        self.service_ack_id += 1;
        Ok(())
    }

    //
    // State publication.
    //

    fn module_state(&mut self, new_state: ModuleState) {
        if self.state != new_state {
            debug!(
                "member {} state {:?} -> {:?}",
                self.member_id, self.state, new_state
            );
        }
        self.state = new_state;
        self.ctx.module_state.set_ordered(new_state.code());
    }

    fn set_role(&mut self, new_role: Role) {
        if self.role != new_role {
            info!(
                "member {} role {:?} -> {:?}",
                self.member_id, self.role, new_role
            );
        }
        self.role = new_role;
        self.ctx.cluster_role.set_ordered(new_role.code());
    }

    fn cluster_time(&mut self, timestamp_ms: i64) {
        if timestamp_ms > self.cluster_time_ms {
            self.cluster_time_ms = timestamp_ms;
        }
    }
}

fn state_name(state: ModuleState) -> &'static str {
    match state {
        ModuleState::Init => "Init",
        ModuleState::Active => "Active",
        ModuleState::Suspended => "Suspended",
        ModuleState::Snapshot => "Snapshot",
        ModuleState::Leaving => "Leaving",
        ModuleState::Terminating => "Terminating",
        ModuleState::Closed => "Closed",
    }
}

impl stream::Agent for ConsensusModuleAgent {
    fn on_start(&mut self) {
        let now_ms = stream::conductor::epoch_ms();
        if let Err(err) = ConsensusModuleAgent::on_start(self, now_ms) {
            self.on_fatal(err);
        }
    }

    fn do_work(&mut self, now_ms: i64) -> usize {
        if self.state == ModuleState::Closed {
            return 0;
        }
        ConsensusModuleAgent::do_work(self, now_ms)
    }

    fn on_close(&mut self) {
        ConsensusModuleAgent::on_close(self);
    }

    fn role_name(&self) -> &'static str {
        "consensus-module"
    }
}
