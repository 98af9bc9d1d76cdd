#![allow(dead_code)]

//! Deterministic in-process cluster for integration scenarios.
//!
//! All members share one transport and archive. The harness ticks every
//! agent and its hosted service in lock-step with a millisecond clock it
//! controls, so runs are reproducible and failures replayable.

use std::cell::RefCell;
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};

use cluster::agent::{ConsensusModuleAgent, ModuleState};
use cluster::codec::client::{EgressEvent, IngressRequest};
use cluster::codec::log::{ChangeType, ClusterAction, LogRecord};
use cluster::codec::service::{FromServiceMessage, ToServiceMessage};
use cluster::config::{Context, ToggleState};
use cluster::recording::RecordingLog;
use cluster::session::{EventCode, PROTOCOL_SEMANTIC_VERSION};
use cluster::{ClusterMember, NULL_MEMBER_ID, NULL_VALUE, RECOVERY_STATE_TYPE_ID};
use stream::{
    Action, Archive, Counter, Counters, Publication, SourceLocation, Subscription, Transport,
    NULL_POSITION,
};

pub const RESPONSE_STREAM_ID: i32 = 110;
pub const START_TIME_MS: i64 = 1_000_000;
pub const MAX_TICKS: i64 = 60_000;

pub const SESSION_TIMEOUT_MS: i64 = 500;
pub const LEADER_HEARTBEAT_INTERVAL_MS: i64 = 10;
pub const LEADER_HEARTBEAT_TIMEOUT_MS: i64 = 100;
pub const ELECTION_TIMEOUT_MS: i64 = 200;
pub const TERMINATION_TIMEOUT_MS: i64 = 1_000;

const MS: i64 = 1_000_000; // ns per ms

pub struct TestCluster {
    pub transport: Transport,
    pub archive: Archive,
    pub members: Vec<Option<TestMember>>,
    recording_logs: Vec<Arc<Mutex<RecordingLog>>>,
    members_string: String,
    appointed_leader_id: i32,
    pub time_ms: i64,
}

pub struct TestMember {
    pub agent: ConsensusModuleAgent,
    pub service: Arc<Mutex<TestService>>,
    pub control_toggle: Counter,
    pub commit_position: Counter,
    pub module_state: Counter,
    pub snapshot_counter: Counter,
    pub timed_out_clients: Counter,
    pub error_counter: Counter,
}

impl TestMember {
    pub fn state(&self) -> ModuleState {
        self.agent.state()
    }

    pub fn service_messages(&self) -> Vec<Vec<u8>> {
        self.service.lock().unwrap().messages.clone()
    }

    pub fn service_message_count(&self) -> usize {
        self.service.lock().unwrap().messages.len()
    }
}

pub fn client_endpoint(member_id: i32) -> String {
    format!("member-{}-client", member_id)
}

fn member_entry(member_id: i32) -> String {
    format!(
        "{0},member-{0}-client,member-{0}-status,member-{0}-log,member-{0}-transfer,member-{0}-archive",
        member_id
    )
}

pub fn members_string(size: usize) -> String {
    (0..size as i32)
        .map(member_entry)
        .collect::<Vec<_>>()
        .join("|")
}

impl TestCluster {
    pub fn new(size: usize, appointed_leader_id: i32) -> Self {
        TestLogger::init();
        let transport = Transport::new();
        let archive = Archive::connect(&transport);
        let members_string = members_string(size);

        let mut cluster = Self {
            transport,
            archive,
            members: Vec::new(),
            recording_logs: (0..size).map(|_| Arc::new(Mutex::new(RecordingLog::new()))).collect(),
            members_string,
            appointed_leader_id,
            time_ms: START_TIME_MS,
        };

        for member_id in 0..size as i32 {
            let member = cluster.build_member(member_id, false);
            cluster.members.push(Some(member));
        }
        cluster
    }

    fn build_member(&mut self, member_id: i32, dynamic: bool) -> TestMember {
        let mut ctx = Context::new(self.transport.clone(), member_id).service_count(1);

        if dynamic {
            ctx.cluster_members = String::new();
            ctx.cluster_members_status_endpoints = (0..self.recording_logs.len() as i32 - 1)
                .map(|id| format!("member-{}-status", id))
                .collect::<Vec<_>>()
                .join(",");
            ctx.member_endpoints = member_entry(member_id)
                .splitn(2, ',')
                .nth(1)
                .expect("endpoints")
                .to_string();
        } else {
            ctx.cluster_members = self.members_string.clone();
        }
        ctx.appointed_leader_id = self.appointed_leader_id;
        ctx.session_timeout_ns = SESSION_TIMEOUT_MS * MS;
        ctx.leader_heartbeat_interval_ns = LEADER_HEARTBEAT_INTERVAL_MS * MS;
        ctx.leader_heartbeat_timeout_ns = LEADER_HEARTBEAT_TIMEOUT_MS * MS;
        ctx.election_timeout_ns = ELECTION_TIMEOUT_MS * MS;
        ctx.election_status_interval_ns = 5 * MS;
        ctx.termination_timeout_ns = TERMINATION_TIMEOUT_MS * MS;
        ctx.recording_log = Arc::clone(&self.recording_logs[member_id as usize]);

        let service = Arc::new(Mutex::new(TestService::new(
            member_id,
            &self.transport,
            &self.archive,
            ctx.counters.clone(),
            ctx.service_heartbeats[0].clone(),
            ctx.commit_position.clone(),
            &ctx.service_control_channel,
            ctx.service_stream_id,
            ctx.consensus_module_stream_id,
        )));

        let invoker_service = Arc::clone(&service);
        ctx.invoker = Some(Box::new(move || invoker_service.lock().unwrap().do_work()));

        let control_toggle = ctx.control_toggle.clone();
        let commit_position = ctx.commit_position.clone();
        let module_state = ctx.module_state.clone();
        let snapshot_counter = ctx.snapshot_counter.clone();
        let timed_out_clients = ctx.timed_out_client_counter.clone();
        let error_counter = ctx.error_counter.clone();

        service.lock().unwrap().set_now(self.time_ms);
        let agent = ConsensusModuleAgent::new(ctx).expect("member context");

        TestMember {
            agent,
            service,
            control_toggle,
            commit_position,
            module_state,
            snapshot_counter,
            timed_out_clients,
            error_counter,
        }
    }

    pub fn start(&mut self) {
        for index in 0..self.members.len() {
            TestLogger::set_member(Some(index as i32));
            let time_ms = self.time_ms;
            if let Some(member) = self.members[index].as_mut() {
                member.agent.on_start(time_ms).expect("member start");
            }
        }
        TestLogger::set_member(None);
    }

    /// Starts a dynamic joiner discovering the cluster via status endpoints.
    pub fn add_dynamic_member(&mut self) -> usize {
        let member_id = self.recording_logs.len() as i32;
        self.recording_logs.push(Arc::new(Mutex::new(RecordingLog::new())));
        let mut member = self.build_member(member_id, true);
        member.agent.on_start(self.time_ms).expect("joiner start");
        self.members.push(Some(member));
        self.members.len() - 1
    }

    pub fn tick(&mut self) {
        self.time_ms += 1;
        TestLogger::set_tick(Some(self.time_ms - START_TIME_MS));

        for index in 0..self.members.len() {
            TestLogger::set_member(Some(index as i32));
            let time_ms = self.time_ms;
            if let Some(member) = self.members[index].as_mut() {
                member.service.lock().unwrap().set_now(time_ms);
                member.agent.do_work(time_ms);
                member.service.lock().unwrap().do_work();
            }
        }
        TestLogger::set_member(None);
    }

    pub fn run_for(&mut self, ticks: i64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    pub fn run_until(&mut self, description: &str, mut predicate: impl FnMut(&TestCluster) -> bool) {
        let mut remaining = MAX_TICKS;
        while !predicate(self) {
            assert!(
                remaining > 0,
                "condition not reached within {} ticks: {}",
                MAX_TICKS,
                description
            );
            remaining -= 1;
            self.tick();
        }
    }

    pub fn member(&self, index: usize) -> &TestMember {
        self.members[index].as_ref().expect("member running")
    }

    pub fn member_mut(&mut self, index: usize) -> &mut TestMember {
        self.members[index].as_mut().expect("member running")
    }

    pub fn leader_index(&self) -> Option<usize> {
        self.members.iter().position(|member| {
            member
                .as_ref()
                .map_or(false, |m| m.agent.is_leader() && !m.agent.in_election())
        })
    }

    pub fn has_settled_leader(&self) -> bool {
        self.leader_index().map_or(false, |index| {
            self.member(index).state() == ModuleState::Active
        })
    }

    pub fn running_members(&self) -> impl Iterator<Item = &TestMember> {
        self.members.iter().filter_map(Option::as_ref)
    }

    pub fn stop_member(&mut self, index: usize) {
        self.members[index] = None;
    }

    pub fn stop_all(&mut self) {
        for member in self.members.iter_mut() {
            *member = None;
        }
    }

    pub fn restart_member(&mut self, index: usize) {
        let mut member = self.build_member(index as i32, false);
        member.agent.on_start(self.time_ms).expect("member restart");
        self.members[index] = Some(member);
    }

    pub fn restart_all(&mut self) {
        for index in 0..self.members.len() {
            self.restart_member(index);
        }
    }

    pub fn set_control_toggle(&mut self, index: usize, toggle: ToggleState) {
        self.member(index).control_toggle.set_ordered(toggle.code());
    }

    pub fn await_leader(&mut self) -> usize {
        self.run_until("leader elected", |cluster| cluster.has_settled_leader());
        self.leader_index().expect("leader present")
    }
}

//
// Hosted service container for tests.
//

struct ServiceLog {
    subscription: Subscription,
    log_session_id: i32,
    position: i64,
    max_position: i64,
    end_acked: bool,
}

pub struct TestService {
    member_index: i32,
    transport: Transport,
    archive: Archive,
    counters: Counters,
    heartbeat: Counter,
    commit_position: Counter,
    control_subscription: Subscription,
    control_publication: Publication,
    now_ms: i64,
    ack_id: i64,
    recovery_acked: bool,
    member_id: i32,
    leadership_term_id: i64,
    log: Option<ServiceLog>,
    termination_position: i64,
    pub messages: Vec<Vec<u8>>,
    pub was_snapshot_loaded: bool,
    pub snapshots_taken: usize,
    pub terminated: bool,
    pub election_events: usize,
}

impl TestService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        member_index: i32,
        transport: &Transport,
        archive: &Archive,
        counters: Counters,
        heartbeat: Counter,
        commit_position: Counter,
        control_channel: &str,
        to_service_stream_id: i32,
        to_module_stream_id: i32,
    ) -> Self {
        Self {
            member_index,
            transport: transport.clone(),
            archive: archive.clone(),
            counters,
            heartbeat,
            commit_position,
            control_subscription: transport.add_subscription(control_channel, to_service_stream_id),
            control_publication: transport.add_publication(control_channel, to_module_stream_id),
            now_ms: 0,
            ack_id: 0,
            recovery_acked: false,
            member_id: NULL_MEMBER_ID,
            leadership_term_id: NULL_VALUE,
            log: None,
            termination_position: NULL_POSITION,
            messages: Vec::new(),
            was_snapshot_loaded: false,
            snapshots_taken: 0,
            terminated: false,
            election_events: 0,
        }
    }

    pub fn set_now(&mut self, now_ms: i64) {
        self.now_ms = now_ms;
    }

    pub fn send_service_message(&mut self, payload: &[u8]) -> bool {
        let message = FromServiceMessage::ServiceMessage {
            leadership_term_id: self.leadership_term_id,
            payload: Bytes::copy_from_slice(payload),
        };
        self.control_publication.offer(&message.encode()) > 0
    }

    pub fn do_work(&mut self) -> usize {
        self.heartbeat.set_ordered(self.now_ms);

        let mut work_count = self.poll_control();
        if !self.recovery_acked {
            work_count += self.check_recovery_state();
        }
        work_count += self.poll_log();
        work_count
    }

    fn poll_control(&mut self) -> usize {
        let mut messages = Vec::new();
        let count = self.control_subscription.poll(
            |_, _, payload| {
                if let Ok(message) = ToServiceMessage::decode(payload) {
                    messages.push(message);
                }
                Action::Continue
            },
            16,
        );

        for message in messages {
            match message {
                ToServiceMessage::JoinLog {
                    leadership_term_id,
                    log_position,
                    max_log_position,
                    member_id,
                    log_session_id,
                    log_stream_id,
                    log_channel,
                } => {
                    self.leadership_term_id = leadership_term_id;
                    self.member_id = member_id;
                    let subscription =
                        self.transport.add_subscription(&log_channel, log_stream_id);
                    self.log = Some(ServiceLog {
                        subscription,
                        log_session_id,
                        position: log_position,
                        max_position: max_log_position,
                        end_acked: false,
                    });
                    self.ack(log_position, NULL_VALUE);
                }
                ToServiceMessage::TerminationPosition { log_position } => {
                    self.termination_position = log_position;
                    self.check_termination();
                }
                ToServiceMessage::ElectionStartEvent { .. } => self.election_events += 1,
                ToServiceMessage::ClusterMembersResponse { .. } => {}
            }
        }
        count
    }

    /// Boot handshake: load our snapshot if the recovery plan names one,
    /// then acknowledge the expected position.
    fn check_recovery_state(&mut self) -> usize {
        let Some((key, _)) = self.counters.find_by_type_id(RECOVERY_STATE_TYPE_ID) else {
            return 0;
        };

        let snapshot_position = key.get(1).copied().unwrap_or(0);
        if let Some(recording_id) = key.get(4).copied() {
            if snapshot_position > 0 {
                self.load_snapshot(recording_id);
            }
        }
        self.ack(snapshot_position.max(0), NULL_VALUE);
        self.recovery_acked = true;
        1
    }

    fn poll_log(&mut self) -> usize {
        let Some(mut log) = self.log.take() else { return 0 };

        let bound = self.commit_position.get();
        let mut records = Vec::new();
        let expected_session = log.log_session_id;
        let position = &mut log.position;

        let count = log.subscription.poll(
            |session_id, end_position, payload| {
                if session_id != expected_session {
                    return Action::Continue;
                }
                if end_position > bound {
                    return Action::Abort;
                }
                if let Ok(record) = LogRecord::decode(payload) {
                    records.push((record, end_position));
                }
                *position = end_position;
                Action::Continue
            },
            64,
        );

        self.log = Some(log);
        for (record, end_position) in records {
            self.on_log_record(record, end_position);
        }
        self.check_replay_end();
        self.check_termination();
        count
    }

    fn on_log_record(&mut self, record: LogRecord, end_position: i64) {
        match record {
            LogRecord::Message { payload, .. } => self.messages.push(payload.to_vec()),
            LogRecord::ClusterAction { action, log_position, .. } => {
                if action == ClusterAction::Snapshot {
                    let recording_id = self.take_snapshot();
                    self.ack(log_position, recording_id);
                    self.snapshots_taken += 1;
                }
            }
            LogRecord::NewLeadershipTermEvent {
                leadership_term_id, ..
            } => self.leadership_term_id = leadership_term_id,
            LogRecord::MembershipChangeEvent {
                change_type,
                member_id,
                ..
            } => {
                if change_type == ChangeType::Quit && member_id == self.member_id {
                    self.ack(end_position, NULL_VALUE);
                }
            }
            _ => {}
        }
    }

    fn check_replay_end(&mut self) {
        let Some(log) = self.log.as_mut() else { return };
        if log.max_position != i64::MAX && !log.end_acked && log.position >= log.max_position {
            log.end_acked = true;
            let position = log.max_position;
            let ack_id = self.ack_id;
            self.ack_id += 1;
            let message = FromServiceMessage::ServiceAck {
                log_position: position,
                ack_id,
                relevant_id: NULL_VALUE,
                service_id: 0,
            };
            self.control_publication.offer(&message.encode());
        }
    }

    fn check_termination(&mut self) {
        if self.terminated || self.termination_position == NULL_POSITION {
            return;
        }
        let position = self.log.as_ref().map_or(0, |log| log.position);
        if position >= self.termination_position {
            let termination_position = self.termination_position;
            self.ack(termination_position, NULL_VALUE);
            self.terminated = true;
        }
    }

    fn ack(&mut self, log_position: i64, relevant_id: i64) {
        let message = FromServiceMessage::ServiceAck {
            log_position,
            ack_id: self.ack_id,
            relevant_id,
            service_id: 0,
        };
        self.ack_id += 1;
        self.control_publication.offer(&message.encode());
    }

    fn take_snapshot(&mut self) -> i64 {
        let session_id = self.transport.next_correlation_id() as i32;
        let channel = format!(
            "mem:member-{}-svc-snapshot?session-id={}",
            self.member_index, session_id
        );
        let publication = self.transport.add_publication(&channel, 120);
        let recording_id = self
            .archive
            .start_recording(&channel, 120, SourceLocation::Local)
            .expect("service snapshot recording");

        let mut buf = BytesMut::new();
        buf.put_u32_le(self.messages.len() as u32);
        for message in &self.messages {
            buf.put_u32_le(message.len() as u32);
            buf.put_slice(message);
        }
        publication.offer(&buf);

        self.archive.stop_recording(&channel, 120).expect("stop recording");
        publication.close();
        recording_id
    }

    fn load_snapshot(&mut self, recording_id: i64) {
        let endpoint = format!(
            "svc-load-{}-{}",
            self.member_index,
            self.transport.next_correlation_id()
        );
        let channel = format!("mem:{}", endpoint);
        let subscription = self.transport.add_subscription(&channel, 120);
        self.archive
            .start_replay(recording_id, 0, -1, &channel, 120)
            .expect("service snapshot replay");

        let mut blob = Vec::new();
        subscription.poll(
            |_, _, payload| {
                blob.extend_from_slice(payload);
                Action::Continue
            },
            64,
        );

        if blob.len() >= 4 {
            let count = u32::from_le_bytes(blob[0..4].try_into().unwrap()) as usize;
            let mut offset = 4;
            let mut messages = Vec::with_capacity(count);
            for _ in 0..count {
                let len =
                    u32::from_le_bytes(blob[offset..offset + 4].try_into().unwrap()) as usize;
                offset += 4;
                messages.push(blob[offset..offset + len].to_vec());
                offset += len;
            }
            self.messages = messages;
        }
        self.was_snapshot_loaded = true;
    }
}

//
// Test client.
//

pub struct TestClient {
    transport: Transport,
    response_channel: String,
    egress_subscription: Subscription,
    ingress_publication: Option<Publication>,
    ingress_stream_id: i32,
    next_correlation_id: i64,
    pub session_id: i64,
    pub leadership_term_id: i64,
    pub leader_member_id: i32,
    pub connected: bool,
    pub new_leader_count: usize,
    pub rejections: Vec<String>,
}

impl TestClient {
    pub fn new(cluster: &TestCluster, name: &str) -> Self {
        let response_channel = format!("mem:client-{}", name);
        let egress_subscription = cluster
            .transport
            .add_subscription(&response_channel, RESPONSE_STREAM_ID);
        Self {
            transport: cluster.transport.clone(),
            response_channel,
            egress_subscription,
            ingress_publication: None,
            ingress_stream_id: 102,
            next_correlation_id: 1,
            session_id: NULL_VALUE,
            leadership_term_id: NULL_VALUE,
            leader_member_id: NULL_MEMBER_ID,
            connected: false,
            new_leader_count: 0,
            rejections: Vec::new(),
        }
    }

    pub fn connect(&mut self, member_id: i32) {
        let channel = format!("mem:{}", client_endpoint(member_id));
        let publication = self.transport.add_publication(&channel, self.ingress_stream_id);
        let correlation_id = self.next_correlation_id;
        self.next_correlation_id += 1;

        let request = IngressRequest::SessionConnect {
            correlation_id,
            response_stream_id: RESPONSE_STREAM_ID,
            version: PROTOCOL_SEMANTIC_VERSION,
            response_channel: self.response_channel.clone(),
            encoded_credentials: Bytes::new(),
        };
        publication.offer(&request.encode());
        self.ingress_publication = Some(publication);
    }

    pub fn poll(&mut self) {
        let mut events = Vec::new();
        self.egress_subscription.poll(
            |_, _, payload| {
                if let Ok(event) = EgressEvent::decode(payload) {
                    events.push(event);
                }
                Action::Continue
            },
            16,
        );

        for event in events {
            match event {
                EgressEvent::SessionEvent {
                    cluster_session_id,
                    leadership_term_id,
                    leader_member_id,
                    code,
                    detail,
                    ..
                } => match code {
                    EventCode::Ok => {
                        self.session_id = cluster_session_id;
                        self.leadership_term_id = leadership_term_id;
                        self.leader_member_id = leader_member_id;
                        self.connected = true;
                    }
                    EventCode::Redirect => {
                        if let Some(endpoint) = leader_endpoint(&detail, leader_member_id) {
                            let publication = self
                                .transport
                                .add_publication(&format!("mem:{}", endpoint), self.ingress_stream_id);
                            let correlation_id = self.next_correlation_id;
                            self.next_correlation_id += 1;
                            let request = IngressRequest::SessionConnect {
                                correlation_id,
                                response_stream_id: RESPONSE_STREAM_ID,
                                version: PROTOCOL_SEMANTIC_VERSION,
                                response_channel: self.response_channel.clone(),
                                encoded_credentials: Bytes::new(),
                            };
                            publication.offer(&request.encode());
                            self.ingress_publication = Some(publication);
                        }
                    }
                    _ => self.rejections.push(detail),
                },
                EgressEvent::NewLeader {
                    leadership_term_id,
                    leader_member_id,
                    ingress_endpoints,
                    ..
                } => {
                    self.new_leader_count += 1;
                    self.leadership_term_id = leadership_term_id;
                    self.leader_member_id = leader_member_id;
                    if let Some(endpoint) = leader_endpoint(&ingress_endpoints, leader_member_id) {
                        self.ingress_publication = Some(
                            self.transport
                                .add_publication(&format!("mem:{}", endpoint), self.ingress_stream_id),
                        );
                    }
                }
                EgressEvent::Challenge { .. } => {}
            }
        }
    }

    pub fn send(&mut self, payload: &[u8]) -> bool {
        let Some(publication) = &self.ingress_publication else {
            return false;
        };
        let request = IngressRequest::Message {
            leadership_term_id: self.leadership_term_id,
            cluster_session_id: self.session_id,
            payload: Bytes::copy_from_slice(payload),
        };
        publication.offer(&request.encode()) > 0
    }

    pub fn keep_alive(&mut self) {
        if let Some(publication) = &self.ingress_publication {
            let request = IngressRequest::SessionKeepAlive {
                leadership_term_id: self.leadership_term_id,
                cluster_session_id: self.session_id,
            };
            publication.offer(&request.encode());
        }
    }
}

/// Ticks the cluster, polling the client, until the client predicate holds.
pub fn run_client_until(
    cluster: &mut TestCluster,
    client: &mut TestClient,
    mut predicate: impl FnMut(&TestClient) -> bool,
) {
    let mut ticks = 0;
    while !predicate(client) {
        assert!(ticks < MAX_TICKS, "client condition not reached");
        cluster.tick();
        client.poll();
        ticks += 1;
    }
}

/// Sends `count` little-endian u32 payloads, retrying on back-pressure.
pub fn send_messages(cluster: &mut TestCluster, client: &mut TestClient, base: u32, count: u32) {
    for i in base..base + count {
        let payload = i.to_le_bytes();
        let mut ticks = 0;
        loop {
            client.poll();
            if client.send(&payload) {
                break;
            }
            assert!(ticks < MAX_TICKS, "message {} not accepted", i);
            cluster.tick();
            ticks += 1;
        }
        cluster.tick();
    }
}

/// Picks `id=endpoint` for the given member out of a client-facing endpoint
/// list.
fn leader_endpoint(endpoints: &str, leader_member_id: i32) -> Option<String> {
    endpoints.split(',').find_map(|entry| {
        let (id, endpoint) = entry.split_once('=')?;
        if id.parse::<i32>().ok()? == leader_member_id {
            Some(endpoint.to_string())
        } else {
            None
        }
    })
}

/// Raw member-status sender for membership operations a tool would perform.
pub fn send_peer_message(
    cluster: &TestCluster,
    target_member_id: i32,
    message: &cluster::codec::peer::PeerMessage,
) {
    let channel = format!("mem:member-{}-status", target_member_id);
    let publication = cluster.transport.add_publication(&channel, 101);
    publication.offer(&message.encode());
}

pub fn parse_members(members: &str) -> Vec<ClusterMember> {
    ClusterMember::parse(members).expect("valid members string")
}

//
// Test logger with tick and member context.
//

pub struct TestLogger;

struct TestLoggerContext {
    member: Option<i32>,
    tick: Option<i64>,
}

thread_local! {
    static LOGGER_CONTEXT: RefCell<TestLoggerContext> =
        RefCell::new(TestLoggerContext { member: None, tick: None });
}

impl TestLogger {
    pub fn init() {
        let _ignore = log::set_logger(&TestLogger);
        log::set_max_level(log::LevelFilter::Info);
    }

    pub fn set_member(member: Option<i32>) {
        LOGGER_CONTEXT.with(|context| context.borrow_mut().member = member);
    }

    pub fn set_tick(tick: Option<i64>) {
        LOGGER_CONTEXT.with(|context| context.borrow_mut().tick = tick);
    }
}

impl log::Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        LOGGER_CONTEXT.with(|context| {
            let context = context.borrow();
            match (context.tick, context.member) {
                (Some(tick), Some(member)) => {
                    eprintln!("tick {:05} m{} {}", tick, member, record.args())
                }
                (_, Some(member)) => eprintln!("tick ----- m{} {}", member, record.args()),
                _ => eprintln!("{}", record.args()),
            }
        })
    }

    fn flush(&self) {}
}
