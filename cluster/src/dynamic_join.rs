//! Dynamic join of a new member to a running cluster.
//!
//! A member started with no cluster members but a list of member-status
//! endpoints announces itself as a passive member, learns the membership and
//! its fresh id from the leader, pulls the latest snapshots through the
//! archive into local recordings, loads them, and finally requests to join.
//! Observing its own JOIN event in the log completes admission.

use log::info;
use stream::{Action, Publication, SourceLocation};

use crate::agent::ConsensusModuleAgent;
use crate::codec::peer::PeerMessage;
use crate::error::ClusterError;
use crate::member::ClusterMember;
use crate::recording::Snapshot;
use crate::{NULL_MEMBER_ID, NULL_VALUE};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JoinState {
    Init,
    PassiveFollower,
    SnapshotRetrieve,
    SnapshotLoad,
    Join,
    Done,
}

struct Retrieval {
    snapshot: Snapshot,
    local_recording_id: i64,
    replay_id: i64,
    subscription: stream::Subscription,
    channel: String,
    stop_position: i64,
}

pub struct DynamicJoin {
    state: JoinState,
    status_endpoints: Vec<String>,
    endpoint_cursor: usize,
    status_publication: Option<Publication>,
    leader_publication: Option<Publication>,
    add_correlation_id: i64,
    query_correlation_id: i64,
    pub leader_member_id: i32,
    pub member_id: i32,
    pub cluster_members_string: String,
    snapshots: Vec<Snapshot>,
    retrieve_cursor: usize,
    retrieval: Option<Retrieval>,
    time_of_last_activity_ms: i64,
    loaded: bool,
}

impl DynamicJoin {
    pub fn new(status_endpoints: &str) -> Self {
        Self {
            state: JoinState::Init,
            status_endpoints: status_endpoints
                .split(',')
                .filter(|endpoint| !endpoint.is_empty())
                .map(str::to_string)
                .collect(),
            endpoint_cursor: 0,
            status_publication: None,
            leader_publication: None,
            add_correlation_id: NULL_VALUE,
            query_correlation_id: NULL_VALUE,
            leader_member_id: NULL_MEMBER_ID,
            member_id: NULL_MEMBER_ID,
            cluster_members_string: String::new(),
            snapshots: Vec::new(),
            retrieve_cursor: 0,
            retrieval: None,
            time_of_last_activity_ms: 0,
            loaded: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == JoinState::Done
    }

    pub fn do_work(&mut self, agent: &mut ConsensusModuleAgent, now_ms: i64) -> usize {
        let result = match self.state {
            JoinState::Init | JoinState::PassiveFollower => Ok(self.announce(agent, now_ms)),
            JoinState::SnapshotRetrieve => self.retrieve(agent, now_ms),
            JoinState::SnapshotLoad => self.load(agent, now_ms),
            JoinState::Join => Ok(self.join(agent, now_ms)),
            JoinState::Done => Ok(0),
        };

        match result {
            Ok(work) => work,
            Err(err) => {
                agent.counted_error(err);
                0
            }
        }
    }

    /// Announce as a passive member, rotating through the status endpoints
    /// until one of them (or the leader via a relay) answers.
    fn announce(&mut self, agent: &mut ConsensusModuleAgent, now_ms: i64) -> usize {
        let interval = agent.ctx.election_timeout_ms();
        if now_ms < self.time_of_last_activity_ms + interval && self.status_publication.is_some()
        {
            return 0;
        }
        self.time_of_last_activity_ms = now_ms;

        // Rotate through the status endpoints until one answers.
        let endpoint = &self.status_endpoints[self.endpoint_cursor];
        self.endpoint_cursor = (self.endpoint_cursor + 1) % self.status_endpoints.len();
        let channel = format!("mem:{}", endpoint);
        self.status_publication = Some(
            agent
                .ctx
                .transport
                .add_publication(&channel, agent.ctx.member_status_stream_id),
        );
        if self.add_correlation_id == NULL_VALUE {
            self.add_correlation_id = agent.ctx.transport.next_correlation_id();
        }
        self.state = JoinState::PassiveFollower;

        if let Some(publication) = &self.status_publication {
            let message = PeerMessage::AddPassiveMember {
                correlation_id: self.add_correlation_id,
                member_endpoints: agent.this_member_endpoints(),
            };
            publication.offer(&message.encode());
        }
        1
    }

    pub fn on_cluster_members_change(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        correlation_id: i64,
        leader_member_id: i32,
        active_members: &str,
        passive_members: &str,
    ) {
        if self.state != JoinState::PassiveFollower || correlation_id != self.add_correlation_id {
            return;
        }

        let own_endpoints = agent.this_member_endpoints();
        let assigned = ClusterMember::parse(passive_members)
            .ok()
            .and_then(|members| {
                members
                    .into_iter()
                    .find(|member| member.encode_endpoints() == own_endpoints)
                    .map(|member| member.id)
            });
        let Some(member_id) = assigned else { return };

        let actives = match ClusterMember::parse(active_members) {
            Ok(actives) => actives,
            Err(_) => return,
        };
        let Some(leader) = ClusterMember::find(&actives, leader_member_id) else {
            return;
        };

        info!(
            "dynamic join: assigned member id {} by leader {}",
            member_id, leader_member_id
        );
        self.member_id = member_id;
        self.leader_member_id = leader_member_id;
        self.cluster_members_string = active_members.to_string();

        let channel = format!("mem:{}", leader.member_facing_endpoint);
        let publication = agent
            .ctx
            .transport
            .add_publication(&channel, agent.ctx.member_status_stream_id);
        self.query_correlation_id = agent.ctx.transport.next_correlation_id();
        publication.offer(
            &PeerMessage::SnapshotRecordingQuery {
                correlation_id: self.query_correlation_id,
                request_member_id: member_id,
            }
            .encode(),
        );
        self.leader_publication = Some(publication);
        self.state = JoinState::SnapshotRetrieve;
    }

    pub fn on_snapshot_recordings(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        correlation_id: i64,
        snapshots: Vec<Snapshot>,
    ) {
        if self.state != JoinState::SnapshotRetrieve || correlation_id != self.query_correlation_id
        {
            return;
        }
        if agent.ctx.cluster_members_ignore_snapshot || snapshots.is_empty() {
            self.state = JoinState::Join;
            return;
        }
        self.snapshots = snapshots;
    }

    /// Replays each leader snapshot recording through the archive into a
    /// fresh local recording over the transfer endpoint.
    fn retrieve(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        now_ms: i64,
    ) -> Result<usize, ClusterError> {
        if self.snapshots.is_empty() {
            // Recording query not yet answered; nudge the leader again.
            let interval = agent.ctx.election_timeout_ms();
            if now_ms >= self.time_of_last_activity_ms + interval {
                self.time_of_last_activity_ms = now_ms;
                if let Some(publication) = &self.leader_publication {
                    publication.offer(
                        &PeerMessage::SnapshotRecordingQuery {
                            correlation_id: self.query_correlation_id,
                            request_member_id: self.member_id,
                        }
                        .encode(),
                    );
                }
            }
            return Ok(0);
        }

        if self.retrieval.is_none() {
            if self.retrieve_cursor >= self.snapshots.len() {
                self.state = JoinState::SnapshotLoad;
                return Ok(1);
            }

            let snapshot = self.snapshots[self.retrieve_cursor].clone();
            let session_id = agent.ctx.transport.next_correlation_id() as i32;
            let channel = format!(
                "mem:{}?session-id={}",
                agent.this_member_transfer_endpoint(),
                session_id
            );
            let subscription = agent
                .ctx
                .transport
                .add_subscription(&channel, agent.ctx.replay_stream_id);
            let local_recording_id = agent.archive.start_recording(
                &channel,
                agent.ctx.replay_stream_id,
                SourceLocation::Remote,
            )?;
            let stop_position = agent.archive.list_recording(snapshot.recording_id)?.stop_position;
            let replay_id = agent.archive.start_replay(
                snapshot.recording_id,
                0,
                -1,
                &channel,
                agent.ctx.replay_stream_id,
            )?;

            self.retrieval = Some(Retrieval {
                snapshot,
                local_recording_id,
                replay_id,
                subscription,
                channel,
                stop_position,
            });
            return Ok(1);
        }

        let retrieval = self.retrieval.as_mut().expect("retrieval in progress");
        retrieval.subscription.poll(|_, _, _| Action::Continue, 64);

        let recorded = agent
            .archive
            .get_recording_position(retrieval.local_recording_id)?;
        if recorded >= retrieval.stop_position {
            agent.archive.stop_replay(retrieval.replay_id);
            agent
                .archive
                .stop_recording(&retrieval.channel, agent.ctx.replay_stream_id)?;

            let retrieval = self.retrieval.take().expect("retrieval in progress");
            info!(
                "dynamic join: retrieved snapshot service_id={} into recording {}",
                retrieval.snapshot.service_id, retrieval.local_recording_id
            );
            agent.retrieved_snapshot(retrieval.local_recording_id, &retrieval.snapshot);
            self.retrieve_cursor += 1;
        }
        Ok(1)
    }

    fn load(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        _now_ms: i64,
    ) -> Result<usize, ClusterError> {
        if !self.loaded {
            agent.load_snapshots_from_dynamic_join()?;
            self.loaded = true;
            self.state = JoinState::Join;
        }
        Ok(1)
    }

    fn join(&mut self, agent: &mut ConsensusModuleAgent, now_ms: i64) -> usize {
        let interval = agent.ctx.election_status_interval_ms();
        if now_ms < self.time_of_last_activity_ms + interval {
            return 0;
        }
        self.time_of_last_activity_ms = now_ms;

        let message = PeerMessage::JoinCluster {
            leadership_term_id: agent.recovery_plan.last_leadership_term_id,
            member_id: self.member_id,
        };
        let sent = self
            .leader_publication
            .as_ref()
            .map_or(false, |publication| publication.offer(&message.encode()) > 0);

        if sent {
            info!("dynamic join: requested to join as member {}", self.member_id);
            self.state = JoinState::Done;
        }
        1
    }
}
