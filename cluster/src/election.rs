//! Leader election.
//!
//! The election agrees `(leadership_term_id, log_position, leader_id)`.
//! Members canvass their `(last term, appended position)`, the best-placed
//! member nominates itself for the next term, and a strict quorum of ballots
//! makes it leader. Followers behind the new term's base position catch up
//! over an archive replay merged into the live log image before completing.

use log::{info, warn};
use stream::NULL_SESSION_ID;

use crate::agent::ConsensusModuleAgent;
use crate::codec::peer::PeerMessage;
use crate::error::ClusterError;
use crate::member::ClusterMember;
use crate::{NULL_MEMBER_ID, NULL_VALUE};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ElectionState {
    Init,
    Canvass,
    Nominate,
    CandidateBallot,
    FollowerBallot,
    LeaderReplay,
    LeaderTransition,
    FollowerCatchupInit,
    FollowerCatchup,
    FollowerTransition,
    Close,
}

pub struct Election {
    state: ElectionState,
    is_startup: bool,
    /// This member's appended position when the election began.
    appended_position: i64,
    /// Becomes the new term's base position once leadership resolves.
    log_position: i64,
    /// Term of this member's last log entry when the election began.
    log_leadership_term_id: i64,
    candidate_term_id: i64,
    leader_member_id: i32,
    log_session_id: i32,
    max_log_position: i64,
    last_vote_term: i64,
    time_of_last_update_ms: i64,
    deadline_ms: i64,
    services_joined: bool,
    catchup_sent: bool,
    replay_done: bool,
}

impl Election {
    pub fn new(is_startup: bool, leadership_term_id: i64, log_position: i64) -> Self {
        Self {
            state: ElectionState::Init,
            is_startup,
            appended_position: log_position,
            log_position,
            log_leadership_term_id: leadership_term_id,
            candidate_term_id: leadership_term_id,
            leader_member_id: NULL_MEMBER_ID,
            log_session_id: NULL_SESSION_ID,
            max_log_position: log_position,
            last_vote_term: leadership_term_id,
            time_of_last_update_ms: 0,
            deadline_ms: 0,
            services_joined: false,
            catchup_sent: false,
            replay_done: false,
        }
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ElectionState::Close
    }

    pub fn leader_member_id(&self) -> i32 {
        self.leader_member_id
    }

    pub fn candidate_term_id(&self) -> i64 {
        self.candidate_term_id
    }

    /// Base position of the term being agreed.
    pub fn log_position(&self) -> i64 {
        self.log_position
    }

    fn state_change(&mut self, next: ElectionState, now_ms: i64, timeout_ms: i64) {
        info!("election: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.deadline_ms = now_ms + timeout_ms;
        self.time_of_last_update_ms = 0;
    }

    pub fn do_work(&mut self, agent: &mut ConsensusModuleAgent, now_ms: i64) -> usize {
        let result = self.try_work(agent, now_ms);
        match result {
            Ok(work) => work,
            Err(err) => {
                agent.counted_error(err);
                self.restart(agent, now_ms);
                1
            }
        }
    }

    fn try_work(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        now_ms: i64,
    ) -> Result<usize, ClusterError> {
        match self.state {
            ElectionState::Init => {
                agent.reset_canvass_state();
                self.state_change(
                    ElectionState::Canvass,
                    now_ms,
                    agent.ctx.election_timeout_ms(),
                );
                Ok(1)
            }
            ElectionState::Canvass => Ok(self.canvass(agent, now_ms)),
            ElectionState::Nominate => Ok(self.nominate(agent, now_ms)),
            ElectionState::CandidateBallot => Ok(self.candidate_ballot(agent, now_ms)),
            ElectionState::FollowerBallot => {
                if now_ms >= self.deadline_ms {
                    self.restart(agent, now_ms);
                    return Ok(1);
                }
                Ok(0)
            }
            ElectionState::LeaderReplay => {
                if self.is_startup && !self.replay_done {
                    agent.replay_tail_to_services()?;
                }
                self.replay_done = true;
                self.state_change(
                    ElectionState::LeaderTransition,
                    now_ms,
                    agent.ctx.election_timeout_ms(),
                );
                Ok(1)
            }
            ElectionState::LeaderTransition => self.leader_transition(agent, now_ms),
            ElectionState::FollowerCatchupInit => self.follower_catchup_init(agent, now_ms),
            ElectionState::FollowerCatchup => self.follower_catchup(agent, now_ms),
            ElectionState::FollowerTransition => self.follower_transition(agent, now_ms),
            ElectionState::Close => Ok(0),
        }
    }

    /// Back to square one, keeping the candidate term so a rerun campaigns
    /// for a fresh term rather than a stale one.
    fn restart(&mut self, agent: &mut ConsensusModuleAgent, now_ms: i64) {
        warn!("election restarting from canvass");
        agent.reset_canvass_state();
        self.leader_member_id = NULL_MEMBER_ID;
        self.log_session_id = NULL_SESSION_ID;
        self.catchup_sent = false;
        self.services_joined = false;
        self.state_change(
            ElectionState::Canvass,
            now_ms,
            agent.ctx.election_timeout_ms(),
        );
    }

    fn publish_canvass(&mut self, agent: &mut ConsensusModuleAgent, now_ms: i64) {
        let interval = agent.ctx.election_status_interval_ms();
        if now_ms >= self.time_of_last_update_ms + interval {
            self.time_of_last_update_ms = now_ms;
            agent.publish_to_all_members(&PeerMessage::CanvassPosition {
                log_leadership_term_id: self.log_leadership_term_id,
                log_position: self.appended_position,
                follower_member_id: agent.member_id,
            });
        }
    }

    fn canvass(&mut self, agent: &mut ConsensusModuleAgent, now_ms: i64) -> usize {
        self.publish_canvass(agent, now_ms);

        let threshold = ClusterMember::quorum_threshold(agent.cluster_members.len().max(1));
        let canvassed = 1 + agent
            .cluster_members
            .iter()
            .filter(|member| {
                member.id != agent.member_id && member.leadership_term_id != NULL_VALUE
            })
            .count();

        if canvassed < threshold {
            return 0;
        }

        let beaten = agent.cluster_members.iter().any(|member| {
            member.id != agent.member_id
                && member.leadership_term_id != NULL_VALUE
                && Self::ranks_higher(
                    (member.log_position, member.leadership_term_id, member.id),
                    (self.appended_position, self.log_leadership_term_id, agent.member_id),
                )
        });
        if beaten {
            if now_ms >= self.deadline_ms {
                self.restart(agent, now_ms);
                return 1;
            }
            return 0;
        }

        // On a cold start an appointed leader gets the first run at
        // nomination; everyone else defers until the timeout lapses.
        let appointed = agent.ctx.appointed_leader_id;
        if self.is_startup
            && appointed != NULL_MEMBER_ID
            && appointed != agent.member_id
            && now_ms < self.deadline_ms
        {
            return 0;
        }

        self.state_change(
            ElectionState::Nominate,
            now_ms,
            agent.ctx.election_timeout_ms(),
        );
        1
    }

    /// `(log_position, leadership_term_id)` decides; lower id wins ties for
    /// deterministic progress.
    fn ranks_higher(a: (i64, i64, i32), b: (i64, i64, i32)) -> bool {
        (a.0, a.1).cmp(&(b.0, b.1)).then_with(|| b.2.cmp(&a.2)) == std::cmp::Ordering::Greater
    }

    fn nominate(&mut self, agent: &mut ConsensusModuleAgent, now_ms: i64) -> usize {
        self.candidate_term_id = self.candidate_term_id.max(agent.leadership_term_id) + 1;
        self.last_vote_term = self.candidate_term_id;
        self.leader_member_id = NULL_MEMBER_ID;
        info!(
            "member {} nominating for term {}",
            agent.member_id, self.candidate_term_id
        );

        agent.role_candidate();
        for member in agent.cluster_members.iter_mut() {
            member.vote = None;
        }
        if let Some(member) = ClusterMember::find_mut(&mut agent.cluster_members, agent.member_id)
        {
            member.vote = Some(true);
        }

        agent.publish_to_all_members(&PeerMessage::RequestVote {
            log_leadership_term_id: self.log_leadership_term_id,
            log_position: self.appended_position,
            candidate_term_id: self.candidate_term_id,
            candidate_member_id: agent.member_id,
        });

        self.state_change(
            ElectionState::CandidateBallot,
            now_ms,
            agent.ctx.election_timeout_ms(),
        );
        1
    }

    fn candidate_ballot(&mut self, agent: &mut ConsensusModuleAgent, now_ms: i64) -> usize {
        let threshold = ClusterMember::quorum_threshold(agent.cluster_members.len().max(1));
        let granted = agent
            .cluster_members
            .iter()
            .filter(|member| member.vote == Some(true))
            .count();

        if granted >= threshold {
            info!(
                "member {} won ballot for term {} with {}/{} votes",
                agent.member_id,
                self.candidate_term_id,
                granted,
                agent.cluster_members.len()
            );
            self.leader_member_id = agent.member_id;
            self.log_position = self.appended_position;
            self.state_change(
                ElectionState::LeaderReplay,
                now_ms,
                agent.ctx.election_timeout_ms(),
            );
            return 1;
        }

        if now_ms >= self.deadline_ms {
            self.restart(agent, now_ms);
            return 1;
        }
        0
    }

    fn leader_transition(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        now_ms: i64,
    ) -> Result<usize, ClusterError> {
        if self.log_session_id == NULL_SESSION_ID {
            let log_session_id =
                agent.become_leader(self.candidate_term_id, self.log_position, now_ms)?;
            self.log_session_id = log_session_id;
            agent.update_member_details(agent.member_id);

            agent.publish_to_all_members(&PeerMessage::NewLeadershipTerm {
                log_leadership_term_id: self.log_leadership_term_id,
                log_position: self.log_position,
                leadership_term_id: self.candidate_term_id,
                max_log_position: self.log_position,
                leader_member_id: agent.member_id,
                log_session_id: self.log_session_id,
            });
        }

        if agent.election_complete(true, self.log_position, now_ms) {
            self.state_change(ElectionState::Close, now_ms, 0);
        }
        Ok(1)
    }

    fn follower_catchup_init(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        now_ms: i64,
    ) -> Result<usize, ClusterError> {
        if !self.services_joined {
            agent.follower_prepare(
                self.candidate_term_id,
                self.appended_position,
                self.log_session_id,
            )?;
            self.services_joined = true;
        }

        if !self.catchup_sent {
            let sent = agent.publish_to_member(
                self.leader_member_id,
                &PeerMessage::CatchupPosition {
                    leadership_term_id: self.candidate_term_id,
                    log_position: self.appended_position,
                    follower_member_id: agent.member_id,
                },
            );
            if sent {
                self.catchup_sent = true;
                self.state_change(
                    ElectionState::FollowerCatchup,
                    now_ms,
                    agent.ctx.election_timeout_ms(),
                );
            }
        }
        Ok(1)
    }

    fn follower_catchup(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        now_ms: i64,
    ) -> Result<usize, ClusterError> {
        let work = agent.catchup_poll(now_ms)?;
        if work > 0 {
            // Progress extends the budget.
            self.deadline_ms = now_ms + agent.ctx.election_timeout_ms();
        } else if now_ms >= self.deadline_ms {
            self.restart(agent, now_ms);
            return Ok(1);
        }
        Ok(work)
    }

    fn follower_transition(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        now_ms: i64,
    ) -> Result<usize, ClusterError> {
        if !self.services_joined {
            if self.is_startup && agent.recovery_plan.has_replay() && !self.replay_done {
                agent.replay_tail_to_services()?;
            }
            self.replay_done = true;
            agent.follower_prepare(
                self.candidate_term_id,
                self.log_position,
                self.log_session_id,
            )?;
            self.services_joined = true;
        }

        agent.update_member_details(self.leader_member_id);
        if agent.election_complete(false, self.log_position, now_ms) {
            self.state_change(ElectionState::Close, now_ms, 0);
        }
        Ok(1)
    }

    //
    // Peer message handlers, routed in by the agent.
    //

    pub fn on_canvass_position(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        log_leadership_term_id: i64,
        log_position: i64,
        follower_member_id: i32,
    ) {
        if let Some(member) =
            ClusterMember::find_mut(&mut agent.cluster_members, follower_member_id)
        {
            member.leadership_term_id = log_leadership_term_id;
            member.log_position = log_position;
        }
    }

    pub fn on_request_vote(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        log_leadership_term_id: i64,
        log_position: i64,
        candidate_term_id: i64,
        candidate_member_id: i32,
    ) {
        let log_ok = (log_position, log_leadership_term_id)
            >= (self.appended_position, self.log_leadership_term_id);
        let grant = candidate_term_id > agent.leadership_term_id
            && candidate_term_id > self.last_vote_term
            && log_ok
            && matches!(
                self.state,
                ElectionState::Init
                    | ElectionState::Canvass
                    | ElectionState::Nominate
                    | ElectionState::CandidateBallot
                    | ElectionState::FollowerBallot
            );

        if grant {
            info!(
                "member {} votes for {} in term {}",
                agent.member_id, candidate_member_id, candidate_term_id
            );
            self.last_vote_term = candidate_term_id;
            self.candidate_term_id = candidate_term_id;
            self.leader_member_id = candidate_member_id;
            let timeout = agent.ctx.election_timeout_ms();
            self.state_change(ElectionState::FollowerBallot, agent.cached_time_ms, timeout);
        }

        agent.publish_to_member(
            candidate_member_id,
            &PeerMessage::Vote {
                candidate_term_id,
                log_leadership_term_id: self.log_leadership_term_id,
                log_position: self.appended_position,
                candidate_member_id,
                follower_member_id: agent.member_id,
                vote: grant,
            },
        );
    }

    pub fn on_vote(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        candidate_term_id: i64,
        candidate_member_id: i32,
        follower_member_id: i32,
        vote: bool,
    ) {
        if self.state == ElectionState::CandidateBallot
            && candidate_term_id == self.candidate_term_id
            && candidate_member_id == agent.member_id
        {
            if let Some(member) =
                ClusterMember::find_mut(&mut agent.cluster_members, follower_member_id)
            {
                member.vote = Some(vote);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_new_leadership_term(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        _log_leadership_term_id: i64,
        log_position: i64,
        leadership_term_id: i64,
        max_log_position: i64,
        leader_member_id: i32,
        log_session_id: i32,
    ) {
        if leader_member_id == agent.member_id || leadership_term_id < self.candidate_term_id {
            return;
        }

        info!(
            "member {} follows leader {} for term {} base {}",
            agent.member_id, leader_member_id, leadership_term_id, log_position
        );
        self.candidate_term_id = leadership_term_id;
        self.last_vote_term = self.last_vote_term.max(leadership_term_id);
        self.leader_member_id = leader_member_id;
        self.log_session_id = log_session_id;
        self.log_position = log_position;
        self.max_log_position = max_log_position;

        let timeout = agent.ctx.election_timeout_ms();
        if self.appended_position < log_position {
            self.state_change(
                ElectionState::FollowerCatchupInit,
                agent.cached_time_ms,
                timeout,
            );
        } else {
            self.state_change(
                ElectionState::FollowerTransition,
                agent.cached_time_ms,
                timeout,
            );
        }
    }

    pub fn on_commit_position(
        &mut self,
        agent: &mut ConsensusModuleAgent,
        leadership_term_id: i64,
        log_position: i64,
    ) {
        if leadership_term_id == self.candidate_term_id {
            agent.follower_commit_position = log_position;
        }
    }

    pub fn on_stop_catchup(&mut self, agent: &mut ConsensusModuleAgent, now_ms: i64) {
        if self.state == ElectionState::FollowerCatchup {
            self.log_position = self.log_position.max(agent.log_adapter_position());
            self.state_change(
                ElectionState::FollowerTransition,
                now_ms,
                agent.ctx.election_timeout_ms(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranking_prefers_position_then_term_then_lower_id() {
        // Higher position wins.
        assert!(Election::ranks_higher((128, 0, 2), (96, 5, 0)));
        // Equal position, higher term wins.
        assert!(Election::ranks_higher((128, 3, 2), (128, 2, 0)));
        // Full tie: lower id wins.
        assert!(Election::ranks_higher((128, 3, 1), (128, 3, 2)));
        assert!(!Election::ranks_higher((128, 3, 2), (128, 3, 1)));
    }
}
