//! Member-status control messages exchanged between cluster members.

use bytes::{BufMut, Bytes, BytesMut};

use super::{put_string, CodecError, Reader};
use crate::recording::Snapshot;

#[derive(Clone, Debug, PartialEq)]
pub enum PeerMessage {
    CanvassPosition {
        log_leadership_term_id: i64,
        log_position: i64,
        follower_member_id: i32,
    },
    RequestVote {
        log_leadership_term_id: i64,
        log_position: i64,
        candidate_term_id: i64,
        candidate_member_id: i32,
    },
    Vote {
        candidate_term_id: i64,
        log_leadership_term_id: i64,
        log_position: i64,
        candidate_member_id: i32,
        follower_member_id: i32,
        vote: bool,
    },
    NewLeadershipTerm {
        log_leadership_term_id: i64,
        log_position: i64,
        leadership_term_id: i64,
        max_log_position: i64,
        leader_member_id: i32,
        log_session_id: i32,
    },
    AppendedPosition {
        leadership_term_id: i64,
        log_position: i64,
        follower_member_id: i32,
    },
    CommitPosition {
        leadership_term_id: i64,
        log_position: i64,
        leader_member_id: i32,
    },
    CatchupPosition {
        leadership_term_id: i64,
        log_position: i64,
        follower_member_id: i32,
    },
    StopCatchup {
        leadership_term_id: i64,
        log_position: i64,
        follower_member_id: i32,
    },
    AddPassiveMember {
        correlation_id: i64,
        member_endpoints: String,
    },
    ClusterMembersChange {
        correlation_id: i64,
        leader_member_id: i32,
        active_members: String,
        passive_members: String,
    },
    SnapshotRecordingQuery {
        correlation_id: i64,
        request_member_id: i32,
    },
    SnapshotRecordings {
        correlation_id: i64,
        snapshots: Vec<Snapshot>,
        cluster_members: String,
    },
    JoinCluster {
        leadership_term_id: i64,
        member_id: i32,
    },
    TerminationPosition {
        log_position: i64,
    },
    TerminationAck {
        log_position: i64,
        member_id: i32,
    },
    RemoveMember {
        correlation_id: i64,
        member_id: i32,
        is_passive: bool,
    },
}

mod tag {
    pub const CANVASS_POSITION: u32 = 1;
    pub const REQUEST_VOTE: u32 = 2;
    pub const VOTE: u32 = 3;
    pub const NEW_LEADERSHIP_TERM: u32 = 4;
    pub const APPENDED_POSITION: u32 = 5;
    pub const COMMIT_POSITION: u32 = 6;
    pub const CATCHUP_POSITION: u32 = 7;
    pub const STOP_CATCHUP: u32 = 8;
    pub const ADD_PASSIVE_MEMBER: u32 = 9;
    pub const CLUSTER_MEMBERS_CHANGE: u32 = 10;
    pub const SNAPSHOT_RECORDING_QUERY: u32 = 11;
    pub const SNAPSHOT_RECORDINGS: u32 = 12;
    pub const JOIN_CLUSTER: u32 = 13;
    pub const TERMINATION_POSITION: u32 = 14;
    pub const TERMINATION_ACK: u32 = 15;
    pub const REMOVE_MEMBER: u32 = 16;
}

impl PeerMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            PeerMessage::CanvassPosition {
                log_leadership_term_id,
                log_position,
                follower_member_id,
            } => {
                buf.put_u32_le(tag::CANVASS_POSITION);
                buf.put_i64_le(*log_leadership_term_id);
                buf.put_i64_le(*log_position);
                buf.put_i32_le(*follower_member_id);
            }
            PeerMessage::RequestVote {
                log_leadership_term_id,
                log_position,
                candidate_term_id,
                candidate_member_id,
            } => {
                buf.put_u32_le(tag::REQUEST_VOTE);
                buf.put_i64_le(*log_leadership_term_id);
                buf.put_i64_le(*log_position);
                buf.put_i64_le(*candidate_term_id);
                buf.put_i32_le(*candidate_member_id);
            }
            PeerMessage::Vote {
                candidate_term_id,
                log_leadership_term_id,
                log_position,
                candidate_member_id,
                follower_member_id,
                vote,
            } => {
                buf.put_u32_le(tag::VOTE);
                buf.put_i64_le(*candidate_term_id);
                buf.put_i64_le(*log_leadership_term_id);
                buf.put_i64_le(*log_position);
                buf.put_i32_le(*candidate_member_id);
                buf.put_i32_le(*follower_member_id);
                buf.put_u8(*vote as u8);
            }
            PeerMessage::NewLeadershipTerm {
                log_leadership_term_id,
                log_position,
                leadership_term_id,
                max_log_position,
                leader_member_id,
                log_session_id,
            } => {
                buf.put_u32_le(tag::NEW_LEADERSHIP_TERM);
                buf.put_i64_le(*log_leadership_term_id);
                buf.put_i64_le(*log_position);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*max_log_position);
                buf.put_i32_le(*leader_member_id);
                buf.put_i32_le(*log_session_id);
            }
            PeerMessage::AppendedPosition {
                leadership_term_id,
                log_position,
                follower_member_id,
            } => {
                buf.put_u32_le(tag::APPENDED_POSITION);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*log_position);
                buf.put_i32_le(*follower_member_id);
            }
            PeerMessage::CommitPosition {
                leadership_term_id,
                log_position,
                leader_member_id,
            } => {
                buf.put_u32_le(tag::COMMIT_POSITION);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*log_position);
                buf.put_i32_le(*leader_member_id);
            }
            PeerMessage::CatchupPosition {
                leadership_term_id,
                log_position,
                follower_member_id,
            } => {
                buf.put_u32_le(tag::CATCHUP_POSITION);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*log_position);
                buf.put_i32_le(*follower_member_id);
            }
            PeerMessage::StopCatchup {
                leadership_term_id,
                log_position,
                follower_member_id,
            } => {
                buf.put_u32_le(tag::STOP_CATCHUP);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i64_le(*log_position);
                buf.put_i32_le(*follower_member_id);
            }
            PeerMessage::AddPassiveMember {
                correlation_id,
                member_endpoints,
            } => {
                buf.put_u32_le(tag::ADD_PASSIVE_MEMBER);
                buf.put_i64_le(*correlation_id);
                put_string(&mut buf, member_endpoints);
            }
            PeerMessage::ClusterMembersChange {
                correlation_id,
                leader_member_id,
                active_members,
                passive_members,
            } => {
                buf.put_u32_le(tag::CLUSTER_MEMBERS_CHANGE);
                buf.put_i64_le(*correlation_id);
                buf.put_i32_le(*leader_member_id);
                put_string(&mut buf, active_members);
                put_string(&mut buf, passive_members);
            }
            PeerMessage::SnapshotRecordingQuery {
                correlation_id,
                request_member_id,
            } => {
                buf.put_u32_le(tag::SNAPSHOT_RECORDING_QUERY);
                buf.put_i64_le(*correlation_id);
                buf.put_i32_le(*request_member_id);
            }
            PeerMessage::SnapshotRecordings {
                correlation_id,
                snapshots,
                cluster_members,
            } => {
                buf.put_u32_le(tag::SNAPSHOT_RECORDINGS);
                buf.put_i64_le(*correlation_id);
                buf.put_u32_le(snapshots.len() as u32);
                for snapshot in snapshots {
                    buf.put_i64_le(snapshot.recording_id);
                    buf.put_i64_le(snapshot.leadership_term_id);
                    buf.put_i64_le(snapshot.term_base_log_position);
                    buf.put_i64_le(snapshot.log_position);
                    buf.put_i64_le(snapshot.timestamp_ms);
                    buf.put_i32_le(snapshot.service_id);
                }
                put_string(&mut buf, cluster_members);
            }
            PeerMessage::JoinCluster {
                leadership_term_id,
                member_id,
            } => {
                buf.put_u32_le(tag::JOIN_CLUSTER);
                buf.put_i64_le(*leadership_term_id);
                buf.put_i32_le(*member_id);
            }
            PeerMessage::TerminationPosition { log_position } => {
                buf.put_u32_le(tag::TERMINATION_POSITION);
                buf.put_i64_le(*log_position);
            }
            PeerMessage::TerminationAck {
                log_position,
                member_id,
            } => {
                buf.put_u32_le(tag::TERMINATION_ACK);
                buf.put_i64_le(*log_position);
                buf.put_i32_le(*member_id);
            }
            PeerMessage::RemoveMember {
                correlation_id,
                member_id,
                is_passive,
            } => {
                buf.put_u32_le(tag::REMOVE_MEMBER);
                buf.put_i64_le(*correlation_id);
                buf.put_i32_le(*member_id);
                buf.put_u8(*is_passive as u8);
            }
        }
        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<PeerMessage, CodecError> {
        let mut reader = Reader::new(frame);
        match reader.u32()? {
            tag::CANVASS_POSITION => Ok(PeerMessage::CanvassPosition {
                log_leadership_term_id: reader.i64()?,
                log_position: reader.i64()?,
                follower_member_id: reader.i32()?,
            }),
            tag::REQUEST_VOTE => Ok(PeerMessage::RequestVote {
                log_leadership_term_id: reader.i64()?,
                log_position: reader.i64()?,
                candidate_term_id: reader.i64()?,
                candidate_member_id: reader.i32()?,
            }),
            tag::VOTE => Ok(PeerMessage::Vote {
                candidate_term_id: reader.i64()?,
                log_leadership_term_id: reader.i64()?,
                log_position: reader.i64()?,
                candidate_member_id: reader.i32()?,
                follower_member_id: reader.i32()?,
                vote: reader.bool()?,
            }),
            tag::NEW_LEADERSHIP_TERM => Ok(PeerMessage::NewLeadershipTerm {
                log_leadership_term_id: reader.i64()?,
                log_position: reader.i64()?,
                leadership_term_id: reader.i64()?,
                max_log_position: reader.i64()?,
                leader_member_id: reader.i32()?,
                log_session_id: reader.i32()?,
            }),
            tag::APPENDED_POSITION => Ok(PeerMessage::AppendedPosition {
                leadership_term_id: reader.i64()?,
                log_position: reader.i64()?,
                follower_member_id: reader.i32()?,
            }),
            tag::COMMIT_POSITION => Ok(PeerMessage::CommitPosition {
                leadership_term_id: reader.i64()?,
                log_position: reader.i64()?,
                leader_member_id: reader.i32()?,
            }),
            tag::CATCHUP_POSITION => Ok(PeerMessage::CatchupPosition {
                leadership_term_id: reader.i64()?,
                log_position: reader.i64()?,
                follower_member_id: reader.i32()?,
            }),
            tag::STOP_CATCHUP => Ok(PeerMessage::StopCatchup {
                leadership_term_id: reader.i64()?,
                log_position: reader.i64()?,
                follower_member_id: reader.i32()?,
            }),
            tag::ADD_PASSIVE_MEMBER => Ok(PeerMessage::AddPassiveMember {
                correlation_id: reader.i64()?,
                member_endpoints: reader.string()?,
            }),
            tag::CLUSTER_MEMBERS_CHANGE => Ok(PeerMessage::ClusterMembersChange {
                correlation_id: reader.i64()?,
                leader_member_id: reader.i32()?,
                active_members: reader.string()?,
                passive_members: reader.string()?,
            }),
            tag::SNAPSHOT_RECORDING_QUERY => Ok(PeerMessage::SnapshotRecordingQuery {
                correlation_id: reader.i64()?,
                request_member_id: reader.i32()?,
            }),
            tag::SNAPSHOT_RECORDINGS => {
                let correlation_id = reader.i64()?;
                let count = reader.u32()? as usize;
                let mut snapshots = Vec::with_capacity(count);
                for _ in 0..count {
                    snapshots.push(Snapshot {
                        recording_id: reader.i64()?,
                        leadership_term_id: reader.i64()?,
                        term_base_log_position: reader.i64()?,
                        log_position: reader.i64()?,
                        timestamp_ms: reader.i64()?,
                        service_id: reader.i32()?,
                    });
                }
                Ok(PeerMessage::SnapshotRecordings {
                    correlation_id,
                    snapshots,
                    cluster_members: reader.string()?,
                })
            }
            tag::JOIN_CLUSTER => Ok(PeerMessage::JoinCluster {
                leadership_term_id: reader.i64()?,
                member_id: reader.i32()?,
            }),
            tag::TERMINATION_POSITION => Ok(PeerMessage::TerminationPosition {
                log_position: reader.i64()?,
            }),
            tag::TERMINATION_ACK => Ok(PeerMessage::TerminationAck {
                log_position: reader.i64()?,
                member_id: reader.i32()?,
            }),
            tag::REMOVE_MEMBER => Ok(PeerMessage::RemoveMember {
                correlation_id: reader.i64()?,
                member_id: reader.i32()?,
                is_passive: reader.bool()?,
            }),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_round_trip() {
        let message = PeerMessage::Vote {
            candidate_term_id: 5,
            log_leadership_term_id: 4,
            log_position: 1024,
            candidate_member_id: 1,
            follower_member_id: 2,
            vote: true,
        };
        assert_eq!(PeerMessage::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn snapshot_recordings_round_trip() {
        let message = PeerMessage::SnapshotRecordings {
            correlation_id: 77,
            snapshots: vec![Snapshot {
                recording_id: 9,
                leadership_term_id: 2,
                term_base_log_position: 0,
                log_position: 640,
                timestamp_ms: 1234,
                service_id: -1,
            }],
            cluster_members: "0,c,m,l,t,a".to_string(),
        };
        assert_eq!(PeerMessage::decode(&message.encode()).unwrap(), message);
    }
}
