//! Cluster member registry.
//!
//! Members are identified by a stable small integer and described by the
//! string format `id,clientFacing,memberFacing,log,transfer,archive`, with
//! members separated by `|`.

use stream::{Publication, Transport, NULL_POSITION};

use crate::error::ClusterError;
use crate::{NULL_MEMBER_ID, NULL_VALUE};

#[derive(Debug)]
pub struct ClusterMember {
    pub id: i32,
    pub client_facing_endpoint: String,
    pub member_facing_endpoint: String,
    pub log_endpoint: String,
    pub transfer_endpoint: String,
    pub archive_endpoint: String,

    /// Member-status publication towards this member.
    pub publication: Option<Publication>,

    pub is_leader: bool,
    pub has_requested_join: bool,
    pub has_requested_remove: bool,
    pub has_sent_termination_ack: bool,

    /// Last appended log position reported by this member.
    pub log_position: i64,
    /// Greatest leadership term this member has canvassed.
    pub leadership_term_id: i64,
    pub time_of_last_append_ms: i64,
    pub catchup_replay_session_id: i64,
    pub removal_position: i64,
    pub correlation_id: i64,
    /// Ballot answer while an election is in progress.
    pub vote: Option<bool>,
}

impl ClusterMember {
    pub fn new(id: i32, endpoints: [&str; 5]) -> Self {
        Self {
            id,
            client_facing_endpoint: endpoints[0].to_string(),
            member_facing_endpoint: endpoints[1].to_string(),
            log_endpoint: endpoints[2].to_string(),
            transfer_endpoint: endpoints[3].to_string(),
            archive_endpoint: endpoints[4].to_string(),
            publication: None,
            is_leader: false,
            has_requested_join: false,
            has_requested_remove: false,
            has_sent_termination_ack: false,
            log_position: 0,
            leadership_term_id: NULL_VALUE,
            time_of_last_append_ms: 0,
            catchup_replay_session_id: NULL_VALUE,
            removal_position: NULL_POSITION,
            correlation_id: NULL_VALUE,
            vote: None,
        }
    }

    /// Parses a `|`-separated member list. An empty string is an empty
    /// cluster, which is the dynamic-join starting point.
    pub fn parse(members: &str) -> Result<Vec<ClusterMember>, ClusterError> {
        if members.is_empty() {
            return Ok(Vec::new());
        }

        members
            .split('|')
            .filter(|entry| !entry.is_empty())
            .map(Self::parse_entry)
            .collect()
    }

    fn parse_entry(entry: &str) -> Result<ClusterMember, ClusterError> {
        let fields: Vec<&str> = entry.split(',').collect();
        if fields.len() != 6 {
            return Err(ClusterError::InvalidMemberString(entry.to_string()));
        }
        let id = fields[0]
            .parse()
            .map_err(|_| ClusterError::InvalidMemberString(entry.to_string()))?;
        Ok(ClusterMember::new(
            id,
            [fields[1], fields[2], fields[3], fields[4], fields[5]],
        ))
    }

    /// Parses the endpoint section only, assigning the given id — the shape
    /// a dynamic joiner announces before it has one.
    pub fn parse_endpoints(id: i32, endpoints: &str) -> Result<ClusterMember, ClusterError> {
        let fields: Vec<&str> = endpoints.split(',').collect();
        if fields.len() != 5 {
            return Err(ClusterError::InvalidMemberString(endpoints.to_string()));
        }
        Ok(ClusterMember::new(
            id,
            [fields[0], fields[1], fields[2], fields[3], fields[4]],
        ))
    }

    pub fn encode_endpoints(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.client_facing_endpoint,
            self.member_facing_endpoint,
            self.log_endpoint,
            self.transfer_endpoint,
            self.archive_endpoint
        )
    }

    pub fn encode_as_string(members: &[ClusterMember]) -> String {
        members
            .iter()
            .map(|member| format!("{},{}", member.id, member.encode_endpoints()))
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn client_facing_endpoints(members: &[ClusterMember]) -> String {
        members
            .iter()
            .map(|member| format!("{}={}", member.id, member.client_facing_endpoint))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn high_member_id(members: &[ClusterMember]) -> i32 {
        members
            .iter()
            .map(|member| member.id)
            .max()
            .unwrap_or(NULL_MEMBER_ID)
    }

    pub fn quorum_threshold(member_count: usize) -> usize {
        (member_count / 2) + 1
    }

    /// Highest position appended on a quorum of members.
    pub fn quorum_position(members: &[ClusterMember]) -> i64 {
        let threshold = Self::quorum_threshold(members.len());
        let mut positions: Vec<i64> = members.iter().map(|member| member.log_position).collect();
        positions.sort_unstable_by(|a, b| b.cmp(a));
        positions.get(threshold - 1).copied().unwrap_or(0)
    }

    /// Whether a quorum of members has appended within the timeout.
    pub fn has_active_quorum(members: &[ClusterMember], now_ms: i64, timeout_ms: i64) -> bool {
        let active = members
            .iter()
            .filter(|member| member.time_of_last_append_ms + timeout_ms > now_ms)
            .count();
        active >= Self::quorum_threshold(members.len())
    }

    pub fn find(members: &[ClusterMember], id: i32) -> Option<&ClusterMember> {
        members.iter().find(|member| member.id == id)
    }

    pub fn find_mut(members: &mut [ClusterMember], id: i32) -> Option<&mut ClusterMember> {
        members.iter_mut().find(|member| member.id == id)
    }

    pub fn remove_member(members: &mut Vec<ClusterMember>, id: i32) {
        members.retain(|member| member.id != id);
    }

    /// A passive joiner is a duplicate if any endpoint collides with an
    /// existing passive member.
    pub fn is_duplicate_endpoints(passive_members: &[ClusterMember], endpoints: &str) -> bool {
        passive_members
            .iter()
            .any(|member| member.encode_endpoints() == endpoints)
    }

    /// Opens a member-status publication towards this member.
    pub fn add_status_publication(&mut self, transport: &Transport, stream_id: i32) {
        if self.publication.is_none() {
            let channel = format!("mem:{}", self.member_facing_endpoint);
            self.publication = Some(transport.add_publication(&channel, stream_id));
        }
    }

    pub fn close_publication(&mut self) {
        if let Some(publication) = self.publication.take() {
            publication.close();
        }
    }
}

/// Opens status publications from `this_member_id` to every other member.
pub fn add_status_publications(
    members: &mut [ClusterMember],
    this_member_id: i32,
    transport: &Transport,
    stream_id: i32,
) {
    for member in members.iter_mut() {
        if member.id != this_member_id {
            member.add_status_publication(transport, stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn members_fixture() -> Vec<ClusterMember> {
        ClusterMember::parse(
            "0,c0,m0,l0,t0,a0|1,c1,m1,l1,t1,a1|2,c2,m2,l2,t2,a2",
        )
        .unwrap()
    }

    #[test]
    fn parse_and_encode_round_trip() {
        let members = members_fixture();
        assert_eq!(members.len(), 3);
        assert_eq!(members[1].id, 1);
        assert_eq!(members[1].member_facing_endpoint, "m1");
        assert_eq!(
            ClusterMember::encode_as_string(&members),
            "0,c0,m0,l0,t0,a0|1,c1,m1,l1,t1,a1|2,c2,m2,l2,t2,a2"
        );
    }

    #[test]
    fn parse_rejects_short_entries() {
        assert!(ClusterMember::parse("0,a,b,c").is_err());
    }

    #[test]
    fn empty_string_is_empty_cluster() {
        assert!(ClusterMember::parse("").unwrap().is_empty());
    }

    #[rstest]
    #[case(1, 1)]
    #[case(2, 2)]
    #[case(3, 2)]
    #[case(4, 3)]
    #[case(5, 3)]
    fn quorum_thresholds(#[case] count: usize, #[case] expected: usize) {
        assert_eq!(ClusterMember::quorum_threshold(count), expected);
    }

    #[test]
    fn quorum_position_is_median_of_three() {
        let mut members = members_fixture();
        members[0].log_position = 96;
        members[1].log_position = 64;
        members[2].log_position = 0;
        assert_eq!(ClusterMember::quorum_position(&members), 64);
    }

    #[test]
    fn active_quorum_requires_recent_appends() {
        let mut members = members_fixture();
        let now = 1_000;
        members[0].time_of_last_append_ms = now;
        members[1].time_of_last_append_ms = now - 50;
        members[2].time_of_last_append_ms = 0;
        assert!(ClusterMember::has_active_quorum(&members, now, 100));

        members[1].time_of_last_append_ms = 0;
        assert!(!ClusterMember::has_active_quorum(&members, now, 100));
    }
}
