//! Control link between the module and its hosted services.

use log::error;
use stream::{Action, Publication, Subscription, NULL_POSITION};

use crate::codec::service::{FromServiceMessage, ToServiceMessage};
use crate::NULL_VALUE;

/// Latest acknowledgement from one hosted service.
#[derive(Clone, Copy, Debug)]
pub struct ServiceAck {
    pub log_position: i64,
    pub ack_id: i64,
    pub relevant_id: i64,
}

impl ServiceAck {
    pub fn new_array(service_count: usize) -> Vec<ServiceAck> {
        vec![
            ServiceAck {
                log_position: NULL_POSITION,
                ack_id: NULL_VALUE,
                relevant_id: NULL_VALUE,
            };
            service_count
        ]
    }

    /// All services have acknowledged `log_position` with the current ack id.
    pub fn has_reached_position(log_position: i64, ack_id: i64, acks: &[ServiceAck]) -> bool {
        acks.iter()
            .all(|ack| ack.log_position == log_position && ack.ack_id == ack_id)
    }
}

/// Module → service publisher.
pub struct ServiceProxy {
    publication: Publication,
}

impl ServiceProxy {
    pub fn new(publication: Publication) -> Self {
        Self { publication }
    }

    fn offer(&self, message: &ToServiceMessage) -> bool {
        self.publication.offer(&message.encode()) > 0
    }

    #[allow(clippy::too_many_arguments)]
    pub fn join_log(
        &self,
        leadership_term_id: i64,
        log_position: i64,
        max_log_position: i64,
        member_id: i32,
        log_session_id: i32,
        log_stream_id: i32,
        log_channel: &str,
    ) -> bool {
        self.offer(&ToServiceMessage::JoinLog {
            leadership_term_id,
            log_position,
            max_log_position,
            member_id,
            log_session_id,
            log_stream_id,
            log_channel: log_channel.to_string(),
        })
    }

    pub fn cluster_members_response(
        &self,
        correlation_id: i64,
        leader_member_id: i32,
        active_members: &str,
        passive_members: &str,
    ) -> bool {
        self.offer(&ToServiceMessage::ClusterMembersResponse {
            correlation_id,
            leader_member_id,
            active_members: active_members.to_string(),
            passive_members: passive_members.to_string(),
        })
    }

    pub fn termination_position(&self, log_position: i64) -> bool {
        self.offer(&ToServiceMessage::TerminationPosition { log_position })
    }

    pub fn election_start_event(&self, log_position: i64) -> bool {
        self.offer(&ToServiceMessage::ElectionStartEvent { log_position })
    }
}

/// Service → module subscription.
pub struct ServiceAdapter {
    subscription: Subscription,
}

impl ServiceAdapter {
    pub fn new(subscription: Subscription) -> Self {
        Self { subscription }
    }

    pub fn poll<H>(&mut self, mut handler: H, limit: usize) -> usize
    where
        H: FnMut(FromServiceMessage),
    {
        self.subscription.poll(
            |_, _, payload| {
                match FromServiceMessage::decode(payload) {
                    Ok(message) => handler(message),
                    Err(err) => error!("undecodable service message: {}", err),
                }
                Action::Continue
            },
            limit,
        )
    }
}
