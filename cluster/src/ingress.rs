//! Client-facing adapters: the ingress decoder feeding the leader and the
//! egress publisher delivering events back to clients.

use bytes::Bytes;
use log::warn;
use stream::{Action, Counter, Subscription};

use crate::codec::client::{EgressEvent, IngressRequest};
use crate::session::{ClusterSession, EventCode, SESSION_REJECTED_DETAIL};

pub struct IngressAdapter {
    subscription: Option<Subscription>,
    invalid_request_counter: Counter,
}

impl IngressAdapter {
    pub fn new(invalid_request_counter: Counter) -> Self {
        Self {
            subscription: None,
            invalid_request_counter,
        }
    }

    pub fn connect(&mut self, subscription: Subscription) {
        self.subscription = Some(subscription);
    }

    pub fn close(&mut self) {
        self.subscription = None;
    }

    pub fn is_connected(&self) -> bool {
        self.subscription.is_some()
    }

    /// Lends the subscription out so the caller can poll it while borrowing
    /// itself mutably in the fragment handler.
    pub fn take_subscription(&mut self) -> Option<Subscription> {
        self.subscription.take()
    }

    pub fn restore_subscription(&mut self, subscription: Subscription) {
        self.subscription = Some(subscription);
    }

    /// Decodes ingress frames for the handler. Returning [`Action::Abort`]
    /// (log append back-pressure) leaves the frame queued for the next tick.
    pub fn poll<H>(&mut self, mut handler: H, limit: usize) -> usize
    where
        H: FnMut(IngressRequest) -> Action,
    {
        let Some(subscription) = &self.subscription else {
            return 0;
        };
        let invalid_requests = &self.invalid_request_counter;

        subscription.poll(
            |_, _, payload| match IngressRequest::decode(payload) {
                Ok(request) => handler(request),
                Err(err) => {
                    invalid_requests.increment_ordered();
                    warn!("invalid ingress frame: {}", err);
                    Action::Continue
                }
            },
            limit,
        )
    }
}

/// Sends events to a session's response channel. All sends are soft-fail:
/// `false` means not delivered, retry later.
#[derive(Default)]
pub struct EgressPublisher;

impl EgressPublisher {
    pub fn send_event(
        &self,
        session: &ClusterSession,
        leadership_term_id: i64,
        leader_member_id: i32,
        code: EventCode,
        detail: &str,
    ) -> bool {
        let event = EgressEvent::SessionEvent {
            cluster_session_id: session.id(),
            correlation_id: session.correlation_id(),
            leadership_term_id,
            leader_member_id,
            code,
            detail: detail.to_string(),
        };
        session
            .response_publication()
            .map_or(false, |publication| publication.offer(&event.encode()) > 0)
    }

    pub fn send_challenge(&self, session: &ClusterSession, encoded_challenge: Bytes) -> bool {
        let event = EgressEvent::Challenge {
            correlation_id: session.correlation_id(),
            cluster_session_id: session.id(),
            encoded_challenge,
        };
        session
            .response_publication()
            .map_or(false, |publication| publication.offer(&event.encode()) > 0)
    }

    pub fn new_leader(
        &self,
        session: &ClusterSession,
        leadership_term_id: i64,
        leader_member_id: i32,
        ingress_endpoints: &str,
    ) -> bool {
        let event = EgressEvent::NewLeader {
            cluster_session_id: session.id(),
            leadership_term_id,
            leader_member_id,
            ingress_endpoints: ingress_endpoints.to_string(),
        };
        session
            .response_publication()
            .map_or(false, |publication| publication.offer(&event.encode()) > 0)
    }
}

/// The authenticator's handle on a pending session: authenticate, challenge
/// or reject.
pub struct SessionProxy<'a> {
    session: &'a mut ClusterSession,
    egress: &'a EgressPublisher,
}

impl<'a> SessionProxy<'a> {
    pub fn new(session: &'a mut ClusterSession, egress: &'a EgressPublisher) -> Self {
        Self { session, egress }
    }

    pub fn session_id(&self) -> i64 {
        self.session.id()
    }

    pub fn authenticate(&mut self) {
        self.session.authenticated();
    }

    /// Sends the challenge; the session only moves to `Challenged` once the
    /// client can actually receive it.
    pub fn challenge(&mut self, encoded_challenge: Bytes) -> bool {
        if self.egress.send_challenge(self.session, encoded_challenge) {
            self.session.challenged();
            true
        } else {
            false
        }
    }

    pub fn reject(&mut self) {
        self.session
            .reject(EventCode::AuthenticationRejected, SESSION_REJECTED_DETAIL);
    }
}
