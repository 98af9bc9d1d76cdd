//! Publications, subscriptions and images.
//!
//! Delivery is pull-based: a publication retains offered frames from its
//! initial position and every subscription walks its own per-image position
//! cursor over them at `poll` time. Replay sessions opened through the
//! archive appear as additional frame sources for the same image, so a
//! replay-then-live destination switch merges naturally: frames are
//! delivered exactly once, in position order, regardless of which source
//! supplies them first.
//!
//! Back-pressure is the publication's flow-control window: `offer` refuses
//! with [`BACK_PRESSURE`] while the slowest attached image is more than
//! [`TERM_WINDOW`] bytes behind.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use crate::archive::{ArchiveState, RecordingState};
use crate::channel::ChannelUri;
use crate::counter::Counters;
use crate::{aligned_frame_length, BACK_PRESSURE, NOT_CONNECTED, NULL_POSITION};

/// Maximum bytes an attached image may lag before `offer` back-pressures.
pub const TERM_WINDOW: i64 = 1 << 20;

/// URI param giving a publication an explicit initial stream position, used
/// by the replicated-log publication so late-attaching images still receive
/// every frame from the term base.
pub const INIT_POSITION_PARAM: &str = "init-position";

/// Action returned by a poll fragment handler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    /// Frame consumed; the image position advances past it.
    Continue,
    /// Frame not consumed; it is redelivered on the next poll.
    Abort,
}

#[derive(Clone, Debug)]
pub(crate) struct Frame {
    pub start: i64,
    pub end: i64,
    pub payload: Bytes,
}

pub(crate) struct PubState {
    pub session_id: i32,
    pub stream_id: i32,
    pub created_seq: u64,
    pub initial_position: i64,
    /// When set, images attach at the earliest retained frame rather than at
    /// the live position.
    pub retain_history: bool,
    pub position: AtomicI64,
    pub frames: Mutex<Vec<Frame>>,
    pub destinations: Mutex<Vec<String>>,
    pub closed: AtomicBool,
    pub recording: Mutex<Option<Arc<Mutex<RecordingState>>>>,
}

impl PubState {
    pub(crate) fn frame_at(&self, position: i64) -> Option<Frame> {
        let frames = self.frames.lock().unwrap();
        match frames.binary_search_by_key(&position, |frame| frame.start) {
            Ok(index) => Some(frames[index].clone()),
            Err(_) => None,
        }
    }
}

pub(crate) struct SubState {
    pub stream_id: i32,
    pub created_seq: u64,
    pub endpoints: Mutex<Vec<String>>,
    pub images: Mutex<HashMap<i32, ImageState>>,
    pub recording: Mutex<Option<Arc<Mutex<RecordingState>>>>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ImageState {
    pub next_position: i64,
    pub closed: bool,
}

#[derive(Clone)]
pub(crate) struct ReplayState {
    pub replay_id: i64,
    pub recording: Arc<Mutex<RecordingState>>,
    pub from_position: i64,
    pub stop_position: i64,
    pub endpoint: String,
    pub stream_id: i32,
    pub session_id: i32,
}

#[derive(Default)]
pub(crate) struct NetworkState {
    pub publications: Vec<Weak<PubState>>,
    pub subscriptions: Vec<Weak<SubState>>,
    pub replays: Vec<ReplayState>,
    /// Sessions whose publication has gone away entirely.
    pub closed_sessions: HashSet<i32>,
}

pub(crate) struct Network {
    pub state: Mutex<NetworkState>,
    pub next_session_id: AtomicI32,
    pub next_correlation_id: AtomicI64,
    pub next_seq: AtomicI64,
}

impl Network {
    fn new() -> Self {
        Self {
            state: Mutex::new(NetworkState::default()),
            next_session_id: AtomicI32::new(1),
            next_correlation_id: AtomicI64::new(1),
            next_seq: AtomicI64::new(1),
        }
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) as u64
    }

    /// Subscriptions whose endpoint set intersects `endpoints` on `stream_id`.
    fn matching_subs(&self, endpoints: &[String], stream_id: i32) -> Vec<Arc<SubState>> {
        let state = self.state.lock().unwrap();
        state
            .subscriptions
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|sub| {
                sub.stream_id == stream_id
                    && sub
                        .endpoints
                        .lock()
                        .unwrap()
                        .iter()
                        .any(|endpoint| endpoints.contains(endpoint))
            })
            .collect()
    }

    pub(crate) fn find_publication_by_session(
        &self,
        session_id: i32,
        stream_id: i32,
    ) -> Option<Arc<PubState>> {
        let state = self.state.lock().unwrap();
        state
            .publications
            .iter()
            .filter_map(Weak::upgrade)
            .find(|p| p.session_id == session_id && p.stream_id == stream_id)
    }

    /// Most recently added subscription on the endpoint: several consumers
    /// (module, services) share log endpoints, and archive attachment always
    /// targets the one just created.
    pub(crate) fn find_subscription_by_endpoint(
        &self,
        endpoint: &str,
        stream_id: i32,
    ) -> Option<Arc<SubState>> {
        let state = self.state.lock().unwrap();
        state
            .subscriptions
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| {
                s.stream_id == stream_id
                    && s.endpoints.lock().unwrap().iter().any(|e| e == endpoint)
            })
            .last()
    }

    /// The subscription on the endpoint that carries a recording tap.
    pub(crate) fn find_recording_subscription(
        &self,
        endpoint: &str,
        stream_id: i32,
    ) -> Option<Arc<SubState>> {
        let state = self.state.lock().unwrap();
        state
            .subscriptions
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| {
                s.stream_id == stream_id
                    && s.endpoints.lock().unwrap().iter().any(|e| e == endpoint)
            })
            .find(|s| s.recording.lock().unwrap().is_some())
    }
}

/// Handle on the in-process transport. Clones share the same network and
/// counters.
#[derive(Clone)]
pub struct Transport {
    pub(crate) network: Arc<Network>,
    counters: Counters,
    archive: Arc<Mutex<ArchiveState>>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        Self {
            network: Arc::new(Network::new()),
            counters: Counters::new(),
            archive: Arc::new(Mutex::new(ArchiveState::default())),
        }
    }

    pub(crate) fn archive_state(&self) -> Arc<Mutex<ArchiveState>> {
        Arc::clone(&self.archive)
    }

    pub fn counters(&self) -> Counters {
        self.counters.clone()
    }

    pub fn next_correlation_id(&self) -> i64 {
        self.network.next_correlation_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_publication(&self, channel: &str, stream_id: i32) -> Publication {
        let uri = ChannelUri::parse(channel);
        let session_id = uri
            .session_id()
            .unwrap_or_else(|| self.network.next_session_id.fetch_add(1, Ordering::Relaxed));
        let initial_position = uri
            .get(INIT_POSITION_PARAM)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let retain_history = uri.get(INIT_POSITION_PARAM).is_some();

        let state = Arc::new(PubState {
            session_id,
            stream_id,
            created_seq: self.network.next_seq(),
            initial_position,
            retain_history,
            position: AtomicI64::new(initial_position),
            frames: Mutex::new(Vec::new()),
            destinations: Mutex::new(uri.endpoint().map(str::to_string).into_iter().collect()),
            closed: AtomicBool::new(false),
            recording: Mutex::new(None),
        });

        self.network
            .state
            .lock()
            .unwrap()
            .publications
            .push(Arc::downgrade(&state));

        Publication {
            network: Arc::clone(&self.network),
            state,
        }
    }

    pub fn add_subscription(&self, channel: &str, stream_id: i32) -> Subscription {
        let uri = ChannelUri::parse(channel);
        let state = Arc::new(SubState {
            stream_id,
            created_seq: self.network.next_seq(),
            endpoints: Mutex::new(uri.endpoint().map(str::to_string).into_iter().collect()),
            images: Mutex::new(HashMap::new()),
            recording: Mutex::new(None),
        });

        self.network
            .state
            .lock()
            .unwrap()
            .subscriptions
            .push(Arc::downgrade(&state));

        Subscription {
            network: Arc::clone(&self.network),
            state,
        }
    }
}

#[derive(Clone)]
pub struct Publication {
    network: Arc<Network>,
    pub(crate) state: Arc<PubState>,
}

impl std::fmt::Debug for Publication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publication")
            .field("session_id", &self.state.session_id)
            .field("stream_id", &self.state.stream_id)
            .finish()
    }
}

impl Publication {
    pub fn session_id(&self) -> i32 {
        self.state.session_id
    }

    pub fn stream_id(&self) -> i32 {
        self.state.stream_id
    }

    pub fn position(&self) -> i64 {
        self.state.position.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        let destinations = self.state.destinations.lock().unwrap().clone();
        !self
            .network
            .matching_subs(&destinations, self.state.stream_id)
            .is_empty()
    }

    pub fn add_destination(&self, endpoint: &str) {
        let mut destinations = self.state.destinations.lock().unwrap();
        if !destinations.iter().any(|e| e == endpoint) {
            destinations.push(endpoint.to_string());
        }
    }

    pub fn remove_destination(&self, endpoint: &str) {
        self.state.destinations.lock().unwrap().retain(|e| e != endpoint);
    }

    /// Appends a payload, returning the post-append stream position, or
    /// [`BACK_PRESSURE`] when the slowest attached image is outside the flow
    /// control window, or [`NOT_CONNECTED`] when the publication is closed.
    pub fn offer(&self, payload: &[u8]) -> i64 {
        if self.is_closed() {
            return NOT_CONNECTED;
        }

        let start = self.state.position.load(Ordering::Relaxed);
        let end = start + aligned_frame_length(payload.len()) as i64;

        let destinations = self.state.destinations.lock().unwrap().clone();
        let subscribers = self.network.matching_subs(&destinations, self.state.stream_id);
        if subscribers.is_empty() && self.state.recording.lock().unwrap().is_none() {
            // An attached recording still consumes the stream.
            return NOT_CONNECTED;
        }
        for sub in subscribers {
            let images = sub.images.lock().unwrap();
            if let Some(image) = images.get(&self.state.session_id) {
                if !image.closed && end - image.next_position > TERM_WINDOW {
                    return BACK_PRESSURE;
                }
            }
        }

        let frame = Frame {
            start,
            end,
            payload: Bytes::copy_from_slice(payload),
        };

        if let Some(recording) = self.state.recording.lock().unwrap().as_ref() {
            recording.lock().unwrap().record(&frame);
        }

        self.state.frames.lock().unwrap().push(frame);
        self.state.position.store(end, Ordering::Release);
        end
    }

    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.network
            .state
            .lock()
            .unwrap()
            .closed_sessions
            .insert(self.state.session_id);
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        // Last handle gone: the network weak ref expires and images close.
        if Arc::strong_count(&self.state) == 1 {
            self.close();
        }
    }
}

pub struct Subscription {
    network: Arc<Network>,
    pub(crate) state: Arc<SubState>,
}

impl Subscription {
    pub fn stream_id(&self) -> i32 {
        self.state.stream_id
    }

    pub fn add_destination(&self, endpoint: &str) {
        let mut endpoints = self.state.endpoints.lock().unwrap();
        if !endpoints.iter().any(|e| e == endpoint) {
            endpoints.push(endpoint.to_string());
        }
    }

    pub fn remove_destination(&self, endpoint: &str) {
        self.state.endpoints.lock().unwrap().retain(|e| e != endpoint);
    }

    pub fn has_image(&self, session_id: i32) -> bool {
        self.state.images.lock().unwrap().contains_key(&session_id)
    }

    pub fn image_position(&self, session_id: i32) -> i64 {
        self.state
            .images
            .lock()
            .unwrap()
            .get(&session_id)
            .map_or(NULL_POSITION, |image| image.next_position)
    }

    pub fn is_image_closed(&self, session_id: i32) -> bool {
        let locally_closed = self
            .state
            .images
            .lock()
            .unwrap()
            .get(&session_id)
            .map_or(false, |image| image.closed);
        locally_closed
            || self
                .network
                .state
                .lock()
                .unwrap()
                .closed_sessions
                .contains(&session_id)
    }

    /// Delivers up to `limit` frames in position order per image. The
    /// handler receives `(session_id, end_position, payload)`; returning
    /// [`Action::Abort`] leaves the frame for redelivery.
    pub fn poll<H>(&self, mut handler: H, limit: usize) -> usize
    where
        H: FnMut(i32, i64, &[u8]) -> Action,
    {
        let sources = self.gather_sources();
        self.capture_into_recording(&sources);
        let mut count = 0;

        for source in &sources {
            while count < limit {
                let (next, closed_seen) = self.image_cursor(source);
                let Some(next) = next else { break };

                match source.frame_at(next) {
                    Some(frame) => {
                        if handler(source.session_id(), frame.end, &frame.payload)
                            == Action::Abort
                        {
                            return count;
                        }
                        self.advance_image(source.session_id(), frame.end);
                        count += 1;
                    }
                    None => {
                        if source.is_closed() && !closed_seen {
                            self.close_image(source.session_id());
                        }
                        break;
                    }
                }
            }
        }

        count
    }

    fn gather_sources(&self) -> Vec<FrameSource> {
        let endpoints = self.state.endpoints.lock().unwrap().clone();
        let mut sources = Vec::new();

        {
            let network = self.network.state.lock().unwrap();
            for replay in &network.replays {
                if replay.stream_id == self.state.stream_id
                    && endpoints.iter().any(|e| *e == replay.endpoint)
                {
                    sources.push(FrameSource::Replay(replay.clone()));
                }
            }
            for publication in network.publications.iter().filter_map(Weak::upgrade) {
                if publication.stream_id != self.state.stream_id {
                    continue;
                }
                let matches = publication
                    .destinations
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|endpoint| endpoints.contains(endpoint));
                if matches {
                    sources.push(FrameSource::Live(publication));
                }
            }
        }

        // Replay sources come first so an image attaching during catch-up
        // starts from the replayed history rather than the live edge.
        sources
    }

    /// Current cursor for the source's image, attaching a new image at the
    /// source's join position when first seen. Returns `(next, closed)`.
    fn image_cursor(&self, source: &FrameSource) -> (Option<i64>, bool) {
        let mut images = self.state.images.lock().unwrap();
        if let Some(image) = images.get(&source.session_id()) {
            if image.closed {
                return (None, true);
            }
            return (Some(image.next_position), false);
        }

        let Some(join) = source.join_position(self.state.created_seq) else {
            return (None, false);
        };
        images.insert(
            source.session_id(),
            ImageState {
                next_position: join,
                closed: false,
            },
        );
        (Some(join), false)
    }

    fn advance_image(&self, session_id: i32, position: i64) {
        if let Some(image) = self.state.images.lock().unwrap().get_mut(&session_id) {
            image.next_position = position;
        }
    }

    fn close_image(&self, session_id: i32) {
        if let Some(image) = self.state.images.lock().unwrap().get_mut(&session_id) {
            image.closed = true;
        }
    }

    /// An attached recording chases every frame available from the sources,
    /// independent of how far the handler has consumed: appending to the
    /// archive is bounded by arrival, consumption by the caller.
    fn capture_into_recording(&self, sources: &[FrameSource]) {
        let Some(recording) = self.state.recording.lock().unwrap().clone() else {
            return;
        };
        let mut recording = recording.lock().unwrap();
        if !recording.active {
            return;
        }

        let mut budget = 256;
        while budget > 0 {
            let position = recording.position;
            let frame = if position == NULL_POSITION {
                sources.iter().find_map(|source| {
                    source
                        .join_position(self.state.created_seq)
                        .and_then(|join| source.frame_at(join))
                })
            } else {
                sources.iter().find_map(|source| source.frame_at(position))
            };

            match frame {
                Some(frame) => {
                    recording.record(&frame);
                    if recording.position == position {
                        break;
                    }
                    budget -= 1;
                }
                None => break,
            }
        }
    }
}

enum FrameSource {
    Live(Arc<PubState>),
    Replay(ReplayState),
}

impl FrameSource {
    fn session_id(&self) -> i32 {
        match self {
            FrameSource::Live(publication) => publication.session_id,
            FrameSource::Replay(replay) => replay.session_id,
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            FrameSource::Live(publication) => publication.closed.load(Ordering::Acquire),
            FrameSource::Replay(_) => false,
        }
    }

    /// Position a freshly-attached image starts from. A publication created
    /// after the subscription delivers from its first frame, as does one
    /// retaining history; a pre-existing plain publication joins at the live
    /// edge. Replays join at their requested start.
    fn join_position(&self, subscriber_seq: u64) -> Option<i64> {
        match self {
            FrameSource::Live(publication) => {
                if publication.retain_history || publication.created_seq > subscriber_seq {
                    Some(publication.initial_position)
                } else {
                    Some(publication.position.load(Ordering::Acquire))
                }
            }
            FrameSource::Replay(replay) => Some(replay.from_position),
        }
    }

    fn frame_at(&self, position: i64) -> Option<Frame> {
        match self {
            FrameSource::Live(publication) => publication.frame_at(position),
            FrameSource::Replay(replay) => {
                if position >= replay.stop_position {
                    return None;
                }
                replay.recording.lock().unwrap().frame_at(position)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aligned_frame_length;

    fn collect(subscription: &Subscription, limit: usize) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        subscription.poll(
            |_, _, payload| {
                frames.push(payload.to_vec());
                Action::Continue
            },
            limit,
        );
        frames
    }

    #[test]
    fn offer_and_poll_in_order() {
        let transport = Transport::new();
        let subscription = transport.add_subscription("mem:peer", 10);
        let publication = transport.add_publication("mem:peer", 10);

        assert_eq!(publication.offer(b"one"), aligned_frame_length(3) as i64);
        publication.offer(b"two");

        assert_eq!(collect(&subscription, 10), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(collect(&subscription, 10), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn late_subscriber_skips_history_on_plain_channel() {
        let transport = Transport::new();
        let publication = transport.add_publication("mem:peer", 10);
        publication.offer(b"missed");

        let subscription = transport.add_subscription("mem:peer", 10);
        // First poll attaches the image at the live edge.
        assert!(collect(&subscription, 10).is_empty());
        publication.offer(b"seen");
        assert_eq!(collect(&subscription, 10), vec![b"seen".to_vec()]);
    }

    #[test]
    fn late_subscriber_replays_history_on_log_channel() {
        let transport = Transport::new();
        let publication = transport.add_publication("mem:log?init-position=0", 10);
        publication.offer(b"first");

        let subscription = transport.add_subscription("mem:log", 10);
        publication.offer(b"second");

        assert_eq!(
            collect(&subscription, 10),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
    }

    #[test]
    fn abort_leaves_frame_for_redelivery() {
        let transport = Transport::new();
        let subscription = transport.add_subscription("mem:peer", 5);
        let publication = transport.add_publication("mem:peer", 5);
        publication.offer(b"retry-me");

        let delivered = subscription.poll(|_, _, _| Action::Abort, 10);
        assert_eq!(delivered, 0);
        assert_eq!(collect(&subscription, 10), vec![b"retry-me".to_vec()]);
    }

    #[test]
    fn image_closes_when_publication_drops() {
        let transport = Transport::new();
        let subscription = transport.add_subscription("mem:peer", 5);
        let publication = transport.add_publication("mem:peer", 5);
        let session_id = publication.session_id();
        publication.offer(b"only");
        assert_eq!(collect(&subscription, 10), vec![b"only".to_vec()]);

        drop(publication);
        assert_eq!(collect(&subscription, 10), Vec::<Vec<u8>>::new());
        assert!(subscription.is_image_closed(session_id));
    }

    #[test]
    fn back_pressure_when_image_lags() {
        let transport = Transport::new();
        let subscription = transport.add_subscription("mem:peer", 5);
        let publication = transport.add_publication("mem:peer", 5);

        publication.offer(b"x");
        assert_eq!(collect(&subscription, 1).len(), 1);

        let payload = vec![0u8; 1024];
        let mut result = 0;
        for _ in 0..(TERM_WINDOW / 1024 + 2) {
            result = publication.offer(&payload);
            if result == BACK_PRESSURE {
                break;
            }
        }
        assert_eq!(result, BACK_PRESSURE);
    }

    #[test]
    fn multicast_to_added_destinations() {
        let transport = Transport::new();
        let first = transport.add_subscription("mem:a", 9);
        let second = transport.add_subscription("mem:b", 9);

        let publication = transport.add_publication("mem:?init-position=0", 9);
        publication.add_destination("a");
        publication.add_destination("b");
        publication.offer(b"both");

        assert_eq!(collect(&first, 10), vec![b"both".to_vec()]);
        assert_eq!(collect(&second, 10), vec![b"both".to_vec()]);
    }
}
