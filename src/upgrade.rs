//! Runtime change of the pipeline after `101 Switching Protocols`
//!
//! ```text
//!              observe(101)              complete(ack)
//!   [ Http1 ] ─────────────> [ UpgradeInFlight ] ─────────────> [ Upgraded ]
//!
//!   Http1 stages:    codec, bridge, admission, chunked writer
//!   Upgraded stages: upgraded stage (+ bytes read past the upgrade request)
//! ```

use crate::{
    buffer::{bridge::BufferBridge, internal::ChunkedWriter},
    http::{codec::H1Codec, message::Response, types::StatusCode},
    server::{
        admission::{AdmissionPermit, ConnectionId},
        shutdown::Shutdown,
    },
};
use bytes::{Bytes, BytesMut};
use std::{collections::VecDeque, net::SocketAddr};

/// Protocol named by the `Upgrade` header of a switching response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    WebSocket,
    /// HTTP/2 over cleartext TCP.
    H2c,
    Other,
}

impl Protocol {
    /// Matches the first token of an `Upgrade` value, without regard to
    /// ASCII case.
    #[inline]
    pub fn from_token(value: &[u8]) -> Self {
        let token = value.split(|&b| b == b',').next().unwrap_or_default();

        match crate::http::types::trim(token) {
            t if t.eq_ignore_ascii_case(b"websocket") => Self::WebSocket,
            t if t.eq_ignore_ascii_case(b"h2c") => Self::H2c,
            _ => Self::Other,
        }
    }
}

/// Topology of a connection's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Http1,
    /// A switching response is being written.
    UpgradeInFlight(Protocol),
    Upgraded(Protocol),
}

/// Identity of a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Codec,
    Bridge,
    Admission,
    ChunkedWriter,
    Upgraded,
}

/// Stages of one connection.
///
/// Every stage is optional so that the upgrade can remove the HTTP ones;
/// removing a stage that is not there does nothing.
#[derive(Debug)]
pub struct Pipeline {
    connection: ConnectionId,
    state: PipelineState,

    codec: Option<H1Codec>,
    bridge: Option<BufferBridge>,
    admission: Option<AdmissionPermit>,
    chunked_writer: Option<ChunkedWriter>,
    upgraded: Option<UpgradedStage>,
}

impl Pipeline {
    #[inline]
    pub(crate) fn http1(codec: H1Codec, bridge: BufferBridge, admission: AdmissionPermit) -> Self {
        Self {
            connection: admission.id(),
            state: PipelineState::Http1,

            codec: Some(codec),
            bridge: Some(bridge),
            admission: Some(admission),
            chunked_writer: Some(ChunkedWriter),
            upgraded: None,
        }
    }

    #[inline(always)]
    pub const fn connection(&self) -> ConnectionId {
        self.connection
    }

    #[inline(always)]
    pub const fn state(&self) -> PipelineState {
        self.state
    }

    pub fn has_stage(&self, stage: Stage) -> bool {
        match stage {
            Stage::Codec => self.codec.is_some(),
            Stage::Bridge => self.bridge.is_some(),
            Stage::Admission => self.admission.is_some(),
            Stage::ChunkedWriter => self.chunked_writer.is_some(),
            Stage::Upgraded => self.upgraded.is_some(),
        }
    }

    #[inline(always)]
    pub(crate) fn codec(&self) -> Option<&H1Codec> {
        self.codec.as_ref()
    }

    #[inline(always)]
    pub(crate) fn codec_mut(&mut self) -> Option<&mut H1Codec> {
        self.codec.as_mut()
    }

    /// Bridge and codec together, for the read path.
    #[inline]
    pub(crate) fn inbound(&mut self) -> Option<(&BufferBridge, &mut H1Codec)> {
        match (&self.bridge, &mut self.codec) {
            (Some(bridge), Some(codec)) => Some((bridge, codec)),
            _ => None,
        }
    }

    /// Bridge and chunked writer together, for the write path.
    #[inline]
    pub(crate) fn outbound(&self) -> Option<(&BufferBridge, ChunkedWriter)> {
        match (&self.bridge, self.chunked_writer) {
            (Some(bridge), Some(writer)) => Some((bridge, writer)),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn take_upgraded(&mut self) -> Option<UpgradedStage> {
        self.upgraded.take()
    }
}

/// Pending change from HTTP/1 to `protocol`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeTransition {
    protocol: Protocol,
    connection: ConnectionId,
}

impl UpgradeTransition {
    const REMOVED: [Stage; 4] = [
        Stage::Codec,
        Stage::Bridge,
        Stage::Admission,
        Stage::ChunkedWriter,
    ];

    #[inline(always)]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[inline(always)]
    pub const fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Stages removed once the switching response is acknowledged.
    #[inline(always)]
    pub const fn removes(&self) -> &'static [Stage] {
        &Self::REMOVED
    }
}

/// Proof that the transport accepted a whole response.
///
/// Only the connection's write path creates one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    bytes: u64,
}

impl WriteAck {
    #[inline(always)]
    pub(crate) const fn new(bytes: u64) -> Self {
        Self { bytes }
    }

    #[inline(always)]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Changes the pipeline when a `101` response goes out.
///
/// The change happens in two steps: [`observe`](Self::observe) sees the
/// response before it is written, [`complete`](Self::complete) applies the
/// transition once the write is acknowledged. Nothing is removed if the
/// write fails.
///
/// # Examples
/// ```
/// use tollgate::{PipelineState, Protocol, Response, UpgradeCoordinator};
///
/// let mut coordinator = UpgradeCoordinator::default();
/// assert!(coordinator.pending().is_none());
///
/// let mut state = PipelineState::Http1;
/// let transition = UpgradeCoordinator::transition_for(&mut state, &Response::ok());
/// assert!(transition.is_none());
/// assert_eq!(state, PipelineState::Http1);
///
/// let response = Response::switching_protocols("websocket");
/// assert_eq!(UpgradeCoordinator::protocol_of(&response), Some(Protocol::WebSocket));
/// ```
#[derive(Debug, Default)]
pub struct UpgradeCoordinator {
    pending: Option<UpgradeTransition>,
}

impl UpgradeCoordinator {
    #[inline(always)]
    pub const fn pending(&self) -> Option<&UpgradeTransition> {
        self.pending.as_ref()
    }

    /// Protocol a response switches to, `None` unless the status is `101`.
    #[inline]
    pub fn protocol_of(response: &Response) -> Option<Protocol> {
        match response.status {
            StatusCode::SwitchingProtocols => Some(Protocol::from_token(
                response.header_value(b"upgrade").unwrap_or_default(),
            )),
            _ => None,
        }
    }

    /// Moves `state` to `UpgradeInFlight` for a `101` response on an HTTP/1
    /// pipeline. Any other response, or a second `101`, leaves it alone.
    #[inline]
    pub fn transition_for(state: &mut PipelineState, response: &Response) -> Option<Protocol> {
        let protocol = Self::protocol_of(response)?;
        if *state != PipelineState::Http1 {
            return None;
        }

        *state = PipelineState::UpgradeInFlight(protocol);
        Some(protocol)
    }

    /// Looks at a response about to be written. Returns `true` if it starts
    /// an upgrade.
    pub fn observe(&mut self, pipeline: &mut Pipeline, response: &Response) -> bool {
        let Some(protocol) = Self::transition_for(&mut pipeline.state, response) else {
            return false;
        };

        tracing::trace!(conn = %pipeline.connection, ?protocol, "upgrade in flight");
        self.pending = Some(UpgradeTransition {
            protocol,
            connection: pipeline.connection,
        });
        true
    }

    /// Applies the pending transition after the switching response was
    /// acknowledged.
    ///
    /// Bytes the codec had buffered past the upgrade request move into the
    /// upgraded stage. Dropping the admission permit releases the
    /// connection's slot.
    pub fn complete<'p>(
        &mut self,
        pipeline: &'p mut Pipeline,
        ack: WriteAck,
    ) -> Option<&'p mut UpgradedStage> {
        let transition = self.pending.take()?;

        let leftover = pipeline.codec.take().map(|mut codec| codec.take_buffered());
        pipeline.bridge = None;
        pipeline.admission = None;
        pipeline.chunked_writer = None;

        let stage = pipeline
            .upgraded
            .get_or_insert_with(|| UpgradedStage::new(transition.protocol, transition.connection));
        if let Some(bytes) = leftover {
            stage.push(bytes);
        }

        pipeline.state = PipelineState::Upgraded(transition.protocol);
        tracing::trace!(
            conn = %transition.connection,
            protocol = ?transition.protocol,
            acked = ack.bytes(),
            leftover = stage.queued_bytes(),
            "pipeline upgraded"
        );

        Some(stage)
    }
}

//

/// Stage installed on an upgraded connection.
///
/// It only knows the connection it is bound to and queues inbound bytes
/// until the new protocol's handler takes them. Consecutive pieces are
/// joined by [`coalesce`](Self::coalesce).
#[derive(Debug)]
pub struct UpgradedStage {
    protocol: Protocol,
    connection: ConnectionId,
    queue: VecDeque<Bytes>,
    queued: usize,
}

impl UpgradedStage {
    #[inline]
    pub fn new(protocol: Protocol, connection: ConnectionId) -> Self {
        Self {
            protocol,
            connection,
            queue: VecDeque::new(),
            queued: 0,
        }
    }

    #[inline(always)]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[inline(always)]
    pub const fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Empty pieces are ignored.
    #[inline]
    pub fn push(&mut self, bytes: Bytes) {
        if !bytes.is_empty() {
            self.queued += bytes.len();
            self.queue.push_back(bytes);
        }
    }

    #[inline(always)]
    pub const fn queued_bytes(&self) -> usize {
        self.queued
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Takes every queued byte as one contiguous piece, in arrival order.
    pub fn coalesce(&mut self) -> Bytes {
        self.queued = 0;

        match self.queue.len() {
            0 => Bytes::new(),
            1 => self.queue.pop_front().unwrap_or_default(),
            _ => {
                let mut joined = BytesMut::with_capacity(self.queue.iter().map(Bytes::len).sum());
                for piece in self.queue.drain(..) {
                    joined.extend_from_slice(&piece);
                }
                joined.freeze()
            }
        }
    }
}

/// Transport of an upgraded connection, handed to the
/// [`UpgradeHandler`](crate::UpgradeHandler).
#[derive(Debug)]
pub struct ConnectionHandle<IO> {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    shutdown: Shutdown,
    io: IO,
}

impl<IO> ConnectionHandle<IO> {
    #[inline]
    pub(crate) fn new(id: ConnectionId, peer: Option<SocketAddr>, shutdown: Shutdown, io: IO) -> Self {
        Self {
            id,
            peer,
            shutdown,
            io,
        }
    }

    /// Server shutdown signal. The upgraded protocol should close the
    /// connection once it is triggered.
    #[inline(always)]
    pub const fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    #[inline(always)]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline(always)]
    pub const fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[inline(always)]
    pub fn io_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    #[inline]
    pub fn into_inner(self) -> IO {
        self.io
    }
}

#[cfg(test)]
mod upgrade_tests {
    use super::*;
    use crate::{
        buffer::{bridge::Framing, internal::InternalBuffer},
        limits::CodecLimits,
        server::admission::Admission,
    };

    fn pipeline(admission: &Admission) -> Pipeline {
        Pipeline::http1(
            H1Codec::new(CodecLimits::default()),
            BufferBridge::new(Framing::Http1),
            admission.admit(),
        )
    }

    #[test]
    fn protocol_tokens() {
        #[rustfmt::skip]
        let cases = [
            ("websocket",      Protocol::WebSocket),
            ("WebSocket",      Protocol::WebSocket),
            (" h2c ",          Protocol::H2c),
            ("H2C, websocket", Protocol::H2c),
            ("irc/6.9",        Protocol::Other),
            ("",               Protocol::Other),
        ];

        for (value, expected) in cases {
            assert_eq!(Protocol::from_token(value.as_bytes()), expected, "{value:?}");
        }
    }

    #[test]
    fn only_101_starts_an_upgrade() {
        let admission = Admission::default();
        let mut pipeline = pipeline(&admission);
        let mut coordinator = UpgradeCoordinator::default();

        for response in [Response::ok(), Response::new(StatusCode::UpgradeRequired)] {
            assert!(!coordinator.observe(&mut pipeline, &response));
        }
        assert_eq!(pipeline.state(), PipelineState::Http1);
        assert!(coordinator.pending().is_none());
        assert!(coordinator.complete(&mut pipeline, WriteAck::new(10)).is_none());
        assert!(pipeline.has_stage(Stage::Codec));
    }

    #[test]
    fn upgrade_replaces_http_stages() {
        let admission = Admission::default();
        let mut pipeline = pipeline(&admission);
        let mut coordinator = UpgradeCoordinator::default();

        pipeline
            .codec_mut()
            .unwrap()
            .feed(&InternalBuffer::from("\u{81}\u{05}hello"));

        assert!(coordinator.observe(&mut pipeline, &Response::switching_protocols("websocket")));
        assert_eq!(pipeline.state(), PipelineState::UpgradeInFlight(Protocol::WebSocket));
        assert!(pipeline.has_stage(Stage::Codec));
        assert_eq!(admission.active(), 1);

        // A second switching response while one is in flight is ignored.
        assert!(!coordinator.observe(&mut pipeline, &Response::switching_protocols("h2c")));
        assert_eq!(coordinator.pending().unwrap().protocol(), Protocol::WebSocket);

        let stage = coordinator.complete(&mut pipeline, WriteAck::new(71)).unwrap();
        assert_eq!(stage.protocol(), Protocol::WebSocket);
        assert_eq!(stage.queued_bytes(), 8);

        assert_eq!(pipeline.state(), PipelineState::Upgraded(Protocol::WebSocket));
        for removed in UpgradeTransition::REMOVED {
            assert!(!pipeline.has_stage(removed), "{removed:?}");
        }
        assert!(pipeline.has_stage(Stage::Upgraded));
        assert_eq!(admission.active(), 0);

        let mut stage = pipeline.take_upgraded().unwrap();
        assert_eq!(stage.connection(), pipeline.connection());
        assert_eq!(&stage.coalesce()[..], "\u{81}\u{05}hello".as_bytes());
    }

    #[test]
    fn upgraded_stage_is_installed_once() {
        let admission = Admission::default();
        let mut pipeline = pipeline(&admission);
        let id = pipeline.connection();

        let mut existing = UpgradedStage::new(Protocol::Other, id);
        existing.push(Bytes::from_static(b"kept"));
        pipeline.upgraded = Some(existing);

        let mut coordinator = UpgradeCoordinator::default();
        assert!(coordinator.observe(&mut pipeline, &Response::switching_protocols("h2c")));

        let stage = coordinator.complete(&mut pipeline, WriteAck::new(0)).unwrap();
        assert_eq!(stage.protocol(), Protocol::Other);
        assert_eq!(&stage.coalesce()[..], b"kept");
        assert_eq!(pipeline.state(), PipelineState::Upgraded(Protocol::H2c));
    }

    #[test]
    fn removing_absent_stages_is_a_no_op() {
        let admission = Admission::default();
        let mut pipeline = pipeline(&admission);
        pipeline.codec = None;
        pipeline.chunked_writer = None;

        let mut coordinator = UpgradeCoordinator::default();
        assert!(coordinator.observe(&mut pipeline, &Response::switching_protocols("websocket")));

        let stage = coordinator.complete(&mut pipeline, WriteAck::new(0)).unwrap();
        assert!(stage.is_empty());
        assert!(!pipeline.has_stage(Stage::Bridge));
        assert_eq!(admission.active(), 0);
    }

    #[test]
    fn coalesce_joins_in_order() {
        let mut stage = UpgradedStage::new(Protocol::WebSocket, ConnectionId::new());

        for piece in ["ab", "", "cd", "e"] {
            stage.push(Bytes::from_static(piece.as_bytes()));
        }
        assert_eq!(stage.queued_bytes(), 5);

        assert_eq!(&stage.coalesce()[..], b"abcde");
        assert!(stage.is_empty());
        assert_eq!(stage.queued_bytes(), 0);
        assert!(stage.coalesce().is_empty());
    }
}
