use crate::{
    access::{AccessHooks, AccessRecord},
    buffer::{
        bridge::{BufferBridge, Framing, Inbound, Outbound},
        wire::WireBuffer,
    },
    errors::ErrorKind,
    guard::{crlf::CrlfValidator, decompress::DecompressionGuard},
    http::{
        codec::H1Codec,
        message::{Request, Response},
        types::{Method, StatusCode, Version},
    },
    server::{admission::AdmissionPermit, server_impl::Limits, shutdown::Shutdown},
    timeout::{IdleTimeoutConfig, TimeoutState, TimeoutStateMachine},
    upgrade::{Pipeline, UpgradeCoordinator, UpgradedStage, WriteAck},
};
use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use std::{io, net::SocketAddr, sync::Arc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::server_impl::Handler;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for, or receiving, a request.
    Reading,
    /// A response went out; waiting for the next request.
    Persisting,
    /// HTTP is finished, the transport belongs to another protocol.
    Upgraded,
}

pub(crate) enum Outcome<IO> {
    Closed,
    Upgraded {
        request: Request,
        stage: UpgradedStage,
        io: IO,
    },
}

enum Flow {
    Continue,
    Close,
    Upgraded(Request),
}

/// One HTTP/1 connection, from accept to close or upgrade.
///
/// Inbound bytes pass the buffer bridge into the codec, and the CRLF
/// validator screens the start of every message before it is parsed.
/// Decoded requests wait in a bounded queue and are answered one at a time
/// in arrival order.
pub(crate) struct Connection<IO, H> {
    io: IO,
    peer: Option<SocketAddr>,
    handler: Arc<H>,
    limits: Arc<Limits>,
    shutdown: Shutdown,

    phase: Phase,
    pipeline: Pipeline,
    upgrades: UpgradeCoordinator,
    timeouts: TimeoutStateMachine,
    access: AccessHooks,
    crlf: CrlfValidator,
    inflate: DecompressionGuard,

    queue: ArrayQueue<Request>,
    read_buf: BytesMut,
    decoded: usize,
    served: usize,
    version: Version,
}

impl<IO, H> Connection<IO, H>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
    H: Handler,
{
    pub(crate) fn new(
        io: IO,
        peer: Option<SocketAddr>,
        permit: AdmissionPermit,
        handler: Arc<H>,
        limits: Arc<Limits>,
        shutdown: Shutdown,
    ) -> Self {
        let pipeline = Pipeline::http1(
            H1Codec::new(limits.codec.clone()),
            BufferBridge::new(Framing::Http1),
            permit,
        );

        Self {
            io,
            peer,
            handler,
            shutdown,

            phase: Phase::Reading,
            pipeline,
            upgrades: UpgradeCoordinator::default(),
            timeouts: TimeoutStateMachine::new(IdleTimeoutConfig::from(&limits.conn)),
            access: AccessHooks::new(),
            crlf: CrlfValidator::default(),
            inflate: DecompressionGuard::new(limits.decompression.clone()),

            queue: ArrayQueue::new(limits.conn.max_queued_requests.max(1)),
            read_buf: BytesMut::with_capacity(limits.conn.read_buffer_size),
            decoded: 0,
            served: 0,
            version: Version::Http11,

            limits,
        }
    }

    #[inline(always)]
    pub(crate) const fn phase(&self) -> Phase {
        self.phase
    }

    /// Serves requests until the connection closes or is upgraded.
    ///
    /// Protocol errors are answered with a canned response when possible and
    /// close the connection; only transport failures are returned.
    pub(crate) async fn run(mut self) -> io::Result<Outcome<IO>> {
        let conn = self.pipeline.connection();
        tracing::trace!(%conn, client = ?self.peer, "connection active");
        self.timeouts.on_active();

        match self.drive().await {
            Ok(Flow::Upgraded(request)) => match self.pipeline.take_upgraded() {
                Some(stage) => Ok(Outcome::Upgraded {
                    request,
                    stage,
                    io: self.io,
                }),
                None => Ok(Outcome::Closed),
            },
            Ok(_) => {
                tracing::trace!(%conn, phase = ?self.phase(), served = self.served, "connection closed");
                if let Err(error) = self.io.shutdown().await {
                    tracing::trace!(%conn, %error, "transport shutdown failed");
                }
                Ok(Outcome::Closed)
            }
            Err(ErrorKind::Io(err)) => {
                tracing::debug!(%conn, error = %err, "connection failed");
                Err(err)
            }
            Err(err) => {
                self.fail(err).await;
                Ok(Outcome::Closed)
            }
        }
    }

    async fn drive(&mut self) -> Result<Flow, ErrorKind> {
        loop {
            if let Some(request) = self.queue.pop() {
                match self.respond(request).await? {
                    Flow::Continue => continue,
                    flow => return Ok(flow),
                }
            }

            if self.decode()? {
                continue;
            }
            if self.cap_reached() || !self.fill().await? {
                return Ok(Flow::Close);
            }
        }
    }

    #[inline]
    fn cap_reached(&self) -> bool {
        let cap = self.limits.conn.max_requests_per_connection;
        cap != 0 && self.decoded >= cap
    }

    /// Reads once from the transport. Returns `false` at end of stream.
    async fn fill(&mut self) -> Result<bool, ErrorKind> {
        self.read_buf.reserve(self.limits.conn.read_buffer_size);
        let idle = self.phase == Phase::Persisting;

        let read = tokio::select! {
            biased;
            read = self.io.read_buf(&mut self.read_buf) => read?,
            event = self.timeouts.expired() => return Err(event.into_error().into()),
            _ = self.shutdown.triggered(), if idle => {
                tracing::trace!(conn = %self.pipeline.connection(), "closing idle connection on shutdown");
                return Ok(false);
            }
        };
        if read == 0 {
            return Ok(false);
        }

        self.timeouts.on_bytes_received();
        self.access.on_inbound();
        self.phase = Phase::Reading;

        let wire = WireBuffer::new(self.read_buf.split());
        let Some((bridge, codec)) = self.pipeline.inbound() else {
            return Ok(false);
        };

        if let Inbound::Buffer(buffer) = bridge.on_inbound(Inbound::Wire(wire)) {
            codec.feed(&buffer);
        }

        Ok(true)
    }

    /// Moves complete requests from the codec into the queue. Returns `true`
    /// if anything was queued.
    fn decode(&mut self) -> Result<bool, ErrorKind> {
        let mut queued = false;

        while !self.queue.is_full() && !self.cap_reached() {
            let Some(codec) = self.pipeline.codec_mut() else {
                break;
            };

            // Empty lines are counted before anything parses the next message.
            codec.screen(&mut self.crlf)?;
            let Some(request) = codec.decode()? else {
                break;
            };

            self.crlf.message_complete();
            self.decoded += 1;
            self.timeouts.on_request_complete();
            let upgrade = request.upgrade().is_some();

            if self.queue.push(request).is_err() {
                break;
            }
            queued = true;

            // Bytes after an upgrade request may belong to the next protocol.
            if upgrade {
                break;
            }
        }

        Ok(queued)
    }

    async fn respond(&mut self, mut request: Request) -> Result<Flow, ErrorKind> {
        self.version = request.version;
        self.access.on_dequeue();

        let body = std::mem::take(&mut request.body);
        let bytes_read = body.remaining();
        request.body = self.inflate.decode(request.header(b"content-encoding"), body)?;

        let mut response = self.handler.handle(&request).await;
        self.served += 1;

        if response.status == StatusCode::SwitchingProtocols && !self.may_upgrade(&request) {
            tracing::warn!(
                conn = %self.pipeline.connection(),
                uri = %String::from_utf8_lossy(request.target()),
                "refusing 101 for a request that did not ask to upgrade"
            );
            response = Response::new(StatusCode::InternalServerError);
        }

        let cap = self.limits.conn.max_requests_per_connection;
        let last = cap != 0 && self.served >= cap;
        let upgrading = self.upgrades.observe(&mut self.pipeline, &response);
        let close = !upgrading
            && (!request.keep_alive || response.close || last || self.shutdown.is_triggered());

        let written = self.write_response(&request, &response, close).await?;

        self.access.on_outbound(AccessRecord {
            connection: self.pipeline.connection(),
            client: self.peer,
            method: request.method,
            target: request.target.clone(),
            version: request.version,
            status: response.status,
            bytes_read,
            bytes_written: written,
            elapsed: Default::default(),
        });

        if upgrading {
            self.timeouts.disarm();
            self.upgrades.complete(&mut self.pipeline, WriteAck::new(written));
            self.phase = Phase::Upgraded;
            return Ok(Flow::Upgraded(request));
        }
        if close {
            return Ok(Flow::Close);
        }

        if self.queue.is_empty() {
            match self.pipeline.codec().map_or(0, H1Codec::buffered) {
                0 => {
                    self.timeouts.on_response_written();
                    self.phase = Phase::Persisting;
                }
                _ => self.timeouts.arm(TimeoutState::ReadArmed),
            }
        }

        Ok(Flow::Continue)
    }

    /// A switching response is honoured only for a request that asked to
    /// upgrade, with nothing decoded behind it. Later requests would
    /// otherwise be lost with the HTTP stages.
    #[inline]
    fn may_upgrade(&self, request: &Request) -> bool {
        request.upgrade().is_some() && self.queue.is_empty()
    }

    /// Writes head and body under the write timeout. Returns the number of
    /// bytes the transport accepted.
    async fn write_response(
        &mut self,
        request: &Request,
        response: &Response,
        close: bool,
    ) -> Result<u64, ErrorKind> {
        let Some((bridge, writer)) = self.pipeline.outbound() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        };

        let head = H1Codec::encode_head(response, request.version, close);
        let body = match request.method {
            Method::Head => None,
            _ if !response.status.allows_body() => None,
            _ => match bridge.on_outbound(0, &response.body) {
                Outbound::Chunked(input) => Some(input),
                Outbound::Stream(data) => {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        format!("stream {} framing on an HTTP/1 connection", data.stream_id),
                    )
                    .into())
                }
            },
        };

        let io = &mut self.io;
        let write = async move {
            io.write_all(&head).await?;
            let mut written = head.len() as u64;

            if let Some(input) = body {
                written += writer.write(&mut *io, input).await?;
            }

            io.flush().await?;
            Ok::<_, io::Error>(written)
        };

        Ok(self.timeouts.guard_write(write).await??)
    }

    /// Sends the canned response for `err`, if any, and logs the failure.
    async fn fail(&mut self, err: ErrorKind) {
        let conn = self.pipeline.connection();

        if err.suppress_diagnostics() {
            tracing::debug!(%conn, client = ?self.peer, "rejected: {err}");
        } else {
            tracing::debug!(%conn, client = ?self.peer, error = %err, "closing connection");
        }

        let Some(canned) = err.canned() else {
            return;
        };

        let payload = canned.as_http(self.version, self.limits.server.json_errors);
        let io = &mut self.io;
        let sent = self
            .timeouts
            .guard_write(async move {
                io.write_all(payload).await?;
                io.shutdown().await
            })
            .await;

        match sent {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::warn!(%conn, %error, "failed to send error response"),
            Err(error) => tracing::warn!(%conn, %error, "failed to send error response"),
        }
    }
}

#[cfg(test)]
mod connection_tests {
    use super::*;
    use crate::{
        guard::crlf::IllegalInput, limits::ConnLimits, server::admission::Admission,
        upgrade::PipelineState,
    };
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };
    use tokio::io::{duplex, DuplexStream, ReadBuf};

    struct Echo;

    impl Handler for Echo {
        async fn handle(&self, request: &Request) -> Response {
            match request.path() {
                b"/up" => Response::switching_protocols("websocket"),
                _ => Response::ok().body(request.body().to_bytes()),
            }
        }
    }

    // Transport whose shutdown always fails.
    struct BrokenShutdown(DuplexStream);

    impl AsyncRead for BrokenShutdown {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for BrokenShutdown {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::NotConnected.into()))
        }
    }

    fn connection(
        conn: ConnLimits,
    ) -> (DuplexStream, Connection<DuplexStream, Echo>, Admission) {
        let (client, server) = duplex(4096);
        let admission = Admission::default();
        let limits = Arc::new(Limits {
            conn,
            ..Limits::default()
        });

        let conn = Connection::new(
            server,
            None,
            admission.admit(),
            Arc::new(Echo),
            limits,
            Shutdown::new(),
        );
        (client, conn, admission)
    }

    #[tokio::test]
    async fn phase_follows_the_exchange() {
        let (mut client, mut conn, _admission) = connection(ConnLimits::default());
        assert_eq!(conn.phase(), Phase::Reading);

        client.write_all(b"POST / HTTP/1.1\r\ncontent-length: 2\r\n\r\nhi").await.unwrap();
        assert!(conn.fill().await.unwrap());
        assert!(conn.decode().unwrap());
        assert_eq!(conn.timeouts.state(), TimeoutState::NoTimeout);

        let request = conn.queue.pop().unwrap();
        assert!(matches!(conn.respond(request).await.unwrap(), Flow::Continue));
        assert_eq!(conn.phase(), Phase::Persisting);
        assert_eq!(conn.timeouts.state(), TimeoutState::PersistArmed);

        let mut out = vec![0; 64];
        let n = client.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nhi");
    }

    #[tokio::test]
    async fn partial_request_arms_read() {
        let (mut client, mut conn, _admission) = connection(ConnLimits::default());

        client
            .write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\nhost:")
            .await
            .unwrap();
        assert!(conn.fill().await.unwrap());
        assert!(conn.decode().unwrap());
        assert_eq!(conn.queue.len(), 1);

        let request = conn.queue.pop().unwrap();
        conn.respond(request).await.unwrap();
        assert_eq!(conn.phase(), Phase::Reading);
        assert_eq!(conn.timeouts.state(), TimeoutState::ReadArmed);
    }

    #[tokio::test]
    async fn full_queue_pauses_decoding() {
        let (mut client, mut conn, _admission) = connection(ConnLimits {
            max_queued_requests: 2,
            ..ConnLimits::default()
        });

        client.write_all(&b"GET / HTTP/1.1\r\n\r\n".repeat(3)).await.unwrap();
        assert!(conn.fill().await.unwrap());
        assert!(conn.decode().unwrap());
        assert_eq!(conn.queue.len(), 2);
        assert_eq!(conn.pipeline.codec().unwrap().buffered(), 18);

        conn.queue.pop().unwrap();
        assert!(conn.decode().unwrap());
        assert_eq!(conn.queue.len(), 2);
        assert_eq!(conn.decoded, 3);
    }

    #[tokio::test]
    async fn empty_lines_after_a_pipelined_request_are_screened() {
        let (mut client, mut conn, _admission) = connection(ConnLimits::default());

        let mut flood = b"GET /a HTTP/1.1\r\n\r\n".to_vec();
        flood.extend_from_slice(&b"\r\n".repeat(50));
        flood.extend_from_slice(b"GET /b HTTP/1.1\r\n\r\n");
        client.write_all(&flood).await.unwrap();

        assert!(conn.fill().await.unwrap());
        assert!(matches!(
            conn.decode(),
            Err(ErrorKind::IllegalInput(IllegalInput { count: 3, .. }))
        ));
        assert_eq!(conn.decoded, 1);
    }

    #[tokio::test]
    async fn switching_response_needs_an_upgrade_request() {
        let (mut client, mut conn, _admission) = connection(ConnLimits::default());

        client
            .write_all(b"GET /up HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        assert!(conn.fill().await.unwrap());
        assert!(conn.decode().unwrap());
        assert_eq!(conn.queue.len(), 2);

        let request = conn.queue.pop().unwrap();
        assert!(matches!(conn.respond(request).await.unwrap(), Flow::Continue));
        assert_eq!(conn.pipeline.state(), PipelineState::Http1);
        assert!(conn.upgrades.pending().is_none());
        assert_eq!(conn.queue.len(), 1);

        let expected = "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\n\r\n";
        let mut out = vec![0; expected.len()];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(out, expected.as_bytes());
    }

    #[tokio::test]
    async fn multiplexed_framing_is_not_written() {
        let (_client, mut conn, admission) = connection(ConnLimits::default());
        conn.pipeline = Pipeline::http1(
            H1Codec::new(Default::default()),
            BufferBridge::new(Framing::Multiplexed),
            admission.admit(),
        );

        let mut codec = H1Codec::new(Default::default());
        codec.feed(&"GET / HTTP/1.1\r\n\r\n".into());
        let request = codec.decode().unwrap().unwrap();

        let err = conn
            .write_response(&request, &Response::ok().body("x"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ErrorKind::Io(err) if err.kind() == io::ErrorKind::Unsupported));
    }

    #[tokio::test]
    async fn request_cap_closes_after_last_response() {
        let (mut client, conn, admission) = connection(ConnLimits {
            max_requests_per_connection: 2,
            ..ConnLimits::default()
        });

        client.write_all(&b"GET / HTTP/1.1\r\n\r\n".repeat(3)).await.unwrap();
        assert!(matches!(conn.run().await.unwrap(), Outcome::Closed));

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();

        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
        assert_eq!(out.matches("connection: close").count(), 1);
        assert!(out.ends_with("connection: close\r\ncontent-length: 0\r\n\r\n"));
        assert_eq!(admission.active(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_an_idle_connection() {
        let (mut client, mut conn, _admission) = connection(ConnLimits::default());
        let shutdown = conn.shutdown.clone();

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert!(conn.fill().await.unwrap());
        assert!(conn.decode().unwrap());

        shutdown.trigger();
        let request = conn.queue.pop().unwrap();
        assert!(matches!(conn.respond(request).await.unwrap(), Flow::Close));

        conn.phase = Phase::Persisting;
        assert!(!conn.fill().await.unwrap());
    }

    #[tokio::test]
    async fn failed_transport_shutdown_still_closes() {
        let (mut client, server) = duplex(4096);
        let admission = Admission::default();

        let conn = Connection::new(
            BrokenShutdown(server),
            None,
            admission.admit(),
            Arc::new(Echo),
            Arc::new(Limits::default()),
            Shutdown::new(),
        );

        client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        assert!(matches!(conn.run().await.unwrap(), Outcome::Closed));
        assert_eq!(admission.active(), 0);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.starts_with(b"HTTP/1.0 200 OK\r\nconnection: close\r\n"));
    }
}
