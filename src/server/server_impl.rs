use crate::{
    errors::ErrorKind,
    http::{
        message::{Request, Response},
        types::Version,
    },
    limits::{CodecLimits, ConnLimits, DecompressionLimits, ServerLimits, WaitStrategy},
    server::{
        admission::Admission,
        connection::{Connection, Outcome},
        shutdown::Shutdown,
    },
    upgrade::{ConnectionHandle, UpgradedStage},
};
use crossbeam::queue::SegQueue;
use std::{future::Future, io, net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::yield_now,
    time::{sleep as tokio_sleep, timeout},
};

/// A trait for handling HTTP requests and generating responses.
///
/// The request body has already been decompressed when `handle` is called.
/// Returning a [`Response::switching_protocols`] response hands the
/// connection to the server's [`UpgradeHandler`] once it is written.
///
/// # Examples
/// ```
/// use tollgate::{Handler, Request, Response, StatusCode};
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, req: &Request) -> Response {
///         match req.path() {
///             b"/echo" => Response::ok().body(req.body().to_bytes()),
///             b"/chat" if req.upgrade().is_some() => Response::switching_protocols("websocket"),
///             _ => Response::new(StatusCode::NotFound).body("Not found :("),
///         }
///     }
/// }
/// ```
pub trait Handler
where
    Self: Sync + Send + 'static,
{
    /// Panics will terminate the connection.
    fn handle(&self, request: &Request) -> impl Future<Output = Response> + Send;
}

/// Takes over connections after a `101 Switching Protocols` response.
///
/// `stage` holds the bytes the client sent after the upgrade request, which
/// already belong to the new protocol. The connection no longer counts
/// against [`ServerLimits::max_connections`] and no HTTP timeout applies.
/// On server shutdown [`ConnectionHandle::shutdown`] is triggered and the
/// handler should close the connection.
///
/// # Examples
/// ```
/// use tollgate::{AsyncIo, ConnectionHandle, Request, UpgradeHandler, UpgradedStage};
/// use tokio::io::AsyncWriteExt;
///
/// struct Reject;
///
/// impl UpgradeHandler for Reject {
///     async fn upgrade(
///         &self,
///         _: Request,
///         mut stage: UpgradedStage,
///         mut conn: ConnectionHandle<Box<dyn AsyncIo>>,
///     ) {
///         let early = stage.coalesce();
///         let _ = conn.io_mut().write_all(&early).await;
///     }
/// }
/// ```
pub trait UpgradeHandler
where
    Self: Sync + Send + 'static,
{
    fn upgrade(
        &self,
        request: Request,
        stage: UpgradedStage,
        connection: ConnectionHandle<Box<dyn AsyncIo>>,
    ) -> impl Future<Output = ()> + Send;
}

/// Default upgrade handler: upgraded connections are closed.
impl UpgradeHandler for () {
    async fn upgrade(
        &self,
        _: Request,
        stage: UpgradedStage,
        conn: ConnectionHandle<Box<dyn AsyncIo>>,
    ) {
        tracing::debug!(
            conn = %conn.id(),
            protocol = ?stage.protocol(),
            "no upgrade handler installed, closing"
        );
    }
}

/// Byte stream an upgraded connection runs on.
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

//

#[derive(Debug, Clone, Default)]
pub(crate) struct Limits {
    pub(crate) server: ServerLimits,
    pub(crate) conn: ConnLimits,
    pub(crate) codec: CodecLimits,
    pub(crate) decompression: DecompressionLimits,
}

/// Connection driver shared by the workers of a [`Server`].
///
/// It can also serve any byte stream directly, which is how the server is
/// embedded behind another acceptor or tested without sockets.
///
/// # Examples
/// ```
/// use tollgate::{Handler, Request, Response, Server};
/// use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
///
/// struct Hello;
///
/// impl Handler for Hello {
///     async fn handle(&self, _: &Request) -> Response {
///         Response::ok().body("hello")
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let service = Server::builder().handler(Hello).service();
/// let (mut client, server) = duplex(1024);
///
/// let task = tokio::spawn(async move { service.serve(server, None).await });
///
/// client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
/// let mut out = String::new();
/// client.read_to_string(&mut out).await.unwrap();
///
/// assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
/// assert!(out.ends_with("\r\n\r\nhello"));
/// task.await.unwrap().unwrap();
/// # }
/// ```
pub struct Service<H, U = ()> {
    handler: Arc<H>,
    upgrade: Arc<U>,
    limits: Arc<Limits>,
    admission: Admission,
    shutdown: Shutdown,
}

impl<H, U> Clone for Service<H, U> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            upgrade: self.upgrade.clone(),
            limits: self.limits.clone(),
            admission: self.admission.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<H: Handler, U: UpgradeHandler> Service<H, U> {
    /// Drives one connection until it closes or is handed to the upgrade
    /// handler. The connection holds an admission permit until then.
    pub async fn serve<IO>(&self, io: IO, peer: Option<SocketAddr>) -> io::Result<()>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let permit = self.admission.admit();
        let id = permit.id();
        let conn = Connection::new(
            io,
            peer,
            permit,
            self.handler.clone(),
            self.limits.clone(),
            self.shutdown.clone(),
        );

        match conn.run().await? {
            Outcome::Closed => Ok(()),
            Outcome::Upgraded { request, stage, io } => {
                let handle = ConnectionHandle::new(
                    id,
                    peer,
                    self.shutdown.clone(),
                    Box::new(io) as Box<dyn AsyncIo>,
                );
                self.upgrade.upgrade(request, stage, handle).await;
                Ok(())
            }
        }
    }

    /// HTTP connections currently holding an admission permit.
    #[inline]
    pub fn active_connections(&self) -> usize {
        self.admission.active()
    }

    /// Signal winding down every connection of this service.
    #[inline]
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }
}

//

/// An HTTP server that processes incoming connections and requests.
///
/// A fixed pool of workers takes accepted connections from a lock-free
/// queue; connections that find the queue full get a `503`.
///
/// [`Server::shutdown_handle`] stops it gracefully, see [`Shutdown`].
///
/// # Examples
///
/// ```no_run
/// use tollgate::{Server, Handler, Request, Response};
/// use tokio::net::TcpListener;
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, _: &Request) -> Response {
///         Response::ok().body("Hello world!")
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .handler(MyHandler)
///         .build()
///         .launch()
///         .await
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
    server_limits: ServerLimits,
    admission: Admission,
    shutdown: Shutdown,
}

impl Server {
    #[inline]
    pub fn builder<H: Handler>() -> ServerBuilder<H, ()> {
        ServerBuilder {
            listener: None,
            handler: None,
            upgrade_handler: Arc::new(()),

            server_limits: None,
            connection_limits: None,
            codec_limits: None,
            decompression_limits: None,
        }
    }

    #[inline]
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Starts accepting connections.
    ///
    /// Returns after [`Shutdown::trigger`], once every admitted connection
    /// has finished. Connections still waiting for a worker are dropped.
    #[inline]
    pub async fn launch(self) {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = self.shutdown.triggered() => break,
            };
            let Ok(value) = accepted else {
                continue;
            };

            match self.stream_queue.len() < self.server_limits.max_pending_connections {
                true => self.stream_queue.push(value),
                false => self.error_queue.push(value),
            }
        }

        tracing::debug!(active = self.admission.active(), "accept loop stopped, draining connections");
        self.admission.drained().await;
    }

    /// Next accepted stream, `None` once shutdown was triggered.
    #[inline]
    async fn get_stream(
        queue: &TcpQueue,
        wait: &WaitStrategy,
        shutdown: &Shutdown,
    ) -> Option<(TcpStream, SocketAddr)> {
        loop {
            if shutdown.is_triggered() {
                return None;
            }
            if let Some(value) = queue.pop() {
                return Some(value);
            }

            match wait {
                WaitStrategy::Yield => yield_now().await,
                WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
            }
        }
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder<H: Handler, U: UpgradeHandler = ()> {
    listener: Option<TcpListener>,
    handler: Option<Arc<H>>,
    upgrade_handler: Arc<U>,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    codec_limits: Option<CodecLimits>,
    decompression_limits: Option<DecompressionLimits>,
}

impl<H: Handler, U: UpgradeHandler> ServerBuilder<H, U> {
    /// **This is a required component** for [`build`](Self::build).
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// **This is a required component.**
    #[inline(always)]
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Installs the handler receiving upgraded connections. Without one
    /// they are closed after the `101` response.
    #[inline(always)]
    pub fn upgrade_handler<NewU: UpgradeHandler>(self, handler: NewU) -> ServerBuilder<H, NewU> {
        ServerBuilder {
            listener: self.listener,
            handler: self.handler,
            upgrade_handler: Arc::new(handler),

            server_limits: self.server_limits,
            connection_limits: self.connection_limits,
            codec_limits: self.codec_limits,
            decompression_limits: self.decompression_limits,
        }
    }

    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures timeouts and per-connection request limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # struct MyStruct;
    /// # impl tollgate::Handler for MyStruct {
    /// #     async fn handle(&self, _: &tollgate::Request) -> tollgate::Response {
    /// #         tollgate::Response::ok()
    /// #     }
    /// # }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use tollgate::{Server, limits::ConnLimits};
    /// use tokio::net::TcpListener;
    /// use std::time::Duration;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct)
    ///     .connection_limits(ConnLimits {
    ///         read_timeout: Duration::from_secs(5),
    ///         write_timeout: Duration::from_secs(2),
    ///         max_requests_per_connection: 0,
    ///         ..ConnLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn codec_limits(mut self, limits: CodecLimits) -> Self {
        self.codec_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn decompression_limits(mut self, limits: DecompressionLimits) -> Self {
        self.decompression_limits = Some(limits);
        self
    }

    /// Connection driver without a listener.
    ///
    /// # Panics
    ///
    /// Panics if the `handler` method was not called.
    #[inline]
    #[track_caller]
    pub fn service(&self) -> Service<H, U> {
        Service {
            handler: self
                .handler
                .clone()
                .expect("The `handler` method must be called to create"),
            upgrade: self.upgrade_handler.clone(),
            limits: Arc::new(self.limits()),
            admission: Admission::default(),
            shutdown: Shutdown::new(),
        }
    }

    /// Finalizes the builder and spawns the worker tasks.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Panics
    ///
    /// Error messages:
    /// - ``The `listener` method must be called to create``
    /// - ``The `handler` method must be called to create``
    #[inline]
    #[track_caller]
    pub fn build(mut self) -> Server {
        let service = self.service();
        let listener = self
            .listener
            .take()
            .expect("The `listener` method must be called to create");
        let server_limits = service.limits.server.clone();

        let stream_queue = Arc::new(SegQueue::new());
        let error_queue = Arc::new(SegQueue::new());

        for _ in 0..server_limits.max_connections {
            Self::spawn_worker(&stream_queue, &service);
        }
        if server_limits.count_503_handlers != 0 {
            for _ in 0..server_limits.count_503_handlers {
                Self::spawn_alarmist(&error_queue, &service);
            }
        } else {
            Self::spawn_quiet_alarmist(&error_queue, &service);
        }

        Server {
            listener,
            stream_queue,
            error_queue,
            server_limits,
            admission: service.admission.clone(),
            shutdown: service.shutdown.clone(),
        }
    }

    #[inline]
    fn limits(&self) -> Limits {
        Limits {
            server: self.server_limits.clone().unwrap_or_default(),
            conn: self.connection_limits.clone().unwrap_or_default(),
            codec: self.codec_limits.clone().unwrap_or_default(),
            decompression: self.decompression_limits.clone().unwrap_or_default(),
        }
    }

    #[inline]
    fn spawn_worker(queue: &TcpQueue, service: &Service<H, U>) {
        let queue = queue.clone();
        let service = service.clone();

        tokio::spawn(async move {
            let wait = &service.limits.server.wait_strategy;

            while let Some((stream, addr)) = Server::get_stream(&queue, wait, &service.shutdown).await {
                if let Err(error) = service.serve(stream, Some(addr)).await {
                    tracing::debug!(client = %addr, %error, "connection ended with an I/O error");
                }
            }
        });
    }

    #[inline]
    fn spawn_alarmist(queue: &TcpQueue, service: &Service<H, U>) {
        let queue = queue.clone();
        let limits = service.limits.clone();
        let shutdown = service.shutdown.clone();

        tokio::spawn(async move {
            let response = ErrorKind::ServiceUnavailable
                .canned()
                .map_or(&[][..], |canned| canned.as_http(Version::Http11, limits.server.json_errors));
            let write_timeout = limits.conn.write_timeout;
            let wait = &limits.server.wait_strategy;

            while let Some((mut stream, addr)) = Server::get_stream(&queue, wait, &shutdown).await {
                tracing::debug!(client = %addr, "admission queue full, sending 503");
                if write_timeout.is_zero() {
                    let _ = stream.write_all(response).await;
                } else {
                    let _ = timeout(write_timeout, stream.write_all(response)).await;
                }
            }
        });
    }

    #[inline]
    fn spawn_quiet_alarmist(queue: &TcpQueue, service: &Service<H, U>) {
        let queue = queue.clone();
        let limits = service.limits.clone();
        let shutdown = service.shutdown.clone();

        tokio::spawn(async move {
            let wait = &limits.server.wait_strategy;

            while let Some((stream, _)) = Server::get_stream(&queue, wait, &shutdown).await {
                drop(stream);
            }
        });
    }
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;
