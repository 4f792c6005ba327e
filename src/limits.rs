//! Server, connection, codec and decompression limits
//!
//! # Security-First Defaults
//!
//! Defaults follow common application-server values and are meant to hold up
//! against:
//! - Slowloris-style clients (read and persist timeouts)
//! - Stalled readers (write timeout)
//! - Header flooding and oversized heads ([`CodecLimits`])
//! - Compression bombs ([`DecompressionLimits`])
//!
//! A timeout of [`Duration::ZERO`] disables it.
//!
//! # Examples
//!
//! ```no_run
//! use tollgate::{limits::{ConnLimits, DecompressionLimits, ServerLimits}, Handler, Request, Response};
//! use tokio::net::TcpListener;
//! use std::time::Duration;
//!
//! struct Hello;
//!
//! impl Handler for Hello {
//!     async fn handle(&self, _: &Request) -> Response {
//!         Response::ok().body("hello")
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     tollgate::Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(Hello)
//!         .server_limits(ServerLimits {
//!             max_connections: 5000,
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             read_timeout: Duration::from_secs(5),
//!             persist_timeout: Duration::ZERO, // keep idle connections forever
//!             ..ConnLimits::default()
//!         })
//!         .decompression_limits(DecompressionLimits {
//!             ratio_limit: 50,
//!             ..DecompressionLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

use std::time::Duration;

/// Controls server-level concurrency, queueing, and overload behavior.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  || TCP_STREAM
///                                  \/
/// [--------------]   Yes   /-----------------\   No   [-------------]
/// [ Add to queue ] <====== | Room in queue?  | =====> [ Sending 503 ]
/// [--------------]         \-----------------/        [-------------]
///        ||
///        \==================\\          //====================\
///                            V          V                    ||
/// [--------]   Yes   /--------------------------\   No   [------]
/// [ Worker ] <====== | Is there a free worker?  | =====> [ Wait ]
/// [--------]         \--------------------------/        [------]
/// ```
///
/// Every connection handed to a worker holds an admission permit until it
/// closes or is upgraded to another protocol.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of worker tasks, and so of HTTP connections served at once
    /// (default: `100`).
    pub max_connections: usize,

    /// Accepted connections allowed to wait for a worker (default: `250`).
    ///
    /// Beyond that, new connections receive an immediate `503`.
    pub max_pending_connections: usize,

    /// How idle workers wait for the queue (default: `Sleep(50μs)`).
    pub wait_strategy: WaitStrategy,

    /// Tasks answering overflow connections with `503` (default: `1`).
    ///
    /// Set to 0 to close overflow connections silently.
    pub count_503_handlers: usize,

    /// Format of canned error responses (default: `true`)
    ///
    /// If `true`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 408 Request Timeout\r
    /// connection: close\r
    /// content-length: 56\r
    /// content-type: application/json\r
    /// \r
    /// {"error":"Request read timed out","code":"READ_TIMEOUT"}
    /// ```
    /// If `false`, the body is empty and `content-length` is `0`.
    pub json_errors: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_connections: 250,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            count_503_handlers: 1,
            json_errors: true,

            _priv: (),
        }
    }
}

/// Strategy for worker tasks waiting on an empty admission queue.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// Uses [`tokio::task::yield_now()`]. Lowest latency, keeps a core busy.
    Yield,
    /// Uses [`tokio::time::sleep()`] between polls.
    Sleep(Duration),
}

/// Connection-level timeouts and request limits
///
/// # Timeout phases
/// ```text
///   accept ──read_timeout──> request complete ──(handler)──> response written
///                                  ^                               |
///                                  |                        persist_timeout
///                                  └──────── first bytes <─────────┘
/// ```
/// `write_timeout` bounds every individual write.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Time allowed to receive a complete request head and body once the
    /// connection is active or the next request has started (default:
    /// `60 seconds`).
    pub read_timeout: Duration,

    /// Keep-alive window between a written response and the first bytes of
    /// the next request (default: `30 seconds`).
    pub persist_timeout: Duration,

    /// Time allowed for one response write (default: `60 seconds`).
    pub write_timeout: Duration,

    /// Requests served before the connection is closed (default: `100`,
    /// `0` means unlimited).
    pub max_requests_per_connection: usize,

    /// Complete requests read ahead of the one being handled (default: `50`).
    ///
    /// When the queue is full the connection stops reading until it drains.
    pub max_queued_requests: usize,

    /// Size of a single socket read (default: `8 KiB`).
    pub read_buffer_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(60),
            persist_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(60),
            max_requests_per_connection: 100,
            max_queued_requests: 50,
            read_buffer_size: 8 * 1024,

            _priv: (),
        }
    }
}

/// Limits of the built-in HTTP/1 head codec.
#[derive(Debug, Clone)]
pub struct CodecLimits {
    /// Request line plus headers, terminator included (default: `8 KiB`).
    pub max_head_size: usize,
    /// Default: `32`.
    pub max_headers: usize,
    /// Largest accepted `Content-Length`, before decoding (default: `1 MiB`).
    pub max_body_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for CodecLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            max_head_size: 8 * 1024,
            max_headers: 32,
            max_body_size: 1024 * 1024,

            _priv: (),
        }
    }
}

/// Bounds on request body decompression
///
/// A body is rejected as a compression bomb once its output exceeds
/// `bytes_read * ratio_limit` after more than `tolerance` consecutive
/// engine steps.
#[derive(Debug, Clone)]
pub struct DecompressionLimits {
    /// Decode `gzip`, `x-gzip` and `deflate` bodies before they reach the
    /// handler (default: `true`).
    pub auto_decompression: bool,
    /// Default: `200`.
    pub ratio_limit: u64,
    /// Default: `3`.
    pub tolerance: u32,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for DecompressionLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            auto_decompression: true,
            ratio_limit: 200,
            tolerance: 3,

            _priv: (),
        }
    }
}
