//! tollgate - Hardened HTTP/1 connection pipeline for Tokio
//!
//! The adapter layer between a socket and an HTTP application: it bounds
//! what a client can make the server do before any application code runs,
//! and hands connections over to other protocols after an upgrade.
//!
//! # Pipeline
//!
//! ```text
//!  socket ─> [ BufferBridge ] ─> [ CRLF validator ] ─> [ H1Codec ] ─> [ request queue ]
//!                                                                           │
//!                                          [ DecompressionGuard ] <─────────┘
//!                                                     │
//!  socket <─ [ ChunkedWriter ] <─ [ BufferBridge ] <─ Handler
//!
//!  TimeoutStateMachine: one idle timer per connection (read / persist / write)
//!  UpgradeCoordinator:  after an acknowledged 101, HTTP stages are replaced
//!                       by an UpgradedStage and the socket goes to the
//!                       UpgradeHandler
//!  Shutdown:            idle connections close, exchanges in progress finish
//! ```
//!
//! # Protections
//!
//! - **CRLF floods** - more than two empty lines before a request line are
//!   rejected, however they are split across reads or pipelined requests
//! - **Compression bombs** - request bodies stop decoding once their output
//!   keeps outgrowing `input * ratio_limit`
//! - **Slow clients** - read, keep-alive (persist) and write timeouts, typed
//!   by the phase they guard
//! - **Oversized input** - head, header count and body size limits
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use tollgate::{Server, Handler, Request, Response};
//! use tokio::net::TcpListener;
//!
//! struct MyHandler;
//!
//! impl Handler for MyHandler {
//!     async fn handle(&self, _: &Request) -> Response {
//!         Response::ok().body("Hello World!")
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//! Advanced configuration:
//! ```no_run
//! # tollgate::impt_default_handler!{MyHandler}
//! use tollgate::{Server, limits::{CodecLimits, ConnLimits, DecompressionLimits}};
//! use tokio::net::TcpListener;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .connection_limits(ConnLimits {
//!             read_timeout: Duration::from_secs(5),
//!             persist_timeout: Duration::from_secs(10),
//!             max_requests_per_connection: 10_000,
//!             ..ConnLimits::default()
//!         })
//!         .codec_limits(CodecLimits {
//!             max_headers: 64,          // More headers for complex APIs
//!             max_body_size: 16 * 1024, // 16KB before decoding
//!             ..CodecLimits::default()
//!         })
//!         .decompression_limits(DecompressionLimits {
//!             ratio_limit: 20,
//!             tolerance: 1,
//!             ..DecompressionLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

pub(crate) mod buffer;
pub(crate) mod guard;
pub(crate) mod http {
    pub(crate) mod codec;
    pub(crate) mod message;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod admission;
    pub(crate) mod connection;
    pub(crate) mod server_impl;
    pub(crate) mod shutdown;
}
pub(crate) mod access;
pub(crate) mod errors;
pub(crate) mod timeout;
pub(crate) mod upgrade;
pub mod limits;

pub use crate::{
    access::{AccessHooks, AccessRecord},
    buffer::{
        bridge::{BufferBridge, Framing, Inbound, Outbound, StreamData},
        internal::{ChunkedInput, ChunkedWriter, InternalBuffer, DEFAULT_CHUNK_SIZE},
        wire::WireBuffer,
    },
    guard::{
        crlf::{CrlfValidator, IllegalInput, MAX_LEADING_CRLF},
        decompress::{
            DecompressionEngine, DecompressionError, DecompressionGuard, DecompressionSession,
            DeflateEngine, GzipEngine, IdentityEngine,
        },
    },
    http::{
        codec::{CodecError, H1Codec},
        message::{Request, Response},
        types::{Method, StatusCode, Version},
    },
    server::{
        admission::ConnectionId,
        connection::Phase,
        server_impl::{AsyncIo, Handler, Server, ServerBuilder, Service, UpgradeHandler},
        shutdown::Shutdown,
    },
    timeout::{
        IdleState, IdleTimeoutConfig, IdleTimer, TimeoutError, TimeoutEvent, TimeoutKind,
        TimeoutState, TimeoutStateMachine,
    },
    upgrade::{
        ConnectionHandle, Pipeline, PipelineState, Protocol, Stage, UpgradeCoordinator,
        UpgradeTransition, UpgradedStage, WriteAck,
    },
};

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_handler {
    ($name:ident) => {
        use tollgate::{Handler, Request, Response};
        struct $name;

        impl Handler for $name {
            async fn handle(&self, _: &Request) -> Response {
                Response::ok().body("Hello world!")
            }
        }
    };
}
