//! Access records for completed exchanges

use crate::{
    http::types::{Method, StatusCode, Version},
    server::admission::ConnectionId,
};
use bytes::Bytes;
use std::{fmt, net::SocketAddr, time::Duration};
use tokio::time::Instant;

/// Start marker of the exchange in progress on one connection.
///
/// The marker is set by the first inbound read of an exchange and only if
/// absent, so bytes arriving in several reads keep the earliest timestamp.
/// Emitting the record takes the marker and the next read starts a new one.
/// A pipelined request that arrived with an earlier one starts its clock
/// when it is dequeued, see [`on_dequeue`](Self::on_dequeue).
#[derive(Debug, Default)]
pub struct AccessHooks {
    started: Option<Instant>,
}

impl AccessHooks {
    #[inline]
    pub const fn new() -> Self {
        Self { started: None }
    }

    /// Records the start of an exchange. Returns `false` if it was already
    /// recorded.
    #[inline]
    pub fn on_inbound(&mut self) -> bool {
        match self.started {
            Some(_) => false,
            None => {
                self.started = Some(Instant::now());
                true
            }
        }
    }

    /// Starts the clock of a request taken from the pipelining queue, unless
    /// a read already started it. Returns `false` in that case.
    #[inline]
    pub fn on_dequeue(&mut self) -> bool {
        self.on_inbound()
    }

    #[inline(always)]
    pub const fn started(&self) -> Option<Instant> {
        self.started
    }

    /// Finishes the exchange: fills in the elapsed time and emits `record`.
    pub fn on_outbound(&mut self, mut record: AccessRecord) -> AccessRecord {
        record.elapsed = self
            .started
            .take()
            .map(|start| start.elapsed())
            .unwrap_or_default();

        record.emit();
        record
    }
}

/// One completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub connection: ConnectionId,
    pub client: Option<SocketAddr>,

    pub method: Method,
    pub target: Bytes,
    pub version: Version,
    pub status: StatusCode,

    /// Request body bytes as received, before content decoding.
    pub bytes_read: usize,
    /// Bytes the transport accepted for the response, head included.
    pub bytes_written: u64,
    pub elapsed: Duration,
}

impl AccessRecord {
    /// Logs the record at `info` level on the `tollgate::access` target.
    #[inline]
    pub fn emit(&self) {
        tracing::info!(
            target: "tollgate::access",
            conn = %self.connection,
            client = ?self.client,
            method = self.method.as_str(),
            uri = %String::from_utf8_lossy(&self.target),
            version = self.version.as_str(),
            status = self.status.as_u16(),
            bytes_read = self.bytes_read,
            bytes_written = self.bytes_written,
            elapsed_us = self.elapsed.as_micros() as u64,
            "{}",
            self
        );
    }
}

/// Common log format, without the identity and date fields.
impl fmt::Display for AccessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client {
            Some(addr) => write!(f, "{} ", addr.ip())?,
            None => f.write_str("- ")?,
        }

        write!(
            f,
            "\"{} {} {}\" {} {}",
            self.method.as_str(),
            String::from_utf8_lossy(&self.target),
            self.version.as_str(),
            self.status.as_u16(),
            self.bytes_written,
        )
    }
}
