use crate::buffer::{
    internal::{ChunkedInput, InternalBuffer, DEFAULT_CHUNK_SIZE},
    wire::WireBuffer,
};
use bytes::{Bytes, BytesMut};

/// Message travelling inbound through the pipeline.
///
/// Stages are composed, so a message reaching the bridge may already have
/// been transformed by an earlier stage. Such messages pass through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Raw region from the transport.
    Wire(WireBuffer),
    /// Already converted to the server's buffer type.
    Buffer(InternalBuffer),
}

/// How outbound payloads are framed on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framing {
    /// One message at a time, written through a chunked writer.
    Http1,
    /// Stream-tagged payloads for a multiplexing layer.
    Multiplexed,
}

/// Wire representation produced by [`BufferBridge::on_outbound`].
#[derive(Debug, Clone)]
pub enum Outbound {
    Chunked(ChunkedInput),
    Stream(StreamData),
}

/// Payload tagged with the stream it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamData {
    pub stream_id: u32,
    pub data: Bytes,
    /// `true` when `data` shares memory with the source buffer.
    pub zero_copy: bool,
}

/// Duplex stage converting between wire buffers and internal buffers.
///
/// The bridge holds no per-message state, one instance is shared by every
/// message of a connection.
///
/// # Examples
/// ```
/// use tollgate::{BufferBridge, Framing, Inbound, WireBuffer};
///
/// let bridge = BufferBridge::new(Framing::Http1);
///
/// match bridge.on_inbound(Inbound::Wire(WireBuffer::from_slice(b"GET /"))) {
///     Inbound::Buffer(buffer) => assert_eq!(buffer.as_slice(), b"GET /"),
///     Inbound::Wire(_) => unreachable!(),
/// }
/// ```
#[derive(Debug, Clone)]
pub struct BufferBridge {
    framing: Framing,
    chunk_size: usize,
}

impl BufferBridge {
    #[inline]
    pub const fn new(framing: Framing) -> Self {
        Self {
            framing,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    #[inline]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    #[inline(always)]
    pub const fn framing(&self) -> Framing {
        self.framing
    }

    /// Converts a wire buffer into an internal buffer.
    ///
    /// - Non-wire messages are returned unchanged.
    /// - Wire buffers with nothing readable are returned unchanged, so
    ///   zero-length markers still reach downstream stages.
    /// - Otherwise the readable region is wrapped without copying and the
    ///   wire buffer's cursor moves past it. The wire buffer itself is
    ///   dropped here; the wrapped memory stays alive through the result.
    #[inline]
    pub fn on_inbound(&self, message: Inbound) -> Inbound {
        match message {
            Inbound::Wire(mut wire) if wire.has_remaining() => {
                let region = wire.split_readable();
                tracing::trace!(len = region.len(), "wrapped inbound wire buffer");
                Inbound::Buffer(InternalBuffer::wrap(region))
            }
            other => other,
        }
    }

    /// Converts an internal buffer into its wire representation.
    ///
    /// `buffer` is never modified: the chunked path and the zero-copy path
    /// take shared views, the copy path reads from it.
    pub fn on_outbound(&self, stream_id: u32, buffer: &InternalBuffer) -> Outbound {
        match self.framing {
            Framing::Http1 => Outbound::Chunked(ChunkedInput::with_chunk_size(
                buffer,
                self.chunk_size,
            )),
            Framing::Multiplexed if buffer.is_direct() => Outbound::Stream(StreamData {
                stream_id,
                data: buffer.to_bytes(),
                zero_copy: true,
            }),
            Framing::Multiplexed => {
                let mut data = BytesMut::with_capacity(buffer.remaining());
                data.extend_from_slice(buffer.as_slice());

                Outbound::Stream(StreamData {
                    stream_id,
                    data: data.freeze(),
                    zero_copy: false,
                })
            }
        }
    }
}
