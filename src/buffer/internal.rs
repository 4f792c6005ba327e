use bytes::{Bytes, BytesMut};
use std::{fmt, io};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Default size of the pieces produced by [`ChunkedInput`].
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Server-owned buffer handed to application code.
///
/// An `InternalBuffer` is backed either by shared, reference-counted memory
/// (for example the region of a [`WireBuffer`](crate::WireBuffer) it wraps
/// without copying) or by a plain heap vector owned by the application.
/// Only the first kind is *direct*: it can be passed to the transport
/// without copying.
///
/// # Examples
/// ```
/// use tollgate::InternalBuffer;
///
/// let direct = InternalBuffer::from_static(b"hello");
/// let heap = InternalBuffer::from(b"hello".to_vec());
///
/// assert!(direct.is_direct());
/// assert!(!heap.is_direct());
/// assert_eq!(direct.as_slice(), heap.as_slice());
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct InternalBuffer {
    repr: Repr,
}

#[derive(Clone, PartialEq, Eq)]
enum Repr {
    Direct(Bytes),
    Heap(Vec<u8>),
}

impl InternalBuffer {
    /// Wraps shared memory without copying.
    #[inline]
    pub fn wrap(data: Bytes) -> Self {
        Self {
            repr: Repr::Direct(data),
        }
    }

    #[inline]
    pub const fn from_static(data: &'static [u8]) -> Self {
        Self {
            repr: Repr::Direct(Bytes::from_static(data)),
        }
    }

    #[inline]
    pub const fn empty() -> Self {
        Self::from_static(b"")
    }

    /// Joins `chunks` into one direct buffer, preserving their order.
    ///
    /// A single chunk is returned as is.
    pub fn concat(mut chunks: Vec<InternalBuffer>) -> Self {
        match chunks.len() {
            0 => Self::empty(),
            1 => chunks.remove(0),
            _ => {
                let total = chunks.iter().map(InternalBuffer::remaining).sum();
                let mut joined = BytesMut::with_capacity(total);
                for chunk in &chunks {
                    joined.extend_from_slice(chunk.as_slice());
                }
                Self::wrap(joined.freeze())
            }
        }
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.as_slice().len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Whether the buffer can reach the transport without a copy.
    #[inline(always)]
    pub const fn is_direct(&self) -> bool {
        matches!(self.repr, Repr::Direct(_))
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        match &self.repr {
            Repr::Direct(data) => data,
            Repr::Heap(data) => data,
        }
    }

    /// Shared view of the content. Direct buffers are shared, heap buffers
    /// are copied into a fresh allocation. `self` is left untouched.
    #[inline]
    pub fn to_bytes(&self) -> Bytes {
        match &self.repr {
            Repr::Direct(data) => data.clone(),
            Repr::Heap(data) => Bytes::copy_from_slice(data),
        }
    }
}

impl Default for InternalBuffer {
    #[inline]
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for InternalBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalBuffer")
            .field("direct", &self.is_direct())
            .field("remaining", &self.remaining())
            .finish()
    }
}

impl From<Vec<u8>> for InternalBuffer {
    #[inline]
    fn from(data: Vec<u8>) -> Self {
        Self {
            repr: Repr::Heap(data),
        }
    }
}

impl From<String> for InternalBuffer {
    #[inline]
    fn from(data: String) -> Self {
        Self::from(data.into_bytes())
    }
}

impl From<&'static str> for InternalBuffer {
    #[inline]
    fn from(data: &'static str) -> Self {
        Self::from_static(data.as_bytes())
    }
}

impl From<Bytes> for InternalBuffer {
    #[inline]
    fn from(data: Bytes) -> Self {
        Self::wrap(data)
    }
}

//

/// Pull-based source of fixed-size pieces of an [`InternalBuffer`], used
/// by the chunked writer of non-multiplexed connections.
///
/// The input takes its own shared view of the buffer, so the caller's buffer
/// is never advanced or modified.
///
/// # Examples
/// ```
/// use tollgate::{ChunkedInput, InternalBuffer};
///
/// let mut input = ChunkedInput::with_chunk_size(&InternalBuffer::from("abcde"), 2);
///
/// assert_eq!(input.next().as_deref(), Some(&b"ab"[..]));
/// assert_eq!(input.next().as_deref(), Some(&b"cd"[..]));
/// assert_eq!(input.next().as_deref(), Some(&b"e"[..]));
/// assert_eq!(input.next(), None);
/// assert!(input.is_end_of_input());
/// assert_eq!(input.progress(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct ChunkedInput {
    data: Bytes,
    chunk_size: usize,
    progress: usize,
    end_of_input: bool,
}

impl ChunkedInput {
    #[inline]
    pub fn new(buffer: &InternalBuffer) -> Self {
        Self::with_chunk_size(buffer, DEFAULT_CHUNK_SIZE)
    }

    /// A `chunk_size` of zero falls back to [`DEFAULT_CHUNK_SIZE`].
    #[inline]
    pub fn with_chunk_size(buffer: &InternalBuffer, chunk_size: usize) -> Self {
        Self {
            data: buffer.to_bytes(),
            chunk_size: if chunk_size == 0 {
                DEFAULT_CHUNK_SIZE
            } else {
                chunk_size
            },
            progress: 0,
            end_of_input: false,
        }
    }

    #[inline(always)]
    pub const fn is_end_of_input(&self) -> bool {
        self.end_of_input
    }

    /// Bytes handed out so far.
    #[inline(always)]
    pub const fn progress(&self) -> usize {
        self.progress
    }

    /// Bytes not handed out yet.
    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.data.len()
    }
}

impl Iterator for ChunkedInput {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.end_of_input || self.data.is_empty() {
            self.end_of_input = true;
            return None;
        }

        let size = self.chunk_size.min(self.data.len());
        self.progress += size;
        Some(self.data.split_to(size))
    }
}

/// Writer stage of non-multiplexed connections.
///
/// Drains a [`ChunkedInput`] into the transport in order, one piece per
/// write, and reports how many bytes were accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkedWriter;

impl ChunkedWriter {
    pub async fn write<W>(&self, io: &mut W, input: ChunkedInput) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut written = 0;
        for chunk in input {
            io.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }
}
