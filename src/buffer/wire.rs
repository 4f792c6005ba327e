use bytes::{Bytes, BytesMut};
use std::fmt;

/// Byte region handed over by the transport for one stage invocation.
///
/// The backing memory is reference counted: every [`InternalBuffer`] produced
/// from it by a zero-copy wrap keeps the allocation alive, and the allocation
/// is released when the last holder is dropped. There is no manual
/// `release()`; dropping the value is the release.
///
/// The buffer has a read cursor (`reader_index`) and a readable region that
/// starts at the cursor. Stages that only need to look at the data take
/// `&WireBuffer`, which leaves the cursor untouched by construction.
///
/// # Examples
/// ```
/// use tollgate::WireBuffer;
///
/// let mut buf = WireBuffer::from_slice(b"GET / HTTP/1.1\r\n\r\n");
/// assert_eq!(buf.readable(), 18);
///
/// buf.advance(4);
/// assert_eq!(buf.reader_index(), 4);
/// assert_eq!(buf.chunk(), b"/ HTTP/1.1\r\n\r\n");
/// ```
///
/// [`InternalBuffer`]: crate::InternalBuffer
#[derive(Clone, PartialEq, Eq)]
pub struct WireBuffer {
    data: Bytes,
    reader_index: usize,
}

impl WireBuffer {
    /// Takes ownership of a region filled by the transport.
    #[inline]
    pub fn new(data: BytesMut) -> Self {
        Self {
            data: data.freeze(),
            reader_index: 0,
        }
    }

    /// Copies `src` into a fresh wire buffer.
    #[inline]
    pub fn from_slice(src: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(src),
            reader_index: 0,
        }
    }

    /// Wire buffer over static memory, mostly useful for zero-length markers.
    #[inline]
    pub const fn from_static(src: &'static [u8]) -> Self {
        Self {
            data: Bytes::from_static(src),
            reader_index: 0,
        }
    }

    #[inline(always)]
    pub fn readable(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn has_remaining(&self) -> bool {
        !self.data.is_empty()
    }

    /// Number of bytes consumed since the transport handed the buffer over.
    #[inline(always)]
    pub const fn reader_index(&self) -> usize {
        self.reader_index
    }

    /// The readable region, starting at the read cursor.
    #[inline(always)]
    pub fn chunk(&self) -> &[u8] {
        &self.data
    }

    /// Moves the read cursor forward. Advancing past the end stops at the end.
    #[inline]
    pub fn advance(&mut self, count: usize) {
        let count = count.min(self.data.len());
        let _ = self.data.split_to(count);
        self.reader_index += count;
    }

    /// Takes an extra reference to the readable region without copying.
    ///
    /// Stages that need the data after their own call returns use this
    /// instead of holding on to the `WireBuffer` itself.
    #[inline]
    pub fn retain(&self) -> Bytes {
        self.data.clone()
    }

    /// Hands the whole readable region out as shared memory and moves the
    /// cursor past it.
    #[inline]
    pub(crate) fn split_readable(&mut self) -> Bytes {
        let count = self.data.len();
        self.reader_index += count;
        self.data.split_to(count)
    }
}

impl fmt::Debug for WireBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireBuffer")
            .field("reader_index", &self.reader_index)
            .field("readable", &self.data.len())
            .finish()
    }
}

impl From<Bytes> for WireBuffer {
    #[inline]
    fn from(data: Bytes) -> Self {
        Self {
            data,
            reader_index: 0,
        }
    }
}

#[cfg(test)]
mod wire_tests {
    use super::*;

    #[test]
    fn advance() {
        #[rustfmt::skip]
        let cases = [
            (b"abcdef".as_slice(), 0, 0, "abcdef"),
            (b"abcdef".as_slice(), 2, 2, "cdef"),
            (b"abcdef".as_slice(), 6, 6, ""),
            (b"abcdef".as_slice(), 9, 6, ""),
            (b"".as_slice(),       1, 0, ""),
        ];

        for (src, count, index, rest) in cases {
            let mut buf = WireBuffer::from_slice(src);
            buf.advance(count);

            assert_eq!(buf.reader_index(), index);
            assert_eq!(buf.chunk(), rest.as_bytes());
            assert_eq!(buf.readable(), rest.len());
        }
    }

    #[test]
    fn split_readable_moves_cursor() {
        let mut buf = WireBuffer::new(BytesMut::from(&b"payload"[..]));
        buf.advance(3);

        let shared = buf.split_readable();
        assert_eq!(&shared[..], b"load");
        assert_eq!(buf.reader_index(), 7);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn retain_outlives_buffer() {
        let retained = {
            let buf = WireBuffer::from_slice(b"kept");
            buf.retain()
        };

        assert_eq!(&retained[..], b"kept");
    }
}
