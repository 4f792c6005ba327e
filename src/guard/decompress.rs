use crate::{
    buffer::{internal::InternalBuffer, wire::WireBuffer},
    http::types,
    limits::DecompressionLimits,
};
use flate2::write::{GzDecoder, ZlibDecoder};
use std::io::{self, Write};
use thiserror::Error;

/// Failure while removing the content coding of a request body.
#[derive(Debug, Error)]
pub enum DecompressionError {
    /// Output kept growing faster than the ratio limit allows.
    #[error(
        "decompression ratio limit {ratio_limit} exceeded for {cycles} consecutive cycles \
         (tolerance {tolerance})"
    )]
    Bomb {
        ratio_limit: u64,
        tolerance: u32,
        cycles: u32,
    },
    #[error("corrupt compressed payload: {0}")]
    Corrupt(#[source] io::Error),
    /// The engine consumed nothing and produced nothing.
    #[error("decompression engine made no progress")]
    Stalled,
}

impl DecompressionError {
    /// Bombs are expected adversarial input and skip deep diagnostics.
    #[inline]
    pub const fn no_ffdc(&self) -> bool {
        matches!(self, Self::Bomb { .. })
    }
}

/// A pluggable decompressor driven one step at a time.
///
/// Counters are cumulative over the engine's lifetime and are the only
/// source of truth for the ratio check: compressed formats carry headers and
/// trailers that only the engine knows how to account for.
pub trait DecompressionEngine {
    /// Runs one step over the readable part of `input`, moving its cursor
    /// past the consumed bytes, and returns the output of this step (possibly
    /// nothing).
    fn decompress(
        &mut self,
        input: &mut WireBuffer,
    ) -> Result<Vec<InternalBuffer>, DecompressionError>;

    /// Flushes output still held by the engine once all input was fed.
    fn finish(&mut self) -> Result<Vec<InternalBuffer>, DecompressionError> {
        Ok(Vec::new())
    }

    fn bytes_read(&self) -> u64;

    fn bytes_written(&self) -> u64;

    fn is_enabled(&self) -> bool;
}

/// State of one request body passing through the guard.
///
/// # Examples
/// ```
/// use tollgate::{limits::DecompressionLimits, DecompressionSession, GzipEngine, WireBuffer};
///
/// let mut session = DecompressionSession::new(&DecompressionLimits::default());
/// let mut engine = GzipEngine::new();
///
/// // Not a gzip stream
/// let result = session.run(&mut engine, [WireBuffer::from_slice(b"plain text")]);
/// assert!(result.is_err());
/// ```
#[derive(Debug, Clone)]
pub struct DecompressionSession {
    ratio_limit: u64,
    tolerance: u32,

    bytes_read: u64,
    bytes_written: u64,
    over_limit_streak: u32,
    active: bool,
}

impl DecompressionSession {
    #[inline]
    pub fn new(limits: &DecompressionLimits) -> Self {
        Self {
            ratio_limit: limits.ratio_limit,
            tolerance: limits.tolerance,
            bytes_read: 0,
            bytes_written: 0,
            over_limit_streak: 0,
            active: false,
        }
    }

    #[inline(always)]
    pub const fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    #[inline(always)]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Consecutive engine steps that ended above the ratio limit.
    #[inline(always)]
    pub const fn over_limit_streak(&self) -> u32 {
        self.over_limit_streak
    }

    /// `true` while [`run`](Self::run) is feeding an enabled engine.
    #[inline(always)]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Feeds every input buffer through `engine` and joins the output.
    ///
    /// - A disabled engine is never called, the input comes back as is.
    /// - Empty input yields empty output without calling the engine.
    /// - After every step, output above `bytes_read * ratio_limit` extends
    ///   the over-limit streak and anything else resets it. A streak longer
    ///   than `tolerance` aborts with [`DecompressionError::Bomb`].
    ///
    /// Inputs and produced chunks are released as soon as they are no
    /// longer needed, including on the error paths.
    pub fn run<E, I>(
        &mut self,
        engine: &mut E,
        inputs: I,
    ) -> Result<InternalBuffer, DecompressionError>
    where
        E: DecompressionEngine + ?Sized,
        I: IntoIterator<Item = WireBuffer>,
    {
        if !engine.is_enabled() {
            let parts = inputs
                .into_iter()
                .filter(WireBuffer::has_remaining)
                .map(|mut input| InternalBuffer::wrap(input.split_readable()))
                .collect();
            return Ok(InternalBuffer::concat(parts));
        }

        self.active = true;
        let result = self.drive(engine, inputs);
        self.active = false;

        result.map(InternalBuffer::concat)
    }

    fn drive<E, I>(
        &mut self,
        engine: &mut E,
        inputs: I,
    ) -> Result<Vec<InternalBuffer>, DecompressionError>
    where
        E: DecompressionEngine + ?Sized,
        I: IntoIterator<Item = WireBuffer>,
    {
        let mut storage = Vec::new();
        let mut fed = false;

        for mut input in inputs {
            while input.has_remaining() {
                let before = input.reader_index();
                let chunks = engine.decompress(&mut input)?;

                if input.reader_index() == before && chunks.iter().all(InternalBuffer::is_empty) {
                    return Err(DecompressionError::Stalled);
                }

                fed = true;
                self.check_ratio(engine)?;
                storage.extend(chunks.into_iter().filter(|c| !c.is_empty()));
            }
        }

        if fed {
            let tail = engine.finish()?;
            self.check_ratio(engine)?;
            storage.extend(tail.into_iter().filter(|c| !c.is_empty()));
        }

        Ok(storage)
    }

    #[inline]
    fn check_ratio<E>(&mut self, engine: &E) -> Result<(), DecompressionError>
    where
        E: DecompressionEngine + ?Sized,
    {
        self.bytes_read = engine.bytes_read();
        self.bytes_written = engine.bytes_written();

        let ceiling = u128::from(self.bytes_read) * u128::from(self.ratio_limit);
        if u128::from(self.bytes_written) > ceiling {
            self.over_limit_streak += 1;
        } else {
            self.over_limit_streak = 0;
        }

        if self.over_limit_streak > self.tolerance {
            tracing::debug!(
                read = self.bytes_read,
                written = self.bytes_written,
                cycles = self.over_limit_streak,
                "decompression ratio tolerance reached"
            );
            return Err(DecompressionError::Bomb {
                ratio_limit: self.ratio_limit,
                tolerance: self.tolerance,
                cycles: self.over_limit_streak,
            });
        }

        Ok(())
    }
}

//

/// Chooses an engine for a request body and runs it under a fresh session.
///
/// # Examples
/// ```
/// use tollgate::{limits::DecompressionLimits, DecompressionGuard, InternalBuffer};
///
/// let guard = DecompressionGuard::new(DecompressionLimits::default());
/// let body = InternalBuffer::from("not encoded");
///
/// let decoded = guard.decode(None, body.clone()).unwrap();
/// assert_eq!(decoded.as_slice(), body.as_slice());
/// ```
#[derive(Debug, Clone)]
pub struct DecompressionGuard {
    limits: DecompressionLimits,
}

impl DecompressionGuard {
    #[inline]
    pub const fn new(limits: DecompressionLimits) -> Self {
        Self { limits }
    }

    #[inline(always)]
    pub const fn limits(&self) -> &DecompressionLimits {
        &self.limits
    }

    /// Engine matching a `Content-Encoding` value.
    ///
    /// `gzip` and `x-gzip` select gzip, `deflate` selects zlib-wrapped
    /// deflate. Anything else, or disabled auto-decompression, selects the
    /// identity engine.
    pub fn engine_for(&self, content_encoding: Option<&[u8]>) -> Box<dyn DecompressionEngine + Send> {
        if !self.limits.auto_decompression {
            return Box::new(IdentityEngine);
        }

        match content_encoding.map(types::trim) {
            Some(value) if value.eq_ignore_ascii_case(b"gzip") => Box::new(GzipEngine::new()),
            Some(value) if value.eq_ignore_ascii_case(b"x-gzip") => Box::new(GzipEngine::new()),
            Some(value) if value.eq_ignore_ascii_case(b"deflate") => Box::new(DeflateEngine::new()),
            _ => Box::new(IdentityEngine),
        }
    }

    /// Removes the content coding of `body`.
    pub fn decode(
        &self,
        content_encoding: Option<&[u8]>,
        body: InternalBuffer,
    ) -> Result<InternalBuffer, DecompressionError> {
        let mut engine = self.engine_for(content_encoding);
        if !engine.is_enabled() || body.is_empty() {
            return Ok(body);
        }

        DecompressionSession::new(&self.limits)
            .run(engine.as_mut(), [WireBuffer::from(body.to_bytes())])
    }
}

//

/// Engine used when the body is not encoded or decoding is switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityEngine;

impl DecompressionEngine for IdentityEngine {
    #[inline]
    fn decompress(
        &mut self,
        input: &mut WireBuffer,
    ) -> Result<Vec<InternalBuffer>, DecompressionError> {
        Ok(vec![InternalBuffer::wrap(input.split_readable())])
    }

    #[inline]
    fn bytes_read(&self) -> u64 {
        0
    }

    #[inline]
    fn bytes_written(&self) -> u64 {
        0
    }

    #[inline]
    fn is_enabled(&self) -> bool {
        false
    }
}

/// Streaming decoder writing into a vector we can drain between steps.
trait Sink: Write {
    fn output(&mut self) -> &mut Vec<u8>;
    fn finish_stream(&mut self) -> io::Result<()>;
}

impl Sink for GzDecoder<Vec<u8>> {
    #[inline]
    fn output(&mut self) -> &mut Vec<u8> {
        self.get_mut()
    }

    #[inline]
    fn finish_stream(&mut self) -> io::Result<()> {
        self.try_finish()
    }
}

impl Sink for ZlibDecoder<Vec<u8>> {
    #[inline]
    fn output(&mut self) -> &mut Vec<u8> {
        self.get_mut()
    }

    #[inline]
    fn finish_stream(&mut self) -> io::Result<()> {
        self.try_finish()
    }
}

#[derive(Debug)]
struct FlateEngine<S> {
    sink: S,
    bytes_read: u64,
    bytes_written: u64,
}

impl<S: Sink> FlateEngine<S> {
    #[inline]
    fn drain(&mut self) -> Vec<InternalBuffer> {
        let out = std::mem::take(self.sink.output());
        self.bytes_written += out.len() as u64;

        match out.is_empty() {
            true => Vec::new(),
            false => vec![InternalBuffer::from(out)],
        }
    }

    fn step(&mut self, input: &mut WireBuffer) -> Result<Vec<InternalBuffer>, DecompressionError> {
        let consumed = self
            .sink
            .write(input.chunk())
            .map_err(DecompressionError::Corrupt)?;

        if consumed == 0 && input.has_remaining() {
            return Err(DecompressionError::Corrupt(io::Error::new(
                io::ErrorKind::InvalidData,
                "trailing bytes after end of compressed stream",
            )));
        }

        input.advance(consumed);
        self.bytes_read += consumed as u64;
        Ok(self.drain())
    }

    fn finish(&mut self) -> Result<Vec<InternalBuffer>, DecompressionError> {
        self.sink
            .finish_stream()
            .map_err(DecompressionError::Corrupt)?;
        Ok(self.drain())
    }
}

macro_rules! flate_engines {
    ($( $(#[$docs:meta])* $name:ident => $decoder:ident; )*) => { $(
        $(#[$docs])*
        #[derive(Debug)]
        pub struct $name(FlateEngine<$decoder<Vec<u8>>>);

        impl $name {
            #[inline]
            pub fn new() -> Self {
                Self(FlateEngine {
                    sink: $decoder::new(Vec::new()),
                    bytes_read: 0,
                    bytes_written: 0,
                })
            }
        }

        impl Default for $name {
            #[inline]
            fn default() -> Self {
                Self::new()
            }
        }

        impl DecompressionEngine for $name {
            #[inline]
            fn decompress(
                &mut self,
                input: &mut WireBuffer,
            ) -> Result<Vec<InternalBuffer>, DecompressionError> {
                self.0.step(input)
            }

            #[inline]
            fn finish(&mut self) -> Result<Vec<InternalBuffer>, DecompressionError> {
                self.0.finish()
            }

            #[inline]
            fn bytes_read(&self) -> u64 {
                self.0.bytes_read
            }

            #[inline]
            fn bytes_written(&self) -> u64 {
                self.0.bytes_written
            }

            #[inline]
            fn is_enabled(&self) -> bool {
                true
            }
        }
    )* };
}

flate_engines! {
    /// `Content-Encoding: gzip` (and `x-gzip`).
    GzipEngine => GzDecoder;
    /// `Content-Encoding: deflate`, the zlib-wrapped format of RFC 9110.
    DeflateEngine => ZlibDecoder;
}

#[cfg(test)]
mod decompress_tests {
    use super::*;
    use bytes::Bytes;
    use flate2::{
        write::{GzEncoder, ZlibEncoder},
        Compression,
    };

    /// Engine replaying scripted steps: each step consumes `consume` bytes
    /// and reports the given cumulative counters.
    struct Scripted {
        steps: Vec<(usize, u64, u64, usize)>,
        calls: usize,
        read: u64,
        written: u64,
        enabled: bool,
    }

    impl Scripted {
        fn new(steps: Vec<(usize, u64, u64, usize)>) -> Self {
            Self {
                steps,
                calls: 0,
                read: 0,
                written: 0,
                enabled: true,
            }
        }
    }

    impl DecompressionEngine for Scripted {
        fn decompress(
            &mut self,
            input: &mut WireBuffer,
        ) -> Result<Vec<InternalBuffer>, DecompressionError> {
            let (consume, read, written, out) = self.steps[self.calls];
            self.calls += 1;
            self.read = read;
            self.written = written;
            input.advance(consume);
            Ok(vec![InternalBuffer::from(vec![b'x'; out])])
        }

        fn bytes_read(&self) -> u64 {
            self.read
        }

        fn bytes_written(&self) -> u64 {
            self.written
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }
    }

    fn limits(ratio_limit: u64, tolerance: u32) -> DecompressionLimits {
        DecompressionLimits {
            ratio_limit,
            tolerance,
            ..DecompressionLimits::default()
        }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn single_step_over_ratio_without_tolerance() {
        let mut session = DecompressionSession::new(&limits(1, 0));
        let mut engine = Scripted::new(vec![(100, 100, 200, 200)]);

        let err = session
            .run(&mut engine, [WireBuffer::from_slice(&[0; 100])])
            .unwrap_err();

        assert!(matches!(err, DecompressionError::Bomb { cycles: 1, .. }));
        assert!(err.no_ffdc());
        assert_eq!(engine.calls, 1);
        assert!(!session.is_active());
    }

    #[test]
    fn chunks_within_ratio_are_joined() {
        let mut session = DecompressionSession::new(&limits(100, 3));
        let mut engine = Scripted::new(vec![(10, 10, 40, 40), (10, 20, 100, 60)]);

        let out = session
            .run(
                &mut engine,
                [WireBuffer::from_slice(&[0; 10]), WireBuffer::from_slice(&[0; 10])],
            )
            .unwrap();

        assert_eq!(out.remaining(), 100);
        assert_eq!(session.bytes_read(), 20);
        assert_eq!(session.bytes_written(), 100);
        assert_eq!(session.over_limit_streak(), 0);
    }

    #[test]
    fn sustained_expansion_fails_after_tolerance() {
        #[rustfmt::skip]
        let cases = [
            (0, 1),
            (1, 2),
            (3, 4),
            (5, 6),
        ];

        for (tolerance, calls) in cases {
            let steps = (1..=10u64).map(|i| (1, i, i * 50, 50)).collect();
            let mut session = DecompressionSession::new(&limits(10, tolerance));
            let mut engine = Scripted::new(steps);

            let result = session.run(&mut engine, [WireBuffer::from_slice(&[0; 10])]);

            assert!(matches!(result, Err(DecompressionError::Bomb { .. })));
            assert_eq!(engine.calls, calls);
        }
    }

    #[test]
    fn transient_expansion_is_tolerated() {
        // Over the limit twice in a row, back under, then over twice again.
        #[rustfmt::skip]
        let steps = vec![
            (1, 1,    50,  50),
            (1, 2,    80,  30),
            (1, 10,   90,  10),
            (1, 11,  200, 110),
            (1, 12,  300, 100),
            (1, 100, 300,   0),
        ];
        let mut session = DecompressionSession::new(&limits(10, 2));
        let mut engine = Scripted::new(steps);

        let out = session
            .run(&mut engine, [WireBuffer::from_slice(&[0; 6])])
            .unwrap();

        assert_eq!(out.remaining(), 300);
        assert_eq!(engine.calls, 6);
    }

    #[test]
    fn disabled_engine_returns_input() {
        let mut session = DecompressionSession::new(&limits(1, 0));
        let mut engine = Scripted::new(vec![]);
        engine.enabled = false;

        let out = session
            .run(
                &mut engine,
                [WireBuffer::from_slice(b"ab"), WireBuffer::from_slice(b"cd")],
            )
            .unwrap();

        assert_eq!(out.as_slice(), b"abcd");
        assert_eq!(engine.calls, 0);
    }

    #[test]
    fn empty_input_skips_engine() {
        let mut session = DecompressionSession::new(&limits(1, 0));
        let mut engine = Scripted::new(vec![]);

        let out = session
            .run(&mut engine, [WireBuffer::from_static(b"")])
            .unwrap();
        assert!(out.is_empty());

        let out = session.run(&mut engine, []).unwrap();
        assert!(out.is_empty());
        assert_eq!(engine.calls, 0);
    }

    #[test]
    fn stalled_engine() {
        let mut session = DecompressionSession::new(&limits(100, 3));
        let mut engine = Scripted::new(vec![(0, 0, 0, 0)]);

        let result = session.run(&mut engine, [WireBuffer::from_slice(b"data")]);
        assert!(matches!(result, Err(DecompressionError::Stalled)));
    }

    #[test]
    fn gzip_round_trip() {
        let text = b"The quick brown fox jumps over the lazy dog. ".repeat(20);
        let compressed = gzip(&text);
        let (head, tail) = compressed.split_at(compressed.len() / 2);

        let mut session = DecompressionSession::new(&DecompressionLimits::default());
        let out = session
            .run(
                &mut GzipEngine::new(),
                [WireBuffer::from_slice(head), WireBuffer::from_slice(tail)],
            )
            .unwrap();

        assert_eq!(out.as_slice(), text.as_slice());
        assert_eq!(session.bytes_read(), compressed.len() as u64);
        assert_eq!(session.bytes_written(), text.len() as u64);
    }

    #[test]
    fn gzip_bomb_is_rejected() {
        let compressed = gzip(&vec![0u8; 8 * 1024 * 1024]);
        let mut session = DecompressionSession::new(&limits(100, 3));

        let result = session.run(&mut GzipEngine::new(), [WireBuffer::from(Bytes::from(compressed))]);
        assert!(matches!(result, Err(DecompressionError::Bomb { .. })));
    }

    #[test]
    fn guard_selects_engine() {
        let text = b"deflate me, deflate me, deflate me".to_vec();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&text).unwrap();
        let deflated = encoder.finish().unwrap();

        let guard = DecompressionGuard::new(DecompressionLimits::default());

        #[rustfmt::skip]
        let cases = [
            (Some(&b"gzip"[..]),     gzip(&text), true),
            (Some(&b"X-GZIP"[..]),   gzip(&text), true),
            (Some(&b" deflate"[..]), deflated,    true),
            (Some(&b"br"[..]),       text.clone(), false),
            (None,                   text.clone(), false),
        ];

        for (encoding, body, enabled) in cases {
            assert_eq!(guard.engine_for(encoding).is_enabled(), enabled);

            let out = guard.decode(encoding, InternalBuffer::from(body)).unwrap();
            assert_eq!(out.as_slice(), text.as_slice());
        }
    }

    #[test]
    fn guard_disabled_auto_decompression() {
        let compressed = gzip(b"stays compressed");
        let guard = DecompressionGuard::new(DecompressionLimits {
            auto_decompression: false,
            ..DecompressionLimits::default()
        });

        let out = guard
            .decode(Some(b"gzip"), InternalBuffer::from(compressed.clone()))
            .unwrap();
        assert_eq!(out.as_slice(), compressed.as_slice());
    }

    #[test]
    fn corrupt_gzip() {
        let guard = DecompressionGuard::new(DecompressionLimits::default());
        let result = guard.decode(Some(b"gzip"), InternalBuffer::from("definitely not gzip"));

        assert!(matches!(result, Err(DecompressionError::Corrupt(_))));
    }
}
