use crate::buffer::wire::WireBuffer;
use thiserror::Error;

/// Largest number of leading `CRLF` pairs tolerated in front of a request.
///
/// RFC 9112 lets servers ignore at least one empty line before a request
/// line; two covers clients that terminate a body with an extra `CRLF`.
pub const MAX_LEADING_CRLF: usize = 2;

/// Input that must not reach the request parser.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{count} leading CRLF pairs exceed the limit of {limit}")]
pub struct IllegalInput {
    /// Number of pairs counted before giving up.
    pub count: usize,
    pub limit: usize,
    /// Set for expected adversarial input: callers skip deep diagnostic
    /// capture (dumps, stack traces) and log at debug level only.
    pub no_ffdc: bool,
}

/// Rejects request heads prefixed by a flood of empty lines.
///
/// Must run before anything interprets the buffer as a protocol message.
/// [`validate`](Self::validate) only borrows the buffer, so its read
/// position is the same after validation as before.
///
/// On a connection the validator also carries its count across reads:
/// [`observe`](Self::observe) is called at every message boundary and keeps
/// counting until the first byte of a request line arrives, so a flood split
/// over many small segments is rejected like one sent at once.
///
/// # Examples
/// ```
/// use tollgate::{CrlfValidator, WireBuffer};
///
/// let validator = CrlfValidator::default();
///
/// assert!(validator.validate(&WireBuffer::from_slice(b"\r\n\r\nGET / HTTP/1.1\r\n")).is_ok());
/// assert!(validator.validate(&WireBuffer::from_slice(b"\r\n\r\n\r\nGET / HTTP/1.1\r\n")).is_err());
///
/// let mut validator = CrlfValidator::default();
/// assert_eq!(validator.observe(b"\r\n\r"), Ok(1));
/// assert_eq!(validator.observe(b"\r\n"), Ok(1));
/// assert!(validator.observe(b"\r\nGET /").is_err());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CrlfValidator {
    limit: usize,
    carried: usize,
    in_message: bool,
}

impl Default for CrlfValidator {
    #[inline]
    fn default() -> Self {
        Self::with_limit(MAX_LEADING_CRLF)
    }
}

impl CrlfValidator {
    #[inline]
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            carried: 0,
            in_message: false,
        }
    }

    /// Pairs counted at the current boundary by earlier reads.
    #[inline(always)]
    pub const fn carried(&self) -> usize {
        self.carried
    }

    #[inline]
    pub fn validate(&self, buffer: &WireBuffer) -> Result<(), IllegalInput> {
        self.count(buffer.chunk()).map(|_| ())
    }

    /// Screens the start of the next message and returns how many leading
    /// pairs of `head` it accepted; the caller drops them.
    ///
    /// A trailing lone `\r` stays pending: it may become a pair with the
    /// next read. Once a request byte is seen nothing is counted until
    /// [`message_complete`](Self::message_complete).
    pub fn observe(&mut self, head: &[u8]) -> Result<usize, IllegalInput> {
        if self.in_message {
            return Ok(0);
        }

        let pairs = self.count(head)?;
        match &head[pairs * 2..] {
            [] | [b'\r'] => self.carried += pairs,
            _ => {
                self.carried = 0;
                self.in_message = true;
            }
        }

        Ok(pairs)
    }

    /// Marks a message boundary: the next byte starts a new request.
    #[inline]
    pub fn message_complete(&mut self) {
        self.carried = 0;
        self.in_message = false;
    }

    // Pairs at the start of `data`, rejecting once the running total is
    // over the limit.
    fn count(&self, data: &[u8]) -> Result<usize, IllegalInput> {
        let pairs = leading_crlf(data, self.limit.saturating_sub(self.carried));
        let count = self.carried + pairs;

        if count > self.limit {
            tracing::debug!(count, limit = self.limit, "rejecting leading CRLF flood");
            return Err(IllegalInput {
                count,
                limit: self.limit,
                no_ffdc: true,
            });
        }

        Ok(pairs)
    }
}

// Stops one pair past `limit`, nothing beyond that changes the verdict.
#[inline]
fn leading_crlf(data: &[u8], limit: usize) -> usize {
    data.chunks_exact(2)
        .take(limit.saturating_add(1))
        .take_while(|pair| *pair == b"\r\n")
        .count()
}

#[cfg(test)]
mod crlf_tests {
    use super::*;

    #[test]
    fn validate() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\n\r\n",             None),
            ("\r\nGET / HTTP/1.1\r\n\r\n",         None),
            ("\r\n\r\nGET / HTTP/1.1\r\n\r\n",     None),
            ("\r\n\r\n",                           None),
            ("\r\n\r\n\r",                         None),
            ("\r\n\n\r\n\r\nGET /",                None),
            ("\n\r\n\r\n\r\n\r",                   None),
            ("",                                   None),
            ("\r",                                 None),

            ("\r\n\r\n\r\nGET / HTTP/1.1\r\n\r\n", Some(3)),
            ("\r\n\r\n\r\n",                       Some(3)),
            ("\r\n\r\n\r\n\r\n\r\n\r\n\r\n",       Some(3)),
        ];

        let validator = CrlfValidator::default();

        for (src, rejected) in cases {
            let buffer = WireBuffer::from_slice(src.as_bytes());
            let result = validator.validate(&buffer);

            match rejected {
                None => assert_eq!(result, Ok(()), "{src:?}"),
                Some(count) => assert_eq!(
                    result,
                    Err(IllegalInput { count, limit: 2, no_ffdc: true }),
                    "{src:?}"
                ),
            }

            assert_eq!(buffer.reader_index(), 0);
            assert_eq!(buffer.chunk(), src.as_bytes());
        }
    }

    #[test]
    fn counts_from_read_position() {
        let mut buffer = WireBuffer::from_slice(b"GET\r\n\r\n\r\n");
        buffer.advance(3);

        assert!(CrlfValidator::default().validate(&buffer).is_err());
        assert_eq!(buffer.reader_index(), 3);
    }

    #[test]
    fn custom_limit() {
        let buffer = WireBuffer::from_slice(b"\r\n\r\nGET /");

        assert!(CrlfValidator::with_limit(1).validate(&buffer).is_err());
        assert!(CrlfValidator::with_limit(0).validate(&WireBuffer::from_slice(b"GET /")).is_ok());
    }

    #[test]
    fn count_carries_across_reads() {
        #[rustfmt::skip]
        let cases: [(&[&str], Option<usize>); 6] = [
            (&["\r\n", "\r\n", "GET / HTTP/1.1"],         None),
            (&["\r\n\r", "\n", "GET /"],                    None),
            (&["\r\n", "\r\n", "\r\n"],                     Some(3)),
            (&["\r\n\r\n", "\r", "\n"],                     Some(3)),
            (&["\r", "\n\r\n", "\r\nGET /"],                Some(3)),
            (&["GET / HTTP/1.1", "\r\n\r\n\r\n\r\n"],       None),
        ];

        for (reads, rejected) in cases {
            let mut validator = CrlfValidator::default();
            let mut head = Vec::new();
            let mut result = Ok(0);

            for read in reads {
                head.extend_from_slice(read.as_bytes());
                result = validator.observe(&head);
                match result {
                    Ok(pairs) => drop(head.drain(..pairs * 2)),
                    Err(_) => break,
                }
            }

            match rejected {
                None => assert!(result.is_ok(), "{reads:?}"),
                Some(count) => assert_eq!(
                    result,
                    Err(IllegalInput { count, limit: 2, no_ffdc: true }),
                    "{reads:?}"
                ),
            }
        }
    }

    #[test]
    fn boundary_resets_the_count() {
        let mut validator = CrlfValidator::default();

        assert_eq!(validator.observe(b"\r\n\r\nGET /a HTTP/1.1\r\n\r\n"), Ok(2));
        assert_eq!(validator.carried(), 0);

        validator.message_complete();
        assert_eq!(validator.observe(b"\r\n\r\n"), Ok(2));
        assert_eq!(validator.carried(), 2);
        assert!(validator.observe(b"\r\n").is_err());

        validator.message_complete();
        assert_eq!(validator.observe(b"\r\n\r\nGET /b"), Ok(2));
    }

    #[test]
    fn message() {
        let err = CrlfValidator::default()
            .validate(&WireBuffer::from_slice(b"\r\n\r\n\r\n"))
            .unwrap_err();

        assert_eq!(err.to_string(), "3 leading CRLF pairs exceed the limit of 2");
    }
}
