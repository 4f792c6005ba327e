use crate::{
    buffer::internal::InternalBuffer,
    guard::crlf::{CrlfValidator, IllegalInput, MAX_LEADING_CRLF},
    http::{
        message::{Header, Request, Response},
        types::{self, has_token, Method, StatusCode, Version},
    },
    limits::CodecLimits,
};
use bytes::{Buf, Bytes, BytesMut};
use memchr::{memchr, memmem};
use std::ops::Range;
use thiserror::Error;

/// A request head or framing the codec refuses to interpret.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },
    #[error("request head is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed request line")]
    InvalidRequestLine,
    #[error("unsupported request method")]
    InvalidMethod,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("more than {limit} headers")]
    TooManyHeaders { limit: usize },
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("body of {len} bytes exceeds the limit of {limit}")]
    BodyTooLarge { len: usize, limit: usize },
    #[error("Transfer-Encoding is not supported")]
    UnsupportedTransferEncoding,
}

// Head parsed into ranges of the receive buffer, sliced once complete.
#[derive(Debug)]
struct Head {
    len: usize,
    method: Method,
    target: Range<usize>,
    version: Version,
    headers: Vec<(Range<usize>, Range<usize>)>,
    content_length: Option<usize>,
    keep_alive: bool,
}

/// Built-in HTTP/1 head codec.
///
/// Bytes handed to [`feed`](Self::feed) accumulate until a complete request
/// (head plus `Content-Length` body) can be decoded. Whatever follows the
/// last decoded request stays buffered, which is how pipelined requests and
/// bytes sent right after an upgrade request are preserved.
#[derive(Debug)]
pub struct H1Codec {
    limits: CodecLimits,
    buffer: BytesMut,
}

impl H1Codec {
    #[inline]
    pub fn new(limits: CodecLimits) -> Self {
        Self {
            buffer: BytesMut::with_capacity(limits.max_head_size),
            limits,
        }
    }

    #[inline]
    pub fn feed(&mut self, data: &InternalBuffer) {
        self.buffer.extend_from_slice(data.as_slice());
    }

    /// Bytes received but not decoded yet.
    #[inline(always)]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Takes every buffered byte, leaving the codec empty.
    #[inline]
    pub fn take_buffered(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    /// Runs `validator` over the start of the next message and drops the
    /// empty lines it accepted.
    #[inline]
    pub fn screen(&mut self, validator: &mut CrlfValidator) -> Result<(), IllegalInput> {
        let pairs = validator.observe(&self.buffer)?;
        self.buffer.advance(pairs * 2);
        Ok(())
    }

    /// Decodes the next complete request, `None` if more bytes are needed.
    ///
    /// At most [`MAX_LEADING_CRLF`] empty lines are skipped in front of the
    /// request line; any further one fails as a malformed request line.
    pub fn decode(&mut self) -> Result<Option<Request>, CodecError> {
        let mut skipped = 0;
        while skipped < MAX_LEADING_CRLF && self.buffer.starts_with(b"\r\n") {
            self.buffer.advance(2);
            skipped += 1;
        }

        let Some(end) = memmem::find(&self.buffer, b"\r\n\r\n") else {
            if self.buffer.len() > self.limits.max_head_size {
                return Err(CodecError::HeadTooLarge {
                    limit: self.limits.max_head_size,
                });
            }
            return Ok(None);
        };

        let head = self.parse_head(end)?;
        let body_len = head.content_length.unwrap_or(0);
        if self.buffer.len() < head.len + body_len {
            return Ok(None);
        }

        let raw = self.buffer.split_to(head.len).freeze();
        let body = self.buffer.split_to(body_len).freeze();

        Ok(Some(Request {
            method: head.method,
            target: raw.slice(head.target),
            version: head.version,
            headers: head
                .headers
                .into_iter()
                .map(|(name, value)| Header {
                    name: raw.slice(name),
                    value: raw.slice(value),
                })
                .collect(),
            content_length: head.content_length,
            keep_alive: head.keep_alive,
            body: InternalBuffer::wrap(body),
        }))
    }

    fn parse_head(&self, end: usize) -> Result<Head, CodecError> {
        let len = end + 4;
        if len > self.limits.max_head_size {
            return Err(CodecError::HeadTooLarge {
                limit: self.limits.max_head_size,
            });
        }

        let src = &self.buffer[..end];
        simdutf8::basic::from_utf8(src).map_err(|_| CodecError::InvalidUtf8)?;

        let mut lines = LineIter { src, pos: 0 };
        let (line, offset) = lines.next().ok_or(CodecError::InvalidRequestLine)?;
        let (method, target, version, mut keep_alive) = parse_request_line(line, offset)?;

        let mut headers = Vec::new();
        let mut content_length = None;
        let mut connection = None;

        for (line, offset) in lines {
            if headers.len() == self.limits.max_headers {
                return Err(CodecError::TooManyHeaders {
                    limit: self.limits.max_headers,
                });
            }

            let (name, value) = parse_header(line, offset)?;
            let value_bytes = &src[value.clone()];

            match &src[name.clone()] {
                n if n.eq_ignore_ascii_case(b"content-length") => {
                    let len =
                        types::slice_to_usize(value_bytes).ok_or(CodecError::InvalidContentLength)?;

                    if content_length.is_some_and(|prev| prev != len) {
                        return Err(CodecError::InvalidContentLength);
                    }
                    if len > self.limits.max_body_size {
                        return Err(CodecError::BodyTooLarge {
                            len,
                            limit: self.limits.max_body_size,
                        });
                    }
                    content_length = Some(len);
                }
                n if n.eq_ignore_ascii_case(b"transfer-encoding") => {
                    return Err(CodecError::UnsupportedTransferEncoding);
                }
                n if n.eq_ignore_ascii_case(b"connection") => {
                    connection.get_or_insert(value.clone());
                }
                _ => {}
            }

            headers.push((name, value));
        }

        if let Some(value) = connection {
            let value = &src[value];
            if has_token(value, b"close") {
                keep_alive = false;
            } else if has_token(value, b"keep-alive") {
                keep_alive = true;
            }
        }

        Ok(Head {
            len,
            method,
            target,
            version,
            headers,
            content_length,
            keep_alive,
        })
    }

    /// Serializes the status line and headers of `response`.
    ///
    /// `content-length` is derived from the body, `connection: close` is
    /// added when the connection ends after this response.
    pub fn encode_head(response: &Response, version: Version, close: bool) -> Bytes {
        let mut dst = BytesMut::with_capacity(128);
        dst.extend_from_slice(response.status.into_first_line(version));

        for header in &response.headers {
            let name = &header.name[..];
            if name.eq_ignore_ascii_case(b"content-length")
                || (close && name.eq_ignore_ascii_case(b"connection"))
            {
                continue;
            }

            dst.extend_from_slice(name);
            dst.extend_from_slice(b": ");
            dst.extend_from_slice(&header.value);
            dst.extend_from_slice(b"\r\n");
        }

        if close && response.status != StatusCode::SwitchingProtocols {
            dst.extend_from_slice(b"connection: close\r\n");
        }
        if response.status.allows_body() {
            dst.extend_from_slice(b"content-length: ");
            dst.extend_from_slice(response.body.remaining().to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
        }

        dst.extend_from_slice(b"\r\n");
        dst.freeze()
    }
}

// Yields `CRLF`-terminated lines with their offset in the head.
struct LineIter<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for LineIter<'a> {
    type Item = (&'a [u8], usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos > self.src.len() {
            return None;
        }

        let start = self.pos;
        let rest = &self.src[start..];
        let len = memmem::find(rest, b"\r\n").unwrap_or(rest.len());

        self.pos = start + len + 2;
        Some((&rest[..len], start))
    }
}

#[inline]
fn parse_request_line(
    line: &[u8],
    offset: usize,
) -> Result<(Method, Range<usize>, Version, bool), CodecError> {
    let first = memchr(b' ', line).ok_or(CodecError::InvalidRequestLine)?;
    let second = memchr(b' ', &line[first + 1..])
        .map(|i| first + 1 + i)
        .ok_or(CodecError::InvalidRequestLine)?;

    let method = Method::from_bytes(&line[..first]).ok_or(CodecError::InvalidMethod)?;

    let target = &line[first + 1..second];
    if target.is_empty() || target.iter().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(CodecError::InvalidRequestLine);
    }

    let version_bytes = &line[second + 1..];
    if memchr(b' ', version_bytes).is_some() {
        return Err(CodecError::InvalidRequestLine);
    }
    let (version, keep_alive) =
        Version::from_bytes(version_bytes).ok_or(CodecError::UnsupportedVersion)?;

    Ok((
        method,
        offset + first + 1..offset + second,
        version,
        keep_alive,
    ))
}

#[inline]
fn parse_header(line: &[u8], offset: usize) -> Result<(Range<usize>, Range<usize>), CodecError> {
    if line.iter().any(|&b| b == b'\r' || b == b'\n') {
        return Err(CodecError::InvalidHeader);
    }

    let colon = memchr(b':', line).ok_or(CodecError::InvalidHeader)?;
    let name = &line[..colon];
    if name.is_empty() || name.iter().any(|b| !b.is_ascii_graphic()) {
        return Err(CodecError::InvalidHeader);
    }

    let raw = &line[colon + 1..];
    let value = types::trim(raw);
    let start = match value.is_empty() {
        true => colon + 1,
        false => colon + 1 + (value.as_ptr() as usize - raw.as_ptr() as usize),
    };

    Ok((
        offset..offset + colon,
        offset + start..offset + start + value.len(),
    ))
}
