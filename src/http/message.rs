use crate::{
    buffer::internal::InternalBuffer,
    http::types::{has_token, Method, StatusCode, Version},
};
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) name: Bytes,
    pub(crate) value: Bytes,
}

#[inline]
fn find<'a>(headers: &'a [Header], name: &[u8]) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| &h.value[..])
}

/// A decoded HTTP/1 request.
///
/// Header names and values share memory with the bytes read from the
/// socket. The body has already had its content coding removed when the
/// request reaches a [`Handler`](crate::Handler).
///
/// # Head format
/// ```text
/// [METHOD] SP [TARGET] SP HTTP/1.[0|1] CRLF
/// ([NAME] ":" OWS [VALUE] OWS CRLF)*
/// CRLF
/// [BODY: exactly Content-Length bytes]
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) target: Bytes,
    pub(crate) version: Version,

    pub(crate) headers: Vec<Header>,
    pub(crate) content_length: Option<usize>,
    pub(crate) keep_alive: bool,

    pub(crate) body: InternalBuffer,
}

impl Request {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Raw request target, query string included.
    #[inline(always)]
    pub fn target(&self) -> &[u8] {
        &self.target
    }

    /// Request target without the query string.
    #[inline]
    pub fn path(&self) -> &[u8] {
        match memchr::memchr(b'?', &self.target) {
            Some(index) => &self.target[..index],
            None => &self.target,
        }
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// First value of header `name`, compared without regard to ASCII case.
    #[inline]
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        find(&self.headers, name)
    }

    /// Same as [`header`](Self::header). The head was validated as UTF-8
    /// before it was parsed.
    #[inline]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name.as_bytes())
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    #[inline]
    pub fn headers(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.headers.iter().map(|h| (&h.name[..], &h.value[..]))
    }

    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    /// Whether the client asked to keep the connection open.
    #[inline(always)]
    pub const fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Protocol token of an `Upgrade` request (`Connection: upgrade` plus an
    /// `Upgrade` header).
    #[inline]
    pub fn upgrade(&self) -> Option<&[u8]> {
        let connection = self.header(b"connection")?;
        match has_token(connection, b"upgrade") {
            true => self.header(b"upgrade"),
            false => None,
        }
    }

    #[inline(always)]
    pub const fn body(&self) -> &InternalBuffer {
        &self.body
    }
}

//

/// A response produced by a [`Handler`](crate::Handler).
///
/// `content-length` is always computed by the server and must not be set
/// by hand.
///
/// # Examples
/// ```
/// use tollgate::{Response, StatusCode};
///
/// let resp = Response::new(StatusCode::Created)
///     .header("content-type", "application/json")
///     .body(r#"{"id":1}"#);
///
/// assert_eq!(resp.status_code(), StatusCode::Created);
/// assert_eq!(resp.header_value(b"Content-Type"), Some(&b"application/json"[..]));
/// assert_eq!(resp.payload().as_slice(), br#"{"id":1}"#);
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    pub(crate) status: StatusCode,
    pub(crate) headers: Vec<Header>,
    pub(crate) body: InternalBuffer,
    pub(crate) close: bool,
}

impl Response {
    #[inline]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: InternalBuffer::empty(),
            close: false,
        }
    }

    #[inline]
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok)
    }

    /// `101 Switching Protocols` to `protocol`, e.g. `"websocket"`.
    ///
    /// Once this response has been written the connection leaves HTTP and
    /// is handed to the [`UpgradeHandler`](crate::UpgradeHandler).
    #[inline]
    pub fn switching_protocols(protocol: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::SwitchingProtocols)
            .header("connection", "upgrade")
            .header("upgrade", protocol)
    }

    #[inline]
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    #[inline]
    pub fn header(mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.headers.push(Header {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    #[inline]
    pub fn body(mut self, body: impl Into<InternalBuffer>) -> Self {
        self.body = body.into();
        self
    }

    /// Closes the connection once this response is written.
    #[inline]
    pub fn close(mut self) -> Self {
        self.close = true;
        self
    }

    #[inline(always)]
    pub const fn status_code(&self) -> StatusCode {
        self.status
    }

    #[inline]
    pub fn header_value(&self, name: &[u8]) -> Option<&[u8]> {
        find(&self.headers, name)
    }

    #[inline(always)]
    pub const fn payload(&self) -> &InternalBuffer {
        &self.body
    }

    #[inline(always)]
    pub const fn is_close(&self) -> bool {
        self.close
    }
}
