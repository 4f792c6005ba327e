use crate::{
    guard::{crlf::IllegalInput, decompress::DecompressionError},
    http::{codec::CodecError, types::Version},
    timeout::TimeoutError,
};
use std::io;
use thiserror::Error;

/// Every cause that ends a connection.
#[derive(Debug, Error)]
pub(crate) enum ErrorKind {
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    IllegalInput(#[from] IllegalInput),
    #[error(transparent)]
    Decompression(#[from] DecompressionError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("admission queue is full")]
    ServiceUnavailable,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ErrorKind {
    /// Expected adversarial input: logged at debug level without detail.
    #[inline]
    pub(crate) const fn suppress_diagnostics(&self) -> bool {
        match self {
            Self::IllegalInput(err) => err.no_ffdc,
            Self::Decompression(err) => err.no_ffdc(),
            _ => false,
        }
    }

    /// Best-effort response for this error, if the client should get one.
    ///
    /// Timeouts other than a stalled request read, and I/O failures, end the
    /// connection silently.
    #[inline]
    pub(crate) const fn canned(&self) -> Option<Canned> {
        Some(match self {
            Self::Timeout(TimeoutError::Read(_)) => Canned::RequestTimeout,
            Self::Timeout(_) | Self::Io(_) => return None,

            Self::IllegalInput(_) => Canned::IllegalInput,
            Self::Decompression(DecompressionError::Bomb { .. }) => Canned::DecompressionLimit,
            Self::Decompression(_) => Canned::InvalidEncoding,

            Self::Codec(err) => match err {
                CodecError::HeadTooLarge { .. } | CodecError::TooManyHeaders { .. } => {
                    Canned::HeadTooLarge
                }
                CodecError::BodyTooLarge { .. } => Canned::BodyTooLarge,
                CodecError::InvalidMethod | CodecError::UnsupportedTransferEncoding => {
                    Canned::NotImplemented
                }
                CodecError::UnsupportedVersion => Canned::UnsupportedVersion,
                CodecError::InvalidUtf8
                | CodecError::InvalidRequestLine
                | CodecError::InvalidHeader
                | CodecError::InvalidContentLength => Canned::BadRequest,
            },

            Self::ServiceUnavailable => Canned::ServiceUnavailable,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Canned {
    BadRequest,
    IllegalInput,
    DecompressionLimit,
    InvalidEncoding,
    RequestTimeout,
    BodyTooLarge,
    HeadTooLarge,
    NotImplemented,
    ServiceUnavailable,
    UnsupportedVersion,
}

macro_rules! http_errors {
    ($($name:ident: $status_code:expr, $len:literal => $json:literal; )*) => {
        pub(crate) const fn as_http(&self, version: Version, json: bool) -> &'static [u8] {
            match (json, self, version) { $(
                (true, Self::$name, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
                (true, Self::$name, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (false, Self::$name, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: 0\r\n\r\n",
                ),
            )* }.as_bytes()
        }
    };
}

impl Canned {
    http_errors! {
        BadRequest: "400 Bad Request", "50"
            => r#"{"error":"Malformed request","code":"BAD_REQUEST"}"#;
        IllegalInput: "400 Bad Request", "67"
            => r#"{"error":"Illegal leading line terminators","code":"ILLEGAL_INPUT"}"#;
        DecompressionLimit: "400 Bad Request", "69"
            => r#"{"error":"Decompression limit exceeded","code":"DECOMPRESSION_LIMIT"}"#;
        InvalidEncoding: "400 Bad Request", "62"
            => r#"{"error":"Invalid content encoding","code":"INVALID_ENCODING"}"#;

        RequestTimeout: "408 Request Timeout", "56"
            => r#"{"error":"Request read timed out","code":"READ_TIMEOUT"}"#;

        BodyTooLarge: "413 Payload Too Large", "58"
            => r#"{"error":"Request body too large","code":"BODY_TOO_LARGE"}"#;
        HeadTooLarge: "431 Request Header Fields Too Large", "58"
            => r#"{"error":"Request head too large","code":"HEAD_TOO_LARGE"}"#;

        NotImplemented: "501 Not Implemented", "52"
            => r#"{"error":"Not implemented","code":"NOT_IMPLEMENTED"}"#;
        ServiceUnavailable: "503 Service Unavailable", "72"
            => r#"{"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}"#;
        UnsupportedVersion: "505 HTTP Version Not Supported", "67"
            => r#"{"error":"HTTP version not supported","code":"UNSUPPORTED_VERSION"}"#;
    }
}
