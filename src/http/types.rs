//! Core HTTP protocol types

#[inline(always)]
pub(crate) fn slice_to_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: usize = 0;

    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as usize)?;
    }

    Some(result)
}

/// `true` if the comma-separated `list` contains `token`, compared without
/// regard to ASCII case.
#[inline]
pub(crate) fn has_token(list: &[u8], token: &[u8]) -> bool {
    list.split(|&b| b == b',')
        .any(|item| trim(item).eq_ignore_ascii_case(token))
}

#[inline]
pub(crate) fn trim(value: &[u8]) -> &[u8] {
    let start = value.iter().position(|b| !matches!(b, b' ' | b'\t'));
    let end = value.iter().rposition(|b| !matches!(b, b' ' | b'\t'));

    match (start, end) {
        (Some(start), Some(end)) => &value[start..=end],
        _ => &[],
    }
}

// METHOD

/// HTTP request methods
///
/// `TRACE` and `CONNECT` are not accepted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
    Head,
    Patch,
    Delete,
    Options,
}

impl Method {
    #[inline(always)]
    pub(crate) fn from_bytes(src: &[u8]) -> Option<Self> {
        match src {
            b"GET" => Some(Self::Get),
            b"PUT" => Some(Self::Put),
            b"POST" => Some(Self::Post),
            b"HEAD" => Some(Self::Head),
            b"PATCH" => Some(Self::Patch),
            b"DELETE" => Some(Self::Delete),
            b"OPTIONS" => Some(Self::Options),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Head => "HEAD",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
        }
    }
}

// VERSION

/// HTTP protocol version
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    /// [RFC 1945](https://tools.ietf.org/html/rfc1945)
    Http10,
    /// [RFC 9112](https://datatracker.ietf.org/doc/html/rfc9112)
    Http11,
}

impl Version {
    /// Parses the version of a request line, returning it with the
    /// keep-alive default of that version.
    #[inline(always)]
    pub(crate) const fn from_bytes(src: &[u8]) -> Option<(Self, bool)> {
        match src {
            b"HTTP/1.1" => Some((Self::Http11, true)),
            b"HTTP/1.0" => Some((Self::Http10, false)),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $name:ident = ($num:expr, $str:expr);
    )+) => {
        /// HTTP status codes
        ///
        /// Valid status codes as defined in
        /// [RFC 9110](https://datatracker.ietf.org/doc/html/rfc9110#section-15).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $name = $num,
        )+ }

        impl StatusCode {
            // Returns the status line as bytes (e.g., `b"HTTP/1.1 200 OK\r\n"`).
            #[inline]
            pub(crate) const fn into_first_line(&self, version: Version) -> &'static [u8] {
                match (self, version) { $(
                    (StatusCode::$name, Version::Http11) => {
                        concat!("HTTP/1.1 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                    (StatusCode::$name, Version::Http10) => {
                        concat!("HTTP/1.0 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                )+ }
            }
        }
    }
}

impl StatusCode {
    #[inline(always)]
    pub const fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// `1xx`, `204` and `304` responses never carry a body.
    #[inline]
    pub const fn allows_body(&self) -> bool {
        !matches!(self.as_u16(), 100..=199 | 204 | 304)
    }
}

set_status_codes! {
    Continue = (100, "Continue");
    SwitchingProtocols = (101, "Switching Protocols");

    Ok = (200, "OK");
    Created = (201, "Created");
    Accepted = (202, "Accepted");
    NoContent = (204, "No Content");

    MovedPermanently = (301, "Moved Permanently");
    Found = (302, "Found");
    SeeOther = (303, "See Other");
    NotModified = (304, "Not Modified");
    TemporaryRedirect = (307, "Temporary Redirect");
    PermanentRedirect = (308, "Permanent Redirect");

    BadRequest = (400, "Bad Request");
    Unauthorized = (401, "Unauthorized");
    Forbidden = (403, "Forbidden");
    NotFound = (404, "Not Found");
    MethodNotAllowed = (405, "Method Not Allowed");
    RequestTimeout = (408, "Request Timeout");
    Conflict = (409, "Conflict");
    LengthRequired = (411, "Length Required");
    PayloadTooLarge = (413, "Payload Too Large");
    UnsupportedMediaType = (415, "Unsupported Media Type");
    UpgradeRequired = (426, "Upgrade Required");
    TooManyRequests = (429, "Too Many Requests");
    RequestHeaderFieldsTooLarge = (431, "Request Header Fields Too Large");

    InternalServerError = (500, "Internal Server Error");
    NotImplemented = (501, "Not Implemented");
    BadGateway = (502, "Bad Gateway");
    ServiceUnavailable = (503, "Service Unavailable");
    GatewayTimeout = (504, "Gateway Timeout");
    HttpVersionNotSupported = (505, "HTTP Version Not Supported");
}

#[cfg(test)]
mod types_tests {
    use super::*;

    #[test]
    fn parse_numbers() {
        #[rustfmt::skip]
        let cases = [
            ("0",                    Some(0)),
            ("123",                  Some(123)),
            ("007",                  Some(7)),
            ("",                     None),
            ("12a",                  None),
            ("-1",                   None),
            (" 1",                   None),
            ("99999999999999999999", None),
        ];

        for (src, expected) in cases {
            assert_eq!(slice_to_usize(src.as_bytes()), expected, "{src:?}");
        }
    }

    #[test]
    fn tokens() {
        #[rustfmt::skip]
        let cases = [
            ("close",              "close",   true),
            ("Keep-Alive",         "keep-alive", true),
            ("keep-alive, Upgrade", "upgrade", true),
            (" upgrade ,close",    "close",   true),
            ("closed",             "close",   false),
            ("",                   "close",   false),
        ];

        for (list, token, expected) in cases {
            assert_eq!(has_token(list.as_bytes(), token.as_bytes()), expected, "{list:?}");
        }
    }

    #[test]
    fn status_line() {
        #[rustfmt::skip]
        let cases = [
            (StatusCode::Ok,                 Version::Http11, "HTTP/1.1 200 OK\r\n"),
            (StatusCode::SwitchingProtocols, Version::Http11, "HTTP/1.1 101 Switching Protocols\r\n"),
            (StatusCode::NotFound,           Version::Http10, "HTTP/1.0 404 Not Found\r\n"),
        ];

        for (status, version, line) in cases {
            assert_eq!(status.into_first_line(version), line.as_bytes());
        }

        assert!(!StatusCode::SwitchingProtocols.allows_body());
        assert!(!StatusCode::NoContent.allows_body());
        assert!(StatusCode::Ok.allows_body());
    }
}
