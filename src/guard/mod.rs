//! Abuse checks applied to inbound data before it is trusted

pub(crate) mod crlf;
pub(crate) mod decompress;
