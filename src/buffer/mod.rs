//! Buffer model shared by every pipeline stage
//!
//! ```text
//!  transport ──WireBuffer──> [ CRLF validator ] ──> [ BufferBridge ] ──InternalBuffer──> codec
//!  transport <──Outbound──── [ BufferBridge ] <──InternalBuffer── response
//! ```

pub(crate) mod bridge;
pub(crate) mod internal;
pub(crate) mod wire;
