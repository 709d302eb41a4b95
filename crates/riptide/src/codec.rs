//! Frame codec
//!
//! Splits the inbound byte stream into discrete frames and frames
//! outbound payloads. `decode` pulls bytes through the connection's
//! `read`/`read_n`/`shift_n` API; returning `Ok(None)` means "not enough
//! bytes yet" and ends the current drain loop.

use crate::conn::Conn;
use crate::error::Result;

pub trait Codec: Send + Sync {
    /// Frame an outbound payload.
    fn encode(&self, c: &mut Conn, buf: &[u8]) -> Result<Vec<u8>>;

    /// Extract the next complete frame, or `None` when more bytes are
    /// needed.
    fn decode(&self, c: &mut Conn) -> Result<Option<Vec<u8>>>;
}

/// Identity framing: every readable span is one frame, passed through
/// unmodified in both directions.
pub struct BuiltInFrameCodec;

impl Codec for BuiltInFrameCodec {
    fn encode(&self, _c: &mut Conn, buf: &[u8]) -> Result<Vec<u8>> {
        Ok(buf.to_vec())
    }

    fn decode(&self, c: &mut Conn) -> Result<Option<Vec<u8>>> {
        let frame = c.read().to_vec();
        if frame.is_empty() {
            return Ok(None);
        }
        c.reset_buffer();
        Ok(Some(frame))
    }
}
