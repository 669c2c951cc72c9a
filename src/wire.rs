//! Ingest stream framing.
//!
//! Agents hold one TCP connection to the collector and write a sequence of
//! length-delimited frames (4-byte big-endian length). Each frame is
//! `[WIRE_VERSION][wincode(Metric)]`. The collector never writes back; the
//! stream ends when the agent shuts down its write half.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::blob::{self, WIRE_VERSION};
use crate::error::{SessionError, ValidationError};
use crate::models::Metric;

/// Default upper bound for a single frame. A metric encodes to well under 1 KiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Wrap a byte stream in the ingest framing.
pub fn framed<T>(io: T, max_frame_bytes: usize) -> Framed<T, LengthDelimitedCodec>
where
    T: AsyncRead + AsyncWrite,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec();
    Framed::new(io, codec)
}

pub fn encode_metric(metric: &Metric) -> Result<Bytes, SessionError> {
    let payload = wincode::serialize(metric).map_err(|e| SessionError::Encode(e.to_string()))?;
    Ok(Bytes::from(blob::with_version_prefix(WIRE_VERSION, payload)))
}

/// Decode one frame body. Failures are per-message: the stream carries on.
pub fn decode_metric(frame: &[u8]) -> Result<Metric, ValidationError> {
    let (version, payload) = blob::split_version(frame)
        .ok_or_else(|| ValidationError::MalformedFrame("empty frame".into()))?;
    if version != WIRE_VERSION {
        return Err(ValidationError::UnsupportedVersion(version));
    }
    wincode::deserialize(payload).map_err(|e| ValidationError::MalformedFrame(e.to_string()))
}
