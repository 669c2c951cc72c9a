// Version-prefixed payloads: [version: u8][payload].
// Used for wire frames (wincode) and persisted records (JSON) so either can evolve.

/// Wire frame carrying a wincode `Metric`.
pub(crate) const WIRE_VERSION: u8 = 1;
/// Persisted `MetricRecord` encoded as JSON.
pub(crate) const RECORD_VERSION: u8 = 1;

pub(crate) fn with_version_prefix(version: u8, payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(version);
    out.extend_from_slice(&payload);
    out
}

/// Split into (version, payload). `None` for an empty blob.
pub(crate) fn split_version(bytes: &[u8]) -> Option<(u8, &[u8])> {
    let (&version, payload) = bytes.split_first()?;
    Some((version, payload))
}
