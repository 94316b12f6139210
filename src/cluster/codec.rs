//! Serialization of the stored configuration blob.
//!
//! The blob is a single self-describing JSON document:
//!
//! ```text
//! {"format": 1, "version": 7, "config": { ...NodesConfiguration... }}
//! ```
//!
//! The version is duplicated at the envelope level so that stores can
//! recover it with [`extract_version`] without decoding the whole
//! configuration. Readers ignore unknown fields and fields added later
//! carry serde defaults, so older and newer readers can share a store.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::configuration::NodesConfiguration;
use super::error::{MembershipError, Result};
use crate::constants::CODEC_FORMAT_VERSION;
use crate::types::ConfigVersion;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    format: u32,
    version: ConfigVersion,
    config: &'a NodesConfiguration,
}

#[derive(Deserialize)]
struct Envelope {
    format: u32,
    version: ConfigVersion,
    config: NodesConfiguration,
}

#[derive(Deserialize)]
struct VersionOnly {
    version: ConfigVersion,
}

/// Serialize a configuration into a store blob.
pub fn encode(config: &NodesConfiguration) -> Result<Bytes> {
    let envelope = EnvelopeRef {
        format: CODEC_FORMAT_VERSION,
        version: config.version(),
        config,
    };
    Ok(Bytes::from(serde_json::to_vec(&envelope)?))
}

/// Deserialize and validate a store blob.
pub fn decode(bytes: &[u8]) -> Result<NodesConfiguration> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    if envelope.format > CODEC_FORMAT_VERSION {
        warn!(
            format = envelope.format,
            supported = CODEC_FORMAT_VERSION,
            "Decoding configuration written by a newer format; unknown fields are ignored"
        );
    }
    if envelope.version != envelope.config.version() {
        return Err(MembershipError::Corrupt(format!(
            "envelope version {} does not match embedded version {}",
            envelope.version,
            envelope.config.version()
        )));
    }
    envelope.config.validate().map_err(|e| {
        MembershipError::Corrupt(format!(
            "configuration {} violates invariants: {}",
            envelope.version, e
        ))
    })?;
    Ok(envelope.config)
}

/// Read only the version out of a blob.
pub fn extract_version(bytes: &[u8]) -> Option<ConfigVersion> {
    serde_json::from_slice::<VersionOnly>(bytes)
        .ok()
        .map(|v| v.version)
}
