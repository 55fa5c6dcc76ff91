//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Wire format strategies converting envelopes to transport messages."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Wire formats.
//!
//! `EdgeX` embeds the whole envelope in the payload (JSON or CBOR), `Raw` sends the
//! application bytes verbatim and moves envelope fields into metadata. `RawInput`
//! and `RawOutput` bridge the two: each direction delegates to one of the base
//! formats.

mod edgex;
mod raw;

use std::fmt;
use std::str::FromStr;

use crate::envelope::{new_id, Envelope, TransportMessage, CORRELATION_ID_KEY};
use crate::modifier::BinaryModifier;
use crate::{EdgewireError, Result};

/// Named, stateless marshal/unmarshal strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum WireFormat {
    /// Envelope serialized into the payload.
    #[default]
    EdgeX,
    /// Payload verbatim, envelope fields in metadata.
    Raw,
    /// Raw inbound, EdgeX outbound.
    RawInput,
    /// EdgeX inbound, Raw outbound.
    RawOutput,
}

impl WireFormat {
    /// Configuration name of the format.
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::EdgeX => "edgex",
            WireFormat::Raw => "raw",
            WireFormat::RawInput => "rawinput",
            WireFormat::RawOutput => "rawoutput",
        }
    }

    /// Resolve a configured name, falling back to `EdgeX` for blank or unknown names.
    pub fn from_config_name(name: &str) -> Self {
        match name.parse() {
            Ok(format) => format,
            Err(_) => {
                tracing::warn!(wire_format = %name, "unknown wire format, using edgex");
                WireFormat::EdgeX
            }
        }
    }

    /// Format used for messages leaving this process.
    fn outbound(self) -> WireFormat {
        match self {
            WireFormat::EdgeX | WireFormat::RawInput => WireFormat::EdgeX,
            WireFormat::Raw | WireFormat::RawOutput => WireFormat::Raw,
        }
    }

    /// Format used for messages arriving at this process.
    fn inbound(self) -> WireFormat {
        match self {
            WireFormat::EdgeX | WireFormat::RawOutput => WireFormat::EdgeX,
            WireFormat::Raw | WireFormat::RawInput => WireFormat::Raw,
        }
    }

    /// Convert an envelope into a transport message, encrypting the serialized bytes.
    pub fn marshal(&self, envelope: &Envelope, encrypt: &BinaryModifier) -> Result<TransportMessage> {
        match self.outbound() {
            WireFormat::Raw => raw::marshal(envelope, encrypt),
            _ => edgex::marshal(envelope, encrypt),
        }
    }

    /// Convert a transport message into an envelope, decrypting before decoding.
    pub fn unmarshal(&self, message: &TransportMessage, decrypt: &BinaryModifier) -> Result<Envelope> {
        match self.inbound() {
            WireFormat::Raw => raw::unmarshal(message, decrypt),
            _ => edgex::unmarshal(message, decrypt),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireFormat {
    type Err = EdgewireError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "edgex" => Ok(WireFormat::EdgeX),
            "raw" => Ok(WireFormat::Raw),
            "rawinput" => Ok(WireFormat::RawInput),
            "rawoutput" => Ok(WireFormat::RawOutput),
            other => Err(EdgewireError::Configuration(format!(
                "unknown wire format: {other}"
            ))),
        }
    }
}

/// Envelope correlation id if present, otherwise a generated one.
fn outbound_correlation_id(envelope: &Envelope) -> String {
    if envelope.correlation_id.is_empty() {
        new_id()
    } else {
        envelope.correlation_id.clone()
    }
}

/// Correlation id of an inbound message: metadata, then message id, then generated.
fn inbound_correlation_id(message: &TransportMessage) -> String {
    [message.metadata_value(CORRELATION_ID_KEY), message.uuid.as_str()]
        .into_iter()
        .find(|candidate| !candidate.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(new_id)
}
