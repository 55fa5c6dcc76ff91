//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "EdgeX native wire format embedding the envelope in the payload."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use super::{inbound_correlation_id, outbound_correlation_id};
use crate::envelope::{ContentType, Envelope, TransportMessage, CORRELATION_ID_KEY};
use crate::modifier::BinaryModifier;
use crate::{EdgewireError, Result};

pub(super) fn marshal(envelope: &Envelope, encrypt: &BinaryModifier) -> Result<TransportMessage> {
    let correlation_id = outbound_correlation_id(envelope);
    let mut outbound = envelope.clone();
    outbound.correlation_id = correlation_id.clone();

    let serialized = match &outbound.content_type {
        ContentType::Json => serde_json::to_vec(&outbound)?,
        ContentType::Cbor => serde_cbor::to_vec(&outbound)?,
        ContentType::Other(other) => {
            return Err(EdgewireError::Codec(format!(
                "content type {other} cannot be embedded in an edgex envelope"
            )))
        }
    };

    let mut message = TransportMessage::new(correlation_id.clone(), encrypt.apply(serialized)?);
    message.set_metadata(CORRELATION_ID_KEY, correlation_id);
    Ok(message)
}

pub(super) fn unmarshal(message: &TransportMessage, decrypt: &BinaryModifier) -> Result<Envelope> {
    let payload = decrypt.apply(message.payload.clone())?;

    // the envelope does not say how it was encoded, so sniff the first byte
    let mut envelope: Envelope = match ContentType::infer(&payload) {
        ContentType::Json => serde_json::from_slice(&payload)?,
        _ => serde_cbor::from_slice(&payload)?,
    };

    if envelope.correlation_id.is_empty() {
        envelope.correlation_id = inbound_correlation_id(message);
    }
    Ok(envelope)
}
