//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Raw wire format carrying envelope fields as metadata."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use super::{inbound_correlation_id, outbound_correlation_id};
use crate::envelope::{
    ContentType, Envelope, TransportMessage, CHECKSUM_KEY, CONTENT_TYPE_KEY, CORRELATION_ID_KEY,
};
use crate::modifier::BinaryModifier;
use crate::Result;

pub(super) fn marshal(envelope: &Envelope, encrypt: &BinaryModifier) -> Result<TransportMessage> {
    let correlation_id = outbound_correlation_id(envelope);
    let payload = encrypt.apply(envelope.payload.clone())?;

    let mut message = TransportMessage::new(correlation_id.clone(), payload);
    message.set_metadata(CONTENT_TYPE_KEY, envelope.content_type.as_str());
    if let Some(checksum) = &envelope.checksum {
        message.set_metadata(CHECKSUM_KEY, checksum.as_str());
    }
    message.set_metadata(CORRELATION_ID_KEY, correlation_id);
    Ok(message)
}

pub(super) fn unmarshal(message: &TransportMessage, decrypt: &BinaryModifier) -> Result<Envelope> {
    let payload = decrypt.apply(message.payload.clone())?;

    let content_type = match message.metadata_value(CONTENT_TYPE_KEY) {
        "" => ContentType::infer(&payload),
        declared => ContentType::from(declared),
    };
    let checksum = match message.metadata_value(CHECKSUM_KEY) {
        "" => None,
        value => Some(value.to_owned()),
    };

    Ok(Envelope {
        received_topic: String::new(),
        correlation_id: inbound_correlation_id(message),
        payload,
        content_type,
        checksum,
    })
}
