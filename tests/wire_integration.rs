//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Wire format, encryption, and configuration scenarios."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::io::Write;

use anyhow::Result;
use edgewire_core::{
    modifiers_for, parse_topics, BinaryModifier, ContentType, DataProtection, EdgewireError,
    EncryptionAlgorithm, Envelope, TransportMessage, WatermillConfig, WireFormat,
    CHECKSUM_KEY, CONTENT_TYPE_KEY, CORRELATION_ID_KEY,
};
use tempfile::NamedTempFile;

#[test]
fn raw_scenario_generates_and_propagates_correlation_id() -> Result<()> {
    let inbound = TransportMessage::new("", b"OK".to_vec());
    let envelope = WireFormat::Raw.unmarshal(&inbound, &BinaryModifier::Noop)?;

    assert!(!envelope.correlation_id.is_empty());
    assert_eq!(envelope.payload, b"OK");
    assert_eq!(envelope.content_type, ContentType::Cbor);

    let outbound = WireFormat::Raw.marshal(&envelope, &BinaryModifier::Noop)?;
    assert_eq!(
        outbound.metadata_value(CORRELATION_ID_KEY),
        envelope.correlation_id
    );
    assert_eq!(outbound.payload, b"OK");
    Ok(())
}

#[test]
fn generated_correlation_ids_are_fresh_every_time() -> Result<()> {
    let bare = TransportMessage::new("", b"{}".to_vec());
    let mut seen = HashSet::new();
    for _ in 0..32 {
        let envelope = WireFormat::Raw.unmarshal(&bare, &BinaryModifier::Noop)?;
        assert!(!envelope.correlation_id.is_empty());
        assert!(seen.insert(envelope.correlation_id));
    }
    Ok(())
}

#[test]
fn raw_inference_applies_only_without_metadata() -> Result<()> {
    for (payload, expected) in [
        (&b"{"[..], ContentType::Json),
        (&b"["[..], ContentType::Json),
        (&b"x"[..], ContentType::Cbor),
        (&b""[..], ContentType::Cbor),
    ] {
        let message = TransportMessage::new("id", payload.to_vec());
        let envelope = WireFormat::Raw.unmarshal(&message, &BinaryModifier::Noop)?;
        assert_eq!(envelope.content_type, expected, "payload {payload:?}");
    }

    let mut declared = TransportMessage::new("id", b"{\"looks\":\"json\"}".to_vec());
    declared.set_metadata(CONTENT_TYPE_KEY, "application/cbor");
    declared.set_metadata(CHECKSUM_KEY, "c0ffee");
    let envelope = WireFormat::Raw.unmarshal(&declared, &BinaryModifier::Noop)?;
    assert_eq!(envelope.content_type, ContentType::Cbor);
    assert_eq!(envelope.checksum.as_deref(), Some("c0ffee"));
    Ok(())
}

#[test]
fn every_format_roundtrips_under_every_algorithm() -> Result<()> {
    let algorithms = [
        EncryptionAlgorithm::Aes128Sha256,
        EncryptionAlgorithm::Aes192Sha384,
        EncryptionAlgorithm::Aes256Sha384,
        EncryptionAlgorithm::Aes256Sha512,
    ];
    for algorithm in algorithms {
        let key: Vec<u8> = (0..algorithm.key_len() as u8).collect();
        let (encrypt, decrypt) = DataProtection::new(algorithm, key)?.modifiers();
        for format in [WireFormat::EdgeX, WireFormat::Raw] {
            let envelope = Envelope::new("cid", b"{\"v\":1}".to_vec(), ContentType::Json);
            let message = format.marshal(&envelope, &encrypt)?;
            let decoded = format.unmarshal(&message, &decrypt)?;
            assert_eq!(decoded.correlation_id, "cid");
            assert_eq!(decoded.payload, envelope.payload);
            assert_eq!(decoded.content_type, envelope.content_type);
        }
    }
    Ok(())
}

#[test]
fn tampered_ciphertext_never_yields_plaintext() -> Result<()> {
    let algorithm = EncryptionAlgorithm::Aes192Sha384;
    let protection = DataProtection::new(algorithm, vec![3u8; algorithm.key_len()])?;
    let sealed = protection.encrypt(b"meter reading")?;
    for index in [0, sealed.len() / 2, sealed.len() - 1] {
        let mut tampered = sealed.clone();
        tampered[index] ^= 0x80;
        assert!(matches!(
            protection.decrypt(&tampered),
            Err(EdgewireError::Crypto(_))
        ));
    }
    Ok(())
}

#[test]
fn configuration_file_drives_format_topics_and_encryption() -> Result<()> {
    let key = hex::encode(vec![7u8; 64]);
    let mut file = NamedTempFile::new()?;
    write!(
        file,
        r#"
[WatermillTrigger]
Type = "memory"
SubscribeTopics = " a, b ,,c"
PublishTopic = "out"
WireFormat = "RawOutput"
EncryptionAlgorithm = "AES256-SHA512"
EncryptionKey = "{key}"
"#
    )?;

    let config = WatermillConfig::from_path(file.path())?;
    assert_eq!(config.subscribe_topic_list(), vec!["a", "b", "c"]);
    assert_eq!(config.wire_format(), WireFormat::RawOutput);

    let (encrypt, decrypt) = modifiers_for(&config)?;
    assert!(!encrypt.is_noop());
    let sealed = encrypt.apply(b"OK".to_vec())?;
    assert_eq!(decrypt.apply(sealed)?, b"OK");
    Ok(())
}

#[test]
fn blank_topics_subscribe_to_catch_all() {
    assert_eq!(parse_topics(""), vec![String::new()]);
    assert_eq!(parse_topics("a, b ,,c"), vec!["a", "b", "c"]);
}
