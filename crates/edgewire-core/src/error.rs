//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Error taxonomy shared by transcoding, protection, and trigger code."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

/// Shared result type for edgewire operations.
pub type Result<T> = std::result::Result<T, EdgewireError>;

/// Error enumeration covering configuration, transport, codec, and crypto failures.
#[derive(Debug, thiserror::Error)]
pub enum EdgewireError {
    /// Invalid or missing configuration detected while constructing a component.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Failure reported by a backend publisher or subscriber.
    #[error("transport error: {0}")]
    Transport(String),
    /// Failure while serializing or deserializing an envelope.
    #[error("codec error: {0}")]
    Codec(String),
    /// Authentication failure, malformed ciphertext, or nonce generation failure.
    #[error("crypto error: {0}")]
    Crypto(String),
    /// The host processing callback rejected a message.
    #[error("processing error: {0}")]
    Processing(String),
    /// The backend handle was already closed.
    #[error("backend closed")]
    Closed,
    /// Several independent failures collected from one operation.
    #[error("{}", AggregateDisplay(.0))]
    Aggregate(Vec<EdgewireError>),
}

impl EdgewireError {
    /// Collapse a list of errors into a single value, or `None` when empty.
    pub fn aggregate(mut errors: Vec<EdgewireError>) -> Option<EdgewireError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(EdgewireError::Aggregate(errors)),
        }
    }
}

impl From<serde_json::Error> for EdgewireError {
    fn from(err: serde_json::Error) -> Self {
        EdgewireError::Codec(format!("json: {err}"))
    }
}

impl From<serde_cbor::Error> for EdgewireError {
    fn from(err: serde_cbor::Error) -> Self {
        EdgewireError::Codec(format!("cbor: {err}"))
    }
}

impl From<hex::FromHexError> for EdgewireError {
    fn from(err: hex::FromHexError) -> Self {
        EdgewireError::Configuration(format!("encryption key is not valid hex: {err}"))
    }
}

struct AggregateDisplay<'a>(&'a [EdgewireError]);

impl fmt::Display for AggregateDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.0.len())?;
        for err in self.0 {
            write!(f, "\n\t* {err}")?;
        }
        Ok(())
    }
}
