//! ---
//! ems_section: "06-security-access-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Byte transforms applied to serialized payloads."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use crate::protection::DataProtection;
use crate::Result;

type ModifierFn = dyn Fn(Vec<u8>) -> Result<Vec<u8>> + Send + Sync;

/// Named pure transform `bytes -> bytes` applied after serialization or before
/// deserialization.
#[derive(Clone, Default)]
pub enum BinaryModifier {
    /// Returns its input unchanged and never fails.
    #[default]
    Noop,
    /// Seals the input with the shared key.
    Encrypt(Arc<DataProtection>),
    /// Opens the input with the shared key.
    Decrypt(Arc<DataProtection>),
    /// Arbitrary transform, mostly useful for tests and custom pipelines.
    Custom(Arc<ModifierFn>),
}

impl BinaryModifier {
    /// Wrap a closure as a modifier.
    pub fn custom<F>(transform: F) -> Self
    where
        F: Fn(Vec<u8>) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        BinaryModifier::Custom(Arc::new(transform))
    }

    /// Apply the transform.
    pub fn apply(&self, bytes: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            BinaryModifier::Noop => Ok(bytes),
            BinaryModifier::Encrypt(protection) => protection.encrypt(&bytes),
            BinaryModifier::Decrypt(protection) => protection.decrypt(&bytes),
            BinaryModifier::Custom(transform) => transform(bytes),
        }
    }

    /// Whether this modifier is the identity.
    pub fn is_noop(&self) -> bool {
        matches!(self, BinaryModifier::Noop)
    }
}

impl fmt::Debug for BinaryModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryModifier::Noop => f.write_str("Noop"),
            BinaryModifier::Encrypt(p) => f.debug_tuple("Encrypt").field(&p.algorithm()).finish(),
            BinaryModifier::Decrypt(p) => f.debug_tuple("Decrypt").field(&p.algorithm()).finish(),
            BinaryModifier::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EdgewireError;

    #[test]
    fn noop_is_identity() {
        let modifier = BinaryModifier::default();
        assert!(modifier.is_noop());
        assert_eq!(modifier.apply(b"OK".to_vec()).unwrap(), b"OK");
        assert_eq!(modifier.apply(Vec::new()).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn custom_modifier_can_fail() {
        let modifier = BinaryModifier::custom(|_| Err(EdgewireError::Crypto("boom".into())));
        assert!(!modifier.is_noop());
        assert!(modifier.apply(b"OK".to_vec()).is_err());
    }
}
