//! Content-addressable item identifiers.

use sha1::{Digest, Sha1};

use crate::error::IdentityError;

/// Delimiter placed between the fields before hashing.
pub const FIELD_SEPARATOR: &str = ":";

/// Generate a deterministic identifier from an ordered list of fields.
///
/// The fields are joined with [`FIELD_SEPARATOR`] and hashed with SHA-1; the
/// digest is rendered as 40 lowercase hex characters. No normalisation is
/// applied, so case, whitespace and field order all change the result.
pub fn uuid(fields: &[&str]) -> Result<String, IdentityError> {
    if fields.is_empty() {
        return Err(IdentityError::NoFields);
    }
    if let Some(position) = fields.iter().position(|field| field.is_empty()) {
        return Err(IdentityError::EmptyField { position });
    }

    let mut hasher = Sha1::new();
    hasher.update(fields.join(FIELD_SEPARATOR).as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_identifiers() {
        assert_eq!(
            uuid(&["1", "2", "3", "4"]).unwrap(),
            "e7b71c81f5a0723e2237f157dba81777ce7c6c21"
        );
        assert_eq!(
            uuid(&["http://example.com/", "1234567"]).unwrap(),
            "47509b2f0d4ffc513ca9230838a69aa841d7f055"
        );
    }

    #[test]
    fn deterministic_and_order_sensitive() {
        let first = uuid(&["origin", "42"]).unwrap();
        assert_eq!(first, uuid(&["origin", "42"]).unwrap());
        assert_ne!(first, uuid(&["42", "origin"]).unwrap());
        assert_ne!(first, uuid(&["Origin", "42"]).unwrap());
        assert_ne!(first, uuid(&["origin ", "42"]).unwrap());
    }

    #[test]
    fn empty_field_rejected_at_any_position() {
        assert_eq!(
            uuid(&["1", "", "2", "3"]),
            Err(IdentityError::EmptyField { position: 1 })
        );
        assert_eq!(
            uuid(&["", "1", "2", "3"]),
            Err(IdentityError::EmptyField { position: 0 })
        );
        assert_eq!(
            uuid(&["1", "2", "3", ""]),
            Err(IdentityError::EmptyField { position: 3 })
        );
    }

    #[test]
    fn no_fields_rejected() {
        assert_eq!(uuid(&[]), Err(IdentityError::NoFields));
    }
}
