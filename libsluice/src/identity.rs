use alloy_primitives::{keccak256, Address};
use secp256k1::PublicKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Prefix carried by every textual public identifier.
pub const IDENTIFIER_PREFIX: &str = "sluice1";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("identifier does not start with '{IDENTIFIER_PREFIX}'")]
    MissingPrefix,
    #[error("identifier payload is not valid hex: {0}")]
    InvalidHex(String),
    #[error("identifier payload is not a valid compressed secp256k1 public key: {0}")]
    InvalidKey(String),
}

/// A participant's long-term identity: the compressed secp256k1 public key in textual form,
/// `sluice1` followed by 33 hex-encoded bytes.
///
/// The on-chain account address is derived the usual way, as the last 20 bytes of the keccak hash
/// of the uncompressed public key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicIdentifier {
    encoded: String,
    address: Address,
}

impl PublicIdentifier {
    pub fn from_public_key(key: &PublicKey) -> Self {
        let encoded = format!("{IDENTIFIER_PREFIX}{}", hex::encode(key.serialize()));
        PublicIdentifier { encoded, address: address_of(key) }
    }

    /// The keccak-derived 20-byte account address for this identifier.
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn public_key(&self) -> PublicKey {
        // The payload was validated on construction.
        let payload = &self.encoded[IDENTIFIER_PREFIX.len()..];
        let bytes = hex::decode(payload).expect("identifier payload is valid hex");
        PublicKey::from_slice(&bytes).expect("identifier payload is a valid public key")
    }

    /// An abbreviated form for log lines, e.g. `sluice102c0ff..ee`.
    pub fn abbreviated(&self) -> String {
        let payload = &self.encoded[IDENTIFIER_PREFIX.len()..];
        format!("{IDENTIFIER_PREFIX}{}..{}", &payload[..6], &payload[payload.len() - 2..])
    }
}

impl FromStr for PublicIdentifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let payload = s.strip_prefix(IDENTIFIER_PREFIX).ok_or(IdentifierError::MissingPrefix)?;
        let bytes = hex::decode(payload).map_err(|e| IdentifierError::InvalidHex(e.to_string()))?;
        let key = PublicKey::from_slice(&bytes).map_err(|e| IdentifierError::InvalidKey(e.to_string()))?;
        Ok(PublicIdentifier::from_public_key(&key))
    }
}

impl Display for PublicIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encoded)
    }
}

impl Debug for PublicIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicIdentifier({})", self.abbreviated())
    }
}

impl Serialize for PublicIdentifier {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.encoded.serialize(s)
    }
}

impl<'de> Deserialize<'de> for PublicIdentifier {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(de)?;
        encoded.parse().map_err(serde::de::Error::custom)
    }
}

/// Last 20 bytes of the keccak hash of the uncompressed public key.
pub fn address_of(key: &PublicKey) -> Address {
    let uncompressed = key.serialize_uncompressed();
    let digest = keccak256(&uncompressed[1..]);
    Address::from_slice(&digest[12..])
}

#[cfg(test)]
mod test {
    use super::*;
    use secp256k1::{Secp256k1, SecretKey};

    fn test_key(fill: u8) -> PublicKey {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[fill; 32]).unwrap();
        PublicKey::from_secret_key(&secp, &secret)
    }

    #[test]
    fn round_trip() {
        let key = test_key(7);
        let id = PublicIdentifier::from_public_key(&key);
        assert!(id.as_str().starts_with(IDENTIFIER_PREFIX));
        let parsed: PublicIdentifier = id.as_str().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.address(), id.address());
        assert_eq!(parsed.public_key(), key);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!("vector1abcd".parse::<PublicIdentifier>().unwrap_err(), IdentifierError::MissingPrefix);
        assert!(matches!(
            "sluice1zzzz".parse::<PublicIdentifier>().unwrap_err(),
            IdentifierError::InvalidHex(_)
        ));
        // valid hex, not a curve point
        assert!(matches!(
            format!("{IDENTIFIER_PREFIX}{}", hex::encode([0u8; 33])).parse::<PublicIdentifier>().unwrap_err(),
            IdentifierError::InvalidKey(_)
        ));
    }

    #[test]
    fn distinct_keys_distinct_addresses() {
        let a = PublicIdentifier::from_public_key(&test_key(1));
        let b = PublicIdentifier::from_public_key(&test_key(2));
        assert_ne!(a, b);
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn serde_as_string() {
        let id = PublicIdentifier::from_public_key(&test_key(3));
        let json = serde_json::to_string(&id).unwrap();
        let back: PublicIdentifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
