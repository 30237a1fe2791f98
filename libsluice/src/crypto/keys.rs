use crate::identity::{address_of, PublicIdentifier};
use alloy_primitives::{Address, B256};
use rand::{CryptoRng, RngCore};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid secret key material: {0}")]
    InvalidSecret(String),
    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),
    #[error("signature does not recover to {expected}")]
    WrongSigner { expected: Address },
}

/// A 65-byte recoverable ECDSA signature over a keccak digest, `r || s || v` with `v ∈ {0, 1}`.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(
    #[serde(serialize_with = "crate::helpers::array65_to_hex", deserialize_with = "crate::helpers::array65_from_hex")]
    [u8; 65],
);

impl Signature {
    pub fn from_bytes(bytes: [u8; 65]) -> Self {
        Signature(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    /// Recover the signing address for `digest`.
    pub fn recover(&self, digest: B256) -> Result<Address, KeyError> {
        let recovery_id = RecoveryId::from_i32(i32::from(self.0[64]))
            .map_err(|e| KeyError::InvalidSignature(e.to_string()))?;
        let signature = RecoverableSignature::from_compact(&self.0[..64], recovery_id)
            .map_err(|e| KeyError::InvalidSignature(e.to_string()))?;
        let message = Message::from_digest(digest.0);
        let key = Secp256k1::verification_only()
            .recover_ecdsa(&message, &signature)
            .map_err(|e| KeyError::InvalidSignature(e.to_string()))?;
        Ok(address_of(&key))
    }

    /// Recover and compare against a known signer.
    pub fn verify(&self, digest: B256, expected: Address) -> Result<(), KeyError> {
        let recovered = self.recover(digest)?;
        if recovered == expected {
            Ok(())
        } else {
            Err(KeyError::WrongSigner { expected })
        }
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}..{})", hex::encode(&self.0[..4]), hex::encode(&self.0[63..]))
    }
}

/// The local participant's signing identity: a secp256k1 secret key plus the derived public
/// identifier and account address.
#[derive(Clone)]
pub struct ChannelSigner {
    secret: SecretKey,
    identifier: PublicIdentifier,
}

impl ChannelSigner {
    pub fn new(secret: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public = PublicKey::from_secret_key(&secp, &secret);
        ChannelSigner { secret, identifier: PublicIdentifier::from_public_key(&public) }
    }

    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        ChannelSigner::new(SecretKey::new(rng))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|e| KeyError::InvalidSecret(e.to_string()))?;
        let secret = SecretKey::from_slice(&bytes).map_err(|e| KeyError::InvalidSecret(e.to_string()))?;
        Ok(ChannelSigner::new(secret))
    }

    pub fn identifier(&self) -> &PublicIdentifier {
        &self.identifier
    }

    pub fn address(&self) -> Address {
        self.identifier.address()
    }

    /// Sign a keccak digest, returning the 65-byte recoverable form.
    pub fn sign(&self, digest: B256) -> Signature {
        let secp = Secp256k1::signing_only();
        let message = Message::from_digest(digest.0);
        let signature = secp.sign_ecdsa_recoverable(&message, &self.secret);
        let (recovery_id, compact) = signature.serialize_compact();
        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&compact);
        bytes[64] = recovery_id.to_i32() as u8;
        Signature::from_bytes(bytes)
    }
}

impl Display for ChannelSigner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.identifier.abbreviated())
    }
}

impl Debug for ChannelSigner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelSigner({})", self.identifier.abbreviated())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloy_primitives::keccak256;

    fn signer(fill: u8) -> ChannelSigner {
        ChannelSigner::from_hex(&hex::encode([fill; 32])).unwrap()
    }

    #[test]
    fn sign_and_recover() {
        let signer = signer(11);
        let digest = keccak256(b"sluice commitment");
        let signature = signer.sign(digest);
        assert_eq!(signature.recover(digest).unwrap(), signer.address());
        signature.verify(digest, signer.address()).unwrap();
    }

    #[test]
    fn wrong_signer_is_detected() {
        let alice = signer(1);
        let bob = signer(2);
        let digest = keccak256(b"payload");
        let signature = alice.sign(digest);
        let err = signature.verify(digest, bob.address()).unwrap_err();
        assert_eq!(err, KeyError::WrongSigner { expected: bob.address() });
    }

    #[test]
    fn tampered_digest_recovers_different_address() {
        let signer = signer(3);
        let signature = signer.sign(keccak256(b"one"));
        let recovered = signature.recover(keccak256(b"two")).unwrap();
        assert_ne!(recovered, signer.address());
    }

    #[test]
    fn signature_serde_round_trip() {
        let signer = signer(4);
        let signature = signer.sign(keccak256(b"ser"));
        let json = serde_json::to_string(&signature).unwrap();
        let back: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signature);
    }

    #[test]
    fn bad_secret_material() {
        assert!(matches!(ChannelSigner::from_hex("not-hex").unwrap_err(), KeyError::InvalidSecret(_)));
        assert!(matches!(
            ChannelSigner::from_hex(&hex::encode([0u8; 32])).unwrap_err(),
            KeyError::InvalidSecret(_)
        ));
    }
}
