//! Hashing, signing and tamper detection over document bytes.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SealError;
use crate::signing::DigestSigner;

/// A digest and the signature produced over it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDigest {
    /// Lowercase hex SHA-256.
    pub hash: String,
    /// Standard base64 signature over the hex string.
    pub signature: String,
}

/// Outcome of comparing current bytes against a recorded hash and signature.
///
/// `hash_match` and `signature_valid` are computed independently, so a
/// caller can tell a modified artifact apart from a malformed signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub is_valid: bool,
    pub current_hash: String,
    pub hash_match: bool,
    pub signature_valid: bool,
}

/// Holds the signer loaded at startup. Immutable afterwards.
#[derive(Clone)]
pub struct IntegrityEngine {
    signer: Arc<dyn DigestSigner>,
}

impl IntegrityEngine {
    pub fn new(signer: Arc<dyn DigestSigner>) -> Self {
        Self { signer }
    }

    pub fn hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn sign(&self, hash_hex: &str) -> Result<String, SealError> {
        if !self.signer.can_sign() {
            return Err(SealError::KeyUnavailable);
        }
        let signature = self
            .signer
            .sign(hash_hex.as_bytes())
            .map_err(|e| eyre::eyre!("signing digest: {e:#}"))?;
        Ok(STANDARD.encode(signature))
    }

    pub fn verify(&self, hash_hex: &str, signature_b64: &str) -> bool {
        match STANDARD.decode(signature_b64.trim()) {
            Ok(signature) => self.signer.verify(hash_hex.as_bytes(), &signature),
            Err(_) => false,
        }
    }

    pub fn hash_and_sign(&self, bytes: &[u8]) -> Result<SignedDigest, SealError> {
        let hash = Self::hash(bytes);
        let signature = self.sign(&hash)?;
        Ok(SignedDigest { hash, signature })
    }

    pub fn verify_integrity(
        &self,
        current_bytes: &[u8],
        original_hash: &str,
        signature_b64: &str,
    ) -> IntegrityReport {
        let current_hash = Self::hash(current_bytes);
        let hash_match = current_hash.eq_ignore_ascii_case(original_hash.trim());
        let signature_valid = self.verify(original_hash.trim(), signature_b64);
        IntegrityReport {
            is_valid: hash_match && signature_valid,
            current_hash,
            hash_match,
            signature_valid,
        }
    }

    pub fn algorithm(&self) -> &str {
        self.signer.algorithm()
    }

    pub fn public_key_pem(&self) -> Result<String, SealError> {
        self.signer
            .public_key_pem()
            .map_err(|e| SealError::Unexpected(eyre::eyre!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::RsaSigner;
    use std::sync::LazyLock;

    static SIGNER: LazyLock<Arc<RsaSigner>> =
        LazyLock::new(|| Arc::new(RsaSigner::from_seed_with_bits("integrity-tests", 1024).unwrap()));

    fn engine() -> IntegrityEngine {
        IntegrityEngine::new(SIGNER.clone())
    }

    fn verify_only_engine() -> IntegrityEngine {
        let public_pem = SIGNER.public_key_pem().unwrap();
        IntegrityEngine::new(Arc::new(RsaSigner::verify_only(&public_pem).unwrap()))
    }

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(
            IntegrityEngine::hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn signed_hash_verifies() {
        let engine = engine();
        for bytes in [&b""[..], b"x", b"%PDF-1.7 some document body"] {
            let hash = IntegrityEngine::hash(bytes);
            let signature = engine.sign(&hash).unwrap();
            assert!(engine.verify(&hash, &signature));
        }
    }

    #[test]
    fn verify_rejects_malformed_base64() {
        let engine = engine();
        let hash = IntegrityEngine::hash(b"doc");
        assert!(!engine.verify(&hash, "not base64 at all!"));
        assert!(!engine.verify(&hash, ""));
        assert!(!engine.verify(&hash, "AAAA"));
    }

    #[test]
    fn verify_rejects_signature_over_other_hash() {
        let engine = engine();
        let signature = engine.sign(&IntegrityEngine::hash(b"one")).unwrap();
        assert!(!engine.verify(&IntegrityEngine::hash(b"two"), &signature));
    }

    #[test]
    fn any_single_byte_change_breaks_hash_match() {
        let engine = engine();
        let original = b"%PDF-1.4 stamped body".to_vec();
        let signed = engine.hash_and_sign(&original).unwrap();

        for position in 0..original.len() {
            let mut tampered = original.clone();
            tampered[position] ^= 0x01;
            let report = engine.verify_integrity(&tampered, &signed.hash, &signed.signature);
            assert!(!report.hash_match, "mutation at {position} went unnoticed");
            assert!(report.signature_valid);
            assert!(!report.is_valid);
        }
    }

    #[test]
    fn untouched_bytes_are_valid() {
        let engine = engine();
        let bytes = b"contract".to_vec();
        let signed = engine.hash_and_sign(&bytes).unwrap();
        let report = engine.verify_integrity(&bytes, &signed.hash, &signed.signature);
        assert!(report.is_valid);
        assert_eq!(report.current_hash, signed.hash);
    }

    #[test]
    fn bad_signature_with_matching_hash_is_reported_separately() {
        let engine = engine();
        let bytes = b"contract".to_vec();
        let hash = IntegrityEngine::hash(&bytes);
        let report = engine.verify_integrity(&bytes, &hash, "Zm9v");
        assert!(report.hash_match);
        assert!(!report.signature_valid);
        assert!(!report.is_valid);
    }

    #[test]
    fn verify_only_engine_cannot_sign() {
        let engine = verify_only_engine();
        assert!(matches!(
            engine.sign(&IntegrityEngine::hash(b"x")),
            Err(SealError::KeyUnavailable)
        ));

        let signed = self::engine().hash_and_sign(b"x").unwrap();
        assert!(engine.verify(&signed.hash, &signed.signature));
    }
}
