use anyhow::{Context, Result, anyhow, bail};
use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::SeedableRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use super::signer::DigestSigner;

/// RSA PKCS#1 v1.5 signer with SHA-256 digest.
///
/// Loaded once at startup from PEM key material. A signer built with
/// [`RsaSigner::verify_only`] holds no private key and refuses to sign.
pub struct RsaSigner {
    signing_key: Option<SigningKey<Sha256>>,
    verifying_key: VerifyingKey<Sha256>,
    public_key: RsaPublicKey,
}

impl RsaSigner {
    /// Builds a signer from a private/public PEM pair (PKCS#8 or PKCS#1).
    ///
    /// The public key must belong to the private key.
    pub fn from_pem(private_pem: &str, public_pem: &str) -> Result<Self> {
        let private_key = parse_private_key(private_pem)?;
        let public_key = parse_public_key(public_pem)?;
        if private_key.to_public_key() != public_key {
            bail!("public key does not match the private key");
        }
        Ok(Self::from_private_key(private_key))
    }

    /// Builds a signer that can only verify.
    pub fn verify_only(public_pem: &str) -> Result<Self> {
        let public_key = parse_public_key(public_pem)?;
        Ok(Self {
            signing_key: None,
            verifying_key: VerifyingKey::<Sha256>::new(public_key.clone()),
            public_key,
        })
    }

    /// Deterministic key generation for development and tests.
    ///
    /// The SHA-256 hash of the seed seeds a CSPRNG used for RSA key
    /// generation.
    pub fn from_seed_with_bits(seed: &str, bits: usize) -> Result<Self> {
        let hash = Sha256::digest(seed.as_bytes());
        let mut rng = ChaCha20Rng::from_seed(hash.into());
        let private_key =
            RsaPrivateKey::new(&mut rng, bits).context("generating RSA key from seed")?;
        Ok(Self::from_private_key(private_key))
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Self {
        let public_key = private_key.to_public_key();
        Self {
            signing_key: Some(SigningKey::<Sha256>::new(private_key)),
            verifying_key: VerifyingKey::<Sha256>::new(public_key.clone()),
            public_key,
        }
    }
}

fn parse_private_key(pem: &str) -> Result<RsaPrivateKey> {
    if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
        return Ok(key);
    }
    RsaPrivateKey::from_pkcs1_pem(pem)
        .map_err(|e| anyhow!("parsing RSA private key (expected PKCS#8 or PKCS#1 PEM): {e}"))
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    if let Ok(key) = RsaPublicKey::from_public_key_pem(pem) {
        return Ok(key);
    }
    RsaPublicKey::from_pkcs1_pem(pem)
        .map_err(|e| anyhow!("parsing RSA public key (expected SPKI or PKCS#1 PEM): {e}"))
}

impl DigestSigner for RsaSigner {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let signing_key = self
            .signing_key
            .as_ref()
            .ok_or_else(|| anyhow!("no private key loaded"))?;
        let signature = signing_key
            .try_sign(data)
            .map_err(|e| anyhow!("RSA signing failed: {e}"))?;
        Ok(signature.to_vec())
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        match Signature::try_from(signature) {
            Ok(signature) => self.verifying_key.verify(data, &signature).is_ok(),
            Err(_) => false,
        }
    }

    fn can_sign(&self) -> bool {
        self.signing_key.is_some()
    }

    fn public_key_pem(&self) -> Result<String> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| anyhow!("encoding RSA public key to PEM: {e}"))
    }

    fn algorithm(&self) -> &str {
        "rsa-pkcs1v15-sha256"
    }
}
