/// Trait for signing and verifying document digests.
///
/// Implementations are sync; signing is CPU-bound.
/// Async callers should go through `spawn_blocking`.
pub trait DigestSigner: Send + Sync {
    /// Sign canonical bytes. Returns raw signature bytes.
    fn sign(&self, data: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Check raw signature bytes against `data`. Malformed input is `false`.
    fn verify(&self, data: &[u8], signature: &[u8]) -> bool;

    /// Whether private key material is loaded.
    fn can_sign(&self) -> bool;

    /// SubjectPublicKeyInfo PEM of the verification key.
    fn public_key_pem(&self) -> anyhow::Result<String>;

    /// Algorithm identifier string (e.g. "rsa-pkcs1v15-sha256").
    fn algorithm(&self) -> &str;
}
