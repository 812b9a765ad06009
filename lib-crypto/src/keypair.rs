//! Ed25519 identity keypairs
//!
//! Every mesh node is identified by a long-lived Ed25519 keypair. Private
//! keys are persisted as a 96-byte blob: the 64-byte private half (seed
//! followed by the public key, ref10 layout) followed by the public key
//! again.

use anyhow::{anyhow, bail, Result};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::Zeroize;

/// Size of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of the persisted private key blob.
pub const KEYPAIR_BLOB_SIZE: usize = 96;

/// A detached Ed25519 signature.
pub type Signature = [u8; SIGNATURE_SIZE];

/// An Ed25519 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    bytes: [u8; 32],
}

impl PublicKey {
    /// Parse a public key from raw bytes, rejecting points that do not
    /// decompress to a valid curve point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow!("public key must be 32 bytes"))?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| anyhow!("invalid public key"))?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Base64 (unpadded) rendering, as used in protocol requests and
    /// invitation greetings.
    pub fn to_base64(&self) -> String {
        STANDARD_NO_PAD.encode(self.bytes)
    }

    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = STANDARD_NO_PAD
            .decode(s.trim_end_matches('='))
            .map_err(|_| anyhow!("invalid base64 public key"))?;
        Self::from_bytes(&bytes)
    }

    /// Verify a detached signature over a message.
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let Ok(sig) = ed25519_dalek::Signature::from_slice(sig) else {
            return false;
        };
        key.verify(msg, &sig).is_ok()
    }
}

/// An Ed25519 keypair with the private half present.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the system CSPRNG.
    pub fn generate() -> Self {
        let seed = crate::random::random_array::<32>();
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Reconstruct a keypair from a persisted 96-byte blob.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        if blob.len() != KEYPAIR_BLOB_SIZE {
            bail!("private key blob must be {} bytes", KEYPAIR_BLOB_SIZE);
        }

        let mut seed = [0u8; 32];
        seed.copy_from_slice(&blob[..32]);
        let signing = SigningKey::from_bytes(&seed);
        seed.zeroize();

        if signing.verifying_key().as_bytes() != &blob[32..64] {
            bail!("private key blob does not match its public key");
        }

        Ok(Self { signing })
    }

    /// Serialize to the persisted 96-byte blob format.
    pub fn to_blob(&self) -> [u8; KEYPAIR_BLOB_SIZE] {
        let mut blob = [0u8; KEYPAIR_BLOB_SIZE];
        blob[..32].copy_from_slice(&self.signing.to_bytes());
        let public = self.signing.verifying_key();
        blob[32..64].copy_from_slice(public.as_bytes());
        blob[64..96].copy_from_slice(public.as_bytes());
        blob
    }

    pub fn public(&self) -> PublicKey {
        PublicKey {
            bytes: self.signing.verifying_key().to_bytes(),
        }
    }

    /// Sign a message, returning the detached 64-byte signature.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing.sign(msg).to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &hex::encode(self.public().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let key = Keypair::generate();
        let sig = key.sign(b"hello mesh");
        assert!(key.public().verify(b"hello mesh", &sig));
        assert!(!key.public().verify(b"hello mess", &sig));
    }

    #[test]
    fn test_blob_roundtrip() {
        let key = Keypair::generate();
        let blob = key.to_blob();
        let restored = Keypair::from_blob(&blob).unwrap();
        assert_eq!(key.public(), restored.public());

        let sig = restored.sign(b"persisted");
        assert!(key.public().verify(b"persisted", &sig));
    }

    #[test]
    fn test_blob_rejects_tampered_public_half() {
        let key = Keypair::generate();
        let mut blob = key.to_blob();
        blob[40] ^= 0xff;
        assert!(Keypair::from_blob(&blob).is_err());
    }

    #[test]
    fn test_base64_roundtrip() {
        let key = Keypair::generate();
        let b64 = key.public().to_base64();
        let parsed = PublicKey::from_base64(&b64).unwrap();
        assert_eq!(key.public(), parsed);
    }

    #[test]
    fn test_wrong_key_does_not_verify() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let sig = a.sign(b"message");
        assert!(!b.public().verify(b"message", &sig));
    }
}
