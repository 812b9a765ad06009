//! X25519 ephemeral Diffie-Hellman
//!
//! One `Ecdh` is generated per handshake and consumed when the shared
//! secret is computed, so a secret can never be reused across exchanges.

use anyhow::{anyhow, Result};
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};

/// Size of an X25519 public key on the wire.
pub const ECDH_SIZE: usize = 32;

/// Size of the shared secret.
pub const ECDH_SHARED_SIZE: usize = 32;

/// An in-progress ECDH exchange: our ephemeral secret plus the public key
/// we sent to the peer.
pub struct Ecdh {
    secret: EphemeralSecret,
    public: [u8; ECDH_SIZE],
}

impl Ecdh {
    /// Generate a fresh ephemeral keypair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; ECDH_SIZE] {
        self.public
    }

    /// Consume the exchange and compute the shared secret with the peer's
    /// public key.
    pub fn compute_shared(self, peer_public: &[u8]) -> Result<[u8; ECDH_SHARED_SIZE]> {
        let peer: [u8; ECDH_SIZE] = peer_public
            .try_into()
            .map_err(|_| anyhow!("ECDH public key must be {} bytes", ECDH_SIZE))?;
        let shared = self.secret.diffie_hellman(&X25519Public::from(peer));
        Ok(shared.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_secret_agreement() {
        let a = Ecdh::generate();
        let b = Ecdh::generate();
        let a_pub = a.public_bytes();
        let b_pub = b.public_bytes();

        let s1 = a.compute_shared(&b_pub).unwrap();
        let s2 = b.compute_shared(&a_pub).unwrap();
        assert_eq!(s1, s2);
        assert_ne!(s1, [0u8; 32]);
    }

    #[test]
    fn test_rejects_short_public_key() {
        let a = Ecdh::generate();
        assert!(a.compute_shared(&[0u8; 16]).is_err());
    }
}
