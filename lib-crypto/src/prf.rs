//! Pseudo-random function for key material generation
//!
//! The TLS 1.1 PRF construction (RFC 4346 section 5) instantiated with a
//! single HMAC-SHA512 instead of the MD5/SHA1 pair. Used for SPTPS key
//! expansion and for deriving the config storage key.

use hmac::{Hmac, Mac};
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

const MDLEN: usize = 64;

fn hmac_sha512(key: &[u8], msg: &[u8]) -> [u8; MDLEN] {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha512::new_from_slice(key).expect("HMAC key of any size");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Fill `out` with key material derived from a master secret and a seed.
///
/// `A(0) = seed; A(i) = HMAC(secret, A(i-1) || seed);
///  out = HMAC(secret, A(1) || seed) || HMAC(secret, A(2) || seed) || ...`
pub fn prf(secret: &[u8], seed: &[u8], out: &mut [u8]) {
    let mut data = vec![0u8; MDLEN + seed.len()];
    data[MDLEN..].copy_from_slice(seed);

    let mut filled = 0;

    while filled < out.len() {
        // Inner HMAC: advance the chaining value.
        let a = hmac_sha512(secret, &data);
        data[..MDLEN].copy_from_slice(&a);

        // Outer HMAC: produce the next block of output.
        let block = hmac_sha512(secret, &data);
        let take = (out.len() - filled).min(MDLEN);
        out[filled..filled + take].copy_from_slice(&block[..take]);
        filled += take;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prf_deterministic() {
        let mut a = [0u8; 96];
        let mut b = [0u8; 96];
        prf(b"secret", b"seed", &mut a);
        prf(b"secret", b"seed", &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_prf_sensitive_to_inputs() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        let mut c = [0u8; 64];
        prf(b"secret", b"seed", &mut a);
        prf(b"secret2", b"seed", &mut b);
        prf(b"secret", b"seed2", &mut c);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_prf_prefix_consistent() {
        // A longer output must extend a shorter one, not change it.
        let mut short = [0u8; 32];
        let mut long = [0u8; 160];
        prf(b"master", b"key expansion", &mut short);
        prf(b"master", b"key expansion", &mut long);
        assert_eq!(short, long[..32]);
    }
}
