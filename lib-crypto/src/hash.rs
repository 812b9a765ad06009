//! SHA-512 and digest comparison

use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

/// Compute the SHA-512 digest of a byte slice.
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Constant-time equality for digests, cookies and key fingerprints.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha512_empty() {
        // SHA-512 of the empty string, first bytes.
        let digest = sha512(b"");
        assert_eq!(&digest[..4], &[0xcf, 0x83, 0xe1, 0x35]);
    }

    #[test]
    fn test_sha512_abc() {
        let digest = sha512(b"abc");
        assert_eq!(&digest[..4], &[0xdd, 0xaf, 0x35, 0xa1]);
    }
}
