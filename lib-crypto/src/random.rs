//! CSPRNG helpers

use rand::{rngs::OsRng, RngCore};

/// Fill a buffer with cryptographically secure random bytes.
pub fn randomize(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Return a fixed-size array of cryptographically secure random bytes.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_randomize_fills_buffer() {
        let a: [u8; 32] = random_array();
        let b: [u8; 32] = random_array();
        assert_ne!(a, b);
        assert_ne!(a, [0u8; 32]);
    }
}
