//! ChaCha20-Poly1305 AEAD
//!
//! Two constructions on the same cipher:
//!
//! - [`RecordCipher`]: counter-nonce AEAD for the SPTPS record layer. The
//!   nonce is the 32-bit little-endian sequence number in the leading bytes
//!   of an otherwise-zero 96-bit nonce; the counter is never transmitted in
//!   stream mode and is the wire sequence number in datagram mode.
//! - [`encrypt_file`]/[`decrypt_file`]: random 96-bit IV prepended to the
//!   ciphertext, for at-rest encryption of config files.

use anyhow::{anyhow, bail, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;

/// Bytes added by `encrypt_file`: the random IV plus the tag.
pub const FILE_OVERHEAD: usize = 12 + TAG_SIZE;

fn counter_nonce(seqno: u32) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(&seqno.to_le_bytes());
    *Nonce::from_slice(&nonce)
}

/// One direction of an SPTPS session.
pub struct RecordCipher {
    cipher: ChaCha20Poly1305,
}

impl RecordCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypt a record under the given sequence number. Returns
    /// `ciphertext || tag`.
    pub fn encrypt(&self, seqno: u32, plaintext: &[u8]) -> Vec<u8> {
        let payload = Payload {
            msg: plaintext,
            aad: &[],
        };
        self.cipher
            .encrypt(&counter_nonce(seqno), payload)
            .expect("ChaCha20-Poly1305 encryption is infallible for in-memory buffers")
    }

    /// Decrypt and authenticate `ciphertext || tag` under the given
    /// sequence number.
    pub fn decrypt(&self, seqno: u32, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < TAG_SIZE {
            bail!("ciphertext shorter than authentication tag");
        }

        let payload = Payload { msg: data, aad: &[] };
        self.cipher
            .decrypt(&counter_nonce(seqno), payload)
            .map_err(|_| anyhow!("record failed authentication"))
    }

    /// Authenticate without returning the plaintext.
    pub fn verify(&self, seqno: u32, data: &[u8]) -> bool {
        self.decrypt(seqno, data).is_ok()
    }
}

/// Encrypt a whole file: `random IV (12) || ciphertext || tag (16)`.
pub fn encrypt_file(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let iv = crate::random::random_array::<12>();
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let ct = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .expect("ChaCha20-Poly1305 encryption is infallible for in-memory buffers");

    let mut out = Vec::with_capacity(12 + ct.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ct);
    out
}

/// Decrypt a file produced by [`encrypt_file`].
pub fn decrypt_file(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < FILE_OVERHEAD {
        bail!("encrypted file too short");
    }

    let (iv, ct) = data.split_at(12);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(iv), ct)
        .map_err(|_| anyhow!("file failed authentication"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::random_array;

    #[test]
    fn test_record_roundtrip() {
        let key = random_array::<32>();
        let tx = RecordCipher::new(&key);
        let rx = RecordCipher::new(&key);

        let ct = tx.encrypt(7, b"\x00payload");
        assert_eq!(ct.len(), 8 + TAG_SIZE);
        assert_eq!(rx.decrypt(7, &ct).unwrap(), b"\x00payload");
    }

    #[test]
    fn test_record_wrong_seqno_fails() {
        let key = random_array::<32>();
        let cipher = RecordCipher::new(&key);
        let ct = cipher.encrypt(1, b"data");
        assert!(cipher.decrypt(2, &ct).is_err());
    }

    #[test]
    fn test_record_tamper_fails() {
        let key = random_array::<32>();
        let cipher = RecordCipher::new(&key);
        let mut ct = cipher.encrypt(1, b"data");
        ct[0] ^= 1;
        assert!(cipher.decrypt(1, &ct).is_err());
        assert!(!cipher.verify(1, &ct));
    }

    #[test]
    fn test_file_roundtrip() {
        let key = random_array::<32>();
        let enc = encrypt_file(&key, b"config contents");
        assert_eq!(enc.len(), 15 + FILE_OVERHEAD);
        assert_eq!(decrypt_file(&key, &enc).unwrap(), b"config contents");
    }

    #[test]
    fn test_file_wrong_key_fails() {
        let key = random_array::<32>();
        let other = random_array::<32>();
        let enc = encrypt_file(&key, b"config contents");
        assert!(decrypt_file(&other, &enc).is_err());
    }

    #[test]
    fn test_file_ivs_differ() {
        let key = random_array::<32>();
        let a = encrypt_file(&key, b"same");
        let b = encrypt_file(&key, b"same");
        assert_ne!(a, b);
    }
}
