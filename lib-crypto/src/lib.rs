//! MeshLink Cryptography Foundation
//!
//! Primitives shared by the mesh transport and the on-disk config store:
//!
//! - Ed25519 identity keypairs and signatures
//! - X25519 ephemeral Diffie-Hellman for session key agreement
//! - ChaCha20-Poly1305 AEAD, both counter-nonce (record layer) and
//!   random-IV (whole-file) constructions
//! - SHA-512 and the TLS-style PRF used for key expansion
//! - CSPRNG helpers

pub mod ecdh;
pub mod hash;
pub mod keypair;
pub mod prf;
pub mod random;
pub mod symmetric;

pub use ecdh::Ecdh;
pub use hash::{ct_eq, sha512};
pub use keypair::{Keypair, PublicKey, Signature, SIGNATURE_SIZE};
pub use prf::prf;
pub use random::{random_array, randomize};
pub use symmetric::{decrypt_file, encrypt_file, RecordCipher, FILE_OVERHEAD, TAG_SIZE};
