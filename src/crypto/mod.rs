//! # Cryptographic Primitives
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       CRYPTO MODULE                                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  random      OsRng bytes, hex ids, secure wipe, constant-time eq       │
//! │  encryption  AES-256-GCM, Nonce, EncryptionKey, CipherHandle           │
//! │  kdf         PBKDF2-HMAC-SHA256, HKDF-SHA256, context labels           │
//! │  provider    CryptoProvider capability + RustCrypto default            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All primitives are pure Rust (RustCrypto). Key types zeroize on drop.

pub mod encryption;
pub mod kdf;
pub mod provider;
pub mod random;

pub use encryption::{decrypt, encrypt, CipherHandle, EncryptionKey, Nonce, KEY_SIZE, NONCE_SIZE};
pub use provider::{CryptoProvider, RustCryptoProvider};
pub use random::{constant_time_eq, generate_secure_id, random_bytes, random_hex, secure_wipe};
