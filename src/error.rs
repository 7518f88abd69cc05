//! # Error Handling
//!
//! Error types for the Snakkaz encryption engine.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Lifecycle Errors                                                  │
//! │  │   ├── NotInitialized        - Component has no key material yet     │
//! │  │   ├── Disposed              - Component was torn down               │
//! │  │   └── SchedulerUnavailable  - No runtime to drive timers            │
//! │  │                                                                      │
//! │  ├── Key Errors                                                        │
//! │  │   ├── KeyDerivationFailed   - PBKDF2/HKDF rejected its input        │
//! │  │   ├── InvalidKey            - Wrong key length or format            │
//! │  │   └── RngFailed             - OS random source failed               │
//! │  │                                                                      │
//! │  ├── Crypto Errors                                                     │
//! │  │   ├── EncryptionFailed      - AEAD encryption failed                │
//! │  │   └── AuthenticationFailed  - Tag mismatch / wrong key / tampering  │
//! │  │                                                                      │
//! │  ├── Ratchet Errors                                                    │
//! │  │   ├── CounterOutOfRange     - Requested counter outside window      │
//! │  │   └── MissingKeyMaterial    - Regenerated key does not match        │
//! │  │                                                                      │
//! │  ├── Burn Errors                                                       │
//! │  │   └── DestructionTokenMismatch - Wrong or stale burn token          │
//! │  │                                                                      │
//! │  └── Encoding Errors                                                   │
//! │      ├── InvalidEnvelope       - Malformed record or backup            │
//! │      └── SerializationError    - JSON encode/decode failure            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `AuthenticationFailed` never says *which* part of a message was wrong
//! (IV, ciphertext, tag or context). Callers get one opaque failure.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the encryption engine
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Lifecycle Errors (100-199)
    // ========================================================================

    /// Component has not been initialized with key material
    #[error("Encryption engine has not been initialized. Call initialize() first.")]
    NotInitialized,

    /// Component has been disposed and can no longer be used
    #[error("Component has been disposed.")]
    Disposed,

    /// No async runtime is available to drive timers
    #[error("No scheduler available: {0}")]
    SchedulerUnavailable(String),

    // ========================================================================
    // Key Errors (200-299)
    // ========================================================================

    /// Key derivation failed
    #[error("Failed to derive keys: {0}")]
    KeyDerivationFailed(String),

    /// Invalid key format or length
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Random number generation failed
    #[error("Random number generation failed")]
    RngFailed,

    // ========================================================================
    // Crypto Errors (300-399)
    // ========================================================================

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Authentication of ciphertext failed
    #[error("Decryption failed: message could not be authenticated")]
    AuthenticationFailed,

    // ========================================================================
    // Ratchet Errors (400-499)
    // ========================================================================

    /// Requested message counter is too far from the current counter
    #[error("Message counter {requested} is out of range (current {current}, limit {limit})")]
    CounterOutOfRange {
        /// Counter carried by the envelope
        requested: u64,
        /// Local ratchet counter
        current: u64,
        /// Maximum replay distance
        limit: u64,
    },

    /// The regenerated message key does not match the envelope
    #[error("No key material for message counter {0}")]
    MissingKeyMaterial(u64),

    // ========================================================================
    // Burn Errors (500-599)
    // ========================================================================

    /// Burn token does not match a pending destruction
    #[error("Destruction token does not match message {0}")]
    DestructionTokenMismatch(String),

    // ========================================================================
    // Encoding Errors (900-999)
    // ========================================================================

    /// Malformed envelope, key state or backup
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Serialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the numeric error code
    ///
    /// Error codes are organized by category:
    /// - 100-199: Lifecycle
    /// - 200-299: Keys
    /// - 300-399: Crypto
    /// - 400-499: Ratchet
    /// - 500-599: Burn-on-read
    /// - 900-999: Encoding / internal
    pub fn code(&self) -> i32 {
        match self {
            Error::NotInitialized => 100,
            Error::Disposed => 101,
            Error::SchedulerUnavailable(_) => 102,
            Error::KeyDerivationFailed(_) => 200,
            Error::InvalidKey(_) => 201,
            Error::RngFailed => 202,
            Error::EncryptionFailed(_) => 300,
            Error::AuthenticationFailed => 301,
            Error::CounterOutOfRange { .. } => 400,
            Error::MissingKeyMaterial(_) => 401,
            Error::DestructionTokenMismatch(_) => 500,
            Error::InvalidEnvelope(_) => 900,
            Error::SerializationError(_) => 901,
            Error::Internal(_) => 999,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can be resolved by the caller (initialize first,
    /// resync the ratchet) rather than indicating tampering or a bug.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NotInitialized | Error::CounterOutOfRange { .. } | Error::SchedulerUnavailable(_)
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::InvalidEnvelope(format!("Invalid base64: {}", err))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_by_category() {
        assert_eq!(Error::NotInitialized.code(), 100);
        assert_eq!(Error::KeyDerivationFailed("x".into()).code(), 200);
        assert_eq!(Error::AuthenticationFailed.code(), 301);
        assert_eq!(Error::MissingKeyMaterial(3).code(), 401);
        assert_eq!(Error::DestructionTokenMismatch("m".into()).code(), 500);
    }

    #[test]
    fn test_authentication_failure_is_opaque() {
        let msg = Error::AuthenticationFailed.to_string();
        assert!(!msg.contains("tag"));
        assert!(!msg.contains("iv"));
    }

    #[test]
    fn test_recoverable() {
        let range = Error::CounterOutOfRange { requested: 5000, current: 0, limit: 1000 };
        assert!(range.is_recoverable());
        assert!(!Error::AuthenticationFailed.is_recoverable());
    }

    #[test]
    fn test_json_error_conversion() {
        let err: Error = serde_json::from_str::<u64>("nope").unwrap_err().into();
        assert_eq!(err.code(), 901);
    }
}
