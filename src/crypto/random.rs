//! # Random Source
//!
//! CSPRNG helpers backed by the operating system RNG, plus the two
//! memory-hygiene primitives every key holder needs: secure wipe and
//! constant-time comparison.
//!
//! | Function | Output |
//! |----------|--------|
//! | [`random_bytes`] | `len` random bytes |
//! | [`random_hex`] | `len` random bytes, lowercase hex |
//! | [`generate_secure_id`] | 16 random bytes, hex (32 chars) |
//! | [`secure_wipe`] | overwrites a buffer with fresh random bytes |
//! | [`constant_time_eq`] | timing-safe equality |

use rand::rngs::OsRng;
use rand_core::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Length in bytes of ids from [`generate_secure_id`]
pub const SECURE_ID_BYTES: usize = 16;

/// Fill `buf` from the OS random source
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng.try_fill_bytes(buf).map_err(|_| Error::RngFailed)
}

/// Generate `len` cryptographically random bytes
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    fill_random(&mut bytes)?;
    Ok(bytes)
}

/// Generate `len` random bytes encoded as lowercase hex
pub fn random_hex(len: usize) -> Result<String> {
    Ok(hex::encode(random_bytes(len)?))
}

/// Generate a 128-bit random identifier
pub fn generate_secure_id() -> Result<String> {
    random_hex(SECURE_ID_BYTES)
}

/// Overwrite `buf` with fresh random bytes
///
/// If the RNG fails the buffer is zero-filled instead and the error is
/// returned, so the old contents never survive either way.
pub fn secure_wipe(buf: &mut [u8]) -> Result<()> {
    if let Err(e) = fill_random(buf) {
        buf.zeroize();
        return Err(e);
    }
    Ok(())
}

/// Compare two byte strings without early exit on the first difference
///
/// Length is not secret: slices of different length compare false.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

// ============================================================================
// TESTS
// ============================================================================
