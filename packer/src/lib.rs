//! Veil packer — offline side of the encrypted artifact pipeline.
//!
//! Turns a compiled module into the encrypted resource shipped with the
//! host, and checks that a shipped resource decrypts back to its source.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// File-level encrypt and decrypt.
pub mod pack;
/// SHA-256 round-trip verification.
pub mod verify;
