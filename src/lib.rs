//! Veil — encrypted-at-rest code modules for a host process.
//!
//! A sensitive module ships encrypted. At host start it is decrypted once
//! into a private cache, loaded into a sandboxed WebAssembly runtime, and
//! driven through the host's lifecycle by a delegate that tolerates a
//! missing or faulty module.
//!
//! See `DESIGN.md` for architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cipher;
pub mod config;
pub mod keys;
pub mod logging;

pub mod stager;

pub mod delegate;
pub mod lifecycle;
pub mod loader;

pub mod host;
