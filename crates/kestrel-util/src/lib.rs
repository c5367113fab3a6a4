#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Shared utilities for kestrel.
//!
//! Pure helpers with no logging dependencies; the engine crate owns tracing.

pub mod fs;
pub mod hash;

pub use hash::{fingerprint, short_hash, Fingerprint};
