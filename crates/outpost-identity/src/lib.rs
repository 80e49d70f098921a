//! Stable per-device identity: platform signal collection behind one seam,
//! and a memoizing resolver that hashes the signals into a fingerprint.

pub mod resolver;
pub mod signals;
