//! Dual-domain authenticated encryption for locally persisted agent data.
//! Config-domain envelopes are machine-bound; database-domain envelopes are
//! keyed by a server-issued secret and portable across hosts.

pub mod cipher;
