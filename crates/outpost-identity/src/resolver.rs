use std::{fmt, fs, path::PathBuf, sync::Mutex};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::signals::{CollectionError, SignalSource};

/// Length of the hex-encoded fingerprint (SHA-256).
pub const FINGERPRINT_LEN: usize = 64;

const SIGNAL_SEPARATOR: char = '|';

/// Errors produced by fingerprint resolution.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("machine signal collection failed")]
    Collection(#[from] CollectionError),
}

/// Opaque, stable per-device identifier: 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves the machine fingerprint once per process and mirrors it to a
/// persistent file so later processes skip derivation entirely. The persisted
/// copy is advisory: unreadable or malformed contents fall back to a fresh
/// derivation, and persist failures are logged, never raised.
pub struct IdentityResolver<S> {
    source: S,
    cache_path: PathBuf,
    memo: Mutex<Option<Fingerprint>>,
}

impl<S: SignalSource> IdentityResolver<S> {
    pub fn new(source: S, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            cache_path: cache_path.into(),
            memo: Mutex::new(None),
        }
    }

    /// Resolve the fingerprint. Concurrent first callers serialize on one
    /// critical section, so derivation and persistence happen at most once
    /// per process.
    pub fn resolve(&self) -> Result<Fingerprint, IdentityError> {
        // A poisoned lock only means another caller panicked before filling
        // the slot; the slot itself is still either empty or valid.
        let mut memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(fingerprint) = memo.as_ref() {
            return Ok(fingerprint.clone());
        }

        if let Some(fingerprint) = self.read_persisted() {
            debug!(path = %self.cache_path.display(), "loaded persisted fingerprint");
            *memo = Some(fingerprint.clone());
            return Ok(fingerprint);
        }

        let fingerprint = self.derive()?;
        self.persist(&fingerprint);
        *memo = Some(fingerprint.clone());
        Ok(fingerprint)
    }

    fn derive(&self) -> Result<Fingerprint, IdentityError> {
        let signals = self.source.collect()?;

        let mut combined = String::new();
        for signal in &signals {
            combined.push_str(signal);
            combined.push(SIGNAL_SEPARATOR);
        }

        let digest = Sha256::digest(combined.as_bytes());
        Ok(Fingerprint(hex::encode(digest)))
    }

    fn read_persisted(&self) -> Option<Fingerprint> {
        let contents = fs::read_to_string(&self.cache_path).ok()?;
        let candidate = contents.trim();
        if !is_well_formed(candidate) {
            warn!(
                path = %self.cache_path.display(),
                "ignoring malformed persisted fingerprint"
            );
            return None;
        }
        Some(Fingerprint(candidate.to_string()))
    }

    fn persist(&self, fingerprint: &Fingerprint) {
        if let Err(err) = self.try_persist(fingerprint) {
            warn!(
                path = %self.cache_path.display(),
                error = %err,
                "failed to persist fingerprint; continuing with derived value"
            );
        }
    }

    fn try_persist(&self, fingerprint: &Fingerprint) -> std::io::Result<()> {
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.cache_path, fingerprint.as_str())
    }
}

fn is_well_formed(candidate: &str) -> bool {
    candidate.len() == FINGERPRINT_LEN
        && candidate
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::signals::FixedSignals;

    /// Counts how many times the underlying source is consulted.
    struct CountingSource {
        inner: FixedSignals,
        calls: Cell<u32>,
    }

    impl CountingSource {
        fn new(inner: FixedSignals) -> Self {
            Self {
                inner,
                calls: Cell::new(0),
            }
        }
    }

    impl SignalSource for CountingSource {
        fn collect(&self) -> Result<Vec<String>, CollectionError> {
            self.calls.set(self.calls.get() + 1);
            self.inner.collect()
        }
    }

    fn cache_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("machine_id")
    }

    #[test]
    fn fingerprint_is_well_formed_hex() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolver = IdentityResolver::new(
            FixedSignals::new(["product-id", "cpu", "mac"]),
            cache_path(&dir),
        );
        let fingerprint = resolver.resolve().expect("resolve");

        assert_eq!(fingerprint.as_str().len(), FINGERPRINT_LEN);
        assert!(fingerprint
            .as_str()
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn resolution_is_memoized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = CountingSource::new(FixedSignals::new(["sig-a", "sig-b"]));
        let resolver = IdentityResolver::new(source, cache_path(&dir));

        let first = resolver.resolve().expect("first resolve");
        let second = resolver.resolve().expect("second resolve");

        assert_eq!(first, second);
        assert_eq!(resolver.source.calls.get(), 1, "derivation runs once");
    }

    #[test]
    fn unchanged_signals_derive_the_same_fingerprint() {
        let dir_a = tempfile::tempdir().expect("tempdir");
        let dir_b = tempfile::tempdir().expect("tempdir");
        let first = IdentityResolver::new(FixedSignals::new(["one", "two"]), cache_path(&dir_a));
        let second = IdentityResolver::new(FixedSignals::new(["one", "two"]), cache_path(&dir_b));

        assert_eq!(
            first.resolve().expect("resolve"),
            second.resolve().expect("resolve")
        );
    }

    #[test]
    fn different_signals_derive_different_fingerprints() {
        let dir_a = tempfile::tempdir().expect("tempdir");
        let dir_b = tempfile::tempdir().expect("tempdir");
        let first = IdentityResolver::new(FixedSignals::new(["one"]), cache_path(&dir_a));
        let second = IdentityResolver::new(FixedSignals::new(["two"]), cache_path(&dir_b));

        assert_ne!(
            first.resolve().expect("resolve"),
            second.resolve().expect("resolve")
        );
    }

    #[test]
    fn persisted_fingerprint_wins_over_fresh_derivation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = cache_path(&dir);

        let original = IdentityResolver::new(FixedSignals::new(["stable", "signals"]), &path)
            .resolve()
            .expect("resolve");

        // A new process with drifted signals must still see the mirrored
        // value while the cache file survives.
        let drifted = IdentityResolver::new(FixedSignals::new(["drifted"]), &path);
        assert_eq!(drifted.resolve().expect("resolve"), original);
    }

    #[test]
    fn corrupt_persisted_cache_falls_back_to_derivation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = cache_path(&dir);
        fs::write(&path, "definitely-not-a-fingerprint").expect("write corrupt cache");

        let resolver = IdentityResolver::new(FixedSignals::new(["one", "two"]), &path);
        let fingerprint = resolver.resolve().expect("resolve");
        assert_eq!(fingerprint.as_str().len(), FINGERPRINT_LEN);

        // The corrupt mirror is replaced with the derived value.
        let persisted = fs::read_to_string(&path).expect("read cache");
        assert_eq!(persisted.trim(), fingerprint.as_str());
    }

    #[test]
    fn persist_failure_is_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Parent of the cache path is a regular file, so persisting fails.
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").expect("write blocker");

        let resolver =
            IdentityResolver::new(FixedSignals::new(["one"]), blocker.join("machine_id"));
        resolver.resolve().expect("resolve despite persist failure");
    }

    #[test]
    fn concurrent_first_callers_agree() {
        use std::sync::Arc;

        let dir = tempfile::tempdir().expect("tempdir");
        let resolver = Arc::new(IdentityResolver::new(
            FixedSignals::new(["shared", "signals"]),
            cache_path(&dir),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                std::thread::spawn(move || resolver.resolve().expect("resolve"))
            })
            .collect();

        let fingerprints: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();
        assert!(fingerprints.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn zero_signals_fail_resolution() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolver = IdentityResolver::new(FixedSignals::default(), cache_path(&dir));
        let err = resolver.resolve().expect_err("no signals");
        assert!(matches!(err, IdentityError::Collection(_)));
    }
}
