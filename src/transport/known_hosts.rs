//! Append-only host-key store with trust-on-first-use semantics.
//!
//! Lines follow the OpenSSH shape `hostname <type> <base64>`. A host seen
//! for the first time is recorded with a warning carrying the SHA-256
//! fingerprint. A recorded host presenting a different key of the same type
//! is rejected and the file left untouched. Re-recording an identical pair
//! is a byte-for-byte no-op.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use russh::keys::{HashAlg, PublicKey, PublicKeyBase64};

use crate::error::OpsError;

/// Outcome of verifying a presented host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyCheck {
    /// Key matches the recorded entry.
    Known,
    /// Host was unknown; the key has been recorded.
    Recorded { fingerprint: String },
}

/// File-backed known-hosts store.
#[derive(Debug, Clone)]
pub struct KnownHostsStore {
    path: PathBuf,
}

impl KnownHostsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The invoking user's `~/.ssh/known_hosts`.
    pub fn default_location() -> Result<Self, OpsError> {
        let home = dirs::home_dir()
            .ok_or_else(|| OpsError::Internal("cannot resolve home directory".to_string()))?;
        Ok(Self::new(home.join(".ssh").join("known_hosts")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether any key is recorded for `host:port`.
    pub fn contains_host(&self, host: &str, port: u16) -> bool {
        let label = host_label(host, port);
        match fs::read_to_string(&self.path) {
            Ok(contents) => contents.lines().any(|line| {
                let mut parts = line.split_whitespace();
                parts.next() == Some(label.as_str())
            }),
            Err(_) => false,
        }
    }

    /// Verify `key` for `host:port`, recording it when the host is new.
    ///
    /// Returns [`OpsError::HostKeyMismatch`] when a different key of the
    /// same type is already recorded. The file is only ever appended to.
    pub fn verify_and_record(
        &self,
        host: &str,
        port: u16,
        key: &PublicKey,
    ) -> Result<HostKeyCheck, OpsError> {
        let label = host_label(host, port);
        let key_type = key.algorithm().to_string();
        let key_base64 = key.public_key_base64();
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();

        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(hosts), Some(line_type), Some(line_key)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if !hosts.split(',').any(|h| h == label) {
                continue;
            }
            if line_type != key_type {
                // A host may legitimately hold keys of several types.
                continue;
            }
            if line_key == key_base64 {
                return Ok(HostKeyCheck::Known);
            }
            log::error!(
                "host key mismatch for {label}: recorded {line_type} key differs from presented {fingerprint}"
            );
            return Err(OpsError::HostKeyMismatch {
                host: label,
                fingerprint,
            });
        }

        self.append_entry(&label, &key_type, &key_base64)?;
        log::warn!("recorded new host key for {label}: {fingerprint}");
        Ok(HostKeyCheck::Recorded { fingerprint })
    }

    fn append_entry(&self, label: &str, key_type: &str, key_base64: &str) -> Result<(), OpsError> {
        if let Some(dir) = self.path.parent() {
            if !dir.exists() {
                fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&self.path)?;
        writeln!(file, "{label} {key_type} {key_base64}")?;
        Ok(())
    }
}

/// Known-hosts label: bare hostname on port 22, `[host]:port` otherwise.
fn host_label(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const K1: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEB";
    const K2: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgIC";

    fn key(s: &str) -> PublicKey {
        PublicKey::from_str(s).expect("parse fixture key")
    }

    fn store() -> (tempfile::TempDir, KnownHostsStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = KnownHostsStore::new(dir.path().join("known_hosts"));
        (dir, store)
    }

    #[test]
    fn first_encounter_records_with_fingerprint() {
        let (_dir, store) = store();
        let check = store
            .verify_and_record("10.0.0.5", 22, &key(K1))
            .expect("record");
        let HostKeyCheck::Recorded { fingerprint } = check else {
            panic!("expected Recorded, got {check:?}");
        };
        assert!(fingerprint.starts_with("SHA256:"));

        let contents = fs::read_to_string(store.path()).expect("read");
        assert!(contents.starts_with("10.0.0.5 ssh-ed25519 "));
    }

    #[test]
    fn known_match_is_silent() {
        let (_dir, store) = store();
        store.verify_and_record("10.0.0.5", 22, &key(K1)).expect("record");
        let check = store
            .verify_and_record("10.0.0.5", 22, &key(K1))
            .expect("verify");
        assert_eq!(check, HostKeyCheck::Known);
    }

    #[test]
    fn re_recording_is_byte_for_byte_noop() {
        let (_dir, store) = store();
        store.verify_and_record("10.0.0.5", 22, &key(K1)).expect("record");
        let before = fs::read(store.path()).expect("read");
        store.verify_and_record("10.0.0.5", 22, &key(K1)).expect("verify");
        let after = fs::read(store.path()).expect("read");
        assert_eq!(before, after);
    }

    #[test]
    fn mismatch_is_rejected_and_file_untouched() {
        let (_dir, store) = store();
        store.verify_and_record("10.0.0.5", 22, &key(K1)).expect("record");
        let before = fs::read(store.path()).expect("read");

        let err = store
            .verify_and_record("10.0.0.5", 22, &key(K2))
            .expect_err("mismatch");
        assert!(matches!(err, OpsError::HostKeyMismatch { .. }));

        let after = fs::read(store.path()).expect("read");
        assert_eq!(before, after);
    }

    #[test]
    fn non_default_port_uses_bracketed_label() {
        let (_dir, store) = store();
        store.verify_and_record("10.0.0.5", 2222, &key(K1)).expect("record");
        let contents = fs::read_to_string(store.path()).expect("read");
        assert!(contents.starts_with("[10.0.0.5]:2222 "));
        assert!(store.contains_host("10.0.0.5", 2222));
        assert!(!store.contains_host("10.0.0.5", 22));
    }

    #[test]
    fn distinct_hosts_do_not_collide() {
        let (_dir, store) = store();
        store.verify_and_record("10.0.0.5", 22, &key(K1)).expect("record");
        let check = store
            .verify_and_record("10.0.0.6", 22, &key(K2))
            .expect("record other host");
        assert!(matches!(check, HostKeyCheck::Recorded { .. }));
    }

    #[test]
    fn restrictive_modes_are_applied() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let store = KnownHostsStore::new(dir.path().join("ssh").join("known_hosts"));
        store.verify_and_record("10.0.0.5", 22, &key(K1)).expect("record");

        let dir_mode = fs::metadata(dir.path().join("ssh")).expect("dir").permissions().mode();
        let file_mode = fs::metadata(store.path()).expect("file").permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(file_mode & 0o777, 0o600);
    }
}
