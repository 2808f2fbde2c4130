//! Unlock (fetch+decrypt newest manifest) / lock (encrypt+upload, rotate)
//! (§4.5). The process-wide "currently unlocked store" registration from the
//! source becomes an RAII guard here: constructing it installs SIGINT/SIGTERM
//! handlers, dropping it removes them, and there is exactly one guard alive
//! per active unlock scope.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::backend::BackendDriver;
use crate::config::StoreOptions;
use crate::crypto;
use crate::error::{BackupError, Result};
use crate::io::StreamHandle;
use crate::manifest::Manifest;
use crate::util::{format_time_ms, get_scratch_dir, parse_time_ms};

pub const MANIFEST_PREFIX: &str = "manifest.";
pub const MANIFEST_KEY_PREFIX: &str = "manifest-key.";

static SIGNAL_RECEIVED: AtomicBool = AtomicBool::new(false);
static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

pub fn signal_requested() -> bool {
    SIGNAL_RECEIVED.load(Ordering::SeqCst)
}

#[cfg(unix)]
extern "C" fn on_signal(_sig: libc::c_int) {
    SIGNAL_RECEIVED.store(true, Ordering::SeqCst);
}

/// Replaces the source's process-global "currently unlocked store" variable
/// with explicit ownership: the scope that calls `unlock` owns this guard,
/// and signal delivery during that scope's lifetime is the only time a
/// handler is installed.
pub struct SignalGuard {
    _private: (),
}

impl SignalGuard {
    pub fn install() -> Self {
        if !HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
            SIGNAL_RECEIVED.store(false, Ordering::SeqCst);
            #[cfg(unix)]
            unsafe {
                libc::signal(libc::SIGINT, on_signal as usize);
                libc::signal(libc::SIGTERM, on_signal as usize);
            }
        }
        SignalGuard { _private: () }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        // Re-masking on entry means a second press while cleanup is already
        // running is simply ignored; uninstalling here is what makes the
        // guard idempotent across repeated signals.
        HANDLER_INSTALLED.store(false, Ordering::SeqCst);
        #[cfg(unix)]
        unsafe {
            libc::signal(libc::SIGINT, libc::SIG_DFL);
            libc::signal(libc::SIGTERM, libc::SIG_DFL);
        }
    }
}

pub struct UnlockedManifest {
    pub manifest: Manifest,
    scratch_manifest_path: PathBuf,
    _guard: SignalGuard,
}

impl UnlockedManifest {
    pub fn scratch_path(&self) -> &std::path::Path {
        &self.scratch_manifest_path
    }
}

fn read_all_bytes(handle: &StreamHandle) -> Result<Vec<u8>> {
    let scope = handle.open()?;
    let mut out = Vec::new();
    for block in scope.reader(None, true)? {
        out.extend_from_slice(&block?);
    }
    Ok(out)
}

/// Purge and recreate the scratch directory, then fetch and decrypt the
/// newest manifest (or start a fresh one if the store is empty), registering
/// the signal guard for the duration of the returned value's lifetime.
pub fn unlock(
    backend: &dyn BackendDriver,
    options: &StoreOptions,
    private_key: &RsaPrivateKey,
) -> Result<UnlockedManifest> {
    let scratch = get_scratch_dir();
    if scratch.exists() {
        std::fs::remove_dir_all(&scratch)?;
    }
    std::fs::create_dir_all(&scratch)?;

    let guard = SignalGuard::install();

    let mut manifests = backend.query(MANIFEST_PREFIX)?;
    manifests.sort();

    let scratch_manifest_path = scratch.join("manifest.db");

    let manifest = if manifests.is_empty() {
        tracing::warn!(
            "\n********************************************************************\n\
             This looks like a new backup location; if you are not expecting this\n\
             message, someone may be tampering with your backup!\n\
             ********************************************************************"
        );
        Manifest::open(&scratch_manifest_path)?
    } else {
        let newest = manifests.last().expect("checked non-empty above").clone();
        let ts = newest
            .strip_prefix(MANIFEST_PREFIX)
            .ok_or_else(|| BackupError::BackupCorrupted(format!("unexpected manifest object name {newest:?}")))?;
        parse_time_ms(ts)?;
        let key_name = format!("{MANIFEST_KEY_PREFIX}{ts}");

        let wrapped_key = StreamHandle::anonymous();
        backend.load(&key_name, &wrapped_key)?;
        let wrapped_bytes = read_all_bytes(&wrapped_key)?;
        let key_pair_and_tag = crypto::unwrap_key_pair(&wrapped_bytes, private_key)?;
        let (key_pair, tag) = key_pair_and_tag.split_at(crypto::KEY_PAIR_SIZE);

        let ciphertext = StreamHandle::anonymous();
        backend.load(&newest, &ciphertext)?;
        let plaintext = StreamHandle::for_path(&scratch_manifest_path).without_mtime_check();
        crypto::open_sealed(&ciphertext, &plaintext, key_pair, tag, options)?;

        Manifest::open(&scratch_manifest_path)?
    };

    Ok(UnlockedManifest { manifest, scratch_manifest_path, _guard: guard })
}

/// Encrypt and upload the manifest (unless unchanged or `dry_run`), wrap a
/// fresh key pair for it with RSA, then rotate old versions. Consumes the
/// `UnlockedManifest`, dropping its guard and releasing the signal handlers.
pub fn lock(
    unlocked: UnlockedManifest,
    backend: &dyn BackendDriver,
    options: &StoreOptions,
    private_key: &RsaPrivateKey,
    now_ms: i64,
    dry_run: bool,
) -> Result<()> {
    if !unlocked.manifest.changed {
        tracing::info!("no changes detected; nothing to do");
        return Ok(());
    }
    if dry_run {
        return Ok(());
    }

    let key_pair = crypto::generate_key_pair(options);
    let plaintext = StreamHandle::for_path(unlocked.scratch_path()).without_mtime_check();
    let ciphertext = StreamHandle::anonymous();
    let tag = crypto::seal(&plaintext, &ciphertext, &key_pair, options)?;

    let mut key_pair_and_tag = key_pair.clone();
    key_pair_and_tag.extend_from_slice(&tag);
    let public_key = RsaPublicKey::from(private_key);
    let wrapped = crypto::wrap_key_pair(&key_pair_and_tag, &public_key, private_key)?;

    let ts = format_time_ms(now_ms);
    let manifest_staging = persist_to_staging(&ciphertext)?;
    backend.save(&manifest_staging, &format!("{MANIFEST_PREFIX}{ts}"))?;

    let key_staging = persist_bytes_to_staging(&wrapped)?;
    backend.save(&key_staging, &format!("{MANIFEST_KEY_PREFIX}{ts}"))?;

    rotate_manifests(backend, options)?;
    Ok(())
}

fn persist_to_staging(handle: &StreamHandle) -> Result<PathBuf> {
    let bytes = read_all_bytes(handle)?;
    persist_bytes_to_staging(&bytes)
}

fn persist_bytes_to_staging(bytes: &[u8]) -> Result<PathBuf> {
    let scratch = get_scratch_dir();
    std::fs::create_dir_all(&scratch)?;
    let path = scratch.join(format!("staging-{:x}", rand_u64()));
    std::fs::write(&path, bytes)?;
    Ok(path)
}

fn rand_u64() -> u64 {
    use rand::RngCore;
    rand::thread_rng().next_u64()
}

/// After a successful lock, keep only the newest `max_manifest_versions`
/// manifest+key pairs.
pub fn rotate_manifests(backend: &dyn BackendDriver, options: &StoreOptions) -> Result<()> {
    let Some(max_versions) = options.max_manifest_versions else {
        return Ok(());
    };
    let mut manifests = backend.query(MANIFEST_PREFIX)?;
    manifests.sort();
    if manifests.len() as u32 <= max_versions {
        return Ok(());
    }
    let cutoff = manifests.len() - max_versions as usize;
    for old in &manifests[..cutoff] {
        let ts = old.strip_prefix(MANIFEST_PREFIX).unwrap_or(old);
        backend.delete(old)?;
        backend.delete(&format!("{MANIFEST_KEY_PREFIX}{ts}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;

    fn test_private_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::thread_rng(), crypto::RSA_KEY_BITS).unwrap()
    }

    #[test]
    fn unlock_on_empty_store_creates_fresh_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let options = StoreOptions::default();
        let key = test_private_key();

        let unlocked = unlock(&backend, &options, &key).unwrap();
        assert!(!unlocked.manifest.changed);
    }

    #[test]
    fn lock_skips_upload_when_manifest_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let options = StoreOptions::default();
        let key = test_private_key();

        let unlocked = unlock(&backend, &options, &key).unwrap();
        lock(unlocked, &backend, &options, &key, 1_000, false).unwrap();
        assert!(backend.query(MANIFEST_PREFIX).unwrap().is_empty());
    }

    #[test]
    fn unlock_lock_round_trip_persists_changes_across_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let options = StoreOptions::default();
        let key = test_private_key();

        let mut unlocked = unlock(&backend, &options, &key).unwrap();
        unlocked
            .manifest
            .insert_or_update(&crate::manifest::ManifestEntry::new_unsaved(
                "/data/foo",
                crate::manifest::FileState::Copy { sha: "aaa".into(), key_pair: vec![1, 2, 3] },
                0,
                0,
                0o644,
            ))
            .unwrap();
        lock(unlocked, &backend, &options, &key, 1_000, false).unwrap();

        let manifests = backend.query(MANIFEST_PREFIX).unwrap();
        assert_eq!(manifests.len(), 1);

        let unlocked2 = unlock(&backend, &options, &key).unwrap();
        let entry = unlocked2.manifest.get_entry("/data/foo", None).unwrap().unwrap();
        assert_eq!(entry.state.sha(), Some("aaa"));
    }
}
