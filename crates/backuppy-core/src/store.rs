//! Backup store engine (§4.4): the per-file change decision, the
//! content-addressed save/load path, and restore mechanics. This is the
//! central decision procedure the rest of the system is built around.

use crate::backend::BackendDriver;
use crate::config::StoreOptions;
use crate::crypto;
use crate::diff;
use crate::error::{BackupError, Result};
use crate::io::{Stat, StreamHandle};
use crate::manifest::{FileState, Manifest, ManifestEntry};
use crate::util::{get_scratch_dir, sha_to_path};

pub struct BackupStoreEngine<'b> {
    backend: &'b dyn BackendDriver,
    options: StoreOptions,
}

impl<'b> BackupStoreEngine<'b> {
    pub fn new(backend: &'b dyn BackendDriver, options: StoreOptions) -> Self {
        BackupStoreEngine { backend, options }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// The central decision procedure (§4.4 step 1-4): copy, diff, metadata-
    /// only update, or no-op.
    pub fn save_if_new(
        &self,
        manifest: &mut Manifest,
        abs_file_name: &str,
        force_copy: bool,
        dry_run: bool,
    ) -> Result<()> {
        let curr = manifest.get_entry(abs_file_name, None)?;
        let new_file = StreamHandle::for_path(abs_file_name);
        let (new_sha, stat) = {
            let scope = new_file.open()?;
            for block in scope.reader(None, true)? {
                block?;
            }
            (scope.sha(), scope.stat()?)
        };

        let is_tombstone = matches!(curr.as_ref().map(|e| &e.state), Some(FileState::Deleted));

        if force_copy || curr.is_none() || is_tombstone {
            tracing::info!(abs_file_name, "saving a new copy");
            return self.write_copy(manifest, abs_file_name, &new_file, &new_sha, stat, dry_run);
        }

        let curr = curr.expect("checked above");
        let curr_sha = curr.state.sha().expect("non-tombstone entries always carry a sha");

        if new_sha != curr_sha {
            if self.options.matches_skip_diff(abs_file_name) {
                tracing::info!(abs_file_name, "path matches skip_diff_patterns; saving a copy");
                self.write_copy(manifest, abs_file_name, &new_file, &new_sha, stat, dry_run)
            } else {
                tracing::info!(abs_file_name, "saving a diff");
                self.write_diff(manifest, abs_file_name, &new_file, &new_sha, stat, &curr, dry_run)
            }
        } else if stat.uid != curr.uid || stat.gid != curr.gid || stat.mode != curr.mode {
            tracing::info!(abs_file_name, "saving changed metadata only");
            if !dry_run {
                manifest.insert_or_update(&ManifestEntry::new_unsaved(
                    abs_file_name,
                    curr.state.clone(),
                    stat.uid,
                    stat.gid,
                    stat.mode,
                ))?;
            }
            Ok(())
        } else {
            tracing::info!(abs_file_name, "up to date");
            Ok(())
        }
    }

    fn write_copy(
        &self,
        manifest: &mut Manifest,
        abs_file_name: &str,
        new_file: &StreamHandle,
        new_sha: &str,
        stat: Stat,
        dry_run: bool,
    ) -> Result<()> {
        let existing = manifest
            .get_entries_by_sha(new_sha)?
            .into_iter()
            .find(|e| e.state.sha() == Some(new_sha));

        let state = if let Some(existing) = existing {
            existing.state.clone()
        } else {
            let key_pair = crypto::generate_key_pair(&self.options);
            let tag = if dry_run { Vec::new() } else { self.save(new_file, new_sha, &key_pair)? };
            let mut key_pair_and_tag = key_pair;
            key_pair_and_tag.extend_from_slice(&tag);
            FileState::Copy { sha: new_sha.to_string(), key_pair: key_pair_and_tag }
        };

        if !dry_run {
            manifest.insert_or_update(&ManifestEntry::new_unsaved(
                abs_file_name,
                state,
                stat.uid,
                stat.gid,
                stat.mode,
            ))?;
        }
        Ok(())
    }

    fn write_diff(
        &self,
        manifest: &mut Manifest,
        abs_file_name: &str,
        new_file: &StreamHandle,
        new_sha: &str,
        stat: Stat,
        curr: &ManifestEntry,
        dry_run: bool,
    ) -> Result<()> {
        if let Some(existing) = manifest
            .get_entries_by_sha(new_sha)?
            .into_iter()
            .find(|e| e.state.sha() == Some(new_sha))
        {
            if !dry_run {
                manifest.insert_or_update(&ManifestEntry::new_unsaved(
                    abs_file_name,
                    existing.state.clone(),
                    stat.uid,
                    stat.gid,
                    stat.mode,
                ))?;
            }
            return Ok(());
        }

        let (base_sha, base_key_pair) = match &curr.state {
            FileState::Diff { base_sha, base_key_pair, .. } => (base_sha.clone(), base_key_pair.to_vec()),
            FileState::Copy { sha, key_pair } => (sha.clone(), key_pair.clone()),
            FileState::Deleted => {
                // save_if_new never routes a tombstone through write_diff.
                return self.write_copy(manifest, abs_file_name, new_file, new_sha, stat, dry_run);
            }
        };

        let orig = StreamHandle::anonymous();
        self.load(&base_sha, &orig, &base_key_pair)?;

        match diff::compute_diff(&orig, new_file, self.options.discard_diff_percentage)? {
            Err(diff::DiffTooLarge) => {
                tracing::info!(abs_file_name, "diff too large; falling back to a full copy");
                self.write_copy(manifest, abs_file_name, new_file, new_sha, stat, dry_run)
            }
            Ok((diff_bytes, recomputed_sha)) => {
                let key_pair = crypto::generate_key_pair(&self.options);
                let diff_handle = StreamHandle::anonymous();
                {
                    let scope = diff_handle.open()?;
                    scope.writer().write_block(&diff_bytes)?;
                }
                let tag =
                    if dry_run { Vec::new() } else { self.save(&diff_handle, &recomputed_sha, &key_pair)? };
                let mut key_pair_and_tag = key_pair;
                key_pair_and_tag.extend_from_slice(&tag);

                let state = FileState::Diff {
                    sha: recomputed_sha,
                    key_pair: key_pair_and_tag,
                    base_sha,
                    base_key_pair,
                };
                if !dry_run {
                    manifest.insert_or_update(&ManifestEntry::new_unsaved(
                        abs_file_name,
                        state,
                        stat.uid,
                        stat.gid,
                        stat.mode,
                    ))?;
                }
                Ok(())
            }
        }
    }

    /// Compress+encrypt `src` into a scratch staging file, hand it to the
    /// backend to publish atomically under `sha_to_path(dest_sha)`, then
    /// remove the staging file. Returns the HMAC tag.
    pub fn save(&self, src: &StreamHandle, dest_sha: &str, key_pair: &[u8]) -> Result<Vec<u8>> {
        let dest_path = sha_to_path(dest_sha).to_string_lossy().replace('\\', "/");
        let scratch = get_scratch_dir();
        std::fs::create_dir_all(&scratch)?;
        let staging_path = scratch.join(format!("save-{:016x}", rand_u64()));
        let staging = StreamHandle::for_path(&staging_path);

        let tag = crypto::seal(src, &staging, key_pair, &self.options);
        let result = tag.and_then(|tag| self.backend.save(&staging_path, &dest_path).map(|()| tag));
        let _ = std::fs::remove_file(&staging_path);
        result
    }

    /// Load and decrypt the blob named `src_sha` into `dest`, authenticated
    /// against the tag carried in `key_pair_and_tag`.
    pub fn load(&self, src_sha: &str, dest: &StreamHandle, key_pair_and_tag: &[u8]) -> Result<()> {
        let src_path = sha_to_path(src_sha).to_string_lossy().replace('\\', "/");
        let ciphertext = StreamHandle::anonymous();
        self.backend.load(&src_path, &ciphertext)?;

        let (key_pair, tag) = split_authenticated_key_pair(key_pair_and_tag, &self.options);
        crypto::open_sealed(&ciphertext, dest, key_pair, tag, &self.options)
    }

    /// Reconstruct `entry`'s contents into `out`: a straight load for a
    /// copy, or load-base + load-diff + apply for a diff.
    pub fn restore_entry(&self, entry: &ManifestEntry, out: &StreamHandle) -> Result<()> {
        match &entry.state {
            FileState::Deleted => {
                Err(BackupError::InputParseError(format!("{} was deleted; nothing to restore", entry.abs_file_name)))
            }
            FileState::Copy { sha, key_pair } => self.load(sha, out, key_pair),
            FileState::Diff { sha, key_pair, base_sha, base_key_pair } => {
                let orig = StreamHandle::anonymous();
                self.load(base_sha, &orig, base_key_pair)?;
                let diff_blob = StreamHandle::anonymous();
                self.load(sha, &diff_blob, key_pair)?;
                diff::apply_diff(&orig, &diff_blob, out)
            }
        }
    }
}

fn split_authenticated_key_pair<'a>(key_pair_and_tag: &'a [u8], options: &StoreOptions) -> (&'a [u8], &'a [u8]) {
    if !options.use_encryption || key_pair_and_tag.is_empty() {
        return (&[], &[]);
    }
    key_pair_and_tag.split_at(crypto::KEY_PAIR_SIZE)
}

fn rand_u64() -> u64 {
    use rand::RngCore;
    rand::thread_rng().next_u64()
}
