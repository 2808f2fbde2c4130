//! S3-like object store backend driver. The rest of the engine is
//! single-threaded and blocking (§5); this is the one place an async SDK is
//! unavoidable, so a small multi-threaded runtime is scoped to this module
//! and every public method blocks on it rather than exposing `async fn`.

use std::path::Path;

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::StorageClass;
use aws_sdk_s3::Client;
use tokio::runtime::Runtime;

use super::BackendDriver;
use crate::error::{BackupError, Result};
use crate::io::StreamHandle;

/// Size thresholds (bytes) used to pick a cheaper storage class for large,
/// cold blobs. Manifests always stay in hot (`Standard`) storage regardless
/// of size.
#[derive(Debug, Clone, Copy)]
pub struct StorageClassThresholds {
    pub infrequent_access: u64,
    pub one_zone_ia: u64,
    pub glacier: u64,
    pub deep_archive: u64,
}

impl Default for StorageClassThresholds {
    fn default() -> Self {
        StorageClassThresholds {
            infrequent_access: 128 * 1024 * 1024,
            one_zone_ia: 512 * 1024 * 1024,
            glacier: 2 * 1024 * 1024 * 1024,
            deep_archive: 8 * 1024 * 1024 * 1024,
        }
    }
}

pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
    thresholds: StorageClassThresholds,
    runtime: Runtime,
}

impl S3Backend {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Result<Self> {
        let runtime = Runtime::new()?;
        Ok(S3Backend {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
            thresholds: StorageClassThresholds::default(),
            runtime,
        })
    }

    fn key(&self, remote_name: &str) -> String {
        if self.prefix.is_empty() {
            remote_name.to_string()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), remote_name)
        }
    }

    fn storage_class_for(&self, remote_name: &str, size: u64) -> StorageClass {
        if remote_name.starts_with("manifest") {
            return StorageClass::Standard;
        }
        let t = &self.thresholds;
        if size >= t.deep_archive {
            StorageClass::DeepArchive
        } else if size >= t.glacier {
            StorageClass::Glacier
        } else if size >= t.one_zone_ia {
            StorageClass::OnezoneIa
        } else if size >= t.infrequent_access {
            StorageClass::StandardIa
        } else {
            StorageClass::Standard
        }
    }
}

impl BackendDriver for S3Backend {
    fn save(&self, local_path: &Path, remote_name: &str) -> Result<()> {
        let size = std::fs::metadata(local_path)?.len();
        let storage_class = self.storage_class_for(remote_name, size);
        let key = self.key(remote_name);
        let local_path = local_path.to_path_buf();

        self.runtime.block_on(async {
            let body = ByteStream::from_path(&local_path)
                .await
                .map_err(|e| BackupError::BackupCorrupted(format!("could not read staging file: {e}")))?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .storage_class(storage_class)
                .body(body)
                .send()
                .await
                .map_err(|e| BackupError::BackupCorrupted(format!("s3 put_object failed: {e}")))?;
            Ok::<_, BackupError>(())
        })
    }

    fn load(&self, remote_name: &str, out: &StreamHandle) -> Result<()> {
        let key = self.key(remote_name);
        let scope = out.open()?;
        let mut writer = scope.writer();

        self.runtime.block_on(async {
            let mut resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| BackupError::BackupCorrupted(format!("s3 get_object failed for {key}: {e}")))?;
            while let Some(chunk) = resp
                .body
                .next()
                .await
                .transpose()
                .map_err(|e| BackupError::BackupCorrupted(format!("s3 stream error: {e}")))?
            {
                writer.write_block(&chunk)?;
            }
            Ok::<_, BackupError>(())
        })
    }

    fn query(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.key(prefix);
        self.runtime.block_on(async {
            let mut names = Vec::new();
            let mut continuation = None;
            loop {
                let mut req = self.client.list_objects_v2().bucket(&self.bucket).prefix(&full_prefix);
                if let Some(token) = continuation.take() {
                    req = req.continuation_token(token);
                }
                let resp = req
                    .send()
                    .await
                    .map_err(|e| BackupError::BackupCorrupted(format!("s3 list_objects_v2 failed: {e}")))?;
                for obj in resp.contents() {
                    if let Some(key) = obj.key() {
                        let stripped = if self.prefix.is_empty() {
                            key.to_string()
                        } else {
                            key.trim_start_matches(&format!("{}/", self.prefix.trim_end_matches('/'))).to_string()
                        };
                        names.push(stripped);
                    }
                }
                if resp.is_truncated().unwrap_or(false) {
                    continuation = resp.next_continuation_token().map(|s| s.to_string());
                } else {
                    break;
                }
            }
            Ok(names)
        })
    }

    fn delete(&self, remote_name: &str) -> Result<()> {
        let key = self.key(remote_name);
        self.runtime.block_on(async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| BackupError::BackupCorrupted(format!("s3 delete_object failed: {e}")))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_class_thresholds_pick_colder_tiers_for_bigger_blobs() {
        let backend_thresholds = StorageClassThresholds::default();
        assert!(matches!(
            pick(&backend_thresholds, "ab/cd/ef", 1024),
            StorageClass::Standard
        ));
        assert!(matches!(
            pick(&backend_thresholds, "ab/cd/ef", backend_thresholds.deep_archive + 1),
            StorageClass::DeepArchive
        ));
    }

    #[test]
    fn manifests_always_stay_in_hot_storage() {
        let t = StorageClassThresholds::default();
        assert!(matches!(pick(&t, "manifest.123", t.deep_archive + 1), StorageClass::Standard));
    }

    fn pick(t: &StorageClassThresholds, remote_name: &str, size: u64) -> StorageClass {
        if remote_name.starts_with("manifest") {
            return StorageClass::Standard;
        }
        if size >= t.deep_archive {
            StorageClass::DeepArchive
        } else if size >= t.glacier {
            StorageClass::Glacier
        } else if size >= t.one_zone_ia {
            StorageClass::OnezoneIa
        } else if size >= t.infrequent_access {
            StorageClass::StandardIa
        } else {
            StorageClass::Standard
        }
    }
}
