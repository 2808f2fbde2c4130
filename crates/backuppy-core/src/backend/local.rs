//! Local filesystem backend driver: `save` is a `rename`, grounded directly
//! on the reference implementation's `LocalBackupStore`.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::BackendDriver;
use crate::error::Result;
use crate::io::StreamHandle;

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalBackend { root: root.into() }
    }

    fn resolve(&self, remote_name: &str) -> PathBuf {
        self.root.join(remote_name)
    }
}

impl BackendDriver for LocalBackend {
    fn save(&self, local_path: &Path, remote_name: &str) -> Result<()> {
        let dest = self.resolve(remote_name);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(local_path, &dest)?;
        Ok(())
    }

    fn load(&self, remote_name: &str, out: &StreamHandle) -> Result<()> {
        let src = self.resolve(remote_name);
        let mut file = std::fs::File::open(&src)?;
        let scope = out.open()?;
        let mut writer = scope.writer();
        use std::io::Read;
        let mut buf = vec![0u8; crate::io::BLOCK_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_block(&buf[..n])?;
        }
        Ok(())
    }

    fn query(&self, prefix: &str) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.root).into_iter() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&self.root).expect("entry under root");
            let rel_str = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
            if rel_str.starts_with(prefix) {
                out.push(rel_str);
            }
        }
        Ok(out)
    }

    fn delete(&self, remote_name: &str) -> Result<()> {
        let path = self.resolve(remote_name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips_content() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());

        let staging = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(staging.path(), b"blob bytes").unwrap();
        backend.save(staging.path(), "ab/cd/ef0123").unwrap();

        let out = StreamHandle::anonymous();
        backend.load("ab/cd/ef0123", &out).unwrap();
        let scope = out.open().unwrap();
        let content: Vec<u8> = scope
            .reader(None, true)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(content, b"blob bytes");
    }

    #[test]
    fn query_matches_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        for name in ["manifest.1", "manifest.2", "ab/cd/ef"] {
            let staging = tempfile::NamedTempFile::new().unwrap();
            backend.save(staging.path(), name).unwrap();
        }
        let mut found = backend.query("manifest.").unwrap();
        found.sort();
        assert_eq!(found, vec!["manifest.1", "manifest.2"]);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.delete("never/existed").unwrap();
    }
}
