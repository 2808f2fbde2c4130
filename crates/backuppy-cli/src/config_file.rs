//! YAML backup-set configuration loading. The core crate only defines the
//! typed shape (`backuppy_core::config::BackupSetConfig`); turning a file on
//! disk into one of those is this binary's job.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use backuppy_core::config::BackupSetConfig;
use serde::Deserialize;

/// Top-level shape of a config file: a `backups:` map keyed by backup-set
/// name, mirroring the original's `staticconf`-driven `backups.<name>.*`
/// namespacing.
#[derive(Debug, Deserialize)]
struct RootConfig {
    backups: BTreeMap<String, BackupSetConfig>,
}

pub fn load(path: &Path) -> Result<BTreeMap<String, BackupSetConfig>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let root: RootConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(root.backups)
}

pub fn load_one(path: &Path, name: &str) -> Result<BackupSetConfig> {
    let mut backups = load(path)?;
    backups
        .remove(name)
        .with_context(|| format!("no backup set named {name:?} in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_a_named_backup_set_from_yaml() {
        let yaml = "
backups:
  photos:
    directories: [/home/user/photos]
    exclusions: ['\\.tmp$']
    protocol:
      type: local
      location: /mnt/backup-store
    private_key_filename: /etc/backuppy/photos.pem
";
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backuppy.yaml");
        std::fs::write(&path, yaml).unwrap();

        let config = load_one(&path, "photos").unwrap();
        assert_eq!(config.directories, vec!["/home/user/photos".to_string()]);
        assert!(load_one(&path, "nope").is_err());
    }
}
