use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{BackupError, Result};

/// Per-backup-set options (§6.5). These are authoritative: there is no
/// separate global enable/disable layer sitting on top of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    pub use_encryption: bool,
    pub use_compression: bool,
    pub max_manifest_versions: Option<u32>,
    pub discard_diff_percentage: Option<f64>,
    pub skip_diff_patterns: Vec<String>,
    pub private_key_filename: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            use_encryption: true,
            use_compression: true,
            max_manifest_versions: Some(10),
            discard_diff_percentage: None,
            skip_diff_patterns: Vec::new(),
            private_key_filename: String::new(),
        }
    }
}

impl StoreOptions {
    pub fn skip_diff_regexes(&self) -> std::result::Result<Vec<Regex>, regex::Error> {
        self.skip_diff_patterns.iter().map(|p| Regex::new(p)).collect()
    }

    pub fn matches_skip_diff(&self, abs_file_name: &str) -> bool {
        self.skip_diff_regexes()
            .map(|regexes| regexes.iter().any(|r| r.is_match(abs_file_name)))
            .unwrap_or(false)
    }
}

/// One named backup set: where to read from, what to skip, and where it's
/// stored. Loading this from a YAML file on disk is `backuppy-cli`'s job
/// (config *file* loading is out of scope for the core); this struct is
/// just the typed shape the CLI deserializes into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSetConfig {
    pub directories: Vec<String>,
    #[serde(default)]
    pub exclusions: Vec<String>,
    pub protocol: RawProtocolConfig,
    #[serde(flatten)]
    pub options: StoreOptions,
}

/// The `protocol:` block exactly as it appears in YAML: a free-form `type`
/// string plus every field any protocol might need. Deserializing this way
/// (rather than as a `#[serde(tag = "type")]` enum) means an unrecognised
/// `type` parses fine and is only rejected by `resolve`, which reports it as
/// `BackupError::UnknownProtocol` the way spec.md §7 calls for ("reported at
/// startup") instead of as an opaque YAML parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawProtocolConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub region: Option<String>,
}

impl RawProtocolConfig {
    /// Validate `kind` against the backends this crate actually implements
    /// and produce the typed variant `backuppy-cli` dispatches on to build a
    /// backend driver. `ssh` is named in the original this mirrors but was
    /// never implemented there either, so it has no variant here and is
    /// rejected like any other unrecognised type.
    pub fn resolve(&self) -> Result<ProtocolConfig> {
        match self.kind.as_str() {
            "local" => Ok(ProtocolConfig::Local {
                location: self.location.clone().unwrap_or_default(),
            }),
            "s3" => Ok(ProtocolConfig::S3 {
                bucket: self.bucket.clone().unwrap_or_default(),
                prefix: self.prefix.clone(),
                region: self.region.clone(),
            }),
            other => Err(BackupError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Where a backup set's blobs live, validated from a `RawProtocolConfig`.
#[derive(Debug, Clone)]
pub enum ProtocolConfig {
    Local { location: String },
    S3 { bucket: String, prefix: String, region: Option<String> },
}
