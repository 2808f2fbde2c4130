use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use walkdir::WalkDir;

use crate::error::{BackupError, Result};

/// `sha[0:2]/sha[2:4]/sha[4:]`, the store-side name of a content-addressed
/// blob (§3.1).
pub fn sha_to_path(sha: &str) -> PathBuf {
    PathBuf::from(&sha[0..2]).join(&sha[2..4]).join(&sha[4..])
}

pub fn get_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("backuppy")
}

/// Format/parse the millisecond timestamps used for `manifest.<ts>` and
/// `manifest-key.<ts>` object names. A fixed-width integer avoids the
/// lexicographic-ordering pitfall a floating-point `time.time()` suffix would
/// create (see SPEC_FULL.md §16).
pub fn format_time_ms(ms: i64) -> String {
    format!("{ms:020}")
}

pub fn parse_time_ms(s: &str) -> Result<i64> {
    s.trim()
        .parse::<i64>()
        .map_err(|e| BackupError::InputParseError(format!("bad timestamp {s:?}: {e}")))
}

/// One entry yielded by `file_walker`: an absolute path to a regular file
/// that survived every exclusion pattern.
pub struct WalkEntry {
    pub path: PathBuf,
}

/// Walk `root`, applying `exclude` regexes against both directory and file
/// names (matched against the full path, per the original's behaviour), and
/// yield surviving files in randomised order so that a crash partway through
/// a run doesn't always starve the same tail of the tree.
///
/// `seed`, when given, makes the shuffle reproducible for tests; absent, an
/// OS-seeded RNG is used.
pub fn file_walker(root: &Path, exclude: &[Regex], seed: Option<u64>) -> Result<Vec<WalkEntry>> {
    let mut rng: StdRng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };

    let mut dirs_and_files: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).into_iter() {
        let entry = entry?;
        let path = entry.path();
        let path_str = path.to_string_lossy();
        if exclude.iter().any(|re| re.is_match(&path_str)) {
            continue;
        }
        if entry.file_type().is_file() {
            dirs_and_files.push(path.to_path_buf());
        }
    }
    dirs_and_files.shuffle(&mut rng);
    Ok(dirs_and_files.into_iter().map(|path| WalkEntry { path }).collect())
}
