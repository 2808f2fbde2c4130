//! Backend driver contract (§6.3): four blocking operations any storage
//! target must support. `local` and `s3` are the two concrete drivers; the
//! core otherwise only ever talks to `dyn BackendDriver`.

pub mod local;
pub mod s3;

use std::path::Path;

use crate::error::Result;
use crate::io::StreamHandle;

pub trait BackendDriver: Send + Sync {
    /// Move/upload so `remote_name` becomes atomically visible with the
    /// contents of `local_path`. Must not partially publish on failure.
    fn save(&self, local_path: &Path, remote_name: &str) -> Result<()>;

    /// Stream the blob named `remote_name` into `out`. A missing key is an
    /// error that bubbles up to the caller.
    fn load(&self, remote_name: &str, out: &StreamHandle) -> Result<()>;

    /// List all keys starting with `prefix`.
    fn query(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove a key. Missing keys are not an error.
    fn delete(&self, remote_name: &str) -> Result<()>;
}

pub use local::LocalBackend;
pub use s3::S3Backend;
