//! The bundle directory lifecycle.

use std::env;
use std::path::Path;

use tempfile::TempDir;
use tracing::{info, warn};

use staticx_core::Error;

/// Template prefix for bundle directories under the temp root.
const TEMPLATE_PREFIX: &str = "staticx-";

/// The private directory the embedded archive extracts into.
///
/// Lives under `$TMPDIR` (`/tmp` when unset or empty), named from a
/// collision-resistant template, created with exclusive semantics. The tree
/// is removed after the child exits unless `STATICX_KEEP_TEMPS` asks for
/// retention; removal problems are logged, never fatal. If the pipeline
/// errors out before [`BundleDir::finish`], the drop glue still removes the
/// tree best-effort.
pub struct BundleDir {
    dir: Option<TempDir>,
}

impl BundleDir {
    /// Create a fresh bundle directory under the temp root.
    pub fn create() -> Result<Self, Error> {
        // env::temp_dir() honors TMPDIR and treats empty as unset
        let root = env::temp_dir();
        let dir = tempfile::Builder::new()
            .prefix(TEMPLATE_PREFIX)
            .tempdir_in(root)?;
        Ok(Self { dir: Some(dir) })
    }

    /// Absolute path of the bundle directory.
    pub fn path(&self) -> &Path {
        self.dir
            .as_ref()
            .expect("bundle directory still open")
            .path()
    }

    /// Remove the tree, or keep it when `STATICX_KEEP_TEMPS` is set.
    pub fn finish(mut self) {
        let dir = self.dir.take().expect("bundle directory still open");
        if env::var_os("STATICX_KEEP_TEMPS").is_some() {
            let path = dir.keep();
            info!(path = %path.display(), "keeping bundle directory");
        } else if let Err(err) = dir.close() {
            warn!(%err, "failed to remove bundle directory");
        }
    }
}
