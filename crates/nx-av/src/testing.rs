//! Helpers for tests that stand in shell scripts for external tools.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Write an executable `#!/bin/sh` script named `name` into `dir`.
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
