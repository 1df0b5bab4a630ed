use std::{fs, path::PathBuf};

/// Absolute path of a fixture checked in under the crate root. The file is
/// included at compile time so a missing fixture fails the build, not the
/// test run.
#[macro_export]
macro_rules! fixture_path {
    ($relative:expr) => {{
        let _ = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), $relative));
        concat!(env!("CARGO_MANIFEST_DIR"), $relative)
    }};
}

/// Path under the crate root a test may write to. Parent directories are
/// created.
pub fn fixture_output(relative: &str) -> PathBuf {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(relative);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    path
}
