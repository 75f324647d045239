//! Temp-file naming for per-round bucket and key streams.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tempfile::TempDir;

/// Source of fresh, unused stream paths.
pub trait TempFileNamer: Sync {
    fn next_path(&self) -> PathBuf;
}

/// Issues numbered names inside a private temporary directory, which is removed
/// (with anything left in it) when the namer is dropped.
pub struct TempDirNamer {
    dir: TempDir,
    counter: AtomicU64,
}

impl TempDirNamer {
    /// Temporary directory under the system default location.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self::from_dir(TempDir::new()?))
    }

    /// Temporary directory under `base`, created if missing.
    pub fn new_in(base: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(base)?;
        Ok(Self::from_dir(TempDir::new_in(base)?))
    }

    fn from_dir(dir: TempDir) -> Self {
        TempDirNamer {
            dir,
            counter: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl TempFileNamer for TempDirNamer {
    fn next_path(&self) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.dir.path().join(format!("rls_{n:08}.rls"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_and_cleaned_up() {
        let namer = TempDirNamer::new().unwrap();
        let a = namer.next_path();
        let b = namer.next_path();
        assert_ne!(a, b);
        assert!(a.starts_with(namer.path()));
        std::fs::write(&a, b"x").unwrap();
        let root = namer.path().to_path_buf();
        drop(namer);
        assert!(!root.exists());
    }
}
