use std::path::{Path, PathBuf};

use rand::Rng;

/// Scratch space for one test under the system temp dir, deleted with everything in it on drop.
pub struct TestDirectory {
    /// Root of the scratch space.
    path: PathBuf,
}

impl TestDirectory {
    /// Creates a fresh, uniquely named directory.
    pub fn new() -> Self {
        let name: u128 = rand::thread_rng().gen();
        let path = std::env::temp_dir().join("feed-relayer-tests").join(format!("{name:032x}"));
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    /// A file (or directory) named `name` inside the scratch space. Nothing is created.
    pub fn file(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for TestDirectory {
    fn drop(&mut self) {
        // the test may already have failed; a leftover directory is harmless
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
