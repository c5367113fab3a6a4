use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_STAGING_ID: AtomicU64 = AtomicU64::new(0);

/// Staging file that is removed on drop unless it was moved into place.
struct Staged {
    path: PathBuf,
    committed: bool,
}

impl Staged {
    fn next_to(target: &Path) -> Self {
        let name = target.file_name().map_or_else(
            || "out".into(),
            |n| n.to_string_lossy().into_owned(),
        );
        let id = NEXT_STAGING_ID.fetch_add(1, Ordering::Relaxed);
        let staging = format!(".{name}.{}-{id}.partial", std::process::id());
        Self {
            path: target.with_file_name(staging),
            committed: false,
        }
    }

    fn commit(mut self, target: &Path) -> io::Result<()> {
        if let Err(e) = fs::rename(&self.path, target) {
            // Windows refuses to rename over an existing file.
            if !cfg!(windows) {
                return Err(e);
            }
            fs::copy(&self.path, target)?;
            return Ok(());
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Write `bytes` to `path` so readers see either the old or the new content.
///
/// The bytes land in a staging file beside `path` and are renamed over it.
/// Missing parent directories are created.
///
/// # Errors
/// Returns an error if the directory cannot be created or the write or rename fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let staged = Staged::next_to(path);
    let mut file = fs::File::create(&staged.path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    staged.commit(path)
}
