use anyhow::{Context, Result};
use std::path::Path;
use std::{fs, thread, time::Duration};

/// I/O utility functions mapping `IOUtil.cs`.
pub struct IOUtil;

impl IOUtil {
    /// Recursively delete a directory with retry logic.
    ///
    /// If the initial removal fails (e.g. due to transient locks), the function
    /// retries up to 3 times with a small delay between attempts.
    pub fn delete_directory(path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        // If it's a symlink, just remove the link itself
        if path.symlink_metadata()?.file_type().is_symlink() {
            #[cfg(unix)]
            {
                fs::remove_file(path)
                    .with_context(|| format!("Failed to remove symlink '{}'", path.display()))?;
            }
            #[cfg(windows)]
            {
                // On Windows, symlinks to directories are removed with remove_dir
                if path.is_dir() {
                    fs::remove_dir(path).with_context(|| {
                        format!("Failed to remove directory symlink '{}'", path.display())
                    })?;
                } else {
                    fs::remove_file(path).with_context(|| {
                        format!("Failed to remove file symlink '{}'", path.display())
                    })?;
                }
            }
            return Ok(());
        }

        let max_retries = 3;
        let mut last_err = None;

        for attempt in 0..max_retries {
            // Try to remove read-only attributes on files before deletion
            if let Err(e) = Self::remove_readonly_recursive(path) {
                tracing::debug!(
                    "Failed to remove readonly attributes (attempt {}): {}",
                    attempt + 1,
                    e
                );
            }

            match fs::remove_dir_all(path) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < max_retries - 1 {
                        thread::sleep(Duration::from_millis(100 * (attempt as u64 + 1)));
                    }
                }
            }
        }

        Err(last_err.unwrap()).with_context(|| {
            format!(
                "Failed to delete directory '{}' after {} retries",
                path.display(),
                max_retries
            )
        })
    }

    /// Recursively attempt to remove the read-only attribute from all items
    /// in a directory tree.
    fn remove_readonly_recursive(path: &Path) -> Result<()> {
        if path.is_file() {
            Self::remove_readonly(path)?;
            return Ok(());
        }

        if !path.is_dir() {
            return Ok(());
        }

        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let entry_path = entry.path();
            if entry_path.is_dir() {
                Self::remove_readonly_recursive(&entry_path)?;
            } else {
                Self::remove_readonly(&entry_path)?;
            }
        }
        Self::remove_readonly(path)?;
        Ok(())
    }

    /// Remove the read-only attribute from a single file-system entry.
    fn remove_readonly(path: &Path) -> Result<()> {
        let meta = match fs::metadata(path) {
            Ok(m) => m,
            Err(_) => return Ok(()),
        };
        let mut perms = meta.permissions();
        if perms.readonly() {
            perms.set_readonly(false);
            fs::set_permissions(path, perms)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_directory_missing_is_ok() {
        let result = IOUtil::delete_directory(Path::new("/tmp/nonexistent_batchexec_sdk_test_xyz"));
        assert!(result.is_ok());
    }

    #[test]
    fn delete_directory_works() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("subdir");
        fs::create_dir_all(&inner).unwrap();
        fs::write(inner.join("file.txt"), b"data").unwrap();
        IOUtil::delete_directory(dir.path()).unwrap();
        assert!(!dir.path().exists());
    }
}
