//! Sparse primary disk image creation.
//!
//! The disk is a raw image of exactly the requested size. Only the file
//! length is set, so the filesystem allocates blocks lazily as the guest
//! writes them.

use std::fs::{self, File};
use std::path::Path;

use crate::error::{Error, Result};

/// Creates (or truncates) a sparse disk image of exactly `size` bytes.
///
/// The image is first written under a temporary name and renamed into
/// place, so an interrupted call never leaves a short `disk.img` behind.
pub fn create_sparse(path: &Path, size: u64) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = Path::new(&tmp_name);

    let file = File::create(tmp).map_err(|e| {
        Error::DiskCreationFailed(format!("cannot create {}: {e}", tmp.display()))
    })?;
    if let Err(e) = file.set_len(size) {
        drop(file);
        let _ = fs::remove_file(tmp);
        return Err(Error::DiskCreationFailed(format!(
            "cannot resize {} to {size} bytes: {e}",
            tmp.display()
        )));
    }
    drop(file);

    fs::rename(tmp, path).map_err(|e| {
        let _ = fs::remove_file(tmp);
        Error::DiskCreationFailed(format!("cannot move disk into {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_file_of_exact_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let size = 3 << 30;

        create_sparse(&path, size).unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), size);
        assert!(!dir.path().join("disk.img.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn allocation_is_sparse() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        create_sparse(&path, 1 << 30).unwrap();

        // 512-byte blocks actually allocated; far below the nominal size.
        let allocated = fs::metadata(&path).unwrap().blocks() * 512;
        assert!(allocated < 1 << 20, "allocated {allocated} bytes");
    }

    #[test]
    fn missing_parent_reports_disk_creation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("disk.img");
        match create_sparse(&path, 1024) {
            Err(Error::DiskCreationFailed(msg)) => assert!(msg.contains("cannot create")),
            other => panic!("expected DiskCreationFailed, got {other:?}"),
        }
    }
}
