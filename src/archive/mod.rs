use std::fs;
use std::io;
use std::path::Path;

use log::{debug, info};
use zip::read::ZipArchive;

use crate::error::{Result, SyncError};

/// Extract `archive_path` into a fresh `dest`. Any previous content of `dest`
/// is removed first; on failure `dest` is removed again so no half-extracted
/// tree survives. Entries whose names escape `dest` abort the extraction.
pub fn extract_zip(archive_path: &Path, dest: &Path) -> Result<usize> {
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::create_dir_all(dest)?;
    match extract_into(archive_path, dest) {
        Ok(count) => {
            info!("archive: extracted {count} files from {}", archive_path.display());
            Ok(count)
        }
        Err(err) => {
            let _ = fs::remove_dir_all(dest);
            Err(err)
        }
    }
}

fn extract_into(archive_path: &Path, dest: &Path) -> Result<usize> {
    let bad = |reason: String| SyncError::validation(archive_path, reason);
    let file = fs::File::open(archive_path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| bad(format!("zip parse error: {e}")))?;

    let mut files = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| bad(format!("zip entry error: {e}")))?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| bad(format!("zip entry {:?} escapes the target", entry.name())))?;
        let out_path = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out_file = fs::File::create(&out_path)?;
        io::copy(&mut entry, &mut out_file).map_err(|e| bad(format!("zip write error: {e}")))?;
        files += 1;
    }
    Ok(files)
}

/// Copy every file under `from` over the matching path under `to`,
/// creating directories as needed. Existing files are overwritten.
pub fn copy_tree(from: &Path, to: &Path) -> Result<usize> {
    fs::create_dir_all(to)?;
    let mut copied = 0;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&src_path, &dst_path)?;
        } else {
            debug!("archive: installing {}", dst_path.display());
            fs::copy(&src_path, &dst_path)?;
            copied += 1;
        }
    }
    Ok(copied)
}
