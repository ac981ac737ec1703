use std::fs;
use std::io;
use std::path::Path;

use tempfile::NamedTempFile;
use walkdir::WalkDir;

/// Runs `f`, turning a [`io::ErrorKind::NotFound`] error into `Ok(None)`.
///
/// Entries can disappear at any time when a concurrent cleanup runs, so most file system
/// accesses in the cache treat a missing file as a regular outcome.
pub fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

/// Atomically moves a fully written temporary file to `path`.
pub fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<fs::File> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::Other, "no parent directory to persist item")
    })?;

    // The cleanup sweep could remove the parent directory we are writing into, retry then.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(path = %parent.display(), "Failed to create directory: {:?}", e);
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(file) => return Ok(file),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(path = %path.display(), "Failed to persist file: {:?}", err);
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

/// Removes a directory and everything in it, treating a missing directory as success.
///
/// Returns `true` if something was removed.
pub fn remove_dir_all_if_exists(path: &Path) -> io::Result<bool> {
    Ok(catch_not_found(|| fs::remove_dir_all(path))?.is_some())
}

/// Removes a file, treating a missing file as success.
pub fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    Ok(catch_not_found(|| fs::remove_file(path))?.is_some())
}

/// Copies the directory tree at `from` into `to`, which is created if needed.
///
/// Symlinks are recreated, not followed.
pub fn copy_dir_all(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = to.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(from)?, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to).map(drop)
}

/// The total size in bytes of all files below `path`, not following symlinks.
pub fn directory_size(path: &Path) -> io::Result<u64> {
    let Some(entries) = catch_not_found(|| fs::read_dir(path))? else {
        return Ok(0);
    };
    let mut size = 0;
    for entry in entries {
        let entry = entry?;
        let Some(metadata) = catch_not_found(|| entry.path().symlink_metadata())? else {
            continue;
        };
        if metadata.is_dir() {
            size += directory_size(&entry.path())?;
        } else {
            size += metadata.len();
        }
    }
    Ok(size)
}
