//! No-follow file access for paths produced by [`PathSandbox`](super::PathSandbox).
//!
//! The sandbox validates path strings only; these helpers close the gap at
//! open time. Every directory between the workspace root and the file is
//! checked with `symlink_metadata` (and created one level at a time for
//! writes), and the file itself is opened with `O_NOFOLLOW`.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[cfg(unix)]
fn no_follow(opts: &mut OpenOptions) {
    opts.custom_flags(nix::fcntl::OFlag::O_NOFOLLOW.bits());
}

#[cfg(not(unix))]
fn no_follow(_opts: &mut OpenOptions) {}

fn symlink_refused() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "refusing to follow a symbolic link")
}

/// Fails with `InvalidInput` when `path` is a symlink. On unix `O_NOFOLLOW`
/// already enforces this at open; elsewhere it is the only guard.
async fn reject_symlink(path: &Path) -> io::Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.file_type().is_symlink() => Err(symlink_refused()),
        _ => Ok(()),
    }
}

/// Walk the directories from `root` down to `path`'s parent, refusing any
/// symlink on the way. With `create`, missing directories are made.
async fn walk_parents(root: &Path, path: &Path, create: bool) -> io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let relative = parent.strip_prefix(root).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "path is outside the workspace root")
    })?;
    let mut current = PathBuf::from(root);
    for component in relative.components() {
        current.push(component);
        match tokio::fs::symlink_metadata(&current).await {
            Ok(meta) if meta.file_type().is_symlink() => return Err(symlink_refused()),
            Ok(meta) if !meta.is_dir() => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("'{}' is not a directory", component.as_os_str().to_string_lossy()),
                ))
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound && create => {
                match tokio::fs::create_dir(&current).await {
                    Ok(()) => {}
                    // Lost a race with another writer; make sure it made a directory.
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        let meta = tokio::fs::symlink_metadata(&current).await?;
                        if meta.file_type().is_symlink() || !meta.is_dir() {
                            return Err(symlink_refused());
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Open `path` (under `root`) for reading.
pub async fn open_read(root: &Path, path: &Path) -> io::Result<File> {
    walk_parents(root, path, false).await?;
    reject_symlink(path).await?;
    let mut opts = OpenOptions::new();
    opts.read(true);
    no_follow(&mut opts);
    opts.open(path).await
}

pub async fn read_to_string(root: &Path, path: &Path) -> io::Result<String> {
    let mut file = open_read(root, path).await?;
    let mut content = String::new();
    file.read_to_string(&mut content).await?;
    Ok(content)
}

/// Create or truncate `path` and write `content`, creating parent directories.
pub async fn write(root: &Path, path: &Path, content: &[u8]) -> io::Result<()> {
    write_with(root, path, content, false).await
}

/// Like [`write`] but fails if `path` already exists.
pub async fn write_new(root: &Path, path: &Path, content: &[u8]) -> io::Result<()> {
    write_with(root, path, content, true).await
}

async fn write_with(root: &Path, path: &Path, content: &[u8], exclusive: bool) -> io::Result<()> {
    walk_parents(root, path, true).await?;
    reject_symlink(path).await?;
    let mut opts = OpenOptions::new();
    opts.write(true);
    if exclusive {
        opts.create_new(true);
    } else {
        opts.create(true).truncate(true);
    }
    no_follow(&mut opts);
    let mut file = opts.open(path).await?;
    file.write_all(content).await?;
    file.flush().await?;
    Ok(())
}
