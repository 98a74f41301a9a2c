//! Filesystem queries used for change detection.

use std::path::Path;
use std::time::SystemTime;

/// MTime info gathered for a file.  This also models "file is absent".
/// It's not using an Option<> just because it makes the code using it easier
/// to follow.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MTime {
    Missing,
    Stamp(SystemTime),
}

impl MTime {
    pub fn is_missing(&self) -> bool {
        matches!(self, MTime::Missing)
    }
}

/// What a stat() of a node's path found.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Stat {
    pub mtime: MTime,
    pub size: u64,
    pub is_dir: bool,
}

impl Stat {
    pub const MISSING: Stat = Stat {
        mtime: MTime::Missing,
        size: 0,
        is_dir: false,
    };

    pub fn exists(&self) -> bool {
        !self.mtime.is_missing()
    }
}

/// stat() an on-disk path.  A missing file is not an error.
pub fn stat(path: &Path) -> std::io::Result<Stat> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Stat {
            mtime: MTime::Stamp(meta.modified()?),
            size: if meta.is_dir() { 0 } else { meta.len() },
            is_dir: meta.is_dir(),
        }),
        Err(err) => {
            if err.kind() == std::io::ErrorKind::NotFound {
                Ok(Stat::MISSING)
            } else {
                Err(err)
            }
        }
    }
}

/// An immediate entry of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Lists the immediate entries of a directory, sorted by name so the result
/// doesn't depend on the platform's readdir order.
pub fn read_dir_sorted(path: &Path) -> std::io::Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: entry.file_type()?.is_dir(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Make sure the directory that will hold `path` exists.
pub fn create_parent_dirs(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
