//! The artifact cache: derived files stored under their build signature, so
//! a target built once (here or by someone sharing the cache directory) can
//! be copied into place instead of rebuilt.
//!
//! Entries live at `<root>/<first hex digits>/<signature hex>`.  Each holds
//! a small header (magic, format version, payload checksum, file mode)
//! followed by the file's bytes; an entry that fails validation is reported
//! as corrupt rather than copied out.

use crate::sig::Signature;
use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Storage for built artifacts keyed by build signature.  Shared between
/// the workers, so it must tolerate concurrent calls.
pub trait ArtifactCache: Send + Sync {
    fn has(&self, sig: &Signature) -> bool;
    /// Copy the artifact for `sig` to `dest`.  Returns false on a miss; an
    /// entry that exists but can't be used is an error.
    fn fetch(&self, sig: &Signature, dest: &Path) -> anyhow::Result<bool>;
    /// Save `src` as the artifact for `sig`.  Storing a signature that's
    /// already present leaves the existing entry alone.
    fn store(&self, sig: &Signature, src: &Path) -> anyhow::Result<()>;
}

/// How the walker uses the cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOptions {
    /// Fetch from the cache but never store into it.
    pub readonly: bool,
    /// Store up-to-date targets that aren't in the cache yet.
    pub force: bool,
    /// Fail a node whose cache entry is corrupt instead of rebuilding it.
    pub strict: bool,
}

const ENTRY_MAGIC: [u8; 8] = *b"KEELART\0";
const ENTRY_VERSION: u32 = 1;
const HEADER_LEN: usize = 8 + 4 + 16 + 4;
const CONFIG_FILE: &str = "config";

/// Settings stored alongside the entries, so every user of a shared cache
/// directory lays it out the same way.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct CacheConfig {
    prefix_len: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig { prefix_len: 2 }
    }
}

/// A cache in a local (possibly shared) directory.
pub struct DirCache {
    root: PathBuf,
    prefix_len: usize,
}

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A path next to `path` that no other writer, in this process or
/// another, will pick.
fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(
        ".tmp.{}.{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    PathBuf::from(name)
}

fn write_then_rename(path: &Path, chunks: &[&[u8]]) -> std::io::Result<()> {
    let tmp = temp_sibling(path);
    let result = (|| {
        let mut f = std::fs::File::create(&tmp)?;
        for chunk in chunks {
            f.write_all(chunk)?;
        }
        drop(f);
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

impl DirCache {
    /// Open the cache at `root`, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|err| anyhow!("create cache dir {}: {}", root.display(), err))?;
        let config_path = root.join(CONFIG_FILE);
        let config = match std::fs::read(&config_path) {
            Ok(data) => serde_json::from_slice::<CacheConfig>(&data)
                .map_err(|err| anyhow!("read cache config {}: {}", config_path.display(), err))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let config = CacheConfig::default();
                let data = serde_json::to_vec_pretty(&config)?;
                write_then_rename(&config_path, &[&data])
                    .map_err(|err| anyhow!("write {}: {}", config_path.display(), err))?;
                config
            }
            Err(err) => bail!("read cache config {}: {}", config_path.display(), err),
        };
        if config.prefix_len == 0 || config.prefix_len > 8 {
            bail!(
                "cache config {}: prefix_len {} out of range",
                config_path.display(),
                config.prefix_len
            );
        }
        Ok(DirCache {
            root,
            prefix_len: config.prefix_len,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, sig: &Signature) -> PathBuf {
        let hex = sig.to_hex();
        self.root.join(&hex[..self.prefix_len]).join(hex)
    }
}

impl ArtifactCache for DirCache {
    fn has(&self, sig: &Signature) -> bool {
        self.entry_path(sig).is_file()
    }

    fn fetch(&self, sig: &Signature, dest: &Path) -> anyhow::Result<bool> {
        let path = self.entry_path(sig);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => bail!("read cache entry {}: {}", path.display(), err),
        };
        let (mode, payload) = decode_entry(&data)
            .map_err(|err| anyhow!("corrupt cache entry {}: {}", path.display(), err))?;
        crate::fs::create_parent_dirs(dest)?;
        write_then_rename(dest, &[payload])
            .map_err(|err| anyhow!("write {}: {}", dest.display(), err))?;
        set_file_mode(dest, mode)?;
        Ok(true)
    }

    fn store(&self, sig: &Signature, src: &Path) -> anyhow::Result<()> {
        let path = self.entry_path(sig);
        if path.is_file() {
            return Ok(());
        }
        let payload =
            std::fs::read(src).map_err(|err| anyhow!("read {}: {}", src.display(), err))?;
        let mode = file_mode(&std::fs::metadata(src)?);
        let header = encode_header(&payload, mode);
        crate::fs::create_parent_dirs(&path)?;
        write_then_rename(&path, &[&header, &payload])
            .map_err(|err| anyhow!("write cache entry {}: {}", path.display(), err))?;
        Ok(())
    }
}

fn encode_header(payload: &[u8], mode: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(&ENTRY_MAGIC);
    header.extend_from_slice(&ENTRY_VERSION.to_le_bytes());
    header.extend_from_slice(Signature::from_bytes(payload).as_raw());
    header.extend_from_slice(&mode.to_le_bytes());
    header
}

/// Validate an entry, returning its file mode and payload.
fn decode_entry(data: &[u8]) -> anyhow::Result<(u32, &[u8])> {
    if data.len() < HEADER_LEN || data[..8] != ENTRY_MAGIC {
        bail!("bad header");
    }
    let mut word = [0u8; 4];
    word.copy_from_slice(&data[8..12]);
    let version = u32::from_le_bytes(word);
    if version != ENTRY_VERSION {
        bail!("format version {} (expected {})", version, ENTRY_VERSION);
    }
    let payload = &data[HEADER_LEN..];
    if Signature::from_bytes(payload).as_raw()[..] != data[12..28] {
        bail!("checksum mismatch");
    }
    word.copy_from_slice(&data[28..32]);
    Ok((u32::from_le_bytes(word), payload))
}
