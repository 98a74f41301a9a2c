//! The signature store: for each target, what its last successful build
//! saw.  Used to decide which targets are up to date.
//!
//! On disk it is a single file holding a header and every record, rewritten
//! atomically on flush.  Anything unreadable (wrong version, truncated,
//! checksum mismatch) is dropped with a warning and the build continues as
//! if nothing had been built before.

use crate::fs::MTime;
use crate::sig::{SigHasher, Signature};
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

const MAGIC: &[u8; 6] = b"keeldb";
const VERSION: u32 = 1;

/// What was observed of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub mtime: MTime,
    pub size: u64,
    /// Content signature, when the build computed one.
    pub csig: Option<Signature>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRecord {
    pub name: String,
    pub info: FileInfo,
}

/// Everything remembered about a target's last successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    pub action_sig: Signature,
    /// The cache key the build was computed under, if it was computed.
    pub build_sig: Option<Signature>,
    /// Signature-affecting inputs, in order.
    pub children: Vec<ChildRecord>,
    /// Inputs the action reported through its depfile.  Scanned inputs are
    /// recomputed every walk, but these are only known after running.
    pub depfile_deps: Vec<String>,
    pub target: Option<FileInfo>,
    pub recorded_at: SystemTime,
}

struct Inner {
    records: FxHashMap<String, BuildRecord>,
    dirty: bool,
}

/// Persistent map of target name to BuildRecord.  Safe to share between
/// threads; writes are buffered in memory until `flush`.
pub struct SignatureStore {
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl SignatureStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        SignatureStore {
            path: None,
            inner: Mutex::new(Inner {
                records: FxHashMap::default(),
                dirty: false,
            }),
        }
    }

    /// Load the store at `path`.  A missing file is an empty store; an
    /// unreadable one is also an empty store, along with the reason it
    /// couldn't be read.
    pub fn open(path: impl Into<PathBuf>) -> (Self, Option<anyhow::Error>) {
        let path = path.into();
        let (records, warning) = match std::fs::read(&path) {
            Ok(data) => match decode(&data) {
                Ok(records) => (records, None),
                Err(err) => (
                    FxHashMap::default(),
                    Some(anyhow!("ignoring {}: {}", path.display(), err)),
                ),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                (FxHashMap::default(), None)
            }
            Err(err) => (
                FxHashMap::default(),
                Some(anyhow!("ignoring {}: {}", path.display(), err)),
            ),
        };
        let store = SignatureStore {
            path: Some(path),
            inner: Mutex::new(Inner {
                records,
                dirty: false,
            }),
        };
        (store, warning)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock can't leave a half-written record.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_record(&self, target: &str) -> Option<BuildRecord> {
        self.lock().records.get(target).cloned()
    }

    pub fn set_record(&self, target: &str, record: BuildRecord) {
        let mut inner = self.lock();
        inner.records.insert(target.to_string(), record);
        inner.dirty = true;
    }

    pub fn remove_record(&self, target: &str) {
        let mut inner = self.lock();
        if inner.records.remove(target).is_some() {
            inner.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write any changes to disk.  The file is replaced by rename, so a
    /// crash mid-write leaves the previous contents intact.
    pub fn flush(&self) -> anyhow::Result<()> {
        let mut inner = self.lock();
        let path = match &self.path {
            Some(path) if inner.dirty => path,
            _ => return Ok(()),
        };
        let data = encode(&inner.records);
        write_atomic(path, &data)
            .map_err(|err| anyhow!("write {}: {}", path.display(), err))?;
        inner.dirty = false;
        Ok(())
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    crate::fs::create_parent_dirs(path)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

struct BWriter {
    buf: Vec<u8>,
}

impl BWriter {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }
    fn sig(&mut self, sig: &Signature) {
        self.buf.extend_from_slice(sig.as_raw());
    }
    fn opt_sig(&mut self, sig: &Option<Signature>) {
        match sig {
            None => self.u8(0),
            Some(sig) => {
                self.u8(1);
                self.sig(sig);
            }
        }
    }
    fn time(&mut self, t: SystemTime) {
        let since = t.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
        self.u64(since.as_secs());
        self.u32(since.subsec_nanos());
    }
    fn mtime(&mut self, mtime: MTime) {
        match mtime {
            MTime::Missing => self.u8(0),
            MTime::Stamp(t) => {
                self.u8(1);
                self.time(t);
            }
        }
    }
    fn info(&mut self, info: &FileInfo) {
        self.mtime(info.mtime);
        self.u64(info.size);
        self.opt_sig(&info.csig);
    }
}

fn encode(records: &FxHashMap<String, BuildRecord>) -> Vec<u8> {
    let mut w = BWriter { buf: Vec::new() };
    w.buf.extend_from_slice(MAGIC);
    w.u32(VERSION);
    // Sorted so identical stores produce identical files.
    let mut names: Vec<&String> = records.keys().collect();
    names.sort();
    w.u32(names.len() as u32);
    for name in names {
        let rec = &records[name];
        w.str(name);
        w.sig(&rec.action_sig);
        w.opt_sig(&rec.build_sig);
        w.time(rec.recorded_at);
        match &rec.target {
            None => w.u8(0),
            Some(info) => {
                w.u8(1);
                w.info(info);
            }
        }
        w.u32(rec.children.len() as u32);
        for child in &rec.children {
            w.str(&child.name);
            w.info(&child.info);
        }
        w.u32(rec.depfile_deps.len() as u32);
        for dep in &rec.depfile_deps {
            w.str(dep);
        }
    }
    let mut hasher = SigHasher::default();
    hasher.write_bytes(&w.buf);
    let checksum = hasher.finish();
    w.sig(&checksum);
    w.buf
}

struct BReader<'a> {
    buf: &'a [u8],
    ofs: usize,
}

impl<'a> BReader<'a> {
    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        if self.buf.len() - self.ofs < n {
            bail!("truncated at offset {}", self.ofs);
        }
        let slice = &self.buf[self.ofs..self.ofs + n];
        self.ofs += n;
        Ok(slice)
    }
    fn u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.take(1)?[0])
    }
    fn u32(&mut self) -> anyhow::Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }
    fn u64(&mut self) -> anyhow::Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }
    fn str(&mut self) -> anyhow::Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        Ok(std::str::from_utf8(bytes)?.to_string())
    }
    fn sig(&mut self) -> anyhow::Result<Signature> {
        let mut raw = [0u8; 16];
        raw.copy_from_slice(self.take(16)?);
        Ok(Signature::from_raw(raw))
    }
    fn flag(&mut self) -> anyhow::Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => bail!("bad flag byte {} at offset {}", other, self.ofs - 1),
        }
    }
    fn opt_sig(&mut self) -> anyhow::Result<Option<Signature>> {
        Ok(if self.flag()? { Some(self.sig()?) } else { None })
    }
    fn time(&mut self) -> anyhow::Result<SystemTime> {
        let secs = self.u64()?;
        let nanos = self.u32()?;
        SystemTime::UNIX_EPOCH
            .checked_add(Duration::new(secs, nanos))
            .ok_or_else(|| anyhow!("timestamp out of range"))
    }
    fn mtime(&mut self) -> anyhow::Result<MTime> {
        Ok(if self.flag()? {
            MTime::Stamp(self.time()?)
        } else {
            MTime::Missing
        })
    }
    fn info(&mut self) -> anyhow::Result<FileInfo> {
        Ok(FileInfo {
            mtime: self.mtime()?,
            size: self.u64()?,
            csig: self.opt_sig()?,
        })
    }
}

fn decode(data: &[u8]) -> anyhow::Result<FxHashMap<String, BuildRecord>> {
    if data.len() < MAGIC.len() + 4 + 16 || &data[..MAGIC.len()] != MAGIC {
        bail!("not a signature store");
    }
    let (body, checksum) = data.split_at(data.len() - 16);
    let mut r = BReader { buf: body, ofs: MAGIC.len() };
    let version = r.u32()?;
    if version != VERSION {
        bail!("format version {} (expected {})", version, VERSION);
    }
    let mut hasher = SigHasher::default();
    hasher.write_bytes(body);
    if hasher.finish().as_raw()[..] != checksum[..] {
        bail!("checksum mismatch");
    }

    let count = r.u32()?;
    let mut records = FxHashMap::default();
    for _ in 0..count {
        let name = r.str()?;
        let action_sig = r.sig()?;
        let build_sig = r.opt_sig()?;
        let recorded_at = r.time()?;
        let target = if r.flag()? { Some(r.info()?) } else { None };
        let nchildren = r.u32()?;
        let mut children = Vec::new();
        for _ in 0..nchildren {
            let name = r.str()?;
            let info = r.info()?;
            children.push(ChildRecord { name, info });
        }
        let ndeps = r.u32()?;
        let mut depfile_deps = Vec::new();
        for _ in 0..ndeps {
            depfile_deps.push(r.str()?);
        }
        records.insert(
            name,
            BuildRecord {
                action_sig,
                build_sig,
                children,
                depfile_deps,
                target,
                recorded_at,
            },
        );
    }
    if r.ofs != body.len() {
        bail!("{} trailing bytes", body.len() - r.ofs);
    }
    Ok(records)
}
