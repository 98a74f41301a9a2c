//! Signatures: content hashes of files, directories and actions, and the
//! composite build signature used as the artifact cache key.
//!
//! Everything is XXH3-128 over a fixed byte encoding, so a signature computed
//! on one machine matches the same inputs on another.

use std::fmt;
use std::io::Read;
use std::path::Path;
use xxhash_rust::xxh3::Xxh3;

/// A 128-bit content signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature([u8; 16]);

impl Signature {
    pub fn from_bytes(data: &[u8]) -> Self {
        Signature(xxhash_rust::xxh3::xxh3_128(data).to_le_bytes())
    }

    pub fn from_raw(raw: [u8; 16]) -> Self {
        Signature(raw)
    }

    pub fn as_raw(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 32 {
            return None;
        }
        let mut raw = [0u8; 16];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        Some(Signature(raw))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2])
    }
}

const UNIT_SEPARATOR: u8 = 0x1F;

/// Streaming hasher with helpers for the length-safe encodings we need.
/// Strings are written followed by a separator so that ("ab", "c") and
/// ("a", "bc") hash differently.
pub struct SigHasher(Xxh3);

impl Default for SigHasher {
    fn default() -> Self {
        SigHasher(Xxh3::new())
    }
}

impl SigHasher {
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn write_string(&mut self, s: &str) {
        self.0.update(s.as_bytes());
        self.write_separator();
    }

    pub fn write_sig(&mut self, sig: &Signature) {
        self.0.update(&sig.0);
    }

    /// Writes an optional signature; absence is distinct from every present value.
    pub fn write_opt_sig(&mut self, sig: Option<&Signature>) {
        match sig {
            None => self.0.update(&[0]),
            Some(sig) => {
                self.0.update(&[1]);
                self.write_sig(sig);
            }
        }
    }

    pub fn write_separator(&mut self) {
        self.0.update(&[UNIT_SEPARATOR]);
    }

    pub fn finish(&self) -> Signature {
        Signature(self.0.digest128().to_le_bytes())
    }
}

/// Hashes a file's content, streaming it rather than reading it whole.
pub fn file_signature(path: &Path) -> std::io::Result<Signature> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = SigHasher::default();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_bytes(&buf[..n]);
    }
    Ok(hasher.finish())
}

/// Marker hashed in place of a sub-directory's content.  Directory
/// signatures only cover immediate entries.
const SUBDIR_MARKER: &[u8] = b"<dir>";

/// Hashes a directory as its sorted immediate entries: (name, content
/// signature) for files and (name, marker) for sub-directories.  Adding,
/// removing or editing an entry changes the signature.
pub fn dir_signature(path: &Path) -> std::io::Result<Signature> {
    let mut hasher = SigHasher::default();
    for entry in crate::fs::read_dir_sorted(path)? {
        hasher.write_string(&entry.name);
        if entry.is_dir {
            hasher.write_bytes(SUBDIR_MARKER);
        } else {
            hasher.write_sig(&file_signature(&path.join(&entry.name))?);
        }
        hasher.write_separator();
    }
    Ok(hasher.finish())
}

/// Signature identifying an action, computed from its signature text.
pub fn action_signature(text: &str) -> Signature {
    let mut hasher = SigHasher::default();
    hasher.write_string(text);
    hasher.finish()
}

/// The composite build signature: action signature plus the content
/// signatures of every input, in order.  It deliberately leaves out every
/// name, target and input alike, so that equivalent builds of differently
/// named nodes share an artifact cache entry.
pub fn build_signature<'a>(
    action: &Signature,
    inputs: impl IntoIterator<Item = Option<&'a Signature>>,
) -> Signature {
    let mut hasher = SigHasher::default();
    hasher.write_sig(action);
    hasher.write_separator();
    for input in inputs {
        hasher.write_opt_sig(input);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let sig = Signature::from_bytes(b"hello");
        let hex = sig.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(Signature::from_hex(&hex), Some(sig));
        assert_eq!(Signature::from_hex("zz"), None);
    }

    #[test]
    fn streaming_matches_oneshot() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f");
        let content = vec![7u8; 200_000];
        std::fs::write(&path, &content)?;
        let mut hasher = SigHasher::default();
        hasher.write_bytes(&content);
        assert_eq!(file_signature(&path)?, hasher.finish());
        Ok(())
    }

    #[test]
    fn build_signature_is_order_sensitive() {
        let action = action_signature("cc");
        let a = Signature::from_bytes(b"a");
        let b = Signature::from_bytes(b"b");
        let ab = build_signature(&action, [Some(&a), Some(&b)]);
        let ba = build_signature(&action, [Some(&b), Some(&a)]);
        assert_ne!(ab, ba);
        assert_eq!(ab, build_signature(&action, [Some(&a), Some(&b)]));
        assert_ne!(ab, build_signature(&action, [Some(&a), None]));
    }

    #[test]
    fn dir_signature_tracks_entries() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("a"), "1")?;
        let first = dir_signature(dir.path())?;
        assert_eq!(first, dir_signature(dir.path())?);

        std::fs::write(dir.path().join("b"), "2")?;
        let added = dir_signature(dir.path())?;
        assert_ne!(first, added);

        std::fs::write(dir.path().join("a"), "changed")?;
        assert_ne!(added, dir_signature(dir.path())?);

        // Contents of sub-directories don't participate.
        std::fs::create_dir(dir.path().join("sub"))?;
        let with_sub = dir_signature(dir.path())?;
        std::fs::write(dir.path().join("sub/x"), "deep")?;
        assert_eq!(with_sub, dir_signature(dir.path())?);
        Ok(())
    }
}
