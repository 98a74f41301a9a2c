//! Path canonicalization.
//!
//! Node identities are lexical paths, so "foo/./bar.c" and "foo/bar.c" must
//! intern to the same node.  This never touches the disk.

/// Lexically canonicalize a path, removing redundant components.
/// Does not access the disk, but only simplifies things like
/// "foo/./bar" => "foo/bar" and "foo/../bar" => "bar".
/// These paths show up from variable expansion and from scanner results
/// joined onto a search directory.
pub fn canon_path<T: Into<String>>(inpath: T) -> String {
    let path: String = inpath.into();
    if path.is_empty() {
        return path;
    }
    let absolute = path.starts_with('/');
    let trailing_slash = path.len() > 1 && (path.ends_with('/') || path.ends_with("/."));

    // Offsets of components we may pop with "..".  Leading ".." components
    // of a relative path can't be popped, so they're tracked separately.
    let mut components: Vec<&str> = Vec::new();
    let mut leading_parents = 0;
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if components.pop().is_none() && !absolute {
                    leading_parents += 1;
                }
            }
            c => components.push(c),
        }
    }

    let mut out = String::with_capacity(path.len());
    if absolute {
        out.push('/');
    }
    for _ in 0..leading_parents {
        out.push_str("../");
    }
    for c in &components {
        out.push_str(c);
        out.push('/');
    }
    if out.len() > 1 && out.ends_with('/') && !(trailing_slash && !components.is_empty()) {
        out.pop();
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}

/// Join a relative reference onto a directory and canonicalize the result.
/// An absolute reference ignores the directory.
pub fn join_canon(dir: &str, rel: &str) -> String {
    if rel.starts_with('/') || dir.is_empty() || dir == "." {
        return canon_path(rel);
    }
    canon_path(format!("{}/{}", dir, rel))
}

/// The directory part of a canonical path, or "" for a bare file name.
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "",
    }
}
