//! Local tree discovery.

use std::fs;
use std::path::Path;

use glob::Pattern;

use super::hash::fnv1a32;
use crate::error::{Error, Result};
use crate::minify::Minifier;

/// Ignore patterns applied when none are given.
pub const DEFAULT_IGNORE: &[&str] = &["*.pyc", "__pycache__", ".DS_Store", ".pytest_cache"];

/// A file to be mirrored.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct LocalFile {
    /// `/`-separated path relative to the sync root.
    pub rel: String,
    /// Contents as they will be written (minified for `.py`).
    pub data: Vec<u8>,
    /// FNV-1a of `data`.
    pub hash: u32,
}

impl LocalFile {
    /// Builds a file entry, hashing `data`.
    pub fn new(rel: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            rel: rel.into(),
            hash: fnv1a32(&data),
            data,
        }
    }
}

/// Everything under the local sync root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct LocalTree {
    /// Files in walk order.
    pub files: Vec<LocalFile>,
    /// Directories, parents before children.
    pub dirs: Vec<String>,
}

impl LocalTree {
    /// Returns `true` if nothing was discovered.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }
}

/// Compiles ignore patterns.
pub fn compile_ignore<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p.as_ref()).map_err(|e| {
                Error::InvalidArgument(format!("bad ignore pattern `{}`: {e}", p.as_ref()))
            })
        })
        .collect()
}

/// A pattern matches either the entry name or its relative path.
fn is_ignored(ignore: &[Pattern], name: &str, rel: &str) -> bool {
    ignore.iter().any(|p| p.matches(name) || p.matches(rel))
}

/// Walks `root` (a directory, or a single file).
///
/// `.py` files are passed through `minifier` before hashing.
pub fn discover(root: &Path, ignore: &[Pattern], minifier: Option<&dyn Minifier>) -> Result<LocalTree> {
    let mut tree = LocalTree::default();
    if fs::metadata(root)?.is_file() {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidArgument(format!("{} has no file name", root.display())))?;
        tree.files.push(load(root, name, minifier)?);
        return Ok(tree);
    }
    walk(root, "", ignore, minifier, &mut tree)?;
    Ok(tree)
}

/// Recursive part of [`discover`].
fn walk(
    dir: &Path,
    prefix: &str,
    ignore: &[Pattern],
    minifier: Option<&dyn Minifier>,
    tree: &mut LocalTree,
) -> Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(fs::DirEntry::file_name);
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
        if is_ignored(ignore, &name, &rel) {
            tracing::trace!(path = %rel, "ignored");
            continue;
        }
        let path = entry.path();
        if fs::metadata(&path)?.is_dir() {
            tree.dirs.push(rel.clone());
            walk(&path, &rel, ignore, minifier, tree)?;
        } else {
            tree.files.push(load(&path, rel, minifier)?);
        }
    }
    Ok(())
}

/// Reads one file, minifying Python sources.
fn load(path: &Path, rel: String, minifier: Option<&dyn Minifier>) -> Result<LocalFile> {
    let data = fs::read(path)?;
    let data = match (minifier, rel.ends_with(".py")) {
        (Some(m), true) => match String::from_utf8(data) {
            Ok(text) => m.minify(&text).into_bytes(),
            Err(e) => e.into_bytes(),
        },
        _ => data,
    };
    Ok(LocalFile::new(rel, data))
}
