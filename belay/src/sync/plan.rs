//! Pure delta computation between a local tree and a remote manifest.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::discover::LocalTree;
use crate::error::{Error, Result};

/// Paths kept on `/` unless told otherwise.
pub const DEFAULT_KEEP_ROOT: &[&str] = &["boot.py", "webrepl_cfg.py", "lib"];

/// Kind of a remote path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Dir,
}

impl EntryKind {
    /// Name used in conflict errors.
    const fn label(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Dir => "dir",
        }
    }
}

/// One path on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct RemoteEntry {
    /// Absolute path.
    pub path: String,
    /// File or directory.
    pub kind: EntryKind,
    /// FNV-1a of the contents, for files.
    pub hash: Option<u32>,
}

impl RemoteEntry {
    /// A remote file.
    pub fn file(path: impl Into<String>, hash: u32) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            hash: Some(hash),
        }
    }

    /// A remote directory.
    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Dir,
            hash: None,
        }
    }
}

/// Remote paths that survive cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum KeepPolicy {
    /// Never delete anything.
    All,
    /// Keep these paths (relative to the destination) and everything
    /// below them.
    Paths(Vec<String>),
}

impl KeepPolicy {
    /// Default for a destination: the boot files and `lib` on `/`, nothing
    /// elsewhere.
    pub fn default_for(dst: &str) -> Self {
        if dst == "/" {
            Self::Paths(DEFAULT_KEEP_ROOT.iter().map(|&s| s.to_owned()).collect())
        } else {
            Self::Paths(Vec::new())
        }
    }

    /// Whether `path` (absolute) must not be deleted.
    fn keeps(&self, dst: &str, path: &str) -> bool {
        match self {
            Self::All => true,
            Self::Paths(paths) => paths.iter().any(|k| {
                let kept = join(dst, k.trim_matches('/'));
                path == kept || is_below(path, &kept) || is_below(&kept, path)
            }),
        }
    }
}

/// What a sync will do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct SyncPlan {
    /// Directories to create, parents first.
    pub mkdirs: Vec<String>,
    /// Remote file paths to (re)write.
    pub uploads: Vec<String>,
    /// Remote files to delete.
    pub delete_files: Vec<String>,
    /// Remote directories to delete, deepest first.
    pub delete_dirs: Vec<String>,
}

impl SyncPlan {
    /// Every deletion in execution order.
    pub fn deletions(&self) -> impl Iterator<Item = &str> {
        self.delete_files
            .iter()
            .chain(&self.delete_dirs)
            .map(String::as_str)
    }
}

/// Validates and normalizes a destination root.
pub fn normalize_dst(dst: &str) -> Result<String> {
    if !dst.starts_with('/') {
        return Err(Error::InvalidArgument(format!(
            "destination `{dst}` must be an absolute path"
        )));
    }
    let trimmed = dst.trim_end_matches('/');
    Ok(if trimmed.is_empty() { "/".to_owned() } else { trimmed.to_owned() })
}

/// Joins a destination root and a relative path.
pub(crate) fn join(dst: &str, rel: &str) -> String {
    if rel.is_empty() {
        dst.to_owned()
    } else if dst == "/" {
        format!("/{rel}")
    } else {
        format!("{dst}/{rel}")
    }
}

/// `path` is strictly inside `dir`.
fn is_below(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return path.len() > 1 && path.starts_with('/');
    }
    path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

/// Number of path components.
fn depth(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty()).count()
}

/// Computes what to create, upload and delete.
///
/// Fails with [`Error::SyncConflict`] if a path is a file on one side and a
/// directory on the other; nothing has been written at that point.
pub fn plan(local: &LocalTree, remote: &[RemoteEntry], dst: &str, keep: &KeepPolicy) -> Result<SyncPlan> {
    let remote: Vec<&RemoteEntry> = remote
        .iter()
        .filter(|e| e.path != dst && is_below(&e.path, dst))
        .collect();
    let by_path: HashMap<&str, &RemoteEntry> = remote.iter().map(|e| (e.path.as_str(), *e)).collect();

    let conflict = |path: String, ours: EntryKind, theirs: EntryKind| Error::SyncConflict {
        path,
        local: ours.label(),
        remote: theirs.label(),
    };
    for file in &local.files {
        let path = join(dst, &file.rel);
        if by_path.get(path.as_str()).is_some_and(|e| e.kind == EntryKind::Dir) {
            return Err(conflict(path, EntryKind::File, EntryKind::Dir));
        }
    }
    for dir in &local.dirs {
        let path = join(dst, dir);
        if by_path.get(path.as_str()).is_some_and(|e| e.kind == EntryKind::File) {
            return Err(conflict(path, EntryKind::Dir, EntryKind::File));
        }
    }

    let mut plan = SyncPlan::default();

    if remote.is_empty() && dst != "/" && !local.is_empty() {
        let mut ancestor = String::new();
        for part in dst.split('/').filter(|s| !s.is_empty()) {
            ancestor.push('/');
            ancestor.push_str(part);
            plan.mkdirs.push(ancestor.clone());
        }
    }
    let mut dirs: Vec<String> = local.dirs.iter().map(|d| join(dst, d)).collect();
    dirs.sort_by(|a, b| depth(a).cmp(&depth(b)).then_with(|| a.cmp(b)));
    plan.mkdirs
        .extend(dirs.into_iter().filter(|d| !by_path.contains_key(d.as_str())));

    for file in &local.files {
        let path = join(dst, &file.rel);
        let unchanged = by_path
            .get(path.as_str())
            .is_some_and(|e| e.hash == Some(file.hash));
        if !unchanged {
            plan.uploads.push(path);
        }
    }

    let wanted: HashSet<String> = local
        .files
        .iter()
        .map(|f| join(dst, &f.rel))
        .chain(local.dirs.iter().map(|d| join(dst, d)))
        .collect();
    for entry in &remote {
        if wanted.contains(&entry.path) || keep.keeps(dst, &entry.path) {
            continue;
        }
        match entry.kind {
            EntryKind::File => plan.delete_files.push(entry.path.clone()),
            EntryKind::Dir => plan.delete_dirs.push(entry.path.clone()),
        }
    }
    plan.delete_files.sort();
    plan.delete_dirs
        .sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::discover::LocalFile;

    fn local(files: &[(&str, &[u8])], dirs: &[&str]) -> LocalTree {
        LocalTree {
            files: files.iter().map(|(p, d)| LocalFile::new(*p, d.to_vec())).collect(),
            dirs: dirs.iter().map(|&d| d.to_owned()).collect(),
        }
    }

    #[test]
    fn uploads_changes_and_deletes_strays() {
        let l = local(&[("a.py", b"one"), ("sub/b.py", b"two")], &["sub"]);
        let h1 = l.files[0].hash;
        let remote = vec![RemoteEntry::file("/a.py", h1), RemoteEntry::file("/c.py", 3)];
        let p = plan(&l, &remote, "/", &KeepPolicy::default_for("/")).unwrap();
        assert_eq!(p.mkdirs, vec!["/sub"]);
        assert_eq!(p.uploads, vec!["/sub/b.py"]);
        assert_eq!(p.delete_files, vec!["/c.py"]);
        assert!(p.delete_dirs.is_empty());
    }

    #[test]
    fn default_keep_protects_boot_files_and_lib() {
        let l = local(&[("main.py", b"x")], &[]);
        let remote = vec![
            RemoteEntry::file("/boot.py", 1),
            RemoteEntry::dir("/lib"),
            RemoteEntry::file("/lib/pkg.py", 2),
            RemoteEntry::file("/old.py", 3),
            RemoteEntry::dir("/stale"),
            RemoteEntry::dir("/stale/deeper"),
        ];
        let p = plan(&l, &remote, "/", &KeepPolicy::default_for("/")).unwrap();
        assert_eq!(p.delete_files, vec!["/old.py"]);
        assert_eq!(p.delete_dirs, vec!["/stale/deeper", "/stale"]);
        let all = plan(&l, &remote, "/", &KeepPolicy::All).unwrap();
        assert_eq!(all.deletions().count(), 0);
    }

    #[test]
    fn kept_paths_protect_their_parents() {
        let l = local(&[], &[]);
        let remote = vec![RemoteEntry::dir("/app/cfg"), RemoteEntry::file("/app/cfg/wifi.json", 1)];
        let keep = KeepPolicy::Paths(vec!["cfg/wifi.json".to_owned()]);
        let p = plan(&l, &remote, "/app", &keep).unwrap();
        assert_eq!(p.deletions().count(), 0);
    }

    #[test]
    fn kind_mismatch_is_a_conflict() {
        let l = local(&[("x", b"data")], &[]);
        let err = plan(&l, &[RemoteEntry::dir("/x")], "/", &KeepPolicy::All).unwrap_err();
        assert!(matches!(err, Error::SyncConflict { local: "file", remote: "dir", .. }));

        let l = local(&[], &["y"]);
        let err = plan(&l, &[RemoteEntry::file("/y", 0)], "/", &KeepPolicy::All).unwrap_err();
        assert!(matches!(err, Error::SyncConflict { local: "dir", remote: "file", .. }));
    }

    #[test]
    fn creates_missing_destination() {
        let l = local(&[("m.py", b"")], &["d"]);
        let p = plan(&l, &[], "/apps/demo", &KeepPolicy::default_for("/apps/demo")).unwrap();
        assert_eq!(p.mkdirs, vec!["/apps", "/apps/demo", "/apps/demo/d"]);
        assert_eq!(p.uploads, vec!["/apps/demo/m.py"]);
    }

    #[test]
    fn destinations_must_be_absolute() {
        assert_eq!(normalize_dst("/lib/").unwrap(), "/lib");
        assert_eq!(normalize_dst("//").unwrap(), "/");
        assert!(normalize_dst("lib").is_err());
    }
}
