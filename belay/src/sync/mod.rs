//! Mirroring a host directory onto the device filesystem.
//!
//! A sync walks the local tree, asks the device for a manifest of what is
//! already below the destination, and transfers only the difference:
//!
//! 1. create missing directories, parents first
//! 2. write every changed file to `<path>.belay-tmp`
//! 3. rename all staged files into place in one command
//! 4. delete remote paths that have no local counterpart and are not kept
//!
//! A failure before step 3 leaves the previous contents untouched.

mod discover;
mod hash;
mod plan;
mod remote;

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

pub use self::discover::{DEFAULT_IGNORE, LocalFile, LocalTree, compile_ignore, discover};
pub use self::hash::fnv1a32;
pub use self::plan::{
    DEFAULT_KEEP_ROOT, EntryKind, KeepPolicy, RemoteEntry, SyncPlan, normalize_dst, plan,
};
pub use self::remote::RemoteFs;
use self::remote::DeviceFs;
use crate::device::Device;
use crate::error::Result;
use crate::minify::{Minifier, StripComments};

/// Suffix of staged uploads.
const STAGING_SUFFIX: &str = ".belay-tmp";

/// Device-side content hash implementation, picked once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum HashRoutine {
    /// Precompiled `_belay_fnv1a32` module found on the device.
    NativeModule,
    /// `@micropython.viper` build.
    Viper,
    /// Plain bytecode.
    Interpreted,
}

/// What to mirror and what to leave alone.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SyncOptions {
    /// Absolute destination directory on the device.
    pub dst: String,
    /// Glob patterns excluded from the local walk.
    pub ignore: Vec<String>,
    /// Remote paths never deleted; `None` uses [`KeepPolicy::default_for`].
    pub keep: Option<KeepPolicy>,
    /// Applied to `.py` files before hashing and upload.
    pub minifier: Option<Arc<dyn Minifier>>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dst: "/".to_owned(),
            ignore: DEFAULT_IGNORE.iter().map(|&p| p.to_owned()).collect(),
            keep: None,
            minifier: Some(Arc::new(StripComments)),
        }
    }
}

impl SyncOptions {
    /// Sets the destination directory.
    pub fn with_dst(mut self, dst: impl Into<String>) -> Self {
        self.dst = dst.into();
        self
    }

    /// Replaces the ignore patterns.
    pub fn with_ignore(mut self, patterns: Vec<String>) -> Self {
        self.ignore = patterns;
        self
    }

    /// Sets the keep policy.
    pub fn with_keep(mut self, keep: KeepPolicy) -> Self {
        self.keep = Some(keep);
        self
    }

    /// Sets the minifier; `None` uploads sources verbatim.
    pub fn with_minifier(mut self, minifier: Option<Arc<dyn Minifier>>) -> Self {
        self.minifier = minifier;
        self
    }
}

/// Progress notifications.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub enum SyncEvent<'a> {
    /// Local walk finished.
    Discovered {
        /// Files found.
        files: usize,
        /// Directories found.
        dirs: usize,
    },
    /// Delta computed.
    Planned(&'a SyncPlan),
    /// About to stage a file.
    Uploading {
        /// Final remote path.
        path: &'a str,
        /// Zero-based position.
        index: usize,
        /// Number of uploads.
        total: usize,
    },
    /// Staged files renamed into place.
    Committed(usize),
    /// Stray paths removed.
    Deleted(usize),
}

/// Outcome of a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct SyncReport {
    /// Everything that was done.
    pub plan: SyncPlan,
    /// Files whose remote hash already matched.
    pub unchanged: usize,
    /// Hash routine used on the device, for device syncs.
    pub routine: Option<HashRoutine>,
}

/// Mirrors `src` onto `fs`.
///
/// Directories are created before any file is staged. If staging fails, the
/// staged files and the directories created below the destination are
/// removed again; the destination directory itself stays.
pub fn sync_tree(
    fs: &mut dyn RemoteFs,
    src: &Path,
    opts: &SyncOptions,
    progress: &mut dyn FnMut(&SyncEvent<'_>),
) -> Result<SyncReport> {
    let dst = normalize_dst(&opts.dst)?;
    let ignore = compile_ignore(&opts.ignore)?;
    let local = discover(src, &ignore, opts.minifier.as_deref())?;
    progress(&SyncEvent::Discovered {
        files: local.files.len(),
        dirs: local.dirs.len(),
    });
    tracing::info!(src = %src.display(), %dst, files = local.files.len(), "syncing");

    // A single file must not wipe its siblings.
    let keep = if src.is_file() {
        KeepPolicy::All
    } else {
        opts.keep.clone().unwrap_or_else(|| KeepPolicy::default_for(&dst))
    };

    let remote = fs.manifest(&dst)?;
    let plan = plan(&local, &remote, &dst, &keep)?;
    progress(&SyncEvent::Planned(&plan));
    tracing::debug!(
        mkdirs = plan.mkdirs.len(),
        uploads = plan.uploads.len(),
        deletions = plan.deletions().count(),
        "sync planned"
    );

    fs.mkdirs(&plan.mkdirs)?;

    let mut moves = Vec::with_capacity(plan.uploads.len());
    for (index, path) in plan.uploads.iter().enumerate() {
        progress(&SyncEvent::Uploading {
            path,
            index,
            total: plan.uploads.len(),
        });
        let Some(file) = local.files.iter().find(|f| plan::join(&dst, &f.rel) == *path) else {
            continue;
        };
        let staged = format!("{path}{STAGING_SUFFIX}");
        moves.push((staged.clone(), path.clone()));
        if let Err(e) = fs.stage(&staged, &file.data) {
            tracing::warn!(%path, error = %e, "upload failed, discarding staged files");
            if !e.is_disconnect() {
                let staged: Vec<String> = moves.into_iter().map(|(tmp, _)| tmp).collect();
                let below = |d: &str| {
                    dst == "/" || d.strip_prefix(dst.as_str()).is_some_and(|r| r.starts_with('/'))
                };
                let created: Vec<String> =
                    plan.mkdirs.iter().rev().filter(|d| below(d)).cloned().collect();
                if let Err(cleanup) = fs.remove(&staged, &created) {
                    tracing::debug!(error = %cleanup, "staged file cleanup failed");
                }
            }
            return Err(e);
        }
    }

    fs.commit(&moves)?;
    progress(&SyncEvent::Committed(moves.len()));

    fs.remove(&plan.delete_files, &plan.delete_dirs)?;
    let deleted = plan.deletions().count();
    progress(&SyncEvent::Deleted(deleted));

    let unchanged = local.files.len() - plan.uploads.len();
    tracing::info!(uploaded = moves.len(), deleted, unchanged, "sync complete");
    Ok(SyncReport {
        plan,
        unchanged,
        routine: None,
    })
}

impl Device {
    /// Mirrors `src` (a directory or a single file) onto the device.
    pub fn sync(&self, src: &Path, opts: &SyncOptions) -> Result<SyncReport> {
        self.sync_with_progress(src, opts, |_| {})
    }

    /// Like [`Device::sync`], reporting progress to `progress`.
    ///
    /// Python sources are minified only when both the options and the
    /// device configuration allow it.
    pub fn sync_with_progress(
        &self,
        src: &Path,
        opts: &SyncOptions,
        mut progress: impl FnMut(&SyncEvent<'_>),
    ) -> Result<SyncReport> {
        let mut session = self.session()?;
        let opts = if session.config.minify {
            opts.clone()
        } else {
            opts.clone().with_minifier(None)
        };
        let mut fs = DeviceFs::new(&mut session)?;
        let routine = fs.routine();
        let mut report = sync_tree(&mut fs, src, &opts, &mut progress)?;
        report.routine = Some(routine);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::remote::MemoryFs;
    use super::*;
    use crate::config::Config;
    use crate::error::Error;
    use crate::transport::emulator::{Emulator, EmulatorHandle};

    fn project() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("main.py"), "import app  # entry\n").unwrap();
        fs::create_dir(tmp.path().join("app")).unwrap();
        fs::write(tmp.path().join("app/__init__.py"), "X = 1\n").unwrap();
        fs::write(tmp.path().join("app/data.bin"), [9_u8; 8]).unwrap();
        tmp
    }

    fn run(fs: &mut MemoryFs, src: &Path, opts: &SyncOptions) -> Result<SyncReport> {
        sync_tree(fs, src, opts, &mut |_| {})
    }

    #[test]
    fn second_sync_is_a_no_op() {
        let tmp = project();
        let mut remote = MemoryFs::default();
        remote.files.insert("/stale.py".to_owned(), b"old".to_vec());
        remote.files.insert("/boot.py".to_owned(), b"boot".to_vec());

        let first = run(&mut remote, tmp.path(), &SyncOptions::default()).unwrap();
        assert_eq!(first.plan.uploads.len(), 3);
        assert_eq!(first.plan.delete_files, vec!["/stale.py"]);
        assert_eq!(remote.files["/main.py"], b"import app\n");
        assert!(remote.files.contains_key("/boot.py"));
        assert!(remote.dirs.contains("/app"));
        assert!(!remote.files.keys().any(|k| k.ends_with(STAGING_SUFFIX)));

        let staged = remote.staged;
        let second = run(&mut remote, tmp.path(), &SyncOptions::default()).unwrap();
        assert!(second.plan.uploads.is_empty());
        assert_eq!(second.plan.deletions().count(), 0);
        assert_eq!(second.unchanged, 3);
        assert_eq!(remote.staged, staged);
    }

    #[test]
    fn failed_upload_commits_nothing() {
        let tmp = project();
        let mut remote = MemoryFs::default();
        remote.files.insert("/main.py".to_owned(), b"previous".to_vec());
        remote.fail_stage = Some("/main.py.belay-tmp".to_owned());

        let err = run(&mut remote, tmp.path(), &SyncOptions::default()).unwrap_err();
        assert!(matches!(err, Error::RemoteExecution { .. }));
        assert_eq!(remote.files["/main.py"], b"previous");
        assert!(!remote.files.contains_key("/app/__init__.py"));
        assert!(!remote.files.keys().any(|k| k.ends_with(STAGING_SUFFIX)));
        assert!(!remote.dirs.contains("/app"));
    }

    #[test]
    fn failed_upload_keeps_the_destination() {
        let tmp = project();
        let mut remote = MemoryFs::default();
        remote.fail_stage = Some("/pkg/main.py.belay-tmp".to_owned());

        let opts = SyncOptions::default().with_dst("/pkg");
        run(&mut remote, tmp.path(), &opts).unwrap_err();
        assert!(remote.dirs.contains("/pkg"));
        assert!(!remote.dirs.contains("/pkg/app"));
        assert!(remote.files.is_empty());
    }

    #[test]
    fn conflicts_write_nothing() {
        let tmp = project();
        let mut remote = MemoryFs::default();
        remote.files.insert("/app".to_owned(), b"not a dir".to_vec());
        let err = run(&mut remote, tmp.path(), &SyncOptions::default()).unwrap_err();
        assert!(matches!(err, Error::SyncConflict { .. }));
        assert_eq!(remote.staged, 0);
        assert!(remote.dirs.is_empty());
    }

    #[test]
    fn single_file_keeps_siblings() {
        let tmp = project();
        let mut remote = MemoryFs::default();
        remote.files.insert("/lib2/other.py".to_owned(), b"o".to_vec());
        remote.dirs.insert("/lib2".to_owned());
        let opts = SyncOptions::default().with_dst("/lib2").with_minifier(None);
        let report = run(&mut remote, &tmp.path().join("main.py"), &opts).unwrap();
        assert_eq!(report.plan.uploads, vec!["/lib2/main.py"]);
        assert_eq!(remote.files["/lib2/main.py"], b"import app  # entry\n");
        assert!(remote.files.contains_key("/lib2/other.py"));
    }

    #[test]
    fn reports_progress() {
        let tmp = project();
        let mut remote = MemoryFs::default();
        let mut uploads = Vec::new();
        sync_tree(&mut remote, tmp.path(), &SyncOptions::default(), &mut |e| {
            if let SyncEvent::Uploading { path, .. } = e {
                uploads.push((*path).to_owned());
            }
        })
        .unwrap();
        assert_eq!(uploads, vec!["/app/__init__.py", "/app/data.bin", "/main.py"]);
    }

    fn device() -> (Device, EmulatorHandle) {
        let (emu, handle) = Emulator::new();
        let config = Config::default()
            .with_read_timeout(Duration::from_millis(50))
            .with_sync_time(false)
            .with_minify(false);
        (Device::connect(emu, config).unwrap(), handle)
    }

    #[test]
    fn device_sync_stages_then_commits() {
        let (dev, emu) = device();
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("main.py"), "x = 1  # c\n").unwrap();
        emu.clear_log();

        let report = dev.sync(tmp.path(), &SyncOptions::default()).unwrap();
        assert_eq!(report.routine, Some(HashRoutine::NativeModule));
        assert_eq!(report.plan.uploads, vec!["/main.py"]);

        let log = emu.log();
        let open = log.iter().position(|c| c == "__belay_open('/main.py.belay-tmp')").unwrap();
        let commit = log
            .iter()
            .position(|c| c == "__belay_commit([('/main.py.belay-tmp', '/main.py')])")
            .unwrap();
        assert!(open < commit);
        assert!(log.contains(&"__belay_w(b'x = 1  # c\\n')".to_owned()));
        assert_eq!(dev.history_len(), 0);
    }
}
