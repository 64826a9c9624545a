//! Remote filesystem access used by the sync engine.

use belay_proto::Value;

use super::HashRoutine;
use super::plan::RemoteEntry;
use crate::error::{Error, Result};
use crate::implementation::{Emitters, snippets};
use crate::session::Session;

/// Paths hashed per `__belay_hfs` call.
const HASH_BATCH: usize = 32;

/// Filesystem operations the sync engine needs from a device.
pub trait RemoteFs {
    /// Every path strictly below `root`, with file hashes. Empty if `root`
    /// does not exist.
    fn manifest(&mut self, root: &str) -> Result<Vec<RemoteEntry>>;

    /// Creates directories in order; existing ones are left alone.
    fn mkdirs(&mut self, dirs: &[String]) -> Result<()>;

    /// Writes `data` to `path`, replacing any previous content.
    fn stage(&mut self, path: &str, data: &[u8]) -> Result<()>;

    /// Renames each `(from, to)` pair, replacing `to`.
    fn commit(&mut self, moves: &[(String, String)]) -> Result<()>;

    /// Deletes files, then directories in the given order. Missing paths are
    /// ignored.
    fn remove(&mut self, files: &[String], dirs: &[String]) -> Result<()>;
}

/// [`RemoteFs`] over a connected session.
pub(crate) struct DeviceFs<'a> {
    /// Session, locked for the whole sync.
    session: &'a mut Session,
    /// Bytes per write command.
    chunk: usize,
    /// Installed hash routine.
    routine: HashRoutine,
}

impl std::fmt::Debug for DeviceFs<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceFs")
            .field("chunk", &self.chunk)
            .field("routine", &self.routine)
            .finish_non_exhaustive()
    }
}

impl<'a> DeviceFs<'a> {
    /// Installs the sync helpers once per connection.
    pub fn new(session: &'a mut Session) -> Result<Self> {
        let routine = match session.hash_routine {
            Some(routine) => routine,
            None => bootstrap(session)?,
        };
        let chunk = session.config.transfer_chunk.max(1);
        Ok(Self {
            session,
            chunk,
            routine,
        })
    }

    /// Hash routine in use.
    pub const fn routine(&self) -> HashRoutine {
        self.routine
    }

    /// Runs a helper statement.
    fn exec(&mut self, code: &str) -> Result<()> {
        self.session.execute(code, false).map(drop)
    }
}

/// Defines directory iteration, the sync helpers and the best hash routine.
fn bootstrap(session: &mut Session) -> Result<HashRoutine> {
    let imp = session.implementation.clone().ok_or(Error::ConnectionLost)?;
    session.execute(imp.dispatch().ilistdir, false)?;
    session.execute(snippets::SYNC, false)?;
    let routine = detect_hash_routine(session, imp.emitters)?;
    tracing::debug!(?routine, "hash routine installed");
    session.hash_routine = Some(routine);
    Ok(routine)
}

/// Native module first, then the emitter build, then plain bytecode.
fn detect_hash_routine(session: &mut Session, emitters: Emitters) -> Result<HashRoutine> {
    let mut candidates = vec![(HashRoutine::NativeModule, snippets::HASH_NATIVE_MODULE)];
    if emitters.native && emitters.viper {
        candidates.push((HashRoutine::Viper, snippets::HASH_VIPER));
    }
    for (routine, code) in candidates {
        match session.execute(code, false) {
            Ok(_) => return Ok(routine),
            Err(Error::RemoteExecution { .. }) => {
                tracing::trace!(?routine, "hash routine unavailable");
            }
            Err(e) => return Err(e),
        }
    }
    session.execute(snippets::HASH_INTERPRETED, false)?;
    Ok(HashRoutine::Interpreted)
}

/// Error for a listing the helpers should never produce.
fn malformed(what: &str, value: &Value) -> Error {
    Error::InvalidArgument(format!("malformed {what} from device: {value}"))
}

impl RemoteFs for DeviceFs<'_> {
    fn manifest(&mut self, root: &str) -> Result<Vec<RemoteEntry>> {
        let listing = self
            .session
            .eval(&format!("__belay_ls({})", Value::from(root)), false)?;
        let items = listing.as_seq().ok_or_else(|| malformed("listing", &listing))?;

        let mut entries = Vec::with_capacity(items.len());
        let mut files = Vec::new();
        for item in items {
            let Some([path, is_dir]) = item.as_seq() else {
                return Err(malformed("listing entry", item));
            };
            let (Some(path), Some(is_dir)) = (path.as_str(), is_dir.as_bool()) else {
                return Err(malformed("listing entry", item));
            };
            if is_dir {
                entries.push(RemoteEntry::dir(path));
            } else {
                files.push(path.to_owned());
            }
        }

        for batch in files.chunks(HASH_BATCH) {
            let paths = Value::List(batch.iter().map(|p| Value::from(p.as_str())).collect());
            let hashes = self.session.eval(&format!("__belay_hfs({paths})"), false)?;
            let values = hashes
                .as_seq()
                .filter(|v| v.len() == batch.len())
                .ok_or_else(|| malformed("hash list", &hashes))?;
            for (path, value) in batch.iter().zip(values) {
                let hash = value
                    .as_u64()
                    .and_then(|h| u32::try_from(h).ok())
                    .ok_or_else(|| malformed("hash", value))?;
                entries.push(RemoteEntry::file(path.clone(), hash));
            }
        }
        Ok(entries)
    }

    fn mkdirs(&mut self, dirs: &[String]) -> Result<()> {
        if dirs.is_empty() {
            return Ok(());
        }
        let list = Value::List(dirs.iter().map(|d| Value::from(d.as_str())).collect());
        self.exec(&format!("__belay_mkdirs({list})"))
    }

    fn stage(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.exec(&format!("__belay_open({})", Value::from(path)))?;
        for chunk in data.chunks(self.chunk) {
            if let Err(e) = self.exec(&format!("__belay_w({})", Value::from(chunk))) {
                if !e.is_disconnect() {
                    if let Err(close) = self.exec("__belay_close()") {
                        tracing::debug!(%path, error = %close, "closing staged file failed");
                    }
                }
                return Err(e);
            }
        }
        self.exec("__belay_close()")
    }

    fn commit(&mut self, moves: &[(String, String)]) -> Result<()> {
        if moves.is_empty() {
            return Ok(());
        }
        let pairs = Value::List(
            moves
                .iter()
                .map(|(from, to)| Value::Tuple(vec![Value::from(from.as_str()), Value::from(to.as_str())]))
                .collect(),
        );
        self.exec(&format!("__belay_commit({pairs})"))
    }

    fn remove(&mut self, files: &[String], dirs: &[String]) -> Result<()> {
        if files.is_empty() && dirs.is_empty() {
            return Ok(());
        }
        let list = |paths: &[String]| Value::List(paths.iter().map(|p| Value::from(p.as_str())).collect());
        self.exec(&format!("__belay_rm({}, {})", list(files), list(dirs)))
    }
}

/// In-memory device filesystem for sync tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryFs {
    /// File contents by absolute path.
    pub files: std::collections::BTreeMap<String, Vec<u8>>,
    /// Directories.
    pub dirs: std::collections::BTreeSet<String>,
    /// Number of `stage` calls.
    pub staged: usize,
    /// `stage` fails for this path.
    pub fail_stage: Option<String>,
}

#[cfg(test)]
impl RemoteFs for MemoryFs {
    fn manifest(&mut self, root: &str) -> Result<Vec<RemoteEntry>> {
        let inside = |p: &str| p != root && (root == "/" || p.strip_prefix(root).is_some_and(|r| r.starts_with('/')));
        let mut out: Vec<RemoteEntry> = self
            .dirs
            .iter()
            .filter(|d| inside(d))
            .map(|d| RemoteEntry::dir(d.clone()))
            .collect();
        out.extend(
            self.files
                .iter()
                .filter(|(p, _)| inside(p))
                .map(|(p, d)| RemoteEntry::file(p.clone(), super::fnv1a32(d))),
        );
        Ok(out)
    }

    fn mkdirs(&mut self, dirs: &[String]) -> Result<()> {
        self.dirs.extend(dirs.iter().cloned());
        Ok(())
    }

    fn stage(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.staged += 1;
        self.files.insert(path.to_owned(), data.to_vec());
        if self.fail_stage.as_deref() == Some(path) {
            return Err(Error::remote("OSError: [Errno 28] ENOSPC"));
        }
        Ok(())
    }

    fn commit(&mut self, moves: &[(String, String)]) -> Result<()> {
        for (from, to) in moves {
            if let Some(data) = self.files.remove(from) {
                self.files.insert(to.clone(), data);
            }
        }
        Ok(())
    }

    fn remove(&mut self, files: &[String], dirs: &[String]) -> Result<()> {
        for f in files {
            self.files.remove(f);
        }
        for d in dirs {
            self.dirs.remove(d);
        }
        Ok(())
    }
}
