//! The FUSE-facing half of the crate: a [UnionFs] value that owns a
//! [PathRouter] and [NamespaceAggregator] and exposes the full operation
//! surface from SPEC_FULL.md §6.1 as plain methods over *logical paths*.
//!
//! `filesystem` then wraps those methods in an `impl FileSystem for UnionFs`
//! for `fuse-backend-rs`, translating inodes to logical paths at the
//! boundary. Keeping the path-addressed surface as ordinary methods (rather
//! than burying it inside the trait impl) means it can be exercised directly
//! in tests without a real mount, and matches the "single dispatch...on one
//! union filesystem value" redesign note instead of free-standing functions.

mod attr;
mod filesystem;
pub mod fuse;

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nix::sys::stat::{utimensat, FchmodatFlags, Mode, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{AccessFlags, Gid, Uid};
use parking_lot::{Mutex, RwLock};
use tracing::instrument;

use crate::aggregator::NamespaceAggregator;
use crate::error::{Error, Result};
use crate::inode::InodeTable;
use crate::router::PathRouter;
use crate::source::{AggregateStatvfs, Source};

/// The union filesystem core: path routing plus namespace aggregation,
/// wrapped with the bookkeeping a FUSE mount needs (inode table, open file
/// handles) but none of which the union *model* itself requires.
pub struct UnionFs {
    router: PathRouter,
    aggregator: NamespaceAggregator,
    mountpoint: PathBuf,

    inodes: RwLock<InodeTable>,
    handles: RwLock<HashMap<u64, Mutex<File>>>,
    next_handle: AtomicU64,
}

/// A timestamp update for [UnionFs::utimens]: `None` leaves that time
/// unchanged, matching the optional-times convention of `utimensat(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Times {
    pub atime: Option<std::time::SystemTime>,
    pub mtime: Option<std::time::SystemTime>,
}

impl UnionFs {
    /// Builds a union over `sources`, rooted for sanitization purposes at
    /// `mountpoint`. Runs the startup duplicate check; a [Error::DuplicatePath]
    /// or [Error::SourceUnreadable] here is fatal and must abort startup.
    pub fn new(sources: Vec<Source>, mountpoint: PathBuf) -> Result<Self> {
        let sources: Arc<[Source]> = sources.into();
        let aggregator = NamespaceAggregator::new(sources.clone());
        aggregator.check_for_duplicates()?;

        Ok(Self {
            router: PathRouter::new(sources),
            aggregator,
            mountpoint,
            inodes: RwLock::new(InodeTable::new()),
            handles: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn router(&self) -> &PathRouter {
        &self.router
    }

    pub fn aggregator(&self) -> &NamespaceAggregator {
        &self.aggregator
    }

    // ---- metadata ----

    pub fn access(&self, path: &Path, mode: i32) -> Result<()> {
        let concrete = self.router.resolve(path);
        nix::unistd::access(&concrete, AccessFlags::from_bits_truncate(mode))?;
        Ok(())
    }

    pub fn getattr(&self, path: &Path) -> Result<std::fs::Metadata> {
        let concrete = self.router.resolve(path);
        Ok(std::fs::symlink_metadata(concrete)?)
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        let concrete = self.router.resolve(path);
        nix::sys::stat::fchmodat(
            None,
            &concrete,
            Mode::from_bits_truncate(mode),
            FchmodatFlags::FollowSymlink,
        )?;
        Ok(())
    }

    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let concrete = self.router.resolve(path);
        nix::unistd::chown(&concrete, uid.map(Uid::from_raw), gid.map(Gid::from_raw))?;
        Ok(())
    }

    pub fn utimens(&self, path: &Path, times: Times) -> Result<()> {
        let concrete = self.router.resolve(path);
        let to_spec = |t: std::time::SystemTime| -> TimeSpec {
            let dur = t.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
            TimeSpec::new(dur.as_secs() as i64, dur.subsec_nanos() as i64)
        };
        // `utimensat` always sets both times together, so a `None` field
        // reuses the current on-disk value instead of resetting to the epoch
        // (there is no `UTIME_OMIT` in nix's safe wrapper).
        let current = std::fs::symlink_metadata(&concrete)?;
        let atime = times
            .atime
            .map(to_spec)
            .unwrap_or_else(|| TimeSpec::new(current.atime(), current.atime_nsec()));
        let mtime = times
            .mtime
            .map(to_spec)
            .unwrap_or_else(|| TimeSpec::new(current.mtime(), current.mtime_nsec()));
        utimensat(None, &concrete, &atime, &mtime, UtimensatFlags::FollowSymlink)?;
        Ok(())
    }

    pub fn truncate(&self, path: &Path, length: u64) -> Result<()> {
        let concrete = self.router.resolve(path);
        let file = std::fs::OpenOptions::new().write(true).open(concrete)?;
        file.set_len(length)?;
        Ok(())
    }

    // ---- namespace ----

    /// Lists `path`. The root is handled by the caller via
    /// [NamespaceAggregator::list_root] instead; this is only for
    /// non-root directories.
    pub fn readdir(&self, path: &Path) -> Result<Vec<OsString>> {
        let concrete = self.router.resolve(path);
        let mut out = Vec::new();
        for entry in std::fs::read_dir(concrete)? {
            out.push(entry?.file_name());
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    pub fn readlink(&self, path: &Path) -> Result<PathBuf> {
        let concrete = self.router.resolve(path);
        let target = std::fs::read_link(concrete)?;
        Ok(sanitize_readlink_target(&target, &self.mountpoint))
    }

    pub fn mknod(&self, path: &Path, mode: u32, dev: u64) -> Result<()> {
        let concrete = self.router.resolve(path);
        nix::sys::stat::mknod(
            &concrete,
            nix::sys::stat::SFlag::from_bits_truncate(mode),
            Mode::from_bits_truncate(mode),
            dev,
        )?;
        Ok(())
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        let concrete = self.router.resolve(path);
        nix::unistd::mkdir(&concrete, Mode::from_bits_truncate(mode))?;
        Ok(())
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        let concrete = self.router.resolve(path);
        std::fs::remove_dir(&concrete)?;
        self.inodes.write().forget_path(path);
        Ok(())
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        let concrete = self.router.resolve(path);
        std::fs::remove_file(&concrete)?;
        self.inodes.write().forget_path(path);
        Ok(())
    }

    /// Creates a symlink named `link_name` whose content is `target`.
    ///
    /// Argument order matches `symlink(2)`/`std::os::unix::fs::symlink`
    /// directly (target, then the new link's own name) rather than the
    /// inverted order the distilled source used — see DESIGN.md.
    pub fn symlink(&self, target: &Path, link_name: &Path) -> Result<()> {
        let concrete = self.router.resolve(link_name);
        std::os::unix::fs::symlink(target, concrete)?;
        Ok(())
    }

    pub fn link(&self, existing: &Path, new_name: &Path) -> Result<()> {
        let existing_concrete = self.router.resolve(existing);
        let new_concrete = self.router.resolve(new_name);
        std::fs::hard_link(existing_concrete, new_concrete)?;
        Ok(())
    }

    /// Renames `old` to `new`. Per the Non-goals, a rename that would cross
    /// sources is not guaranteed to succeed: both logical paths are routed
    /// independently and the host `rename(2)` is called directly, which
    /// fails with `EXDEV` if they land on different sources/devices.
    pub fn rename(&self, old: &Path, new: &Path) -> Result<()> {
        let old_concrete = self.router.resolve(old);
        let new_concrete = self.router.resolve(new);
        std::fs::rename(old_concrete, new_concrete)?;
        self.inodes.write().rename(old, new);
        Ok(())
    }

    // ---- I/O ----

    pub fn open(&self, path: &Path, write: bool) -> Result<u64> {
        let concrete = self.router.resolve(path);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(write)
            .open(concrete)?;
        Ok(self.insert_handle(file))
    }

    pub fn create(&self, path: &Path, mode: u32) -> Result<u64> {
        let concrete = self.router.resolve(path);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(concrete)?;
        Ok(self.insert_handle(file))
    }

    pub fn read(&self, fh: u64, buf: &mut [u8], offset: u64) -> Result<usize> {
        use std::io::{Read, Seek, SeekFrom};
        let handles = self.handles.read();
        let file = handles.get(&fh).ok_or(Error::Host(nix::errno::Errno::EBADF))?;
        let mut file = file.lock();
        file.seek(SeekFrom::Start(offset))?;
        Ok(file.read(buf)?)
    }

    pub fn write(&self, fh: u64, buf: &[u8], offset: u64) -> Result<usize> {
        use std::io::{Seek, SeekFrom, Write};
        let handles = self.handles.read();
        let file = handles.get(&fh).ok_or(Error::Host(nix::errno::Errno::EBADF))?;
        let mut file = file.lock();
        file.seek(SeekFrom::Start(offset))?;
        Ok(file.write(buf)?)
    }

    pub fn flush(&self, fh: u64) -> Result<()> {
        use std::io::Write;
        let handles = self.handles.read();
        let file = handles.get(&fh).ok_or(Error::Host(nix::errno::Errno::EBADF))?;
        file.lock().flush()?;
        Ok(())
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> Result<()> {
        let handles = self.handles.read();
        let file = handles.get(&fh).ok_or(Error::Host(nix::errno::Errno::EBADF))?;
        let file = file.lock();
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn release(&self, fh: u64) -> Result<()> {
        self.handles.write().remove(&fh);
        Ok(())
    }

    fn insert_handle(&self, file: File) -> u64 {
        let fh = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles.write().insert(fh, Mutex::new(file));
        fh
    }

    // ---- filesystem-wide ----

    /// Root statfs goes through the aggregator; any other path is answered
    /// directly from its resolved source.
    pub fn statfs(&self, path: &Path) -> Result<AggregateStatvfs> {
        if path == Path::new("/") {
            return self.aggregator.statfs();
        }
        let concrete = self.router.resolve(path);
        let stv = nix::sys::statvfs::statvfs(&concrete)?;
        Ok(AggregateStatvfs {
            blocks: stv.blocks() as u64,
            blocks_free: stv.blocks_free() as u64,
            blocks_available: stv.blocks_available() as u64,
            files: stv.files() as u64,
            files_free: stv.files_free() as u64,
            files_available: stv.files_available() as u64,
            block_size: stv.block_size() as u64,
            fragment_size: stv.fragment_size() as u64,
            name_max: stv.name_max() as u64,
        })
    }

    // ---- inode bookkeeping, used by the `filesystem` FUSE binding ----

    pub(crate) fn ino_for(&self, path: &Path) -> u64 {
        self.inodes.write().ino_for(path)
    }

    pub(crate) fn path_for_ino(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.read().path_for(ino).map(Path::to_path_buf)
    }

    pub(crate) fn child_logical_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        let parent_path = self.path_for_ino(parent)?;
        Some(join_logical(&parent_path, name))
    }
}

use std::os::unix::fs::OpenOptionsExt;

fn join_logical(parent: &Path, name: &OsStr) -> PathBuf {
    if parent == Path::new("/") {
        Path::new("/").join(name)
    } else {
        parent.join(name)
    }
}

/// If `target` is absolute, rewrites it relative to `mountpoint` so the
/// caller (who sees only the union, not the concrete source layout) gets a
/// sensible relative target; relative targets pass through unchanged.
fn sanitize_readlink_target(target: &Path, mountpoint: &Path) -> PathBuf {
    if !target.is_absolute() {
        return target.to_path_buf();
    }
    pathdiff(target, mountpoint).unwrap_or_else(|| target.to_path_buf())
}

/// Minimal `path.relative_to`-style diff: there is no `std` equivalent, and
/// pulling in a whole crate for one call site isn't worth it here.
fn pathdiff(target: &Path, base: &Path) -> Option<PathBuf> {
    let target_components: Vec<_> = target.components().collect();
    let base_components: Vec<_> = base.components().collect();

    let common = target_components
        .iter()
        .zip(base_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in common..base_components.len() {
        result.push("..");
    }
    for component in &target_components[common..] {
        result.push(component.as_os_str());
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fs_over(dirs: &[&TempDir], mountpoint: &Path) -> UnionFs {
        let sources = dirs.iter().map(|d| Source::new(d.path())).collect();
        UnionFs::new(sources, mountpoint.to_path_buf()).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let d0 = TempDir::new().unwrap();
        let mnt = TempDir::new().unwrap();
        let ufs = fs_over(&[&d0], mnt.path());

        let fh = ufs.create(Path::new("/f"), 0o644).unwrap();
        let written = ufs.write(fh, b"hello", 0).unwrap();
        assert_eq!(written, 5);
        ufs.release(fh).unwrap();

        let fh = ufs.open(Path::new("/f"), false).unwrap();
        let mut buf = [0u8; 5];
        let read = ufs.read(fh, &mut buf, 0).unwrap();
        assert_eq!(read, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn readlink_sanitizes_absolute_target() {
        let d0 = TempDir::new().unwrap();
        let mnt = TempDir::new().unwrap();
        std::os::unix::fs::symlink(mnt.path().join("inside"), d0.path().join("link")).unwrap();

        let ufs = fs_over(&[&d0], mnt.path());
        let target = ufs.readlink(Path::new("/link")).unwrap();
        assert_eq!(target, Path::new("inside"));
    }

    #[test]
    fn readlink_passes_through_relative_target() {
        let d0 = TempDir::new().unwrap();
        let mnt = TempDir::new().unwrap();
        std::os::unix::fs::symlink("relative/target", d0.path().join("link")).unwrap();

        let ufs = fs_over(&[&d0], mnt.path());
        let target = ufs.readlink(Path::new("/link")).unwrap();
        assert_eq!(target, Path::new("relative/target"));
    }

    #[test]
    fn duplicate_top_level_name_rejected_at_construction() {
        let d0 = TempDir::new().unwrap();
        let d1 = TempDir::new().unwrap();
        std::fs::write(d0.path().join("x"), b"a").unwrap();
        std::fs::write(d1.path().join("x"), b"b").unwrap();
        let mnt = TempDir::new().unwrap();

        let sources = vec![Source::new(d0.path()), Source::new(d1.path())];
        let err = UnionFs::new(sources, mnt.path().to_path_buf()).unwrap_err();
        assert!(matches!(err, Error::DuplicatePath { .. }));
    }
}
